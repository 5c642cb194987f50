use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{warn, LevelFilter};

use mcuimg::digest::HashAlg;
use mcuimg::dump::{print_image_info, read_image_file};
use mcuimg::encrypt::AesKeyLen;
use mcuimg::image::{
    CompressionInfo, CompressionKind, Dependency, Encryption, FixedSignature, SecurityCounter,
    VectorToSign,
};
use mcuimg::keys::{self, EncryptionKey};
use mcuimg::layout::ImageLayout;
use mcuimg::verify::verify_file;
use mcuimg::*;

/// Create, sign, encrypt, verify and edit firmware images for MCU secure
/// bootloaders.
#[derive(Parser, Debug)]
#[command(name = "mcuimg", version, about = "Build and inspect signed MCU firmware images")]
struct Cli {
    /// More output (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only report errors
    #[arg(short = 'q', long = "quiet", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a signed (and optionally encrypted) image from a flat binary
    Sign(SignArgs),
    /// Check an image's digest and signatures
    Verify {
        /// Public or private key to verify with (repeatable)
        #[arg(short = 'k', long = "key")]
        keys: Vec<PathBuf>,

        image: PathBuf,
    },
    /// Add a signature to a finished, padded image
    SignAppend {
        #[arg(short = 'k', long = "key")]
        key: PathBuf,

        /// Key id recorded in a KEYID TLV before the signature
        #[arg(long = "key-id", value_parser = parse_u32)]
        key_id: Option<u32>,

        /// hash or full
        #[arg(long = "public-key-format", default_value = "hash")]
        public_key_format: PublicKeyFormat,

        image: PathBuf,

        /// Output file (defaults to editing in place)
        outfile: Option<PathBuf>,
    },
    /// Remove the signature carrying a key id
    SignRemove {
        #[arg(long = "key-id", value_parser = parse_u32)]
        key_id: u32,

        image: PathBuf,

        /// Output file (defaults to editing in place)
        outfile: Option<PathBuf>,
    },
    /// Print the public key bytes of a key as hex
    Getpub {
        #[arg(short = 'k', long = "key")]
        key: PathBuf,

        /// Print the key hash under this digest instead (256, 384, 512)
        #[arg(long = "hash")]
        hash: Option<UserSha>,
    },
    /// List the header, TLVs and trailer of an image
    Dumpinfo { image: PathBuf },
}

#[derive(clap::Args, Debug)]
struct SignArgs {
    /// Signing key (repeatable for multiple signatures)
    #[arg(short = 'k', long = "key")]
    keys: Vec<PathBuf>,

    /// Key id for each signing key, in order (repeatable)
    #[arg(long = "key-id", value_parser = parse_u32)]
    key_ids: Vec<u32>,

    /// How the signing key is identified: hash or full
    #[arg(long = "public-key-format", default_value = "hash")]
    public_key_format: PublicKeyFormat,

    /// Image version, maj.min.rev+build
    #[arg(long = "image-version", default_value = "0.0.0")]
    version: ImageVersion,

    /// Header size (the header area in front of the payload)
    #[arg(short = 'H', long = "header-size", value_parser = parse_usize, default_value = "32")]
    header_size: usize,

    /// Prepend the header area instead of expecting zeros in the input
    #[arg(long = "pad-header")]
    pad_header: bool,

    /// Flash slot size
    #[arg(short = 'S', long = "slot-size", value_parser = parse_usize, default_value = "0")]
    slot_size: usize,

    /// Pad the image to the slot size and add the trailer
    #[arg(long = "pad")]
    pad: bool,

    /// Mark the image as confirmed (implies --pad)
    #[arg(long = "confirm")]
    confirm: bool,

    /// Flash write alignment
    #[arg(long = "align", value_parser = parse_u32, default_value = "1")]
    align: u32,

    /// Maximum flash write alignment (8, 16 or 32)
    #[arg(long = "max-align", value_parser = parse_u32, default_value = "8")]
    max_align: u32,

    /// Sectors tracked by the swap status area
    #[arg(short = 'M', long = "max-sectors", value_parser = parse_u32, default_value = "128")]
    max_sectors: u32,

    /// Size the trailer for overwrite-only upgrades
    #[arg(long = "overwrite-only")]
    overwrite_only: bool,

    /// Byte order: little or big
    #[arg(short = 'e', long = "endian", default_value = "little")]
    endian: Endian,

    /// RAM load address
    #[arg(short = 'x', long = "load-addr", value_parser = parse_u32)]
    load_addr: Option<u32>,

    /// Fixed ROM address of the image
    #[arg(long = "rom-fixed", value_parser = parse_u32)]
    rom_fixed: Option<u32>,

    /// Erased flash value, 0 or 0xff
    #[arg(short = 'R', long = "erased-val", value_parser = parse_u8, default_value = "0xff")]
    erased_val: u8,

    /// Keep the whole wrapped key in the trailer
    #[arg(long = "save-enctlv")]
    save_enctlv: bool,

    /// Security counter: a number or "auto" to derive it from the version
    #[arg(short = 's', long = "security-counter")]
    security_counter: Option<SecurityCounter>,

    /// Mark the image as not bootable on its own
    #[arg(long = "non-bootable")]
    non_bootable: bool,

    /// Dependency on another image as ID,VERSION (repeatable)
    #[arg(short = 'd', long = "dependency", value_parser = parse_dependency)]
    dependencies: Vec<Dependency>,

    /// Add a measured boot record with this software type
    #[arg(long = "boot-record")]
    boot_record: Option<String>,

    /// Vendor TLV as TAG VALUE; VALUE is 0x-prefixed hex or text (repeatable)
    #[arg(long = "custom-tlv", num_args = 2, value_names = ["TAG", "VALUE"])]
    custom_tlvs: Vec<String>,

    /// Image digest: auto, 256, 384 or 512
    #[arg(long = "sha", default_value = "auto")]
    sha: UserSha,

    /// Sign the hashed region directly instead of its digest (Ed25519)
    #[arg(long = "pure")]
    pure: bool,

    /// Pad ECDSA signatures to a fixed length (bootloaders before 1.5)
    #[arg(long = "pad-sig")]
    pad_sig: bool,

    /// Encrypt with this public key (or raw AES-KW key file)
    #[arg(short = 'E', long = "encrypt")]
    encrypt: Option<PathBuf>,

    /// Content key length: 128 or 256
    #[arg(long = "encrypt-keylen", value_parser = parse_u32, default_value = "128")]
    encrypt_keylen: u32,

    /// Add the encryption TLV and flag but leave the body in plaintext
    #[arg(long = "clear")]
    clear: bool,

    /// Compression applied to the payload: lzma2 or lzma2armthumb
    #[arg(long = "compression", requires = "decompressed_image")]
    compression: Option<String>,

    /// Signed image of the uncompressed payload, for the DECOMP_* TLVs
    #[arg(long = "decompressed-image", requires = "compression")]
    decompressed_image: Option<PathBuf>,

    /// Use this signature instead of signing (requires --fix-sig-pubkey)
    #[arg(long = "fix-sig", requires = "fix_sig_pubkey")]
    fix_sig: Option<PathBuf>,

    /// Public key matching --fix-sig
    #[arg(long = "fix-sig-pubkey", requires = "fix_sig")]
    fix_sig_pubkey: Option<PathBuf>,

    /// Write the vector to sign instead of an image: payload or digest
    #[arg(long = "vector-to-sign")]
    vector_to_sign: Option<String>,

    /// Write the produced signatures, one hex line each
    #[arg(long = "sig-out")]
    sig_out: Option<PathBuf>,

    infile: PathBuf,

    outfile: PathBuf,
}

// ---------------------------------------------------------------------------
// Argument parsing
// ---------------------------------------------------------------------------

fn parse_number(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|_| format!("invalid number '{s}'"))
}

fn parse_u32(s: &str) -> std::result::Result<u32, String> {
    u32::try_from(parse_number(s)?).map_err(|_| format!("'{s}' does not fit in 32 bits"))
}

fn parse_u8(s: &str) -> std::result::Result<u8, String> {
    u8::try_from(parse_number(s)?).map_err(|_| format!("'{s}' does not fit in 8 bits"))
}

fn parse_usize(s: &str) -> std::result::Result<usize, String> {
    usize::try_from(parse_number(s)?).map_err(|_| format!("'{s}' is too large"))
}

/// `ID,VERSION`, optionally in parentheses.
fn parse_dependency(s: &str) -> std::result::Result<Dependency, String> {
    let inner = s.trim().trim_start_matches('(').trim_end_matches(')');
    let (id, version) = inner
        .split_once(',')
        .ok_or_else(|| format!("dependency '{s}' is not ID,VERSION"))?;
    Ok(Dependency {
        image_id: parse_u8(id.trim())?,
        version: version.trim().parse().map_err(|e: ImageError| e.to_string())?,
    })
}

/// A custom TLV value: `0x`-prefixed hex, or the text itself.
fn parse_tlv_value(s: &str) -> Result<Vec<u8>> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => {
            hex::decode(h).map_err(|e| ImageError::Usage(format!("invalid hex value '{s}': {e}")))
        }
        None => Ok(s.as_bytes().to_vec()),
    }
}

fn custom_tlvs(raw: &[String]) -> Result<Vec<(u16, Vec<u8>)>> {
    raw.chunks(2)
        .map(|pair| {
            let tag = parse_number(&pair[0])
                .ok()
                .and_then(|t| u16::try_from(t).ok())
                .ok_or_else(|| ImageError::Usage(format!("invalid TLV tag '{}'", pair[0])))?;
            let value = pair
                .get(1)
                .ok_or_else(|| ImageError::Usage(format!("custom TLV 0x{tag:04x} has no value")))?;
            Ok((tag, parse_tlv_value(value)?))
        })
        .collect()
}

/// Pull the DECOMP_* values out of a signed image of the uncompressed
/// payload.
fn compression_info(kind: &str, path: &Path) -> Result<CompressionInfo> {
    let kind = match kind {
        "lzma2" => CompressionKind::Lzma2,
        "lzma2armthumb" => CompressionKind::Lzma2ArmThumb,
        other => {
            return Err(ImageError::UnknownName {
                kind: "compression",
                name: other.to_string(),
            })
        }
    };
    let buf = fs::read(path)?;
    let layout = ImageLayout::scan(&buf)?;
    let mut digest = None;
    let mut signature = None;
    for rec in layout.unprotected.records(&buf, layout.endian) {
        let rec = rec?;
        match rec.tag.known() {
            Some(t) if t.is_digest() && digest.is_none() => digest = Some(rec.value.to_vec()),
            Some(t) if t.is_signature() && signature.is_none() => {
                signature = Some(rec.value.to_vec())
            }
            _ => {}
        }
    }
    Ok(CompressionInfo {
        kind,
        decompressed_size: layout.header.img_size,
        decompressed_digest: digest.ok_or(ImageError::MissingDigest)?,
        decompressed_signature: signature,
    })
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn sign(args: &SignArgs) -> Result<()> {
    let mut builder = ImageConfig::builder()
        .version(args.version)
        .header_size(args.header_size)
        .pad_header(args.pad_header)
        .pad(args.pad)
        .confirm(args.confirm)
        .slot_size(args.slot_size)
        .align(args.align)
        .max_align(args.max_align)
        .max_sectors(args.max_sectors)
        .overwrite_only(args.overwrite_only)
        .endian(args.endian)
        .erased_val(args.erased_val)
        .save_enctlv(args.save_enctlv)
        .non_bootable(args.non_bootable);
    if let Some(addr) = args.load_addr {
        builder = builder.load_addr(addr);
    }
    if let Some(addr) = args.rom_fixed {
        builder = builder.rom_fixed(addr);
    }
    if let Some(sc) = args.security_counter {
        builder = builder.security_counter(sc);
    }
    let config = builder.build();

    let signing_keys = args
        .keys
        .iter()
        .map(keys::load_signing_key)
        .collect::<Result<Vec<_>>>()?;
    let encryption_key: Option<EncryptionKey> =
        args.encrypt.as_ref().map(keys::load_encryption_key).transpose()?;
    let fixed_pubkey = args
        .fix_sig_pubkey
        .as_ref()
        .map(keys::load_verifying_key)
        .transpose()?;
    let fixed_signature = match (&args.fix_sig, &fixed_pubkey) {
        (Some(path), Some(public_key)) => Some(FixedSignature {
            signature: read_signature(path)?,
            public_key: public_key.as_ref(),
        }),
        _ => None,
    };
    let vector_to_sign = match args.vector_to_sign.as_deref() {
        None => None,
        Some("payload") => Some(VectorToSign::Payload),
        Some("digest") => Some(VectorToSign::Digest),
        Some(other) => {
            return Err(ImageError::UnknownName {
                kind: "vector to sign",
                name: other.to_string(),
            })
        }
    };

    let opts = CreateOptions {
        keys: signing_keys.iter().map(|k| k.as_ref()).collect(),
        key_ids: args.key_ids.clone(),
        public_key_format: args.public_key_format,
        encryption: match &encryption_key {
            Some(key) => Some(Encryption {
                key,
                key_len: AesKeyLen::from_bits(args.encrypt_keylen)?,
                clear: args.clear,
            }),
            None => None,
        },
        dependencies: args.dependencies.clone(),
        sw_type: args.boot_record.clone(),
        custom_tlvs: custom_tlvs(&args.custom_tlvs)?,
        compression: match (&args.compression, &args.decompressed_image) {
            (Some(kind), Some(path)) => Some(compression_info(kind, path)?),
            _ => None,
        },
        fixed_signature,
        user_sha: args.sha,
        pure: args.pure,
        pad_sig: args.pad_sig,
        vector_to_sign,
    };

    let mut image = Image::new(config)?;
    image.load(&args.infile)?;
    image.create(&opts)?;
    image.save(&args.outfile)?;

    if let Some(path) = &args.sig_out {
        let lines: Vec<String> = image.signatures().iter().map(hex::encode).collect();
        fs::write(path, lines.join("\n") + "\n")?;
    }
    Ok(())
}

/// A signature file holds raw bytes or a single hex line.
fn read_signature(path: &Path) -> Result<Vec<u8>> {
    let raw = fs::read(path)?;
    match std::str::from_utf8(&raw) {
        Ok(text) if !text.trim().is_empty() && text.trim().bytes().all(|b| b.is_ascii_hexdigit()) => {
            hex::decode(text.trim())
                .map_err(|e| ImageError::Usage(format!("bad signature file: {e}")))
        }
        _ => Ok(raw),
    }
}

fn verify(key_paths: &[PathBuf], image: &Path) -> Result<bool> {
    let loaded = key_paths
        .iter()
        .map(keys::load_verifying_key)
        .collect::<Result<Vec<_>>>()?;
    let keys: Vec<&dyn VerifyingKey> = loaded.iter().map(|k| k.as_ref()).collect();
    let v = verify_file(image, &keys)?;
    match v.result {
        VerifyResult::Ok => {
            println!("Image was correctly validated");
            println!("Image version: {}", v.version);
            if let Some(d) = &v.digest {
                println!("Image digest: {}", hex::encode(d));
            }
            Ok(true)
        }
        VerifyResult::InvalidHash => {
            eprintln!("Image in {} has an invalid hash", image.display());
            Ok(false)
        }
        VerifyResult::InvalidSignature => {
            eprintln!("No signature found for the given key(s)");
            Ok(false)
        }
    }
}

fn edit(image: &Path, outfile: Option<&Path>, f: impl FnOnce(&mut Vec<u8>) -> Result<()>) -> Result<()> {
    let mut buf = fs::read(image)?;
    if buf.is_empty() {
        return Err(ImageError::EmptyInput(image.display().to_string()));
    }
    f(&mut buf)?;
    fs::write(outfile.unwrap_or(image), &buf)?;
    Ok(())
}

fn getpub(key: &Path, hash: Option<UserSha>) -> Result<()> {
    let key = keys::load_verifying_key(key)?;
    let public = key.public_bytes()?;
    let out = match hash {
        None => public,
        Some(UserSha::Auto) => HashAlg::Sha256.digest(&public),
        Some(UserSha::Explicit(alg)) => alg.digest(&public),
    };
    println!("{}", hex::encode(out));
    Ok(())
}

fn run(cli: &Cli) -> Result<bool> {
    match &cli.command {
        Command::Sign(args) => sign(args).map(|()| true),
        Command::Verify { keys, image } => {
            if keys.is_empty() {
                warn!("no keys given, checking the digest only");
            }
            verify(keys, image)
        }
        Command::SignAppend {
            key,
            key_id,
            public_key_format,
            image,
            outfile,
        } => {
            let key = keys::load_signing_key(key)?;
            edit(image, outfile.as_deref(), |buf| {
                sign_append(buf, key.as_ref(), *key_id, *public_key_format)
            })
            .map(|()| true)
        }
        Command::SignRemove {
            key_id,
            image,
            outfile,
        } => edit(image, outfile.as_deref(), |buf| sign_remove(buf, *key_id)).map(|()| true),
        Command::Getpub { key, hash } => getpub(key, *hash).map(|()| true),
        Command::Dumpinfo { image } => {
            let info = read_image_file(image)?;
            print_image_info(&info);
            Ok(true)
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => LevelFilter::Error,
        (false, 0) => LevelFilter::Info,
        (false, 1) => LevelFilter::Debug,
        (false, _) => LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(level.as_str()));
    builder.format_timestamp(None).format_target(false);
    let _ = builder.try_init();
}

fn exit_code(class: ErrorClass) -> i32 {
    match class {
        ErrorClass::Io => 1,
        ErrorClass::Usage => 2,
        ErrorClass::Format => 3,
        ErrorClass::Crypto => 4,
        ErrorClass::Sizing => 5,
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match run(&cli) {
        Ok(true) => {}
        Ok(false) => process::exit(exit_code(ErrorClass::Crypto)),
        Err(e) => {
            eprintln!("mcuimg: {}", e);
            process::exit(exit_code(e.class()));
        }
    }
}
