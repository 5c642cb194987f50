//! Building signed images.
//!
//! [`Image`] owns the payload buffer through the whole flow: `load` brings
//! in the firmware (with its header area), `create` writes the header and
//! appends the TLV regions, and `save` pads the result to the slot and
//! writes it out.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use log::{debug, info};

use crate::boot_record::BootRecord;
use crate::digest::{allowed_hashes, select_hash, HashAlg, UserSha};
use crate::encrypt::{AesKeyLen, Encryptor};
use crate::header::{
    ImageHeader, ImageVersion, IMAGE_F_COMPRESSED_ARM_THUMB_FLT, IMAGE_F_COMPRESSED_LZMA2,
    IMAGE_F_NON_BOOTABLE, IMAGE_F_RAM_LOAD, IMAGE_F_ROM_FIXED,
};
use crate::keys::{
    pad_signature, sign_image, EncryptionKey, KeyFamily, SigningKey, VerifyingKey,
};
use crate::tlv::{TlvBuilder, TlvTag, TlvType};
use crate::trailer::{check_align, check_max_align, TrailerLayout};
use crate::{
    Endian, ImageError, Result, DEFAULT_ERASED_VAL, DEFAULT_MAX_ALIGN, DEFAULT_MAX_SECTORS,
    IMAGE_HEADER_SIZE, IMAGE_MAGIC, TLV_INFO_MAGIC, TLV_INFO_SIZE, TLV_PROT_INFO_MAGIC,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Source of the SEC_CNT value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityCounter {
    /// Derive from the image version.
    Auto,
    Value(u32),
}

impl FromStr for SecurityCounter {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(SecurityCounter::Auto);
        }
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => s.parse::<u32>(),
        };
        parsed
            .map(SecurityCounter::Value)
            .map_err(|_| ImageError::Usage(format!("invalid security counter '{s}'")))
    }
}

/// Everything about the target slot and image that stays fixed for one
/// invocation.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub version: ImageVersion,
    /// Size of the header area in front of the payload.
    pub header_size: usize,
    /// Prepend `header_size` zero bytes on load instead of expecting them.
    pub pad_header: bool,
    /// Pad the saved image to `slot_size` and write the trailer.
    pub pad: bool,
    /// Mark the padded image as confirmed (`image_ok`).
    pub confirm: bool,
    pub slot_size: usize,
    pub align: u32,
    pub max_align: u32,
    pub max_sectors: u32,
    pub overwrite_only: bool,
    pub endian: Endian,
    pub load_addr: u32,
    pub rom_fixed: Option<u32>,
    pub erased_val: u8,
    pub save_enctlv: bool,
    pub security_counter: Option<SecurityCounter>,
    pub non_bootable: bool,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            version: ImageVersion::default(),
            header_size: IMAGE_HEADER_SIZE,
            pad_header: false,
            pad: false,
            confirm: false,
            slot_size: 0,
            align: 1,
            max_align: DEFAULT_MAX_ALIGN,
            max_sectors: DEFAULT_MAX_SECTORS,
            overwrite_only: false,
            endian: Endian::Little,
            load_addr: 0,
            rom_fixed: None,
            erased_val: DEFAULT_ERASED_VAL,
            save_enctlv: false,
            security_counter: None,
            non_bootable: false,
        }
    }
}

impl ImageConfig {
    pub fn builder() -> ImageConfigBuilder {
        ImageConfigBuilder::default()
    }

    fn validate(&self) -> Result<()> {
        if self.header_size < IMAGE_HEADER_SIZE {
            return Err(ImageError::HeaderTooSmall(self.header_size));
        }
        if self.header_size > usize::from(u16::MAX) {
            return Err(ImageError::Usage(format!(
                "header size 0x{:x} does not fit the header field",
                self.header_size
            )));
        }
        check_align(self.align)?;
        check_max_align(self.max_align)?;
        if self.erased_val != 0x00 && self.erased_val != 0xff {
            return Err(ImageError::InvalidErasedValue(self.erased_val));
        }
        if self.rom_fixed.is_some() && self.load_addr != 0 {
            return Err(ImageError::Usage(
                "a ROM-fixed address and a load address are mutually exclusive".into(),
            ));
        }
        if self.pad && self.slot_size == 0 {
            return Err(ImageError::Usage("padding needs a slot size".into()));
        }
        Ok(())
    }
}

/// Builder for [`ImageConfig`].
#[derive(Default)]
pub struct ImageConfigBuilder {
    config: ImageConfig,
}

impl ImageConfigBuilder {
    pub fn version(mut self, v: ImageVersion) -> Self {
        self.config.version = v;
        self
    }
    pub fn header_size(mut self, size: usize) -> Self {
        self.config.header_size = size;
        self
    }
    pub fn pad_header(mut self, pad: bool) -> Self {
        self.config.pad_header = pad;
        self
    }
    pub fn pad(mut self, pad: bool) -> Self {
        self.config.pad = pad;
        self
    }
    /// Confirming implies padding.
    pub fn confirm(mut self, confirm: bool) -> Self {
        self.config.confirm = confirm;
        if confirm {
            self.config.pad = true;
        }
        self
    }
    pub fn slot_size(mut self, size: usize) -> Self {
        self.config.slot_size = size;
        self
    }
    pub fn align(mut self, align: u32) -> Self {
        self.config.align = align;
        self
    }
    pub fn max_align(mut self, max_align: u32) -> Self {
        self.config.max_align = max_align;
        self
    }
    pub fn max_sectors(mut self, n: u32) -> Self {
        self.config.max_sectors = n;
        self
    }
    pub fn overwrite_only(mut self, ow: bool) -> Self {
        self.config.overwrite_only = ow;
        self
    }
    pub fn endian(mut self, endian: Endian) -> Self {
        self.config.endian = endian;
        self
    }
    pub fn load_addr(mut self, addr: u32) -> Self {
        self.config.load_addr = addr;
        self
    }
    pub fn rom_fixed(mut self, addr: u32) -> Self {
        self.config.rom_fixed = Some(addr);
        self
    }
    pub fn erased_val(mut self, val: u8) -> Self {
        self.config.erased_val = val;
        self
    }
    pub fn save_enctlv(mut self, save: bool) -> Self {
        self.config.save_enctlv = save;
        self
    }
    pub fn security_counter(mut self, sc: SecurityCounter) -> Self {
        self.config.security_counter = Some(sc);
        self
    }
    pub fn non_bootable(mut self, nb: bool) -> Self {
        self.config.non_bootable = nb;
        self
    }
    pub fn build(self) -> ImageConfig {
        self.config
    }
}

// ---------------------------------------------------------------------------
// Create options
// ---------------------------------------------------------------------------

/// How the signing key is identified in the unprotected TLVs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublicKeyFormat {
    /// KEYHASH: digest of the public key under the image hash.
    #[default]
    Hash,
    /// PUBKEY: the full public key.
    Full,
}

impl FromStr for PublicKeyFormat {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hash" => Ok(PublicKeyFormat::Hash),
            "full" => Ok(PublicKeyFormat::Full),
            _ => Err(ImageError::UnknownName {
                kind: "public key format",
                name: s.to_string(),
            }),
        }
    }
}

/// Emit the public key record for `key`.
pub(crate) fn add_public_key(
    tlv: &mut TlvBuilder,
    key: &dyn VerifyingKey,
    format: PublicKeyFormat,
    hash: HashAlg,
) -> Result<()> {
    let public = key.public_bytes()?;
    match format {
        PublicKeyFormat::Hash => tlv.add(TlvType::KeyHash, &hash.digest(&public)),
        PublicKeyFormat::Full => tlv.add(TlvType::PubKey, &public),
    }
}

/// Stop `create` early and keep only the bytes an external signer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorToSign {
    /// The hashed region: header, payload and protected TLVs.
    Payload,
    /// The image digest (the hashed region in pure mode).
    Digest,
}

/// Dependency on another image in a multi-image setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub image_id: u8,
    pub version: ImageVersion,
}

impl Dependency {
    /// `id, 3 pad bytes, major, minor, revision, build`.
    pub fn to_bytes(&self, endian: Endian) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0] = self.image_id;
        out[4] = self.version.major;
        out[5] = self.version.minor;
        out[6..8].copy_from_slice(&endian.u16_bytes(self.version.revision));
        out[8..12].copy_from_slice(&endian.u32_bytes(self.version.build));
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    Lzma2,
    /// LZMA2 with the ARM Thumb branch filter.
    Lzma2ArmThumb,
}

impl CompressionKind {
    pub fn flags(self) -> u32 {
        match self {
            CompressionKind::Lzma2 => IMAGE_F_COMPRESSED_LZMA2,
            CompressionKind::Lzma2ArmThumb => {
                IMAGE_F_COMPRESSED_LZMA2 | IMAGE_F_COMPRESSED_ARM_THUMB_FLT
            }
        }
    }
}

/// Describes the uncompressed image when the payload is compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionInfo {
    pub kind: CompressionKind,
    pub decompressed_size: u32,
    pub decompressed_digest: Vec<u8>,
    pub decompressed_signature: Option<Vec<u8>>,
}

/// Wrap a content key for `key` and encrypt the body.
#[derive(Debug, Clone, Copy)]
pub struct Encryption<'a> {
    pub key: &'a EncryptionKey,
    pub key_len: AesKeyLen,
    /// Emit the wrapped key and flag but leave the body in plaintext.
    pub clear: bool,
}

/// A signature produced elsewhere, together with the key that made it.
pub struct FixedSignature<'a> {
    pub signature: Vec<u8>,
    pub public_key: &'a dyn VerifyingKey,
}

/// Per-invocation inputs to [`Image::create`].
#[derive(Default)]
pub struct CreateOptions<'a> {
    pub keys: Vec<&'a dyn SigningKey>,
    /// One id per key (or one for a fixed signature), or empty.
    pub key_ids: Vec<u32>,
    pub public_key_format: PublicKeyFormat,
    pub encryption: Option<Encryption<'a>>,
    pub dependencies: Vec<Dependency>,
    /// Software type for a BOOT_RECORD TLV.
    pub sw_type: Option<String>,
    pub custom_tlvs: Vec<(u16, Vec<u8>)>,
    pub compression: Option<CompressionInfo>,
    pub fixed_signature: Option<FixedSignature<'a>>,
    pub user_sha: UserSha,
    pub pure: bool,
    /// Zero-pad ECDSA signatures to a fixed length.
    pub pad_sig: bool,
    pub vector_to_sign: Option<VectorToSign>,
}

impl<'a> CreateOptions<'a> {
    pub fn with_key(key: &'a dyn SigningKey) -> Self {
        Self {
            keys: vec![key],
            ..Default::default()
        }
    }

    /// Family that decides the digest: the first signing key, or the key
    /// behind a fixed signature.
    fn primary_family(&self) -> Option<KeyFamily> {
        self.keys
            .first()
            .map(|k| k.family())
            .or_else(|| self.fixed_signature.as_ref().map(|f| f.public_key.family()))
    }

    fn check(&self) -> Result<()> {
        if !self.keys.is_empty() && self.fixed_signature.is_some() {
            return Err(ImageError::ConflictingSignatureSources);
        }
        let signers = if self.fixed_signature.is_some() {
            1
        } else {
            self.keys.len()
        };
        if !self.key_ids.is_empty() && self.key_ids.len() != signers {
            return Err(ImageError::KeyIdCountMismatch {
                ids: self.key_ids.len(),
                keys: signers,
            });
        }
        if let Some(enc) = &self.encryption {
            let enc_family = enc.key.family();
            let sign_families = self
                .keys
                .iter()
                .map(|k| k.family())
                .chain(self.fixed_signature.as_ref().map(|f| f.public_key.family()));
            for sign in sign_families {
                if !sign.accepts_encryption(enc_family) {
                    return Err(ImageError::IncompatibleEncryptionKey {
                        sign,
                        enc: enc_family,
                    });
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

pub struct Image {
    config: ImageConfig,
    payload: Vec<u8>,
    signatures: Vec<Vec<u8>>,
    digest: Option<Vec<u8>>,
    encrypted: bool,
    enctlv_len: usize,
    /// `payload` was replaced by a vector to sign.
    exported: bool,
    padded: bool,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("config", &self.config)
            .field("len", &self.payload.len())
            .field("signatures", &self.signatures.len())
            .field("encrypted", &self.encrypted)
            .finish()
    }
}

impl Image {
    pub fn new(config: ImageConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            payload: Vec::new(),
            signatures: Vec::new(),
            digest: None,
            encrypted: false,
            enctlv_len: 0,
            exported: false,
            padded: false,
        })
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Current image bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Signatures produced by the last `create`, in key order.
    pub fn signatures(&self) -> &[Vec<u8>] {
        &self.signatures
    }

    /// Image digest written by the last `create` (none in pure mode).
    pub fn digest(&self) -> Option<&[u8]> {
        self.digest.as_deref()
    }

    /// Length of the wrapped content key, 0 when not encrypted.
    pub fn enctlv_len(&self) -> usize {
        self.enctlv_len
    }

    pub fn trailer_layout(&self) -> TrailerLayout {
        TrailerLayout {
            align: self.config.align,
            max_sectors: self.config.max_sectors,
            overwrite_only: self.config.overwrite_only,
            encrypted: self.encrypted,
            save_enctlv: self.config.save_enctlv,
            enctlv_len: self.enctlv_len,
            max_align: self.config.max_align,
        }
    }

    pub fn trailer_size(&self) -> Result<usize> {
        self.trailer_layout().size()
    }

    // -- load ---------------------------------------------------------------

    /// Load a flat binary.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        if data.is_empty() {
            return Err(ImageError::EmptyInput(path.display().to_string()));
        }
        info!("loaded {} bytes from {}", data.len(), path.display());
        self.load_bytes(&data)
    }

    pub fn load_bytes(&mut self, data: &[u8]) -> Result<()> {
        let header_size = self.config.header_size;
        self.payload.clear();
        if self.config.pad_header {
            self.payload.resize(header_size, 0);
        } else if data.len() < header_size {
            return Err(ImageError::TooSmall {
                size: data.len(),
                min: header_size,
            });
        } else if data[..header_size].iter().any(|&b| b != 0) {
            return Err(ImageError::HeaderNotZeroed);
        }
        self.payload.extend_from_slice(data);
        self.signatures.clear();
        self.digest = None;
        self.encrypted = false;
        self.enctlv_len = 0;
        self.exported = false;
        self.padded = false;
        self.check_trailer()
    }

    /// The image plus its trailer must fit the slot.
    fn check_trailer(&self) -> Result<()> {
        if self.config.slot_size == 0 {
            return Ok(());
        }
        let trailer = self.trailer_size()?;
        if self.payload.len() + trailer > self.config.slot_size {
            return Err(ImageError::SlotTooSmall {
                image: self.payload.len(),
                trailer,
                slot: self.config.slot_size,
            });
        }
        Ok(())
    }

    // -- create -------------------------------------------------------------

    /// Write the header and append the TLV regions, signing and optionally
    /// encrypting the image.
    pub fn create(&mut self, opts: &CreateOptions) -> Result<()> {
        if self.payload.len() < self.config.header_size {
            return Err(ImageError::TooSmall {
                size: self.payload.len(),
                min: self.config.header_size,
            });
        }
        opts.check()?;

        let hash = select_hash(opts.primary_family(), opts.user_sha, opts.pure)?;
        for key in &opts.keys {
            if !allowed_hashes(key.family(), opts.pure).contains(&hash) {
                return Err(ImageError::HashNotAllowed {
                    family: key.family(),
                    requested: hash.to_string(),
                    allowed: allowed_hashes(key.family(), opts.pure)
                        .iter()
                        .map(|a| a.to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
        }
        info!("image digest: {hash}{}", if opts.pure { " (pure)" } else { "" });

        let endian = self.config.endian;
        let prot = self.protected_tlvs(opts, hash)?;

        if opts.encryption.is_some() {
            let rem = self.payload.len() % 16;
            if rem != 0 {
                let pad = 16 - rem;
                debug!("padding payload by {pad} bytes for encryption");
                self.payload.resize(self.payload.len() + pad, 0);
            }
        }

        self.write_header(opts, prot.len())?;

        let prot_off = self.payload.len();
        self.payload.extend_from_slice(&prot);

        let mut tlv = TlvBuilder::new(endian);
        let message = if opts.pure {
            tlv.add(TlvType::SigPure, &[1])?;
            self.digest = None;
            self.payload.clone()
        } else {
            let digest = hash.digest(&self.payload);
            tlv.add(hash.tlv(), &digest)?;
            self.digest = Some(digest.clone());
            digest
        };

        match opts.vector_to_sign {
            Some(VectorToSign::Payload) => {
                info!("exporting {} bytes to sign", self.payload.len());
                self.exported = true;
                return Ok(());
            }
            Some(VectorToSign::Digest) => {
                info!("exporting {}-byte digest to sign", message.len());
                self.payload = message;
                self.exported = true;
                return Ok(());
            }
            None => {}
        }

        self.signatures.clear();
        if let Some(fixed) = &opts.fixed_signature {
            if let Some(id) = opts.key_ids.first() {
                tlv.add(TlvType::KeyId, &endian.u32_bytes(*id))?;
            }
            add_public_key(&mut tlv, fixed.public_key, opts.public_key_format, hash)?;
            tlv.add(fixed.public_key.sig_tlv(), &fixed.signature)?;
            self.signatures.push(fixed.signature.clone());
        } else {
            for (i, key) in opts.keys.iter().enumerate() {
                if let Some(id) = opts.key_ids.get(i) {
                    tlv.add(TlvType::KeyId, &endian.u32_bytes(*id))?;
                }
                add_public_key(&mut tlv, key.verifying_key(), opts.public_key_format, hash)?;
                let mut sig = sign_image(*key, &self.payload, &message)?;
                if opts.pad_sig {
                    sig = pad_signature(key.verifying_key(), sig);
                }
                info!("signed with {} key ({} byte signature)", key.family(), sig.len());
                tlv.add(key.sig_tlv(), &sig)?;
                self.signatures.push(sig);
            }
        }

        // Drop the protected TLVs again so the body can be encrypted alone.
        self.payload.truncate(prot_off);

        if let Some(enc) = &opts.encryption {
            let encryptor = Encryptor::new(enc.key, enc.key_len);
            let wrapped = encryptor.wrap_key()?;
            self.enctlv_len = wrapped.data.len();
            tlv.add(wrapped.tlv, &wrapped.data)?;
            if enc.clear {
                info!("content key wrapped, body left in plaintext");
            } else {
                let header_size = self.config.header_size;
                encryptor.encrypt_body(&mut self.payload[header_size..])?;
                info!("encrypted body with {}-bit key", enc.key_len.bytes() * 8);
            }
            self.encrypted = true;
        }

        self.payload.extend_from_slice(&prot);
        self.payload.extend_from_slice(&tlv.finish(TLV_INFO_MAGIC)?);
        debug!(
            "image with TLVs: {} bytes (protected {}, unprotected {})",
            self.payload.len(),
            prot.len(),
            tlv.region_len()
        );

        self.check_trailer()
    }

    fn protected_tlvs(&self, opts: &CreateOptions, hash: HashAlg) -> Result<Vec<u8>> {
        let endian = self.config.endian;
        let mut prot = TlvBuilder::new(endian);

        if let Some(sc) = self.config.security_counter {
            let value = match sc {
                SecurityCounter::Auto => self.config.version.security_counter(),
                SecurityCounter::Value(v) => v,
            };
            debug!("security counter 0x{value:08x}");
            prot.add(TlvType::SecCnt, &endian.u32_bytes(value))?;
        }

        if let Some(sw_type) = &opts.sw_type {
            let signer = opts
                .keys
                .first()
                .map(|k| k.verifying_key())
                .or_else(|| opts.fixed_signature.as_ref().map(|f| f.public_key));
            let signer_id = match signer {
                Some(key) => hash.digest(&key.public_bytes()?),
                None => vec![0u8; HashAlg::Sha256.digest_len()],
            };
            let record = BootRecord::new(
                sw_type,
                self.config.version,
                signer_id,
                hash.tlv().short_name(),
                hash.digest_len(),
            )?;
            prot.add(TlvType::BootRecord, &record.to_cbor()?)?;
        }

        for dep in &opts.dependencies {
            prot.add(TlvType::Dependency, &dep.to_bytes(endian))?;
        }

        if let Some(comp) = &opts.compression {
            prot.add(TlvType::DecompSize, &endian.u32_bytes(comp.decompressed_size))?;
            prot.add(TlvType::DecompSha, &comp.decompressed_digest)?;
            if let Some(sig) = &comp.decompressed_signature {
                prot.add(TlvType::DecompSignature, sig)?;
            }
        }

        let mut seen = HashSet::new();
        for (tag, value) in &opts.custom_tlvs {
            if !seen.insert(*tag) {
                return Err(ImageError::DuplicateCustomTlv(*tag));
            }
            prot.add(TlvTag::vendor(*tag)?, value)?;
        }

        let out = prot.finish(TLV_PROT_INFO_MAGIC)?;
        if out.len() > usize::from(u16::MAX) {
            return Err(ImageError::TlvTooLarge(out.len()));
        }
        debug_assert!(out.is_empty() || out.len() >= TLV_INFO_SIZE);
        Ok(out)
    }

    fn write_header(&mut self, opts: &CreateOptions, protect_tlv_size: usize) -> Result<()> {
        let cfg = &self.config;
        let mut flags = 0;
        if let Some(enc) = &opts.encryption {
            flags |= enc.key_len.flag();
        }
        if cfg.load_addr != 0 {
            flags |= IMAGE_F_RAM_LOAD;
        }
        if cfg.rom_fixed.is_some() {
            flags |= IMAGE_F_ROM_FIXED;
        }
        if cfg.non_bootable {
            flags |= IMAGE_F_NON_BOOTABLE;
        }
        if let Some(comp) = &opts.compression {
            flags |= comp.kind.flags();
        }

        let img_size = self.payload.len() - cfg.header_size;
        let header = ImageHeader {
            magic: IMAGE_MAGIC,
            load_addr: cfg.rom_fixed.unwrap_or(cfg.load_addr),
            hdr_size: cfg.header_size as u16,
            protect_tlv_size: protect_tlv_size as u16,
            img_size: u32::try_from(img_size)
                .map_err(|_| ImageError::Usage(format!("image too large ({img_size} bytes)")))?,
            flags,
            version: cfg.version,
            pad: 0,
        };
        debug!("{header:?}");
        self.payload[..IMAGE_HEADER_SIZE].copy_from_slice(&header.to_bytes(cfg.endian));
        Ok(())
    }

    // -- pad / save ---------------------------------------------------------

    /// Pad with the erased value up to `size` bytes, ending in the trailer.
    pub fn pad_to(&mut self, size: usize) -> Result<()> {
        let layout = self.trailer_layout();
        let trailer = layout.fill(self.config.erased_val, self.config.confirm, self.config.endian)?;
        let used = self.payload.len() + trailer.len();
        let padding = size.checked_sub(used).ok_or(ImageError::SlotTooSmall {
            image: self.payload.len(),
            trailer: trailer.len(),
            slot: size,
        })?;
        info!(
            "padding to 0x{size:x} ({padding} erased bytes, {} byte trailer{})",
            trailer.len(),
            if self.config.confirm { ", confirmed" } else { "" }
        );
        self.payload
            .resize(self.payload.len() + padding, self.config.erased_val);
        self.payload.extend_from_slice(&trailer);
        self.padded = true;
        Ok(())
    }

    /// Write the image, padding it first when configured to.
    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("hex"))
        {
            return Err(ImageError::Usage(
                "Intel HEX output is not supported; write a flat binary".into(),
            ));
        }
        if self.config.pad && !self.exported && !self.padded {
            self.pad_to(self.config.slot_size)?;
        }
        fs::write(path, &self.payload)?;
        info!("wrote {} bytes to {}", self.payload.len(), path.display());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
