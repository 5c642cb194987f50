//! # mcuimg
//!
//! A Rust library for building and inspecting signed firmware images for
//! MCU secure bootloaders.
//!
//! An image is a 32-byte header, the (optionally padded) firmware payload,
//! a protected TLV region covered by the image digest, an unprotected TLV
//! region carrying the digest, key material and signatures, and an optional
//! trailer at the end of the flash slot. The library supports:
//!
//! - **Signing** with RSA-2048/3072 (PSS), ECDSA P-256/P-384 and Ed25519,
//!   including "pure" Ed25519 signatures over the whole hashed region
//! - **Encryption** of the firmware body with AES-CTR, the content key
//!   wrapped with RSA-OAEP, ECIES-P256, ECIES-X25519 or AES key wrap
//! - **Verification** of existing images against a set of public keys
//! - **In-place editing**: appending or removing signatures without
//!   changing the image size
//!
//! All crypto is pure Rust (no OpenSSL).
//!
//! ## Example
//!
//! ```no_run
//! use mcuimg::{Image, ImageConfig, CreateOptions, ImageVersion};
//! use mcuimg::keys;
//!
//! let config = ImageConfig::builder()
//!     .version("1.2.3+4".parse::<ImageVersion>().unwrap())
//!     .header_size(0x200)
//!     .pad_header(true)
//!     .slot_size(0x20000)
//!     .align(4)
//!     .pad(true)
//!     .build();
//!
//! let key = keys::load_signing_key("root-ec-p256.pem").unwrap();
//! let mut image = Image::new(config).unwrap();
//! image.load("zephyr.bin").unwrap();
//! image.create(&CreateOptions::with_key(key.as_ref())).unwrap();
//! image.save("zephyr.signed.bin").unwrap();
//! ```

pub mod boot_record;
pub mod digest;
pub mod dump;
pub mod editor;
pub mod encrypt;
pub mod header;
pub mod image;
pub mod keys;
pub mod layout;
pub mod tlv;
pub mod trailer;
pub mod verify;

use std::fmt;
use std::io;
use std::str::FromStr;

use thiserror::Error;

pub use digest::{HashAlg, UserSha};
pub use editor::{sign_append, sign_remove};
pub use header::{ImageHeader, ImageVersion};
pub use image::{CreateOptions, Image, ImageConfig, PublicKeyFormat};
pub use keys::{KeyFamily, SigningKey, VerifyingKey};
pub use tlv::{TlvTag, TlvType};
pub use verify::{verify_image, VerifyResult, Verification};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number at offset 0 of every image header.
pub const IMAGE_MAGIC: u32 = 0x96f3_b83d;

/// Size of the fixed image header in bytes.
pub const IMAGE_HEADER_SIZE: usize = 32; // 4+4+2+2+4+4+8+4

/// Magic of the unprotected TLV info header.
pub const TLV_INFO_MAGIC: u16 = 0x6907;

/// Magic of the protected TLV info header.
pub const TLV_PROT_INFO_MAGIC: u16 = 0x6908;

/// Size of a TLV region info header (magic + total length).
pub const TLV_INFO_SIZE: usize = 4;

/// Size of a single TLV record header (type + length).
pub const TLV_SIZE: usize = 4;

/// Default number of flash sectors tracked by the swap status area.
pub const DEFAULT_MAX_SECTORS: u32 = 128;

/// Default maximum write alignment of the flash device.
pub const DEFAULT_MAX_ALIGN: u32 = 8;

/// Erased flash state used when none is configured.
pub const DEFAULT_ERASED_VAL: u8 = 0xff;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("empty input file: {0}")]
    EmptyInput(String),

    // -- malformed input --
    #[error("bad image magic 0x{0:08x}")]
    InvalidMagic(u32),

    #[error("bad image header: {0}")]
    InvalidHeader(&'static str),

    #[error("bad TLV info magic 0x{found:04x} at offset 0x{offset:x}")]
    InvalidTlvMagic { offset: usize, found: u16 },

    #[error("corrupt TLV area at offset 0x{offset:x}: {reason}")]
    CorruptTlv { offset: usize, reason: &'static str },

    #[error("image too small ({size} bytes, need at least {min})")]
    TooSmall { size: usize, min: usize },

    #[error("image has no digest TLV")]
    MissingDigest,

    // -- caller errors --
    #[error("unknown {kind} name: {name}")]
    UnknownName { kind: &'static str, name: String },

    #[error("TLV tag 0x{0:04x} is outside the vendor range 0x00a0..=0xfffe")]
    VendorTagOutOfRange(u16),

    #[error("custom TLV 0x{0:04x} collides with a predefined TLV")]
    CustomTlvConflict(u16),

    #[error("custom TLV 0x{0:04x} given more than once")]
    DuplicateCustomTlv(u16),

    #[error("TLV data too large ({0} bytes)")]
    TlvTooLarge(usize),

    #[error("{family} keys cannot be used with {requested}; allowed: {allowed}")]
    HashNotAllowed {
        family: KeyFamily,
        requested: String,
        allowed: String,
    },

    #[error("no hash algorithm is defined for {family} keys{}", pure_suffix(.pure))]
    NoHashForKey { family: KeyFamily, pure: bool },

    #[error("pure signatures need a signing key")]
    PureWithoutKey,

    #[error("a fixed signature cannot be combined with a signing key")]
    ConflictingSignatureSources,

    #[error("{enc} encryption cannot be combined with {sign} signatures")]
    IncompatibleEncryptionKey { sign: KeyFamily, enc: KeyFamily },

    #[error("{ids} key ids given for {keys} keys")]
    KeyIdCountMismatch { ids: usize, keys: usize },

    #[error("no signature with key id {0}")]
    KeyIdNotFound(u32),

    #[error("invalid alignment {0}")]
    InvalidAlignment(u32),

    #[error("invalid max alignment {0}: must be 8, 16 or 32")]
    InvalidMaxAlignment(u32),

    #[error("invalid erased value 0x{0:02x}: must be 0x00 or 0xff")]
    InvalidErasedValue(u8),

    #[error("invalid version '{0}': expected maj.min.rev+build")]
    InvalidVersion(String),

    #[error("header size {0} is smaller than the 32-byte image header")]
    HeaderTooSmall(usize),

    #[error("header area is not zeroed; pad the header or leave room for it")]
    HeaderNotZeroed,

    #[error("boot record sw_type '{0}' is longer than 12 bytes")]
    SwTypeTooLong(String),

    #[error("{0}")]
    Usage(String),

    // -- crypto --
    #[error("digest TLV {tlv} does not match any supplied key")]
    KeyMismatch { tlv: TlvType },

    #[error("key error: {0}")]
    Key(String),

    #[error("cryptographic failure: {0}")]
    Crypto(String),

    // -- sizing --
    #[error("image size 0x{image:x} plus trailer 0x{trailer:x} exceeds slot size 0x{slot:x}")]
    SlotTooSmall {
        image: usize,
        trailer: usize,
        slot: usize,
    },

    #[error("not enough erased padding to grow the TLV area by {needed} bytes ({available} available)")]
    InsufficientPadding { needed: usize, available: usize },

    #[error("edit changed the image size from {before} to {after} bytes")]
    SizeChanged { before: usize, after: usize },
}

fn pure_suffix(pure: &bool) -> &'static str {
    if *pure {
        " in pure mode"
    } else {
        ""
    }
}

/// Coarse grouping of [`ImageError`] used for exit codes and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed image or TLV data.
    Format,
    /// Invalid arguments or option combinations.
    Usage,
    /// Key loading, signing, wrapping or key/digest mismatch.
    Crypto,
    /// The result does not fit the slot or the available padding.
    Sizing,
    Io,
}

impl ImageError {
    pub fn class(&self) -> ErrorClass {
        use ImageError::*;
        match self {
            Io(_) | EmptyInput(_) => ErrorClass::Io,
            InvalidMagic(_) | InvalidHeader(_) | InvalidTlvMagic { .. } | CorruptTlv { .. }
            | TooSmall { .. } | MissingDigest => ErrorClass::Format,
            KeyMismatch { .. } | Key(_) | Crypto(_) => ErrorClass::Crypto,
            SlotTooSmall { .. } | InsufficientPadding { .. } | SizeChanged { .. } => {
                ErrorClass::Sizing
            }
            _ => ErrorClass::Usage,
        }
    }
}

pub type Result<T> = std::result::Result<T, ImageError>;

// ---------------------------------------------------------------------------
// Byte order
// ---------------------------------------------------------------------------

/// Byte order of every multi-byte field in an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    pub fn u16_bytes(self, v: u16) -> [u8; 2] {
        match self {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        }
    }

    pub fn u32_bytes(self, v: u32) -> [u8; 4] {
        match self {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        }
    }

    pub fn read_u16(self, raw: [u8; 2]) -> u16 {
        match self {
            Endian::Little => u16::from_le_bytes(raw),
            Endian::Big => u16::from_be_bytes(raw),
        }
    }

    pub fn read_u32(self, raw: [u8; 4]) -> u32 {
        match self {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        }
    }
}

/// Copy `N` bytes starting at `at`, or fail with [`ImageError::TooSmall`].
pub fn bytes_at<const N: usize>(b: &[u8], at: usize) -> Result<[u8; N]> {
    b.get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(ImageError::TooSmall {
            size: b.len(),
            min: at + N,
        })
}

impl FromStr for Endian {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "little" | "le" => Ok(Endian::Little),
            "big" | "be" => Ok(Endian::Big),
            _ => Err(ImageError::UnknownName {
                kind: "endianness",
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Endian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endian::Little => write!(f, "little"),
            Endian::Big => write!(f, "big"),
        }
    }
}

/// Round `n` up to the next multiple of `align` (which must be non-zero).
pub fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

// ---------------------------------------------------------------------------
// Code tables
// ---------------------------------------------------------------------------

macro_rules! enum_with_table {
    (
        $(#[$outer:meta])*
        pub enum $Name:ident : $kind:literal {
            $(
                $(#[$inner:meta])*
                $Variant:ident = $val:expr, $short:literal, $long:literal
            ),+ $(,)?
        }
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $Name {
            $(
                $(#[$inner])*
                $Variant = $val,
            )+
        }

        impl $Name {
            /// All known entries as `(value, short_name, long_name)`.
            pub fn table() -> &'static [(u8, &'static str, &'static str)] {
                &[
                    $(
                        ($val, $short, $long),
                    )+
                ]
            }

            /// Look up by short name (case-insensitive).
            pub fn from_name(name: &str) -> Option<Self> {
                Self::table()
                    .iter()
                    .find(|(_, short, _)| short.eq_ignore_ascii_case(name))
                    .and_then(|&(val, _, _)| Self::from_u8(val))
            }

            /// Look up by short name, failing with [`ImageError::UnknownName`].
            pub fn parse_name(name: &str) -> $crate::Result<Self> {
                Self::from_name(name).ok_or_else(|| $crate::ImageError::UnknownName {
                    kind: $kind,
                    name: name.to_string(),
                })
            }

            /// Look up by raw u8 value.
            pub fn from_u8(v: u8) -> Option<Self> {
                $(
                    if v == $val { return Some(Self::$Variant); }
                )+
                None
            }

            pub fn short_name(self) -> &'static str {
                for &(val, short, _) in Self::table() {
                    if val == self as u8 { return short; }
                }
                "unknown"
            }

            pub fn long_name(self) -> &'static str {
                for &(val, _, long) in Self::table() {
                    if val == self as u8 { return long; }
                }
                "Unknown"
            }

            /// The kind label (e.g. "TLV type").
            pub fn kind() -> &'static str {
                $kind
            }
        }

        impl std::fmt::Display for $Name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.short_name())
            }
        }
    };
}

pub(crate) use enum_with_table;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(16, 8), 16);
        assert_eq!(align_up(16, 32), 32);
        assert_eq!(align_up(1027, 16), 1040);
    }

    #[test]
    fn endian_helpers() {
        assert_eq!(Endian::Little.u16_bytes(0x6907), [0x07, 0x69]);
        assert_eq!(Endian::Big.u16_bytes(0x6907), [0x69, 0x07]);
        assert_eq!(Endian::Big.u32_bytes(IMAGE_MAGIC), [0x96, 0xf3, 0xb8, 0x3d]);
        assert_eq!(Endian::Little.read_u32([0x3d, 0xb8, 0xf3, 0x96]), IMAGE_MAGIC);
        assert_eq!(Endian::Big.read_u16([0x69, 0x08]), TLV_PROT_INFO_MAGIC);
        assert_eq!("BE".parse::<Endian>().unwrap(), Endian::Big);
        assert!("middle".parse::<Endian>().is_err());
    }

    #[test]
    fn short_slices_are_errors() {
        assert_eq!(bytes_at::<2>(&[1, 2, 3], 1).unwrap(), [2, 3]);
        assert!(matches!(
            bytes_at::<4>(&[0x3d, 0xb8, 0xf3], 0),
            Err(ImageError::TooSmall { size: 3, min: 4 })
        ));
        assert!(bytes_at::<2>(&[1, 2], 2).is_err());
    }

    #[test]
    fn error_classes() {
        assert_eq!(ImageError::InvalidMagic(0).class(), ErrorClass::Format);
        assert_eq!(ImageError::PureWithoutKey.class(), ErrorClass::Usage);
        assert_eq!(
            ImageError::KeyMismatch { tlv: TlvType::Sha256 }.class(),
            ErrorClass::Crypto
        );
        assert_eq!(
            ImageError::InsufficientPadding { needed: 4, available: 0 }.class(),
            ErrorClass::Sizing
        );
    }
}
