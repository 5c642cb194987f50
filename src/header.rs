//! The fixed 32-byte image header and the image version.
//!
//! Every multi-byte field is written in the image's byte order, which a
//! reader recovers from the magic at offset 0.

use std::fmt;
use std::str::FromStr;

use crate::{bytes_at, Endian, ImageError, Result, IMAGE_HEADER_SIZE, IMAGE_MAGIC};

// ---------------------------------------------------------------------------
// Header flags
// ---------------------------------------------------------------------------

/// Position independent code.
pub const IMAGE_F_PIC: u32 = 0x0000_0001;
/// Body encrypted with AES-128-CTR.
pub const IMAGE_F_ENCRYPTED_AES128: u32 = 0x0000_0004;
/// Body encrypted with AES-256-CTR.
pub const IMAGE_F_ENCRYPTED_AES256: u32 = 0x0000_0008;
/// Split image application, never booted directly.
pub const IMAGE_F_NON_BOOTABLE: u32 = 0x0000_0010;
/// Image is copied to RAM at the load address before execution.
pub const IMAGE_F_RAM_LOAD: u32 = 0x0000_0020;
/// Image is linked to run from a fixed flash address.
pub const IMAGE_F_ROM_FIXED: u32 = 0x0000_0100;
pub const IMAGE_F_COMPRESSED_LZMA1: u32 = 0x0000_0200;
pub const IMAGE_F_COMPRESSED_LZMA2: u32 = 0x0000_0400;
pub const IMAGE_F_COMPRESSED_ARM_THUMB_FLT: u32 = 0x0000_0800;

/// Flag names for display, in bit order.
pub const FLAG_NAMES: &[(u32, &str)] = &[
    (IMAGE_F_PIC, "PIC"),
    (IMAGE_F_ENCRYPTED_AES128, "ENCRYPTED_AES128"),
    (IMAGE_F_ENCRYPTED_AES256, "ENCRYPTED_AES256"),
    (IMAGE_F_NON_BOOTABLE, "NON_BOOTABLE"),
    (IMAGE_F_RAM_LOAD, "RAM_LOAD"),
    (IMAGE_F_ROM_FIXED, "ROM_FIXED"),
    (IMAGE_F_COMPRESSED_LZMA1, "COMPRESSED_LZMA1"),
    (IMAGE_F_COMPRESSED_LZMA2, "COMPRESSED_LZMA2"),
    (IMAGE_F_COMPRESSED_ARM_THUMB_FLT, "COMPRESSED_ARM_THUMB"),
];

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Semantic image version `major.minor.revision+build`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build: u32,
}

impl ImageVersion {
    pub const fn new(major: u8, minor: u8, revision: u16, build: u32) -> Self {
        Self {
            major,
            minor,
            revision,
            build,
        }
    }

    /// Security counter derived from the version when none is given
    /// explicitly. The build number does not take part.
    pub fn security_counter(&self) -> u32 {
        (u32::from(self.major) << 24) | (u32::from(self.minor) << 16) | u32::from(self.revision)
    }

    /// `"maj.min.rev"` without the build number, as used in boot records.
    pub fn short_string(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.revision)
    }
}

impl FromStr for ImageVersion {
    type Err = ImageError;

    /// Parse `maj[.min[.rev]][+build]`. Missing fields are zero.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || ImageError::InvalidVersion(s.to_string());

        let (dotted, build) = match s.split_once('+') {
            Some((d, b)) => (d, Some(b)),
            None => (s, None),
        };

        let parts: Vec<&str> = dotted.split('.').collect();
        if parts.len() > 3 {
            return Err(bad());
        }
        let num = |idx: usize| -> Result<u64> {
            match parts.get(idx) {
                None => Ok(0),
                Some(p) if !p.is_empty() && p.bytes().all(|c| c.is_ascii_digit()) => {
                    p.parse::<u64>().map_err(|_| bad())
                }
                Some(_) => Err(bad()),
            }
        };

        let major = u8::try_from(num(0)?).map_err(|_| bad())?;
        let minor = u8::try_from(num(1)?).map_err(|_| bad())?;
        let revision = u16::try_from(num(2)?).map_err(|_| bad())?;
        let build = match build {
            None => 0,
            Some(b) if !b.is_empty() && b.bytes().all(|c| c.is_ascii_digit()) => {
                b.parse::<u32>().map_err(|_| bad())?
            }
            Some(_) => return Err(bad()),
        };

        Ok(Self::new(major, minor, revision, build))
    }
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}+{}",
            self.major, self.minor, self.revision, self.build
        )
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// The 32-byte image header.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub magic: u32,
    /// Load address, or the fixed ROM address when `IMAGE_F_ROM_FIXED` is set.
    pub load_addr: u32,
    /// Size of the header area, including any zero padding after the
    /// 32 header bytes.
    pub hdr_size: u16,
    /// Total size of the protected TLV region, 0 when absent.
    pub protect_tlv_size: u16,
    /// Size of the payload following the header area.
    pub img_size: u32,
    pub flags: u32,
    pub version: ImageVersion,
    pub pad: u32,
}

impl Default for ImageHeader {
    fn default() -> Self {
        Self {
            magic: IMAGE_MAGIC,
            load_addr: 0,
            hdr_size: IMAGE_HEADER_SIZE as u16,
            protect_tlv_size: 0,
            img_size: 0,
            flags: 0,
            version: ImageVersion::default(),
            pad: 0,
        }
    }
}

impl ImageHeader {
    /// Serialize the header in the given byte order.
    pub fn to_bytes(&self, endian: Endian) -> [u8; IMAGE_HEADER_SIZE] {
        let mut buf = [0u8; IMAGE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&endian.u32_bytes(self.magic));
        buf[4..8].copy_from_slice(&endian.u32_bytes(self.load_addr));
        buf[8..10].copy_from_slice(&endian.u16_bytes(self.hdr_size));
        buf[10..12].copy_from_slice(&endian.u16_bytes(self.protect_tlv_size));
        buf[12..16].copy_from_slice(&endian.u32_bytes(self.img_size));
        buf[16..20].copy_from_slice(&endian.u32_bytes(self.flags));
        buf[20] = self.version.major;
        buf[21] = self.version.minor;
        buf[22..24].copy_from_slice(&endian.u16_bytes(self.version.revision));
        buf[24..28].copy_from_slice(&endian.u32_bytes(self.version.build));
        buf[28..32].copy_from_slice(&endian.u32_bytes(self.pad));
        buf
    }

    /// Deserialize a header in the given byte order. The magic must match.
    pub fn from_bytes(data: &[u8], endian: Endian) -> Result<Self> {
        if data.len() < IMAGE_HEADER_SIZE {
            return Err(ImageError::TooSmall {
                size: data.len(),
                min: IMAGE_HEADER_SIZE,
            });
        }
        let u16_at = |at| bytes_at(data, at).map(|b| endian.read_u16(b));
        let u32_at = |at| bytes_at(data, at).map(|b| endian.read_u32(b));
        let magic = u32_at(0)?;
        if magic != IMAGE_MAGIC {
            return Err(ImageError::InvalidMagic(magic));
        }
        Ok(Self {
            magic,
            load_addr: u32_at(4)?,
            hdr_size: u16_at(8)?,
            protect_tlv_size: u16_at(10)?,
            img_size: u32_at(12)?,
            flags: u32_at(16)?,
            version: ImageVersion {
                major: data[20],
                minor: data[21],
                revision: u16_at(22)?,
                build: u32_at(24)?,
            },
            pad: u32_at(28)?,
        })
    }

    /// Parse a header whose byte order is not known up front, detecting it
    /// from the magic.
    pub fn detect(data: &[u8]) -> Result<(Self, Endian)> {
        if data.len() < IMAGE_HEADER_SIZE {
            return Err(ImageError::TooSmall {
                size: data.len(),
                min: IMAGE_HEADER_SIZE,
            });
        }
        let endian = detect_endian(data)?;
        Ok((Self::from_bytes(data, endian)?, endian))
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Names of the flags set in this header.
    pub fn flag_names(&self) -> Vec<&'static str> {
        FLAG_NAMES
            .iter()
            .filter(|(bit, _)| self.has_flag(*bit))
            .map(|(_, name)| *name)
            .collect()
    }

    pub fn is_encrypted(&self) -> bool {
        self.has_flag(IMAGE_F_ENCRYPTED_AES128 | IMAGE_F_ENCRYPTED_AES256)
    }
}

impl fmt::Debug for ImageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageHeader")
            .field("magic", &format_args!("0x{:08x}", self.magic))
            .field("load_addr", &format_args!("0x{:08x}", self.load_addr))
            .field("hdr_size", &format_args!("0x{:x}", self.hdr_size))
            .field("protect_tlv_size", &self.protect_tlv_size)
            .field("img_size", &self.img_size)
            .field("flags", &self.flag_names())
            .field("version", &format_args!("{}", self.version))
            .field("pad", &format_args!("0x{:08x}", self.pad))
            .finish()
    }
}

/// Determine the image byte order from the magic at offset 0.
pub fn detect_endian(data: &[u8]) -> Result<Endian> {
    let raw = bytes_at(data, 0)?;
    if Endian::Little.read_u32(raw) == IMAGE_MAGIC {
        Ok(Endian::Little)
    } else if Endian::Big.read_u32(raw) == IMAGE_MAGIC {
        Ok(Endian::Big)
    } else {
        Err(ImageError::InvalidMagic(Endian::Little.read_u32(raw)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ImageHeader {
        ImageHeader {
            load_addr: 0x2000_0000,
            hdr_size: 0x200,
            protect_tlv_size: 0x0c,
            img_size: 0x1234,
            flags: IMAGE_F_RAM_LOAD | IMAGE_F_ENCRYPTED_AES128,
            version: ImageVersion::new(1, 2, 3, 4),
            ..Default::default()
        }
    }

    #[test]
    fn header_serialize_roundtrip() {
        for endian in [Endian::Little, Endian::Big] {
            let hdr = sample();
            let bytes = hdr.to_bytes(endian);
            assert_eq!(bytes.len(), IMAGE_HEADER_SIZE);

            let hdr2 = ImageHeader::from_bytes(&bytes, endian).unwrap();
            assert_eq!(hdr2, hdr);
            assert_eq!(ImageHeader::detect(&bytes).unwrap(), (hdr, endian));
        }
    }

    #[test]
    fn little_endian_layout() {
        let bytes = sample().to_bytes(Endian::Little);
        assert_eq!(&bytes[0..4], &[0x3d, 0xb8, 0xf3, 0x96]);
        assert_eq!(&bytes[8..10], &[0x00, 0x02]);
        assert_eq!(&bytes[20..24], &[1, 2, 3, 0]);
        assert_eq!(&bytes[28..32], &[0, 0, 0, 0]);
    }

    #[test]
    fn bad_magic_detected() {
        let data = [0u8; 64];
        assert!(matches!(
            ImageHeader::detect(&data),
            Err(ImageError::InvalidMagic(0))
        ));
        let bytes = sample().to_bytes(Endian::Big);
        assert!(matches!(
            ImageHeader::from_bytes(&bytes, Endian::Little),
            Err(ImageError::InvalidMagic(_))
        ));
        assert!(matches!(
            ImageHeader::detect(&bytes[..16]),
            Err(ImageError::TooSmall { size: 16, .. })
        ));
    }

    #[test]
    fn version_parsing() {
        let v: ImageVersion = "1.2.3+4".parse().unwrap();
        assert_eq!(v, ImageVersion::new(1, 2, 3, 4));
        assert_eq!(v.to_string(), "1.2.3+4");
        assert_eq!(v.short_string(), "1.2.3");

        assert_eq!("3".parse::<ImageVersion>().unwrap(), ImageVersion::new(3, 0, 0, 0));
        assert_eq!(
            "0.5+17".parse::<ImageVersion>().unwrap(),
            ImageVersion::new(0, 5, 0, 17)
        );

        for bad in ["", "1..2", "1.2.3.4", "256.0.0", "1.2.70000", "1.2.3+", "a.b", "1.2.3+x"] {
            assert!(
                matches!(bad.parse::<ImageVersion>(), Err(ImageError::InvalidVersion(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn security_counter_from_version() {
        let v = ImageVersion::new(1, 2, 3, 99);
        assert_eq!(v.security_counter(), 0x0102_0003);
    }

    #[test]
    fn flag_names_listed() {
        let hdr = sample();
        assert_eq!(hdr.flag_names(), vec!["ENCRYPTED_AES128", "RAM_LOAD"]);
        assert!(hdr.is_encrypted());
    }
}
