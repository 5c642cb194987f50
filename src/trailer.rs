//! Image trailer geometry and the boot magic.
//!
//! The trailer lives at the very end of the flash slot. Its exact layout
//! depends on the upgrade strategy (swap or overwrite-only), the flash write
//! alignment and whether the image is encrypted; the builder only needs its
//! size, the boot magic and the position of the `image_ok` byte.

use crate::{align_up, Endian, ImageError, Result, DEFAULT_MAX_ALIGN, DEFAULT_MAX_SECTORS};

pub const BOOT_MAGIC_SIZE: usize = 16;

/// Boot magic used when the maximum write alignment is 8.
pub const BOOT_MAGIC: [u8; BOOT_MAGIC_SIZE] = [
    0x77, 0xc2, 0x95, 0xf3, 0x60, 0xd2, 0xef, 0x7f, 0x35, 0x52, 0x50, 0x0f, 0x2c, 0xb6, 0x79, 0x80,
];

/// Tail of the boot magic for larger alignments; the first two bytes hold
/// the alignment.
const BOOT_MAGIC_ALIGNED_TAIL: [u8; 14] = [
    0x2d, 0xe1, 0x5d, 0x29, 0x41, 0x0b, 0x8d, 0x77, 0x67, 0x9c, 0x11, 0x0f, 0x1f, 0x8a,
];

/// Value written to `image_ok` when the image is confirmed.
pub const IMAGE_OK: u8 = 0x01;

const VALID_ALIGNS: [u32; 6] = [1, 2, 4, 8, 16, 32];
const VALID_MAX_ALIGNS: [u32; 3] = [8, 16, 32];

pub fn check_align(align: u32) -> Result<()> {
    if VALID_ALIGNS.contains(&align) {
        Ok(())
    } else {
        Err(ImageError::InvalidAlignment(align))
    }
}

pub fn check_max_align(max_align: u32) -> Result<()> {
    if VALID_MAX_ALIGNS.contains(&max_align) {
        Ok(())
    } else {
        Err(ImageError::InvalidMaxAlignment(max_align))
    }
}

/// The boot magic for a maximum write alignment.
pub fn boot_magic(max_align: u32, endian: Endian) -> [u8; BOOT_MAGIC_SIZE] {
    if max_align == DEFAULT_MAX_ALIGN {
        return BOOT_MAGIC;
    }
    let mut magic = [0u8; BOOT_MAGIC_SIZE];
    // Only the low 16 bits of the alignment are stored.
    magic[..2].copy_from_slice(&endian.u16_bytes(max_align as u16));
    magic[2..].copy_from_slice(&BOOT_MAGIC_ALIGNED_TAIL);
    magic
}

/// Recognise a boot magic, returning the maximum alignment it encodes.
pub fn parse_boot_magic(bytes: &[u8], endian: Endian) -> Option<u32> {
    if bytes.len() != BOOT_MAGIC_SIZE {
        return None;
    }
    if bytes == BOOT_MAGIC {
        return Some(DEFAULT_MAX_ALIGN);
    }
    if bytes[2..] == BOOT_MAGIC_ALIGNED_TAIL {
        return Some(u32::from(endian.read_u16([bytes[0], bytes[1]])));
    }
    None
}

/// Offset of the boot magic if `image` ends with one.
pub fn find_boot_magic(image: &[u8], endian: Endian) -> Option<usize> {
    let start = image.len().checked_sub(BOOT_MAGIC_SIZE)?;
    parse_boot_magic(&image[start..], endian).map(|_| start)
}

/// Parameters that decide the trailer size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailerLayout {
    /// Flash write alignment.
    pub align: u32,
    pub max_sectors: u32,
    pub overwrite_only: bool,
    pub encrypted: bool,
    /// Keep the full wrapped key in the trailer instead of the bare
    /// content key.
    pub save_enctlv: bool,
    /// Length of the wrapped key (ENC* TLV payload).
    pub enctlv_len: usize,
    pub max_align: u32,
}

impl Default for TrailerLayout {
    fn default() -> Self {
        Self {
            align: 1,
            max_sectors: DEFAULT_MAX_SECTORS,
            overwrite_only: false,
            encrypted: false,
            save_enctlv: false,
            enctlv_len: 0,
            max_align: DEFAULT_MAX_ALIGN,
        }
    }
}

impl TrailerLayout {
    fn max_align(&self) -> usize {
        self.max_align as usize
    }

    /// Space taken by the boot magic, rounded to the write alignment.
    pub fn magic_area(&self) -> usize {
        align_up(BOOT_MAGIC_SIZE, self.max_align())
    }

    /// Total trailer size in bytes.
    pub fn size(&self) -> Result<usize> {
        check_align(self.align)?;
        check_max_align(self.max_align)?;
        let max_align = self.max_align();

        if self.overwrite_only {
            return Ok(2 * max_align + self.magic_area());
        }

        let mut size = self.max_sectors as usize * 3 * self.align as usize;
        if self.encrypted {
            let keylen = if self.save_enctlv {
                self.enctlv_len
            } else {
                16
            };
            size += 2 * align_up(keylen, max_align);
        }
        size += 4 * max_align;
        size += self.magic_area();
        Ok(size)
    }

    /// Distance of the `image_ok` byte from the end of the slot.
    pub fn image_ok_from_end(&self) -> usize {
        self.magic_area() + self.max_align()
    }

    /// Bytes placed at the end of the slot: erased state, optional
    /// `image_ok`, then the boot magic.
    pub fn fill(&self, erased_val: u8, confirm: bool, endian: Endian) -> Result<Vec<u8>> {
        let size = self.size()?;
        let mut out = vec![erased_val; size];
        out[size - BOOT_MAGIC_SIZE..].copy_from_slice(&boot_magic(self.max_align, endian));
        if confirm && !self.overwrite_only {
            out[size - self.image_ok_from_end()] = IMAGE_OK;
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(align: u32) -> TrailerLayout {
        TrailerLayout {
            align,
            ..Default::default()
        }
    }

    #[test]
    fn swap_trailer_size() {
        // 128 sectors * 3 * 16 + 4 * 8 + 16
        assert_eq!(layout(16).size().unwrap(), 6144 + 32 + 16);
        assert_eq!(layout(1).size().unwrap(), 384 + 32 + 16);
    }

    #[test]
    fn encrypted_trailer_size() {
        let mut l = layout(8);
        l.encrypted = true;
        assert_eq!(l.size().unwrap(), 3072 + 2 * 16 + 32 + 16);

        l.save_enctlv = true;
        l.enctlv_len = 113;
        assert_eq!(l.size().unwrap(), 3072 + 2 * 120 + 32 + 16);
    }

    #[test]
    fn overwrite_only_is_small() {
        let mut l = layout(4);
        l.overwrite_only = true;
        assert_eq!(l.size().unwrap(), 2 * 8 + 16);
        l.max_align = 32;
        assert_eq!(l.size().unwrap(), 2 * 32 + 32);
    }

    #[test]
    fn alignment_validated() {
        assert!(matches!(layout(3).size(), Err(ImageError::InvalidAlignment(3))));
        let mut l = layout(8);
        l.max_align = 4;
        assert!(matches!(l.size(), Err(ImageError::InvalidMaxAlignment(4))));
    }

    #[test]
    fn magic_variants() {
        assert_eq!(boot_magic(8, Endian::Little), BOOT_MAGIC);
        let le = boot_magic(16, Endian::Little);
        assert_eq!(&le[..4], &[0x10, 0x00, 0x2d, 0xe1]);
        let be = boot_magic(32, Endian::Big);
        assert_eq!(&be[..4], &[0x00, 0x20, 0x2d, 0xe1]);

        assert_eq!(parse_boot_magic(&BOOT_MAGIC, Endian::Big), Some(8));
        assert_eq!(parse_boot_magic(&be, Endian::Big), Some(32));
        assert_eq!(parse_boot_magic(&[0xff; 16], Endian::Little), None);
    }

    #[test]
    fn fill_places_magic_and_image_ok() {
        let l = layout(16);
        let bytes = l.fill(0xff, true, Endian::Little).unwrap();
        let n = bytes.len();
        assert_eq!(n, l.size().unwrap());
        assert_eq!(&bytes[n - 16..], &BOOT_MAGIC);
        assert_eq!(bytes[n - 24], IMAGE_OK);
        assert!(bytes[..n - 24].iter().all(|&b| b == 0xff));
        assert!(bytes[n - 23..n - 16].iter().all(|&b| b == 0xff));

        let mut ow = l;
        ow.overwrite_only = true;
        let bytes = ow.fill(0x00, true, Endian::Little).unwrap();
        assert!(!bytes.contains(&IMAGE_OK));
        assert!(bytes[..bytes.len() - 16].iter().all(|&b| b == 0));
    }
}
