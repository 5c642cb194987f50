//! Locating the parts of an existing image from its bytes alone.

use log::debug;

use crate::header::ImageHeader;
use crate::tlv::TlvRegion;
use crate::{Endian, ImageError, Result, IMAGE_HEADER_SIZE, TLV_INFO_MAGIC};

/// Where the header and TLV regions sit in an image buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout {
    pub endian: Endian,
    pub header: ImageHeader,
    pub protected: Option<TlvRegion>,
    pub unprotected: TlvRegion,
}

impl ImageLayout {
    /// Scan the header and TLV region headers. Byte order is detected from
    /// the image magic.
    pub fn scan(buf: &[u8]) -> Result<Self> {
        let (header, endian) = ImageHeader::detect(buf)?;
        if usize::from(header.hdr_size) < IMAGE_HEADER_SIZE {
            return Err(ImageError::InvalidHeader("header size smaller than the header"));
        }

        let mut off = usize::from(header.hdr_size) + header.img_size as usize;
        let mut region = TlvRegion::read(buf, off, endian)?;

        let protected = if region.is_protected() {
            let prot = region;
            off = prot.end();
            region = TlvRegion::read(buf, off, endian)?;
            Some(prot)
        } else {
            None
        };

        let prot_len = protected.map_or(0, |p| p.total_len);
        if usize::from(header.protect_tlv_size) != prot_len {
            return Err(ImageError::CorruptTlv {
                offset: usize::from(header.hdr_size) + header.img_size as usize,
                reason: "protected TLV size in header does not match the region",
            });
        }

        if region.magic != TLV_INFO_MAGIC {
            return Err(ImageError::InvalidTlvMagic {
                offset: off,
                found: region.magic,
            });
        }

        debug!(
            "layout: {} endian, payload ends 0x{:x}, protected {:?}, unprotected 0x{:x}..0x{:x}",
            endian,
            usize::from(header.hdr_size) + header.img_size as usize,
            protected.map(|p| p.total_len),
            region.offset,
            region.end()
        );

        Ok(Self {
            endian,
            header,
            protected,
            unprotected: region,
        })
    }

    /// End of the bytes covered by the image digest.
    pub fn hash_region_end(&self) -> usize {
        self.unprotected.offset
    }

    /// End of the last TLV region.
    pub fn tlv_end(&self) -> usize {
        self.unprotected.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::TlvBuilder;
    use crate::tlv::TlvType;
    use crate::TLV_PROT_INFO_MAGIC;

    fn image(endian: Endian, with_prot: bool) -> Vec<u8> {
        let mut prot = TlvBuilder::new(endian);
        if with_prot {
            prot.add(TlvType::SecCnt, &endian.u32_bytes(5)).unwrap();
        }
        let prot = prot.finish(TLV_PROT_INFO_MAGIC).unwrap();

        let header = ImageHeader {
            img_size: 8,
            protect_tlv_size: prot.len() as u16,
            ..Default::default()
        };
        let mut buf = header.to_bytes(endian).to_vec();
        buf.extend_from_slice(&[0x11; 8]);
        buf.extend_from_slice(&prot);
        let mut tlv = TlvBuilder::new(endian);
        tlv.add(TlvType::Sha256, &[0u8; 32]).unwrap();
        buf.extend_from_slice(&tlv.finish(TLV_INFO_MAGIC).unwrap());
        buf
    }

    #[test]
    fn finds_both_regions() {
        for endian in [Endian::Little, Endian::Big] {
            let buf = image(endian, true);
            let layout = ImageLayout::scan(&buf).unwrap();
            assert_eq!(layout.endian, endian);
            let prot = layout.protected.unwrap();
            assert_eq!(prot.offset, 40);
            assert_eq!(prot.total_len, 12);
            assert_eq!(layout.hash_region_end(), 52);
            assert_eq!(layout.tlv_end(), buf.len());
        }
    }

    #[test]
    fn protected_region_optional() {
        let buf = image(Endian::Little, false);
        let layout = ImageLayout::scan(&buf).unwrap();
        assert!(layout.protected.is_none());
        assert_eq!(layout.unprotected.offset, 40);
    }

    #[test]
    fn header_size_below_header_rejected() {
        let mut buf = image(Endian::Little, true);
        buf[8] = 16;
        assert!(matches!(
            ImageLayout::scan(&buf),
            Err(ImageError::InvalidHeader(_))
        ));
    }

    #[test]
    fn protected_size_must_match_region() {
        let mut buf = image(Endian::Little, true);
        buf[10] = 8;
        assert!(matches!(
            ImageLayout::scan(&buf),
            Err(ImageError::CorruptTlv { offset: 40, .. })
        ));

        // A header claiming protected TLVs the image does not have.
        let mut buf = image(Endian::Big, false);
        buf[11] = 12;
        let err = ImageLayout::scan(&buf).unwrap_err();
        assert!(matches!(err, ImageError::CorruptTlv { .. }));
        assert_eq!(err.class(), crate::ErrorClass::Format);
    }

    #[test]
    fn wrong_region_magic() {
        let mut buf = image(Endian::Little, false);
        buf[40] = 0x00;
        assert!(matches!(
            ImageLayout::scan(&buf),
            Err(ImageError::InvalidTlvMagic { offset: 40, found: 0x6900 })
        ));
    }
}
