//! Type-length-value records and the two TLV regions that follow the
//! payload.
//!
//! A region starts with a 4-byte info header (`magic`, `total_len`) where
//! `total_len` includes the info header itself. Records follow back to back.
//! Predefined tags are written as `[tag, 0, len]` so that a little- or
//! big-endian bootloader reads the same one-byte tag; vendor tags are a
//! full u16 in the image byte order.

use std::fmt;

use crate::{
    bytes_at, enum_with_table, Endian, ImageError, Result, TLV_INFO_MAGIC, TLV_INFO_SIZE,
    TLV_PROT_INFO_MAGIC, TLV_SIZE,
};

/// Lowest tag value available to vendor TLVs.
pub const VENDOR_TLV_MIN: u16 = 0x00a0;
/// Highest tag value available to vendor TLVs.
pub const VENDOR_TLV_MAX: u16 = 0xfffe;

enum_with_table! {
    /// Predefined TLV tags.
    pub enum TlvType : "TLV type" {
        KeyHash          = 0x01, "KEYHASH",          "Hash of the public key",
        PubKey           = 0x02, "PUBKEY",           "Public key",
        KeyId            = 0x03, "KEYID",            "Key identifier",
        Sha256           = 0x10, "SHA256",           "SHA-256 image digest",
        Sha384           = 0x11, "SHA384",           "SHA-384 image digest",
        Sha512           = 0x12, "SHA512",           "SHA-512 image digest",
        Rsa2048          = 0x20, "RSA2048",          "RSA-2048 PSS signature",
        EcdsaSig         = 0x22, "ECDSASIG",         "ECDSA signature",
        Rsa3072          = 0x23, "RSA3072",          "RSA-3072 PSS signature",
        Ed25519          = 0x24, "ED25519",          "Ed25519 signature",
        SigPure          = 0x25, "SIG_PURE",         "Signature covers the image, not its digest",
        EncRsa2048       = 0x30, "ENCRSA2048",       "Content key wrapped with RSA-OAEP",
        EncKw            = 0x31, "ENCKW",            "Content key wrapped with AES-KW",
        EncEc256         = 0x32, "ENCEC256",         "Content key wrapped with ECIES-P256",
        EncX25519        = 0x33, "ENCX25519",        "Content key wrapped with ECIES-X25519",
        Dependency       = 0x40, "DEPENDENCY",       "Image dependency",
        SecCnt           = 0x50, "SEC_CNT",          "Security counter",
        BootRecord       = 0x60, "BOOT_RECORD",      "Measured boot record",
        DecompSize       = 0x70, "DECOMP_SIZE",      "Size of the decompressed image",
        DecompSha        = 0x71, "DECOMP_SHA",       "Digest of the decompressed image",
        DecompSignature  = 0x72, "DECOMP_SIGNATURE", "Signature of the decompressed image",
    }
}

impl TlvType {
    pub fn is_digest(self) -> bool {
        matches!(self, TlvType::Sha256 | TlvType::Sha384 | TlvType::Sha512)
    }

    pub fn is_signature(self) -> bool {
        matches!(
            self,
            TlvType::Rsa2048 | TlvType::EcdsaSig | TlvType::Rsa3072 | TlvType::Ed25519
        )
    }

    pub fn is_key_material(self) -> bool {
        matches!(self, TlvType::KeyHash | TlvType::PubKey)
    }
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

/// A TLV tag as found in an image: predefined, or a raw u16 from the
/// vendor range (or any other value the table does not know).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlvTag {
    Known(TlvType),
    Vendor(u16),
}

impl TlvTag {
    /// A vendor tag, checked against the vendor range.
    pub fn vendor(tag: u16) -> Result<Self> {
        if !(VENDOR_TLV_MIN..=VENDOR_TLV_MAX).contains(&tag) {
            return Err(ImageError::VendorTagOutOfRange(tag));
        }
        Ok(TlvTag::Vendor(tag))
    }

    /// A vendor tag must be in range and must not encode as `[known, 0]`,
    /// which a reader would take for the predefined tag.
    fn check_writable(self, endian: Endian) -> Result<()> {
        let TlvTag::Vendor(tag) = self else {
            return Ok(());
        };
        TlvTag::vendor(tag)?;
        if let [first, 0] = endian.u16_bytes(tag) {
            if TlvType::from_u8(first).is_some() {
                return Err(ImageError::CustomTlvConflict(tag));
            }
        }
        Ok(())
    }

    /// A predefined tag by its table name, e.g. `"SHA256"`.
    pub fn from_name(name: &str) -> Result<Self> {
        TlvType::parse_name(name).map(TlvTag::Known)
    }

    pub fn value(self) -> u16 {
        match self {
            TlvTag::Known(t) => t as u16,
            TlvTag::Vendor(v) => v,
        }
    }

    pub fn known(self) -> Option<TlvType> {
        match self {
            TlvTag::Known(t) => Some(t),
            TlvTag::Vendor(_) => None,
        }
    }

    fn encode(self, endian: Endian) -> [u8; 2] {
        match self {
            TlvTag::Known(t) => [t as u8, 0],
            TlvTag::Vendor(v) => endian.u16_bytes(v),
        }
    }

    /// Predefined wins: a zero second byte over a known one-byte tag is
    /// always read as that tag.
    fn decode(raw: [u8; 2], endian: Endian) -> Self {
        if raw[1] == 0 {
            if let Some(t) = TlvType::from_u8(raw[0]) {
                return TlvTag::Known(t);
            }
        }
        TlvTag::Vendor(endian.read_u16(raw))
    }
}

impl From<TlvType> for TlvTag {
    fn from(t: TlvType) -> Self {
        TlvTag::Known(t)
    }
}

impl fmt::Display for TlvTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlvTag::Known(t) => write!(f, "{t}"),
            TlvTag::Vendor(v) => write!(f, "0x{v:04x}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A record borrowed from an image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvRecord<'a> {
    pub tag: TlvTag,
    /// Offset of the record header within the buffer.
    pub offset: usize,
    pub value: &'a [u8],
}

impl TlvRecord<'_> {
    pub fn is(&self, t: TlvType) -> bool {
        self.tag == TlvTag::Known(t)
    }

    /// Offset just past the record.
    pub fn end(&self) -> usize {
        self.offset + TLV_SIZE + self.value.len()
    }
}

/// Encode a single record. Vendor tags that would not read back as
/// themselves are rejected.
pub fn encode_record(endian: Endian, tag: TlvTag, value: &[u8]) -> Result<Vec<u8>> {
    tag.check_writable(endian)?;
    let len = u16::try_from(value.len()).map_err(|_| ImageError::TlvTooLarge(value.len()))?;
    let mut out = Vec::with_capacity(TLV_SIZE + value.len());
    out.extend_from_slice(&tag.encode(endian));
    out.extend_from_slice(&endian.u16_bytes(len));
    out.extend_from_slice(value);
    Ok(out)
}

/// Encode a region info header.
pub fn encode_info(endian: Endian, magic: u16, total_len: u16) -> [u8; TLV_INFO_SIZE] {
    let mut out = [0u8; TLV_INFO_SIZE];
    out[0..2].copy_from_slice(&endian.u16_bytes(magic));
    out[2..4].copy_from_slice(&endian.u16_bytes(total_len));
    out
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Accumulates records for one region.
#[derive(Debug, Clone)]
pub struct TlvBuilder {
    endian: Endian,
    buf: Vec<u8>,
}

impl TlvBuilder {
    pub fn new(endian: Endian) -> Self {
        Self {
            endian,
            buf: Vec::new(),
        }
    }

    pub fn add(&mut self, tag: impl Into<TlvTag>, value: &[u8]) -> Result<()> {
        let rec = encode_record(self.endian, tag.into(), value)?;
        self.buf.extend_from_slice(&rec);
        Ok(())
    }

    /// Add a record by predefined tag name.
    pub fn add_named(&mut self, name: &str, value: &[u8]) -> Result<()> {
        self.add(TlvTag::from_name(name)?, value)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Size of the finished region, including its info header, or 0 if no
    /// records were added.
    pub fn region_len(&self) -> usize {
        if self.buf.is_empty() {
            0
        } else {
            TLV_INFO_SIZE + self.buf.len()
        }
    }

    /// The encoded records without an info header.
    pub fn records(&self) -> &[u8] {
        &self.buf
    }

    /// Emit the region. An empty builder produces no bytes at all.
    pub fn finish(&self, magic: u16) -> Result<Vec<u8>> {
        if self.buf.is_empty() {
            return Ok(Vec::new());
        }
        let total = self.region_len();
        let total_len = u16::try_from(total).map_err(|_| ImageError::TlvTooLarge(total))?;
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&encode_info(self.endian, magic, total_len));
        out.extend_from_slice(&self.buf);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Regions
// ---------------------------------------------------------------------------

/// Location of a TLV region within an image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvRegion {
    pub magic: u16,
    /// Offset of the info header.
    pub offset: usize,
    /// Length including the info header.
    pub total_len: usize,
}

impl TlvRegion {
    /// Read the info header at `offset`, checking the region fits in `buf`.
    /// The magic is not validated here.
    pub fn read(buf: &[u8], offset: usize, endian: Endian) -> Result<Self> {
        if offset + TLV_INFO_SIZE > buf.len() {
            return Err(ImageError::TooSmall {
                size: buf.len(),
                min: offset + TLV_INFO_SIZE,
            });
        }
        let magic = endian.read_u16(bytes_at(buf, offset)?);
        let total_len = usize::from(endian.read_u16(bytes_at(buf, offset + 2)?));
        if total_len < TLV_INFO_SIZE {
            return Err(ImageError::CorruptTlv {
                offset,
                reason: "region length smaller than its header",
            });
        }
        if offset + total_len > buf.len() {
            return Err(ImageError::CorruptTlv {
                offset,
                reason: "region runs past end of image",
            });
        }
        Ok(Self {
            magic,
            offset,
            total_len,
        })
    }

    pub fn is_protected(&self) -> bool {
        self.magic == TLV_PROT_INFO_MAGIC
    }

    pub fn is_unprotected(&self) -> bool {
        self.magic == TLV_INFO_MAGIC
    }

    pub fn body_start(&self) -> usize {
        self.offset + TLV_INFO_SIZE
    }

    pub fn end(&self) -> usize {
        self.offset + self.total_len
    }

    pub fn records<'a>(&self, buf: &'a [u8], endian: Endian) -> TlvIterator<'a> {
        TlvIterator {
            buf,
            endian,
            start: self.body_start(),
            pos: self.body_start(),
            end: self.end(),
        }
    }
}

// ---------------------------------------------------------------------------
// Iterator
// ---------------------------------------------------------------------------

/// Cursor over the records of one region. Supports peeking and rewinding so
/// callers can parse speculatively.
#[derive(Debug, Clone)]
pub struct TlvIterator<'a> {
    buf: &'a [u8],
    endian: Endian,
    start: usize,
    pos: usize,
    end: usize,
}

impl<'a> TlvIterator<'a> {
    pub fn new(buf: &'a [u8], start: usize, end: usize, endian: Endian) -> Result<Self> {
        if start > end || end > buf.len() {
            return Err(ImageError::CorruptTlv {
                offset: start,
                reason: "record range outside buffer",
            });
        }
        Ok(Self {
            buf,
            endian,
            start,
            pos: start,
            end,
        })
    }

    /// Offset of the next record.
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Move the cursor back (or forward) to a record boundary.
    pub fn reset(&mut self, offset: usize) -> Result<()> {
        if offset < self.start || offset > self.end {
            return Err(ImageError::CorruptTlv {
                offset,
                reason: "cursor outside region",
            });
        }
        self.pos = offset;
        Ok(())
    }

    /// Decode the next record without advancing.
    pub fn peek(&self) -> Result<Option<TlvRecord<'a>>> {
        if self.pos == self.end {
            return Ok(None);
        }
        if self.pos + TLV_SIZE > self.end {
            return Err(ImageError::CorruptTlv {
                offset: self.pos,
                reason: "truncated record header",
            });
        }
        let tag = TlvTag::decode(bytes_at(self.buf, self.pos)?, self.endian);
        let len = usize::from(self.endian.read_u16(bytes_at(self.buf, self.pos + 2)?));
        let value_start = self.pos + TLV_SIZE;
        if value_start + len > self.end {
            return Err(ImageError::CorruptTlv {
                offset: self.pos,
                reason: "record length runs past region end",
            });
        }
        Ok(Some(TlvRecord {
            tag,
            offset: self.pos,
            value: &self.buf[value_start..value_start + len],
        }))
    }
}

impl<'a> Iterator for TlvIterator<'a> {
    type Item = Result<TlvRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.peek() {
            Ok(Some(rec)) => {
                self.pos = rec.end();
                Some(Ok(rec))
            }
            Ok(None) => None,
            Err(e) => {
                self.pos = self.end;
                Some(Err(e))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
