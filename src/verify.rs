//! Checking a finished image against a set of public keys.

use std::fmt;
use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::digest::{allowed_hashes, HashAlg};
use crate::header::ImageVersion;
use crate::keys::{KeyFamily, VerifyingKey};
use crate::layout::ImageLayout;
use crate::tlv::{TlvRecord, TlvType};
use crate::{ImageError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyResult {
    Ok,
    /// The digest TLV does not match the hashed region.
    InvalidHash,
    /// No signature validated with any supplied key.
    InvalidSignature,
}

impl fmt::Display for VerifyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyResult::Ok => write!(f, "OK"),
            VerifyResult::InvalidHash => write!(f, "invalid hash"),
            VerifyResult::InvalidSignature => write!(f, "invalid signature"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub result: VerifyResult,
    pub version: ImageVersion,
    /// Digest of the hashed region; `None` for pure images.
    pub digest: Option<Vec<u8>>,
}

impl Verification {
    pub fn is_ok(&self) -> bool {
        self.result == VerifyResult::Ok
    }
}

/// Verify an image file.
pub fn verify_file(path: impl AsRef<Path>, keys: &[&dyn VerifyingKey]) -> Result<Verification> {
    let path = path.as_ref();
    let buf = fs::read(path)?;
    if buf.is_empty() {
        return Err(ImageError::EmptyInput(path.display().to_string()));
    }
    let v = verify_image(&buf, keys)?;
    info!("{}: {} (version {})", path.display(), v.result, v.version);
    Ok(v)
}

/// Verify `buf` against `keys`.
///
/// With no keys only the digest is checked. Structural problems are
/// returned as errors; a well-formed image that fails a check yields a
/// [`Verification`] with the failing result.
pub fn verify_image(buf: &[u8], keys: &[&dyn VerifyingKey]) -> Result<Verification> {
    let layout = ImageLayout::scan(buf)?;
    let endian = layout.endian;
    let version = layout.header.version;
    let hashed = &buf[..layout.hash_region_end()];

    let records = layout
        .unprotected
        .records(buf, endian)
        .collect::<Result<Vec<TlvRecord>>>()?;
    let pure = records.iter().any(|r| r.is(TlvType::SigPure));

    let done = |result, digest| {
        Ok(Verification {
            result,
            version,
            digest,
        })
    };

    let mut candidates: Vec<&dyn VerifyingKey> = keys.to_vec();
    let mut digest: Option<Vec<u8>> = None;

    for rec in &records {
        let Some(tlv) = rec.tag.known() else {
            continue;
        };

        if tlv.is_digest() && !pure {
            let Some(alg) = HashAlg::from_tlv(tlv) else {
                continue;
            };
            if !keys.is_empty() {
                candidates.retain(|k| allowed_hashes(k.family(), false).contains(&alg));
                if candidates.is_empty() {
                    return Err(ImageError::KeyMismatch { tlv });
                }
            }
            let computed = alg.digest(hashed);
            if computed != rec.value {
                debug!("{tlv} mismatch at 0x{:x}", rec.offset);
                return done(VerifyResult::InvalidHash, Some(rec.value.to_vec()));
            }
            debug!("{tlv} matches");
            if keys.is_empty() {
                return done(VerifyResult::Ok, Some(computed));
            }
            digest = Some(computed);
        } else if tlv.is_signature() {
            for key in candidates.iter().filter(|k| k.sig_tlv() == tlv) {
                if pure {
                    if key.family() != KeyFamily::Ed25519 {
                        continue;
                    }
                    match key.verify(rec.value, hashed) {
                        Ok(()) => return done(VerifyResult::Ok, None),
                        Err(e) => debug!("pure {tlv} at 0x{:x}: {e}", rec.offset),
                    }
                    continue;
                }

                let Some(d) = digest.as_deref() else {
                    debug!("{tlv} at 0x{:x} precedes the digest, skipped", rec.offset);
                    continue;
                };
                let message = if key.signs_payload() { hashed } else { d };
                match key.verify(rec.value, message) {
                    Ok(()) => {
                        debug!("{tlv} at 0x{:x} verified with {} key", rec.offset, key.family());
                        return done(VerifyResult::Ok, digest.clone());
                    }
                    Err(e) => debug!("{tlv} at 0x{:x}: {e}", rec.offset),
                }
            }
        }
    }

    done(VerifyResult::InvalidSignature, digest)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
