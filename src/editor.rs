//! Adding and removing signatures on a finished image.
//!
//! Edits only touch the unprotected TLV region, and the image keeps its
//! exact size. Growth is taken from the erased padding that follows the
//! TLVs. Shrinking gives bytes back to it, so trailer fields stay at their
//! absolute offsets.
//!
//! The unprotected region is expected to look like
//!
//! ```text
//! DIGEST  [KEYID?  KEYHASH|PUBKEY  SIG]*  other records...
//! ```
//!
//! New signature units go after the last existing unit.

use std::iter;

use log::{debug, info};

use crate::digest::{allowed_hashes, HashAlg};
use crate::image::{add_public_key, PublicKeyFormat};
use crate::keys::{sign_image, SigningKey};
use crate::layout::ImageLayout;
use crate::tlv::{TlvBuilder, TlvIterator, TlvRecord, TlvType};
use crate::trailer::find_boot_magic;
use crate::{Endian, ImageError, Result};

/// One `[KEYID] key signature` group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SigUnit {
    start: usize,
    end: usize,
    key_id: Option<u32>,
}

#[derive(Debug)]
struct UnprotectedScan {
    alg: HashAlg,
    digest: Vec<u8>,
    units: Vec<SigUnit>,
    /// Where a new unit goes.
    insert_at: usize,
}

fn known_is(rec: &TlvRecord, pred: fn(TlvType) -> bool) -> bool {
    rec.tag.known().is_some_and(pred)
}

fn scan_unprotected(buf: &[u8], layout: &ImageLayout) -> Result<UnprotectedScan> {
    let endian = layout.endian;
    let mut it = layout.unprotected.records(buf, endian);

    let (alg, digest_rec) = loop {
        let rec = it.next().transpose()?.ok_or(ImageError::MissingDigest)?;
        if let Some(alg) = rec.tag.known().and_then(HashAlg::from_tlv) {
            break (alg, rec);
        }
    };

    let mut units = Vec::new();
    let mut insert_at = digest_rec.end();
    while let Some(unit) = parse_unit(&mut it, endian)? {
        insert_at = unit.end;
        units.push(unit);
    }
    debug!(
        "{} digest, {} signature unit(s), insert at 0x{:x}",
        alg,
        units.len(),
        insert_at
    );

    Ok(UnprotectedScan {
        alg,
        digest: digest_rec.value.to_vec(),
        units,
        insert_at,
    })
}

/// Parse one unit at the cursor. On anything else the cursor is rewound
/// and `None` returned.
fn parse_unit(it: &mut TlvIterator, endian: Endian) -> Result<Option<SigUnit>> {
    let start = it.offset();
    let mut key_id = None;

    let Some(mut rec) = it.next().transpose()? else {
        return Ok(None);
    };
    if let (true, Ok(raw)) = (rec.is(TlvType::KeyId), <[u8; 4]>::try_from(rec.value)) {
        key_id = Some(endian.read_u32(raw));
        match it.next().transpose()? {
            Some(next) => rec = next,
            None => {
                it.reset(start)?;
                return Ok(None);
            }
        }
    }
    if !known_is(&rec, TlvType::is_key_material) {
        it.reset(start)?;
        return Ok(None);
    }
    match it.next().transpose()? {
        Some(sig) if known_is(&sig, TlvType::is_signature) => Ok(Some(SigUnit {
            start,
            end: sig.end(),
            key_id,
        })),
        _ => {
            it.reset(start)?;
            Ok(None)
        }
    }
}

/// Erased bytes available right after the TLV regions, ending at the
/// first non-erased byte or the boot magic. Zero without a boot magic.
fn padding_slack(buf: &[u8], tlv_end: usize, endian: Endian) -> (usize, Option<u8>) {
    let Some(magic) = find_boot_magic(buf, endian) else {
        return (0, None);
    };
    if magic == 0 || magic < tlv_end {
        return (0, None);
    }
    let erased = buf[magic - 1];
    let run = buf[tlv_end..magic]
        .iter()
        .take_while(|&&b| b == erased)
        .count();
    (run, Some(erased))
}

fn set_unprotected_len(buf: &mut [u8], layout: &ImageLayout, total: usize) -> Result<()> {
    let total = u16::try_from(total).map_err(|_| ImageError::TlvTooLarge(total))?;
    let at = layout.unprotected.offset + 2;
    buf[at..at + 2].copy_from_slice(&layout.endian.u16_bytes(total));
    Ok(())
}

/// Re-scan the edited buffer and install it if its size is unchanged.
fn commit(image: &mut Vec<u8>, edited: Vec<u8>) -> Result<()> {
    ImageLayout::scan(&edited)?;
    if edited.len() != image.len() {
        return Err(ImageError::SizeChanged {
            before: image.len(),
            after: edited.len(),
        });
    }
    *image = edited;
    Ok(())
}

/// Sign an existing image with one more key.
///
/// The new unit is written after the last signature unit, or right after
/// the digest when there is none.
pub fn sign_append(
    image: &mut Vec<u8>,
    key: &dyn SigningKey,
    key_id: Option<u32>,
    format: PublicKeyFormat,
) -> Result<()> {
    let layout = ImageLayout::scan(image)?;
    let endian = layout.endian;
    let scan = scan_unprotected(image, &layout)?;

    if !allowed_hashes(key.family(), false).contains(&scan.alg) {
        return Err(ImageError::KeyMismatch {
            tlv: scan.alg.tlv(),
        });
    }

    if layout.header.is_encrypted() && key.signs_payload() {
        return Err(ImageError::Usage(format!(
            "{} keys sign the plaintext payload, which an encrypted image no longer holds",
            key.family()
        )));
    }

    let sig = sign_image(key, &image[..layout.hash_region_end()], &scan.digest)?;
    let mut unit = TlvBuilder::new(endian);
    if let Some(id) = key_id {
        unit.add(TlvType::KeyId, &endian.u32_bytes(id))?;
    }
    add_public_key(&mut unit, key.verifying_key(), format, scan.alg)?;
    unit.add(key.sig_tlv(), &sig)?;
    let unit = unit.records().to_vec();
    let delta = unit.len();

    let tlv_end = layout.tlv_end();
    let (available, _) = padding_slack(image, tlv_end, endian);
    if available < delta {
        return Err(ImageError::InsufficientPadding {
            needed: delta,
            available,
        });
    }

    let mut edited = image.clone();
    edited.drain(tlv_end..tlv_end + delta);
    edited.splice(scan.insert_at..scan.insert_at, unit);
    set_unprotected_len(&mut edited, &layout, layout.unprotected.total_len + delta)?;
    commit(image, edited)?;

    info!(
        "appended {} signature{} ({delta} bytes)",
        key.family(),
        key_id.map(|id| format!(" with key id {id}")).unwrap_or_default()
    );
    Ok(())
}

/// Remove the signature unit carrying `key_id`.
pub fn sign_remove(image: &mut Vec<u8>, key_id: u32) -> Result<()> {
    let layout = ImageLayout::scan(image)?;
    let endian = layout.endian;
    let scan = scan_unprotected(image, &layout)?;

    let unit = scan
        .units
        .iter()
        .find(|u| u.key_id == Some(key_id))
        .ok_or(ImageError::KeyIdNotFound(key_id))?;
    let delta = unit.end - unit.start;

    let tlv_end = layout.tlv_end();
    let (available, erased) = padding_slack(image, tlv_end, endian);
    let Some(erased) = erased else {
        return Err(ImageError::InsufficientPadding {
            needed: delta,
            available,
        });
    };

    let mut edited = image.clone();
    edited.drain(unit.start..unit.end);
    let new_end = tlv_end - delta;
    edited.splice(new_end..new_end, iter::repeat(erased).take(delta));
    set_unprotected_len(&mut edited, &layout, layout.unprotected.total_len - delta)?;
    commit(image, edited)?;

    info!("removed signature with key id {key_id} ({delta} bytes)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encrypt::AesKeyLen;
    use crate::image::{CreateOptions, Encryption, Image, ImageConfig};
    use crate::keys::fixtures;
    use crate::keys::{EcdsaP256Key, Ed25519Key, EncryptionKey, VerifyingKey};
    use crate::tlv::TlvTag;
    use crate::verify::{verify_image, VerifyResult};

    const SLOT: usize = 0x2000;

    fn padded(opts: &CreateOptions) -> Vec<u8> {
        let config = ImageConfig::builder()
            .pad_header(true)
            .slot_size(SLOT)
            .align(8)
            .confirm(true)
            .build();
        let mut image = Image::new(config).unwrap();
        image.load_bytes(&[0x5a; 0x300]).unwrap();
        image.create(opts).unwrap();
        image.pad_to(SLOT).unwrap();
        image.payload().to_vec()
    }

    fn tags(buf: &[u8]) -> Vec<TlvTag> {
        let layout = ImageLayout::scan(buf).unwrap();
        layout
            .unprotected
            .records(buf, layout.endian)
            .map(|r| r.unwrap().tag)
            .collect()
    }

    #[test]
    fn append_then_remove_restores_image() {
        let first = fixtures::p256();
        let original = padded(&CreateOptions {
            key_ids: vec![1],
            ..CreateOptions::with_key(&first)
        });

        let second = Ed25519Key::generate();
        let mut img = original.clone();
        sign_append(&mut img, &second, Some(2), PublicKeyFormat::Hash).unwrap();
        assert_eq!(img.len(), SLOT);
        assert_eq!(
            tags(&img),
            vec![
                TlvTag::Known(TlvType::Sha256),
                TlvTag::Known(TlvType::KeyId),
                TlvTag::Known(TlvType::KeyHash),
                TlvTag::Known(TlvType::EcdsaSig),
                TlvTag::Known(TlvType::KeyId),
                TlvTag::Known(TlvType::KeyHash),
                TlvTag::Known(TlvType::Ed25519),
            ]
        );
        assert!(verify_image(&img, &[second.public()]).unwrap().is_ok());
        assert!(verify_image(&img, &[first.public()]).unwrap().is_ok());
        // Trailer untouched.
        assert_eq!(img[SLOT - 24..], original[SLOT - 24..]);

        sign_remove(&mut img, 2).unwrap();
        assert_eq!(img, original);
    }

    #[test]
    fn remove_first_of_two() {
        let a = fixtures::p256();
        let b = EcdsaP256Key::generate();
        let mut img = padded(&CreateOptions {
            keys: vec![&a, &b],
            key_ids: vec![10, 20],
            ..Default::default()
        });
        sign_remove(&mut img, 10).unwrap();
        assert_eq!(img.len(), SLOT);
        assert_eq!(
            verify_image(&img, &[a.public()]).unwrap().result,
            VerifyResult::InvalidSignature
        );
        assert!(verify_image(&img, &[b.public()]).unwrap().is_ok());
        assert!(matches!(
            sign_remove(&mut img, 10),
            Err(ImageError::KeyIdNotFound(10))
        ));
    }

    #[test]
    fn append_to_unsigned_image() {
        let mut img = padded(&CreateOptions::default());
        let key = fixtures::rsa2048();
        sign_append(&mut img, &key, None, PublicKeyFormat::Full).unwrap();
        assert_eq!(
            tags(&img),
            vec![
                TlvTag::Known(TlvType::Sha256),
                TlvTag::Known(TlvType::PubKey),
                TlvTag::Known(TlvType::Rsa2048),
            ]
        );
        assert!(verify_image(&img, &[key.public()]).unwrap().is_ok());
    }

    #[test]
    fn new_unit_goes_before_encryption_record() {
        let kek = EncryptionKey::aes_kw(&[0x42; 16]).unwrap();
        let key = fixtures::ed25519();
        let mut img = padded(&CreateOptions {
            encryption: Some(Encryption {
                key: &kek,
                key_len: AesKeyLen::Aes128,
                clear: false,
            }),
            ..CreateOptions::with_key(&key)
        });
        let other = Ed25519Key::generate();
        sign_append(&mut img, &other, Some(5), PublicKeyFormat::Hash).unwrap();
        let t = tags(&img);
        assert_eq!(t.len(), 7);
        assert_eq!(t[3], TlvTag::Known(TlvType::KeyId));
        assert_eq!(t[5], TlvTag::Known(TlvType::Ed25519));
        assert_eq!(t.last(), Some(&TlvTag::Known(TlvType::EncKw)));

        // The stored digest is of the plaintext, so the new signature
        // checks out against it.
        let layout = ImageLayout::scan(&img).unwrap();
        let recs: Vec<TlvRecord> = layout
            .unprotected
            .records(&img, layout.endian)
            .collect::<Result<_>>()
            .unwrap();
        other.public().verify(recs[5].value, recs[0].value).unwrap();

        let p256 = EcdsaP256Key::generate();
        assert!(matches!(
            sign_append(&mut img, &p256, None, PublicKeyFormat::Hash),
            Err(ImageError::Usage(_))
        ));
    }

    #[test]
    fn unpadded_image_cannot_change_size() {
        let key = fixtures::p256();
        let mut image = Image::new(ImageConfig::builder().pad_header(true).build()).unwrap();
        image.load_bytes(&[1; 64]).unwrap();
        image
            .create(&CreateOptions {
                key_ids: vec![1],
                ..CreateOptions::with_key(&key)
            })
            .unwrap();
        let mut img = image.payload().to_vec();
        let before = img.clone();

        let other = Ed25519Key::generate();
        assert!(matches!(
            sign_append(&mut img, &other, None, PublicKeyFormat::Hash),
            Err(ImageError::InsufficientPadding { available: 0, .. })
        ));
        assert!(matches!(
            sign_remove(&mut img, 1),
            Err(ImageError::InsufficientPadding { .. })
        ));
        assert_eq!(img, before);
    }

    #[test]
    fn slack_is_bounded() {
        // Overwrite-only trailer with the image right up against it.
        let config = ImageConfig::builder()
            .pad_header(true)
            .overwrite_only(true)
            .build();
        let mut image = Image::new(config).unwrap();
        image.load_bytes(&[1; 64]).unwrap();
        image.create(&CreateOptions::default()).unwrap();
        let len = image.payload().len();
        image.pad_to(len + 32 + 8).unwrap();
        let mut img = image.payload().to_vec();

        let key = fixtures::p256();
        assert!(matches!(
            sign_append(&mut img, &key, None, PublicKeyFormat::Hash),
            Err(ImageError::InsufficientPadding { .. })
        ));
    }

    #[test]
    fn pure_images_have_no_digest() {
        let key = Ed25519Key::generate();
        let mut img = padded(&CreateOptions {
            pure: true,
            ..CreateOptions::with_key(&key)
        });
        assert!(matches!(
            sign_append(&mut img, &key, None, PublicKeyFormat::Hash),
            Err(ImageError::MissingDigest)
        ));
    }

    #[test]
    fn key_must_allow_digest() {
        let mut img = padded(&CreateOptions::default());
        let key = fixtures::p384();
        assert!(matches!(
            sign_append(&mut img, &key, None, PublicKeyFormat::Hash),
            Err(ImageError::KeyMismatch {
                tlv: TlvType::Sha256
            })
        ));
    }
}
