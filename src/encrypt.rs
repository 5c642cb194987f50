//! Image encryption.
//!
//! A fresh random AES content key encrypts the image body (everything after
//! the header area) with AES-CTR and a zero nonce. The content key is then
//! wrapped for the device with one of four schemes and carried in an ENC*
//! TLV:
//!
//! | key         | TLV         | wrapped layout                              |
//! |-------------|-------------|---------------------------------------------|
//! | RSA         | ENCRSA2048  | RSA-OAEP(SHA-256) ciphertext                |
//! | P-256       | ENCEC256    | ephemeral point (65) ‖ HMAC (32) ‖ key      |
//! | X25519      | ENCX25519   | ephemeral key (32) ‖ HMAC (32) ‖ key        |
//! | AES-KW KEK  | ENCKW       | RFC 3394 wrap (key + 8)                     |

use ctr::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::header::{IMAGE_F_ENCRYPTED_AES128, IMAGE_F_ENCRYPTED_AES256};
use crate::keys::EncryptionKey;
use crate::tlv::TlvType;
use crate::{ImageError, Result};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// HKDF info string shared with the bootloader.
const ECIES_INFO: &[u8] = b"MCUBoot_ECIES_v1";
/// 16 bytes of AES-128 key followed by 32 bytes of HMAC key.
const ECIES_OKM_LEN: usize = 48;
const ZERO_NONCE: [u8; 16] = [0u8; 16];

/// Size of the content key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AesKeyLen {
    #[default]
    Aes128,
    Aes256,
}

impl AesKeyLen {
    pub fn from_bits(bits: u32) -> Result<Self> {
        match bits {
            128 => Ok(AesKeyLen::Aes128),
            256 => Ok(AesKeyLen::Aes256),
            n => Err(ImageError::Usage(format!(
                "encryption key length must be 128 or 256, got {n}"
            ))),
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            AesKeyLen::Aes128 => 16,
            AesKeyLen::Aes256 => 32,
        }
    }

    /// Header flag announcing this key size.
    pub fn flag(self) -> u32 {
        match self {
            AesKeyLen::Aes128 => IMAGE_F_ENCRYPTED_AES128,
            AesKeyLen::Aes256 => IMAGE_F_ENCRYPTED_AES256,
        }
    }
}

/// A wrapped content key ready to be emitted as a TLV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub tlv: TlvType,
    pub data: Vec<u8>,
}

/// Holds one content key for the lifetime of a single `create`.
pub struct Encryptor<'a> {
    key: &'a EncryptionKey,
    content_key: Vec<u8>,
}

impl<'a> Encryptor<'a> {
    /// Generate a fresh content key for `key`.
    pub fn new(key: &'a EncryptionKey, len: AesKeyLen) -> Self {
        let mut content_key = vec![0u8; len.bytes()];
        OsRng.fill_bytes(&mut content_key);
        Self { key, content_key }
    }

    #[cfg(test)]
    pub(crate) fn with_content_key(key: &'a EncryptionKey, content_key: Vec<u8>) -> Self {
        Self { key, content_key }
    }

    /// Wrap the content key for the device.
    pub fn wrap_key(&self) -> Result<WrappedKey> {
        let wrapped = match self.key {
            EncryptionKey::Rsa(public) => {
                let data = public
                    .encrypt(&mut OsRng, rsa::Oaep::new::<Sha256>(), &self.content_key)
                    .map_err(|e| ImageError::Crypto(format!("RSA-OAEP wrap failed: {e}")))?;
                WrappedKey {
                    tlv: TlvType::EncRsa2048,
                    data,
                }
            }
            EncryptionKey::P256(public) => {
                let eph = p256::ecdh::EphemeralSecret::random(&mut OsRng);
                let shared = eph.diffie_hellman(public);
                let eph_pub = {
                    use p256::elliptic_curve::sec1::ToEncodedPoint;
                    eph.public_key().to_encoded_point(false).as_bytes().to_vec()
                };
                let data = ecies_wrap(shared.raw_secret_bytes(), &eph_pub, &self.content_key)?;
                WrappedKey {
                    tlv: TlvType::EncEc256,
                    data,
                }
            }
            EncryptionKey::X25519(public) => {
                let eph = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
                let eph_pub = x25519_dalek::PublicKey::from(&eph);
                let shared = eph.diffie_hellman(public);
                let data = ecies_wrap(shared.as_bytes(), eph_pub.as_bytes(), &self.content_key)?;
                WrappedKey {
                    tlv: TlvType::EncX25519,
                    data,
                }
            }
            EncryptionKey::AesKw(kek) => WrappedKey {
                tlv: TlvType::EncKw,
                data: aes_key_wrap(kek, &self.content_key)?,
            },
        };
        debug!(
            "wrapped {}-byte content key as {} ({} bytes)",
            self.content_key.len(),
            wrapped.tlv,
            wrapped.data.len()
        );
        Ok(wrapped)
    }

    /// Encrypt the image body in place.
    pub fn encrypt_body(&self, body: &mut [u8]) -> Result<()> {
        aes_ctr(&self.content_key, body)
    }
}

/// Apply AES-CTR with a zero nonce. Encryption and decryption are the same
/// operation.
pub fn aes_ctr(key: &[u8], data: &mut [u8]) -> Result<()> {
    let bad_key = |_| ImageError::Crypto(format!("invalid AES key length {}", key.len()));
    match key.len() {
        16 => Aes128Ctr::new_from_slices(key, &ZERO_NONCE)
            .map_err(bad_key)?
            .apply_keystream(data),
        32 => Aes256Ctr::new_from_slices(key, &ZERO_NONCE)
            .map_err(bad_key)?
            .apply_keystream(data),
        n => {
            return Err(ImageError::Crypto(format!(
                "invalid AES key length {n}"
            )))
        }
    }
    Ok(())
}

/// Derive the ECIES keys from a shared secret, returning
/// `(aes_key, mac_key)`.
fn ecies_kdf(shared: &[u8]) -> Result<([u8; 16], [u8; 32])> {
    let mut okm = [0u8; ECIES_OKM_LEN];
    Hkdf::<Sha256>::new(None, shared)
        .expand(ECIES_INFO, &mut okm)
        .map_err(|e| ImageError::Crypto(format!("HKDF expand failed: {e}")))?;
    let mut aes_key = [0u8; 16];
    let mut mac_key = [0u8; 32];
    aes_key.copy_from_slice(&okm[..16]);
    mac_key.copy_from_slice(&okm[16..]);
    Ok((aes_key, mac_key))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| ImageError::Crypto(format!("HMAC key rejected: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn ecies_wrap(shared: &[u8], eph_pub: &[u8], content_key: &[u8]) -> Result<Vec<u8>> {
    let (aes_key, mac_key) = ecies_kdf(shared)?;
    let mut cipherkey = content_key.to_vec();
    aes_ctr(&aes_key, &mut cipherkey)?;
    let tag = hmac_sha256(&mac_key, &cipherkey)?;

    let mut out = Vec::with_capacity(eph_pub.len() + tag.len() + cipherkey.len());
    out.extend_from_slice(eph_pub);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&cipherkey);
    Ok(out)
}

fn aes_key_wrap(kek: &[u8], content_key: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![0u8; content_key.len() + aes_kw::IV_LEN];
    let wrap_err = |e: aes_kw::Error| ImageError::Crypto(format!("AES-KW wrap failed: {e}"));
    match kek.len() {
        16 => {
            let kek: [u8; 16] = kek
                .try_into()
                .map_err(|_| ImageError::Key("bad AES-KW key".into()))?;
            aes_kw::KekAes128::from(kek)
                .wrap(content_key, &mut out)
                .map_err(wrap_err)?;
        }
        32 => {
            let kek: [u8; 32] = kek
                .try_into()
                .map_err(|_| ImageError::Key("bad AES-KW key".into()))?;
            aes_kw::KekAes256::from(kek)
                .wrap(content_key, &mut out)
                .map_err(wrap_err)?;
        }
        n => {
            return Err(ImageError::Key(format!(
                "AES-KW key must be 16 or 32 bytes, got {n}"
            )))
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::fixtures;
    use rsa::RsaPrivateKey;

    /// Device-side ECIES unwrap, used to check the wrapped layout.
    fn ecies_unwrap(shared: &[u8], point_len: usize, wrapped: &[u8]) -> Vec<u8> {
        let (aes_key, mac_key) = ecies_kdf(shared).unwrap();
        let tag = &wrapped[point_len..point_len + 32];
        let cipherkey = &wrapped[point_len + 32..];
        assert_eq!(hmac_sha256(&mac_key, cipherkey).unwrap(), tag);
        let mut plain = cipherkey.to_vec();
        aes_ctr(&aes_key, &mut plain).unwrap();
        plain
    }

    #[test]
    fn key_len_flags() {
        assert_eq!(AesKeyLen::from_bits(256).unwrap(), AesKeyLen::Aes256);
        assert_eq!(AesKeyLen::Aes128.flag(), 0x4);
        assert_eq!(AesKeyLen::Aes256.flag(), 0x8);
        assert!(AesKeyLen::from_bits(192).is_err());
    }

    #[test]
    fn ctr_is_an_involution() {
        let key = [0x42u8; 32];
        let mut data = b"not a multiple of the block size".to_vec();
        aes_ctr(&key, &mut data).unwrap();
        assert_ne!(&data[..], b"not a multiple of the block size");
        aes_ctr(&key, &mut data).unwrap();
        assert_eq!(&data[..], b"not a multiple of the block size");
        assert!(aes_ctr(&[0u8; 24][..20], &mut data).is_err());
    }

    #[test]
    fn fresh_content_key_per_encryptor() {
        let kek = EncryptionKey::aes_kw(&[1u8; 16]).unwrap();
        let a = Encryptor::new(&kek, AesKeyLen::Aes128);
        let b = Encryptor::new(&kek, AesKeyLen::Aes128);
        assert_eq!(a.content_key.len(), 16);
        assert_ne!(a.content_key, b.content_key);
    }

    #[test]
    fn aes_kw_wrap_sizes() {
        for (kek_len, key_len, wrapped_len) in [(16, AesKeyLen::Aes128, 24), (32, AesKeyLen::Aes256, 40)] {
            let kek = EncryptionKey::aes_kw(&vec![0x5a; kek_len]).unwrap();
            let enc = Encryptor::new(&kek, key_len);
            let wrapped = enc.wrap_key().unwrap();
            assert_eq!(wrapped.tlv, TlvType::EncKw);
            assert_eq!(wrapped.data.len(), wrapped_len);
        }
    }

    #[test]
    fn aes_kw_rfc3394_vector() {
        // RFC 3394 section 4.1.
        let kek: Vec<u8> = (0x00..=0x0f).collect();
        let key: Vec<u8> = (0..16).map(|i| (i * 0x11) as u8).collect();
        let wrapped = aes_key_wrap(&kek, &key).unwrap();
        assert_eq!(
            wrapped,
            [
                0x1f, 0xa6, 0x8b, 0x0a, 0x81, 0x12, 0xb4, 0x47, 0xae, 0xf3, 0x4b, 0xd8, 0xfb,
                0x5a, 0x7b, 0x82, 0x9d, 0x3e, 0x86, 0x23, 0x71, 0xd2, 0xcf, 0xe5
            ]
        );
    }

    #[test]
    fn rsa_oaep_unwraps_with_private_key() {
        let private = {
            use pkcs8::DecodePrivateKey;
            RsaPrivateKey::from_pkcs8_pem(fixtures::RSA2048_PEM).unwrap()
        };
        let key = EncryptionKey::Rsa(private.to_public_key());
        let enc = Encryptor::with_content_key(&key, vec![9u8; 16]);
        let wrapped = enc.wrap_key().unwrap();
        assert_eq!(wrapped.tlv, TlvType::EncRsa2048);
        assert_eq!(wrapped.data.len(), 256);
        let plain = private.decrypt(rsa::Oaep::new::<Sha256>(), &wrapped.data).unwrap();
        assert_eq!(plain, vec![9u8; 16]);
    }

    #[test]
    fn ecies_p256_layout() {
        let device = p256::SecretKey::random(&mut OsRng);
        let key = EncryptionKey::P256(device.public_key());
        for len in [AesKeyLen::Aes128, AesKeyLen::Aes256] {
            let enc = Encryptor::new(&key, len);
            let wrapped = enc.wrap_key().unwrap();
            assert_eq!(wrapped.tlv, TlvType::EncEc256);
            assert_eq!(wrapped.data.len(), 65 + 32 + len.bytes());
            assert_eq!(wrapped.data[0], 0x04);

            let eph = p256::PublicKey::from_sec1_bytes(&wrapped.data[..65]).unwrap();
            let shared = p256::ecdh::diffie_hellman(device.to_nonzero_scalar(), eph.as_affine());
            let plain = ecies_unwrap(shared.raw_secret_bytes(), 65, &wrapped.data);
            assert_eq!(plain, enc.content_key);
        }
    }

    #[test]
    fn ecies_x25519_layout() {
        let device = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let key = EncryptionKey::X25519(x25519_dalek::PublicKey::from(&device));
        for len in [AesKeyLen::Aes128, AesKeyLen::Aes256] {
            let enc = Encryptor::new(&key, len);
            let wrapped = enc.wrap_key().unwrap();
            assert_eq!(wrapped.tlv, TlvType::EncX25519);
            assert_eq!(wrapped.data.len(), 32 + 32 + len.bytes());

            let eph: [u8; 32] = wrapped.data[..32].try_into().unwrap();
            let shared = device.diffie_hellman(&x25519_dalek::PublicKey::from(eph));
            let plain = ecies_unwrap(shared.as_bytes(), 32, &wrapped.data);
            assert_eq!(plain, enc.content_key);
        }
    }

    #[test]
    fn body_encryption_roundtrip() {
        let kek = EncryptionKey::aes_kw(&[3u8; 32]).unwrap();
        let enc = Encryptor::new(&kek, AesKeyLen::Aes256);
        let mut body = vec![0xa5u8; 100];
        enc.encrypt_body(&mut body).unwrap();
        assert_ne!(body, vec![0xa5u8; 100]);
        aes_ctr(&enc.content_key, &mut body).unwrap();
        assert_eq!(body, vec![0xa5u8; 100]);
    }
}
