//! Signing, verification and encryption keys.
//!
//! The image builder, editor and verifier only see the capability traits
//! [`SigningKey`] and [`VerifyingKey`]; each key family implements them on
//! top of the RustCrypto / dalek crates (pure Rust, no OpenSSL).

use std::fs;
use std::path::Path;

use log::debug;
use rand::rngs::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use signature::SignatureEncoding;

use crate::tlv::TlvType;
use crate::{enum_with_table, ImageError, Result};

enum_with_table! {
    /// Key families understood by the image format.
    pub enum KeyFamily : "key family" {
        Rsa2048   = 1, "rsa-2048",   "RSA-2048",
        Rsa3072   = 2, "rsa-3072",   "RSA-3072",
        EcdsaP256 = 3, "ecdsa-p256", "ECDSA P-256",
        EcdsaP384 = 4, "ecdsa-p384", "ECDSA P-384",
        Ed25519   = 5, "ed25519",    "Ed25519",
        X25519    = 6, "x25519",     "X25519",
        AesKw     = 7, "aes-kw",     "AES key wrap",
    }
}

impl KeyFamily {
    /// The signature TLV written for this family, if it can sign.
    pub fn sig_tlv(self) -> Option<TlvType> {
        match self {
            KeyFamily::Rsa2048 => Some(TlvType::Rsa2048),
            KeyFamily::Rsa3072 => Some(TlvType::Rsa3072),
            KeyFamily::EcdsaP256 | KeyFamily::EcdsaP384 => Some(TlvType::EcdsaSig),
            KeyFamily::Ed25519 => Some(TlvType::Ed25519),
            KeyFamily::X25519 | KeyFamily::AesKw => None,
        }
    }

    /// Whether images signed by `self` may carry a content key wrapped for
    /// `enc`.
    pub fn accepts_encryption(self, enc: KeyFamily) -> bool {
        matches!(
            (self, enc),
            (KeyFamily::Rsa2048 | KeyFamily::Rsa3072, KeyFamily::Rsa2048)
                | (KeyFamily::EcdsaP256, KeyFamily::EcdsaP256)
                | (KeyFamily::Ed25519, KeyFamily::X25519)
                | (_, KeyFamily::AesKw)
        )
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Public half of a signing key.
pub trait VerifyingKey {
    fn family(&self) -> KeyFamily;

    /// Public key as stored in a PUBKEY TLV (and hashed for KEYHASH).
    fn public_bytes(&self) -> Result<Vec<u8>>;

    fn sig_tlv(&self) -> TlvType;

    /// Maximum encoded signature length.
    fn sig_len(&self) -> usize;

    /// `true` when the scheme hashes internally and signs the hashed
    /// region itself; `false` when it signs the image digest.
    fn signs_payload(&self) -> bool;

    fn verify(&self, signature: &[u8], message: &[u8]) -> Result<()>;
}

/// A private key able to sign images.
pub trait SigningKey: VerifyingKey {
    /// Sign the hashed region (header, payload, protected TLVs).
    fn sign(&self, _payload: &[u8]) -> Result<Vec<u8>> {
        Err(ImageError::Key(format!(
            "{} keys sign the image digest, not the payload",
            self.family()
        )))
    }

    /// Sign a precomputed image digest.
    fn sign_digest(&self, _digest: &[u8]) -> Result<Vec<u8>> {
        Err(ImageError::Key(format!(
            "{} keys sign the payload, not a digest",
            self.family()
        )))
    }

    fn verifying_key(&self) -> &dyn VerifyingKey;
}

/// Sign with whichever input the key's scheme takes.
pub fn sign_image(key: &dyn SigningKey, payload: &[u8], digest: &[u8]) -> Result<Vec<u8>> {
    if key.signs_payload() {
        key.sign(payload)
    } else {
        key.sign_digest(digest)
    }
}

/// Zero-pad an ECDSA signature to the key's fixed length, the form
/// bootloaders older than 1.5 expect. Other families are left alone.
pub fn pad_signature(key: &dyn VerifyingKey, mut sig: Vec<u8>) -> Vec<u8> {
    let ecdsa = matches!(key.family(), KeyFamily::EcdsaP256 | KeyFamily::EcdsaP384);
    if ecdsa && sig.len() < key.sig_len() {
        sig.resize(key.sig_len(), 0);
    }
    sig
}

/// The DER sequence at the front of a possibly padded ECDSA signature.
fn der_sequence(sig: &[u8]) -> &[u8] {
    match sig {
        [0x30, len, ..] => &sig[..(usize::from(*len) + 2).min(sig.len())],
        _ => sig,
    }
}

fn key_err(what: &str, e: impl std::fmt::Display) -> ImageError {
    ImageError::Key(format!("{what}: {e}"))
}

fn bad_signature(e: impl std::fmt::Display) -> ImageError {
    ImageError::Crypto(format!("signature rejected: {e}"))
}

// ---------------------------------------------------------------------------
// RSA (PSS, SHA-256)
// ---------------------------------------------------------------------------

fn rsa_family(modulus_bytes: usize) -> Result<KeyFamily> {
    match modulus_bytes {
        256 => Ok(KeyFamily::Rsa2048),
        384 => Ok(KeyFamily::Rsa3072),
        n => Err(ImageError::Key(format!(
            "unsupported RSA key size: {} bits",
            n * 8
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct RsaPublic {
    key: RsaPublicKey,
    family: KeyFamily,
}

impl RsaPublic {
    pub fn new(key: RsaPublicKey) -> Result<Self> {
        let family = rsa_family(key.size())?;
        Ok(Self { key, family })
    }

    pub fn key(&self) -> &RsaPublicKey {
        &self.key
    }
}

impl VerifyingKey for RsaPublic {
    fn family(&self) -> KeyFamily {
        self.family
    }

    fn public_bytes(&self) -> Result<Vec<u8>> {
        use pkcs1::EncodeRsaPublicKey;
        let der = self
            .key
            .to_pkcs1_der()
            .map_err(|e| key_err("encode RSA public key", e))?;
        Ok(der.as_bytes().to_vec())
    }

    fn sig_tlv(&self) -> TlvType {
        match self.family {
            KeyFamily::Rsa3072 => TlvType::Rsa3072,
            _ => TlvType::Rsa2048,
        }
    }

    fn sig_len(&self) -> usize {
        self.key.size()
    }

    fn signs_payload(&self) -> bool {
        true
    }

    fn verify(&self, sig: &[u8], message: &[u8]) -> Result<()> {
        use signature::Verifier;
        let vk = rsa::pss::VerifyingKey::<sha2::Sha256>::new(self.key.clone());
        let sig = rsa::pss::Signature::try_from(sig).map_err(bad_signature)?;
        vk.verify(message, &sig).map_err(bad_signature)
    }
}

#[derive(Debug, Clone)]
pub struct RsaKey {
    key: RsaPrivateKey,
    public: RsaPublic,
}

impl RsaKey {
    pub fn new(key: RsaPrivateKey) -> Result<Self> {
        let public = RsaPublic::new(key.to_public_key())?;
        Ok(Self { key, public })
    }

    /// Parse a PKCS#8 or PKCS#1 PEM private key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = if pem.contains("BEGIN RSA PRIVATE KEY") {
            use pkcs1::DecodeRsaPrivateKey;
            RsaPrivateKey::from_pkcs1_pem(pem).map_err(|e| key_err("PKCS#1 RSA key", e))?
        } else {
            use pkcs8::DecodePrivateKey;
            RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| key_err("PKCS#8 RSA key", e))?
        };
        Self::new(key)
    }

    pub fn public(&self) -> &RsaPublic {
        &self.public
    }
}

impl VerifyingKey for RsaKey {
    fn family(&self) -> KeyFamily {
        self.public.family()
    }
    fn public_bytes(&self) -> Result<Vec<u8>> {
        self.public.public_bytes()
    }
    fn sig_tlv(&self) -> TlvType {
        self.public.sig_tlv()
    }
    fn sig_len(&self) -> usize {
        self.public.sig_len()
    }
    fn signs_payload(&self) -> bool {
        true
    }
    fn verify(&self, sig: &[u8], message: &[u8]) -> Result<()> {
        self.public.verify(sig, message)
    }
}

impl SigningKey for RsaKey {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        use signature::RandomizedSigner;
        let sk = rsa::pss::BlindedSigningKey::<sha2::Sha256>::new(self.key.clone());
        let sig = sk
            .try_sign_with_rng(&mut OsRng, payload)
            .map_err(|e| ImageError::Crypto(format!("RSA-PSS signing failed: {e}")))?;
        Ok(sig.to_vec())
    }

    fn verifying_key(&self) -> &dyn VerifyingKey {
        self
    }
}

// ---------------------------------------------------------------------------
// ECDSA P-256 / P-384 (DER signatures)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EcdsaP256Public(p256::ecdsa::VerifyingKey);

impl EcdsaP256Public {
    pub fn new(key: p256::ecdsa::VerifyingKey) -> Self {
        Self(key)
    }
}

impl VerifyingKey for EcdsaP256Public {
    fn family(&self) -> KeyFamily {
        KeyFamily::EcdsaP256
    }

    fn public_bytes(&self) -> Result<Vec<u8>> {
        use p256::pkcs8::EncodePublicKey;
        let der = self
            .0
            .to_public_key_der()
            .map_err(|e| key_err("encode P-256 public key", e))?;
        Ok(der.as_bytes().to_vec())
    }

    fn sig_tlv(&self) -> TlvType {
        TlvType::EcdsaSig
    }

    fn sig_len(&self) -> usize {
        72
    }

    fn signs_payload(&self) -> bool {
        true
    }

    fn verify(&self, sig: &[u8], message: &[u8]) -> Result<()> {
        use p256::ecdsa::signature::Verifier;
        let sig =
            p256::ecdsa::DerSignature::try_from(der_sequence(sig)).map_err(bad_signature)?;
        self.0.verify(message, &sig).map_err(bad_signature)
    }
}

#[derive(Debug, Clone)]
pub struct EcdsaP256Key {
    key: p256::ecdsa::SigningKey,
    public: EcdsaP256Public,
}

impl EcdsaP256Key {
    pub fn new(key: p256::ecdsa::SigningKey) -> Self {
        let public = EcdsaP256Public(p256::ecdsa::VerifyingKey::from(&key));
        Self { key, public }
    }

    pub fn generate() -> Self {
        Self::new(p256::ecdsa::SigningKey::random(&mut OsRng))
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        use p256::pkcs8::DecodePrivateKey;
        let key = p256::ecdsa::SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| key_err("P-256 key", e))?;
        Ok(Self::new(key))
    }

    pub fn public(&self) -> &EcdsaP256Public {
        &self.public
    }
}

impl VerifyingKey for EcdsaP256Key {
    fn family(&self) -> KeyFamily {
        KeyFamily::EcdsaP256
    }
    fn public_bytes(&self) -> Result<Vec<u8>> {
        self.public.public_bytes()
    }
    fn sig_tlv(&self) -> TlvType {
        TlvType::EcdsaSig
    }
    fn sig_len(&self) -> usize {
        self.public.sig_len()
    }
    fn signs_payload(&self) -> bool {
        true
    }
    fn verify(&self, sig: &[u8], message: &[u8]) -> Result<()> {
        self.public.verify(sig, message)
    }
}

impl SigningKey for EcdsaP256Key {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        use p256::ecdsa::signature::Signer;
        let sig: p256::ecdsa::DerSignature = self
            .key
            .try_sign(payload)
            .map_err(|e| ImageError::Crypto(format!("P-256 signing failed: {e}")))?;
        Ok(sig.to_vec())
    }

    fn verifying_key(&self) -> &dyn VerifyingKey {
        self
    }
}

#[derive(Debug, Clone)]
pub struct EcdsaP384Public(p384::ecdsa::VerifyingKey);

impl EcdsaP384Public {
    pub fn new(key: p384::ecdsa::VerifyingKey) -> Self {
        Self(key)
    }
}

impl VerifyingKey for EcdsaP384Public {
    fn family(&self) -> KeyFamily {
        KeyFamily::EcdsaP384
    }

    fn public_bytes(&self) -> Result<Vec<u8>> {
        use p384::pkcs8::EncodePublicKey;
        let der = self
            .0
            .to_public_key_der()
            .map_err(|e| key_err("encode P-384 public key", e))?;
        Ok(der.as_bytes().to_vec())
    }

    fn sig_tlv(&self) -> TlvType {
        TlvType::EcdsaSig
    }

    fn sig_len(&self) -> usize {
        103
    }

    fn signs_payload(&self) -> bool {
        true
    }

    fn verify(&self, sig: &[u8], message: &[u8]) -> Result<()> {
        use p384::ecdsa::signature::Verifier;
        let sig =
            p384::ecdsa::DerSignature::try_from(der_sequence(sig)).map_err(bad_signature)?;
        self.0.verify(message, &sig).map_err(bad_signature)
    }
}

#[derive(Debug, Clone)]
pub struct EcdsaP384Key {
    key: p384::ecdsa::SigningKey,
    public: EcdsaP384Public,
}

impl EcdsaP384Key {
    pub fn new(key: p384::ecdsa::SigningKey) -> Self {
        let public = EcdsaP384Public(p384::ecdsa::VerifyingKey::from(&key));
        Self { key, public }
    }

    pub fn generate() -> Self {
        Self::new(p384::ecdsa::SigningKey::random(&mut OsRng))
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        use p384::pkcs8::DecodePrivateKey;
        let key = p384::ecdsa::SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| key_err("P-384 key", e))?;
        Ok(Self::new(key))
    }

    pub fn public(&self) -> &EcdsaP384Public {
        &self.public
    }
}

impl VerifyingKey for EcdsaP384Key {
    fn family(&self) -> KeyFamily {
        KeyFamily::EcdsaP384
    }
    fn public_bytes(&self) -> Result<Vec<u8>> {
        self.public.public_bytes()
    }
    fn sig_tlv(&self) -> TlvType {
        TlvType::EcdsaSig
    }
    fn sig_len(&self) -> usize {
        self.public.sig_len()
    }
    fn signs_payload(&self) -> bool {
        true
    }
    fn verify(&self, sig: &[u8], message: &[u8]) -> Result<()> {
        self.public.verify(sig, message)
    }
}

impl SigningKey for EcdsaP384Key {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>> {
        use p384::ecdsa::signature::Signer;
        let sig: p384::ecdsa::DerSignature = self
            .key
            .try_sign(payload)
            .map_err(|e| ImageError::Crypto(format!("P-384 signing failed: {e}")))?;
        Ok(sig.to_vec())
    }

    fn verifying_key(&self) -> &dyn VerifyingKey {
        self
    }
}

// ---------------------------------------------------------------------------
// Ed25519
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Ed25519Public(ed25519_dalek::VerifyingKey);

impl Ed25519Public {
    pub fn new(key: ed25519_dalek::VerifyingKey) -> Self {
        Self(key)
    }
}

impl VerifyingKey for Ed25519Public {
    fn family(&self) -> KeyFamily {
        KeyFamily::Ed25519
    }

    fn public_bytes(&self) -> Result<Vec<u8>> {
        use ed25519_dalek::pkcs8::EncodePublicKey;
        let der = self
            .0
            .to_public_key_der()
            .map_err(|e| key_err("encode Ed25519 public key", e))?;
        Ok(der.as_bytes().to_vec())
    }

    fn sig_tlv(&self) -> TlvType {
        TlvType::Ed25519
    }

    fn sig_len(&self) -> usize {
        ed25519_dalek::SIGNATURE_LENGTH
    }

    fn signs_payload(&self) -> bool {
        false
    }

    fn verify(&self, sig: &[u8], message: &[u8]) -> Result<()> {
        use ed25519_dalek::Verifier;
        let sig = ed25519_dalek::Signature::from_slice(sig).map_err(bad_signature)?;
        self.0.verify(message, &sig).map_err(bad_signature)
    }
}

#[derive(Debug, Clone)]
pub struct Ed25519Key {
    key: ed25519_dalek::SigningKey,
    public: Ed25519Public,
}

impl Ed25519Key {
    pub fn new(key: ed25519_dalek::SigningKey) -> Self {
        let public = Ed25519Public(key.verifying_key());
        Self { key, public }
    }

    pub fn generate() -> Self {
        Self::new(ed25519_dalek::SigningKey::generate(&mut OsRng))
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        use ed25519_dalek::pkcs8::DecodePrivateKey;
        let key = ed25519_dalek::SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| key_err("Ed25519 key", e))?;
        Ok(Self::new(key))
    }

    pub fn public(&self) -> &Ed25519Public {
        &self.public
    }
}

impl VerifyingKey for Ed25519Key {
    fn family(&self) -> KeyFamily {
        KeyFamily::Ed25519
    }
    fn public_bytes(&self) -> Result<Vec<u8>> {
        self.public.public_bytes()
    }
    fn sig_tlv(&self) -> TlvType {
        TlvType::Ed25519
    }
    fn sig_len(&self) -> usize {
        self.public.sig_len()
    }
    fn signs_payload(&self) -> bool {
        false
    }
    fn verify(&self, sig: &[u8], message: &[u8]) -> Result<()> {
        self.public.verify(sig, message)
    }
}

impl SigningKey for Ed25519Key {
    // Ed25519 signs the digest in normal mode and the whole hashed region in
    // pure mode; either way the caller hands over the message to sign.
    fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>> {
        use ed25519_dalek::Signer;
        let sig = self
            .key
            .try_sign(digest)
            .map_err(|e| ImageError::Crypto(format!("Ed25519 signing failed: {e}")))?;
        Ok(sig.to_bytes().to_vec())
    }

    fn verifying_key(&self) -> &dyn VerifyingKey {
        self
    }
}

// ---------------------------------------------------------------------------
// Encryption keys
// ---------------------------------------------------------------------------

/// Public key (or KEK) used to wrap the image content key.
#[derive(Clone)]
pub enum EncryptionKey {
    Rsa(RsaPublicKey),
    P256(p256::PublicKey),
    X25519(x25519_dalek::PublicKey),
    /// AES key-encryption key, 16 or 32 bytes.
    AesKw(Vec<u8>),
}

impl EncryptionKey {
    pub fn family(&self) -> KeyFamily {
        match self {
            EncryptionKey::Rsa(_) => KeyFamily::Rsa2048,
            EncryptionKey::P256(_) => KeyFamily::EcdsaP256,
            EncryptionKey::X25519(_) => KeyFamily::X25519,
            EncryptionKey::AesKw(_) => KeyFamily::AesKw,
        }
    }

    /// A KEK from raw bytes.
    pub fn aes_kw(kek: &[u8]) -> Result<Self> {
        match kek.len() {
            16 | 32 => Ok(EncryptionKey::AesKw(kek.to_vec())),
            n => Err(ImageError::Key(format!(
                "AES-KW key must be 16 or 32 bytes, got {n}"
            ))),
        }
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the KEK.
        write!(f, "EncryptionKey({})", self.family())
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

const X25519_OID: pkcs8::ObjectIdentifier = pkcs8::ObjectIdentifier::new_unwrap("1.3.101.110");

/// Load a PEM private key of any signing family.
pub fn load_signing_key(path: impl AsRef<Path>) -> Result<Box<dyn SigningKey>> {
    let pem = fs::read_to_string(path.as_ref())?;
    debug!("loading signing key from {}", path.as_ref().display());
    signing_key_from_pem(&pem)
}

pub fn signing_key_from_pem(pem: &str) -> Result<Box<dyn SigningKey>> {
    if pem.contains("BEGIN RSA PRIVATE KEY") {
        return Ok(Box::new(RsaKey::from_pem(pem)?));
    }
    if !pem.contains("BEGIN PRIVATE KEY") {
        return Err(ImageError::Key(
            "expected a PKCS#8 or PKCS#1 PEM private key".into(),
        ));
    }
    if let Ok(k) = RsaKey::from_pem(pem) {
        return Ok(Box::new(k));
    }
    if let Ok(k) = EcdsaP256Key::from_pem(pem) {
        return Ok(Box::new(k));
    }
    if let Ok(k) = EcdsaP384Key::from_pem(pem) {
        return Ok(Box::new(k));
    }
    if let Ok(k) = Ed25519Key::from_pem(pem) {
        return Ok(Box::new(k));
    }
    Err(ImageError::Key("unsupported signing key type".into()))
}

/// Load a PEM public key, or derive it from a PEM private key.
pub fn load_verifying_key(path: impl AsRef<Path>) -> Result<Box<dyn VerifyingKey>> {
    let pem = fs::read_to_string(path.as_ref())?;
    debug!("loading verification key from {}", path.as_ref().display());
    verifying_key_from_pem(&pem)
}

pub fn verifying_key_from_pem(pem: &str) -> Result<Box<dyn VerifyingKey>> {
    if !pem.contains("BEGIN PUBLIC KEY") {
        let key = signing_key_from_pem(pem)?;
        return boxed_public(key.as_ref());
    }

    use pkcs8::DecodePublicKey;
    if let Ok(k) = RsaPublicKey::from_public_key_pem(pem) {
        return Ok(Box::new(RsaPublic::new(k)?));
    }
    if let Ok(k) = p256::ecdsa::VerifyingKey::from_public_key_pem(pem) {
        return Ok(Box::new(EcdsaP256Public(k)));
    }
    if let Ok(k) = p384::ecdsa::VerifyingKey::from_public_key_pem(pem) {
        return Ok(Box::new(EcdsaP384Public(k)));
    }
    if let Ok(k) = ed25519_dalek::VerifyingKey::from_public_key_pem(pem) {
        return Ok(Box::new(Ed25519Public(k)));
    }
    Err(ImageError::Key("unsupported public key type".into()))
}

/// Re-load the public half of a signing key as an owned verifying key.
fn boxed_public(key: &dyn SigningKey) -> Result<Box<dyn VerifyingKey>> {
    let der = key.public_bytes()?;
    match key.family() {
        KeyFamily::Rsa2048 | KeyFamily::Rsa3072 => {
            use pkcs1::DecodeRsaPublicKey;
            let k = RsaPublicKey::from_pkcs1_der(&der).map_err(|e| key_err("RSA public key", e))?;
            Ok(Box::new(RsaPublic::new(k)?))
        }
        KeyFamily::EcdsaP256 => {
            use p256::pkcs8::DecodePublicKey;
            let k = p256::ecdsa::VerifyingKey::from_public_key_der(&der)
                .map_err(|e| key_err("P-256 public key", e))?;
            Ok(Box::new(EcdsaP256Public(k)))
        }
        KeyFamily::EcdsaP384 => {
            use p384::pkcs8::DecodePublicKey;
            let k = p384::ecdsa::VerifyingKey::from_public_key_der(&der)
                .map_err(|e| key_err("P-384 public key", e))?;
            Ok(Box::new(EcdsaP384Public(k)))
        }
        KeyFamily::Ed25519 => {
            use ed25519_dalek::pkcs8::DecodePublicKey;
            let k = ed25519_dalek::VerifyingKey::from_public_key_der(&der)
                .map_err(|e| key_err("Ed25519 public key", e))?;
            Ok(Box::new(Ed25519Public(k)))
        }
        other => Err(ImageError::Key(format!("{other} keys cannot verify"))),
    }
}

/// Load an encryption key: a PEM public or private key of an encrypting
/// family, or a raw 16/32-byte AES-KW KEK.
pub fn load_encryption_key(path: impl AsRef<Path>) -> Result<EncryptionKey> {
    let data = fs::read(path.as_ref())?;
    debug!("loading encryption key from {}", path.as_ref().display());
    encryption_key_from_bytes(&data)
}

pub fn encryption_key_from_bytes(data: &[u8]) -> Result<EncryptionKey> {
    let pem = match std::str::from_utf8(data) {
        Ok(s) if s.trim_start().starts_with("-----BEGIN") => s,
        _ => return EncryptionKey::aes_kw(data),
    };

    if pem.contains("BEGIN PUBLIC KEY") {
        use pkcs8::DecodePublicKey;
        if let Ok(k) = RsaPublicKey::from_public_key_pem(pem) {
            return Ok(EncryptionKey::Rsa(k));
        }
        if let Ok(k) = p256::PublicKey::from_public_key_pem(pem) {
            return Ok(EncryptionKey::P256(k));
        }
    } else if pem.contains("BEGIN RSA PRIVATE KEY") {
        return Ok(EncryptionKey::Rsa(RsaKey::from_pem(pem)?.key.to_public_key()));
    } else {
        use pkcs8::DecodePrivateKey;
        if let Ok(k) = RsaPrivateKey::from_pkcs8_pem(pem) {
            return Ok(EncryptionKey::Rsa(k.to_public_key()));
        }
        if let Ok(k) = p256::SecretKey::from_pkcs8_pem(pem) {
            return Ok(EncryptionKey::P256(k.public_key()));
        }
    }
    x25519_public_from_pem(pem).map(EncryptionKey::X25519)
}

fn x25519_public_from_pem(pem: &str) -> Result<x25519_dalek::PublicKey> {
    let (label, doc) =
        pkcs8::der::Document::from_pem(pem).map_err(|e| key_err("encryption key PEM", e))?;

    let raw: [u8; 32] = match label {
        "PUBLIC KEY" => {
            let spki = pkcs8::spki::SubjectPublicKeyInfoRef::try_from(doc.as_bytes())
                .map_err(|e| key_err("public key", e))?;
            if spki.algorithm.oid != X25519_OID {
                return Err(ImageError::Key(format!(
                    "unsupported encryption key algorithm {}",
                    spki.algorithm.oid
                )));
            }
            spki.subject_public_key
                .raw_bytes()
                .try_into()
                .map_err(|_| ImageError::Key("X25519 public key must be 32 bytes".into()))?
        }
        "PRIVATE KEY" => {
            let info = pkcs8::PrivateKeyInfo::try_from(doc.as_bytes())
                .map_err(|e| key_err("private key", e))?;
            if info.algorithm.oid != X25519_OID {
                return Err(ImageError::Key(format!(
                    "unsupported encryption key algorithm {}",
                    info.algorithm.oid
                )));
            }
            // CurvePrivateKey ::= OCTET STRING, nested in the PKCS#8 field.
            let secret: [u8; 32] = match info.private_key {
                [0x04, 0x20, rest @ ..] => rest.try_into().ok(),
                _ => None,
            }
            .ok_or_else(|| ImageError::Key("malformed X25519 private key".into()))?;
            let secret = x25519_dalek::StaticSecret::from(secret);
            *x25519_dalek::PublicKey::from(&secret).as_bytes()
        }
        other => {
            return Err(ImageError::Key(format!(
                "unexpected PEM label '{other}' for an encryption key"
            )))
        }
    };
    Ok(x25519_dalek::PublicKey::from(raw))
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub const RSA2048_PEM: &str = include_str!("../testdata/rsa-2048.pem");
    pub const RSA2048_PUB_PEM: &str = include_str!("../testdata/rsa-2048-pub.pem");
    pub const RSA3072_PEM: &str = include_str!("../testdata/rsa-3072.pem");
    pub const P256_PEM: &str = include_str!("../testdata/ec-p256.pem");
    pub const P256_PUB_PEM: &str = include_str!("../testdata/ec-p256-pub.pem");
    pub const P384_PEM: &str = include_str!("../testdata/ec-p384.pem");
    pub const ED25519_PEM: &str = include_str!("../testdata/ed25519.pem");
    pub const X25519_PEM: &str = include_str!("../testdata/x25519.pem");
    pub const X25519_PUB_PEM: &str = include_str!("../testdata/x25519-pub.pem");

    pub fn rsa2048() -> RsaKey {
        RsaKey::from_pem(RSA2048_PEM).unwrap()
    }

    pub fn rsa3072() -> RsaKey {
        RsaKey::from_pem(RSA3072_PEM).unwrap()
    }

    pub fn p256() -> EcdsaP256Key {
        EcdsaP256Key::from_pem(P256_PEM).unwrap()
    }

    pub fn p384() -> EcdsaP384Key {
        EcdsaP384Key::from_pem(P384_PEM).unwrap()
    }

    pub fn ed25519() -> Ed25519Key {
        Ed25519Key::from_pem(ED25519_PEM).unwrap()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn family_table() {
        assert_eq!(KeyFamily::from_name("ED25519"), Some(KeyFamily::Ed25519));
        assert_eq!(KeyFamily::EcdsaP384.sig_tlv(), Some(TlvType::EcdsaSig));
        assert_eq!(KeyFamily::AesKw.sig_tlv(), None);
    }

    #[test]
    fn encryption_pairs() {
        assert!(KeyFamily::Rsa3072.accepts_encryption(KeyFamily::Rsa2048));
        assert!(KeyFamily::EcdsaP256.accepts_encryption(KeyFamily::EcdsaP256));
        assert!(KeyFamily::Ed25519.accepts_encryption(KeyFamily::X25519));
        assert!(KeyFamily::EcdsaP384.accepts_encryption(KeyFamily::AesKw));
        assert!(!KeyFamily::EcdsaP384.accepts_encryption(KeyFamily::EcdsaP256));
        assert!(!KeyFamily::Rsa2048.accepts_encryption(KeyFamily::X25519));
        assert!(!KeyFamily::Ed25519.accepts_encryption(KeyFamily::Rsa2048));
    }

    #[test]
    fn pem_families_detected() {
        let cases = [
            (RSA2048_PEM, KeyFamily::Rsa2048),
            (RSA3072_PEM, KeyFamily::Rsa3072),
            (P256_PEM, KeyFamily::EcdsaP256),
            (P384_PEM, KeyFamily::EcdsaP384),
            (ED25519_PEM, KeyFamily::Ed25519),
        ];
        for (pem, family) in cases {
            let key = signing_key_from_pem(pem).unwrap();
            assert_eq!(key.family(), family);
            assert_eq!(key.verifying_key().family(), family);
            let public = verifying_key_from_pem(pem).unwrap();
            assert_eq!(public.public_bytes().unwrap(), key.public_bytes().unwrap());
        }
        assert!(signing_key_from_pem(X25519_PEM).is_err());
        assert!(signing_key_from_pem("not a key").is_err());
    }

    #[test]
    fn public_pem_matches_private() {
        let rsa = rsa2048();
        let public = verifying_key_from_pem(RSA2048_PUB_PEM).unwrap();
        assert_eq!(public.family(), KeyFamily::Rsa2048);
        assert_eq!(public.public_bytes().unwrap(), rsa.public_bytes().unwrap());
        // PKCS#1 RSAPublicKey is a SEQUENCE.
        assert_eq!(rsa.public_bytes().unwrap()[0], 0x30);

        let p256 = p256();
        let public = verifying_key_from_pem(P256_PUB_PEM).unwrap();
        assert_eq!(public.public_bytes().unwrap(), p256.public_bytes().unwrap());
        // SPKI for a P-256 key: 26-byte prefix + 65-byte SEC1 point.
        assert_eq!(p256.public_bytes().unwrap().len(), 91);
    }

    #[test]
    fn rsa_pss_sign_verify() {
        let key = rsa2048();
        let sig = key.sign(b"firmware").unwrap();
        assert_eq!(sig.len(), 256);
        key.verify(&sig, b"firmware").unwrap();
        assert!(key.public().verify(&sig, b"firmwarf").is_err());
        assert!(key.sign_digest(&[0u8; 32]).is_err());
    }

    #[test]
    fn ecdsa_sign_verify() {
        let k256 = EcdsaP256Key::generate();
        let sig = k256.sign(b"payload").unwrap();
        assert!(sig.len() <= k256.sig_len());
        assert_eq!(sig[0], 0x30);
        k256.public().verify(&sig, b"payload").unwrap();
        assert!(k256.verify(&sig, b"payloaD").is_err());

        let k384 = p384();
        let sig = k384.sign(b"payload").unwrap();
        assert!(sig.len() <= k384.sig_len());
        k384.verify(&sig, b"payload").unwrap();
        assert!(k384.verify(&sig[..sig.len() - 1], b"payload").is_err());
    }

    #[test]
    fn ed25519_signs_digest() {
        let key = ed25519();
        assert!(!key.signs_payload());
        let sig = sign_image(&key, b"region", &[7u8; 32]).unwrap();
        assert_eq!(sig.len(), 64);
        key.verify(&sig, &[7u8; 32]).unwrap();
        assert!(key.verify(&sig, b"region").is_err());
        assert!(key.sign(b"region").is_err());
    }

    #[test]
    fn encryption_keys_loaded() {
        let rsa = encryption_key_from_bytes(RSA2048_PUB_PEM.as_bytes()).unwrap();
        assert_eq!(rsa.family(), KeyFamily::Rsa2048);
        let rsa = encryption_key_from_bytes(RSA2048_PEM.as_bytes()).unwrap();
        assert_eq!(rsa.family(), KeyFamily::Rsa2048);

        let ec = encryption_key_from_bytes(P256_PUB_PEM.as_bytes()).unwrap();
        assert_eq!(ec.family(), KeyFamily::EcdsaP256);

        let from_pub = encryption_key_from_bytes(X25519_PUB_PEM.as_bytes()).unwrap();
        let from_priv = encryption_key_from_bytes(X25519_PEM.as_bytes()).unwrap();
        match (from_pub, from_priv) {
            (EncryptionKey::X25519(a), EncryptionKey::X25519(b)) => {
                assert_eq!(a.as_bytes(), b.as_bytes())
            }
            other => panic!("expected X25519 keys, got {other:?}"),
        }

        let kw = encryption_key_from_bytes(&[0x11; 16]).unwrap();
        assert_eq!(kw.family(), KeyFamily::AesKw);
        assert!(encryption_key_from_bytes(&[0x11; 20]).is_err());
        assert!(encryption_key_from_bytes(P384_PEM.as_bytes()).is_err());
    }
}
