//! Image digest algorithms and the rules tying them to key families.

use std::fmt;
use std::str::FromStr;

use crate::keys::KeyFamily;
use crate::tlv::TlvType;
use crate::{ImageError, Result};

/// Digest algorithm used for the image hash TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlg {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlg::Sha256 => {
                use sha2::Digest;
                sha2::Sha256::digest(data).to_vec()
            }
            HashAlg::Sha384 => {
                use sha2::Digest;
                sha2::Sha384::digest(data).to_vec()
            }
            HashAlg::Sha512 => {
                use sha2::Digest;
                sha2::Sha512::digest(data).to_vec()
            }
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
            HashAlg::Sha512 => 64,
        }
    }

    /// The TLV carrying a digest of this kind.
    pub fn tlv(self) -> TlvType {
        match self {
            HashAlg::Sha256 => TlvType::Sha256,
            HashAlg::Sha384 => TlvType::Sha384,
            HashAlg::Sha512 => TlvType::Sha512,
        }
    }

    pub fn from_tlv(t: TlvType) -> Option<Self> {
        match t {
            TlvType::Sha256 => Some(HashAlg::Sha256),
            TlvType::Sha384 => Some(HashAlg::Sha384),
            TlvType::Sha512 => Some(HashAlg::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for HashAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = match self {
            HashAlg::Sha256 => 256,
            HashAlg::Sha384 => 384,
            HashAlg::Sha512 => 512,
        };
        write!(f, "sha{bits}")
    }
}

/// The user's digest preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserSha {
    /// Let the key family decide.
    #[default]
    Auto,
    Explicit(HashAlg),
}

impl FromStr for UserSha {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().trim_start_matches("sha") {
            "auto" => Ok(UserSha::Auto),
            "256" => Ok(UserSha::Explicit(HashAlg::Sha256)),
            "384" => Ok(UserSha::Explicit(HashAlg::Sha384)),
            "512" => Ok(UserSha::Explicit(HashAlg::Sha512)),
            _ => Err(ImageError::UnknownName {
                kind: "hash algorithm",
                name: s.to_string(),
            }),
        }
    }
}

/// Digests a key family may be paired with, preferred first. Empty when the
/// family cannot sign at all.
pub fn allowed_hashes(family: KeyFamily, pure: bool) -> &'static [HashAlg] {
    use HashAlg::*;
    match (family, pure) {
        (KeyFamily::Ed25519, true) => &[Sha512],
        (_, true) => &[],
        (KeyFamily::Rsa2048 | KeyFamily::Rsa3072 | KeyFamily::EcdsaP256, false) => &[Sha256],
        (KeyFamily::EcdsaP384, false) => &[Sha384],
        (KeyFamily::Ed25519 | KeyFamily::X25519, false) => &[Sha256, Sha512],
        (KeyFamily::AesKw, false) => &[],
    }
}

/// Pick the image digest for a signing key family and user preference.
///
/// With no key the preference is used as is (SHA-256 for `auto`). With a
/// key, `auto` and pure mode take the family's first allowed digest, and an
/// explicit preference outside the allowed set is rejected.
pub fn select_hash(family: Option<KeyFamily>, user: UserSha, pure: bool) -> Result<HashAlg> {
    let Some(family) = family else {
        if pure {
            return Err(ImageError::PureWithoutKey);
        }
        return Ok(match user {
            UserSha::Auto => HashAlg::Sha256,
            UserSha::Explicit(alg) => alg,
        });
    };

    let allowed = allowed_hashes(family, pure);
    let first = *allowed
        .first()
        .ok_or(ImageError::NoHashForKey { family, pure })?;

    match user {
        UserSha::Auto => Ok(first),
        _ if pure => Ok(first),
        UserSha::Explicit(alg) if allowed.contains(&alg) => Ok(alg),
        UserSha::Explicit(alg) => Err(ImageError::HashNotAllowed {
            family,
            requested: alg.to_string(),
            allowed: allowed
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}

/// Whether a digest TLV can come from an image signed by `family`.
pub fn digest_matches_family(tlv: TlvType, family: KeyFamily) -> bool {
    HashAlg::from_tlv(tlv)
        .map(|alg| allowed_hashes(family, false).contains(&alg))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
