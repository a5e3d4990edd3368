//! Device key management.
//!
//! Every device authenticates to the account backend with an X25519 key
//! pair. The pair is rotated whenever the account changes; only the public
//! half ever leaves the process.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Key parsing errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length (expected 32 bytes)")]
    InvalidLength,
}

fn decode_key_bytes(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s).map_err(|_| KeyError::InvalidBase64)?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength)?;
    Ok(arr)
}

/// Device private key (Curve25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Decode from a base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self {
            secret: StaticSecret::from(decode_key_bytes(s)?),
        })
    }

    /// Derive the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: X25519Public::from(&self.secret),
        }
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

/// Device public key (Curve25519), registered with the account backend.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: X25519Public,
}

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: X25519Public::from(bytes),
        }
    }

    /// Decode from a base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self::from_bytes(decode_key_bytes(s)?))
    }

    /// Get raw bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// A device key pair (private + public)
#[derive(Clone)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let private = PrivateKey::generate();
        let public = private.public_key();
        Self { private, public }
    }

    /// Rebuild the pair from a private key
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_pair_is_consistent() {
        let pair = KeyPair::generate();
        assert_eq!(pair.public.to_bytes(), pair.private.public_key().to_bytes());
    }

    #[test]
    fn test_base64_roundtrip() {
        let pair = KeyPair::generate();
        let restored = PrivateKey::from_base64(&pair.private.to_base64()).unwrap();
        assert_eq!(pair.public.to_bytes(), restored.public_key().to_bytes());
    }

    #[test]
    fn test_invalid_base64_rejected() {
        assert!(PublicKey::from_base64("not-valid-base64!!!").is_err());
    }

    #[test]
    fn test_wrong_length_rejected() {
        let short = BASE64.encode([0u8; 16]);
        assert!(matches!(
            PublicKey::from_base64(&short),
            Err(KeyError::InvalidLength)
        ));
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let key = PrivateKey::generate();
        assert_eq!(format!("{:?}", key), "PrivateKey([redacted])");
    }
}
