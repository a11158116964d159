//! Node identity: WireGuard (X25519) keypairs and their base64 text encoding.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Length of a WireGuard key in bytes.
pub const KEY_LEN: usize = 32;

/// WireGuard public key (32 bytes, X25519). Text form is standard base64, the
/// same encoding `wg(8)` uses.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_key(s).map(PublicKey)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

/// X25519 keypair. Keep secret key private; expose only the public key and the
/// persisted text form.
#[derive(Clone)]
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Parse a private key in its base64 text form (as stored on disk).
    pub fn from_private_base64(s: &str) -> Result<Self, KeyError> {
        let bytes = decode_key(s)?;
        Ok(Self::from_secret(StaticSecret::from(bytes)))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Private key text form. Only for persisting and handing to the kernel.
    pub fn private_base64(&self) -> String {
        STANDARD.encode(self.secret.to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

fn decode_key(s: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let raw = STANDARD
        .decode(s.trim())
        .map_err(|_| KeyError::Encoding)?;
    raw.try_into().map_err(|v: Vec<u8>| KeyError::Length(v.len()))
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key is not valid base64")]
    Encoding,
    #[error("key has {0} bytes, expected 32")]
    Length(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_key_text_restores_same_public_key() {
        let kp = Keypair::generate();
        let restored = Keypair::from_private_base64(&kp.private_base64()).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn public_key_parses_from_display() {
        let kp = Keypair::generate();
        let text = kp.public_key().to_string();
        assert_eq!(text.len(), 44);
        let parsed: PublicKey = text.parse().unwrap();
        assert_eq!(&parsed, kp.public_key());
    }

    #[test]
    fn distinct_keypairs() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(matches!(
            "definitely not a key!".parse::<PublicKey>(),
            Err(KeyError::Encoding)
        ));
        assert!(matches!(
            STANDARD.encode([1u8; 16]).parse::<PublicKey>(),
            Err(KeyError::Length(16))
        ));
        assert!(Keypair::from_private_base64("").is_err());
    }

    #[test]
    fn trailing_newline_is_tolerated() {
        let kp = Keypair::generate();
        let stored = format!("{}\n", kp.private_base64());
        let restored = Keypair::from_private_base64(&stored).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());
    }
}
