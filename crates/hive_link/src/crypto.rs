//! Public-key sealing for transport encryption.
//!
//! Each sealed payload carries a fresh ephemeral X25519 public key. The
//! sender agrees a shared secret with the recipient's static key, derives
//! an AES-256-GCM key with SHA-256, and encrypts under a random nonce.
//!
//! Sealed layout: `ephemeral_pub (32) | nonce (12) | ciphertext + tag`.

use std::fmt;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as DalekPublic, StaticSecret};

use crate::error::NetworkError;

const KEY_LEN: usize = 32;
const AES_NONCE_LEN: usize = 12;
const KDF_DOMAIN: &[u8] = b"hive-link-seal-v1";

/// Overhead added by [`PublicKey::seal`].
pub const SEAL_OVERHEAD: usize = KEY_LEN + AES_NONCE_LEN + 16;

/// A peer's X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Hex form used on the wire during key exchange.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(text: &str) -> Result<Self, NetworkError> {
        let bytes = hex::decode(text)
            .map_err(|e| NetworkError::Crypto(format!("invalid public key hex: {e}")))?;
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            NetworkError::Crypto(format!("public key must be {KEY_LEN} bytes, got {}", b.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Encrypt `plaintext` so only the holder of the matching private key
    /// can read it.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, NetworkError> {
        let ephemeral = StaticSecret::from(rand::random::<[u8; KEY_LEN]>());
        let ephemeral_pub = DalekPublic::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&DalekPublic::from(self.0));

        let cipher = derive_cipher(shared.as_bytes(), ephemeral_pub.as_bytes(), &self.0);
        let nonce_bytes: [u8; AES_NONCE_LEN] = rand::random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| NetworkError::Crypto(format!("Encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(KEY_LEN + AES_NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(ephemeral_pub.as_bytes());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..16])
    }
}

/// A local X25519 keypair. The secret half never leaves this struct.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh keypair from OS entropy.
    pub fn generate() -> Self {
        let secret = StaticSecret::from(rand::random::<[u8; KEY_LEN]>());
        let public = PublicKey(*DalekPublic::from(&secret).as_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Decrypt a payload produced by [`PublicKey::seal`] for our public key.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, NetworkError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(NetworkError::Crypto("Ciphertext too short".to_string()));
        }

        let (ephemeral_bytes, rest) = sealed.split_at(KEY_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(AES_NONCE_LEN);

        let mut ephemeral = [0u8; KEY_LEN];
        ephemeral.copy_from_slice(ephemeral_bytes);
        let shared = self.secret.diffie_hellman(&DalekPublic::from(ephemeral));

        let cipher = derive_cipher(shared.as_bytes(), &ephemeral, &self.public.0);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| NetworkError::Crypto(format!("Decryption failed: {e}")))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

fn derive_cipher(
    shared: &[u8; KEY_LEN],
    ephemeral: &[u8; KEY_LEN],
    recipient: &[u8; KEY_LEN],
) -> Aes256Gcm {
    let mut hasher = Sha256::new();
    hasher.update(KDF_DOMAIN);
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    let key_material = hasher.finalize();
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_material))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let keys = KeyPair::generate();
        let sealed = keys.public_key().seal(b"attack at dawn").unwrap();
        assert_eq!(keys.open(&sealed).unwrap(), b"attack at dawn");
    }

    #[test]
    fn test_seal_empty_payload() {
        let keys = KeyPair::generate();
        let sealed = keys.public_key().seal(b"").unwrap();
        assert_eq!(sealed.len(), SEAL_OVERHEAD);
        assert!(keys.open(&sealed).unwrap().is_empty());
    }

    #[test]
    fn test_seal_is_randomized() {
        let keys = KeyPair::generate();
        let a = keys.public_key().seal(b"same").unwrap();
        let b = keys.public_key().seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_cannot_open() {
        let alice = KeyPair::generate();
        let mallory = KeyPair::generate();
        let sealed = alice.public_key().seal(b"for alice").unwrap();
        assert!(matches!(mallory.open(&sealed), Err(NetworkError::Crypto(_))));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let keys = KeyPair::generate();
        let mut sealed = keys.public_key().seal(b"integrity").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(keys.open(&sealed).is_err());
        assert!(keys.open(&sealed[..10]).is_err());
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let key = KeyPair::generate().public_key();
        let parsed = PublicKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(parsed, key);

        assert!(PublicKey::from_hex("zz").is_err());
        assert!(PublicKey::from_hex("abcd").is_err());
    }
}
