//! Per-user login verification.
//!
//! The hub consults a [`CredentialStore`] after the shared password check.
//! [`CredentialTable`] is the stock implementation: Argon2id PHC strings
//! keyed by peer name, loadable from a JSON file.

use std::collections::HashMap;
use std::path::Path;

use argon2::password_hash::SaltString;
use argon2::{Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version};
use serde::{Deserialize, Serialize};

use crate::config::{load_json, save_json};
use crate::error::NetworkError;

const SALT_LEN: usize = 16;

/// Verifies a peer's login secret.
pub trait CredentialStore: Send + Sync {
    fn verify(&self, username: &str, candidate: &str) -> bool;
}

/// Argon2id-hashed credentials keyed by peer name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialTable {
    entries: HashMap<String, String>,
    #[serde(skip, default = "default_cost")]
    cost: (u32, u32),
}

fn default_cost() -> (u32, u32) {
    (19_456, 2)
}

impl Default for CredentialTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialTable {
    /// Empty table hashing with m=19456 KiB, t=2, p=1.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            cost: default_cost(),
        }
    }

    /// Empty table hashing new passwords with the given memory cost (KiB)
    /// and iteration count. Verification always uses the parameters stored
    /// in each hash.
    pub fn with_cost(memory_kib: u32, iterations: u32) -> Self {
        Self {
            entries: HashMap::new(),
            cost: (memory_kib, iterations),
        }
    }

    fn hasher(&self) -> Result<Argon2<'static>, NetworkError> {
        let params = Params::new(self.cost.0, self.cost.1, 1, None)
            .map_err(|e| NetworkError::Config(format!("Invalid Argon2 params: {e}")))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    /// Hash `password` into a PHC string.
    pub fn hash_password(&self, password: &str) -> Result<String, NetworkError> {
        let salt_bytes: [u8; SALT_LEN] = rand::random();
        let salt = SaltString::encode_b64(&salt_bytes)
            .map_err(|e| NetworkError::Config(format!("Invalid salt: {e}")))?;
        let hash = self
            .hasher()?
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| NetworkError::Config(format!("Argon2 hashing failed: {e}")))?;
        Ok(hash.to_string())
    }

    /// Hash and store a password for `username`, replacing any previous one.
    pub fn set_password(&mut self, username: &str, password: &str) -> Result<(), NetworkError> {
        let hash = self.hash_password(password)?;
        self.entries.insert(username.to_string(), hash);
        Ok(())
    }

    /// Store an already-hashed PHC string.
    pub fn insert_hash(&mut self, username: impl Into<String>, phc: impl Into<String>) {
        self.entries.insert(username.into(), phc.into());
    }

    pub fn remove(&mut self, username: &str) -> bool {
        self.entries.remove(username).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Save the table to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        save_json(self, path, "credential table")
    }

    /// Load a table from a JSON file.
    pub fn load(path: &Path) -> Result<Self, NetworkError> {
        load_json(path).ok_or_else(|| {
            NetworkError::Config(format!("Cannot load credential table {}", path.display()))
        })
    }
}

impl CredentialStore for CredentialTable {
    fn verify(&self, username: &str, candidate: &str) -> bool {
        let Some(phc) = self.entries.get(username) else {
            return false;
        };
        match PasswordHash::new(phc) {
            Ok(parsed) => Argon2::default()
                .verify_password(candidate.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                tracing::warn!("Corrupt credential hash for '{username}': {e}");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
