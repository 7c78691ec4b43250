//! Argon2id password hashing for locally stored credentials

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{
    self, PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString,
};
use argon2::{Algorithm, Argon2, Params, Version};

use crate::config::HashingParams;
use crate::error::{SyncError, SyncResult};

/// Produces and checks PHC-format Argon2id hashes.
///
/// Hashing is CPU and memory heavy, so the async methods run it on the
/// blocking pool.
#[derive(Debug, Clone)]
pub struct CredentialHasher {
    params: HashingParams,
}

impl CredentialHasher {
    pub fn new(params: HashingParams) -> SyncResult<Self> {
        let hasher = Self { params };
        hasher.argon2()?;
        Ok(hasher)
    }

    fn argon2(&self) -> SyncResult<Argon2<'static>> {
        let params = Params::new(
            self.params.memory_kib,
            self.params.iterations,
            self.params.parallelism,
            None,
        )
        .map_err(|e| SyncError::PasswordHash(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    pub fn hash_blocking(&self, password: &str) -> SyncResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()?
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| SyncError::PasswordHash(e.to_string()))
    }

    /// `Ok(false)` on mismatch; errors only for malformed hashes.
    pub fn verify_blocking(&self, password: &str, hash: &str) -> SyncResult<bool> {
        let parsed = PasswordHash::new(hash).map_err(|e| SyncError::PasswordHash(e.to_string()))?;
        // Parameters come from the stored hash, not from `self.params`.
        match self.argon2()?.verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(SyncError::PasswordHash(e.to_string())),
        }
    }

    pub async fn hash(&self, password: &str) -> SyncResult<String> {
        let hasher = self.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash_blocking(&password))
            .await
            .map_err(|e| SyncError::PasswordHash(e.to_string()))?
    }

    pub async fn verify(&self, password: &str, hash: &str) -> SyncResult<bool> {
        let hasher = self.clone();
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || hasher.verify_blocking(&password, &hash))
            .await
            .map_err(|e| SyncError::PasswordHash(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> CredentialHasher {
        CredentialHasher::new(HashingParams::minimal()).unwrap()
    }

    #[test]
    fn test_hash_and_verify() {
        let hasher = hasher();
        let hash = hasher.hash_blocking("correct horse").unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(!hash.contains("correct horse"));
        assert!(hasher.verify_blocking("correct horse", &hash).unwrap());
        assert!(!hasher.verify_blocking("wrong horse", &hash).unwrap());
    }

    #[test]
    fn test_hashes_are_salted() {
        let hasher = hasher();
        let a = hasher.hash_blocking("password1").unwrap();
        let b = hasher.hash_blocking("password1").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_malformed_hash_is_an_error() {
        assert!(matches!(
            hasher().verify_blocking("password1", "not-a-hash"),
            Err(SyncError::PasswordHash(_))
        ));
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = HashingParams {
            memory_kib: 1,
            iterations: 0,
            parallelism: 1,
        };
        assert!(CredentialHasher::new(params).is_err());
    }

    #[tokio::test]
    async fn test_async_verify() {
        let hasher = hasher();
        let hash = hasher.hash("password1").await.unwrap();
        assert!(hasher.verify("password1", &hash).await.unwrap());
    }
}
