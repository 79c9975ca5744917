/// Argon2id password hashing
///
/// Hashing is deliberately expensive, so every call is moved onto the
/// blocking thread pool instead of stalling the async workers.
use crate::{
    config::PasswordConfig,
    error::{AuthError, AuthResult},
};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};

/// Password hashing primitive shared by login and password flows
#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
    /// Verified against when no account matched, so misses cost the same
    dummy_hash: String,
}

impl PasswordHasher {
    pub fn new(config: &PasswordConfig) -> AuthResult<Self> {
        let params = Params::new(config.hash_memory_kib, config.hash_iterations, 1, None)
            .map_err(|e| AuthError::Configuration(format!("Invalid Argon2 parameters: {}", e)))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let dummy_hash = hash_with(&argon2, "vigil-dummy-password")?;

        Ok(Self { argon2, dummy_hash })
    }

    /// Hash a password into a PHC string
    pub async fn hash(&self, password: &str) -> AuthResult<String> {
        let argon2 = self.argon2.clone();
        let password = password.to_string();

        tokio::task::spawn_blocking(move || hash_with(&argon2, &password))
            .await
            .map_err(|e| AuthError::Internal(format!("Hashing task failed: {}", e)))?
    }

    /// Constant-time verification of `password` against a stored PHC hash
    pub async fn verify(&self, password: &str, hash: &str) -> AuthResult<bool> {
        let argon2 = self.argon2.clone();
        let password = password.to_string();
        let hash = hash.to_string();

        tokio::task::spawn_blocking(move || verify_with(&argon2, &password, &hash))
            .await
            .map_err(|e| AuthError::Internal(format!("Verification task failed: {}", e)))
    }

    /// True if `password` matches any of `hashes`
    pub async fn matches_any(&self, password: &str, hashes: Vec<String>) -> AuthResult<bool> {
        let argon2 = self.argon2.clone();
        let password = password.to_string();

        tokio::task::spawn_blocking(move || {
            hashes.iter().any(|hash| verify_with(&argon2, &password, hash))
        })
        .await
        .map_err(|e| AuthError::Internal(format!("Verification task failed: {}", e)))
    }

    /// Burn one verification for an identifier that matched nothing
    pub async fn verify_dummy(&self, password: &str) -> AuthResult<()> {
        let dummy = self.dummy_hash.clone();
        self.verify(password, &dummy).await.map(|_| ())
    }
}

fn hash_with(argon2: &Argon2<'static>, password: &str) -> AuthResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AuthError::Internal(format!("Password hashing failed: {}", e)))
}

fn verify_with(argon2: &Argon2<'static>, password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => argon2.verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> PasswordHasher {
        PasswordHasher::new(&crate::testutil::test_config().password).unwrap()
    }

    #[tokio::test]
    async fn test_hash_and_verify() {
        let hasher = hasher();
        let hash = hasher.hash("correct horse").await.unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("correct horse", &hash).await.unwrap());
        assert!(!hasher.verify("wrong horse", &hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_hashes_are_salted() {
        let hasher = hasher();
        let a = hasher.hash("same-password").await.unwrap();
        let b = hasher.hash("same-password").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_matches_any_and_garbage_hash() {
        let hasher = hasher();
        let old = hasher.hash("old-password").await.unwrap();

        assert!(hasher
            .matches_any("old-password", vec!["not-a-phc".to_string(), old.clone()])
            .await
            .unwrap());
        assert!(!hasher.matches_any("other", vec![old]).await.unwrap());
        assert!(!hasher.verify("anything", "not-a-phc").await.unwrap());
    }
}
