//! Admin sign-in. The passphrase is checked against an Argon2 PHC string
//! from configuration; nothing about the session is persisted.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("admin sign-in is not configured")]
    NotConfigured,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid password hash: {reason}")]
    InvalidHash { reason: String },
}

pub trait AuthProvider: Send + Sync {
    fn verify(&self, passphrase: &SecretString) -> Result<(), AuthError>;
}

#[derive(Debug, Clone)]
pub struct Argon2AuthProvider {
    phc: String,
}

impl Argon2AuthProvider {
    /// Rejects strings that are not a parseable PHC hash up front, so a
    /// typo in configuration surfaces at startup instead of at sign-in.
    pub fn new(phc: impl Into<String>) -> Result<Self, AuthError> {
        let phc = phc.into();
        PasswordHash::new(&phc).map_err(|e| AuthError::InvalidHash {
            reason: e.to_string(),
        })?;
        Ok(Self { phc })
    }
}

impl AuthProvider for Argon2AuthProvider {
    fn verify(&self, passphrase: &SecretString) -> Result<(), AuthError> {
        let parsed = PasswordHash::new(&self.phc).map_err(|e| AuthError::InvalidHash {
            reason: e.to_string(),
        })?;
        Argon2::default()
            .verify_password(passphrase.expose_secret().as_bytes(), &parsed)
            .map_err(|_| {
                warn!("Admin sign-in rejected");
                AuthError::InvalidCredentials
            })
    }
}

/// Used when no hash is configured; every attempt fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledAuth;

impl AuthProvider for DisabledAuth {
    fn verify(&self, _passphrase: &SecretString) -> Result<(), AuthError> {
        Err(AuthError::NotConfigured)
    }
}

/// Produces a PHC string for `admin_passphrase_hash`.
pub fn hash_passphrase(passphrase: &SecretString) -> Result<String, AuthError> {
    let salt = SaltString::encode_b64(uuid::Uuid::new_v4().as_bytes()).map_err(|e| {
        AuthError::InvalidHash {
            reason: e.to_string(),
        }
    })?;
    Argon2::default()
        .hash_password(passphrase.expose_secret().as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::InvalidHash {
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(s: &str) -> SecretString {
        SecretString::new(s.to_string())
    }

    #[test]
    fn verifies_matching_passphrase_only() {
        let salt = SaltString::from_b64("c2FsdHNhbHRzYWx0c2FsdA").unwrap();
        let phc = Argon2::default()
            .hash_password(b"pharmacist", &salt)
            .unwrap()
            .to_string();
        let auth = Argon2AuthProvider::new(phc).unwrap();

        assert_eq!(auth.verify(&secret("pharmacist")), Ok(()));
        assert_eq!(
            auth.verify(&secret("Pharmacist")),
            Err(AuthError::InvalidCredentials)
        );
    }

    #[test]
    fn generated_hashes_are_salted() {
        let a = hash_passphrase(&secret("same")).unwrap();
        let b = hash_passphrase(&secret("same")).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("$argon2id$"));
        assert!(Argon2AuthProvider::new(a).unwrap().verify(&secret("same")).is_ok());
    }

    #[test]
    fn malformed_hash_is_rejected_at_construction() {
        assert!(matches!(
            Argon2AuthProvider::new("not-a-hash"),
            Err(AuthError::InvalidHash { .. })
        ));
    }

    #[test]
    fn disabled_auth_never_signs_in() {
        assert_eq!(
            DisabledAuth.verify(&secret("anything")),
            Err(AuthError::NotConfigured)
        );
    }
}
