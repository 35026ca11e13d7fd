//! Durable entities: accounts, contact methods, and OAuth clients.

pub mod account;
pub mod client;

pub use account::{Account, AccountStore, ContactMethod, NewAccount, ProviderAccount};
pub use client::{ClientRegistry, ClientWithSecret, OAuthClient, RegisterClient, UpdateClient};

use anyhow::{Context, Result};
use argon2::password_hash::SaltString;
use argon2::password_hash::rand_core::OsRng;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};

/// Hash a secret (client secret or account password) with argon2id.
pub(crate) fn hash_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("argon2 hashing failed: {e}"))
        .context("failed to hash secret")?;
    Ok(hash.to_string())
}

/// Verify a candidate against an argon2 PHC hash.
///
/// Argon2 verification re-derives and compares the digest internally,
/// which keeps the comparison independent of where they first differ.
pub(crate) fn verify_secret(hash: &str, candidate: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(candidate.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let hash = hash_secret("s3cret").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_secret(&hash, "s3cret"));
        assert!(!verify_secret(&hash, "wrong"));
        assert!(!verify_secret("not-a-hash", "s3cret"));
    }
}
