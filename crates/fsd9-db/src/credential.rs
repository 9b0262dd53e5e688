//! Credential hashing.
//!
//! New hashes are argon2id PHC strings. Stored hashes of exactly 64 hex
//! characters are unsalted SHA-256 from older databases; they still verify
//! and are replaced by an argon2 hash on the next successful login.
//!
//! Argon2 is slow on purpose. Async callers go through
//! [`verify_blocking`] and [`new_user_record_blocking`], which run it on
//! tokio's blocking pool.

use argon2::{
    password_hash::{self, rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params,
};
use fsd9_core::{DatabaseError, UserRecord};
use sha2::{Digest, Sha256};

/// Result of checking a credential against a stored hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Rejected,
    /// Credential matches. `rehash` carries a replacement hash when the
    /// stored one is outdated.
    Accepted { rehash: Option<String> },
}

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String, DatabaseError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| DatabaseError::backend(format!("Failed to hash password: {}", e)))?
        .to_string();
    Ok(password_hash)
}

/// Builds a user record with a fresh hash.
pub fn new_user_record(callsign: &str, password: &str, rating: u8) -> Result<UserRecord, DatabaseError> {
    Ok(UserRecord {
        callsign: callsign.to_string(),
        credential_hash: hash_password(password)?,
        rating,
    })
}

/// [`new_user_record`] on the blocking pool.
pub async fn new_user_record_blocking(
    callsign: &str,
    password: &str,
    rating: u8,
) -> Result<UserRecord, DatabaseError> {
    let (callsign, password) = (callsign.to_string(), password.to_string());
    tokio::task::spawn_blocking(move || new_user_record(&callsign, &password, rating))
        .await
        .map_err(|e| DatabaseError::backend(format!("Credential task failed: {}", e)))?
}

/// [`verify`] on the blocking pool.
pub async fn verify_blocking(callsign: &str, password: &str, stored: &str) -> Result<Verification, DatabaseError> {
    let (callsign, password, stored) = (callsign.to_string(), password.to_string(), stored.to_string());
    tokio::task::spawn_blocking(move || verify(&callsign, &password, &stored))
        .await
        .map_err(|e| DatabaseError::backend(format!("Credential task failed: {}", e)))?
}

fn is_legacy_sha256(stored: &str) -> bool {
    stored.len() == 64 && stored.bytes().all(|b| b.is_ascii_hexdigit())
}

/// True if an argon2 hash was made with anything but the current defaults.
fn needs_rehash(parsed: &PasswordHash<'_>) -> bool {
    if parsed.algorithm != Algorithm::Argon2id.ident() {
        return true;
    }
    match Params::try_from(parsed) {
        Ok(params) => params != Params::default(),
        Err(_) => true,
    }
}

/// Checks `password` against `stored`.
///
/// # Errors
///
/// Returns `InvalidHash` if `stored` is neither a legacy digest nor a PHC
/// string.
pub fn verify(callsign: &str, password: &str, stored: &str) -> Result<Verification, DatabaseError> {
    if is_legacy_sha256(stored) {
        let digest = hex::encode(Sha256::digest(password.as_bytes()));
        if digest.eq_ignore_ascii_case(stored) {
            return Ok(Verification::Accepted {
                rehash: Some(hash_password(password)?),
            });
        }
        return Ok(Verification::Rejected);
    }

    let parsed = PasswordHash::new(stored).map_err(|_| DatabaseError::InvalidHash {
        callsign: callsign.to_string(),
    })?;

    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => {
            let rehash = if needs_rehash(&parsed) {
                Some(hash_password(password)?)
            } else {
                None
            };
            Ok(Verification::Accepted { rehash })
        }
        Err(password_hash::Error::Password) => Ok(Verification::Rejected),
        Err(_) => Err(DatabaseError::InvalidHash {
            callsign: callsign.to_string(),
        }),
    }
}
