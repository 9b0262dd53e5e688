use async_trait::async_trait;
use fsd9_core::{DatabaseError, UserRecord};
use tracing::warn;

use crate::credential::{self, Verification};

/// Credential store used by client sessions.
///
/// Backends implement `lookup` and `upsert_user`; `authenticate` is shared
/// and takes care of legacy hash upgrades.
#[async_trait]
pub trait DatabaseGateway: Send + Sync {
    /// Fetches an account.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown callsign, `Backend` if the store failed.
    async fn lookup(&self, callsign: &str) -> Result<UserRecord, DatabaseError>;

    /// Inserts or replaces an account.
    async fn upsert_user(&self, record: UserRecord) -> Result<(), DatabaseError>;

    /// Checks a credential and returns the account on success.
    ///
    /// Unknown accounts, wrong credentials and unreadable stored hashes all
    /// come back as `AuthFailure`. Backend failures are passed through.
    /// Hashing runs off the async executor.
    async fn authenticate(&self, callsign: &str, credential: &str) -> Result<UserRecord, DatabaseError> {
        let mut record = match self.lookup(callsign).await {
            Ok(record) => record,
            Err(DatabaseError::NotFound { .. }) => return Err(DatabaseError::auth_failure(callsign)),
            Err(e) => return Err(e),
        };

        match credential::verify_blocking(callsign, credential, &record.credential_hash).await {
            Ok(Verification::Accepted { rehash }) => {
                if let Some(new_hash) = rehash {
                    record.credential_hash = new_hash;
                    if let Err(e) = self.upsert_user(record.clone()).await {
                        warn!(callsign = %callsign, error = %e, "Failed to store upgraded credential hash");
                    } else {
                        tracing::info!(callsign = %callsign, "Upgraded credential hash");
                    }
                }
                Ok(record)
            }
            Ok(Verification::Rejected) => Err(DatabaseError::auth_failure(callsign)),
            Err(e) if e.is_backend() => Err(e),
            Err(e) => {
                warn!(callsign = %callsign, error = %e, "Stored credential hash is unreadable");
                Err(DatabaseError::auth_failure(callsign))
            }
        }
    }
}
