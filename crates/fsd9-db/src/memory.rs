use async_trait::async_trait;
use dashmap::DashMap;
use fsd9_core::{DatabaseError, UserRecord};

use crate::gateway::DatabaseGateway;

/// Volatile credential store.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    users: DashMap<String, UserRecord>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl DatabaseGateway for MemoryGateway {
    async fn lookup(&self, callsign: &str) -> Result<UserRecord, DatabaseError> {
        self.users
            .get(callsign)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DatabaseError::not_found(callsign))
    }

    async fn upsert_user(&self, record: UserRecord) -> Result<(), DatabaseError> {
        self.users.insert(record.callsign.clone(), record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::new_user_record;
    use sha2::{Digest, Sha256};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_authenticate() {
        let gateway = MemoryGateway::new();
        gateway
            .upsert_user(new_user_record("1000001", "hunter2", 5).unwrap())
            .await
            .unwrap();

        let record = gateway.authenticate("1000001", "hunter2").await.unwrap();
        assert_eq!(record.rating, 5);

        assert!(matches!(
            gateway.authenticate("1000001", "wrong").await,
            Err(DatabaseError::AuthFailure { .. })
        ));
        assert!(matches!(
            gateway.authenticate("9999999", "hunter2").await,
            Err(DatabaseError::AuthFailure { .. })
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_authenticate_leaves_executor_free() {
        let gateway = MemoryGateway::new();
        gateway
            .upsert_user(new_user_record("1000001", "hunter2", 5).unwrap())
            .await
            .unwrap();

        // A timer on the same thread must fire while the hash is checked
        let ticked = AtomicBool::new(false);
        let auth = async {
            let result = gateway.authenticate("1000001", "wrong").await;
            (result, ticked.load(Ordering::SeqCst))
        };
        let tick = async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            ticked.store(true, Ordering::SeqCst);
        };

        let ((result, ticked_during_auth), ()) = tokio::join!(auth, tick);
        assert!(matches!(result, Err(DatabaseError::AuthFailure { .. })));
        assert!(ticked_during_auth);
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let gateway = MemoryGateway::new();
        assert!(matches!(
            gateway.lookup("1000001").await,
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_legacy_hash_upgraded_on_login() {
        let gateway = MemoryGateway::new();
        gateway
            .upsert_user(UserRecord {
                callsign: "1000002".to_string(),
                credential_hash: hex::encode(Sha256::digest(b"secret")),
                rating: 2,
            })
            .await
            .unwrap();

        gateway.authenticate("1000002", "secret").await.unwrap();
        let stored = gateway.lookup("1000002").await.unwrap();
        assert!(stored.credential_hash.starts_with("$argon2id$"));

        // still valid after the upgrade
        assert!(gateway.authenticate("1000002", "secret").await.is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_hash_is_auth_failure() {
        let gateway = MemoryGateway::new();
        gateway
            .upsert_user(UserRecord {
                callsign: "1000003".to_string(),
                credential_hash: "???".to_string(),
                rating: 1,
            })
            .await
            .unwrap();

        assert!(matches!(
            gateway.authenticate("1000003", "x").await,
            Err(DatabaseError::AuthFailure { .. })
        ));
    }
}
