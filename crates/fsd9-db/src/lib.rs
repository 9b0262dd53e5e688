//! # fsd9 Database
//!
//! The credential store behind client logins: the `DatabaseGateway` trait,
//! a volatile `DashMap` backend, a SQLite backend, and argon2 credential
//! hashing with in-place upgrade of legacy SHA-256 digests.

pub mod credential;
pub mod gateway;
pub mod memory;
pub mod sqlite;

use fsd9_core::config::{DatabaseBackend, DatabaseConfig, SeedUser};
use fsd9_core::DatabaseError;
use std::sync::Arc;

pub use gateway::DatabaseGateway;
pub use memory::MemoryGateway;
pub use sqlite::SqliteGateway;

/// Opens the backend selected in the configuration.
pub fn open(config: &DatabaseConfig) -> Result<Arc<dyn DatabaseGateway>, DatabaseError> {
    match config.backend {
        DatabaseBackend::Memory => {
            tracing::info!("Using in-memory credential store");
            Ok(Arc::new(MemoryGateway::new()))
        }
        DatabaseBackend::Sqlite => {
            tracing::info!(path = %config.path.display(), "Opening SQLite credential store");
            Ok(Arc::new(SqliteGateway::open(&config.path)?))
        }
    }
}

/// Creates each seed account that does not exist yet. Returns the number
/// created.
pub async fn seed_users(
    gateway: &dyn DatabaseGateway,
    users: &[SeedUser],
) -> Result<usize, DatabaseError> {
    let mut created = 0;
    for user in users {
        match gateway.lookup(&user.callsign).await {
            Ok(_) => continue,
            Err(DatabaseError::NotFound { .. }) => {
                let record =
                    credential::new_user_record_blocking(&user.callsign, &user.password, user.rating).await?;
                gateway.upsert_user(record).await?;
                tracing::info!(callsign = %user.callsign, rating = user.rating, "Seeded user");
                created += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(created)
}
