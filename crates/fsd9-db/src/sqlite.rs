//! SQLite credential store.
//!
//! One `users` table. The connection lives behind a mutex and every query
//! runs on the blocking pool.

use async_trait::async_trait;
use fsd9_core::{DatabaseError, UserRecord};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;

use crate::gateway::DatabaseGateway;

pub struct SqliteGateway {
    connection: Arc<Mutex<Connection>>,
}

fn backend_error(e: rusqlite::Error) -> DatabaseError {
    DatabaseError::backend(e.to_string())
}

impl SqliteGateway {
    /// Create or open a credential database
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        let connection = Connection::open(path).map_err(backend_error)?;
        Self::init(connection)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let connection = Connection::open_in_memory().map_err(backend_error)?;
        Self::init(connection)
    }

    fn init(connection: Connection) -> Result<Self, DatabaseError> {
        connection
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    callsign TEXT PRIMARY KEY,
                    password TEXT NOT NULL,
                    rating INTEGER NOT NULL
                );
                "#,
            )
            .map_err(backend_error)?;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, DatabaseError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DatabaseError> + Send + 'static,
    {
        let connection = self.connection.clone();
        tokio::task::spawn_blocking(move || {
            let conn = connection.lock();
            f(&conn)
        })
        .await
        .map_err(|e| DatabaseError::backend(format!("Database task failed: {}", e)))?
    }
}

#[async_trait]
impl DatabaseGateway for SqliteGateway {
    async fn lookup(&self, callsign: &str) -> Result<UserRecord, DatabaseError> {
        let callsign = callsign.to_string();
        self.run(move |conn| {
            let mut stmt = conn
                .prepare("SELECT password, rating FROM users WHERE callsign = ?")
                .map_err(backend_error)?;

            let result: Result<(String, i64), _> =
                stmt.query_row(params![callsign], |row| Ok((row.get(0)?, row.get(1)?)));

            match result {
                Ok((credential_hash, rating)) => Ok(UserRecord {
                    callsign,
                    credential_hash,
                    rating: rating.clamp(0, u8::MAX as i64) as u8,
                }),
                Err(rusqlite::Error::QueryReturnedNoRows) => Err(DatabaseError::not_found(callsign)),
                Err(e) => Err(backend_error(e)),
            }
        })
        .await
    }

    async fn upsert_user(&self, record: UserRecord) -> Result<(), DatabaseError> {
        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO users (callsign, password, rating) VALUES (?, ?, ?)",
                params![record.callsign, record.credential_hash, record.rating as i64],
            )
            .map_err(backend_error)?;
            Ok(())
        })
        .await
    }
}
