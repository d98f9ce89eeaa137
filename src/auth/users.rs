use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};

use crate::auth::{AuthError, Authenticator, Credentials, Identity};
use crate::snapshot::store::{SnapshotStore, StoreError};
use crate::snapshot::{now_in, to_storage};

type PasswordCheck = fn(&str, &str) -> bool;

fn bcrypt_matches(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// Users live beside the observations, in the same SQLite file.
///
/// An unknown username is still checked against a throwaway hash, so both
/// rejections cost one bcrypt verification.
#[derive(Clone)]
pub struct SqliteAuthenticator {
    store: SnapshotStore,
    check: PasswordCheck,
    dummy_cost: u32,
    dummy_hash: Arc<OnceLock<String>>,
}

impl SqliteAuthenticator {
    pub fn new(store: SnapshotStore) -> Self {
        Self {
            store,
            check: bcrypt_matches,
            dummy_cost: bcrypt::DEFAULT_COST,
            dummy_hash: Arc::new(OnceLock::new()),
        }
    }

    /// Cost of the throwaway hash; match the cost used by `add-user`.
    pub fn with_dummy_cost(mut self, cost: u32) -> Self {
        self.dummy_cost = cost;
        self.dummy_hash = Arc::new(OnceLock::new());
        self
    }

    /// Computes the throwaway hash ahead of the first unknown-user login.
    pub fn prepare(&self) {
        let _ = self.dummy_hash();
    }

    fn dummy_hash(&self) -> &str {
        self.dummy_hash.get_or_init(|| {
            bcrypt::hash("not-a-user-password", self.dummy_cost).unwrap_or_default()
        })
    }

    /// Creates the user, or replaces the password of an existing one.
    pub fn create_user(&self, username: &str, password: &str, cost: u32) -> Result<(), AuthError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }
        let hash = bcrypt::hash(password, cost)?;
        let conn = self.store.pool().get().map_err(StoreError::from)?;
        conn.execute(
            "INSERT INTO users (username, password_hash, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(username) DO UPDATE SET password_hash = excluded.password_hash",
            params![username, hash, to_storage(&now_in(self.store.offset()))],
        )
        .map_err(StoreError::from)?;
        info!("stored credentials for user {username}");
        Ok(())
    }

    fn password_hash(&self, username: &str) -> Result<Option<String>, AuthError> {
        let conn = self.store.pool().get().map_err(StoreError::from)?;
        let hash = conn
            .query_row(
                "SELECT password_hash FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)?;
        Ok(hash)
    }

    fn verify_blocking(&self, credentials: &Credentials) -> Result<Option<Identity>, AuthError> {
        let username = credentials.username.trim();
        let Some(hash) = self.password_hash(username)? else {
            let _ = (self.check)(&credentials.password, self.dummy_hash());
            debug!("login rejected: unknown user");
            return Ok(None);
        };
        if (self.check)(&credentials.password, &hash) {
            Ok(Some(Identity {
                username: username.to_string(),
            }))
        } else {
            debug!("login rejected: wrong password");
            Ok(None)
        }
    }
}

#[async_trait]
impl Authenticator for SqliteAuthenticator {
    async fn verify(&self, credentials: &Credentials) -> Result<Option<Identity>, AuthError> {
        let this = self.clone();
        let credentials = credentials.clone();
        tokio::task::spawn_blocking(move || this.verify_blocking(&credentials))
            .await
            .map_err(|err| AuthError::Worker(err.to_string()))?
    }
}
