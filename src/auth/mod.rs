pub mod session;
pub mod users;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::AccessTier;
use crate::snapshot::store::StoreError;

pub use session::{SessionKeys, SESSION_COOKIE};
pub use users::SqliteAuthenticator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// Deliberately identical for unknown users and wrong passwords.
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("invalid or expired session")]
    InvalidSession,
    #[error("failed hashing password: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("failed issuing session token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("user store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("auth worker failed: {0}")]
    Worker(String),
}

/// Credential check behind the login form. `Ok(None)` means the credentials
/// were rejected.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, credentials: &Credentials) -> Result<Option<Identity>, AuthError>;
}

pub fn tier_for(identity: Option<&Identity>) -> AccessTier {
    match identity {
        Some(_) => AccessTier::Authenticated,
        None => AccessTier::Anonymous,
    }
}
