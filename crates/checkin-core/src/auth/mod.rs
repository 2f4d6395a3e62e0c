//! Session and authorization gate.
//!
//! This module provides:
//! - `Session`: persisted staff session with a one-shift expiry
//! - `authenticate`: username/password check against the user records
//! - `require`: role gate applied before every mutating operation
//! - `CredentialStore`: OS keychain storage via keyring
//! - `password`: Argon2id hashing for user records

pub mod credentials;
pub mod password;
pub mod session;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::Role;
use crate::store::{DocumentStore, StoreError};

pub use credentials::CredentialStore;
pub use password::{hash_password, is_phc_hash, verify_password};
pub use session::{Session, SessionData};

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Not logged in")]
    NotAuthenticated,

    #[error("Session expired - please log in again")]
    SessionExpired,

    #[error("This action requires the {required} role")]
    Forbidden { required: Role },

    #[error("Unknown user: {0}")]
    UserNotFound(String),

    #[error("Incorrect password")]
    IncorrectPassword,

    #[error("Password for this account has not been set up - ask an admin to reset it")]
    PasswordNotHashed,

    #[error("Password hashing failed: {0}")]
    Hashing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Check a username/password pair against the store's user records.
pub async fn authenticate(
    store: &dyn DocumentStore,
    username: &str,
    password: &str,
) -> Result<SessionData, AuthError> {
    let username = username.trim();
    let Some(user) = store.find_user(username).await? else {
        warn!(username, "Login for unknown user");
        return Err(AuthError::UserNotFound(username.to_string()));
    };

    if !verify_password(password, &user.password_hash)? {
        warn!(username, "Login with incorrect password");
        return Err(AuthError::IncorrectPassword);
    }

    info!(username = %user.username, roles = ?user.roles, "Login successful");
    Ok(SessionData {
        token: Uuid::new_v4().to_string(),
        user_id: user.id,
        username: user.username,
        roles: user.roles,
        created_at: Utc::now(),
    })
}

/// Gate an operation on a valid session holding at least `required`.
pub fn require(session: &Session, required: Role) -> Result<&SessionData, AuthError> {
    let data = session.data.as_ref().ok_or(AuthError::NotAuthenticated)?;
    if data.is_expired() {
        return Err(AuthError::SessionExpired);
    }
    if !data.has_role(required) {
        return Err(AuthError::Forbidden { required });
    }
    Ok(data)
}

/// Hash and store a new password for an existing user.
pub async fn set_password(
    store: &dyn DocumentStore,
    username: &str,
    new_password: &str,
) -> Result<(), AuthError> {
    let mut user = store
        .find_user(username)
        .await?
        .ok_or_else(|| AuthError::UserNotFound(username.to_string()))?;
    user.password_hash = hash_password(new_password)?;
    store.put_user(&user).await?;
    info!(username = %user.username, "Password updated");
    Ok(())
}
