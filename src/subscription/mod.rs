pub mod store;

use std::fmt::{Debug, Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use store::{SubscriptionStore, SubscriptionSummary, WatchLease};

/// Chat identifier of a subscriber.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SubscriberId(pub i64);

impl Display for SubscriberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SubscriberId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Portal password. Never printed, never serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl Display for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("username must not contain whitespace")]
    UsernameWhitespace,
    #[error("password must not be empty")]
    EmptySecret,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub subscriber_id: SubscriberId,
    pub username: String,
    pub secret: Secret,
}

impl Credential {
    pub fn new(
        subscriber_id: SubscriberId,
        username: &str,
        secret: &str,
    ) -> Result<Self, CredentialError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(CredentialError::EmptyUsername);
        }
        if username.chars().any(char::is_whitespace) {
            return Err(CredentialError::UsernameWhitespace);
        }
        if secret.is_empty() {
            return Err(CredentialError::EmptySecret);
        }
        Ok(Self {
            subscriber_id,
            username: username.to_string(),
            secret: Secret::new(secret),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    Idle,
    Fetching,
    Comparing,
    Notifying,
    Cancelled,
}
