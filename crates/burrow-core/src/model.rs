use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};

/// Identifier of a [`User`]. Zero means "not assigned yet".
pub type UserId = u64;

/// An owner of short URLs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
}

impl User {
    /// A user whose ID will be assigned by the repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// A user with a caller-chosen ID.
    pub fn with_id(id: UserId) -> Self {
        Self { id }
    }
}

/// A stored short URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortUrl {
    /// The short code, used as the lookup key.
    pub id: String,
    /// The URL the short code redirects to.
    pub original_url: String,
    /// The owning user.
    pub user_id: UserId,
    /// Soft-delete marker.
    #[serde(default)]
    pub deleted: bool,
}

impl ShortUrl {
    /// Creates a live (not deleted) short URL.
    pub fn new(id: impl Into<String>, original_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            id: id.into(),
            original_url: original_url.into(),
            user_id,
            deleted: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Rejects records missing a required field.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(StorageError::InvalidModel(
                "short url id cannot be empty".to_string(),
            ));
        }
        if self.original_url.is_empty() {
            return Err(StorageError::InvalidModel(format!(
                "original url of '{}' cannot be empty",
                self.id
            )));
        }
        Ok(())
    }
}
