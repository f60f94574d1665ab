use crate::error::Result;
use crate::model::{ShortUrl, User, UserId};
use async_trait::async_trait;

/// A read-only view of a repository.
///
/// This trait provides only the query operations from [`Repository`],
/// allowing read paths to depend on the narrower contract.
#[async_trait]
pub trait ReadRepository: Send + Sync + 'static {
    /// Returns the user with the given ID, or `Err(NotFound)`.
    async fn user_get_by_id(&self, id: UserId) -> Result<User>;

    async fn user_count(&self) -> Result<u64>;

    /// Returns the short URL with the given ID, or `Err(NotFound)`.
    /// Soft-deleted records are returned with `deleted` set.
    async fn short_url_get_by_id(&self, id: &str) -> Result<ShortUrl>;

    /// Returns every short URL owned by `user_id` in creation order.
    /// An owner without URLs yields an empty vector, not an error.
    ///
    /// Backends whose schema records no creation order (the relational one)
    /// return the URLs in whatever order their engine yields them.
    async fn short_url_get_by_user_id(&self, user_id: UserId) -> Result<Vec<ShortUrl>>;

    /// Returns the short URL pointing at `original_url`, or `Err(NotFound)`.
    async fn short_url_get_by_original_url(&self, original_url: &str) -> Result<ShortUrl>;

    /// Counts every stored short URL, soft-deleted ones included.
    async fn short_url_count(&self) -> Result<u64>;
}

#[async_trait]
pub trait Repository: ReadRepository {
    /// Stores a user, assigning the next free ID when `user.id` is zero.
    /// Returns `Err(Duplicate)` if the ID is already taken.
    async fn user_create(&self, user: User) -> Result<User>;

    /// Stores a short URL. Returns `Err(Duplicate)` if the ID is taken or
    /// an active record already points at the same original URL.
    async fn short_url_create(&self, short_url: ShortUrl) -> Result<()>;

    /// Soft-deletes the subset of `ids` owned by `owner_id`.
    ///
    /// Unknown, foreign and already-deleted IDs are skipped silently.
    /// Returns how many records were flipped.
    async fn short_url_delete_batch(&self, owner_id: UserId, ids: Vec<String>) -> Result<u64>;

    /// Releases backend resources. Calling it twice is harmless.
    async fn close(&self) -> Result<()>;
}
