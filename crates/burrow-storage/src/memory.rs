use crate::pipeline::{DeletePipeline, SoftDelete};
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use burrow_core::{ReadRepository, Repository, Result, ShortUrl, StorageError, User, UserId};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// The maps behind a [`MemoryIndex`].
///
/// Only reachable through the index's lock guards, so a mutation and its
/// secondary-index bookkeeping are always applied as one unit.
#[derive(Debug)]
pub(crate) struct IndexState {
    short_urls: HashMap<String, ShortUrl>,
    users: HashMap<UserId, User>,
    /// Owned short URL IDs per user, in creation order.
    by_user: HashMap<UserId, Vec<String>>,
    /// Original URL to the ID of the record currently holding it.
    by_original: HashMap<String, String>,
    next_user_id: UserId,
}

impl IndexState {
    fn new() -> Self {
        Self {
            short_urls: HashMap::new(),
            users: HashMap::new(),
            by_user: HashMap::new(),
            by_original: HashMap::new(),
            next_user_id: 1,
        }
    }

    /// Stores `user`, assigning `next_user_id` when its ID is zero.
    ///
    /// Explicit IDs at or above `next_user_id` push the counter past them,
    /// so auto-assigned IDs never collide with anything seen before.
    pub(crate) fn insert_user(&mut self, mut user: User) -> Result<User> {
        if user.id == 0 {
            user.id = self.next_user_id;
        }
        if self.users.contains_key(&user.id) {
            return Err(StorageError::Duplicate(format!("user {}", user.id)));
        }
        if user.id >= self.next_user_id {
            self.next_user_id = user.id.saturating_add(1);
        }
        self.users.insert(user.id, user);
        Ok(user)
    }

    /// Removes a user inserted by [`Self::insert_user`]. The ID counter is
    /// left alone.
    pub(crate) fn remove_user(&mut self, id: UserId) -> Option<User> {
        self.users.remove(&id)
    }

    /// Stores a new, live short URL.
    ///
    /// Returns the ID of the soft-deleted record that previously held the
    /// same original URL, if any, so the insert can be undone precisely.
    pub(crate) fn insert_short_url(&mut self, mut short_url: ShortUrl) -> Result<Option<String>> {
        short_url.validate()?;
        short_url.deleted = false;

        if self.short_urls.contains_key(&short_url.id) {
            return Err(StorageError::Duplicate(format!("short url '{}'", short_url.id)));
        }

        let displaced = match self.by_original.get(&short_url.original_url) {
            Some(holder) if self.short_urls.get(holder).is_some_and(ShortUrl::is_active) => {
                return Err(StorageError::Duplicate(format!(
                    "original url '{}' is already shortened as '{}'",
                    short_url.original_url, holder
                )));
            }
            Some(holder) => Some(holder.clone()),
            None => None,
        };

        self.by_original
            .insert(short_url.original_url.clone(), short_url.id.clone());
        self.by_user
            .entry(short_url.user_id)
            .or_default()
            .push(short_url.id.clone());
        self.short_urls.insert(short_url.id.clone(), short_url);

        Ok(displaced)
    }

    /// Undoes [`Self::insert_short_url`], including the secondary indexes.
    pub(crate) fn remove_short_url(&mut self, id: &str, displaced: Option<String>) -> Option<ShortUrl> {
        let short_url = self.short_urls.remove(id)?;

        if let Some(owned) = self.by_user.get_mut(&short_url.user_id) {
            owned.retain(|owned_id| owned_id != id);
            if owned.is_empty() {
                self.by_user.remove(&short_url.user_id);
            }
        }

        if self
            .by_original
            .get(&short_url.original_url)
            .is_some_and(|holder| holder == id)
        {
            match displaced {
                Some(previous) => {
                    self.by_original
                        .insert(short_url.original_url.clone(), previous);
                }
                None => {
                    self.by_original.remove(&short_url.original_url);
                }
            }
        }

        Some(short_url)
    }

    /// Flags the live records in `ids` owned by `owner_id` as deleted and
    /// returns their IDs.
    pub(crate) fn soft_delete(&mut self, owner_id: UserId, ids: &[String]) -> Vec<String> {
        ids.iter()
            .filter_map(|id| {
                let short_url = self.short_urls.get_mut(id)?;
                if short_url.user_id != owner_id || short_url.deleted {
                    return None;
                }
                short_url.deleted = true;
                Some(id.clone())
            })
            .collect()
    }

    /// Clears the deleted flag again; the rollback of [`Self::soft_delete`].
    pub(crate) fn restore(&mut self, ids: &[String]) {
        for id in ids {
            if let Some(short_url) = self.short_urls.get_mut(id) {
                short_url.deleted = false;
            }
        }
    }

    fn user(&self, id: UserId) -> Result<User> {
        self.users
            .get(&id)
            .copied()
            .ok_or_else(|| StorageError::NotFound(format!("user {id}")))
    }

    fn short_url(&self, id: &str) -> Result<ShortUrl> {
        self.short_urls
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("short url '{id}'")))
    }

    fn short_urls_of(&self, user_id: UserId) -> Vec<ShortUrl> {
        self.by_user
            .get(&user_id)
            .map(|owned| {
                owned
                    .iter()
                    .filter_map(|id| self.short_urls.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn short_url_by_original(&self, original_url: &str) -> Result<ShortUrl> {
        self.by_original
            .get(original_url)
            .and_then(|id| self.short_urls.get(id))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("original url '{original_url}'")))
    }

    pub(crate) fn user_count(&self) -> u64 {
        self.users.len() as u64
    }

    pub(crate) fn short_url_count(&self) -> u64 {
        self.short_urls.len() as u64
    }
}

/// The authoritative in-process state shared by the in-memory and log-backed
/// repositories: every map lives behind a single reader/writer lock.
#[derive(Debug)]
pub struct MemoryIndex {
    state: RwLock<IndexState>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState::new()),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read()
    }

    /// Exclusive access for multi-step mutations (e.g. insert, append to the
    /// log, roll back on failure) that must not be observed half done.
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write()
    }

    pub fn user_create(&self, user: User) -> Result<User> {
        self.write().insert_user(user)
    }

    pub fn short_url_create(&self, short_url: ShortUrl) -> Result<()> {
        self.write().insert_short_url(short_url).map(|_| ())
    }

    pub fn user_get_by_id(&self, id: UserId) -> Result<User> {
        self.read().user(id)
    }

    pub fn user_count(&self) -> u64 {
        self.read().user_count()
    }

    pub fn short_url_get_by_id(&self, id: &str) -> Result<ShortUrl> {
        self.read().short_url(id)
    }

    pub fn short_url_get_by_user_id(&self, user_id: UserId) -> Vec<ShortUrl> {
        self.read().short_urls_of(user_id)
    }

    pub fn short_url_get_by_original_url(&self, original_url: &str) -> Result<ShortUrl> {
        self.read().short_url_by_original(original_url)
    }

    pub fn short_url_count(&self) -> u64 {
        self.read().short_url_count()
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SoftDelete for MemoryIndex {
    async fn soft_delete(&self, owner_id: UserId, ids: &[String]) -> Result<Vec<String>> {
        Ok(self.write().soft_delete(owner_id, ids))
    }
}

/// Volatile repository backed only by a [`MemoryIndex`].
///
/// Foreign keys are not checked: a short URL may name a user that was never
/// created.
#[derive(Debug, Clone)]
pub struct InMemoryRepository {
    index: Arc<MemoryIndex>,
    pipeline: DeletePipeline<MemoryIndex>,
}

impl InMemoryRepository {
    /// Creates an empty repository with one delete lane per CPU.
    pub fn new() -> Self {
        let index = Arc::new(MemoryIndex::new());
        let pipeline = DeletePipeline::with_default_lanes(Arc::clone(&index), Shutdown::never());
        Self { index, pipeline }
    }

    /// Creates an empty repository whose batch deletes use `lanes` workers
    /// and stop on `shutdown`.
    pub fn with_pipeline(lanes: usize, shutdown: Shutdown) -> Self {
        let index = Arc::new(MemoryIndex::new());
        let pipeline = DeletePipeline::new(Arc::clone(&index), lanes, shutdown);
        Self { index, pipeline }
    }

    pub fn index(&self) -> &MemoryIndex {
        &self.index
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadRepository for InMemoryRepository {
    async fn user_get_by_id(&self, id: UserId) -> Result<User> {
        self.index.user_get_by_id(id)
    }

    async fn user_count(&self) -> Result<u64> {
        Ok(self.index.user_count())
    }

    async fn short_url_get_by_id(&self, id: &str) -> Result<ShortUrl> {
        self.index.short_url_get_by_id(id)
    }

    async fn short_url_get_by_user_id(&self, user_id: UserId) -> Result<Vec<ShortUrl>> {
        Ok(self.index.short_url_get_by_user_id(user_id))
    }

    async fn short_url_get_by_original_url(&self, original_url: &str) -> Result<ShortUrl> {
        self.index.short_url_get_by_original_url(original_url)
    }

    async fn short_url_count(&self) -> Result<u64> {
        Ok(self.index.short_url_count())
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn user_create(&self, user: User) -> Result<User> {
        self.index.user_create(user)
    }

    async fn short_url_create(&self, short_url: ShortUrl) -> Result<()> {
        self.index.short_url_create(short_url)
    }

    async fn short_url_delete_batch(&self, owner_id: UserId, ids: Vec<String>) -> Result<u64> {
        self.pipeline.run(owner_id, ids).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
