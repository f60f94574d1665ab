use crate::pipeline::{DeletePipeline, SoftDelete};
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use burrow_core::{ReadRepository, Repository, Result, ShortUrl, StorageError, User, UserId};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::sync::Arc;

/// PostgreSQL implementation of the repository contract.
///
/// Soft delete is implemented with the `deleted` column; reads return
/// soft-deleted rows as they are and leave filtering to the caller. Foreign
/// keys are enforced by the database: creating a short URL for an unknown
/// user fails with `NotFound`.
#[derive(Debug, Clone)]
pub struct PgRepository {
    store: Arc<PgStore>,
    pipeline: DeletePipeline<PgStore>,
}

/// The pool, shared with the delete pipeline lanes.
#[derive(Debug)]
pub(crate) struct PgStore {
    pool: PgPool,
}

impl PgRepository {
    /// Creates a repository from an existing connection pool.
    pub fn new(pool: PgPool, lanes: usize, shutdown: Shutdown) -> Self {
        let store = Arc::new(PgStore { pool });
        let pipeline = DeletePipeline::new(Arc::clone(&store), lanes, shutdown);
        Self { store, pipeline }
    }

    /// Creates a repository by opening a new connection pool.
    pub async fn connect(database_url: &str, lanes: usize, shutdown: Shutdown) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self::new(pool, lanes, shutdown))
    }

    /// Returns a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.store.pool
    }
}

/// `users.id` is a 32-bit `SERIAL`.
fn to_db_id(id: UserId) -> Option<i32> {
    i32::try_from(id).ok()
}

fn from_db_id(id: i32) -> Result<UserId> {
    UserId::try_from(id)
        .map_err(|_| StorageError::InvalidData(format!("negative user id {id} in database")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(sqlx::error::DatabaseError::is_unique_violation)
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(sqlx::error::DatabaseError::is_foreign_key_violation)
}

fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    let message = err.to_string();

    match err {
        sqlx::Error::PoolTimedOut => StorageError::Timeout(message),
        sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StorageError::Unavailable(message),
        sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_) => StorageError::InvalidData(message),
        _ => StorageError::Query(message),
    }
}

fn short_url_from_row(row: &PgRow) -> Result<ShortUrl> {
    let user_id: i32 = row.try_get("user_id").map_err(map_sqlx_error)?;
    Ok(ShortUrl {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        original_url: row.try_get("original_url").map_err(map_sqlx_error)?,
        user_id: from_db_id(user_id)?,
        deleted: row.try_get("deleted").map_err(map_sqlx_error)?,
    })
}

#[async_trait]
impl SoftDelete for PgStore {
    async fn soft_delete(&self, owner_id: UserId, ids: &[String]) -> Result<Vec<String>> {
        let Some(owner_id) = to_db_id(owner_id) else {
            return Ok(Vec::new());
        };

        sqlx::query_scalar::<_, String>(
            r#"
            UPDATE short_urls
            SET deleted = true
            WHERE user_id = $1
              AND id = ANY($2)
              AND NOT deleted
            RETURNING id
            "#,
        )
        .bind(owner_id)
        .bind(ids.to_vec())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }
}

#[async_trait]
impl ReadRepository for PgRepository {
    async fn user_get_by_id(&self, id: UserId) -> Result<User> {
        let not_found = || StorageError::NotFound(format!("user {id}"));
        let db_id = to_db_id(id).ok_or_else(not_found)?;

        let row = sqlx::query("SELECT id FROM users WHERE id = $1")
            .bind(db_id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(not_found)?;

        let id: i32 = row.try_get("id").map_err(map_sqlx_error)?;
        Ok(User::with_id(from_db_id(id)?))
    }

    async fn user_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(count.unsigned_abs())
    }

    async fn short_url_get_by_id(&self, id: &str) -> Result<ShortUrl> {
        let row = sqlx::query(
            r#"
            SELECT id, original_url, user_id, deleted
            FROM short_urls
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?
        .ok_or_else(|| StorageError::NotFound(format!("short url '{id}'")))?;

        short_url_from_row(&row)
    }

    async fn short_url_get_by_user_id(&self, user_id: UserId) -> Result<Vec<ShortUrl>> {
        let Some(db_id) = to_db_id(user_id) else {
            return Ok(Vec::new());
        };

        // No ORDER BY: the schema has no column recording creation order.
        let rows = sqlx::query(
            r#"
            SELECT id, original_url, user_id, deleted
            FROM short_urls
            WHERE user_id = $1
            "#,
        )
        .bind(db_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(short_url_from_row).collect()
    }

    async fn short_url_get_by_original_url(&self, original_url: &str) -> Result<ShortUrl> {
        let row = sqlx::query(
            r#"
            SELECT id, original_url, user_id, deleted
            FROM short_urls
            WHERE original_url = $1
            "#,
        )
        .bind(original_url)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?
        .ok_or_else(|| StorageError::NotFound(format!("original url '{original_url}'")))?;

        short_url_from_row(&row)
    }

    async fn short_url_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM short_urls")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(count.unsigned_abs())
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn user_create(&self, user: User) -> Result<User> {
        if user.id == 0 {
            let id: i32 = sqlx::query_scalar("INSERT INTO users DEFAULT VALUES RETURNING id")
                .fetch_one(self.pool())
                .await
                .map_err(map_sqlx_error)?;
            return Ok(User::with_id(from_db_id(id)?));
        }

        let db_id = to_db_id(user.id).ok_or_else(|| {
            StorageError::InvalidModel(format!("user id {} exceeds the INTEGER range", user.id))
        })?;

        let mut tx = self.pool().begin().await.map_err(map_sqlx_error)?;

        // Serializes explicit-ID creates against every other insert, so the
        // MAX below sees all committed rows.
        sqlx::query("LOCK TABLE users IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let inserted = sqlx::query("INSERT INTO users (id) VALUES ($1)")
            .bind(db_id)
            .execute(&mut *tx)
            .await;
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StorageError::Duplicate(format!("user {}", user.id)));
            }
            Err(err) => return Err(map_sqlx_error(err)),
        }

        // Keep the serial ahead of explicit IDs so auto IDs never collide.
        // The sequence only ever moves forward.
        sqlx::query(
            r#"
            SELECT setval(
                pg_get_serial_sequence('users', 'id'),
                GREATEST(
                    (SELECT MAX(id) FROM users),
                    pg_sequence_last_value(pg_get_serial_sequence('users', 'id')::regclass),
                    1
                )
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(user)
    }

    async fn short_url_create(&self, short_url: ShortUrl) -> Result<()> {
        short_url.validate()?;
        let user_id = to_db_id(short_url.user_id)
            .ok_or_else(|| StorageError::NotFound(format!("user {}", short_url.user_id)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO short_urls (id, original_url, user_id, deleted)
            VALUES ($1, $2, $3, false)
            "#,
        )
        .bind(&short_url.id)
        .bind(&short_url.original_url)
        .bind(user_id)
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StorageError::Duplicate(format!(
                "short url '{}' or original url '{}'",
                short_url.id, short_url.original_url
            ))),
            Err(err) if is_foreign_key_violation(&err) => Err(StorageError::NotFound(format!(
                "user {}",
                short_url.user_id
            ))),
            Err(err) => Err(map_sqlx_error(err)),
        }
    }

    async fn short_url_delete_batch(&self, owner_id: UserId, ids: Vec<String>) -> Result<u64> {
        self.pipeline.run(owner_id, ids).await
    }

    async fn close(&self) -> Result<()> {
        self.store.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_id_conversion_bounds() {
        assert_eq!(to_db_id(7), Some(7));
        assert_eq!(to_db_id(i32::MAX as u64 + 1), None);
        assert_eq!(from_db_id(3).unwrap(), 3);
        assert!(matches!(from_db_id(-1), Err(StorageError::InvalidData(_))));
    }

    #[test]
    fn pool_errors_are_classified() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolTimedOut),
            StorageError::Timeout(_)
        ));
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolClosed),
            StorageError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            StorageError::Query(_)
        ));
    }
}
