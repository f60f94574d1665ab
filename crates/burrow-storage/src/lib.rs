//! Storage backends for the Burrow repository contract.
//!
//! - [`InMemoryRepository`]: volatile, map based
//! - [`LogRepository`]: the same index made durable by an append-only log
//! - [`PgRepository`]: PostgreSQL via `sqlx`
//!
//! All three route `short_url_delete_batch` through a [`DeletePipeline`].

pub mod aof;
pub mod memory;
pub mod pipeline;
pub mod postgres;
pub mod shutdown;

pub use aof::{LogConfig, LogRepository};
pub use burrow_core::{ReadRepository, Repository, Result, ShortUrl, StorageError, User, UserId};
pub use memory::{InMemoryRepository, MemoryIndex};
pub use pipeline::{DeleteOutcome, DeletePipeline, SoftDelete};
pub use postgres::PgRepository;
pub use shutdown::{Shutdown, ShutdownTrigger};
