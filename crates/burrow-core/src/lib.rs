//! Core types and traits for the Burrow link shortener.
//!
//! This crate provides the entity model, the storage error taxonomy and the
//! repository contract shared by every storage backend.

pub mod error;
pub mod model;
pub mod repository;

pub use error::{Result, StorageError};
pub use model::{ShortUrl, User, UserId};
pub use repository::{ReadRepository, Repository};
