//! Error types for StrataDB.

use crate::page::PageId;
use thiserror::Error;

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur in StrataDB operations.
#[derive(Debug, Error)]
pub enum StrataError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Tree errors
    #[error("key not found")]
    KeyNotFound,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corrupted index: {0}")]
    Corrupted(String),

    // Store errors
    #[error("page offset {offset} out of range (file size {file_size})")]
    PageOutOfRange { offset: i64, file_size: u64 },

    // Buffer pool errors
    #[error("buffer pool exhausted, all frames pinned")]
    PoolExhausted,

    #[error("page not cached: {page_id}")]
    PageNotCached { page_id: PageId },

    #[error("page still pinned: {page_id}")]
    PagePinned { page_id: PageId },

    // WAL errors
    #[error("WAL corrupted: {0}")]
    WalCorrupted(String),
}
