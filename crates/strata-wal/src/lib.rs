//! Write-Ahead Log (WAL) for StrataDB.
//!
//! An append-only redo log of full page after-images with CRC-32 integrity
//! checks, checkpoint/truncate support, and crash recovery by replay.
//!
//! WAL protocol (enforced by the buffer pool): before a dirty page is written
//! back to the data file, its after-image must first be appended to the log.
//! On crash, every page write that reached the data file can therefore be
//! redone, along with any that did not.

pub mod log;
pub mod record;

pub use log::{RedoTarget, WriteAheadLog, WAL_FILE_HEADER_SIZE};
pub use record::{Lsn, RecordHeader, RecordKind};
