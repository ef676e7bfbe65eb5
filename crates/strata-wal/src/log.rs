//! Append-only write-ahead log with redo-only crash recovery.
//!
//! File format:
//! ```text
//! [FileHeader: magic(4) | version(4) | checkpoint_lsn(8)]
//! [Record 0: 32-byte header | payload...]
//! [Record 1: ...]
//! ```
//!
//! Recovery reads every valid record, locates the last completed checkpoint,
//! and replays all later page after-images into the store. A torn tail from a
//! crash (short read, invalid type, checksum mismatch) simply terminates the
//! scan; everything before it is considered valid.

use crate::record::{Lsn, RecordHeader, RecordKind};
use bytes::{Buf, BufMut, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use strata_common::{PageId, Result, StrataError, PAGE_SIZE};
use tracing::{debug, info};

/// Magic identifying a WAL file ("WAL1").
pub const WAL_MAGIC: u32 = 0x5741_4C31;

/// Current WAL format version.
pub const WAL_VERSION: u32 = 1;

/// Size of the WAL file header in bytes.
pub const WAL_FILE_HEADER_SIZE: usize = 16;

/// Destination for replayed page after-images during recovery.
///
/// Implemented by the paged store; `apply_page_image` must grow the backing
/// file as needed so the page offset is in range before copying.
pub trait RedoTarget {
    /// Copies a full page after-image into the store.
    fn apply_page_image(&mut self, page_id: PageId, image: &[u8]) -> Result<()>;

    /// Makes all applied images durable.
    fn sync(&mut self) -> Result<()>;
}

/// Append-only write-ahead log over a single file.
pub struct WriteAheadLog {
    path: PathBuf,
    file: File,
    next_lsn: u64,
    checkpoint_lsn: u64,
    bytes_written: u64,
    records_written: u64,
}

impl WriteAheadLog {
    /// Opens (or creates) a WAL file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let mut wal = Self {
            path,
            file,
            next_lsn: Lsn::FIRST.0,
            checkpoint_lsn: 0,
            bytes_written: 0,
            records_written: 0,
        };

        if len == 0 {
            wal.write_file_header()?;
            wal.file.sync_data()?;
        } else {
            wal.read_file_header()?;

            let (records, valid_end) = wal.read_valid_records()?;
            // LSNs resume past both the highest surviving record and the
            // recorded checkpoint so post-checkpoint records always compare
            // greater than the replay cutoff.
            let last = records.last().map(|(hdr, _)| hdr.lsn.0).unwrap_or(0);
            wal.next_lsn = last.max(wal.checkpoint_lsn) + 1;

            // Drop any torn tail so future appends stay reachable by the scan.
            if len > valid_end {
                wal.file.set_len(valid_end)?;
            }
        }

        debug!(path = %wal.path.display(), next_lsn = wal.next_lsn, "WAL opened");
        Ok(wal)
    }

    /// Returns the path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the next LSN that will be assigned.
    pub fn current_lsn(&self) -> Lsn {
        Lsn(self.next_lsn)
    }

    /// Returns the LSN of the last completed checkpoint.
    pub fn checkpoint_lsn(&self) -> u64 {
        self.checkpoint_lsn
    }

    /// Returns the total payload and header bytes appended.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Returns the number of records appended.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Appends a full page after-image to the log.
    pub fn log_page_write(&mut self, page_id: PageId, image: &[u8]) -> Result<Lsn> {
        debug_assert_eq!(image.len(), PAGE_SIZE);
        self.append_record(RecordKind::PageWrite, page_id, image)
    }

    /// Marks the beginning of a checkpoint.
    pub fn begin_checkpoint(&mut self) -> Result<Lsn> {
        let lsn = self.append_record(RecordKind::CheckpointBegin, PageId::INVALID, &[])?;
        self.flush()?;
        Ok(lsn)
    }

    /// Marks the end of a checkpoint, then truncates the log.
    ///
    /// All dirty pages must already have been flushed (and therefore logged)
    /// by the buffer pool before this is called.
    pub fn end_checkpoint(&mut self) -> Result<Lsn> {
        let lsn = self.append_record(RecordKind::CheckpointEnd, PageId::INVALID, &[])?;
        self.flush()?;

        self.checkpoint_lsn = lsn.0;
        self.write_file_header()?;
        self.file.sync_data()?;

        self.truncate()?;
        debug!(checkpoint_lsn = lsn.0, "checkpoint complete, log truncated");
        Ok(lsn)
    }

    /// Force-flushes the log file to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Replays logged page writes into `target` to restore consistency.
    ///
    /// Should be called once on startup before normal operations. Returns the
    /// number of pages replayed.
    pub fn recover<T: RedoTarget>(&mut self, target: &mut T) -> Result<usize> {
        let (records, _) = self.read_valid_records()?;

        // The replay cutoff is the last completed checkpoint: in-file end
        // marker if present, otherwise the header's recorded LSN.
        let mut redo_after = self.checkpoint_lsn;
        for (hdr, _) in records.iter().rev() {
            if hdr.kind == RecordKind::CheckpointEnd {
                redo_after = hdr.lsn.0;
                break;
            }
        }

        let mut replayed = 0usize;
        for (hdr, data) in &records {
            if hdr.lsn.0 <= redo_after {
                continue;
            }
            if hdr.kind != RecordKind::PageWrite {
                continue;
            }
            if !hdr.page_id.is_valid() || data.len() != PAGE_SIZE {
                continue;
            }
            target.apply_page_image(hdr.page_id, data)?;
            replayed += 1;
        }

        if replayed > 0 {
            target.sync()?;
        }

        if let Some((hdr, _)) = records.last() {
            self.next_lsn = self.next_lsn.max(hdr.lsn.0 + 1);
        }

        // Everything valid has been applied; reset the log.
        if replayed > 0 {
            self.truncate()?;
            info!(replayed, path = %self.path.display(), "WAL recovery replayed pages");
        }

        Ok(replayed)
    }

    fn append_record(&mut self, kind: RecordKind, page_id: PageId, data: &[u8]) -> Result<Lsn> {
        let lsn = Lsn(self.next_lsn);
        self.next_lsn += 1;

        let mut hdr = RecordHeader::new(lsn, kind, page_id, data.len() as u32);
        hdr.seal(data);

        let mut buf = BytesMut::with_capacity(RecordHeader::SIZE + data.len());
        buf.put_slice(&hdr.encode());
        buf.put_slice(data);

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&buf)?;

        self.bytes_written += buf.len() as u64;
        self.records_written += 1;
        Ok(lsn)
    }

    fn write_file_header(&mut self) -> Result<()> {
        let mut buf = [0u8; WAL_FILE_HEADER_SIZE];
        let mut cursor = &mut buf[..];
        cursor.put_u32_le(WAL_MAGIC);
        cursor.put_u32_le(WAL_VERSION);
        cursor.put_u64_le(self.checkpoint_lsn);

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    fn read_file_header(&mut self) -> Result<()> {
        let mut buf = [0u8; WAL_FILE_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf)?;

        let mut cursor = &buf[..];
        let magic = cursor.get_u32_le();
        let version = cursor.get_u32_le();
        let checkpoint_lsn = cursor.get_u64_le();

        if magic != WAL_MAGIC {
            return Err(StrataError::WalCorrupted(format!(
                "bad magic: {magic:#010x}"
            )));
        }
        if version != WAL_VERSION {
            return Err(StrataError::WalCorrupted(format!(
                "unsupported version: {version}"
            )));
        }

        self.checkpoint_lsn = checkpoint_lsn;
        Ok(())
    }

    /// Reads all valid records and the file offset where validity ends.
    ///
    /// Any failure — short read, zero LSN, invalid type, oversized payload,
    /// checksum mismatch — terminates the scan without error; records up to
    /// that point are valid. This tolerates torn tail writes from a crash.
    fn read_valid_records(&mut self) -> Result<(Vec<(RecordHeader, Vec<u8>)>, u64)> {
        let mut records = Vec::new();
        let mut pos = WAL_FILE_HEADER_SIZE as u64;
        self.file.seek(SeekFrom::Start(pos))?;

        loop {
            let mut hdr_buf = [0u8; RecordHeader::SIZE];
            if self.file.read_exact(&mut hdr_buf).is_err() {
                break;
            }
            let hdr = match RecordHeader::decode(&hdr_buf) {
                Ok(hdr) => hdr,
                Err(_) => break,
            };
            if !hdr.lsn.is_valid() || hdr.kind == RecordKind::Invalid {
                break;
            }
            if hdr.data_len as usize > PAGE_SIZE {
                break;
            }

            let mut data = vec![0u8; hdr.data_len as usize];
            if !data.is_empty() && self.file.read_exact(&mut data).is_err() {
                break;
            }
            if !hdr.verify(&data) {
                break;
            }

            pos += (RecordHeader::SIZE + data.len()) as u64;
            records.push((hdr, data));
        }

        Ok((records, pos))
    }

    /// Resets the log file to just the file header.
    fn truncate(&mut self) -> Result<()> {
        self.file.set_len(WAL_FILE_HEADER_SIZE as u64)?;
        self.write_file_header()?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl Drop for WriteAheadLog {
    fn drop(&mut self) {
        let _ = self.file.sync_data();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    /// In-memory redo target for recovery tests.
    #[derive(Default)]
    struct MemTarget {
        pages: HashMap<PageId, Vec<u8>>,
        synced: bool,
    }

    impl RedoTarget for MemTarget {
        fn apply_page_image(&mut self, page_id: PageId, image: &[u8]) -> Result<()> {
            self.pages.insert(page_id, image.to_vec());
            Ok(())
        }

        fn sync(&mut self) -> Result<()> {
            self.synced = true;
            Ok(())
        }
    }

    fn page_image(fill: u8) -> Vec<u8> {
        vec![fill; PAGE_SIZE]
    }

    #[test]
    fn test_fresh_log_has_header_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let wal = WriteAheadLog::open(&path).unwrap();
        assert_eq!(wal.current_lsn(), Lsn::FIRST);
        assert_eq!(wal.checkpoint_lsn(), 0);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            WAL_FILE_HEADER_SIZE as u64
        );
    }

    #[test]
    fn test_log_page_write_counters() {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::open(dir.path().join("test.wal")).unwrap();

        let lsn1 = wal.log_page_write(PageId(4096), &page_image(1)).unwrap();
        let lsn2 = wal.log_page_write(PageId(8192), &page_image(2)).unwrap();

        assert_eq!(lsn1, Lsn(1));
        assert_eq!(lsn2, Lsn(2));
        assert_eq!(wal.records_written(), 2);
        assert_eq!(
            wal.bytes_written(),
            2 * (RecordHeader::SIZE + PAGE_SIZE) as u64
        );
    }

    #[test]
    fn test_reopen_continues_lsn() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let mut wal = WriteAheadLog::open(&path).unwrap();
            wal.log_page_write(PageId(4096), &page_image(1)).unwrap();
            wal.log_page_write(PageId(8192), &page_image(2)).unwrap();
            wal.flush().unwrap();
        }

        let wal = WriteAheadLog::open(&path).unwrap();
        assert_eq!(wal.current_lsn(), Lsn(3));
    }

    #[test]
    fn test_recover_replays_page_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let mut wal = WriteAheadLog::open(&path).unwrap();
            wal.log_page_write(PageId(4096), &page_image(0xAA)).unwrap();
            wal.log_page_write(PageId(8192), &page_image(0xBB)).unwrap();
            wal.flush().unwrap();
        }

        let mut wal = WriteAheadLog::open(&path).unwrap();
        let mut target = MemTarget::default();
        let replayed = wal.recover(&mut target).unwrap();

        assert_eq!(replayed, 2);
        assert!(target.synced);
        assert_eq!(target.pages[&PageId(4096)], page_image(0xAA));
        assert_eq!(target.pages[&PageId(8192)], page_image(0xBB));

        // The log was truncated after replay.
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            WAL_FILE_HEADER_SIZE as u64
        );
    }

    #[test]
    fn test_recover_applies_latest_image_last() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let mut wal = WriteAheadLog::open(&path).unwrap();
            wal.log_page_write(PageId(4096), &page_image(1)).unwrap();
            wal.log_page_write(PageId(4096), &page_image(2)).unwrap();
            wal.flush().unwrap();
        }

        let mut wal = WriteAheadLog::open(&path).unwrap();
        let mut target = MemTarget::default();
        wal.recover(&mut target).unwrap();
        assert_eq!(target.pages[&PageId(4096)], page_image(2));
    }

    #[test]
    fn test_end_checkpoint_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let mut wal = WriteAheadLog::open(&path).unwrap();
        wal.log_page_write(PageId(4096), &page_image(1)).unwrap();
        wal.begin_checkpoint().unwrap();
        let end_lsn = wal.end_checkpoint().unwrap();

        assert_eq!(wal.checkpoint_lsn(), end_lsn.0);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            WAL_FILE_HEADER_SIZE as u64
        );
    }

    #[test]
    fn test_recovery_skips_records_before_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let mut wal = WriteAheadLog::open(&path).unwrap();
            wal.log_page_write(PageId(4096), &page_image(1)).unwrap();
            wal.begin_checkpoint().unwrap();
            wal.end_checkpoint().unwrap();
            // Post-checkpoint write that never reached the data file.
            wal.log_page_write(PageId(8192), &page_image(9)).unwrap();
            wal.flush().unwrap();
        }

        let mut wal = WriteAheadLog::open(&path).unwrap();
        let mut target = MemTarget::default();
        let replayed = wal.recover(&mut target).unwrap();

        assert_eq!(replayed, 1);
        assert!(!target.pages.contains_key(&PageId(4096)));
        assert_eq!(target.pages[&PageId(8192)], page_image(9));
    }

    #[test]
    fn test_lsn_resumes_past_checkpoint_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let checkpoint_lsn;
        {
            let mut wal = WriteAheadLog::open(&path).unwrap();
            for i in 0..5 {
                wal.log_page_write(PageId(4096 * (i + 1)), &page_image(i as u8))
                    .unwrap();
            }
            wal.begin_checkpoint().unwrap();
            checkpoint_lsn = wal.end_checkpoint().unwrap().0;
        }

        // New records must sort after the recorded checkpoint or recovery
        // would skip them.
        let mut wal = WriteAheadLog::open(&path).unwrap();
        assert!(wal.current_lsn().0 > checkpoint_lsn);

        let lsn = wal.log_page_write(PageId(4096), &page_image(7)).unwrap();
        wal.flush().unwrap();
        drop(wal);

        let mut wal = WriteAheadLog::open(&path).unwrap();
        let mut target = MemTarget::default();
        assert_eq!(wal.recover(&mut target).unwrap(), 1);
        assert!(lsn.0 > checkpoint_lsn);
        assert_eq!(target.pages[&PageId(4096)], page_image(7));
    }

    #[test]
    fn test_torn_tail_stops_scan_silently() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let mut wal = WriteAheadLog::open(&path).unwrap();
            wal.log_page_write(PageId(4096), &page_image(1)).unwrap();
            wal.flush().unwrap();
        }

        // Simulate a torn write: garbage after the last valid record.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xDE, 0xAD, 0xBE, 0xEF, 0x01]).unwrap();
        }

        let mut wal = WriteAheadLog::open(&path).unwrap();
        let mut target = MemTarget::default();
        let replayed = wal.recover(&mut target).unwrap();

        assert_eq!(replayed, 1);
        assert_eq!(target.pages[&PageId(4096)], page_image(1));
    }

    #[test]
    fn test_corrupted_payload_stops_scan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let mut wal = WriteAheadLog::open(&path).unwrap();
            wal.log_page_write(PageId(4096), &page_image(1)).unwrap();
            wal.log_page_write(PageId(8192), &page_image(2)).unwrap();
            wal.flush().unwrap();
        }

        // Flip a byte inside the second record's payload.
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let offset =
                WAL_FILE_HEADER_SIZE + 2 * RecordHeader::SIZE + PAGE_SIZE + PAGE_SIZE / 2;
            file.seek(SeekFrom::Start(offset as u64)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }

        let mut wal = WriteAheadLog::open(&path).unwrap();
        let mut target = MemTarget::default();
        let replayed = wal.recover(&mut target).unwrap();

        // The first record survives; the scan stops at the corrupt one.
        assert_eq!(replayed, 1);
        assert!(target.pages.contains_key(&PageId(4096)));
        assert!(!target.pages.contains_key(&PageId(8192)));
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        std::fs::write(&path, [0u8; WAL_FILE_HEADER_SIZE]).unwrap();

        assert!(matches!(
            WriteAheadLog::open(&path),
            Err(StrataError::WalCorrupted(_))
        ));
    }

    #[test]
    fn test_recover_empty_log_is_noop() {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::open(dir.path().join("test.wal")).unwrap();

        let mut target = MemTarget::default();
        assert_eq!(wal.recover(&mut target).unwrap(), 0);
        assert!(target.pages.is_empty());
        assert!(!target.synced);
    }
}
