//! WAL log record format.

use bytes::{Buf, BufMut};
use strata_common::{PageId, Result, StrataError};

/// Log Sequence Number - unique identifier for each log record.
///
/// LSNs are assigned at append time and are strictly increasing: starting at
/// 1 for a fresh log, and past both the highest on-disk record and the
/// recorded checkpoint after a reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Invalid/uninitialized LSN.
    pub const INVALID: Lsn = Lsn(0);

    /// First valid LSN.
    pub const FIRST: Lsn = Lsn(1);

    /// Returns true if this is a valid LSN.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Types of log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RecordKind {
    /// Invalid/padding record.
    Invalid = 0,
    /// Full page after-image (payload is exactly one page).
    PageWrite = 1,
    /// Marks the start of a checkpoint.
    CheckpointBegin = 2,
    /// Marks the end of a checkpoint (all dirty pages flushed).
    CheckpointEnd = 3,
}

impl TryFrom<u32> for RecordKind {
    type Error = StrataError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(RecordKind::Invalid),
            1 => Ok(RecordKind::PageWrite),
            2 => Ok(RecordKind::CheckpointBegin),
            3 => Ok(RecordKind::CheckpointEnd),
            _ => Err(StrataError::WalCorrupted(format!(
                "invalid record kind: {value}"
            ))),
        }
    }
}

/// Header for each log record, immediately followed by `data_len` payload
/// bytes.
///
/// On-disk layout (32 bytes, little-endian):
/// ```text
/// Offset  Size  Field
/// ------  ----  -----------------------------
/// 0       8     lsn       (u64)
/// 8       4     kind      (u32)
/// 12      4     reserved  (zero)
/// 16      8     page_id   (i64, -1 when none)
/// 24      4     data_len  (u32)
/// 28      4     checksum  (u32)
/// ```
///
/// The checksum is the CRC-32 of the 32-byte header with the checksum field
/// zeroed, XORed with the CRC-32 of the payload (or 0 when there is none).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// LSN of this record.
    pub lsn: Lsn,
    /// Type of this record.
    pub kind: RecordKind,
    /// Page this record applies to ([`PageId::INVALID`] for markers).
    pub page_id: PageId,
    /// Bytes of payload following this header.
    pub data_len: u32,
    /// Integrity checksum over header and payload.
    pub checksum: u32,
}

impl RecordHeader {
    /// Size of the record header in bytes.
    pub const SIZE: usize = 32;

    /// Creates an unsealed header (checksum zero).
    pub fn new(lsn: Lsn, kind: RecordKind, page_id: PageId, data_len: u32) -> Self {
        Self {
            lsn,
            kind,
            page_id,
            data_len,
            checksum: 0,
        }
    }

    /// Serializes this header to its on-disk form.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut cursor = &mut buf[..];
        cursor.put_u64_le(self.lsn.0);
        cursor.put_u32_le(self.kind as u32);
        cursor.put_u32_le(0); // reserved
        cursor.put_i64_le(self.page_id.0);
        cursor.put_u32_le(self.data_len);
        cursor.put_u32_le(self.checksum);
        buf
    }

    /// Deserializes a header from its on-disk form.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(StrataError::WalCorrupted(
                "short record header".to_string(),
            ));
        }

        let lsn = Lsn(buf.get_u64_le());
        let kind_raw = buf.get_u32_le();
        let _reserved = buf.get_u32_le();
        let page_id = PageId(buf.get_i64_le());
        let data_len = buf.get_u32_le();
        let checksum = buf.get_u32_le();
        let kind = RecordKind::try_from(kind_raw)?;

        Ok(Self {
            lsn,
            kind,
            page_id,
            data_len,
            checksum,
        })
    }

    /// Computes the checksum this header should carry for `payload`.
    pub fn expected_checksum(&self, payload: &[u8]) -> u32 {
        let mut zeroed = *self;
        zeroed.checksum = 0;
        let mut crc = crc32fast::hash(&zeroed.encode());
        if !payload.is_empty() {
            crc ^= crc32fast::hash(payload);
        }
        crc
    }

    /// Fills in the checksum field for `payload`.
    pub fn seal(&mut self, payload: &[u8]) {
        self.checksum = self.expected_checksum(payload);
    }

    /// Verifies the stored checksum against `payload`.
    pub fn verify(&self, payload: &[u8]) -> bool {
        self.checksum == self.expected_checksum(payload)
    }
}
