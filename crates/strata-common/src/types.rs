//! Key and payload types for StrataDB records.

use crate::page::DATA_SIZE;

/// Record key type. Keys are signed 32-bit integers.
pub type Key = i32;

/// A fixed-size 100-byte record payload.
///
/// Shorter input is zero-padded on construction; longer input is truncated.
/// The string view of a payload extends up to its first zero byte.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Payload([u8; DATA_SIZE]);

impl Payload {
    /// Builds a payload from arbitrary bytes, padding with zeros and
    /// truncating anything past [`DATA_SIZE`] bytes.
    pub fn from_bytes(input: &[u8]) -> Self {
        let mut buf = [0u8; DATA_SIZE];
        let len = input.len().min(DATA_SIZE);
        buf[..len].copy_from_slice(&input[..len]);
        Self(buf)
    }

    /// Wraps exactly [`DATA_SIZE`] stored bytes.
    ///
    /// # Panics
    /// Panics if `raw` is shorter than [`DATA_SIZE`]; callers pass slices cut
    /// from a page buffer.
    pub(crate) fn from_raw(raw: &[u8]) -> Self {
        let mut buf = [0u8; DATA_SIZE];
        buf.copy_from_slice(&raw[..DATA_SIZE]);
        Self(buf)
    }

    /// Returns the full stored 100 bytes.
    pub fn as_bytes(&self) -> &[u8; DATA_SIZE] {
        &self.0
    }

    /// Returns the bytes up to (not including) the first zero byte.
    pub fn as_trimmed(&self) -> &[u8] {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(DATA_SIZE);
        &self.0[..len]
    }

    /// Returns the trimmed bytes as a lossily-decoded string.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_trimmed()).into_owned()
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Payload({:?})", self.to_string_lossy())
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}
