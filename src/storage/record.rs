//! Log record types
//!
//! The record format is:
//!
//! ```text
//! +------------------+
//! | Record Length    | (u32 LE, total including this field and checksum)
//! +------------------+
//! | Kind             | (u8: 0 = live, 1 = tombstone)
//! +------------------+
//! | Composite Key    | (length-prefixed bytes)
//! +------------------+
//! | Value            | (length-prefixed bytes, empty for tombstones)
//! +------------------+
//! | Checksum         | (u32 LE)
//! +------------------+
//! ```
//!
//! Checksum covers all bytes except the checksum itself.

use std::io::{self, Read};

use super::checksum::compute_checksum;

/// Smallest possible record: length + kind + key length + value length + checksum
pub const MIN_RECORD_SIZE: usize = 4 + 1 + 4 + 4 + 4;

/// Largest record the u32 length field can frame
pub const MAX_RECORD_SIZE: usize = u32::MAX as usize;

/// Whether a record sets or removes its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Key holds the record's value
    Live,
    /// Key was deleted
    Tombstone,
}

impl RecordKind {
    fn to_byte(self) -> u8 {
        match self {
            RecordKind::Live => 0,
            RecordKind::Tombstone => 1,
        }
    }

    fn from_byte(b: u8) -> io::Result<Self> {
        match b {
            0 => Ok(RecordKind::Live),
            1 => Ok(RecordKind::Tombstone),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown record kind: {}", other),
            )),
        }
    }
}

/// A single entry in the append-only log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Set or delete
    pub kind: RecordKind,
    /// Composite namespace key
    pub key: Vec<u8>,
    /// Value bytes (empty for tombstones)
    pub value: Vec<u8>,
}

impl LogRecord {
    /// A live record carrying `value`
    pub fn live(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            kind: RecordKind::Live,
            key,
            value,
        }
    }

    /// A tombstone for `key`
    pub fn tombstone(key: Vec<u8>) -> Self {
        Self {
            kind: RecordKind::Tombstone,
            key,
            value: Vec::new(),
        }
    }

    /// Whether this record deletes its key
    pub fn is_tombstone(&self) -> bool {
        self.kind == RecordKind::Tombstone
    }

    /// Whether a record with these key and value lengths can be framed.
    pub fn fits(key_len: usize, value_len: usize) -> bool {
        MIN_RECORD_SIZE
            .checked_add(key_len)
            .and_then(|n| n.checked_add(value_len))
            .is_some_and(|n| n <= MAX_RECORD_SIZE)
    }

    /// Size of the serialized record in bytes.
    pub fn encoded_len(&self) -> usize {
        MIN_RECORD_SIZE + self.key.len() + self.value.len()
    }

    /// Serialize the complete record to bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let record_length = self.encoded_len() as u32;

        let mut record = Vec::with_capacity(record_length as usize);
        record.extend_from_slice(&record_length.to_le_bytes());
        record.push(self.kind.to_byte());
        record.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        record.extend_from_slice(&self.key);
        record.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        record.extend_from_slice(&self.value);

        let checksum = compute_checksum(&record);
        record.extend_from_slice(&checksum.to_le_bytes());

        record
    }

    /// Reads the declared record length from a record prefix.
    pub fn declared_length(prefix: &[u8; 4]) -> usize {
        u32::from_le_bytes(*prefix) as usize
    }

    /// Deserialize a record from bytes, verifying checksum.
    ///
    /// Returns the record and the number of bytes consumed. Short input is
    /// reported as `UnexpectedEof`, everything else as `InvalidData`.
    pub fn deserialize(data: &[u8]) -> io::Result<(Self, usize)> {
        if data.len() < MIN_RECORD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Record too short",
            ));
        }

        let record_length = Self::declared_length(&[data[0], data[1], data[2], data[3]]);

        if record_length < MIN_RECORD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid record length: {}", record_length),
            ));
        }

        if data.len() < record_length {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "Record truncated: expected {} bytes, got {}",
                    record_length,
                    data.len()
                ),
            ));
        }

        let checksum_offset = record_length - 4;
        let stored_checksum = u32::from_le_bytes([
            data[checksum_offset],
            data[checksum_offset + 1],
            data[checksum_offset + 2],
            data[checksum_offset + 3],
        ]);
        let computed_checksum = compute_checksum(&data[0..checksum_offset]);

        if computed_checksum != stored_checksum {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Checksum mismatch: computed {:08x}, stored {:08x}",
                    computed_checksum, stored_checksum
                ),
            ));
        }

        let mut cursor = io::Cursor::new(&data[4..checksum_offset]);

        fn read_bytes<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf)?;
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf)?;
            Ok(buf)
        }

        let mut kind_buf = [0u8; 1];
        cursor.read_exact(&mut kind_buf)?;
        let kind = RecordKind::from_byte(kind_buf[0])?;

        // A checksummed record whose inner lengths overrun its frame is still
        // malformed, not truncated.
        let key = read_bytes(&mut cursor).map_err(invalid)?;
        let value = read_bytes(&mut cursor).map_err(invalid)?;

        Ok((Self { kind, key, value }, record_length))
    }
}

fn invalid(e: io::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("Malformed record body: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogRecord {
        LogRecord::live(b"\x00\x05postspost_1".to_vec(), b"{\"id\":\"post_1\"}".to_vec())
    }

    #[test]
    fn test_record_roundtrip() {
        let record = sample();
        let serialized = record.serialize();
        assert_eq!(serialized.len(), record.encoded_len());

        let (deserialized, consumed) = LogRecord::deserialize(&serialized).unwrap();
        assert_eq!(deserialized, record);
        assert_eq!(consumed, serialized.len());
    }

    #[test]
    fn test_tombstone_has_empty_value() {
        let record = LogRecord::tombstone(b"k".to_vec());
        let (deserialized, _) = LogRecord::deserialize(&record.serialize()).unwrap();
        assert!(deserialized.is_tombstone());
        assert!(deserialized.value.is_empty());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut serialized = sample().serialize();
        let mid = serialized.len() / 2;
        serialized[mid] ^= 0xFF;

        let err = LogRecord::deserialize(&serialized).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("Checksum mismatch"));
    }

    #[test]
    fn test_fits_respects_u32_framing() {
        assert!(LogRecord::fits(16, 1024));
        let largest_value = MAX_RECORD_SIZE - MIN_RECORD_SIZE - 16;
        assert!(LogRecord::fits(16, largest_value));
        assert!(!LogRecord::fits(16, largest_value + 1));
        assert!(!LogRecord::fits(usize::MAX, 1));
    }

    #[test]
    fn test_truncation_is_unexpected_eof() {
        let serialized = sample().serialize();
        let err = LogRecord::deserialize(&serialized[..serialized.len() - 3]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
