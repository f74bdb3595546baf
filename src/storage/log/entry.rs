use tracing::warn;

use crate::error::StorageResult;
use crate::types::Record;

/// Width of the big-endian length prefix in front of every store entry.
pub const LEN_WIDTH: u64 = 8;

/// Index entry layout: relative offset, then store position.
pub const OFF_WIDTH: u64 = 4;
pub const POS_WIDTH: u64 = 8;
pub const ENT_WIDTH: u64 = OFF_WIDTH + POS_WIDTH;

pub const STORE_FILE_SUFFIX: &str = "store";
pub const INDEX_FILE_SUFFIX: &str = "index";

impl Record {
    pub fn serialize(&self) -> StorageResult<Vec<u8>> {
        let config = bincode::config::standard();
        Ok(bincode::encode_to_vec(self, config)?)
    }

    pub fn deserialize(data: &[u8]) -> StorageResult<(Self, usize)> {
        let config = bincode::config::standard();
        Ok(bincode::decode_from_slice(data, config).map_err(|e| {
            warn!("Failed to deserialize record: {}", e);
            e
        })?)
    }
}

/// Parses the base offset out of a segment file name such as `16.store`.
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let (stem, ext) = name.rsplit_once('.')?;
    if ext != STORE_FILE_SUFFIX && ext != INDEX_FILE_SUFFIX {
        return None;
    }
    stem.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serialization() {
        let record = Record {
            value: b"hello world".to_vec(),
            offset: 16,
        };
        let bytes = record.serialize().unwrap();
        let (decoded, read) = Record::deserialize(&bytes).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(read, bytes.len());
    }

    #[test]
    fn test_parse_segment_file_name() {
        assert_eq!(parse_segment_file_name("16.store"), Some(16));
        assert_eq!(parse_segment_file_name("0.index"), Some(0));
        assert_eq!(parse_segment_file_name("16.tmp"), None);
        assert_eq!(parse_segment_file_name("stable"), None);
        assert_eq!(parse_segment_file_name("abc.store"), None);
    }
}
