//! Unit tests for the segmented log.

use std::io::Read;

use tempfile::TempDir;
use tracing::Span;

use super::*;
use crate::config::SegmentConfig;
use crate::error::StorageError;
use crate::types::Record;

fn small_config() -> SegmentConfig {
    SegmentConfig {
        max_store_bytes: 32,
        max_index_bytes: 1024,
        initial_offset: 0,
    }
}

fn open(dir: &TempDir, config: SegmentConfig) -> Log {
    Log::new(dir.path(), config, Span::none()).unwrap()
}

fn value(i: u64) -> Vec<u8> {
    format!("record-{}", i).into_bytes()
}

#[test]
fn test_append_read_across_rotations() {
    let temp_dir = TempDir::new().unwrap();
    let log = open(&temp_dir, small_config());

    assert_eq!(log.highest_offset(), None);
    for i in 0..10u64 {
        let off = log.append(Record::new(value(i))).unwrap();
        assert_eq!(off, i);
    }
    for i in 0..10u64 {
        let record = log.read(i).unwrap();
        assert_eq!(record.value, value(i));
        assert_eq!(record.offset, i);
    }

    // two records fill a 32 byte store
    let segments = std::fs::read_dir(temp_dir.path())
        .unwrap()
        .filter(|e| e.as_ref().unwrap().path().extension().unwrap() == "store")
        .count();
    assert!(segments > 1);
}

#[test]
fn test_initial_offset() {
    let temp_dir = TempDir::new().unwrap();
    let log = open(&temp_dir, small_config().with_initial_offset(1));
    assert_eq!(log.lowest_offset(), 1);
    assert_eq!(log.append(Record::new(b"a".to_vec())).unwrap(), 1);
    assert_eq!(log.append(Record::new(b"b".to_vec())).unwrap(), 2);
    assert_eq!(log.highest_offset(), Some(2));
}

#[test]
fn test_out_of_range() {
    let temp_dir = TempDir::new().unwrap();
    let log = open(&temp_dir, small_config());
    assert!(matches!(log.read(0), Err(StorageError::OffsetOutOfRange(0))));

    for i in 0..5u64 {
        log.append(Record::new(value(i))).unwrap();
    }
    let highest = log.highest_offset().unwrap();
    assert!(log.read(highest).is_ok());
    assert!(matches!(
        log.read(highest + 1),
        Err(StorageError::OffsetOutOfRange(off)) if off == highest + 1
    ));

    log.truncate(2).unwrap();
    let lowest = log.lowest_offset();
    assert!(lowest > 0);
    assert!(matches!(log.read(lowest - 1), Err(StorageError::OffsetOutOfRange(_))));
}

#[test]
fn test_reopen_keeps_offsets_and_contents() {
    let temp_dir = TempDir::new().unwrap();
    {
        let log = open(&temp_dir, small_config());
        for i in 0..7u64 {
            log.append(Record::new(value(i))).unwrap();
        }
        log.close().unwrap();
    }

    let log = open(&temp_dir, small_config());
    assert_eq!(log.lowest_offset(), 0);
    assert_eq!(log.highest_offset(), Some(6));
    for i in 0..7u64 {
        assert_eq!(log.read(i).unwrap().value, value(i));
    }
    assert_eq!(log.append(Record::new(value(7))).unwrap(), 7);
}

#[test]
fn test_reopen_without_close() {
    let temp_dir = TempDir::new().unwrap();
    {
        let log = open(&temp_dir, small_config());
        for i in 0..3u64 {
            log.append(Record::new(value(i))).unwrap();
        }
    }
    let log = open(&temp_dir, small_config());
    assert_eq!(log.highest_offset(), Some(2));
    assert_eq!(log.read(2).unwrap().value, value(2));
}

#[test]
fn test_flushed_appends_survive_crash() {
    let temp_dir = TempDir::new().unwrap();
    let log = open(&temp_dir, small_config());
    for i in 0..5u64 {
        log.append(Record::new(value(i))).unwrap();
    }
    log.flush().unwrap();
    // 不运行任何析构
    std::mem::forget(log);

    let log = open(&temp_dir, small_config());
    assert_eq!(log.highest_offset(), Some(4));
    for i in 0..5u64 {
        assert_eq!(log.read(i).unwrap().value, value(i));
    }
}

#[test]
fn test_truncate() {
    let temp_dir = TempDir::new().unwrap();
    let log = open(&temp_dir, small_config());
    for i in 0..10u64 {
        log.append(Record::new(value(i))).unwrap();
    }

    log.truncate(5).unwrap();
    let lowest = log.lowest_offset();
    // whole segments only, so a straddling segment keeps some offsets below 5
    assert!(lowest <= 5);
    for i in 0..lowest {
        assert!(matches!(log.read(i), Err(StorageError::OffsetOutOfRange(_))));
    }
    for i in lowest..10 {
        assert_eq!(log.read(i).unwrap().value, value(i));
    }
    assert_eq!(log.append(Record::new(value(10))).unwrap(), 10);
}

#[test]
fn test_truncate_everything_keeps_log_usable() {
    let temp_dir = TempDir::new().unwrap();
    let log = open(&temp_dir, small_config());
    for i in 0..4u64 {
        log.append(Record::new(value(i))).unwrap();
    }
    log.truncate(100).unwrap();
    assert_eq!(log.lowest_offset(), 100);
    assert_eq!(log.highest_offset(), None);
    assert_eq!(log.append(Record::new(value(100))).unwrap(), 100);
}

#[test]
fn test_truncate_suffix() {
    let temp_dir = TempDir::new().unwrap();
    let log = open(&temp_dir, small_config());
    for i in 0..10u64 {
        log.append(Record::new(value(i))).unwrap();
    }

    log.truncate_suffix(3).unwrap();
    assert_eq!(log.highest_offset(), Some(2));
    assert!(log.read(3).is_err());
    assert_eq!(log.read(2).unwrap().value, value(2));

    assert_eq!(log.append(Record::new(b"replacement".to_vec())).unwrap(), 3);
    assert_eq!(log.read(3).unwrap().value, b"replacement");

    log.truncate_suffix(0).unwrap();
    assert_eq!(log.highest_offset(), None);
    assert_eq!(log.append(Record::new(value(0))).unwrap(), 0);
}

#[test]
fn test_reader_concatenates_raw_entries() {
    let temp_dir = TempDir::new().unwrap();
    let log = open(&temp_dir, small_config());
    for i in 0..6u64 {
        log.append(Record::new(value(i))).unwrap();
    }

    let mut bytes = Vec::new();
    log.reader().read_to_end(&mut bytes).unwrap();

    let mut pos = 0usize;
    let mut expected = 0u64;
    while pos < bytes.len() {
        let mut len = [0u8; LEN_WIDTH as usize];
        len.copy_from_slice(&bytes[pos..pos + LEN_WIDTH as usize]);
        let len = u64::from_be_bytes(len) as usize;
        pos += LEN_WIDTH as usize;
        let (record, _) = Record::deserialize(&bytes[pos..pos + len]).unwrap();
        assert_eq!(record.offset, expected);
        assert_eq!(record.value, value(expected));
        pos += len;
        expected += 1;
    }
    assert_eq!(expected, 6);
}

#[test]
fn test_reader_ignores_later_appends() {
    let temp_dir = TempDir::new().unwrap();
    let log = open(&temp_dir, SegmentConfig::default());
    log.append(Record::new(b"before".to_vec())).unwrap();
    let mut reader = log.reader();
    log.append(Record::new(b"after".to_vec())).unwrap();

    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).unwrap();
    let (record, _) = Record::deserialize(&bytes[LEN_WIDTH as usize..]).unwrap();
    assert_eq!(record.value, b"before");
    assert_eq!(
        bytes.len(),
        LEN_WIDTH as usize + Record { value: b"before".to_vec(), offset: 0 }.serialize().unwrap().len()
    );
}

#[test]
fn test_reset() {
    let temp_dir = TempDir::new().unwrap();
    let log = open(&temp_dir, small_config());
    for i in 0..5u64 {
        log.append(Record::new(value(i))).unwrap();
    }
    log.reset(42).unwrap();
    assert_eq!(log.lowest_offset(), 42);
    assert_eq!(log.highest_offset(), None);
    assert!(log.read(0).is_err());
    assert_eq!(log.append(Record::new(value(42))).unwrap(), 42);
}

#[test]
fn test_remove_deletes_directory() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("log");
    let log = Log::new(&dir, small_config(), Span::none()).unwrap();
    for i in 0..5u64 {
        log.append(Record::new(value(i))).unwrap();
    }
    log.remove().unwrap();
    assert!(!dir.exists());

    let log = Log::new(&dir, small_config(), Span::none()).unwrap();
    assert_eq!(log.highest_offset(), None);
    assert_eq!(log.append(Record::new(value(0))).unwrap(), 0);
}
