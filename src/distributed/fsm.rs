//! State machine that applies committed commands to the commit log.

use std::io::{self, Read};
use std::sync::Arc;

use async_trait::async_trait;
use bincode::{Decode, Encode};
use tracing::{Span, debug, info, warn};

use crate::error::{ApplyError, ApplyResult, StorageError, StorageResult};
use crate::raft::StateMachine;
use crate::storage::log::{LEN_WIDTH, Log};
use crate::types::{Offset, Record};

/// Leading byte of every command. New kinds get new values; persisted
/// entries keep decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    Append = 0,
}

impl TryFrom<u8> for RequestType {
    type Error = ApplyError;

    fn try_from(value: u8) -> ApplyResult<Self> {
        match value {
            0 => Ok(RequestType::Append),
            other => Err(ApplyError::UnknownCommand(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Append(Record),
}

impl Command {
    /// `[request type][bincode payload]`
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let config = bincode::config::standard();
        match self {
            Command::Append(record) => {
                let mut buf = vec![RequestType::Append as u8];
                buf.extend(bincode::encode_to_vec(record, config)?);
                Ok(buf)
            }
        }
    }

    pub fn decode(data: &[u8]) -> ApplyResult<Self> {
        let (&tag, payload) = data.split_first().ok_or(ApplyError::Empty)?;
        let config = bincode::config::standard();
        match RequestType::try_from(tag)? {
            RequestType::Append => {
                let (record, _) = bincode::decode_from_slice(payload, config)
                    .map_err(|e| ApplyError::Decode(e.to_string()))?;
                Ok(Command::Append(record))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum CommandResponse {
    Append { offset: Offset },
}

impl CommandResponse {
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(data: &[u8]) -> ApplyResult<Self> {
        let (response, _) = bincode::decode_from_slice(data, bincode::config::standard())
            .map_err(|e| ApplyError::Decode(e.to_string()))?;
        Ok(response)
    }
}

pub struct Fsm {
    log: Arc<Log>,
    initial_offset: Offset,
    span: Span,
}

impl Fsm {
    pub fn new(log: Arc<Log>, initial_offset: Offset, span: Span) -> Self {
        Self {
            log,
            initial_offset,
            span,
        }
    }

    fn apply_append(&self, record: Record) -> ApplyResult<Vec<u8>> {
        let offset = self.log.append(record).map_err(|e| {
            warn!(parent: &self.span, "Failed to append committed record: {}", e);
            e
        })?;
        self.log.flush()?;
        Ok(CommandResponse::Append { offset }.encode()?)
    }
}

/// Reads one length prefix, `None` at a clean end of stream.
fn read_len(reader: &mut (dyn Read + Send)) -> io::Result<Option<u64>> {
    let mut buf = [0u8; LEN_WIDTH as usize];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Some(u64::from_be_bytes(buf)))
}

#[async_trait]
impl StateMachine for Fsm {
    async fn apply(&self, index: u64, command: &[u8]) -> ApplyResult<Vec<u8>> {
        match Command::decode(command)? {
            Command::Append(record) => {
                debug!(parent: &self.span, "Applying append at raft index {}", index);
                self.apply_append(record)
            }
        }
    }

    fn snapshot(&self) -> StorageResult<Box<dyn Read + Send>> {
        Ok(Box::new(self.log.reader()))
    }

    /// Rebuilds the log from length-prefixed records, starting at the first
    /// record's offset.
    fn restore(&self, data: &mut (dyn Read + Send)) -> StorageResult<()> {
        let mut restored = 0u64;
        while let Some(len) = read_len(data)? {
            let mut payload = vec![0u8; len as usize];
            data.read_exact(&mut payload)?;
            let (record, _) = Record::deserialize(&payload)?;

            if restored == 0 {
                self.log.reset(record.offset)?;
            }
            let expected = record.offset;
            let offset = self.log.append(record)?;
            if offset != expected {
                return Err(StorageError::Corrupted(format!(
                    "snapshot record {} restored at offset {}",
                    expected, offset
                )));
            }
            restored += 1;
        }

        if restored == 0 {
            self.log.reset(self.initial_offset)?;
        }
        self.log.flush()?;
        info!(parent: &self.span, "Restored {} records from snapshot", restored);
        Ok(())
    }
}
