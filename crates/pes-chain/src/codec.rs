//! Versioned binary encoding of [`LogRecord`]s as stored on partition logs.
//!
//! ```text
//! [4 bytes: magic "PES1"]
//! [1 byte : format version (currently 1)]
//! [1 byte : record tag (0x01 data, 0x02 sync marker, 0x03 public key)]
//! [N bytes: bincode-serialized record body]
//! ```
//!
//! The tag duplicates the enum discriminant so a reader can route a record
//! without decoding its body. Unknown versions or tags are decode errors.

use crate::entry::{LogEntry, LogRecord, PublicKeyRecord};
use crate::error::{ChainError, ChainResult};
use pes_types::SyncToken;

pub const MAGIC: [u8; 4] = *b"PES1";
pub const FORMAT_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 6;

const TAG_DATA: u8 = 0x01;
const TAG_SYNC: u8 = 0x02;
const TAG_PUBLIC_KEY: u8 = 0x03;

/// Codec for partition log records.
pub struct RecordCodec;

impl RecordCodec {
    pub fn encode(record: &LogRecord) -> ChainResult<Vec<u8>> {
        let (tag, body) = match record {
            LogRecord::Data(entry) => (TAG_DATA, bincode::serialize(entry)),
            LogRecord::Sync(token) => (TAG_SYNC, bincode::serialize(token)),
            LogRecord::PublicKey(key) => (TAG_PUBLIC_KEY, bincode::serialize(key)),
        };
        let body = body.map_err(|e| ChainError::Codec(e.to_string()))?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
        buf.extend_from_slice(&MAGIC);
        buf.push(FORMAT_VERSION);
        buf.push(tag);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> ChainResult<LogRecord> {
        if data.len() < HEADER_SIZE {
            return Err(ChainError::Codec(format!(
                "record too short: {} bytes",
                data.len()
            )));
        }
        if data[0..4] != MAGIC {
            return Err(ChainError::Codec("bad magic".into()));
        }
        if data[4] != FORMAT_VERSION {
            return Err(ChainError::Codec(format!(
                "unsupported format version {}",
                data[4]
            )));
        }

        let body = &data[HEADER_SIZE..];
        let decode_err = |e: bincode::Error| ChainError::Codec(e.to_string());
        match data[5] {
            TAG_DATA => bincode::deserialize::<LogEntry>(body)
                .map(LogRecord::Data)
                .map_err(decode_err),
            TAG_SYNC => bincode::deserialize::<SyncToken>(body)
                .map(LogRecord::Sync)
                .map_err(decode_err),
            TAG_PUBLIC_KEY => bincode::deserialize::<PublicKeyRecord>(body)
                .map(LogRecord::PublicKey)
                .map_err(decode_err),
            tag => Err(ChainError::Codec(format!("unknown record tag {tag:#04x}"))),
        }
    }
}
