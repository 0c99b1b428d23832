//! Plaintext layout of the local preference snapshot
//!
//! ```text
//! [ u32 BE: record length ][ protobuf StoreRecord ] ...
//! ```
//!
//! Encryption happens one layer up; everything here is plaintext.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

const PREFIX_LEN: usize = 4;

/// Upper bound for a single preference value (1 MB)
pub const MAX_RECORD_LEN: u32 = 1024 * 1024;

/// One persisted preference
#[derive(Clone, PartialEq, Message)]
pub struct StoreRecord {
    #[prost(string, tag = "1")]
    pub key: String,
    /// JSON-encoded value
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

impl StoreRecord {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("preference record of {0} bytes exceeds {MAX_RECORD_LEN}")]
    RecordTooLarge(usize),

    #[error("corrupt length prefix {0}")]
    BadPrefix(u32),

    #[error("snapshot ends mid-record ({0} bytes left over)")]
    Truncated(usize),

    #[error("malformed record: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("record encoding failed: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// Append one framed record to `out`
pub fn write_record(record: &StoreRecord, out: &mut BytesMut) -> Result<(), CodecError> {
    let len = record.encoded_len();
    if len > MAX_RECORD_LEN as usize {
        return Err(CodecError::RecordTooLarge(len));
    }
    out.reserve(PREFIX_LEN + len);
    out.put_u32(len as u32);
    record.encode(out)?;
    Ok(())
}

/// Pop the next complete record off the front of `input`.
///
/// `Ok(None)` leaves `input` untouched when fewer bytes than a full frame remain.
pub fn read_record(input: &mut BytesMut) -> Result<Option<StoreRecord>, CodecError> {
    let Some(prefix) = input.get(..PREFIX_LEN) else {
        return Ok(None);
    };
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    if len > MAX_RECORD_LEN {
        return Err(CodecError::BadPrefix(len));
    }
    if input.len() < PREFIX_LEN + len as usize {
        return Ok(None);
    }

    input.advance(PREFIX_LEN);
    let body = input.split_to(len as usize);
    Ok(Some(StoreRecord::decode(body)?))
}

/// Serialize every record, in order, into one snapshot
pub fn encode_all<'a, I>(records: I) -> Result<Bytes, CodecError>
where
    I: IntoIterator<Item = &'a StoreRecord>,
{
    let mut out = BytesMut::new();
    for record in records {
        write_record(record, &mut out)?;
    }
    Ok(out.freeze())
}

/// Parse a whole snapshot. Leftover bytes after the last full record are an error.
pub fn decode_all(snapshot: &[u8]) -> Result<Vec<StoreRecord>, CodecError> {
    let mut input = BytesMut::from(snapshot);
    let mut records = Vec::new();
    while let Some(record) = read_record(&mut input)? {
        records.push(record);
    }
    if input.is_empty() {
        Ok(records)
    } else {
        Err(CodecError::Truncated(input.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_status() -> StoreRecord {
        StoreRecord::new("lock_status", br#"{"isLocked":true}"#.to_vec())
    }

    #[test]
    fn test_prefix_matches_body() {
        let mut out = BytesMut::new();
        write_record(&lock_status(), &mut out).unwrap();
        let len = u32::from_be_bytes([out[0], out[1], out[2], out[3]]) as usize;
        assert_eq!(len + PREFIX_LEN, out.len());
    }

    #[test]
    fn test_incomplete_frame_is_left_alone() {
        let mut out = BytesMut::new();
        write_record(&lock_status(), &mut out).unwrap();

        let mut partial = BytesMut::from(&out[..6]);
        assert!(read_record(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 6);

        partial.extend_from_slice(&out[6..]);
        let record = read_record(&mut partial).unwrap().unwrap();
        assert_eq!(record.key, "lock_status");
        assert!(partial.is_empty());
    }

    #[test]
    fn test_snapshot_keeps_order() {
        let records = vec![
            StoreRecord::new("a", b"1".to_vec()),
            StoreRecord::new("b", b"2".to_vec()),
            StoreRecord::new("c", Vec::new()),
        ];
        let snapshot = encode_all(&records).unwrap();
        assert_eq!(decode_all(&snapshot).unwrap(), records);
    }

    #[test]
    fn test_empty_snapshot() {
        assert!(decode_all(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_snapshot() {
        let snapshot = encode_all(&[lock_status(), lock_status()]).unwrap();
        let cut = &snapshot[..snapshot.len() - 3];
        assert!(matches!(decode_all(cut), Err(CodecError::Truncated(_))));
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        let mut input = BytesMut::new();
        input.put_u32(MAX_RECORD_LEN + 1);
        input.put_bytes(0, 16);
        assert!(matches!(read_record(&mut input), Err(CodecError::BadPrefix(_))));
    }
}
