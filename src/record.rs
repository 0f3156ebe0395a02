//! The record schema and the command encoding carried through consensus.

use prost::Message;

use crate::error::{Error, Result};

/// A single record in the log.
///
/// `offset` is assigned by the log on append; callers submit records with
/// the default offset. `term` is populated on entries that travel through
/// the replication layer and is zero otherwise.
#[derive(Clone, PartialEq, Message)]
pub struct Record {
    /// Offset of this record in the log.
    #[prost(uint64, tag = "1")]
    pub offset: u64,

    /// Opaque payload.
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,

    /// Term under which the record was replicated.
    #[prost(uint64, tag = "3")]
    pub term: u64,
}

impl Record {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Record {
            value: value.into(),
            ..Default::default()
        }
    }
}

/// Command tag for an append carried through consensus.
pub(crate) const APPEND_COMMAND: u8 = 0;

/// Encodes a record as an append command: a single tag byte followed by the
/// length-delimited record.
pub(crate) fn encode_append_command(record: &Record) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + record.encoded_len() + 4);
    buf.push(APPEND_COMMAND);
    buf.extend(record.encode_length_delimited_to_vec());
    buf
}

/// Decodes a command payload back into its record.
pub(crate) fn decode_append_command(command: &[u8]) -> Result<Record> {
    match command.split_first() {
        Some((&APPEND_COMMAND, rest)) => Ok(Record::decode_length_delimited(rest)?),
        Some((&tag, _)) => Err(Error::corrupt(format!("unknown command tag {tag}"))),
        None => Err(Error::corrupt("empty command payload")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_command_round_trip() {
        let record = Record {
            offset: 42,
            value: b"hello world".to_vec(),
            term: 3,
        };

        let command = encode_append_command(&record);
        assert_eq!(command[0], APPEND_COMMAND);

        let decoded = decode_append_command(&command).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_unknown_command_tag() {
        let err = decode_append_command(&[9, 1, 2, 3]).unwrap_err();
        match err {
            Error::Corrupt { reason } => assert!(reason.contains("unknown command tag")),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_command() {
        assert!(decode_append_command(&[]).is_err());
    }
}
