//! Messages exchanged between the coordinator and its worker processes, one JSON
//! document per line.
//!
//! The coordinator writes `Request::Init` once, then any number of `Request::Chunk`s,
//! and finally closes the pipe. A worker answers every chunk with exactly one
//! `Reply::Chunk` carrying one `Outcome` per record, in record order.

use crate::types::{GlobalState, ResultRecord};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    Init(GlobalState),
    Chunk { seq: u64, records: Vec<String> },
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Chunk { seq: u64, outcomes: Vec<Outcome> },
    /// The worker cannot continue; it exits after sending this.
    Failed { message: String },
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Reported(ResultRecord),
    /// Rejected in permissive mode; the ID column is kept for progress reports.
    Dropped { id: String },
    /// Rejected in strict mode. Nothing after it in the chunk was evaluated.
    Fatal(String),
}

/// Serializes `message` as a single newline-terminated line.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

pub fn write_message<W: Write, T: Serialize>(
    writer: &mut W,
    message: &T,
) -> Result<(), ProtocolError> {
    write_encoded(writer, &encode(message)?)
}

/// Writes a line produced by `encode`, so a message sent to every worker is only
/// serialized once.
pub fn write_encoded<W: Write>(writer: &mut W, line: &[u8]) -> Result<(), ProtocolError> {
    writer.write_all(line)?;
    writer.flush()?;
    Ok(())
}

/// Reads the next message, or `None` once the peer has closed the pipe. `line` is a
/// reusable buffer.
pub fn read_message<R: BufRead, T: DeserializeOwned>(
    reader: &mut R,
    line: &mut String,
) -> Result<Option<T>, ProtocolError> {
    line.clear();
    if reader.read_line(line)? == 0 {
        return Ok(None);
    }

    Ok(Some(serde_json::from_str(line.trim_end())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn messages_are_line_delimited() {
        let replies = [
            Reply::Chunk {
                seq: 3,
                outcomes: vec![
                    Outcome::Dropped { id: "rs1".into() },
                    Outcome::Fatal("Bad genotype\nfor a".into()),
                ],
            },
            Reply::Failed {
                message: "no R".into(),
            },
        ];

        let mut buffer = Vec::new();
        for reply in &replies {
            write_message(&mut buffer, reply).unwrap();
        }
        assert_eq!(buffer.iter().filter(|&&byte| byte == b'\n').count(), 2);

        let mut reader = Cursor::new(buffer);
        let mut line = String::new();
        for expected in &replies {
            let reply: Reply = read_message(&mut reader, &mut line).unwrap().unwrap();
            assert_eq!(&reply, expected);
        }
        assert!(read_message::<_, Reply>(&mut reader, &mut line).unwrap().is_none());
    }

    #[test]
    fn malformed_lines_are_errors() {
        let mut reader = Cursor::new(b"{\"Chunk\": 12}\n".to_vec());
        let mut line = String::new();
        assert!(matches!(
            read_message::<_, Reply>(&mut reader, &mut line),
            Err(ProtocolError::Json(_))
        ));
    }
}
