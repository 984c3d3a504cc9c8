//! Typed messages between the dispatcher and its workers.
//!
//! Framing is line-delimited JSON over the child's stdin/stdout, one message
//! per line. The child's real stdout *is* the protocol channel; captured test
//! output travels inside `stdOut`/`stdErr` envelopes, base64-encoded when the
//! write was not valid UTF-8.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use paratest_core::{
    Annotation, Config, ErrorPayload, IoChunk, JobPayload, ParameterMatrix, TestEntry, TestStatus,
};

use crate::error::{Error, Result};

/// Environment variable marking a process as a worker. The embedder's `main`
/// must call [`crate::worker_entry`] before doing anything else so a spawned
/// copy of the binary enters the worker loop.
pub const WORKER_ENV: &str = "PARATEST_WORKER";

/// Everything a worker needs before its first job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInit {
    pub worker_index: usize,
    pub config: Config,
    pub matrix: ParameterMatrix,
    /// Matrix cells for this worker's variation; parameter fixtures resolve
    /// against these.
    pub variation: BTreeMap<String, Value>,
    pub repeat_each_index: u32,
}

/// Parent → child messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ParentMessage {
    Init(WorkerInit),
    Run(JobPayload),
    Stop,
}

/// Attributed stdio chunk on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_b64: Option<String>,
}

impl IoEnvelope {
    pub fn from_chunk(test_id: Option<&str>, chunk: &IoChunk) -> Self {
        let (text, buffer_b64) = match chunk {
            IoChunk::Text(s) => (Some(s.clone()), None),
            IoChunk::Buffer(b) => (None, Some(BASE64.encode(b))),
        };
        Self {
            test_id: test_id.map(str::to_string),
            text,
            buffer_b64,
        }
    }

    pub fn to_chunk(&self) -> IoChunk {
        if let Some(text) = &self.text {
            IoChunk::Text(text.clone())
        } else if let Some(b64) = &self.buffer_b64 {
            match BASE64.decode(b64) {
                Ok(bytes) => IoChunk::Buffer(bytes),
                Err(_) => IoChunk::Text(String::new()),
            }
        } else {
            IoChunk::Text(String::new())
        }
    }
}

/// Job completion report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_test_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<ErrorPayload>,
    /// Entries the worker did not execute; the dispatcher decides what to do
    /// with them.
    pub remaining: Vec<TestEntry>,
}

/// Child → parent messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    Ready,
    TestBegin {
        test_id: String,
        worker_index: usize,
    },
    TestEnd {
        test_id: String,
        duration_ms: u64,
        status: TestStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
        #[serde(default)]
        data: serde_json::Map<String, Value>,
        #[serde(default)]
        annotations: Vec<Annotation>,
    },
    StdOut(IoEnvelope),
    StdErr(IoEnvelope),
    Done(DonePayload),
    TeardownError {
        error: ErrorPayload,
    },
}

/// Write one message as a JSON line and flush, so the peer sees it promptly.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let line = serde_json::to_string(message)?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Read the next message, skipping blank lines. `Ok(None)` on EOF.
pub fn read_message<R: BufRead, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<Option<T>> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|e| Error::Protocol(format!("bad message '{trimmed}': {e}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_round_trip_over_a_buffer() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &ParentMessage::Stop).unwrap();
        write_message(
            &mut buffer,
            &WorkerMessage::TestBegin {
                test_id: "0@a.rs#run0-repeat0".to_string(),
                worker_index: 3,
            },
        )
        .unwrap();

        let mut reader = std::io::BufReader::new(buffer.as_slice());
        let first: ParentMessage = read_message(&mut reader).unwrap().unwrap();
        assert!(matches!(first, ParentMessage::Stop));
        let second: WorkerMessage = read_message(&mut reader).unwrap().unwrap();
        match second {
            WorkerMessage::TestBegin {
                test_id,
                worker_index,
            } => {
                assert_eq!(test_id, "0@a.rs#run0-repeat0");
                assert_eq!(worker_index, 3);
            }
            other => panic!("unexpected message {other:?}"),
        }
        let eof: Option<ParentMessage> = read_message(&mut reader).unwrap();
        assert!(eof.is_none());
    }

    #[test]
    fn binary_chunks_survive_base64() {
        let chunk = IoChunk::Buffer(vec![0, 159, 146, 150]);
        let envelope = IoEnvelope::from_chunk(Some("t1"), &chunk);
        assert!(envelope.text.is_none());
        assert_eq!(envelope.to_chunk(), chunk);

        let text = IoChunk::Text("hello\n".to_string());
        let envelope = IoEnvelope::from_chunk(None, &text);
        assert_eq!(envelope.to_chunk(), text);
        assert!(envelope.test_id.is_none());
    }

    #[test]
    fn garbage_line_is_a_protocol_error() {
        let mut reader = std::io::BufReader::new("not json\n".as_bytes());
        let result: Result<Option<WorkerMessage>> = read_message(&mut reader);
        assert!(result.is_err());
    }
}
