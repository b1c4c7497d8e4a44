use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::schema::{CollectedResult, Task};

/// Messages sent from the orchestrator to a worker.
///
/// Framing: one JSON object per line on the worker's stdin.
/// The `type` tag matches the worker protocol
/// (`"start"`, `"terminate"`, `"timeout"`).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParentMessage {
    /// Hands the worker its one and only task
    Start { task: Task },

    /// Orchestrator shutdown: clean up and exit
    Terminate,

    /// Courtesy notice that the hard timeout fired
    Timeout,
}

/// Messages sent from a worker back to the orchestrator.
///
/// Framing: one JSON object per line on the worker's stdout.
/// Exactly one of `Result` / `Error` is sent per worker lifetime.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerMessage {
    Log { data: String },
    Result { data: CollectedResult },
    Error { error: String },
}

impl WorkerMessage {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerMessage::Log { .. })
    }
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("failed to encode IPC frame: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode IPC frame `{line}`: {source}")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Serializes a message into a single newline-terminated frame.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, IpcError> {
    let mut line = serde_json::to_string(msg).map_err(IpcError::Encode)?;
    line.push('\n');
    Ok(line)
}

/// Parses one frame. Surrounding whitespace is ignored.
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, IpcError> {
    serde_json::from_str(line.trim()).map_err(|source| IpcError::Decode {
        line: line.trim().chars().take(200).collect(),
        source,
    })
}
