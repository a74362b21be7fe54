use std::{io, time::Duration};
use thiserror::Error;

use crate::leakage_model::Position;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Failed to launch `{program}`")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Sample {sample} failed: {failure}")]
    TraceFailure { sample: usize, failure: TraceFailure },
    #[error("Trace has {found} samples, corpus expects {expected}")]
    SampleLengthMismatch { expected: usize, found: usize },
    #[error("Trace input has {found} bytes, corpus expects {expected}")]
    BlockSizeMismatch { expected: usize, found: usize },
    #[error("Corpus too small to attack {position} byte {byte}: {size} traces, {minimum} required")]
    CorpusTooSmall {
        position: Position,
        byte: u8,
        size: usize,
        minimum: usize,
    },
    #[error("Attack on {position} byte {byte} cancelled")]
    Cancelled { position: Position, byte: u8 },
    #[error("Failed to save/load wbdca data")]
    SaveLoadError(#[from] serde_json::Error),
    #[error(transparent)]
    IoError(#[from] io::Error),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// Reasons a single traced execution is dropped from the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceFailure {
    #[error("target exited with {status}")]
    Crashed { status: String },
    #[error("target timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("no OUTPUT line in target stdout")]
    MissingOutput,
    #[error("malformed OUTPUT line: {0}")]
    MalformedOutput(String),
    #[error("malformed memory access log: {0}")]
    MalformedTrace(String),
    #[error("trace has {found} samples, corpus expects {expected}")]
    Misaligned { expected: usize, found: usize },
    #[error("{0}")]
    Io(String),
}
