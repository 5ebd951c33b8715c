use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitoringError {
    /// No compatible sampling executable exists for this platform.
    #[error("Sampling tool unavailable: {0}")]
    ToolUnavailable(String),
    /// The tool exists but could not be launched when the window opened.
    #[error("Sampling unavailable for {source_name}: {reason}")]
    SamplingUnavailable { source_name: String, reason: String },
    #[error("Process read error for pid {pid}: {reason}")]
    ProcessRead { pid: u32, reason: String },
    #[error("Stream IO error on {stream}: {reason}")]
    StreamIo { stream: String, reason: String },
    #[error("Log parse error in {path}: {reason}")]
    LogParse { path: PathBuf, reason: String },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Watcher aborted: {0}")]
    WatcherAborted(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Polars error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),
    #[error("Other error: {0}")]
    Other(String),
}
