use std::fmt;

/// Crate-wide error type.
///
/// Only capture-source and sink-constructor failures are meant to
/// propagate out of `main`; per-packet and per-flow problems are absorbed
/// and counted inside the flow manager instead (see `manager::FlowManager`).
#[derive(Debug)]
pub enum CoreError {
    /// Capture source could not be opened (file not found, interface not
    /// found, permission denied).
    CaptureSource(String),
    /// A sink failed during construction and has no fallback.
    SinkInit(String),
    /// CLI/config validation failed before any capture started.
    Config(String),
    Io(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::CaptureSource(msg) => write!(f, "capture source error: {msg}"),
            CoreError::SinkInit(msg) => write!(f, "sink initialization error: {msg}"),
            CoreError::Config(msg) => write!(f, "configuration error: {msg}"),
            CoreError::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

impl From<csv::Error> for CoreError {
    fn from(err: csv::Error) -> Self {
        CoreError::SinkInit(err.to_string())
    }
}

impl From<pcap::Error> for CoreError {
    fn from(err: pcap::Error) -> Self {
        CoreError::CaptureSource(err.to_string())
    }
}

impl From<ctrlc::Error> for CoreError {
    fn from(err: ctrlc::Error) -> Self {
        CoreError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
