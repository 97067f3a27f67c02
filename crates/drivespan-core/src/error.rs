use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("source not readable: {path:?}: {source}")]
    SourceNotReadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not create destination file {path:?}: {source}")]
    DestinationOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not set ownership {owner}:{group} on {path:?}: {source}")]
    IncorrectOwnership {
        path: PathBuf,
        owner: u32,
        group: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("metadata for {path:?} is not representable: {reason}")]
    BadMetadata { path: PathBuf, reason: String },

    #[error("device pool exhausted: {needed} more bytes needed for {path:?}")]
    DevicePoolExceeded { path: PathBuf, needed: u64 },

    #[error("sync context needs {needed} bytes but device {device} has {available} left")]
    SyncContextSpace {
        device: String,
        needed: u64,
        available: u64,
    },

    #[error("device {device} could not be found")]
    DeviceNotFound { device: String, uuid: Option<String> },

    #[error("device {device} at {mount_point:?} is not writable: {source}")]
    DeviceNotWritable {
        device: String,
        mount_point: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("device {device} failed: {source}")]
    DeviceFailed {
        device: String,
        #[source]
        source: std::io::Error,
    },

    #[error("done signal received")]
    Done,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Plan-level errors abort the run before anything is written.
    pub fn is_plan_level(&self) -> bool {
        matches!(
            self,
            Error::DevicePoolExceeded { .. } | Error::SyncContextSpace { .. }
        )
    }

    /// Cooperative shutdown is reported through the error channel but is not
    /// a failure.
    pub fn is_done(&self) -> bool {
        matches!(self, Error::Done)
    }
}
