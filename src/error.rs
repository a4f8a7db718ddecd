use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur when parsing the configuration for a Tern engine.
#[derive(Error, Debug)]
pub enum ConfigParseError {
    #[error("failed to read config file at '{path:?}'")]
    ReadFailed {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to parse config file at '{path:?}'")]
    ParseFailed {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("configured log directory '{path:?}' is not a directory")]
    InvalidLogDir { path: PathBuf },
    #[error("failed to create default log directory at '{path:?}'")]
    CreateDefaultLogDirFailed {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("couldn't determine a default log directory on this platform")]
    NoProjectDirs,
    #[error("bridge request timeout cannot be zero")]
    ZeroRequestTimeout,
    #[error("unsupported encoding '{encoding}', only utf-8 is available")]
    UnsupportedEncoding { encoding: String },
}

/// Errors that can occur in host-side file operations. These are deliberately
/// split by cause so callers can distinguish the retryable (`Io`) from the
/// terminal (`Validation`, `TooLarge`, `Decode`).
#[derive(Error, Debug)]
pub enum FileOpsError {
    #[error("no file exists at '{path:?}'")]
    NotFound { path: PathBuf },
    #[error("file at '{path:?}' is {size} bytes, over the {max_size} byte limit")]
    TooLarge {
        path: PathBuf,
        size: u64,
        max_size: u64,
    },
    #[error("file at '{path:?}' is not valid utf-8")]
    Decode { path: PathBuf },
    #[error("content for '{path:?}' was rejected by a validation predicate")]
    Validation { path: PathBuf },
    #[error("i/o failure on '{path:?}'")]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
}

impl FileOpsError {
    /// Whether this error is worth retrying. Validation rejections and
    /// oversized/undecodable files will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::NotFound { .. })
    }
}

/// Errors that can occur on the message bridge between the host and the view.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("no peer is attached to this bridge end")]
    NoPeer,
    #[error("the peer disconnected before responding")]
    PeerGone,
    #[error("the peer didn't respond to a '{kind}' request within {timeout_ms}ms")]
    PeerTimeout { kind: String, timeout_ms: u64 },
    #[error("the peer rejected the request: {message}")]
    Rejected { message: String },
    #[error("failed to encode or decode a message payload")]
    Payload {
        #[source]
        err: serde_json::Error,
    },
}

/// Errors that can occur when setting up a filesystem watch.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("failed to start watching '{path:?}'")]
    CreateFailed {
        path: PathBuf,
        #[source]
        err: notify::Error,
    },
    #[error("invalid glob pattern '{pattern}'")]
    BadPattern {
        pattern: String,
        #[source]
        err: globset::Error,
    },
    #[error("watch root '{path:?}' does not exist or is not a directory")]
    BadRoot { path: PathBuf },
}

/// Errors that can occur when interacting with a view-side session runtime.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a session is already open for '{path:?}' on this view")]
    AlreadyOpen { path: PathBuf },
    #[error("the session runtime has shut down")]
    Closed,
    #[error("the host couldn't provide initial content for '{path:?}': {message}")]
    LoadFailed { path: PathBuf, message: String },
}
