use thiserror::Error;

/// Errors that cross a component boundary. Protocol-level problems (bad auth,
/// malformed frames, version mismatches) are logged and the offending
/// connection is dropped; callers should not propagate them further up than
/// the task that owns the connection.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire framing error: {0}")]
    Wire(#[from] WireError),

    #[error("file staging error: {0}")]
    Staging(#[from] StagingError),

    #[error("authentication failed")]
    BadAuth,

    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: String, theirs: String },

    #[error("unknown compute id {0}")]
    UnknownCompute(u64),

    #[error("unknown job uid {0}")]
    UnknownJob(u64),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Error, Debug)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),

    #[error("frame exceeded maximum length")]
    FrameTooLarge,
}

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer file {name} exceeds max_file_size ({size} > {max})")]
    TooLarge { name: String, size: u64, max: u64 },

    #[error("refusing to stage path outside dest_path: {0}")]
    PathEscape(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
