use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("corrupted data: {0}")]
    Corrupted(String),
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("no archive configured")]
    NoArchive,
    #[error("operation not supported on a read-only state")]
    ReadOnly,
    #[error("snapshot does not match its proof")]
    SnapshotMismatch,
    #[error("state lock poisoned")]
    Lock,
    #[error("state already closed")]
    Closed,
    #[error("malformed update: {0}")]
    Update(#[from] amber_common::types::UpdateError),
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("corrupted archive: {0}")]
    Corrupted(String),
    #[error("block {got} is not past the last archived block {last}")]
    NonMonotonicBlock { got: u64, last: u64 },
    #[error("archive has no block at or before {0}")]
    UnknownBlock(u64),
    #[error("archive invalidated by a previous failure: {0}")]
    Invalidated(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("archive writer is no longer running")]
    WriterGone,
    #[error("archive lock poisoned")]
    Lock,
}
