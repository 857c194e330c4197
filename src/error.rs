//! error.rs
//! Crate-wide error type. Every fallible boundary (DT-log I/O, wire parsing,
//! config parsing) returns `Result<T, Error>`; only `main` and the three
//! long-running tasks decide what to do with one (log-and-continue,
//! abort-the-transaction, or exit(1)).
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("DT-log I/O failure: {0}")]
    Log(#[from] io::Error),

    #[error("malformed wire message: {0}")]
    MalformedMessage(String),

    #[error("peer {0} unreachable")]
    PeerUnreachable(u32),

    #[error("read from peer {0} timed out")]
    Timeout(u32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
