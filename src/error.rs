use std::io;

use thiserror::Error;

/// Failure taxonomy for the gateway.
///
/// Query scoped variants are logged and dropped at the query's terminal
/// transition and never escape the task handling that query. Only bind,
/// upstream url and credential errors are fatal, before the runtime starts.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed dns message: {0}")]
    Malformed(&'static str),

    #[error("dns message exceeds buffer capacity")]
    BufOverflow,

    #[error("invalid upstream url: {0}")]
    Upstream(String),

    #[error("invalid credentials: {0}")]
    Credentials(String),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("no pinned upstream address resolved yet")]
    NoPinnedAddr,

    #[error("malformed upstream payload: {0}")]
    Payload(&'static str),
}
