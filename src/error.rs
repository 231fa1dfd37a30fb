use std::io;

/// Central error type for the ravel engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O error from the OS or network.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The peer sent something that is not a valid HTTP/1.1 request.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// Task queue was closed while an enqueue was in flight.
    #[error("queue closed")]
    QueueClosed,
    /// Socket/bind/listen failure during startup. The server does not start.
    #[error("startup error: {0}")]
    Startup(String),
}

pub type Result<T> = std::result::Result<T, Error>;
