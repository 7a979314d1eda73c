use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced by the FastCGI bridge.
///
/// Kinds stay distinct because callers react differently: a `Connection`
/// failure means the worker should be (re)started, `ProtocolEof` means the
/// worker died mid-exchange, and the decode/response kinds point at a bad
/// peer or a codec desync.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot reach FastCGI worker at {addr}: {source}")]
    Connection {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("FastCGI peer closed the connection before a complete record was received")]
    ProtocolEof,

    #[error("malformed FastCGI data: {0}")]
    ProtocolDecode(String),

    #[error("FastCGI record content too large: {0} bytes (max 65535)")]
    RecordTooLarge(usize),

    #[error("worker output has no CGI header block")]
    MalformedResponse,

    #[error("no free loopback port found after {attempts} attempts starting at {start}")]
    PortSearchExhausted { start: u16, attempts: u32 },

    #[error("failed to launch worker {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Only an unreachable worker is worth another attempt, and only after
    /// the worker has been re-ensured.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub(crate) fn decode(msg: impl Into<String>) -> Self {
        Self::ProtocolDecode(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
