use std::io;

/// Plain-value classification of a socket-level outcome.
///
/// Threaded through `on_connected`/`on_closed`/`on_accept` callbacks as the
/// `Status` the source passes around; `None` means success. Kept separate
/// from `NetError` (which wraps a `Status` with the operation it was
/// produced by) so callback call sites can match on the classification
/// without unwrapping a specific `NetError` variant.
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("ok")]
    None,
    #[error("peer disconnected")]
    Disconnected,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("operation would block")]
    WouldBlock,
    #[error("unknown system error")]
    Unknown,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Copy-able classification of a `SystemError`, with the same shape but no
/// borrowed/boxed payload. Used where a value needs to be stashed (e.g. a
/// connection's terminal `Phase`) separately from a `SystemError` that is
/// about to be moved into a one-shot callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    None,
    Disconnected,
    ConnectionRefused,
    WouldBlock,
    Unknown,
    Io,
}

impl SystemError {
    pub fn is_ok(&self) -> bool {
        matches!(self, SystemError::None)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SystemError::None => ErrorKind::None,
            SystemError::Disconnected => ErrorKind::Disconnected,
            SystemError::ConnectionRefused => ErrorKind::ConnectionRefused,
            SystemError::WouldBlock => ErrorKind::WouldBlock,
            SystemError::Unknown => ErrorKind::Unknown,
            SystemError::Io(_) => ErrorKind::Io,
        }
    }

    /// Classifies a raw `io::Error` from a non-blocking socket call the way
    /// the reactor's dispatch loop needs to: would-block is benign, ECONNREFUSED
    /// is the one bind/connect failure callers special-case, everything else
    /// collapses to the generic `Io` wrapper.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => SystemError::WouldBlock,
            io::ErrorKind::ConnectionRefused => SystemError::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                SystemError::Disconnected
            }
            io::ErrorKind::UnexpectedEof => SystemError::Disconnected,
            _ => SystemError::Io(err),
        }
    }
}

/// Top-level error type for every fallible `net-core` operation.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("listen failed: {0}")]
    ListenFailed(SystemError),

    #[error("connect failed: {0}")]
    ConnectFailed(SystemError),

    #[error("poll failed: {0}")]
    PollFailed(io::Error),

    #[error("no addresses resolved for host {host}")]
    NoAddresses { host: String },

    #[error("hostname resolution failed for {host}")]
    ResolveFailed { host: String },

    #[error("resolver worker thread is gone")]
    ResolverShutdown,

    #[error("send buffer is full ({used} >= {cap} bytes)")]
    SendBufferFull { used: usize, cap: usize },

    #[error("peer disconnected")]
    Disconnected,

    #[error("operation attempted on a closed handle")]
    Closed,

    #[error("invalid bind address: {0}")]
    InvalidAddress(String),
}

pub type NetResult<T> = Result<T, NetError>;
