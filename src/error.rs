use std::io;

use thiserror::Error;

/// Errors surfaced by the servers and the orchestration layer.
///
/// Each variant maps onto an HTTP status code via [`Error::http_status`], so a
/// failing service can always answer the client with something meaningful
/// before its connection is torn down.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed request")]
    ProtocolMalformed,

    #[error("no service registered for {0}")]
    ServiceNotFound(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("disk i/o: {0}")]
    DiskIo(#[from] io::Error),

    #[error("disk not bound to any slot")]
    DiskMissing,

    #[error("volume is degraded")]
    VolumeDegraded,

    #[error("volume is dead, not enough disks")]
    VolumeDead,

    #[error("peer unreachable")]
    PeerUnreachable,

    #[error("request timed out")]
    TimeoutExceeded,

    #[error("disk header failed verification")]
    HeaderCorrupt,

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// The user-visible status code for this failure.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::ProtocolMalformed => 400,
            Error::AuthFailed => 401,
            Error::ServiceNotFound(_) | Error::DiskMissing => 404,
            Error::VolumeDegraded | Error::PeerUnreachable | Error::TimeoutExceeded => 503,
            Error::VolumeDead => 507,
            Error::DiskIo(_) | Error::HeaderCorrupt | Error::Internal(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
