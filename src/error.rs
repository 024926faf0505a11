use crate::payload::RequestId;
use std::{net::SocketAddr, time::Duration};

/// Errors returned by discovery and by `Client` operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("no cast device found matching {0:?}")]
    DeviceNotFound(String),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("channel closed: {0}")]
    ChannelClosed(CloseReason),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request {request_id} got no response within {timeout:?}")]
    RequestTimeout {
        request_id: RequestId,
        timeout: Duration,
    },

    #[error("launching receiver app failed: {0}")]
    LaunchFailed(String),

    #[error("loading media failed: {0}")]
    LoadFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("no active media session")]
    NoActiveSession,

    #[error("volume level {0} is outside 0.0..=1.0")]
    InvalidVolume(f32),

    #[error("unexpected response from device: {0}")]
    UnexpectedResponse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why a control channel stopped carrying traffic.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum CloseReason {
    #[error("closed by client")]
    Closed,

    #[error("device ended the stream")]
    Eof,

    #[error("read error: {0}")]
    ReadError(String),

    #[error("write error: {0}")]
    WriteError(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no traffic from device for {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("device closed the virtual connection")]
    ClosedByDevice,
}

impl From<protobuf::Error> for Error {
    fn from(err: protobuf::Error) -> Error {
        Error::Protocol(err.to_string())
    }
}
