//! Error types for vxi11d
//!
//! Only [`NetinstrError`] ever leaves the daemon. The other enums classify why a
//! request was dropped or a connection was ended; they are logged, never sent to
//! the client.

use std::net::SocketAddr;
use thiserror::Error;

/// Daemon-level errors
#[derive(Error, Debug)]
pub enum NetinstrError {
    /// A listening socket could not be opened. Always fatal.
    #[error("Cannot open {transport} port {addr} for listening: {source}")]
    Bind {
        /// "TCP" or "UDP"
        transport: &'static str,
        /// The address we tried to bind
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed data on a connection
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetinstrError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Result type for vxi11d operations
pub type Result<T> = std::result::Result<T, NetinstrError>;

/// Failure to pull a field out of a received frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame ends before the field does
    #[error("frame truncated: need {needed} bytes, have {len}")]
    Truncated { needed: usize, len: usize },

    /// A record on the stream is larger than we are willing to buffer
    #[error("record of {len} bytes exceeds limit of {max}")]
    Oversized { len: usize, max: usize },
}

/// Why the portmapper ignored a request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortmapReject {
    /// Too short to be an RPC call we understand
    #[error("malformed RPC request ({len} bytes)")]
    Malformed { len: usize },

    /// Portmapper procedure other than GETPORT
    #[error("procedure {0} is not GETPORT")]
    NotGetPort(u32),

    /// GETPORT for a program other than VXI-11 core
    #[error("program {0} is not VXI-11 core")]
    NotVxi11(u32),
}

/// Why a VXI-11 connection was ended without a reply
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Vxi11Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("unsupported program id {0}")]
    NotVxi11(u32),

    #[error("unsupported VXI-11 procedure {0}")]
    UnknownProcedure(u32),

    #[error("link {0} is not open")]
    LinkNotOpen(u32),

    #[error("invalid device name '{0}'")]
    InvalidDeviceName(String),

    #[error("link {0} already in use")]
    LinkInUse(u32),
}
