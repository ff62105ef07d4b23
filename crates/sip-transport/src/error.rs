//! Error types for the transport layer

use std::io;

use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while setting up or running a transport
#[derive(Error, Debug)]
pub enum Error {
    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport was closed
    #[error("Transport closed")]
    TransportClosed,

    /// Transport name not recognised
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Received bytes could not be parsed
    #[error("Parse error: {0}")]
    Parse(#[from] siptx_sip_core::Error),
}

/// Outcome of a failed send, classified for the client retry ladder
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// EMSGSIZE: the datagram does not fit the path MTU
    #[error("Message too large for transport")]
    MessageTooLarge,

    /// ECONNREFUSED: nobody is listening at the destination
    #[error("Connection refused")]
    ConnectionRefused,

    /// Broken pipe, reset or a full queue; worth exactly one retry
    #[error("Connection closed")]
    ConnectionClosed,

    /// Destination name cannot be served by this transport
    #[error("No transport for {0}")]
    NoTransport(String),

    /// Anything else
    #[error("Transport failure: {0}")]
    Fatal(String),
}

impl SendError {
    /// Classify an I/O error
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => SendError::ConnectionRefused,
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::WouldBlock => SendError::ConnectionClosed,
            _ if err.raw_os_error() == Some(EMSGSIZE) => SendError::MessageTooLarge,
            _ => SendError::Fatal(err.to_string()),
        }
    }

    /// True if one more attempt on the same destination may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::ConnectionClosed)
    }
}

#[cfg(target_os = "linux")]
const EMSGSIZE: i32 = 90;
#[cfg(not(target_os = "linux"))]
const EMSGSIZE: i32 = 40;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(SendError::from_io(&refused), SendError::ConnectionRefused);

        let pipe = io::Error::from(io::ErrorKind::BrokenPipe);
        assert!(SendError::from_io(&pipe).is_transient());

        let too_big = io::Error::from_raw_os_error(EMSGSIZE);
        assert_eq!(SendError::from_io(&too_big), SendError::MessageTooLarge);
    }
}
