//! Error types for sip-core

use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building, parsing or validating SIP messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// URI could not be parsed
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// A header value could not be parsed
    #[error("Invalid {name} header: {value}")]
    InvalidHeader {
        /// Header name
        name: &'static str,
        /// Offending value
        value: String,
    },

    /// A mandatory header is missing
    #[error("Missing {0} header")]
    MissingHeader(&'static str),

    /// Method could not be parsed
    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    /// Status code outside 100..=699
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// CSeq method does not agree with the request method
    #[error("CSeq method {cseq} does not match request method {method}")]
    CSeqMismatch {
        /// Request line method
        method: String,
        /// Method in CSeq header
        cseq: String,
    },

    /// Message is larger than allowed
    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge {
        /// Serialized size
        size: usize,
        /// Configured maximum
        max: usize,
    },
}

impl Error {
    pub(crate) fn header(name: &'static str, value: impl Into<String>) -> Self {
        Error::InvalidHeader {
            name,
            value: value.into(),
        }
    }
}
