use thiserror::Error;

use siptx_sip_transport::SendError;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the transaction layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Parse or sanity failure of a message
    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] siptx_sip_core::Error),

    /// The transport could not deliver a message and every fallback was tried
    #[error("Transport failure: {0}")]
    TransportFailure(#[from] SendError),

    /// The DNS cascade produced no usable destination
    #[error("Resolution failure: {0}")]
    ResolutionFailure(String),

    /// Merged, looped or out-of-order request
    #[error("Protocol violation ({status}): {reason}")]
    ProtocolViolation { status: u16, reason: String },

    /// No response before the transaction deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The application supplied an unusable status code
    #[error("Application error: invalid status {0}")]
    ApplicationError(u16),

    /// Transaction handle is stale or unknown
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// Leg handle is stale or unknown
    #[error("Leg not found: {0}")]
    LegNotFound(String),

    /// Operation not allowed in the transaction's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// CANCEL not allowed for this transaction
    #[error("Cannot cancel: {0}")]
    InvalidCancel(String),

    /// Rejected configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The runner task has gone away
    #[error("Agent channel closed")]
    ChannelClosed,
}

impl Error {
    /// Status a locally generated response carries for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::MalformedMessage(siptx_sip_core::Error::TooLarge { .. }) => 513,
            Error::MalformedMessage(_) => 400,
            Error::TransportFailure(_) => 503,
            Error::ResolutionFailure(_) => 503,
            Error::ProtocolViolation { status, .. } => *status,
            Error::Timeout(_) => 408,
            Error::TransactionNotFound(_) | Error::LegNotFound(_) => 481,
            Error::ApplicationError(_)
            | Error::InvalidState(_)
            | Error::InvalidCancel(_)
            | Error::Config(_)
            | Error::ChannelClosed => 500,
        }
    }

    /// Reason phrase used in synthetic responses
    pub fn reason(&self) -> &'static str {
        match self {
            Error::TransportFailure(_) => "Transport Error",
            Error::ResolutionFailure(_) => "DNS Error",
            Error::Timeout(_) => "Request Timeout",
            _ => siptx_sip_core::reason_phrase(self.status_code()),
        }
    }

    pub(crate) fn not_found(what: impl std::fmt::Display) -> Self {
        Error::TransactionNotFound(what.to_string())
    }
}
