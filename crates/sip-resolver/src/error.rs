//! Error types for DNS resolution

use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Resolver level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Every step of the cascade was tried without producing a target
    #[error("No DNS targets found for {0}")]
    NoTargets(String),

    /// URI cannot be resolved (e.g. tel: or a transport we do not have)
    #[error("Unresolvable URI {0}")]
    Unresolvable(String),
}

/// Why a single DNS query failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// The name exists but has no records of this type
    #[error("no records")]
    NoData,

    /// The name does not exist
    #[error("no such domain")]
    NxDomain,

    /// Server failure, timeout or a missing runtime
    #[error("lookup failed: {0}")]
    Failed(String),
}
