//! # siptx-sip-core
//!
//! SIP message model for the siptx transaction stack.
//!
//! This crate is the message collaborator of the transaction engine. It
//! provides:
//!
//! - [`Uri`] parsing and formatting for `sip:`/`sips:` URIs
//! - typed [`Via`], [`NameAddr`], [`CSeq`] and [`RAck`] header values
//! - [`Request`], [`Response`] and [`Message`] with wire serialization
//! - [`RequestBuilder`] / [`ResponseBuilder`] and identifier generation
//!
//! The transaction layer never touches raw bytes; transports hand it a
//! parsed [`Message`] and receive one back for sending.

pub mod builder;
pub mod error;
pub mod header;
pub mod message;
pub mod method;
pub mod status;
pub mod uri;

pub use builder::{
    generate_branch, generate_call_id, generate_tag, status_line, RequestBuilder,
    ResponseBuilder,
};
pub use error::{Error, Result};
pub use header::{CSeq, NameAddr, RAck, Via, BRANCH_MAGIC_COOKIE};
pub use message::{Headers, Message, Request, Response};
pub use method::Method;
pub use status::reason_phrase;
pub use uri::{Param, Params, Scheme, Uri};

/// Option tag for reliable provisional responses (RFC 3262)
pub const OPTION_100REL: &str = "100rel";

/// Commonly used items
pub mod prelude {
    pub use crate::builder::{RequestBuilder, ResponseBuilder};
    pub use crate::header::{CSeq, NameAddr, RAck, Via};
    pub use crate::message::{Headers, Message, Request, Response};
    pub use crate::method::Method;
    pub use crate::uri::{Scheme, Uri};
}
