//! Builders for requests and responses, plus identifier generation
//!
//! ```rust
//! use siptx_sip_core::{Method, RequestBuilder, ResponseBuilder};
//!
//! let invite = RequestBuilder::new(Method::Invite, "sip:bob@biloxi.example.com")
//!     .unwrap()
//!     .from("sip:alice@atlanta.example.com", Some("1928301774"))
//!     .unwrap()
//!     .to("sip:bob@biloxi.example.com", None)
//!     .unwrap()
//!     .call_id("a84b4c76e66710")
//!     .cseq(314159)
//!     .build()
//!     .unwrap();
//!
//! let ringing = ResponseBuilder::from_request(&invite, 180).build();
//! assert_eq!(ringing.headers.call_id.as_deref(), Some("a84b4c76e66710"));
//! ```

use bytes::Bytes;
use rand::Rng;

use crate::error::{Error, Result};
use crate::header::{CSeq, NameAddr, Via, BRANCH_MAGIC_COOKIE};
use crate::message::{Request, Response};
use crate::method::Method;
use crate::status::reason_phrase;
use crate::uri::Uri;

/// New RFC 3261 branch value
pub fn generate_branch() -> String {
    format!("{}{}", BRANCH_MAGIC_COOKIE, uuid::Uuid::new_v4().simple())
}

/// Random token suitable for a From/To tag
pub fn generate_tag() -> String {
    let value: u64 = rand::thread_rng().gen();
    format!("{:x}", value)
}

/// New Call-ID, optionally qualified with a host
pub fn generate_call_id(host: Option<&str>) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    match host {
        Some(host) => format!("{}@{}", id, host),
        None => id,
    }
}

/// Chained request builder
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    request: Request,
    cseq: Option<u32>,
}

impl RequestBuilder {
    pub fn new(method: Method, uri: &str) -> Result<Self> {
        Ok(Self::with_uri(method, uri.parse()?))
    }

    pub fn with_uri(method: Method, uri: Uri) -> Self {
        let mut request = Request::new(method, uri);
        request.headers.max_forwards = Some(70);
        RequestBuilder {
            request,
            cseq: None,
        }
    }

    pub fn from(mut self, addr: &str, tag: Option<&str>) -> Result<Self> {
        let mut from: NameAddr = addr.parse()?;
        if let Some(tag) = tag {
            from.set_tag(tag);
        }
        self.request.headers.from = Some(from);
        Ok(self)
    }

    pub fn to(mut self, addr: &str, tag: Option<&str>) -> Result<Self> {
        let mut to: NameAddr = addr.parse()?;
        if let Some(tag) = tag {
            to.set_tag(tag);
        }
        self.request.headers.to = Some(to);
        Ok(self)
    }

    pub fn from_addr(mut self, from: NameAddr) -> Self {
        self.request.headers.from = Some(from);
        self
    }

    pub fn to_addr(mut self, to: NameAddr) -> Self {
        self.request.headers.to = Some(to);
        self
    }

    pub fn call_id(mut self, call_id: impl Into<String>) -> Self {
        self.request.headers.call_id = Some(call_id.into());
        self
    }

    pub fn cseq(mut self, seq: u32) -> Self {
        self.cseq = Some(seq);
        self
    }

    pub fn via(mut self, via: Via) -> Self {
        self.request.headers.via.push(via);
        self
    }

    pub fn contact(mut self, contact: NameAddr) -> Self {
        self.request.headers.contact.push(contact);
        self
    }

    pub fn route(mut self, route: NameAddr) -> Self {
        self.request.headers.route.push(route);
        self
    }

    pub fn max_forwards(mut self, hops: u32) -> Self {
        self.request.headers.max_forwards = Some(hops);
        self
    }

    pub fn require(mut self, option: &str) -> Self {
        self.request.headers.require.push(option.to_string());
        self
    }

    pub fn supported(mut self, option: &str) -> Self {
        self.request.headers.supported.push(option.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.request.headers.other.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.request.headers.content_type = Some(content_type.to_string());
        self.request.body = body.into();
        self
    }

    /// Finish the request. From, To and a CSeq are mandatory; a Call-ID is
    /// generated when missing. Via is left to the transaction layer.
    pub fn build(mut self) -> Result<Request> {
        let headers = &mut self.request.headers;
        if headers.from.is_none() {
            return Err(Error::MissingHeader("From"));
        }
        if headers.to.is_none() {
            return Err(Error::MissingHeader("To"));
        }
        if headers.call_id.is_none() {
            headers.call_id = Some(generate_call_id(None));
        }
        let seq = self.cseq.ok_or(Error::MissingHeader("CSeq"))?;
        headers.cseq = Some(CSeq::new(seq, self.request.method.clone()));
        Ok(self.request)
    }
}

/// Builds a response that mirrors the dialog and transaction headers of a request
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    response: Response,
}

impl ResponseBuilder {
    /// Copies Via, From, To, Call-ID, CSeq and Timestamp from the request
    pub fn from_request(request: &Request, status: u16) -> Self {
        let mut response = Response::new(status);
        let src = &request.headers;
        response.headers.via = src.via.clone();
        response.headers.from = src.from.clone();
        response.headers.to = src.to.clone();
        response.headers.call_id = src.call_id.clone();
        response.headers.cseq = src.cseq.clone();
        response.headers.timestamp = src.timestamp.clone();
        ResponseBuilder { response }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.response.reason = reason.into();
        self
    }

    pub fn to_tag(mut self, tag: &str) -> Self {
        if let Some(to) = self.response.headers.to.as_mut() {
            to.set_tag(tag);
        }
        self
    }

    pub fn contact(mut self, contact: NameAddr) -> Self {
        self.response.headers.contact.push(contact);
        self
    }

    pub fn record_route(mut self, routes: Vec<NameAddr>) -> Self {
        self.response.headers.record_route = routes;
        self
    }

    pub fn require(mut self, option: &str) -> Self {
        self.response.headers.require.push(option.to_string());
        self
    }

    pub fn retry_after(mut self, secs: u32) -> Self {
        self.response.headers.retry_after = Some(secs);
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.response.headers.other.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.response.headers.content_type = Some(content_type.to_string());
        self.response.body = body.into();
        self
    }

    pub fn build(self) -> Response {
        self.response
    }
}

/// Status and reason, substituting the standard phrase when none is given
pub fn status_line(status: u16, reason: Option<&str>) -> (u16, String) {
    (
        status,
        reason
            .map(str::to_string)
            .unwrap_or_else(|| reason_phrase(status).to_string()),
    )
}
