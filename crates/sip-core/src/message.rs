//! # SIP Messages
//!
//! [`Request`] and [`Response`] share a [`Headers`] block that exposes the
//! headers the transaction layer reads as typed fields. Unknown headers are
//! kept in order in [`Headers::other`] and written back unchanged.
//!
//! Serialization always emits a `Content-Length` computed from the body.
//! [`Message::parse`] accepts the textual wire form, including compact
//! header names and multi-value lines.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::header::{CSeq, NameAddr, RAck, Via};
use crate::method::Method;
use crate::status::reason_phrase;
use crate::uri::Uri;

/// Headers the transaction layer cares about, plus everything else verbatim
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    pub via: Vec<Via>,
    pub from: Option<NameAddr>,
    pub to: Option<NameAddr>,
    pub call_id: Option<String>,
    pub cseq: Option<CSeq>,
    pub route: Vec<NameAddr>,
    pub record_route: Vec<NameAddr>,
    pub contact: Vec<NameAddr>,
    pub max_forwards: Option<u32>,
    pub rseq: Option<u32>,
    pub rack: Option<RAck>,
    pub require: Vec<String>,
    pub supported: Vec<String>,
    pub timestamp: Option<String>,
    pub retry_after: Option<u32>,
    pub content_type: Option<String>,
    /// Extension headers as `(name, value)` pairs in arrival order
    pub other: Vec<(String, String)>,
}

impl Headers {
    pub fn top_via(&self) -> Option<&Via> {
        self.via.first()
    }

    pub fn top_via_mut(&mut self) -> Option<&mut Via> {
        self.via.first_mut()
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.from.as_ref().and_then(NameAddr::tag)
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to.as_ref().and_then(NameAddr::tag)
    }

    /// True if `Require` lists the option tag
    pub fn requires(&self, option: &str) -> bool {
        self.require.iter().any(|o| o.eq_ignore_ascii_case(option))
    }

    /// True if `Supported` or `Require` lists the option tag
    pub fn supports(&self, option: &str) -> bool {
        self.requires(option) || self.supported.iter().any(|o| o.eq_ignore_ascii_case(option))
    }

    /// First extension header with the given name
    pub fn get_other(&self, name: &str) -> Option<&str> {
        self.other
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_other(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.other.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(slot) => slot.1 = value,
            None => self.other.push((name.to_string(), value)),
        }
    }

    fn write(&self, f: &mut fmt::Formatter<'_>, body_len: usize) -> fmt::Result {
        for via in &self.via {
            write!(f, "Via: {}\r\n", via)?;
        }
        for route in &self.route {
            write!(f, "Route: {}\r\n", route)?;
        }
        for rr in &self.record_route {
            write!(f, "Record-Route: {}\r\n", rr)?;
        }
        if let Some(max_forwards) = self.max_forwards {
            write!(f, "Max-Forwards: {}\r\n", max_forwards)?;
        }
        if let Some(from) = &self.from {
            write!(f, "From: {}\r\n", from)?;
        }
        if let Some(to) = &self.to {
            write!(f, "To: {}\r\n", to)?;
        }
        if let Some(call_id) = &self.call_id {
            write!(f, "Call-ID: {}\r\n", call_id)?;
        }
        if let Some(cseq) = &self.cseq {
            write!(f, "CSeq: {}\r\n", cseq)?;
        }
        for contact in &self.contact {
            write!(f, "Contact: {}\r\n", contact)?;
        }
        if let Some(rseq) = self.rseq {
            write!(f, "RSeq: {}\r\n", rseq)?;
        }
        if let Some(rack) = &self.rack {
            write!(f, "RAck: {}\r\n", rack)?;
        }
        if !self.require.is_empty() {
            write!(f, "Require: {}\r\n", self.require.join(", "))?;
        }
        if !self.supported.is_empty() {
            write!(f, "Supported: {}\r\n", self.supported.join(", "))?;
        }
        if let Some(timestamp) = &self.timestamp {
            write!(f, "Timestamp: {}\r\n", timestamp)?;
        }
        if let Some(retry_after) = self.retry_after {
            write!(f, "Retry-After: {}\r\n", retry_after)?;
        }
        for (name, value) in &self.other {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        if let Some(content_type) = &self.content_type {
            write!(f, "Content-Type: {}\r\n", content_type)?;
        }
        write!(f, "Content-Length: {}\r\n\r\n", body_len)
    }

    /// Parse one `name: value` line into the typed fields
    fn push_line(&mut self, name: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match canonical_name(name).as_str() {
            "via" => {
                for item in split_list(value) {
                    self.via.push(item.parse()?);
                }
            }
            "from" => self.from = Some(value.parse()?),
            "to" => self.to = Some(value.parse()?),
            "call-id" => self.call_id = Some(value.to_string()),
            "cseq" => self.cseq = Some(value.parse()?),
            "route" => {
                for item in split_list(value) {
                    self.route.push(item.parse()?);
                }
            }
            "record-route" => {
                for item in split_list(value) {
                    self.record_route.push(item.parse()?);
                }
            }
            "contact" if value == "*" => self.other.push(("Contact".into(), "*".into())),
            "contact" => {
                for item in split_list(value) {
                    self.contact.push(item.parse()?);
                }
            }
            "max-forwards" => {
                self.max_forwards = Some(
                    value
                        .parse()
                        .map_err(|_| Error::header("Max-Forwards", value))?,
                )
            }
            "rseq" => {
                self.rseq = Some(value.parse().map_err(|_| Error::header("RSeq", value))?)
            }
            "rack" => self.rack = Some(value.parse()?),
            "require" => self.require.extend(split_list(value).map(str::to_string)),
            "supported" => self
                .supported
                .extend(split_list(value).map(str::to_string)),
            "timestamp" => self.timestamp = Some(value.to_string()),
            "retry-after" => {
                let secs = value.split(|c: char| !c.is_ascii_digit()).next().unwrap_or("");
                self.retry_after =
                    Some(secs.parse().map_err(|_| Error::header("Retry-After", value))?)
            }
            "content-type" => self.content_type = Some(value.to_string()),
            "content-length" => {}
            _ => self.other.push((name.trim().to_string(), value.to_string())),
        }
        Ok(())
    }
}

fn canonical_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.as_str() {
        "v" => "via".into(),
        "f" => "from".into(),
        "t" => "to".into(),
        "i" => "call-id".into(),
        "m" => "contact".into(),
        "k" => "supported".into(),
        "c" => "content-type".into(),
        "l" => "content-length".into(),
        _ => lower,
    }
}

/// Split a comma separated header value, ignoring commas inside `<>` or quotes
fn split_list(value: &str) -> impl Iterator<Item = &str> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;
    for (idx, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '<' if !quoted => depth += 1,
            '>' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                items.push(value[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    items.push(value[start..].trim());
    items.into_iter().filter(|s| !s.is_empty())
}

/// A SIP request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            headers: Headers::default(),
            body: Bytes::new(),
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.call_id.as_deref()
    }

    pub fn cseq(&self) -> Option<&CSeq> {
        self.headers.cseq.as_ref()
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.headers.top_via()
    }

    pub fn branch(&self) -> Option<&str> {
        self.top_via().and_then(Via::branch)
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_string())
    }

    /// Mandatory header presence and CSeq agreement
    pub fn sanity_check(&self) -> Result<()> {
        check_common(&self.headers)?;
        if let Some(cseq) = &self.headers.cseq {
            if cseq.method != self.method {
                return Err(Error::CSeqMismatch {
                    method: self.method.to_string(),
                    cseq: cseq.method.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} SIP/2.0\r\n", self.method, self.uri)?;
        self.headers.write(f, self.body.len())?;
        f.write_str(&String::from_utf8_lossy(&self.body))
    }
}

/// A SIP response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    /// Response with the standard reason phrase
    pub fn new(status: u16) -> Self {
        Response {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::default(),
            body: Bytes::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn is_provisional(&self) -> bool {
        self.status < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_final(&self) -> bool {
        self.status >= 200
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.call_id.as_deref()
    }

    pub fn cseq(&self) -> Option<&CSeq> {
        self.headers.cseq.as_ref()
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.headers.top_via()
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_string())
    }

    pub fn sanity_check(&self) -> Result<()> {
        if !(100..=699).contains(&self.status) {
            return Err(Error::InvalidStatusCode(self.status));
        }
        check_common(&self.headers)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {} {}\r\n", self.status, self.reason)?;
        self.headers.write(f, self.body.len())?;
        f.write_str(&String::from_utf8_lossy(&self.body))
    }
}

fn check_common(headers: &Headers) -> Result<()> {
    if headers.via.is_empty() {
        return Err(Error::MissingHeader("Via"));
    }
    if headers.from.is_none() {
        return Err(Error::MissingHeader("From"));
    }
    if headers.to.is_none() {
        return Err(Error::MissingHeader("To"));
    }
    match headers.call_id.as_deref() {
        None | Some("") => return Err(Error::MissingHeader("Call-ID")),
        _ => {}
    }
    if headers.cseq.is_none() {
        return Err(Error::MissingHeader("CSeq"));
    }
    Ok(())
}

/// Either side of a SIP exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(r) => &r.headers,
            Message::Response(r) => &r.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Message::Request(r) => &mut r.headers,
            Message::Response(r) => &mut r.headers,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers().call_id.as_deref()
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Message::Request(r) => r.to_bytes(),
            Message::Response(r) => r.to_bytes(),
        }
    }

    /// Serialized size in bytes
    pub fn wire_len(&self) -> usize {
        self.to_bytes().len()
    }

    /// Sanity check plus a size limit
    pub fn validate(&self, max_size: usize) -> Result<()> {
        let size = self.wire_len();
        if size > max_size {
            return Err(Error::TooLarge {
                size,
                max: max_size,
            });
        }
        match self {
            Message::Request(r) => r.sanity_check(),
            Message::Response(r) => r.sanity_check(),
        }
    }

    /// Parse the textual wire form of a message
    pub fn parse(data: &[u8]) -> Result<Message> {
        let text = std::str::from_utf8(data).map_err(|_| Error::header("message", "not UTF-8"))?;
        let (head, body) = match text.find("\r\n\r\n") {
            Some(pos) => (&text[..pos], &text[pos + 4..]),
            None => (text.trim_end_matches("\r\n"), ""),
        };

        let mut lines: Vec<String> = Vec::new();
        for line in head.split("\r\n") {
            if (line.starts_with(' ') || line.starts_with('\t')) && !lines.is_empty() {
                // Folded continuation line
                if let Some(last) = lines.last_mut() {
                    last.push(' ');
                    last.push_str(line.trim());
                }
            } else {
                lines.push(line.to_string());
            }
        }
        let mut iter = lines.iter();
        let start = iter.next().ok_or(Error::header("start-line", ""))?;

        let mut headers = Headers::default();
        for line in iter {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::header("header", line.as_str()))?;
            headers.push_line(name, value)?;
        }
        let body = Bytes::copy_from_slice(body.as_bytes());

        if let Some(rest) = start.strip_prefix("SIP/2.0 ") {
            let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
            let status: u16 = code
                .parse()
                .map_err(|_| Error::header("status-line", start.as_str()))?;
            if !(100..=699).contains(&status) {
                return Err(Error::InvalidStatusCode(status));
            }
            return Ok(Message::Response(Response {
                status,
                reason: reason.to_string(),
                headers,
                body,
            }));
        }

        let parts: Vec<&str> = start.split(' ').collect();
        if parts.len() != 3 || parts[2] != "SIP/2.0" {
            return Err(Error::header("request-line", start.as_str()));
        }
        Ok(Message::Request(Request {
            method: parts[0].parse()?,
            uri: parts[1].parse()?,
            headers,
            body,
        }))
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Message::Request(r)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Message::Response(r)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(r) => r.fmt(f),
            Message::Response(r) => r.fmt(f),
        }
    }
}
