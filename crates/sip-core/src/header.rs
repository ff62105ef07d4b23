//! Typed header values used by the transaction layer
//!
//! Only the headers the transaction and dialog machinery reads are modelled
//! here: name-addr headers (From, To, Contact, Route, Record-Route), Via,
//! CSeq and RAck. Everything else travels as an opaque extension header.

use std::fmt;
use std::str::FromStr;

use nom::{
    bytes::complete::{take_till, take_while1},
    character::complete::{char, digit1, multispace0},
    combinator::{all_consuming, map_res, opt},
    sequence::{delimited, preceded, tuple},
    IResult,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::method::Method;
use crate::uri::{params, parse_uri, Params, Uri};

/// Magic cookie that marks an RFC 3261 branch parameter
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// `[display-name] <uri>;params` as used in From, To, Contact, Route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameAddr {
    pub display: Option<String>,
    pub uri: Uri,
    pub params: Params,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        NameAddr {
            display: None,
            uri,
            params: Params::new(),
        }
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.get("tag").filter(|t| !t.is_empty())
    }

    pub fn set_tag(&mut self, tag: &str) {
        self.params.set("tag", Some(tag));
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.set_tag(tag);
        self
    }

    pub fn without_tag(&self) -> Self {
        let mut copy = self.clone();
        copy.params.remove("tag");
        copy
    }
}

impl From<Uri> for NameAddr {
    fn from(uri: Uri) -> Self {
        NameAddr::new(uri)
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display {
            write!(f, "\"{}\" ", display)?;
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}

fn bracketed_uri(i: &str) -> IResult<&str, Uri> {
    delimited(char('<'), parse_uri, char('>'))(i)
}

fn quoted(i: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_till(|c| c == '"'), char('"'))(i)
}

fn name_addr(i: &str) -> IResult<&str, NameAddr> {
    let (i, _) = multispace0(i)?;
    let (i, display) = opt(quoted)(i)?;
    let (i, display) = match display {
        Some(d) => (i, Some(d.trim().to_string())),
        None => {
            // Unquoted display name before '<'
            let (rest, token) = opt(take_till(|c| c == '<'))(i)?;
            match token {
                Some(t) if rest.starts_with('<') && !t.trim().is_empty() => {
                    (rest, Some(t.trim().to_string()))
                }
                _ => (i, None),
            }
        }
    };
    let (i, _) = multispace0(i)?;
    let (i, uri) = bracketed_uri(i)?;
    let (i, params) = params(i)?;
    Ok((
        i,
        NameAddr {
            display,
            uri,
            params,
        },
    ))
}

impl FromStr for NameAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.contains('<') {
            return all_consuming(name_addr)(s)
                .map(|(_, na)| na)
                .map_err(|_| Error::header("name-addr", s));
        }
        // addr-spec form: parameters after the URI belong to the header
        let (uri_part, param_part) = match s.find(';') {
            Some(pos) => s.split_at(pos),
            None => (s, ""),
        };
        let uri: Uri = uri_part.parse()?;
        let (_, params) =
            all_consuming(params)(param_part).map_err(|_| Error::header("name-addr", s))?;
        Ok(NameAddr {
            display: None,
            uri,
            params,
        })
    }
}

/// A single Via header value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Via {
    /// Transport token, e.g. `UDP`
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl Via {
    pub fn new(transport: &str, host: impl Into<String>, port: Option<u16>) -> Self {
        Via {
            transport: transport.to_ascii_uppercase(),
            host: host.into(),
            port,
            params: Params::new(),
        }
    }

    pub fn with_branch(mut self, branch: &str) -> Self {
        self.params.set("branch", Some(branch));
        self
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.get("branch").filter(|b| !b.is_empty())
    }

    /// True if the branch starts with the RFC 3261 magic cookie
    pub fn has_rfc3261_branch(&self) -> bool {
        self.branch()
            .map(|b| b.starts_with(BRANCH_MAGIC_COOKIE))
            .unwrap_or(false)
    }

    pub fn received(&self) -> Option<&str> {
        self.params.get("received").filter(|r| !r.is_empty())
    }

    /// `Some(None)` for a bare `;rport`, `Some(Some(port))` when filled in
    pub fn rport(&self) -> Option<Option<u16>> {
        self.params.get("rport").map(|v| v.parse().ok())
    }

    pub fn maddr(&self) -> Option<&str> {
        self.params.get("maddr").filter(|m| !m.is_empty())
    }

    pub fn comp(&self) -> Option<&str> {
        self.params.get("comp").filter(|c| !c.is_empty())
    }

    /// `host[:port]` as a comparable string
    pub fn sent_by(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host.to_ascii_lowercase(), port),
            None => self.host.to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} ", self.transport)?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)
    }
}

fn via(i: &str) -> IResult<&str, Via> {
    let token = |i| take_while1(|c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-')(i);
    let (i, (_, _, _, _, transport, _)) = tuple((
        token,
        char('/'),
        token,
        char('/'),
        token,
        multispace0,
    ))(i)?;
    let (i, host) = nom::branch::alt((
        delimited(char('['), take_while1(|c: char| c != ']'), char(']')),
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_'),
    ))(i)?;
    let (i, port) = opt(preceded(
        char(':'),
        map_res(digit1, |d: &str| d.parse::<u16>()),
    ))(i)?;
    let (i, params) = params(i)?;
    Ok((
        i,
        Via {
            transport: transport.to_ascii_uppercase(),
            host: host.to_string(),
            port,
            params,
        },
    ))
}

impl FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        all_consuming(via)(s.trim())
            .map(|(_, v)| v)
            .map_err(|_| Error::header("Via", s))
    }
}

/// CSeq header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        CSeq { seq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

impl FromStr for CSeq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        let seq = parts
            .next()
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| Error::header("CSeq", s))?;
        let method = parts
            .next()
            .ok_or_else(|| Error::header("CSeq", s))?
            .parse()?;
        if parts.next().is_some() {
            return Err(Error::header("CSeq", s));
        }
        Ok(CSeq { seq, method })
    }
}

/// RAck header (RFC 3262)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RAck {
    pub rseq: u32,
    pub cseq: u32,
    pub method: Method,
}

impl fmt::Display for RAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.rseq, self.cseq, self.method)
    }
}

impl FromStr for RAck {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(Error::header("RAck", s));
        }
        let rseq = parts[0].parse().map_err(|_| Error::header("RAck", s))?;
        let cseq = parts[1].parse().map_err(|_| Error::header("RAck", s))?;
        Ok(RAck {
            rseq,
            cseq,
            method: parts[2].parse()?,
        })
    }
}
