//! # SIP URI
//!
//! A small URI model covering what the transaction layer needs: scheme,
//! userinfo, host, port, parameters and the raw header part.
//!
//! ```text
//! sip:user:password@host:port;uri-parameters?headers
//! ```
//!
//! ```rust
//! use siptx_sip_core::Uri;
//!
//! let uri: Uri = "sip:alice@example.com:5070;transport=tcp;lr".parse().unwrap();
//! assert_eq!(uri.user.as_deref(), Some("alice"));
//! assert_eq!(uri.port, Some(5070));
//! assert_eq!(uri.transport(), Some("tcp"));
//! assert!(uri.is_loose_route());
//! ```

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, digit1},
    combinator::{all_consuming, map, map_res, opt},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// URI scheme
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    Sip,
    Sips,
    Tel,
    Other(String),
}

impl Scheme {
    pub fn as_str(&self) -> &str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
            Scheme::Tel => "tel",
            Scheme::Other(s) => s,
        }
    }

    fn from_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "sip" => Scheme::Sip,
            "sips" => Scheme::Sips,
            "tel" => Scheme::Tel,
            other => Scheme::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `;name[=value]` parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub value: Option<String>,
}

/// Ordered parameter list with case-insensitive name lookup
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Params(Vec<Param>);

impl Params {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Value of a parameter. Flag parameters yield `Some("")`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_deref().unwrap_or(""))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Set or replace a parameter, keeping its position if present
    pub fn set(&mut self, name: &str, value: Option<&str>) {
        let value = value.map(str::to_string);
        match self.0.iter_mut().find(|p| p.name.eq_ignore_ascii_case(name)) {
            Some(p) => p.value = value,
            None => self.0.push(Param {
                name: name.to_string(),
                value,
            }),
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|p| !p.name.eq_ignore_ascii_case(name));
        before != self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for p in &self.0 {
            match &p.value {
                Some(v) => write!(f, ";{}={}", p.name, v)?,
                None => write!(f, ";{}", p.name)?,
            }
        }
        Ok(())
    }
}

impl From<Vec<(&str, Option<&str>)>> for Params {
    fn from(list: Vec<(&str, Option<&str>)>) -> Self {
        Params(
            list.into_iter()
                .map(|(n, v)| Param {
                    name: n.to_string(),
                    value: v.map(str::to_string),
                })
                .collect(),
        )
    }
}

/// SIP or SIPS URI
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Host name or IP literal (IPv6 without brackets)
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
    /// Raw `?headers` part, without the question mark
    pub headers: Option<String>,
}

impl Uri {
    /// `sip:host`
    pub fn sip(host: impl Into<String>) -> Self {
        Self::new(Scheme::Sip, host)
    }

    /// `sips:host`
    pub fn sips(host: impl Into<String>) -> Self {
        Self::new(Scheme::Sips, host)
    }

    pub fn new(scheme: Scheme, host: impl Into<String>) -> Self {
        Uri {
            scheme,
            user: None,
            password: None,
            host: host.into(),
            port: None,
            params: Params::new(),
            headers: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_param(mut self, name: &str, value: Option<&str>) -> Self {
        self.params.set(name, value);
        self
    }

    /// The `transport` URI parameter, lowercased by the caller if needed
    pub fn transport(&self) -> Option<&str> {
        self.params.get("transport").filter(|t| !t.is_empty())
    }

    /// The `maddr` URI parameter
    pub fn maddr(&self) -> Option<&str> {
        self.params.get("maddr").filter(|t| !t.is_empty())
    }

    /// True when the URI carries the `lr` parameter (RFC 3261 loose routing)
    pub fn is_loose_route(&self) -> bool {
        self.params.contains("lr")
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Sips
    }

    /// True if the host is a numeric IPv4 or IPv6 address
    pub fn host_is_ip(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }

    /// Default port for the scheme (5061 for sips, 5060 otherwise)
    pub fn default_port(&self) -> u16 {
        if self.is_secure() {
            5061
        } else {
            5060
        }
    }

    /// Comparison used for leg and alias matching: scheme, user, host
    /// (case-insensitive) and port must agree. Parameters are ignored.
    pub fn matches(&self, other: &Uri) -> bool {
        self.scheme == other.scheme
            && self.user == other.user
            && self.host.eq_ignore_ascii_case(&other.host)
            && self.port == other.port
    }

    /// Copy without parameters and headers
    pub fn without_params(&self) -> Uri {
        Uri {
            params: Params::new(),
            headers: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            f.write_str(user)?;
            if let Some(password) = &self.password {
                write!(f, ":{}", password)?;
            }
            f.write_str("@")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)?;
        if let Some(headers) = &self.headers {
            write!(f, "?{}", headers)?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match all_consuming(parse_uri)(s.trim()) {
            Ok((_, uri)) => Ok(uri),
            Err(_) => Err(Error::InvalidUri(s.to_string())),
        }
    }
}

fn is_scheme_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.'
}

fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' || c == '+'
}

fn is_param_char(c: char) -> bool {
    !matches!(c, ';' | '=' | '?' | '>' | '<' | ',') && !c.is_whitespace()
}

fn is_userinfo_char(c: char) -> bool {
    !matches!(c, '@' | '?' | '>' | '<') && !c.is_whitespace()
}

fn scheme(i: &str) -> IResult<&str, Scheme> {
    map(
        terminated(take_while1(is_scheme_char), char(':')),
        Scheme::from_token,
    )(i)
}

fn userinfo(i: &str) -> IResult<&str, (String, Option<String>)> {
    map(
        terminated(take_while1(is_userinfo_char), char('@')),
        |info: &str| match info.split_once(':') {
            Some((user, password)) => (user.to_string(), Some(password.to_string())),
            None => (info.to_string(), None),
        },
    )(i)
}

fn host(i: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('['), take_while1(|c: char| c != ']'), char(']')),
        take_while1(is_host_char),
    ))(i)
}

fn port(i: &str) -> IResult<&str, u16> {
    preceded(char(':'), map_res(digit1, |d: &str| d.parse::<u16>()))(i)
}

pub(crate) fn param(i: &str) -> IResult<&str, Param> {
    map(
        preceded(
            char(';'),
            pair(
                take_while1(is_param_char),
                opt(preceded(char('='), take_while(is_param_char))),
            ),
        ),
        |(name, value): (&str, Option<&str>)| Param {
            name: name.to_string(),
            value: value.map(str::to_string),
        },
    )(i)
}

pub(crate) fn params(i: &str) -> IResult<&str, Params> {
    map(many0(param), Params)(i)
}

pub(crate) fn parse_uri(i: &str) -> IResult<&str, Uri> {
    let (i, scheme) = scheme(i)?;
    let (i, info) = opt(userinfo)(i)?;
    let (i, host) = host(i)?;
    let (i, port) = opt(port)(i)?;
    let (i, params) = params(i)?;
    let (i, headers) = opt(preceded(char('?'), take_while(|c: char| c != '>')))(i)?;
    let (user, password) = match info {
        Some((user, password)) => (Some(user), password),
        None => (None, None),
    };
    Ok((
        i,
        Uri {
            scheme,
            user,
            password,
            host: host.to_string(),
            port,
            params,
            headers: headers.map(str::to_string),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let uri: Uri = "sips:bob:secret@Biloxi.example.com:5061;transport=tcp;lr?subject=x"
            .parse()
            .unwrap();
        assert_eq!(uri.scheme, Scheme::Sips);
        assert_eq!(uri.user.as_deref(), Some("bob"));
        assert_eq!(uri.password.as_deref(), Some("secret"));
        assert_eq!(uri.host, "Biloxi.example.com");
        assert_eq!(uri.port, Some(5061));
        assert_eq!(uri.transport(), Some("tcp"));
        assert!(uri.is_loose_route());
        assert_eq!(uri.headers.as_deref(), Some("subject=x"));
    }

    #[test]
    fn test_parse_ipv6_and_display() {
        let uri: Uri = "sip:[2001:db8::1]:5070".parse().unwrap();
        assert_eq!(uri.host, "2001:db8::1");
        assert!(uri.host_is_ip());
        assert_eq!(uri.to_string(), "sip:[2001:db8::1]:5070");
    }

    #[test]
    fn test_display_round_trip_keeps_params() {
        let text = "sip:alice@example.com;maddr=10.0.0.1;lr";
        let uri: Uri = text.parse().unwrap();
        assert_eq!(uri.maddr(), Some("10.0.0.1"));
        assert_eq!(uri.to_string(), text);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("not a uri".parse::<Uri>().is_err());
        assert!("sip:".parse::<Uri>().is_err());
        assert!("sip:host:99999".parse::<Uri>().is_err());
    }

    #[test]
    fn test_matches_ignores_params_and_host_case() {
        let a: Uri = "sip:alice@Example.COM;transport=udp".parse().unwrap();
        let b: Uri = "sip:alice@example.com".parse().unwrap();
        assert!(a.matches(&b));
        let c: Uri = "sip:bob@example.com".parse().unwrap();
        assert!(!a.matches(&c));
    }
}
