//! Transport names and destinations

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Transport protocol carried in Via and the `transport` URI parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
    Sctp,
    Ws,
    Wss,
}

impl TransportKind {
    /// Every kind, in default preference order
    pub const ALL: [TransportKind; 6] = [
        TransportKind::Udp,
        TransportKind::Tcp,
        TransportKind::Tls,
        TransportKind::Sctp,
        TransportKind::Ws,
        TransportKind::Wss,
    ];

    /// Stream transports do their own retransmission
    pub fn is_reliable(self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    pub fn is_secure(self) -> bool {
        matches!(self, TransportKind::Tls | TransportKind::Wss)
    }

    /// Token as used in the Via header
    pub fn via_name(self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Sctp => "SCTP",
            TransportKind::Ws => "WS",
            TransportKind::Wss => "WSS",
        }
    }

    /// Token as used in the `transport` URI parameter
    pub fn param_name(self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
            TransportKind::Sctp => "sctp",
            TransportKind::Ws => "ws",
            TransportKind::Wss => "wss",
        }
    }

    pub fn default_port(self) -> u16 {
        if self.is_secure() {
            5061
        } else {
            5060
        }
    }

    /// NAPTR service field (RFC 3263 Section 4.1)
    pub fn naptr_service(self) -> Option<&'static str> {
        match self {
            TransportKind::Udp => Some("SIP+D2U"),
            TransportKind::Tcp => Some("SIP+D2T"),
            TransportKind::Tls => Some("SIPS+D2T"),
            TransportKind::Sctp => Some("SIP+D2S"),
            TransportKind::Ws => Some("SIP+D2W"),
            TransportKind::Wss => Some("SIPS+D2W"),
        }
    }

    /// SRV owner-name prefix, e.g. `_sip._udp.`
    pub fn srv_prefix(self) -> Option<&'static str> {
        match self {
            TransportKind::Udp => Some("_sip._udp."),
            TransportKind::Tcp => Some("_sip._tcp."),
            TransportKind::Tls => Some("_sips._tcp."),
            TransportKind::Sctp => Some("_sip._sctp."),
            TransportKind::Ws | TransportKind::Wss => None,
        }
    }

    /// Reverse lookup of a NAPTR service field
    pub fn from_naptr_service(service: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| {
            k.naptr_service()
                .map(|s| s.eq_ignore_ascii_case(service))
                .unwrap_or(false)
        })
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.via_name())
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Self::ALL
            .into_iter()
            .find(|k| k.via_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::UnsupportedTransport(s.to_string()))
    }
}

/// A resolved place to send a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub kind: TransportKind,
    pub addr: SocketAddr,
}

impl Destination {
    pub fn new(kind: TransportKind, addr: SocketAddr) -> Self {
        Destination { kind, addr }
    }

    pub fn udp(addr: SocketAddr) -> Self {
        Self::new(TransportKind::Udp, addr)
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new(TransportKind::Tcp, addr)
    }

    pub fn with_kind(self, kind: TransportKind) -> Self {
        Destination { kind, ..self }
    }

    pub fn is_reliable(&self) -> bool {
        self.kind.is_reliable()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.param_name(), self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_and_services() {
        assert_eq!("tls".parse::<TransportKind>().unwrap(), TransportKind::Tls);
        assert!("quic".parse::<TransportKind>().is_err());
        assert_eq!(
            TransportKind::from_naptr_service("sips+d2t"),
            Some(TransportKind::Tls)
        );
        assert_eq!(TransportKind::Tls.srv_prefix(), Some("_sips._tcp."));
        assert!(!TransportKind::Udp.is_reliable());
        assert_eq!(TransportKind::Tls.default_port(), 5061);
    }
}
