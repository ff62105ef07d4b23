//! DNS record model consumed by the cascade

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::error::LookupError;

/// Record types the cascade asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    Naptr,
    Srv,
    A,
    Aaaa,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordType::Naptr => "NAPTR",
            RecordType::Srv => "SRV",
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NaptrData {
    pub order: u16,
    pub preference: u16,
    pub flags: String,
    pub services: String,
    pub regexp: String,
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrvData {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

/// Record payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordData {
    Naptr(NaptrData),
    Srv(SrvData),
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
}

impl RecordData {
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordData::Naptr(_) => RecordType::Naptr,
            RecordData::Srv(_) => RecordType::Srv,
            RecordData::A(_) => RecordType::A,
            RecordData::Aaaa(_) => RecordType::Aaaa,
        }
    }
}

/// One resource record with its TTL in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub ttl: u32,
    pub data: RecordData,
}

impl DnsRecord {
    pub fn naptr(
        order: u16,
        preference: u16,
        flags: &str,
        services: &str,
        replacement: &str,
    ) -> Self {
        DnsRecord {
            ttl: 3600,
            data: RecordData::Naptr(NaptrData {
                order,
                preference,
                flags: flags.to_string(),
                services: services.to_string(),
                regexp: String::new(),
                replacement: normalize_name(replacement),
            }),
        }
    }

    pub fn srv(priority: u16, weight: u16, port: u16, target: &str) -> Self {
        DnsRecord {
            ttl: 3600,
            data: RecordData::Srv(SrvData {
                priority,
                weight,
                port,
                target: normalize_name(target),
            }),
        }
    }

    pub fn a(addr: Ipv4Addr) -> Self {
        DnsRecord {
            ttl: 3600,
            data: RecordData::A(addr),
        }
    }

    pub fn aaaa(addr: Ipv6Addr) -> Self {
        DnsRecord {
            ttl: 3600,
            data: RecordData::Aaaa(addr),
        }
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Identifier the engine uses to route an answer back to its resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// A query handed to a [`DnsBackend`](crate::backend::DnsBackend)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: QueryId,
    pub domain: String,
    pub rtype: RecordType,
}

/// The backend's reply to a [`DnsQuery`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub id: QueryId,
    pub domain: String,
    pub rtype: RecordType,
    pub result: Result<Vec<DnsRecord>, LookupError>,
}

impl DnsAnswer {
    pub fn records(query: &DnsQuery, records: Vec<DnsRecord>) -> Self {
        DnsAnswer {
            id: query.id,
            domain: query.domain.clone(),
            rtype: query.rtype,
            result: Ok(records),
        }
    }

    pub fn error(query: &DnsQuery, error: LookupError) -> Self {
        DnsAnswer {
            id: query.id,
            domain: query.domain.clone(),
            rtype: query.rtype,
            result: Err(error),
        }
    }
}

/// Lowercase and strip the trailing root dot
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
