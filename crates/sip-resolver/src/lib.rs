//! # siptx-sip-resolver
//!
//! RFC 3263 server location for the siptx stack.
//!
//! The cascade ([`Resolution`]) is a sans-I/O state machine: it reads the
//! shared [`DnsCache`] first and only asks for a query when the cache has no
//! answer. Queries go out through a [`DnsBackend`]; answers come back as
//! [`DnsAnswer`] values. Failed SRV targets can be graylisted in the cache so
//! later resolutions of the same domain prefer the alternatives.
//!
//! ```rust
//! use std::time::Instant;
//! use siptx_sip_resolver::{Action, DnsCache, Resolution, ResolverConfig};
//!
//! let uri = "sip:example.com:5070".parse().unwrap();
//! let mut resolution = Resolution::new(&uri, &ResolverConfig::default()).unwrap();
//! let cache = DnsCache::new();
//! // Explicit port: straight to address records
//! assert!(matches!(
//!     resolution.next_action(&cache, Instant::now()),
//!     Action::Query { .. }
//! ));
//! ```

pub mod backend;
pub mod cache;
pub mod error;
pub mod record;
pub mod resolution;
pub mod weight;

pub use backend::{AsyncLookup, DnsBackend, SpawnedBackend, StaticLookup};
#[cfg(feature = "hickory")]
pub use backend::HickoryLookup;
pub use cache::DnsCache;
pub use error::{Error, LookupError, Result};
pub use record::{
    DnsAnswer, DnsQuery, DnsRecord, NaptrData, QueryId, RecordData, RecordType, SrvData,
};
pub use resolution::{Action, IpFamilyOrder, Resolution, ResolverConfig, SrvTarget, Target};
pub use weight::order_srv;
