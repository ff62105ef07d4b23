//! # RFC 3263 resolution as a state machine
//!
//! A [`Resolution`] turns a target URI into an ordered stream of
//! [`Target`]s without doing any I/O itself. The owner repeatedly calls
//! [`Resolution::next_action`]:
//!
//! - [`Action::Target`]: try this destination
//! - [`Action::Query`]: the cache had no answer; submit this query and feed
//!   the answer back with [`Resolution::on_answer`]
//! - [`Action::Wait`]: a query is outstanding
//! - [`Action::Exhausted`]: nothing left to try
//!
//! The cascade follows RFC 3263 Section 4:
//!
//! 1. Numeric host: use it directly.
//! 2. Explicit port: A/AAAA only.
//! 3. NAPTR (when enabled and no transport was requested), keeping only the
//!    records that share the lowest usable order, by preference.
//! 4. Otherwise one SRV query per candidate transport, then plain A/AAAA on
//!    the default port when no SRV record existed at all.

use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use siptx_sip_core::Uri;
use siptx_sip_transport::{Destination, TransportKind};

use crate::cache::DnsCache;
use crate::error::{Error, LookupError, Result};
use crate::record::{normalize_name, DnsRecord, NaptrData, RecordData, RecordType, SrvData};
use crate::weight::order_srv;

/// Order in which AAAA and A records are asked for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpFamilyOrder {
    #[default]
    Ipv4First,
    Ipv6First,
    Ipv4Only,
    Ipv6Only,
}

impl IpFamilyOrder {
    pub fn record_types(self) -> &'static [RecordType] {
        match self {
            IpFamilyOrder::Ipv4First => &[RecordType::A, RecordType::Aaaa],
            IpFamilyOrder::Ipv6First => &[RecordType::Aaaa, RecordType::A],
            IpFamilyOrder::Ipv4Only => &[RecordType::A],
            IpFamilyOrder::Ipv6Only => &[RecordType::Aaaa],
        }
    }
}

/// Knobs for a resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    pub use_naptr: bool,
    pub use_srv: bool,
    pub ip_family: IpFamilyOrder,
    /// Transports the agent can send on, in preference order
    pub transports: Vec<TransportKind>,
    /// Seed for the SRV weight draw; random when `None`
    pub seed: Option<u64>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            use_naptr: true,
            use_srv: true,
            ip_family: IpFamilyOrder::default(),
            transports: vec![TransportKind::Udp, TransportKind::Tcp, TransportKind::Tls],
            seed: None,
        }
    }
}

/// The SRV record a target came from, needed for graylisting
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SrvTarget {
    /// SRV owner name, e.g. `_sip._udp.example.com`
    pub owner: String,
    pub target: String,
    pub port: u16,
}

/// A concrete destination produced by the cascade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub destination: Destination,
    /// Host name the address was found for
    pub host: String,
    pub srv: Option<SrvTarget>,
}

/// What the owner of a resolution should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Query { domain: String, rtype: RecordType },
    Wait,
    Target(Target),
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Naptr {
        domain: String,
    },
    Srv {
        owner: String,
        kind: TransportKind,
    },
    Addr {
        host: String,
        port: u16,
        kind: TransportKind,
        rtype: RecordType,
        srv: Option<SrvTarget>,
    },
    /// A/AAAA on the default port, only if no SRV record was found
    AddrFallback {
        host: String,
        kind: TransportKind,
    },
}

impl Step {
    fn key(&self) -> Option<(&str, RecordType)> {
        match self {
            Step::Naptr { domain } => Some((domain, RecordType::Naptr)),
            Step::Srv { owner, .. } => Some((owner, RecordType::Srv)),
            Step::Addr { host, rtype, .. } => Some((host, *rtype)),
            Step::AddrFallback { .. } => None,
        }
    }
}

/// Per-transaction resolver state
#[derive(Debug)]
pub struct Resolution {
    host: String,
    secure: bool,
    config: ResolverConfig,
    candidates: Vec<TransportKind>,
    steps: VecDeque<Step>,
    ready: VecDeque<Target>,
    waiting: Option<Step>,
    query_sent: bool,
    found_srv: bool,
    tried: HashSet<Destination>,
    rng: SmallRng,
}

impl Resolution {
    /// Plan the cascade for `uri`
    pub fn new(uri: &Uri, config: &ResolverConfig) -> Result<Self> {
        let secure = uri.is_secure();
        let explicit = match uri.transport() {
            Some(name) => Some(
                name.parse::<TransportKind>()
                    .map_err(|_| Error::Unresolvable(uri.to_string()))?,
            ),
            None => None,
        };
        if secure && matches!(explicit, Some(TransportKind::Udp | TransportKind::Sctp)) {
            return Err(Error::Unresolvable(uri.to_string()));
        }

        let candidates: Vec<TransportKind> = match explicit {
            Some(TransportKind::Tcp) if secure => vec![TransportKind::Tls],
            Some(kind) => vec![kind],
            None => config
                .transports
                .iter()
                .copied()
                .filter(|k| !secure || k.is_secure())
                .collect(),
        };
        let Some(&default_kind) = candidates.first() else {
            return Err(Error::Unresolvable(uri.to_string()));
        };
        let default_kind =
            if explicit.is_none() && !secure && candidates.contains(&TransportKind::Udp) {
                TransportKind::Udp
            } else {
                default_kind
            };

        let host = uri.maddr().unwrap_or(&uri.host).to_string();
        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let mut resolution = Resolution {
            host: host.clone(),
            secure,
            config: config.clone(),
            candidates: candidates.clone(),
            steps: VecDeque::new(),
            ready: VecDeque::new(),
            waiting: None,
            query_sent: false,
            found_srv: false,
            tried: HashSet::new(),
            rng,
        };

        if let Ok(ip) = host.parse::<IpAddr>() {
            let port = uri.port.unwrap_or(default_kind.default_port());
            resolution.push_target(Target {
                destination: Destination::new(default_kind, SocketAddr::new(ip, port)),
                host,
                srv: None,
            });
        } else if let Some(port) = uri.port {
            let steps = resolution.addr_steps(&host, port, default_kind, None);
            resolution.steps.extend(steps);
        } else if config.use_naptr && explicit.is_none() {
            resolution.steps.push_back(Step::Naptr {
                domain: normalize_name(&host),
            });
        } else if config.use_srv {
            let steps = resolution.srv_steps(&host, default_kind);
            resolution.steps.extend(steps);
        } else {
            let steps = resolution.addr_steps(&host, default_kind.default_port(), default_kind, None);
            resolution.steps.extend(steps);
        }

        debug!(host = %resolution.host, steps = resolution.steps.len(), "resolution planned");
        Ok(resolution)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// A query is outstanding
    pub fn is_waiting(&self) -> bool {
        self.waiting.is_some()
    }

    /// True while anything may still produce a target
    pub fn has_more(&self) -> bool {
        !self.ready.is_empty() || !self.steps.is_empty() || self.waiting.is_some()
    }

    /// Advance the cascade, consulting `cache` before asking for a query
    pub fn next_action(&mut self, cache: &DnsCache, now: Instant) -> Action {
        loop {
            if let Some(target) = self.ready.pop_front() {
                trace!(destination = %target.destination, "resolved target");
                return Action::Target(target);
            }
            if let Some(step) = &self.waiting {
                if self.query_sent {
                    return Action::Wait;
                }
                if let Some((domain, rtype)) = step.key() {
                    let query = Action::Query {
                        domain: domain.to_string(),
                        rtype,
                    };
                    self.query_sent = true;
                    return query;
                }
                self.waiting = None;
                continue;
            }
            let Some(step) = self.steps.pop_front() else {
                return Action::Exhausted;
            };
            if let Step::AddrFallback { host, kind } = &step {
                if !self.found_srv {
                    let steps = self.addr_steps(host, kind.default_port(), *kind, None);
                    self.prepend(steps);
                }
                continue;
            }
            let cached = step
                .key()
                .and_then(|(domain, rtype)| cache.get(domain, rtype, now))
                .map(<[DnsRecord]>::to_vec);
            match cached {
                Some(records) => {
                    trace!(?step, count = records.len(), "cache hit");
                    self.process(step, &records);
                }
                None => {
                    self.waiting = Some(step);
                    self.query_sent = false;
                }
            }
        }
    }

    /// Feed the answer for the outstanding query. Answers that do not match
    /// it are ignored and `false` is returned.
    pub fn on_answer(
        &mut self,
        domain: &str,
        rtype: RecordType,
        result: &std::result::Result<Vec<DnsRecord>, LookupError>,
        cache: &mut DnsCache,
        now: Instant,
    ) -> bool {
        let matches = self
            .waiting
            .as_ref()
            .and_then(Step::key)
            .map(|(d, t)| t == rtype && d.eq_ignore_ascii_case(&normalize_name(domain)))
            .unwrap_or(false);
        if !matches {
            return false;
        }
        let Some(step) = self.waiting.take() else {
            return false;
        };
        self.query_sent = false;
        let records = match result {
            Ok(records) => {
                cache.insert(domain, rtype, records.clone(), now);
                records.clone()
            }
            Err(LookupError::NoData) | Err(LookupError::NxDomain) => {
                cache.insert(domain, rtype, Vec::new(), now);
                Vec::new()
            }
            Err(LookupError::Failed(reason)) => {
                debug!(domain, %rtype, reason = %reason, "lookup failed");
                Vec::new()
            }
        };
        self.process(step, &records);
        true
    }

    fn process(&mut self, step: Step, records: &[DnsRecord]) {
        match step {
            Step::Naptr { domain } => self.process_naptr(&domain, records),
            Step::Srv { owner, kind } => self.process_srv(&owner, kind, records),
            Step::Addr {
                host,
                port,
                kind,
                srv,
                ..
            } => {
                for record in records {
                    let ip = match &record.data {
                        RecordData::A(v4) => IpAddr::V4(*v4),
                        RecordData::Aaaa(v6) => IpAddr::V6(*v6),
                        _ => continue,
                    };
                    self.push_target(Target {
                        destination: Destination::new(kind, SocketAddr::new(ip, port)),
                        host: host.clone(),
                        srv: srv.clone(),
                    });
                }
            }
            Step::AddrFallback { .. } => {}
        }
    }

    fn process_naptr(&mut self, domain: &str, records: &[DnsRecord]) {
        let mut usable: Vec<(&NaptrData, TransportKind)> = records
            .iter()
            .filter_map(|r| match &r.data {
                RecordData::Naptr(naptr) => Some(naptr),
                _ => None,
            })
            .filter(|n| n.flags.eq_ignore_ascii_case("s") || n.flags.eq_ignore_ascii_case("a"))
            .filter_map(|n| {
                TransportKind::from_naptr_service(&n.services)
                    .filter(|k| self.candidates.contains(k))
                    .map(|k| (n, k))
            })
            .collect();
        usable.sort_by_key(|(n, _)| (n.order, n.preference));

        let Some(first_order) = usable.first().map(|(n, _)| n.order) else {
            debug!(domain, "no usable NAPTR, falling back to SRV");
            let kind = self.default_kind();
            let steps = if self.config.use_srv {
                self.srv_steps(domain, kind)
            } else {
                self.addr_steps(domain, kind.default_port(), kind, None)
            };
            self.prepend(steps);
            return;
        };

        let mut steps = Vec::new();
        for (naptr, kind) in usable.into_iter().filter(|(n, _)| n.order == first_order) {
            if naptr.flags.eq_ignore_ascii_case("s") {
                steps.push(Step::Srv {
                    owner: naptr.replacement.clone(),
                    kind,
                });
            } else {
                steps.extend(self.addr_steps(&naptr.replacement, kind.default_port(), kind, None));
            }
        }
        self.prepend(steps);
    }

    fn process_srv(&mut self, owner: &str, kind: TransportKind, records: &[DnsRecord]) {
        let srvs: Vec<SrvData> = records
            .iter()
            .filter_map(|r| match &r.data {
                RecordData::Srv(srv) if !srv.target.is_empty() => Some(srv.clone()),
                _ => None,
            })
            .collect();
        if srvs.is_empty() {
            return;
        }
        self.found_srv = true;
        let ordered = order_srv(&srvs, &mut self.rng);
        let mut steps = Vec::new();
        for srv in ordered {
            let origin = SrvTarget {
                owner: normalize_name(owner),
                target: srv.target.clone(),
                port: srv.port,
            };
            steps.extend(self.addr_steps(&srv.target, srv.port, kind, Some(origin)));
        }
        self.prepend(steps);
    }

    fn srv_steps(&self, host: &str, fallback: TransportKind) -> Vec<Step> {
        let mut steps: Vec<Step> = self
            .candidates
            .iter()
            .filter_map(|k| {
                k.srv_prefix().map(|prefix| Step::Srv {
                    owner: format!("{}{}", prefix, normalize_name(host)),
                    kind: *k,
                })
            })
            .collect();
        steps.push(Step::AddrFallback {
            host: normalize_name(host),
            kind: fallback,
        });
        steps
    }

    fn addr_steps(
        &self,
        host: &str,
        port: u16,
        kind: TransportKind,
        srv: Option<SrvTarget>,
    ) -> Vec<Step> {
        let host = normalize_name(host);
        self.config
            .ip_family
            .record_types()
            .iter()
            .map(|rtype| Step::Addr {
                host: host.clone(),
                port,
                kind,
                rtype: *rtype,
                srv: srv.clone(),
            })
            .collect()
    }

    fn default_kind(&self) -> TransportKind {
        if !self.secure && self.candidates.contains(&TransportKind::Udp) {
            TransportKind::Udp
        } else {
            self.candidates.first().copied().unwrap_or(TransportKind::Udp)
        }
    }

    fn prepend(&mut self, steps: Vec<Step>) {
        for step in steps.into_iter().rev() {
            self.steps.push_front(step);
        }
    }

    fn push_target(&mut self, target: Target) {
        if self.tried.insert(target.destination) {
            self.ready.push_back(target);
        }
    }
}
