//! TTL bound answer cache shared by every resolution of an agent
//!
//! Negative answers are cached too, for [`DnsCache::negative_ttl`], so a
//! missing NAPTR is not asked for again on every request.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::record::{normalize_name, DnsRecord, RecordData, RecordType};

#[derive(Debug, Clone)]
struct CacheEntry {
    records: Vec<DnsRecord>,
    expires: Instant,
}

/// Cache keyed by `(domain, record type)`
#[derive(Debug, Clone)]
pub struct DnsCache {
    entries: HashMap<(String, RecordType), CacheEntry>,
    negative_ttl: Duration,
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsCache {
    pub fn new() -> Self {
        DnsCache {
            entries: HashMap::new(),
            negative_ttl: Duration::from_secs(60),
        }
    }

    pub fn with_negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = ttl;
        self
    }

    pub fn negative_ttl(&self) -> Duration {
        self.negative_ttl
    }

    /// Cached records, `Some(&[])` for a cached negative answer
    pub fn get(&self, domain: &str, rtype: RecordType, now: Instant) -> Option<&[DnsRecord]> {
        self.entries
            .get(&(normalize_name(domain), rtype))
            .filter(|e| e.expires > now)
            .map(|e| e.records.as_slice())
    }

    /// Store an answer; the entry lives as long as its shortest TTL
    pub fn insert(&mut self, domain: &str, rtype: RecordType, records: Vec<DnsRecord>, now: Instant) {
        let ttl = records
            .iter()
            .map(|r| Duration::from_secs(u64::from(r.ttl)))
            .min()
            .unwrap_or(self.negative_ttl);
        self.entries.insert(
            (normalize_name(domain), rtype),
            CacheEntry {
                records,
                expires: now + ttl,
            },
        );
    }

    /// Highest SRV priority cached for `domain`
    pub fn max_srv_priority(&self, domain: &str, now: Instant) -> Option<u16> {
        self.get(domain, RecordType::Srv, now)?
            .iter()
            .filter_map(|r| match &r.data {
                RecordData::Srv(srv) => Some(srv.priority),
                _ => None,
            })
            .max()
    }

    /// Rewrite the priority of one cached SRV record and keep the entry for
    /// at least `ttl`. Returns false when nothing matched.
    pub fn set_srv_priority(
        &mut self,
        domain: &str,
        target: &str,
        port: u16,
        priority: u16,
        ttl: Duration,
        now: Instant,
    ) -> bool {
        let target = normalize_name(target);
        let Some(entry) = self.entries.get_mut(&(normalize_name(domain), RecordType::Srv)) else {
            return false;
        };
        if entry.expires <= now {
            return false;
        }
        let mut found = false;
        for record in entry.records.iter_mut() {
            if let RecordData::Srv(srv) = &mut record.data {
                if srv.target == target && srv.port == port {
                    srv.priority = priority;
                    found = true;
                }
            }
        }
        if found {
            entry.expires = entry.expires.max(now + ttl);
            debug!(domain, %target, port, priority, "SRV priority rewritten");
        }
        found
    }

    /// Depress an SRV target below every other record of its owner name
    pub fn graylist(
        &mut self,
        domain: &str,
        target: &str,
        port: u16,
        bump: u16,
        ttl: Duration,
        now: Instant,
    ) -> bool {
        let Some(max) = self.max_srv_priority(domain, now) else {
            return false;
        };
        self.set_srv_priority(domain, target, port, max.saturating_add(bump), ttl, now)
    }

    /// Drop expired entries
    pub fn purge(&mut self, now: Instant) {
        self.entries.retain(|_, e| e.expires > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
