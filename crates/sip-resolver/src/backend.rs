//! DNS backends
//!
//! The engine talks to DNS through [`DnsBackend::submit`], which must not
//! block. [`SpawnedBackend`] adapts any [`AsyncLookup`] by running each
//! query on the tokio runtime and posting the [`DnsAnswer`] to a channel
//! that the engine task drains.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::LookupError;
use crate::record::{normalize_name, DnsAnswer, DnsQuery, DnsRecord, RecordType};

/// Non-blocking query submission used by the engine
pub trait DnsBackend: Send {
    fn submit(&mut self, query: DnsQuery);

    /// The engine lost interest in a query; answers may still arrive
    fn cancel(&mut self, _query: &DnsQuery) {}
}

impl<T: DnsBackend + ?Sized> DnsBackend for Box<T> {
    fn submit(&mut self, query: DnsQuery) {
        (**self).submit(query)
    }

    fn cancel(&mut self, query: &DnsQuery) {
        (**self).cancel(query)
    }
}

/// Plain async record lookup
#[async_trait]
pub trait AsyncLookup: Send + Sync {
    async fn lookup(
        &self,
        domain: &str,
        rtype: RecordType,
    ) -> Result<Vec<DnsRecord>, LookupError>;
}

/// Runs an [`AsyncLookup`] per query on the current tokio runtime
pub struct SpawnedBackend<L> {
    lookup: Arc<L>,
    answers: mpsc::UnboundedSender<DnsAnswer>,
}

impl<L: AsyncLookup + 'static> SpawnedBackend<L> {
    pub fn new(lookup: L) -> (Self, mpsc::UnboundedReceiver<DnsAnswer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SpawnedBackend {
                lookup: Arc::new(lookup),
                answers: tx,
            },
            rx,
        )
    }
}

impl<L: AsyncLookup + 'static> DnsBackend for SpawnedBackend<L> {
    fn submit(&mut self, query: DnsQuery) {
        let answers = self.answers.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(domain = %query.domain, "no runtime for DNS lookup");
            let _ = answers.send(DnsAnswer::error(
                &query,
                LookupError::Failed("no tokio runtime".into()),
            ));
            return;
        };
        let lookup = Arc::clone(&self.lookup);
        handle.spawn(async move {
            debug!(id = %query.id, domain = %query.domain, rtype = %query.rtype, "DNS query");
            let answer = match lookup.lookup(&query.domain, query.rtype).await {
                Ok(records) => DnsAnswer::records(&query, records),
                Err(e) => DnsAnswer::error(&query, e),
            };
            let _ = answers.send(answer);
        });
    }
}

/// Fixed zone data, useful for tests and static deployments
#[derive(Debug, Clone, Default)]
pub struct StaticLookup {
    zone: HashMap<(String, RecordType), Vec<DnsRecord>>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(mut self, domain: &str, records: Vec<DnsRecord>) -> Self {
        for record in records {
            self.zone
                .entry((normalize_name(domain), record.data.record_type()))
                .or_default()
                .push(record);
        }
        self
    }

    pub fn get(&self, domain: &str, rtype: RecordType) -> Result<Vec<DnsRecord>, LookupError> {
        self.zone
            .get(&(normalize_name(domain), rtype))
            .cloned()
            .ok_or(LookupError::NoData)
    }
}

#[async_trait]
impl AsyncLookup for StaticLookup {
    async fn lookup(
        &self,
        domain: &str,
        rtype: RecordType,
    ) -> Result<Vec<DnsRecord>, LookupError> {
        self.get(domain, rtype)
    }
}

#[cfg(feature = "hickory")]
pub use self::hickory::HickoryLookup;

#[cfg(feature = "hickory")]
mod hickory {
    use async_trait::async_trait;
    use hickory_resolver::config::{ResolverConfig, ResolverOpts};
    use hickory_resolver::error::{ResolveError, ResolveErrorKind};
    use hickory_resolver::proto::rr::{RData, RecordType as HickoryType};
    use hickory_resolver::TokioAsyncResolver;

    use crate::error::LookupError;
    use crate::record::{DnsRecord, NaptrData, RecordData, RecordType, SrvData, normalize_name};

    use super::AsyncLookup;

    /// System resolver backed by hickory
    pub struct HickoryLookup {
        resolver: TokioAsyncResolver,
    }

    impl HickoryLookup {
        /// Resolver using `/etc/resolv.conf` or the platform equivalent
        pub fn from_system() -> Result<Self, LookupError> {
            let resolver = TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| LookupError::Failed(e.to_string()))?;
            Ok(HickoryLookup { resolver })
        }

        pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
            HickoryLookup {
                resolver: TokioAsyncResolver::tokio(config, opts),
            }
        }
    }

    fn classify(err: ResolveError) -> LookupError {
        match err.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => LookupError::NoData,
            _ => LookupError::Failed(err.to_string()),
        }
    }

    fn text(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    #[async_trait]
    impl AsyncLookup for HickoryLookup {
        async fn lookup(
            &self,
            domain: &str,
            rtype: RecordType,
        ) -> Result<Vec<DnsRecord>, LookupError> {
            let wanted = match rtype {
                RecordType::Naptr => HickoryType::NAPTR,
                RecordType::Srv => HickoryType::SRV,
                RecordType::A => HickoryType::A,
                RecordType::Aaaa => HickoryType::AAAA,
            };
            let name = format!("{}.", domain.trim_end_matches('.'));
            let lookup = self.resolver.lookup(name, wanted).await.map_err(classify)?;

            let mut records = Vec::new();
            for record in lookup.record_iter() {
                let ttl = record.ttl();
                let data = match record.data() {
                    Some(RData::NAPTR(naptr)) => RecordData::Naptr(NaptrData {
                        order: naptr.order(),
                        preference: naptr.preference(),
                        flags: text(naptr.flags()),
                        services: text(naptr.services()),
                        regexp: text(naptr.regexp()),
                        replacement: normalize_name(&naptr.replacement().to_utf8()),
                    }),
                    Some(RData::SRV(srv)) => RecordData::Srv(SrvData {
                        priority: srv.priority(),
                        weight: srv.weight(),
                        port: srv.port(),
                        target: normalize_name(&srv.target().to_utf8()),
                    }),
                    Some(RData::A(a)) => RecordData::A(a.0),
                    Some(RData::AAAA(aaaa)) => RecordData::Aaaa(aaaa.0),
                    _ => continue,
                };
                records.push(DnsRecord { ttl, data });
            }
            Ok(records)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::QueryId;

    #[tokio::test]
    async fn test_spawned_backend_posts_answers() {
        let zone = StaticLookup::new().with_records(
            "example.com",
            vec![DnsRecord::a("192.0.2.10".parse().unwrap())],
        );
        let (mut backend, mut answers) = SpawnedBackend::new(zone);
        backend.submit(DnsQuery {
            id: QueryId(1),
            domain: "example.com".into(),
            rtype: RecordType::A,
        });
        backend.submit(DnsQuery {
            id: QueryId(2),
            domain: "example.com".into(),
            rtype: RecordType::Aaaa,
        });

        let mut got = vec![answers.recv().await.unwrap(), answers.recv().await.unwrap()];
        got.sort_by_key(|a| a.id);
        assert_eq!(got[0].result.as_ref().map(Vec::len), Ok(1));
        assert_eq!(got[1].result, Err(LookupError::NoData));
    }
}
