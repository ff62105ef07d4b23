//! # The transaction agent
//!
//! [`Agent`] owns every piece of mutable protocol state: the server and
//! client transactions, their hash tables and timer queues, the legs, the
//! DNS cache and the statistics. It performs no I/O and never blocks:
//!
//! - messages come in through [`Agent::receive`],
//! - DNS answers through [`Agent::dns_answer`],
//! - time advances through [`Agent::tick`],
//! - application calls (`request`, `reply`, `cancel`, ...) are plain
//!   methods,
//!
//! and everything the application must react to is queued as an
//! [`AgentEvent`]. Outbound messages go straight to the [`Transport`] and
//! DNS queries to the [`DnsBackend`], both of which must not block.
//!
//! The [`AgentRunner`](crate::runner::AgentRunner) wraps an agent in a tokio
//! task; tests usually drive it directly with a
//! [`ManualClock`](crate::clock::ManualClock).
//!
//! ## Request dispatch
//!
//! ```text
//! receive(request)
//!   ├── sanity check / size limit ──────────────> stateless 400 / 513
//!   ├── stateless mode ─────────────────────────> TransactionlessRequest
//!   ├── ACK ──> INVITE transaction (non-2xx) / Ack event (2xx) / stray
//!   ├── CANCEL ─> 200 + Canceled event (+ 487) / 481
//!   ├── retransmission ─────────────────────────> resend last response
//!   ├── merged (ua) ────────────────────────────> 482
//!   ├── unknown dialog (ua) ────────────────────> 481
//!   └── new server transaction ─────────────────> IncomingRequest
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use siptx_sip_core::{generate_tag, Message, Method, Request, Response, ResponseBuilder, Uri};
use siptx_sip_resolver::{DnsAnswer, DnsBackend, DnsCache, DnsQuery, QueryId, ResolverConfig};
use siptx_sip_transport::{
    Compressor, Destination, NoCompression, SendError, SendStatus, Transport, TransportEvent,
};

use crate::clock::Clock;
use crate::config::{AgentConfig, ServerRport};
use crate::error::{Error, Result};
use crate::events::AgentEvent;
use crate::hash::HashTable;
use crate::incoming::Incoming;
use crate::leg::{LegSpec, LegTable};
use crate::outgoing::Outgoing;
use crate::queue::{
    Arena, IncomingId, LegId, OutgoingId, QueueKind, Queues, RetryKey, RetryList, TxRef,
};
use crate::stats::AgentStats;

/// Memory state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Active,
    /// In a terminated queue, released by the next scheduler pass
    PendingFree,
    Freed,
}

/// The SIP transaction engine
pub struct Agent {
    pub(crate) config: AgentConfig,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) dns: Box<dyn DnsBackend>,
    pub(crate) compressor: Box<dyn Compressor>,
    clock: Arc<dyn Clock>,

    pub(crate) incoming: Arena<Incoming>,
    pub(crate) outgoing: Arena<Outgoing>,
    pub(crate) in_table: HashTable<IncomingId>,
    pub(crate) out_table: HashTable<OutgoingId>,
    pub(crate) legs: LegTable,

    pub(crate) queues: Queues,
    pub(crate) retry: RetryList,
    epoch: u64,
    /// Server transactions still waiting for a final response
    pub(crate) proceeding: usize,

    pub(crate) dns_cache: DnsCache,
    pub(crate) resolver_config: ResolverConfig,
    pub(crate) queries: HashMap<QueryId, OutgoingId>,
    next_query: u64,

    pub(crate) events: VecDeque<AgentEvent>,
    pub(crate) stats: AgentStats,
    pub(crate) rng: SmallRng,
    instance: Uuid,
    pub(crate) shutting_down: bool,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("instance", &self.instance)
            .field("incoming", &self.incoming.len())
            .field("outgoing", &self.outgoing.len())
            .field("legs", &self.legs.len())
            .finish()
    }
}

impl Agent {
    /// Create an agent
    ///
    /// # Arguments
    /// * `config` - Validated before use
    /// * `transport` - Outbound half of the transport layer
    /// * `dns` - Where DNS queries are submitted; answers come back through
    ///   [`Agent::dns_answer`]
    /// * `clock` - Time source for every deadline
    pub fn new(
        config: AgentConfig,
        transport: impl Transport + 'static,
        dns: impl DnsBackend + 'static,
        clock: impl Clock + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let queues = Queues::new(|kind| Self::linger(&config, kind));
        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let instance = Uuid::new_v4();
        info!(%instance, t1 = ?config.t1, ua = config.ua, "agent created");
        Ok(Agent {
            resolver_config: config.resolver_config(),
            config,
            transport: Box::new(transport),
            dns: Box::new(dns),
            compressor: Box::new(NoCompression),
            clock: Arc::new(clock),
            incoming: Arena::default(),
            outgoing: Arena::default(),
            in_table: HashTable::new(),
            out_table: HashTable::new(),
            legs: LegTable::default(),
            queues,
            retry: RetryList::default(),
            epoch: 0,
            proceeding: 0,
            dns_cache: DnsCache::new(),
            queries: HashMap::new(),
            next_query: 0,
            events: VecDeque::new(),
            stats: AgentStats::default(),
            rng,
            instance,
            shutting_down: false,
        })
    }

    /// Replace the default no-op compressor
    pub fn with_compressor(mut self, compressor: impl Compressor + 'static) -> Self {
        self.compressor = Box::new(compressor);
        self
    }

    fn linger(config: &AgentConfig, kind: QueueKind) -> Option<std::time::Duration> {
        use std::time::Duration;
        match kind {
            QueueKind::InTrying => Some(config.extra_100_delay()),
            QueueKind::InProceeding => None,
            QueueKind::InPreliminary => Some(config.t1x64),
            QueueKind::InCompleted => Some(config.t1x64),
            QueueKind::InInvCompleted => Some(config.t1x64),
            QueueKind::InInvConfirmed => Some(config.t4),
            QueueKind::InFinalFailed => Some(config.t1),
            QueueKind::InTerminated => Some(Duration::ZERO),
            QueueKind::OutResolving => Some(config.t1x64),
            QueueKind::OutDelayed => None,
            QueueKind::OutTrying => Some(config.t1x64),
            QueueKind::OutInvCalling => Some(config.t1x64),
            QueueKind::OutInvProceeding => config.timer_c,
            QueueKind::OutCompleted => Some(config.t4),
            QueueKind::OutInvCompleted => Some(config.t1x64),
            QueueKind::OutInvAccepted => Some(config.t1x64),
            QueueKind::OutTerminated => Some(Duration::ZERO),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Identifier of this agent instance, used in logs
    pub fn instance_id(&self) -> Uuid {
        self.instance
    }

    /// Counter snapshot including live table sizes
    pub fn stats(&self) -> AgentStats {
        AgentStats {
            incoming_table: self.in_table.len(),
            outgoing_table: self.out_table.len(),
            leg_table: self.legs.len(),
            ..self.stats
        }
    }

    /// Take every queued event
    pub fn drain_events(&mut self) -> Vec<AgentEvent> {
        self.events.drain(..).collect()
    }

    pub fn next_event(&mut self) -> Option<AgentEvent> {
        self.events.pop_front()
    }

    pub(crate) fn emit(&mut self, event: AgentEvent) {
        trace!(?event, "event queued");
        self.events.push_back(event);
    }

    // Queue and timer bookkeeping

    pub(crate) fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Move a server transaction to `kind`, restarting its expiry
    pub(crate) fn set_incoming_queue(&mut self, id: IncomingId, kind: QueueKind) {
        let epoch = self.next_epoch();
        let now = self.now();
        let Some(irq) = self.incoming.get_mut(id.0) else {
            return;
        };
        let was_pending = is_proceeding(irq.queue);
        trace!(id = %id, from = ?irq.queue, to = ?kind, "server transaction queue");
        irq.queue = kind;
        irq.epoch = epoch;
        if kind.is_terminated() {
            irq.lifecycle = Lifecycle::PendingFree;
        }
        match (was_pending, is_proceeding(kind)) {
            (true, false) => self.proceeding = self.proceeding.saturating_sub(1),
            (false, true) => self.proceeding += 1,
            _ => {}
        }
        self.queues.get_mut(kind).push(TxRef::Incoming(id), now, epoch);
    }

    /// Move a client transaction to `kind`, restarting its expiry
    pub(crate) fn set_outgoing_queue(&mut self, id: OutgoingId, kind: QueueKind) {
        let epoch = self.next_epoch();
        let now = self.now();
        let Some(orq) = self.outgoing.get_mut(id.0) else {
            return;
        };
        trace!(id = %id, from = ?orq.queue, to = ?kind, "client transaction queue");
        orq.queue = kind;
        orq.epoch = epoch;
        if kind.is_terminated() {
            orq.lifecycle = Lifecycle::PendingFree;
        }
        self.queues.get_mut(kind).push(TxRef::Outgoing(id), now, epoch);
    }

    /// Arm the retransmission timer of a transaction, replacing any earlier one
    pub(crate) fn schedule_retry(&mut self, tx: TxRef, after: std::time::Duration) {
        let at = self.now() + after;
        self.cancel_retry(tx);
        let key = self.retry.schedule(at, tx);
        match tx {
            TxRef::Incoming(id) => {
                if let Some(irq) = self.incoming.get_mut(id.0) {
                    irq.retry = Some(key);
                }
            }
            TxRef::Outgoing(id) => {
                if let Some(orq) = self.outgoing.get_mut(id.0) {
                    orq.retry = Some(key);
                }
            }
        }
    }

    pub(crate) fn cancel_retry(&mut self, tx: TxRef) {
        let key = match tx {
            TxRef::Incoming(id) => self.incoming.get_mut(id.0).and_then(|t| t.retry.take()),
            TxRef::Outgoing(id) => self.outgoing.get_mut(id.0).and_then(|t| t.retry.take()),
        };
        if let Some(key) = key {
            self.retry.cancel(key, tx);
        }
    }

    /// The retry entry popped from the list is still the armed one
    pub(crate) fn take_retry(&mut self, tx: TxRef, key: RetryKey) -> bool {
        let slot = match tx {
            TxRef::Incoming(id) => self.incoming.get_mut(id.0).map(|t| &mut t.retry),
            TxRef::Outgoing(id) => self.outgoing.get_mut(id.0).map(|t| &mut t.retry),
        };
        match slot {
            Some(slot) if *slot == Some(key) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Queue entry still describes the transaction's current state
    pub(crate) fn entry_is_current(&self, tx: TxRef, kind: QueueKind, epoch: u64) -> bool {
        match tx {
            TxRef::Incoming(id) => self
                .incoming
                .get(id.0)
                .is_some_and(|t| t.queue == kind && t.epoch == epoch),
            TxRef::Outgoing(id) => self
                .outgoing
                .get(id.0)
                .is_some_and(|t| t.queue == kind && t.epoch == epoch),
        }
    }

    // Transport

    /// Send and count; failures are returned for the caller's ladder
    pub(crate) fn transmit(
        &mut self,
        message: &Message,
        destination: &Destination,
    ) -> std::result::Result<SendStatus, SendError> {
        let result = self.transport.send(message, destination);
        match &result {
            Ok(_) => {
                self.stats.sent_msg += 1;
                match message {
                    Message::Request(r) => {
                        self.stats.sent_request += 1;
                        trace!(method = %r.method, %destination, "request sent");
                    }
                    Message::Response(r) => {
                        self.stats.sent_response += 1;
                        trace!(status = r.status, %destination, "response sent");
                    }
                }
            }
            Err(e) => debug!(%destination, error = %e, "send failed"),
        }
        result
    }

    /// Handle one event from a transport receive loop
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::MessageReceived {
                message, source, ..
            } => self.receive(message, source),
            TransportEvent::Error { error } => warn!(error = %error, "transport error"),
            TransportEvent::Closed => info!("transport closed"),
        }
    }

    // Inbound

    /// Process a message received from `source`
    pub fn receive(&mut self, message: Message, source: Destination) {
        self.stats.recv_msg += 1;
        if self.shutting_down {
            return;
        }
        if self.config.debug_drop_prob > 0
            && !source.is_reliable()
            && self.rng.gen_range(0..1000) < self.config.debug_drop_prob
        {
            debug!(%source, "debug drop");
            match message {
                Message::Request(_) => self.stats.drop_request += 1,
                Message::Response(_) => self.stats.drop_response += 1,
            }
            return;
        }
        let checked = message.validate(self.config.max_size);
        match message {
            Message::Request(request) => {
                self.stats.recv_request += 1;
                if let Err(e) = checked {
                    self.stats.bad_message += 1;
                    self.stats.bad_request += 1;
                    let error = Error::MalformedMessage(e);
                    warn!(%source, method = %request.method, error = %error, "bad request");
                    if request.top_via().is_some() {
                        self.reply_stateless(&request, &source, error.status_code(), None);
                    }
                    return;
                }
                self.receive_request(request, source);
            }
            Message::Response(response) => {
                self.stats.recv_response += 1;
                if let Err(e) = checked {
                    self.stats.bad_message += 1;
                    self.stats.bad_response += 1;
                    warn!(%source, status = response.status, error = %e, "bad response dropped");
                    return;
                }
                self.receive_response(response, source);
            }
        }
    }

    fn receive_request(&mut self, mut request: Request, source: Destination) {
        debug!(method = %request.method, uri = %request.uri, %source, "request received");
        self.stamp_received_via(&mut request, &source);
        self.strip_local_routes(&mut request);

        if self.config.stateless {
            self.stats.trless_request += 1;
            let leg = self.legs.match_request(&request).or(self.legs.default_leg());
            self.emit(AgentEvent::TransactionlessRequest {
                request,
                source,
                leg,
            });
            return;
        }

        match request.method {
            Method::Ack => self.incoming_ack(request, source),
            Method::Cancel => self.incoming_cancel(request, source),
            _ => self.incoming_new(request, source),
        }
    }

    fn receive_response(&mut self, response: Response, source: Destination) {
        debug!(status = response.status, %source, "response received");
        match self.find_outgoing(&response) {
            Some(id) => self.outgoing_recv(id, response, source),
            None => {
                self.stats.trless_response += 1;
                let is_invite_2xx = response.is_success()
                    && response.cseq().is_some_and(|c| c.method == Method::Invite);
                if is_invite_2xx && self.config.ua {
                    self.orphan_2xx(&response, source, None);
                } else {
                    debug!(status = response.status, "stray response dropped");
                }
            }
        }
    }

    /// RFC 3261 18.2.1 `received` and RFC 3581 `rport`
    fn stamp_received_via(&self, request: &mut Request, source: &Destination) {
        let policy = if self.config.rport_applies(source.kind) {
            self.config.server_rport
        } else {
            ServerRport::Off
        };
        let Some(via) = request.headers.top_via_mut() else {
            return;
        };
        let ip = source.addr.ip();
        if via.host.parse::<IpAddr>().ok() != Some(ip) {
            via.params.set("received", Some(&ip.to_string()));
        }
        let wants_rport = match policy {
            ServerRport::Off => false,
            ServerRport::Use => via.rport().is_some(),
            ServerRport::Always => true,
        };
        if wants_rport {
            via.params.set("rport", Some(&source.addr.port().to_string()));
            if !via.params.contains("received") {
                via.params.set("received", Some(&ip.to_string()));
            }
        } else if via.rport() == Some(None) {
            via.params.remove("rport");
        }
    }

    /// Where responses to a request received from `source` go
    pub(crate) fn reply_destination(request: &Request, source: &Destination) -> Destination {
        let via = request.top_via();
        let symmetric = source.is_reliable() || via.is_some_and(|v| v.rport().is_some());
        if symmetric {
            return *source;
        }
        let port = via
            .and_then(|v| v.port)
            .unwrap_or_else(|| source.kind.default_port());
        Destination::new(source.kind, std::net::SocketAddr::new(source.addr.ip(), port))
    }

    /// Whether a URI names this agent
    pub(crate) fn is_local(&self, uri: &Uri) -> bool {
        let alias = self.config.aliases.iter().any(|a| {
            a.host.eq_ignore_ascii_case(&uri.host) && (a.port.is_none() || a.port == uri.port)
        });
        if alias {
            return true;
        }
        let Ok(ip) = uri.host.parse::<IpAddr>() else {
            return false;
        };
        self.config.transports.iter().any(|kind| {
            self.transport.local_addr(*kind).is_some_and(|local| {
                local.ip() == ip && uri.port.unwrap_or_else(|| kind.default_port()) == local.port()
            })
        })
    }

    /// Drop Route entries naming this agent and undo strict routing
    fn strip_local_routes(&self, request: &mut Request) {
        // A strict router put our address into the Request-URI
        if self.is_local(&request.uri) && !request.headers.route.is_empty() {
            let strict = request
                .headers
                .route
                .last()
                .is_some_and(|r| !r.uri.is_loose_route() && !self.is_local(&r.uri));
            if strict && request.uri.is_loose_route() {
                if let Some(last) = request.headers.route.pop() {
                    trace!(uri = %last.uri, "strict route restored");
                    request.uri = last.uri;
                }
            }
        }
        while request
            .headers
            .route
            .first()
            .is_some_and(|r| self.is_local(&r.uri))
        {
            request.headers.route.remove(0);
        }
    }

    /// Answer a request without a server transaction
    pub(crate) fn reply_stateless(
        &mut self,
        request: &Request,
        source: &Destination,
        status: u16,
        reason: Option<&str>,
    ) {
        if request.method == Method::Ack {
            return;
        }
        let mut builder = ResponseBuilder::from_request(request, status);
        if let Some(reason) = reason {
            builder = builder.reason(reason);
        }
        if status > 100 && request.headers.to_tag().is_none() {
            builder = builder.to_tag(&generate_tag());
        }
        if status >= 500 && self.config.blacklist > 0 {
            builder = builder.retry_after(self.config.blacklist);
        }
        let response = builder.build();
        let destination = Self::reply_destination(request, source);
        debug!(status, method = %request.method, %destination, "stateless reply");
        if let Err(e) = self.transmit(&Message::Response(response), &destination) {
            debug!(status, error = %e, "stateless reply not sent");
        }
    }

    /// Send a message without any transaction state
    pub fn forward_stateless(&mut self, message: Message, destination: Destination) -> Result<()> {
        self.transmit(&message, &destination)
            .map(|_| ())
            .map_err(Error::TransportFailure)
    }

    // DNS

    pub(crate) fn submit_query(
        &mut self,
        id: OutgoingId,
        domain: String,
        rtype: siptx_sip_resolver::RecordType,
    ) -> DnsQuery {
        self.next_query += 1;
        let query_id = QueryId(self.next_query);
        self.queries.insert(query_id, id);
        trace!(id = %id, query = %query_id, %domain, %rtype, "DNS query submitted");
        let query = DnsQuery {
            id: query_id,
            domain,
            rtype,
        };
        self.dns.submit(query.clone());
        query
    }

    /// Feed a DNS answer to the transaction waiting for it
    pub fn dns_answer(&mut self, answer: DnsAnswer) {
        let Some(id) = self.queries.remove(&answer.id) else {
            trace!(query = %answer.id, "answer for a forgotten query");
            return;
        };
        self.outgoing_dns_answer(id, answer);
    }

    // Legs

    pub fn leg_create(&mut self, spec: LegSpec) -> LegId {
        self.legs.create(spec)
    }

    pub fn leg_destroy(&mut self, id: LegId) -> Result<()> {
        if self.legs.destroy(id) {
            Ok(())
        } else {
            Err(Error::LegNotFound(id.to_string()))
        }
    }

    /// Set the local tag of a leg, generating one when `tag` is `None`
    pub fn leg_tag(&mut self, id: LegId, tag: Option<&str>) -> Result<String> {
        self.legs.tag(id, tag)
    }

    /// Learn route set and target from a response to a dialog creating request
    pub fn leg_client_route(&mut self, id: LegId, response: &Response) -> Result<()> {
        self.legs.client_route(id, response)
    }

    /// Learn route set and target from a received dialog creating request
    pub fn leg_server_route(&mut self, id: LegId, request: &Request) -> Result<()> {
        self.legs.server_route(id, request)
    }

    /// Dialog leg by Call-ID and tags as seen from this side
    pub fn leg_by_call_id(
        &self,
        call_id: &str,
        local_tag: Option<&str>,
        remote_tag: Option<&str>,
    ) -> Option<LegId> {
        self.legs.find_dialog(call_id, local_tag, remote_tag, None)
    }

    pub fn set_default_leg(&mut self, id: LegId) -> Result<()> {
        self.legs.set_default(id)
    }

    pub fn leg_local_tag(&self, id: LegId) -> Option<&str> {
        self.legs.get(id).and_then(|l| l.local_tag.as_deref())
    }

    pub fn leg_remote_tag(&self, id: LegId) -> Option<&str> {
        self.legs.get(id).and_then(|l| l.remote_tag.as_deref())
    }

    // Teardown

    /// Answer and terminate everything, then release all state
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!(
            incoming = self.incoming.len(),
            outgoing = self.outgoing.len(),
            "agent shutting down"
        );

        for key in self.incoming.keys() {
            let id = IncomingId(key);
            let pending = self
                .incoming
                .get(key)
                .is_some_and(|irq| irq.status < 200 && irq.method != Method::Ack);
            if pending {
                if let Err(e) = self.reply(id, 500, Some("Server Shutting Down")) {
                    debug!(id = %id, error = %e, "automatic reply failed");
                }
            }
            self.incoming_terminate(id);
        }
        for key in self.outgoing.keys() {
            let id = OutgoingId(key);
            self.outgoing_local_reply(id, 503, "Agent Shutting Down");
            self.outgoing_terminate(id);
        }
        self.shutting_down = true;

        for (query, _) in self.queries.drain() {
            trace!(%query, "query abandoned");
        }
        let now = self.now();
        self.reap(now, true);
        for key in self.incoming.keys() {
            if let Some(irq) = self.incoming.remove(key) {
                if let Some(compartment) = irq.compartment {
                    self.compressor.zap(compartment);
                }
            }
        }
        for key in self.outgoing.keys() {
            self.outgoing.remove(key);
        }
        self.in_table.clear();
        self.out_table.clear();
        self.retry = RetryList::default();
        self.proceeding = 0;
        debug!("agent drained");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutting_down
    }
}

pub(crate) fn is_proceeding(kind: QueueKind) -> bool {
    matches!(
        kind,
        QueueKind::InTrying | QueueKind::InProceeding | QueueKind::InPreliminary
    )
}
