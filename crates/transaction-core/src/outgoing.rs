//! # Client transactions
//!
//! One [`Outgoing`] per request sent by the application, plus the ones the
//! agent sends on its own (ACK and BYE for orphaned 2xx, CANCEL).
//!
//! ```text
//!  OutResolving ──target──> OutInvCalling (A/B) ──1xx──> OutInvProceeding (C)
//!       │                         │                             │
//!       │                         ├──────── 2xx ────────────────┼──> OutInvAccepted
//!       │                         └──── 300-699, ACK sent ──────┴──> OutInvCompleted (D)
//!       │
//!       └──target──> OutTrying (E/F) ──final──> OutCompleted (K) ──> OutTerminated
//! ```
//!
//! ## Sending
//!
//! Each destination is tried with a small fallback ladder before the next
//! DNS target is taken:
//!
//! 1. requests larger than the UDP MTU go over TCP right away
//! 2. EMSGSIZE on UDP switches to TCP once
//! 3. ECONNREFUSED after such a switch falls back to UDP
//! 4. a transient error is retried once
//!
//! When the ladder and the DNS targets run out the application gets a
//! locally generated 503.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, trace, warn};

use siptx_sip_core::{
    generate_branch, generate_call_id, CSeq, Message, Method, RAck, Request, Response, Uri, Via,
    OPTION_100REL,
};
use siptx_sip_resolver::{Action, DnsQuery, Resolution, Target};
use siptx_sip_transport::{
    CompartmentId, Destination, PendingId, SendError, SendStatus, TransportKind,
};

use crate::agent::{Agent, Lifecycle};
use crate::error::{Error, Result};
use crate::events::AgentEvent;
use crate::hash::transaction_hash;
use crate::queue::{LegId, OutgoingId, QueueKind, RetryKey, TxRef};

/// State of a client transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClientState {
    /// Waiting for DNS
    Resolving,
    /// INVITE sent, or a CANCEL waiting for its INVITE to make progress
    Calling,
    /// Non-INVITE sent
    Trying,
    /// A provisional response arrived
    Proceeding,
    /// A final response arrived
    Completed,
    Terminated,
}

impl ClientState {
    pub(crate) fn from_queue(kind: QueueKind, status: u16) -> Self {
        match kind {
            QueueKind::OutResolving => ClientState::Resolving,
            QueueKind::OutDelayed | QueueKind::OutInvCalling => ClientState::Calling,
            QueueKind::OutTrying if status >= 100 => ClientState::Proceeding,
            QueueKind::OutTrying => ClientState::Trying,
            QueueKind::OutInvProceeding => ClientState::Proceeding,
            QueueKind::OutCompleted | QueueKind::OutInvCompleted | QueueKind::OutInvAccepted => {
                ClientState::Completed
            }
            _ => ClientState::Terminated,
        }
    }
}

/// A request handed to [`Agent::request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    /// Request without our Via; Max-Forwards is added when missing
    pub request: Request,
    /// Fill in dialog headers and routing from this leg
    pub leg: Option<LegId>,
    /// Skip DNS and send here
    pub destination: Option<Destination>,
}

impl RequestSpec {
    pub fn new(request: Request) -> Self {
        RequestSpec {
            request,
            leg: None,
            destination: None,
        }
    }

    pub fn on_leg(mut self, leg: LegId) -> Self {
        self.leg = Some(leg);
        self
    }

    pub fn to(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }
}

#[derive(Debug)]
pub(crate) struct Outgoing {
    pub method: Method,
    /// Request as sent, our Via on top
    pub request: Request,
    pub hash: u32,
    pub call_id: String,
    pub cseq: u32,
    pub branch: String,
    /// Set on tagged forks
    pub to_tag: Option<String>,
    pub leg: Option<LegId>,

    pub status: u16,
    pub response: Option<Response>,
    pub queue: QueueKind,
    pub epoch: u64,
    pub lifecycle: Lifecycle,
    pub retry: Option<RetryKey>,
    pub interval: Duration,

    pub destination: Option<Destination>,
    pub target: Option<Target>,
    pub resolution: Option<Resolution>,
    pub query: Option<DnsQuery>,
    pub pending: Option<PendingId>,
    pub compartment: Option<CompartmentId>,
    /// Switched to a stream transport because of size
    pub redirected: bool,
    /// Fell back to UDP after a refused connection
    pub udp_fallback: bool,
    /// The single transient retry was used
    pub send_retried: bool,

    /// Last accepted RSeq per To tag
    pub rseqs: HashMap<String, u32>,
    /// To tags of the 2xx responses passed upward
    pub accepted: HashSet<String>,
    /// Next CSeq for a PRACK
    pub prack_cseq: u32,
    /// ACK for a non-2xx final
    pub ack: Option<Request>,
    pub cancel: Option<OutgoingId>,
    pub cancel_of: Option<OutgoingId>,
    pub canceled: bool,
    pub timer_c_fired: bool,
    pub parent: Option<OutgoingId>,
    pub forks: Vec<OutgoingId>,

    pub destroyed: bool,
    pub internal: bool,
}

fn timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", now.as_secs(), now.subsec_millis())
}

/// ACK for a non-2xx final (RFC 3261 17.1.1.3)
fn build_ack(request: &Request, response: &Response) -> Request {
    let mut ack = Request::new(Method::Ack, request.uri.clone());
    let headers = &request.headers;
    ack.headers.via = headers.via.first().cloned().into_iter().collect();
    ack.headers.max_forwards = headers.max_forwards;
    ack.headers.from = headers.from.clone();
    ack.headers.to = response.headers.to.clone();
    ack.headers.call_id = headers.call_id.clone();
    ack.headers.cseq = headers
        .cseq
        .as_ref()
        .map(|c| CSeq::new(c.seq, Method::Ack));
    ack.headers.route = headers.route.clone();
    ack
}

/// CANCEL for a pending INVITE (RFC 3261 9.1)
fn build_cancel(request: &Request) -> Request {
    let mut cancel = Request::new(Method::Cancel, request.uri.clone());
    let headers = &request.headers;
    cancel.headers.via = headers.via.first().cloned().into_iter().collect();
    cancel.headers.max_forwards = headers.max_forwards;
    cancel.headers.from = headers.from.clone();
    cancel.headers.to = headers.to.clone();
    cancel.headers.call_id = headers.call_id.clone();
    cancel.headers.cseq = headers
        .cseq
        .as_ref()
        .map(|c| CSeq::new(c.seq, Method::Cancel));
    cancel.headers.route = headers.route.clone();
    cancel
}

/// In-dialog request answering a response: target from Contact, route from
/// the reversed Record-Route
fn dialog_request(method: Method, request: &Request, response: &Response, seq: u32) -> Request {
    let uri = response
        .headers
        .contact
        .first()
        .map(|c| c.uri.clone())
        .unwrap_or_else(|| request.uri.clone());
    let mut out = Request::new(method.clone(), uri);
    out.headers.from = request.headers.from.clone();
    out.headers.to = response.headers.to.clone();
    out.headers.call_id = request.headers.call_id.clone();
    out.headers.cseq = Some(CSeq::new(seq, method));
    out.headers.route = response.headers.record_route.iter().rev().cloned().collect();
    out
}

impl Agent {
    /// Start a client transaction
    pub fn request(&mut self, spec: RequestSpec) -> Result<OutgoingId> {
        if self.shutting_down {
            return Err(Error::InvalidState("agent is shut down".into()));
        }
        let RequestSpec {
            mut request,
            leg,
            destination,
        } = spec;
        if request.method == Method::Cancel {
            return Err(Error::InvalidCancel(
                "CANCEL is sent with Agent::cancel".into(),
            ));
        }
        if let Some(leg) = leg {
            self.legs.prepare_request(leg, &mut request)?;
        }

        let headers = &mut request.headers;
        if headers.call_id.is_none() {
            headers.call_id = Some(generate_call_id(None));
        }
        if headers.max_forwards.is_none() {
            headers.max_forwards = Some(self.config.max_forwards);
        }
        if self.config.use_timestamp && headers.timestamp.is_none() {
            headers.timestamp = Some(timestamp());
        }
        if self.config.rel100
            && request.method == Method::Invite
            && !request.headers.supports(OPTION_100REL)
        {
            request.headers.supported.push(OPTION_100REL.to_string());
        }

        // A strict router already sits in the Request-URI
        let hop = match request.headers.route.first() {
            Some(route) if route.uri.is_loose_route() => route.uri.clone(),
            Some(_) => request.uri.clone(),
            None => self
                .config
                .default_proxy
                .clone()
                .unwrap_or_else(|| request.uri.clone()),
        };
        let resolution = match destination {
            Some(_) => None,
            None => Some(
                Resolution::new(&hop, &self.resolver_config)
                    .map_err(|e| Error::ResolutionFailure(e.to_string()))?,
            ),
        };

        let branch = generate_branch();
        // Placeholder, rewritten for each destination
        request
            .headers
            .via
            .insert(0, Via::new("UDP", "invalid", None).with_branch(&branch));
        Message::Request(request.clone()).validate(self.config.max_size)?;

        let id = self.create_outgoing(request, branch, leg, None);
        if let Some(orq) = self.outgoing.get_mut(id.0) {
            orq.resolution = resolution;
            orq.destination = destination;
            if hop.params.get("comp") == Some("sigcomp") {
                orq.compartment = destination.and_then(|d| self.compressor.compartment(&d));
            }
        }
        debug!(id = %id, hop = %hop, "client transaction created");
        if destination.is_some() {
            self.send_outgoing(id);
        } else {
            self.outgoing_resolve(id);
        }
        Ok(id)
    }

    fn create_outgoing(
        &mut self,
        request: Request,
        branch: String,
        leg: Option<LegId>,
        to_tag: Option<String>,
    ) -> OutgoingId {
        let call_id = request.call_id().unwrap_or_default().to_string();
        let cseq = request.cseq().map_or(0, |c| c.seq);
        let hash = transaction_hash(&call_id, cseq);
        let epoch = self.next_epoch();
        let now = self.now();
        let orq = Outgoing {
            method: request.method.clone(),
            request,
            hash,
            call_id,
            cseq,
            branch,
            to_tag,
            leg,
            status: 0,
            response: None,
            queue: QueueKind::OutResolving,
            epoch,
            lifecycle: Lifecycle::Active,
            retry: None,
            interval: self.config.t1,
            destination: None,
            target: None,
            resolution: None,
            query: None,
            pending: None,
            compartment: None,
            redirected: false,
            udp_fallback: false,
            send_retried: false,
            rseqs: HashMap::new(),
            accepted: HashSet::new(),
            prack_cseq: cseq.wrapping_add(1),
            ack: None,
            cancel: None,
            cancel_of: None,
            canceled: false,
            timer_c_fired: false,
            parent: None,
            forks: Vec::new(),
            destroyed: false,
            internal: false,
        };
        let id = OutgoingId(self.outgoing.insert(orq));
        self.out_table.insert(hash, id);
        self.queues
            .get_mut(QueueKind::OutResolving)
            .push(TxRef::Outgoing(id), now, epoch);
        self.stats.client_tr += 1;
        id
    }

    // Resolution

    pub(crate) fn outgoing_resolve(&mut self, id: OutgoingId) {
        loop {
            let now = self.now();
            let Some(orq) = self.outgoing.get_mut(id.0) else {
                return;
            };
            let Some(resolution) = orq.resolution.as_mut() else {
                self.outgoing_exhausted(id, Error::ResolutionFailure("no resolver".into()));
                return;
            };
            match resolution.next_action(&self.dns_cache, now) {
                Action::Query { domain, rtype } => {
                    let query = self.submit_query(id, domain, rtype);
                    if let Some(orq) = self.outgoing.get_mut(id.0) {
                        orq.query = Some(query);
                    }
                    self.ensure_resolving(id);
                    return;
                }
                Action::Wait => {
                    self.ensure_resolving(id);
                    return;
                }
                Action::Target(target) => {
                    if !self.transport.supports(target.destination.kind) {
                        trace!(id = %id, destination = %target.destination, "transport not available");
                        continue;
                    }
                    debug!(id = %id, destination = %target.destination, host = %target.host, "target resolved");
                    orq.destination = Some(target.destination);
                    orq.target = Some(target);
                    self.send_outgoing(id);
                    return;
                }
                Action::Exhausted => {
                    let host = resolution.host().to_string();
                    self.outgoing_exhausted(id, Error::ResolutionFailure(host));
                    return;
                }
            }
        }
    }

    fn ensure_resolving(&mut self, id: OutgoingId) {
        let resolving = self
            .outgoing
            .get(id.0)
            .is_some_and(|orq| orq.queue == QueueKind::OutResolving);
        if !resolving {
            self.set_outgoing_queue(id, QueueKind::OutResolving);
        }
    }

    pub(crate) fn outgoing_dns_answer(&mut self, id: OutgoingId, answer: siptx_sip_resolver::DnsAnswer) {
        let now = self.now();
        let Some(orq) = self.outgoing.get_mut(id.0) else {
            return;
        };
        orq.query = None;
        if orq.lifecycle != Lifecycle::Active {
            return;
        }
        let Some(resolution) = orq.resolution.as_mut() else {
            return;
        };
        let used = resolution.on_answer(
            &answer.domain,
            answer.rtype,
            &answer.result,
            &mut self.dns_cache,
            now,
        );
        if !used {
            trace!(id = %id, domain = %answer.domain, "answer not expected");
            return;
        }
        self.outgoing_resolve(id);
    }

    /// No destination left: a local 503
    fn outgoing_exhausted(&mut self, id: OutgoingId, error: Error) {
        warn!(id = %id, error = %error, "no more destinations");
        self.outgoing_local_reply(id, error.status_code(), error.reason());
        self.outgoing_terminate(id);
    }

    /// Move on to the next DNS target with a fresh branch
    fn outgoing_try_next(&mut self, id: OutgoingId, error: Error) -> bool {
        let Some(orq) = self.outgoing.get_mut(id.0) else {
            return false;
        };
        let more = orq
            .resolution
            .as_ref()
            .is_some_and(Resolution::has_more);
        if !more {
            self.outgoing_exhausted(id, error);
            return false;
        }
        let branch = generate_branch();
        debug!(id = %id, error = %error, "trying next destination");
        if let Some(via) = orq.request.headers.top_via_mut() {
            via.params.set("branch", Some(&branch));
        }
        orq.branch = branch;
        orq.destination = None;
        orq.target = None;
        orq.redirected = false;
        orq.udp_fallback = false;
        orq.send_retried = false;
        orq.interval = self.config.t1;
        self.cancel_retry(TxRef::Outgoing(id));
        self.outgoing_resolve(id);
        true
    }

    fn graylist_target(&mut self, id: OutgoingId) {
        if self.config.graylist == 0 {
            return;
        }
        let now = self.now();
        let ttl = Duration::from_secs(u64::from(self.config.graylist));
        let bump = self.config.graylist_priority_bump;
        let Some(srv) = self
            .outgoing
            .get(id.0)
            .and_then(|orq| orq.target.as_ref())
            .and_then(|t| t.srv.clone())
        else {
            return;
        };
        if self
            .dns_cache
            .graylist(&srv.owner, &srv.target, srv.port, bump, ttl, now)
        {
            debug!(id = %id, owner = %srv.owner, target = %srv.target, port = srv.port, "target graylisted");
        }
    }

    // Sending

    fn stamp_via(&self, via: &mut Via, destination: &Destination) -> std::result::Result<(), SendError> {
        let local = self
            .transport
            .local_addr(destination.kind)
            .ok_or_else(|| SendError::NoTransport(destination.kind.to_string()))?;
        via.transport = destination.kind.via_name().to_string();
        via.host = local.ip().to_string();
        via.port = Some(local.port());
        if self.config.client_rport && !destination.is_reliable() {
            if via.rport().is_none() {
                via.params.set("rport", None);
            }
        } else {
            via.params.remove("rport");
        }
        Ok(())
    }

    /// First transmission to the current destination, walking the fallback ladder
    pub(crate) fn send_outgoing(&mut self, id: OutgoingId) {
        let udp_mtu = self.config.udp_mtu;
        let tcp = self.transport.supports(TransportKind::Tcp);
        let Some(orq) = self.outgoing.get(id.0) else {
            return;
        };
        let Some(mut destination) = orq.destination else {
            return;
        };
        let oversized = destination.kind == TransportKind::Udp
            && !orq.redirected
            && !orq.udp_fallback
            && tcp
            && Message::Request(orq.request.clone()).wire_len() > udp_mtu;
        if oversized {
            debug!(id = %id, "request exceeds the UDP MTU, using TCP");
            destination = destination.with_kind(TransportKind::Tcp);
        }

        let mut via = orq.request.headers.top_via().cloned();
        let stamped = match via.as_mut() {
            Some(via) => self.stamp_via(via, &destination),
            None => Err(SendError::Fatal("request lost its Via".into())),
        };
        let Some(orq) = self.outgoing.get_mut(id.0) else {
            return;
        };
        if oversized {
            orq.redirected = true;
            orq.destination = Some(destination);
        }
        if let (Ok(()), Some(via), Some(top)) = (&stamped, via, orq.request.headers.top_via_mut()) {
            *top = via;
        }
        let message = Message::Request(orq.request.clone());
        let result = stamped.and_then(|()| self.transmit(&message, &destination));

        let Some(orq) = self.outgoing.get_mut(id.0) else {
            return;
        };
        match result {
            Ok(status) => {
                orq.pending = match status {
                    SendStatus::Pending(pending) => Some(pending),
                    SendStatus::Sent => None,
                };
                self.outgoing_sent(id);
            }
            Err(SendError::MessageTooLarge)
                if !destination.is_reliable() && !orq.redirected && tcp =>
            {
                debug!(id = %id, "EMSGSIZE, retrying over TCP");
                orq.redirected = true;
                orq.destination = Some(destination.with_kind(TransportKind::Tcp));
                self.send_outgoing(id);
            }
            Err(SendError::ConnectionRefused)
                if orq.redirected && !orq.udp_fallback && destination.kind == TransportKind::Tcp =>
            {
                debug!(id = %id, "connection refused, falling back to UDP");
                orq.udp_fallback = true;
                orq.destination = Some(destination.with_kind(TransportKind::Udp));
                self.send_outgoing(id);
            }
            Err(e) if e.is_transient() && !orq.send_retried => {
                debug!(id = %id, error = %e, "transient send failure, retrying once");
                orq.send_retried = true;
                self.send_outgoing(id);
            }
            Err(e) => {
                warn!(id = %id, %destination, error = %e, "send failed");
                self.graylist_target(id);
                self.outgoing_try_next(id, Error::TransportFailure(e));
            }
        }
    }

    fn outgoing_sent(&mut self, id: OutgoingId) {
        let t1 = self.config.t1;
        let Some(orq) = self.outgoing.get_mut(id.0) else {
            return;
        };
        let reliable = orq.destination.is_some_and(|d| d.is_reliable());
        orq.interval = t1;
        let next = match orq.method {
            Method::Ack => None,
            Method::Invite => Some(QueueKind::OutInvCalling),
            _ => Some(QueueKind::OutTrying),
        };
        match next {
            None => self.outgoing_terminate(id),
            Some(kind) => {
                self.set_outgoing_queue(id, kind);
                if !reliable {
                    self.schedule_retry(TxRef::Outgoing(id), t1);
                }
            }
        }
    }

    /// Resend the request as it was last sent
    fn retransmit_outgoing(&mut self, id: OutgoingId) {
        let Some(orq) = self.outgoing.get(id.0) else {
            return;
        };
        let Some(destination) = orq.destination else {
            return;
        };
        let message = Message::Request(orq.request.clone());
        self.stats.retry_request += 1;
        if let Err(e) = self.transmit(&message, &destination) {
            debug!(id = %id, error = %e, "retransmission failed");
        }
    }

    /// A retransmission timer fired (A or E)
    pub(crate) fn outgoing_retry(&mut self, id: OutgoingId) {
        let t2 = self.config.t2;
        let Some(orq) = self.outgoing.get_mut(id.0) else {
            return;
        };
        let active = matches!(orq.queue, QueueKind::OutTrying | QueueKind::OutInvCalling);
        if !active || orq.destination.map_or(true, |d| d.is_reliable()) {
            return;
        }
        orq.interval = if orq.method == Method::Invite {
            orq.interval * 2
        } else if orq.status >= 100 {
            t2
        } else {
            (orq.interval * 2).min(t2)
        };
        let interval = orq.interval;
        trace!(id = %id, ?interval, "request retransmitted");
        self.retransmit_outgoing(id);
        self.schedule_retry(TxRef::Outgoing(id), interval);
    }

    /// A queue deadline passed
    pub(crate) fn outgoing_timeout(&mut self, id: OutgoingId, kind: QueueKind) {
        let Some(orq) = self.outgoing.get_mut(id.0) else {
            return;
        };
        match kind {
            QueueKind::OutResolving => {
                warn!(id = %id, "DNS resolution timed out");
                if let Some(query) = orq.query.take() {
                    self.queries.remove(&query.id);
                    self.dns.cancel(&query);
                }
                self.outgoing_exhausted(id, Error::ResolutionFailure("timeout".into()));
            }
            // B and F
            QueueKind::OutTrying | QueueKind::OutInvCalling => {
                self.stats.tout_request += 1;
                let retry_next = orq.status < 100
                    && orq.resolution.as_ref().is_some_and(Resolution::has_more);
                let answered = orq.status >= 100;
                debug!(id = %id, status = orq.status, "no final response");
                // A target that sent a provisional is alive
                if !answered {
                    self.graylist_target(id);
                }
                if retry_next {
                    self.outgoing_try_next(id, Error::Timeout(id.to_string()));
                } else {
                    self.outgoing_timed_out(id);
                }
            }
            QueueKind::OutInvProceeding => {
                if !orq.timer_c_fired {
                    orq.timer_c_fired = true;
                    debug!(id = %id, "timer C, canceling");
                    if let Err(e) = self.cancel(id) {
                        debug!(id = %id, error = %e, "cancel failed");
                    }
                    self.set_outgoing_queue(id, QueueKind::OutInvProceeding);
                } else {
                    self.stats.tout_request += 1;
                    self.outgoing_timed_out(id);
                }
            }
            QueueKind::OutCompleted | QueueKind::OutInvCompleted | QueueKind::OutInvAccepted => {
                self.outgoing_terminate(id)
            }
            _ => {}
        }
    }

    /// Local 408 to the transaction and its pending forks
    fn outgoing_timed_out(&mut self, id: OutgoingId) {
        let forks = self
            .outgoing
            .get(id.0)
            .map(|orq| orq.forks.clone())
            .unwrap_or_default();
        // Still possibly answered by the CANCEL before the timeout is seen
        if self.config.timeout_408 {
            for fork in forks.iter().copied() {
                self.outgoing_local_reply(fork, 408, "Request Timeout");
            }
            self.outgoing_local_reply(id, 408, "Request Timeout");
        }
        for fork in forks {
            self.outgoing_terminate(fork);
        }
        self.outgoing_terminate(id);
    }

    /// Deliver a response the agent made up. No-op after a final response.
    pub(crate) fn outgoing_local_reply(&mut self, id: OutgoingId, status: u16, reason: &str) {
        let Some(orq) = self.outgoing.get_mut(id.0) else {
            return;
        };
        if orq.status >= 200 || orq.lifecycle != Lifecycle::Active {
            return;
        }
        let mut response = Response::new(status).with_reason(reason);
        let headers = &orq.request.headers;
        response.headers.via = headers.via.first().cloned().into_iter().collect();
        response.headers.from = headers.from.clone();
        response.headers.to = headers.to.clone();
        response.headers.call_id = headers.call_id.clone();
        response.headers.cseq = headers.cseq.clone();
        orq.status = status;
        orq.response = Some(response.clone());
        debug!(id = %id, status, reason, "local response");
        self.emit_outgoing(
            id,
            AgentEvent::Response {
                id,
                response,
                local: true,
            },
        );
    }

    pub(crate) fn outgoing_terminate(&mut self, id: OutgoingId) {
        self.cancel_retry(TxRef::Outgoing(id));
        let Some(orq) = self.outgoing.get_mut(id.0) else {
            return;
        };
        if orq.queue == QueueKind::OutTerminated {
            return;
        }
        // Early forks go with their INVITE
        let forks = std::mem::take(&mut orq.forks);
        for fork in forks {
            let early = self.outgoing.get(fork.0).is_some_and(|f| f.status < 200);
            if early {
                self.outgoing_terminate(fork);
            }
        }
        let Some(orq) = self.outgoing.get_mut(id.0) else {
            return;
        };
        if let Some(query) = orq.query.take() {
            self.queries.remove(&query.id);
            self.dns.cancel(&query);
        }
        if let Some(pending) = orq.pending.take() {
            self.transport.release_pending(pending);
        }
        self.set_outgoing_queue(id, QueueKind::OutTerminated);
    }

    fn emit_outgoing(&mut self, id: OutgoingId, event: AgentEvent) {
        let visible = self
            .outgoing
            .get(id.0)
            .is_some_and(|orq| !orq.destroyed && !orq.internal);
        if visible {
            self.emit(event);
        }
    }

    // Responses

    pub(crate) fn find_outgoing(&self, response: &Response) -> Option<OutgoingId> {
        let call_id = response.call_id()?;
        let cseq = response.cseq()?;
        let branch = response.top_via()?.branch()?;
        let to_tag = response.headers.to_tag();
        let mut primary = None;
        for id in self.out_table.candidates(transaction_hash(call_id, cseq.seq)) {
            let Some(orq) = self.outgoing.get(id.0) else {
                continue;
            };
            let same = orq.lifecycle == Lifecycle::Active
                && orq.cseq == cseq.seq
                && orq.method == cseq.method
                && orq.call_id == call_id
                && orq.branch == branch;
            if !same {
                continue;
            }
            match orq.to_tag.as_deref() {
                Some(tag) if Some(tag) == to_tag => return Some(id),
                Some(_) => {}
                None => primary = Some(id),
            }
        }
        primary
    }

    pub(crate) fn outgoing_recv(&mut self, id: OutgoingId, response: Response, source: Destination) {
        let status = response.status;
        let Some(orq) = self.outgoing.get_mut(id.0) else {
            return;
        };
        trace!(id = %id, status, method = %orq.method, "response for client transaction");

        // RFC 3262 ordering
        if orq.method == Method::Invite
            && (101..200).contains(&status)
            && response.headers.requires(OPTION_100REL)
        {
            if let Some(rseq) = response.headers.rseq {
                let tag = response.headers.to_tag().unwrap_or_default().to_string();
                if let Some(last) = orq.rseqs.get(&tag).copied() {
                    if rseq != last.wrapping_add(1) {
                        debug!(id = %id, rseq, last, "reliable provisional out of order");
                        self.stats.drop_response += 1;
                        return;
                    }
                }
                orq.rseqs.insert(tag, rseq);
            }
        }

        if status < 200 {
            self.outgoing_provisional(id, response);
        } else if status < 300 {
            self.outgoing_success(id, response, source);
        } else {
            self.outgoing_failure(id, response);
        }
    }

    fn outgoing_provisional(&mut self, id: OutgoingId, response: Response) {
        let pass_100 = self.config.pass_100;
        let status = response.status;
        let Some(orq) = self.outgoing.get_mut(id.0) else {
            return;
        };
        if orq.status >= 200 {
            trace!(id = %id, status, "late provisional");
            return;
        }
        orq.status = orq.status.max(status);
        orq.response = Some(response.clone());
        if orq.method == Method::Invite {
            let calling = orq.queue == QueueKind::OutInvCalling;
            let restart = calling || (status > 100 && orq.queue == QueueKind::OutInvProceeding);
            self.cancel_retry(TxRef::Outgoing(id));
            if restart {
                self.set_outgoing_queue(id, QueueKind::OutInvProceeding);
            }
            self.release_delayed_cancel(id);
        }
        if status == 100 && !pass_100 {
            return;
        }
        self.emit_outgoing(
            id,
            AgentEvent::Response {
                id,
                response,
                local: false,
            },
        );
    }

    fn outgoing_success(&mut self, id: OutgoingId, response: Response, source: Destination) {
        let Some(orq) = self.outgoing.get_mut(id.0) else {
            return;
        };
        let is_invite = orq.method == Method::Invite;
        let tag = response.headers.to_tag().unwrap_or_default().to_string();
        if orq.status >= 200 {
            if !is_invite || orq.status >= 300 {
                trace!(id = %id, status = response.status, "late 2xx absorbed");
            } else if orq.accepted.contains(&tag) {
                trace!(id = %id, tag = %tag, "2xx retransmission absorbed");
            } else if self.config.ua {
                self.orphan_2xx(&response, source, Some(id));
            } else {
                // Proxies forward the first 2xx of every fork
                orq.accepted.insert(tag);
                self.emit_outgoing(
                    id,
                    AgentEvent::Response {
                        id,
                        response,
                        local: false,
                    },
                );
            }
            return;
        }
        orq.accepted.insert(tag);
        orq.status = response.status;
        orq.response = Some(response.clone());
        let reliable = orq.destination.is_some_and(|d| d.is_reliable());
        self.cancel_retry(TxRef::Outgoing(id));
        if is_invite {
            self.set_outgoing_queue(id, QueueKind::OutInvAccepted);
            self.drop_delayed_cancel(id);
        } else if reliable {
            self.outgoing_terminate(id);
        } else {
            self.set_outgoing_queue(id, QueueKind::OutCompleted);
        }
        self.emit_outgoing(
            id,
            AgentEvent::Response {
                id,
                response,
                local: false,
            },
        );
    }

    fn outgoing_failure(&mut self, id: OutgoingId, response: Response) {
        let status = response.status;
        let srv_503 = self.config.srv_503;
        let pass_408 = self.config.pass_408;
        let Some(orq) = self.outgoing.get_mut(id.0) else {
            return;
        };
        let is_invite = orq.method == Method::Invite;

        if is_invite {
            let Some(destination) = orq.destination else {
                return;
            };
            // Every non-2xx final is ACKed, retransmissions included
            let ack = match &orq.ack {
                Some(ack) => ack.clone(),
                None => {
                    let ack = build_ack(&orq.request, &response);
                    orq.ack = Some(ack.clone());
                    ack
                }
            };
            if let Err(e) = self.transmit(&Message::Request(ack), &destination) {
                debug!(id = %id, status, error = %e, "ACK not sent");
            }
        }

        let Some(orq) = self.outgoing.get_mut(id.0) else {
            return;
        };
        if orq.status >= 200 {
            trace!(id = %id, status, "retransmitted final absorbed");
            return;
        }

        let more = orq.resolution.as_ref().is_some_and(Resolution::has_more);
        if status == 503 && srv_503 && more && orq.status < 100 {
            debug!(id = %id, "503 with more destinations");
            orq.ack = None;
            self.graylist_target(id);
            self.outgoing_try_next(id, Error::TransportFailure(SendError::Fatal("503".into())));
            return;
        }
        if status == 408 && !is_invite && !pass_408 {
            trace!(id = %id, "408 dropped, the local timeout reports it");
            return;
        }

        orq.status = status;
        orq.response = Some(response.clone());
        let reliable = orq.destination.is_some_and(|d| d.is_reliable());
        self.cancel_retry(TxRef::Outgoing(id));
        if reliable {
            self.outgoing_terminate(id);
        } else if is_invite {
            self.set_outgoing_queue(id, QueueKind::OutInvCompleted);
        } else {
            self.set_outgoing_queue(id, QueueKind::OutCompleted);
        }
        if is_invite {
            self.drop_delayed_cancel(id);
        }
        self.emit_outgoing(
            id,
            AgentEvent::Response {
                id,
                response,
                local: false,
            },
        );
    }

    /// ACK and BYE a 2xx nobody is waiting for
    pub(crate) fn orphan_2xx(
        &mut self,
        response: &Response,
        source: Destination,
        orq: Option<OutgoingId>,
    ) {
        let Some(cseq) = response.cseq() else {
            return;
        };
        let template = match orq.and_then(|id| self.outgoing.get(id.0)) {
            Some(orq) => orq.request.clone(),
            None => {
                let mut request = Request::new(Method::Invite, Uri::sip(source.addr.ip().to_string()));
                request.headers.from = response.headers.from.clone();
                request.headers.call_id = response.headers.call_id.clone();
                request
            }
        };
        debug!(call_id = ?response.call_id(), to_tag = ?response.headers.to_tag(), "orphan 2xx");
        let ack = dialog_request(Method::Ack, &template, response, cseq.seq);
        let bye = dialog_request(Method::Bye, &template, response, cseq.seq.wrapping_add(1));
        for request in [ack, bye] {
            match self.request(RequestSpec::new(request).to(source)) {
                Ok(id) => {
                    if let Some(orq) = self.outgoing.get_mut(id.0) {
                        orq.internal = true;
                    }
                }
                Err(e) => warn!(error = %e, "orphan 2xx could not be answered"),
            }
        }
    }

    // CANCEL

    /// Cancel a pending INVITE. Returns the CANCEL transaction.
    pub fn cancel(&mut self, id: OutgoingId) -> Result<OutgoingId> {
        let cancel_2543 = self.config.cancel_2543;
        let orq = self.outgoing.get(id.0).ok_or_else(|| Error::not_found(id))?;
        if orq.method != Method::Invite {
            return Err(Error::InvalidCancel(format!("{} is not an INVITE", id)));
        }
        if orq.status >= 200 || orq.lifecycle != Lifecycle::Active {
            return Err(Error::InvalidCancel(format!("{} is completed", id)));
        }
        if orq.canceled {
            return Err(Error::InvalidCancel(format!("{} was already canceled", id)));
        }
        let request = build_cancel(&orq.request);
        let branch = orq.branch.clone();
        let destination = orq.destination;
        let leg = orq.leg;
        let provisional = orq.status >= 100;
        let resolving = orq.queue == QueueKind::OutResolving;

        let cancel = self.create_outgoing(request, branch, leg, None);
        if let Some(orq) = self.outgoing.get_mut(id.0) {
            orq.canceled = true;
            orq.cancel = Some(cancel);
        }
        if let Some(corq) = self.outgoing.get_mut(cancel.0) {
            corq.cancel_of = Some(id);
            corq.destination = destination;
        }
        debug!(id = %id, cancel = %cancel, provisional, "canceling");

        if resolving || destination.is_none() {
            // Nothing was sent yet
            self.outgoing_local_reply(cancel, 200, "OK");
            self.outgoing_terminate(cancel);
            self.outgoing_local_reply(id, 487, "Request Terminated");
            self.outgoing_terminate(id);
        } else if provisional || cancel_2543 {
            self.send_outgoing(cancel);
            if cancel_2543 {
                self.outgoing_local_reply(id, 487, "Request Terminated");
                self.set_outgoing_queue(id, QueueKind::OutInvCompleted);
            }
        } else {
            self.set_outgoing_queue(cancel, QueueKind::OutDelayed);
        }
        Ok(cancel)
    }

    /// The INVITE made progress; a delayed CANCEL can go
    fn release_delayed_cancel(&mut self, id: OutgoingId) {
        let Some(cancel) = self.outgoing.get(id.0).and_then(|orq| orq.cancel) else {
            return;
        };
        let delayed = self
            .outgoing
            .get(cancel.0)
            .is_some_and(|c| c.queue == QueueKind::OutDelayed);
        if delayed {
            debug!(id = %id, cancel = %cancel, "sending delayed CANCEL");
            self.send_outgoing(cancel);
        }
    }

    /// The INVITE completed before the delayed CANCEL went out
    fn drop_delayed_cancel(&mut self, id: OutgoingId) {
        let Some(cancel) = self.outgoing.get(id.0).and_then(|orq| orq.cancel) else {
            return;
        };
        let delayed = self
            .outgoing
            .get(cancel.0)
            .is_some_and(|c| c.queue == QueueKind::OutDelayed);
        if delayed {
            self.outgoing_local_reply(cancel, 481, "Call/Transaction Does Not Exist");
            self.outgoing_terminate(cancel);
        }
    }

    // Forks and PRACK

    /// Track responses carrying `tag` on their own transaction
    pub fn tagged(&mut self, id: OutgoingId, tag: &str) -> Result<OutgoingId> {
        let orq = self.outgoing.get(id.0).ok_or_else(|| Error::not_found(id))?;
        if orq.method != Method::Invite {
            return Err(Error::InvalidState(format!("{} is not an INVITE", id)));
        }
        if orq.to_tag.is_some() || orq.parent.is_some() {
            return Err(Error::InvalidState(format!("{} is already tagged", id)));
        }
        let existing = orq.forks.iter().copied().find(|fork| {
            self.outgoing
                .get(fork.0)
                .is_some_and(|f| f.to_tag.as_deref() == Some(tag))
        });
        if let Some(fork) = existing {
            return Ok(fork);
        }
        let request = orq.request.clone();
        let branch = orq.branch.clone();
        let leg = orq.leg;
        let destination = orq.destination;
        let target = orq.target.clone();
        let queue = match orq.queue {
            QueueKind::OutInvCalling | QueueKind::OutInvProceeding => QueueKind::OutInvProceeding,
            other => other,
        };
        let rseq = orq.rseqs.get(tag).copied();

        let fork = self.create_outgoing(request, branch, leg, Some(tag.to_string()));
        if let Some(f) = self.outgoing.get_mut(fork.0) {
            f.parent = Some(id);
            f.destination = destination;
            f.target = target;
            f.status = 100;
            if let Some(rseq) = rseq {
                f.rseqs.insert(tag.to_string(), rseq);
            }
        }
        if let Some(orq) = self.outgoing.get_mut(id.0) {
            orq.forks.push(fork);
        }
        self.set_outgoing_queue(fork, queue);
        debug!(id = %id, fork = %fork, tag, "tagged fork");
        Ok(fork)
    }

    /// PRACK the last reliable provisional response of an INVITE
    pub fn prack(&mut self, id: OutgoingId, body: Option<(String, Bytes)>) -> Result<OutgoingId> {
        let orq = self.outgoing.get_mut(id.0).ok_or_else(|| Error::not_found(id))?;
        let response = orq
            .response
            .clone()
            .filter(|r| r.is_provisional() && r.headers.rseq.is_some())
            .ok_or_else(|| {
                Error::InvalidState(format!("{} has no reliable provisional response", id))
            })?;
        let rseq = response.headers.rseq.unwrap_or_default();
        let seq = orq.prack_cseq;
        orq.prack_cseq = orq.prack_cseq.wrapping_add(1);
        let mut prack = dialog_request(Method::Prack, &orq.request, &response, seq);
        prack.headers.rack = Some(RAck {
            rseq,
            cseq: orq.cseq,
            method: Method::Invite,
        });
        if let Some((content_type, body)) = body {
            prack.headers.content_type = Some(content_type);
            prack.body = body;
        }
        let destination = orq.destination;
        let mut spec = RequestSpec::new(prack);
        spec.destination = destination;
        self.request(spec)
    }

    // Application access

    /// Release a client transaction. A pending INVITE is canceled.
    pub fn destroy_outgoing(&mut self, id: OutgoingId) -> Result<()> {
        let orq = self.outgoing.get(id.0).ok_or_else(|| Error::not_found(id))?;
        let pending_invite = orq.method == Method::Invite
            && orq.status < 200
            && !orq.canceled
            && orq.lifecycle == Lifecycle::Active;
        if let Some(orq) = self.outgoing.get_mut(id.0) {
            orq.destroyed = true;
        }
        if pending_invite {
            if let Err(e) = self.cancel(id) {
                debug!(id = %id, error = %e, "cancel failed");
            }
        }
        debug!(id = %id, "client transaction released");
        Ok(())
    }

    pub fn outgoing_state(&self, id: OutgoingId) -> Result<ClientState> {
        self.outgoing
            .get(id.0)
            .map(|orq| ClientState::from_queue(orq.queue, orq.status))
            .ok_or_else(|| Error::not_found(id))
    }

    /// Latest status received, 0 before any response
    pub fn outgoing_status(&self, id: OutgoingId) -> Result<u16> {
        self.outgoing
            .get(id.0)
            .map(|orq| orq.status)
            .ok_or_else(|| Error::not_found(id))
    }

    /// The request as last sent
    pub fn outgoing_request(&self, id: OutgoingId) -> Result<&Request> {
        self.outgoing
            .get(id.0)
            .map(|orq| &orq.request)
            .ok_or_else(|| Error::not_found(id))
    }

    pub fn outgoing_destination(&self, id: OutgoingId) -> Result<Option<Destination>> {
        self.outgoing
            .get(id.0)
            .map(|orq| orq.destination)
            .ok_or_else(|| Error::not_found(id))
    }
}
