//! # Server transactions
//!
//! One [`Incoming`] per received request. The queue a transaction sits in
//! is its state:
//!
//! ```text
//!            ┌──────────── 1xx ────────────┐
//!  InTrying ─┤                             v
//!   (N1)     ├── reliable 1xx ──> InPreliminary (P1/P2) ──PRACK──> InProceeding
//!            │                                                          │
//!            └──────────────── final ───────────────────────────────────┤
//!                                                                       v
//!   non-INVITE: InCompleted (J) ─────────────────────────────> InTerminated
//!   INVITE:     InInvCompleted (G/H) ── ACK ──> InInvConfirmed (I) ──> InTerminated
//! ```
//!
//! A final response that cannot be sent parks the transaction in
//! `InFinalFailed`; it is tried once more when that queue expires.
//!
//! Retransmitted requests are absorbed here and answered with the last
//! response. CANCEL and PRACK get their own internal transactions so their
//! retransmissions are absorbed the same way; the application only sees
//! the effect on the INVITE.

use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, trace, warn};

use siptx_sip_core::{
    generate_tag, Method, NameAddr, RAck, Request, Response, ResponseBuilder, OPTION_100REL,
};
use siptx_sip_transport::{CompartmentId, Destination, SendError, SendStatus};

use crate::agent::{Agent, Lifecycle};
use crate::error::{Error, Result};
use crate::events::AgentEvent;
use crate::hash::transaction_hash;
use crate::queue::{IncomingId, LegId, QueueKind, RetryKey, TxRef};
use crate::reliable::{PrackOutcome, ReliableQueue};

/// State of a server transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerState {
    /// Nothing sent yet
    Trying,
    /// A provisional response was sent
    Proceeding,
    /// A reliable provisional response waits for its PRACK
    Preliminary,
    /// The final response was sent
    Completed,
    /// ACK received for an INVITE final response
    Confirmed,
    Terminated,
}

impl ServerState {
    pub(crate) fn from_queue(kind: QueueKind) -> Self {
        match kind {
            QueueKind::InTrying => ServerState::Trying,
            QueueKind::InProceeding => ServerState::Proceeding,
            QueueKind::InPreliminary => ServerState::Preliminary,
            QueueKind::InCompleted | QueueKind::InInvCompleted | QueueKind::InFinalFailed => {
                ServerState::Completed
            }
            QueueKind::InInvConfirmed => ServerState::Confirmed,
            _ => ServerState::Terminated,
        }
    }
}

/// A response the application sends on a server transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseSpec {
    pub status: u16,
    /// Standard phrase when `None`
    pub reason: Option<String>,
    pub contact: Option<NameAddr>,
    pub require: Vec<String>,
    /// Extension headers
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl ResponseSpec {
    pub fn new(status: u16) -> Self {
        ResponseSpec {
            status,
            ..ResponseSpec::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_contact(mut self, contact: NameAddr) -> Self {
        self.contact = Some(contact);
        self
    }

    pub fn with_require(mut self, option: &str) -> Self {
        self.require.push(option.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.content_type = Some(content_type.to_string());
        self.body = body.into();
        self
    }
}

#[derive(Debug)]
pub(crate) struct Incoming {
    pub method: Method,
    pub request: Request,
    pub source: Destination,
    pub reply_to: Destination,
    pub hash: u32,
    pub call_id: String,
    pub cseq: u32,
    /// RFC 3261 branch; `None` for RFC 2543 clients
    pub branch: Option<String>,
    pub sent_by: String,
    pub from_tag: Option<String>,
    /// To tag of our responses
    pub local_tag: Option<String>,
    pub leg: Option<LegId>,

    pub status: u16,
    /// Last response sent
    pub response: Option<Response>,
    pub queue: QueueKind,
    pub epoch: u64,
    pub lifecycle: Lifecycle,
    pub retry: Option<RetryKey>,
    pub interval: Duration,
    pub retries: u32,
    pub reliable: Option<ReliableQueue>,
    pub compartment: Option<CompartmentId>,
    pub received_at: Instant,

    pub canceled: bool,
    /// Released by the application; no more events
    pub destroyed: bool,
    /// CANCEL and PRACK transactions answered by the agent itself
    pub internal: bool,
}

/// How a request is compared against existing server transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InMatch {
    /// Retransmission of the same request
    Same,
    /// The transaction a CANCEL refers to
    CancelTarget,
    /// The INVITE a non-2xx ACK belongs to
    AckInvite,
    /// Same request arriving over a different path
    Merged,
}

impl Agent {
    // Dispatch

    pub(crate) fn incoming_new(&mut self, request: Request, source: Destination) {
        if let Some(id) = self.find_incoming(&request, InMatch::Same) {
            self.incoming_retransmission(id);
            return;
        }
        if request.method == Method::Prack {
            self.incoming_prack(request, source);
            return;
        }

        if self.config.ua
            && self.config.merge_482
            && request.headers.to_tag().is_none()
            && self.find_incoming(&request, InMatch::Merged).is_some()
        {
            self.stats.merged_request += 1;
            debug!(call_id = ?request.call_id(), "merged request");
            self.reply_stateless(&request, &source, 482, None);
            return;
        }

        if self.proceeding >= self.config.max_proceeding {
            warn!(proceeding = self.proceeding, "too many pending server transactions");
            self.reply_stateless(&request, &source, 503, None);
            return;
        }

        let matched = self.legs.match_request(&request);
        let leg = matched.or(self.legs.default_leg());
        if leg.is_none() && self.config.ua && request.headers.to_tag().is_some() {
            debug!(call_id = ?request.call_id(), "request for an unknown dialog");
            self.reply_stateless(&request, &source, 481, None);
            return;
        }

        let id = self.create_incoming(request.clone(), source, leg, false);
        self.emit(AgentEvent::IncomingRequest {
            id,
            request,
            source,
            leg,
        });
    }

    pub(crate) fn create_incoming(
        &mut self,
        request: Request,
        source: Destination,
        leg: Option<LegId>,
        internal: bool,
    ) -> IncomingId {
        let call_id = request.call_id().unwrap_or_default().to_string();
        let cseq = request.cseq().map_or(0, |c| c.seq);
        let hash = transaction_hash(&call_id, cseq);
        let (branch, sent_by, wants_compression) = match request.top_via() {
            Some(via) => (
                via.has_rfc3261_branch()
                    .then(|| via.branch().map(str::to_string))
                    .flatten(),
                via.sent_by(),
                via.comp() == Some("sigcomp"),
            ),
            None => (None, String::new(), false),
        };
        let leg_tag = leg
            .and_then(|l| self.legs.get(l))
            .filter(|l| l.call_id.is_some())
            .and_then(|l| l.local_tag.clone());
        let local_tag = request
            .headers
            .to_tag()
            .map(str::to_string)
            .or(leg_tag);
        let compartment = if wants_compression {
            self.compressor.compartment(&source)
        } else {
            None
        };

        self.stats.server_tr += 1;
        if request.headers.to_tag().is_some() {
            self.stats.dialog_tr += 1;
        }

        let method = request.method.clone();
        let from_tag = request.headers.from_tag().map(str::to_string);
        let epoch = self.next_epoch();
        let now = self.now();
        let irq = Incoming {
            method: method.clone(),
            reply_to: Agent::reply_destination(&request, &source),
            request,
            source,
            hash,
            call_id,
            cseq,
            branch,
            sent_by,
            from_tag,
            local_tag,
            leg,
            status: 0,
            response: None,
            queue: QueueKind::InTrying,
            epoch,
            lifecycle: Lifecycle::Active,
            retry: None,
            interval: self.config.t1,
            retries: 0,
            reliable: None,
            compartment,
            received_at: now,
            canceled: false,
            destroyed: false,
            internal,
        };
        let id = IncomingId(self.incoming.insert(irq));
        self.in_table.insert(hash, id);
        self.proceeding += 1;
        self.queues
            .get_mut(QueueKind::InTrying)
            .push(TxRef::Incoming(id), now, epoch);
        debug!(id = %id, %method, internal, "server transaction created");
        id
    }

    pub(crate) fn find_incoming(&self, request: &Request, mode: InMatch) -> Option<IncomingId> {
        let call_id = request.call_id()?;
        let cseq = request.cseq()?;
        let via = request.top_via()?;
        let branch = via.has_rfc3261_branch().then(|| via.branch()).flatten();
        let sent_by = via.sent_by();
        let from_tag = request.headers.from_tag();
        let to_tag = request.headers.to_tag();

        self.in_table
            .find(transaction_hash(call_id, cseq.seq), |id| {
                let Some(irq) = self.incoming.get(id.0) else {
                    return false;
                };
                if irq.lifecycle != Lifecycle::Active
                    || irq.cseq != cseq.seq
                    || irq.call_id != call_id
                {
                    return false;
                }
                let method_ok = match mode {
                    InMatch::Same | InMatch::Merged => irq.method == request.method,
                    InMatch::CancelTarget => !matches!(irq.method, Method::Cancel | Method::Ack),
                    InMatch::AckInvite => irq.method == Method::Invite,
                };
                if !method_ok {
                    return false;
                }
                if mode == InMatch::Merged {
                    return irq.from_tag.as_deref() == from_tag
                        && irq.request.headers.to_tag().is_none()
                        && (irq.branch.as_deref() != branch || irq.sent_by != sent_by);
                }
                match branch {
                    Some(branch) => {
                        irq.branch.as_deref() == Some(branch) && irq.sent_by == sent_by
                    }
                    // RFC 2543 matching
                    None => {
                        let to_ok = to_tag == irq.request.headers.to_tag()
                            || (mode == InMatch::AckInvite
                                && to_tag.is_some()
                                && to_tag == irq.local_tag.as_deref());
                        irq.branch.is_none()
                            && irq.sent_by == sent_by
                            && irq.from_tag.as_deref() == from_tag
                            && to_ok
                            && (mode == InMatch::AckInvite || irq.request.uri.matches(&request.uri))
                    }
                }
            })
    }

    /// INVITE transaction that sent the 2xx an ACK acknowledges
    fn find_accepted_invite(&self, request: &Request) -> Option<IncomingId> {
        let call_id = request.call_id()?;
        let cseq = request.cseq()?;
        let to_tag = request.headers.to_tag()?;
        let from_tag = request.headers.from_tag();
        self.in_table.find(transaction_hash(call_id, cseq.seq), |id| {
            self.incoming.get(id.0).is_some_and(|irq| {
                irq.lifecycle == Lifecycle::Active
                    && irq.method == Method::Invite
                    && irq.cseq == cseq.seq
                    && irq.call_id == call_id
                    && (200..300).contains(&irq.status)
                    && irq.from_tag.as_deref() == from_tag
                    && irq.local_tag.as_deref() == Some(to_tag)
            })
        })
    }

    fn incoming_retransmission(&mut self, id: IncomingId) {
        self.stats.recv_retry += 1;
        let now = self.now();
        let extra_100 = self.config.extra_100;
        let delay = self.config.extra_100_delay();
        let Some(irq) = self.incoming.get(id.0) else {
            return;
        };
        trace!(id = %id, status = irq.status, "request retransmission");
        match (&irq.response, irq.queue) {
            (Some(_), QueueKind::InFinalFailed) => {}
            (Some(response), _) => {
                let response = response.clone();
                self.stats.retry_response += 1;
                if let Err(e) = self.send_incoming(id, &response) {
                    debug!(id = %id, error = %e, "response not sent");
                }
            }
            (None, _) => {
                let late = now.saturating_duration_since(irq.received_at) >= delay;
                if irq.method == Method::Invite || (extra_100 && late) {
                    if let Err(e) = self.reply(id, 100, None) {
                        trace!(id = %id, error = %e, "automatic reply failed");
                    }
                }
            }
        }
    }

    pub(crate) fn incoming_ack(&mut self, request: Request, source: Destination) {
        let invite = self.find_incoming(&request, InMatch::AckInvite).filter(|id| {
            self.incoming
                .get(id.0)
                .is_some_and(|irq| irq.status >= 300 || irq.status < 200)
        });
        if let Some(id) = invite {
            let in_completed = self
                .incoming
                .get(id.0)
                .is_some_and(|irq| irq.queue == QueueKind::InInvCompleted);
            if in_completed {
                self.stats.acked_tr += 1;
                self.incoming_confirmed(id);
            } else {
                trace!(id = %id, "ACK absorbed");
            }
            return;
        }

        if let Some(id) = self.find_accepted_invite(&request) {
            let waiting = self
                .incoming
                .get(id.0)
                .is_some_and(|irq| irq.queue == QueueKind::InInvCompleted);
            if waiting {
                self.stats.acked_tr += 1;
                debug!(id = %id, "2xx acknowledged");
                self.emit_incoming(id, AgentEvent::Ack { id, request });
                self.incoming_confirmed(id);
            } else {
                trace!(id = %id, "ACK absorbed");
            }
            return;
        }

        self.stats.trless_request += 1;
        let leg = self.legs.match_request(&request).or(self.legs.default_leg());
        debug!(call_id = ?request.call_id(), "ACK without transaction");
        self.emit(AgentEvent::TransactionlessRequest {
            request,
            source,
            leg,
        });
    }

    fn incoming_confirmed(&mut self, id: IncomingId) {
        self.cancel_retry(TxRef::Incoming(id));
        let reliable = self
            .incoming
            .get(id.0)
            .is_some_and(|irq| irq.reply_to.is_reliable());
        if reliable {
            self.incoming_terminate(id);
        } else {
            self.set_incoming_queue(id, QueueKind::InInvConfirmed);
        }
    }

    pub(crate) fn incoming_cancel(&mut self, request: Request, source: Destination) {
        if let Some(id) = self.find_incoming(&request, InMatch::Same) {
            self.incoming_retransmission(id);
            return;
        }
        let target = self.find_incoming(&request, InMatch::CancelTarget);
        let cancel = self.create_incoming(request.clone(), source, None, true);
        let Some(target) = target else {
            debug!("CANCEL for an unknown transaction");
            if let Err(e) = self.reply(cancel, 481, None) {
                debug!(id = %cancel, error = %e, "automatic reply failed");
            }
            return;
        };
        let Some(irq) = self.incoming.get_mut(target.0) else {
            if let Err(e) = self.reply(cancel, 481, None) {
                debug!(id = %cancel, error = %e, "automatic reply failed");
            }
            return;
        };
        if (200..300).contains(&irq.status) {
            debug!(id = %target, "CANCEL after 2xx");
            if let Err(e) = self.reply(cancel, 481, None) {
                debug!(id = %cancel, error = %e, "automatic reply failed");
            }
        } else if irq.status >= 300 {
            if let Err(e) = self.reply(cancel, 200, None) {
                debug!(id = %cancel, error = %e, "automatic reply failed");
            }
        } else {
            irq.canceled = true;
            let is_invite = irq.method == Method::Invite;
            self.stats.canceled_tr += 1;
            if let Err(e) = self.reply(cancel, 200, None) {
                debug!(id = %cancel, error = %e, "automatic reply failed");
            }
            debug!(id = %target, "transaction canceled");
            self.emit_incoming(
                target,
                AgentEvent::Canceled {
                    id: target,
                    request,
                },
            );
            if is_invite && self.config.cancel_487 {
                if let Err(e) = self.reply(target, 487, None) {
                    debug!(id = %target, error = %e, "automatic reply failed");
                }
            }
        }
    }

    fn find_prack_target(&self, request: &Request, rack: &RAck) -> Option<IncomingId> {
        let call_id = request.call_id()?;
        let from_tag = request.headers.from_tag();
        let to_tag = request.headers.to_tag();
        self.in_table.find(transaction_hash(call_id, rack.cseq), |id| {
            self.incoming.get(id.0).is_some_and(|irq| {
                irq.lifecycle == Lifecycle::Active
                    && irq.method == Method::Invite
                    && irq.cseq == rack.cseq
                    && irq.call_id == call_id
                    && irq.from_tag.as_deref() == from_tag
                    && (to_tag.is_none() || irq.local_tag.as_deref() == to_tag)
            })
        })
    }

    fn incoming_prack(&mut self, request: Request, source: Destination) {
        let rack = request.headers.rack.clone();
        let target = rack
            .as_ref()
            .and_then(|rack| self.find_prack_target(&request, rack));
        let prack = self.create_incoming(request.clone(), source, None, true);
        let (Some(rack), Some(invite)) = (rack, target) else {
            debug!("PRACK without a matching INVITE");
            if let Err(e) = self.reply(prack, 481, None) {
                debug!(id = %prack, error = %e, "automatic reply failed");
            }
            return;
        };
        let outcome = match self.incoming.get_mut(invite.0) {
            Some(irq) => {
                let cseq = irq.cseq;
                irq.reliable
                    .as_mut()
                    .map_or(PrackOutcome::NoMatch, |q| q.prack(&rack, cseq))
            }
            None => PrackOutcome::NoMatch,
        };
        let PrackOutcome::Acked {
            rseq,
            next,
            released,
        } = outcome
        else {
            debug!(id = %invite, rack = %rack, "PRACK does not match the reliable response");
            if let Err(e) = self.reply(prack, 481, None) {
                debug!(id = %prack, error = %e, "automatic reply failed");
            }
            return;
        };

        if let Err(e) = self.reply(prack, 200, None) {
            debug!(id = %prack, error = %e, "automatic reply failed");
        }
        debug!(id = %invite, rseq, "reliable response acknowledged");
        self.emit_incoming(
            invite,
            AgentEvent::Prack {
                id: invite,
                rseq,
                request,
            },
        );
        self.cancel_retry(TxRef::Incoming(invite));

        if let Some(next) = next {
            if let Err(e) = self.start_reliable(invite, next) {
                debug!(id = %invite, error = %e, "queued reliable response not sent");
            }
        } else if let Some(final_response) = released {
            debug!(id = %invite, status = final_response.status, "deferred final released");
            self.send_final(invite, final_response);
        } else {
            self.set_incoming_queue(invite, QueueKind::InProceeding);
        }
    }

    // Responding

    /// Send a response with the standard reason phrase or `reason`
    pub fn reply(&mut self, id: IncomingId, status: u16, reason: Option<&str>) -> Result<()> {
        let spec = ResponseSpec {
            reason: reason.map(str::to_string),
            ..ResponseSpec::new(status)
        };
        self.respond(id, spec, false)
    }

    /// Send a response with headers and body
    pub fn reply_with(&mut self, id: IncomingId, spec: ResponseSpec) -> Result<()> {
        self.respond(id, spec, false)
    }

    /// Send a provisional response reliably (RFC 3262)
    pub fn reliable_reply(&mut self, id: IncomingId, spec: ResponseSpec) -> Result<()> {
        if !(101..200).contains(&spec.status) {
            return Err(Error::InvalidState(format!(
                "status {} cannot be sent reliably",
                spec.status
            )));
        }
        let supported = self
            .incoming
            .get(id.0)
            .ok_or_else(|| Error::not_found(id))?
            .request
            .headers
            .supports(OPTION_100REL);
        if !supported {
            return Err(Error::InvalidState(format!("{} did not offer 100rel", id)));
        }
        self.respond(id, spec, true)
    }

    fn respond(&mut self, id: IncomingId, mut spec: ResponseSpec, force_reliable: bool) -> Result<()> {
        let rel100 = self.config.rel100;
        let irq = self.incoming.get(id.0).ok_or_else(|| Error::not_found(id))?;
        if irq.lifecycle != Lifecycle::Active {
            return Err(Error::InvalidState(format!("{} is terminated", id)));
        }
        if irq.method == Method::Ack {
            return Err(Error::InvalidState("ACK is never answered".into()));
        }
        let deferred = irq
            .reliable
            .as_ref()
            .is_some_and(ReliableQueue::has_deferred_final);
        if irq.status >= 200 || deferred {
            return Err(Error::InvalidState(format!(
                "{} already answered with a final response",
                id
            )));
        }
        if !(100..=699).contains(&spec.status) {
            let error = Error::ApplicationError(spec.status);
            warn!(id = %id, error = %error, "status replaced with 500");
            spec = ResponseSpec::new(500);
        }

        let status = spec.status;
        let headers = &irq.request.headers;
        let reliable = (101..200).contains(&status)
            && irq.method == Method::Invite
            && (force_reliable
                || headers.requires(OPTION_100REL)
                || (rel100 && headers.supports(OPTION_100REL)));

        let response = self.build_response(id, &spec)?;
        if reliable {
            let seed = self.rng.gen_range(1..0x8000_0000u32);
            let Some(irq) = self.incoming.get_mut(id.0) else {
                return Err(Error::not_found(id));
            };
            let queue = irq.reliable.get_or_insert_with(|| ReliableQueue::new(seed));
            let (rseq, now) = queue.enqueue(response);
            irq.status = status;
            trace!(id = %id, rseq, status, "reliable provisional");
            if let Some(response) = now {
                return self.start_reliable(id, response);
            }
            return Ok(());
        }
        if status < 200 {
            return self.send_provisional(id, response);
        }
        self.send_final(id, response);
        Ok(())
    }

    fn build_response(&mut self, id: IncomingId, spec: &ResponseSpec) -> Result<Response> {
        let tag_3261 = self.config.tag_3261;
        let irq = self
            .incoming
            .get_mut(id.0)
            .ok_or_else(|| Error::not_found(id))?;
        let mut builder = ResponseBuilder::from_request(&irq.request, spec.status);
        if let Some(reason) = &spec.reason {
            builder = builder.reason(reason.clone());
        }
        let needs_tag = spec.status > 100
            && irq.request.headers.to_tag().is_none()
            && (tag_3261 || irq.method.creates_dialog());
        if needs_tag {
            let tag = irq.local_tag.get_or_insert_with(generate_tag).clone();
            builder = builder.to_tag(&tag);
        }
        if (101..300).contains(&spec.status)
            && irq.method.creates_dialog()
            && !irq.request.headers.record_route.is_empty()
        {
            builder = builder.record_route(irq.request.headers.record_route.clone());
        }
        if let Some(contact) = &spec.contact {
            builder = builder.contact(contact.clone());
        }
        for option in &spec.require {
            builder = builder.require(option);
        }
        for (name, value) in &spec.headers {
            builder = builder.header(name, value.clone());
        }
        if let Some(content_type) = &spec.content_type {
            builder = builder.body(content_type, spec.body.clone());
        }
        Ok(builder.build())
    }

    fn send_incoming(
        &mut self,
        id: IncomingId,
        response: &Response,
    ) -> std::result::Result<SendStatus, SendError> {
        let Some(irq) = self.incoming.get_mut(id.0) else {
            return Err(SendError::NoTransport(id.to_string()));
        };
        irq.response = Some(response.clone());
        let destination = irq.reply_to;
        self.transmit(&siptx_sip_core::Message::Response(response.clone()), &destination)
    }

    fn send_provisional(&mut self, id: IncomingId, response: Response) -> Result<()> {
        let status = response.status;
        let result = self.send_incoming(id, &response);
        let Some(irq) = self.incoming.get_mut(id.0) else {
            return Err(Error::not_found(id));
        };
        irq.status = irq.status.max(status);
        let progress = irq.method == Method::Invite && status > 100;
        let trying = irq.queue == QueueKind::InTrying;
        if trying {
            self.set_incoming_queue(id, QueueKind::InProceeding);
        }
        if progress {
            let interval = self.config.progress;
            self.schedule_retry(TxRef::Incoming(id), interval);
        }
        result.map(|_| ()).map_err(Error::TransportFailure)
    }

    /// Send the reliable provisional at the head of the queue
    fn start_reliable(&mut self, id: IncomingId, response: Response) -> Result<()> {
        let t1 = self.config.t1;
        let result = self.send_incoming(id, &response);
        let Some(irq) = self.incoming.get_mut(id.0) else {
            return Err(Error::not_found(id));
        };
        irq.interval = t1;
        irq.retries = 0;
        let unreliable = !irq.reply_to.is_reliable();
        self.set_incoming_queue(id, QueueKind::InPreliminary);
        if unreliable {
            self.schedule_retry(TxRef::Incoming(id), t1);
        } else {
            self.cancel_retry(TxRef::Incoming(id));
        }
        result.map(|_| ()).map_err(Error::TransportFailure)
    }

    fn send_final(&mut self, id: IncomingId, response: Response) {
        let Some(irq) = self.incoming.get_mut(id.0) else {
            return;
        };
        if let Some(queue) = irq.reliable.as_mut() {
            if !queue.is_empty() {
                if queue.must_defer(&response) {
                    debug!(id = %id, status = response.status, "final deferred until PRACK");
                    queue.defer_final(response);
                    return;
                }
                queue.clear();
            }
        }
        irq.status = response.status;
        self.cancel_retry(TxRef::Incoming(id));
        match self.send_incoming(id, &response) {
            Ok(_) => self.incoming_completed(id),
            Err(e) => {
                warn!(id = %id, status = response.status, error = %e, "final response not sent");
                self.set_incoming_queue(id, QueueKind::InFinalFailed);
            }
        }
    }

    fn incoming_completed(&mut self, id: IncomingId) {
        let ua = self.config.ua;
        let t1 = self.config.t1;
        let Some(irq) = self.incoming.get_mut(id.0) else {
            return;
        };
        let reliable = irq.reply_to.is_reliable();
        if irq.method != Method::Invite {
            if reliable {
                self.incoming_terminate(id);
            } else {
                self.set_incoming_queue(id, QueueKind::InCompleted);
            }
            return;
        }
        if (200..300).contains(&irq.status) && !ua {
            // A proxy hands 2xx retransmission to the UAS
            self.incoming_terminate(id);
            return;
        }
        irq.interval = t1;
        self.set_incoming_queue(id, QueueKind::InInvCompleted);
        if !reliable {
            self.schedule_retry(TxRef::Incoming(id), t1);
        }
    }

    pub(crate) fn incoming_terminate(&mut self, id: IncomingId) {
        self.cancel_retry(TxRef::Incoming(id));
        if let Some(irq) = self.incoming.get_mut(id.0) {
            if irq.queue == QueueKind::InTerminated {
                return;
            }
            if let Some(queue) = irq.reliable.as_mut() {
                queue.clear();
            }
        }
        self.set_incoming_queue(id, QueueKind::InTerminated);
    }

    fn emit_incoming(&mut self, id: IncomingId, event: AgentEvent) {
        let visible = self
            .incoming
            .get(id.0)
            .is_some_and(|irq| !irq.destroyed && !irq.internal);
        if visible {
            self.emit(event);
        }
    }

    // Timers

    /// A queue deadline passed
    pub(crate) fn incoming_timeout(&mut self, id: IncomingId, kind: QueueKind) {
        let Some(irq) = self.incoming.get(id.0) else {
            return;
        };
        match kind {
            QueueKind::InTrying => {
                let send_100 = irq.status < 100
                    && !irq.internal
                    && (irq.method == Method::Invite || self.config.extra_100);
                if send_100 {
                    trace!(id = %id, "automatic 100 Trying");
                    if let Err(e) = self.reply(id, 100, None) {
                        trace!(id = %id, error = %e, "automatic reply failed");
                    }
                }
                if self.incoming.get(id.0).is_some_and(|i| i.queue == QueueKind::InTrying) {
                    self.set_incoming_queue(id, QueueKind::InProceeding);
                }
            }
            QueueKind::InPreliminary => {
                warn!(id = %id, "reliable provisional was never acknowledged");
                self.stats.tout_response += 1;
                if let Some(queue) = self.incoming.get_mut(id.0).and_then(|i| i.reliable.as_mut()) {
                    queue.clear();
                }
                let spec = ResponseSpec::new(504).with_reason("Reliable Response Timeout");
                if let Ok(response) = self.build_response(id, &spec) {
                    self.send_final(id, response);
                }
                self.emit_incoming(id, AgentEvent::IncomingFailed { id, status: 504 });
            }
            QueueKind::InInvCompleted => {
                debug!(id = %id, status = irq.status, "no ACK received");
                self.stats.tout_response += 1;
                self.emit_incoming(id, AgentEvent::IncomingFailed { id, status: 408 });
                self.incoming_terminate(id);
            }
            QueueKind::InCompleted | QueueKind::InInvConfirmed => self.incoming_terminate(id),
            QueueKind::InFinalFailed => {
                let Some(response) = irq.response.clone() else {
                    self.incoming_terminate(id);
                    return;
                };
                self.stats.retry_response += 1;
                match self.send_incoming(id, &response) {
                    Ok(_) => self.incoming_completed(id),
                    Err(e) => {
                        warn!(id = %id, error = %e, "final response failed twice");
                        self.emit_incoming(id, AgentEvent::IncomingFailed { id, status: 500 });
                        self.incoming_terminate(id);
                    }
                }
            }
            _ => {}
        }
    }

    /// A retransmission timer fired
    pub(crate) fn incoming_retry(&mut self, id: IncomingId) {
        let t2 = self.config.t2;
        let progress = self.config.progress;
        let max_retries = self.config.reliable_max_retries;
        let Some(irq) = self.incoming.get_mut(id.0) else {
            return;
        };
        match irq.queue {
            // G
            QueueKind::InInvCompleted if !irq.reply_to.is_reliable() => {
                let Some(response) = irq.response.clone() else {
                    return;
                };
                irq.interval = (irq.interval * 2).min(t2);
                let interval = irq.interval;
                self.stats.retry_response += 1;
                trace!(id = %id, ?interval, "final retransmitted");
                if let Err(e) = self.send_incoming(id, &response) {
                    debug!(id = %id, error = %e, "response not sent");
                }
                self.schedule_retry(TxRef::Incoming(id), interval);
            }
            // P1
            QueueKind::InPreliminary => {
                let Some(response) = irq
                    .reliable
                    .as_ref()
                    .and_then(ReliableQueue::in_flight)
                    .map(|r| r.response.clone())
                else {
                    return;
                };
                irq.interval *= 2;
                irq.retries += 1;
                let interval = irq.interval;
                let again = max_retries.map_or(true, |max| irq.retries < max);
                self.stats.retry_response += 1;
                trace!(id = %id, ?interval, "reliable provisional retransmitted");
                if let Err(e) = self.send_incoming(id, &response) {
                    debug!(id = %id, error = %e, "response not sent");
                }
                if again {
                    self.schedule_retry(TxRef::Incoming(id), interval);
                }
            }
            QueueKind::InTrying | QueueKind::InProceeding if irq.method == Method::Invite => {
                let Some(response) = irq.response.clone().filter(|r| r.status > 100) else {
                    return;
                };
                self.stats.retry_response += 1;
                trace!(id = %id, status = response.status, "progress retransmission");
                if let Err(e) = self.send_incoming(id, &response) {
                    debug!(id = %id, error = %e, "response not sent");
                }
                self.schedule_retry(TxRef::Incoming(id), progress);
            }
            _ => {}
        }
    }

    // Application access

    /// Release a server transaction. An unanswered request gets a 500 first.
    pub fn destroy_incoming(&mut self, id: IncomingId) -> Result<()> {
        let irq = self.incoming.get(id.0).ok_or_else(|| Error::not_found(id))?;
        if irq.destroyed {
            return Ok(());
        }
        let unanswered = irq.lifecycle == Lifecycle::Active
            && irq.status < 200
            && irq.method != Method::Ack
            && !irq.reliable.as_ref().is_some_and(ReliableQueue::has_deferred_final);
        if unanswered {
            if let Err(e) = self.reply(id, 500, None) {
                debug!(id = %id, error = %e, "automatic reply failed");
            }
        }
        let pending = match self.incoming.get_mut(id.0) {
            Some(irq) => {
                irq.destroyed = true;
                matches!(irq.queue, QueueKind::InTrying | QueueKind::InProceeding)
            }
            None => false,
        };
        if pending {
            self.incoming_terminate(id);
        }
        debug!(id = %id, "server transaction released");
        Ok(())
    }

    pub fn incoming_state(&self, id: IncomingId) -> Result<ServerState> {
        self.incoming
            .get(id.0)
            .map(|irq| ServerState::from_queue(irq.queue))
            .ok_or_else(|| Error::not_found(id))
    }

    /// Highest status sent so far, 0 before any response
    pub fn incoming_status(&self, id: IncomingId) -> Result<u16> {
        self.incoming
            .get(id.0)
            .map(|irq| irq.status)
            .ok_or_else(|| Error::not_found(id))
    }

    pub fn incoming_request(&self, id: IncomingId) -> Result<&Request> {
        self.incoming
            .get(id.0)
            .map(|irq| &irq.request)
            .ok_or_else(|| Error::not_found(id))
    }

    /// Set or generate the To tag used in our responses
    pub fn incoming_tag(&mut self, id: IncomingId, tag: Option<&str>) -> Result<String> {
        let irq = self
            .incoming
            .get_mut(id.0)
            .ok_or_else(|| Error::not_found(id))?;
        match (&irq.local_tag, tag) {
            (Some(existing), Some(wanted)) if existing != wanted => Err(Error::InvalidState(
                format!("{} already tagged {}", id, existing),
            )),
            (Some(existing), _) => Ok(existing.clone()),
            (None, wanted) => {
                let tag = wanted.map(str::to_string).unwrap_or_else(generate_tag);
                irq.local_tag = Some(tag.clone());
                Ok(tag)
            }
        }
    }
}
