//! Deterministic doubles for driving an [`Agent`](crate::Agent) in tests
//!
//! Both doubles are cheap handles over shared state: keep a clone, move the
//! other into the agent, and inspect or script it from the test.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use siptx_sip_core::{Message, Method, Request, Response};
use siptx_sip_resolver::{DnsBackend, DnsQuery};
use siptx_sip_transport::{Destination, PendingId, SendError, SendStatus, Transport, TransportKind};

pub use crate::clock::ManualClock;

/// A message handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub message: Message,
    pub destination: Destination,
}

impl Sent {
    pub fn request(&self) -> Option<&Request> {
        match &self.message {
            Message::Request(request) => Some(request),
            Message::Response(_) => None,
        }
    }

    pub fn response(&self) -> Option<&Response> {
        match &self.message {
            Message::Response(response) => Some(response),
            Message::Request(_) => None,
        }
    }
}

#[derive(Debug, Default)]
struct TransportState {
    sent: Vec<Sent>,
    /// Consumed one per send
    scripted: VecDeque<SendError>,
    /// Every send to this kind fails
    failing: HashMap<TransportKind, SendError>,
    local: HashMap<TransportKind, SocketAddr>,
    pending: bool,
    next_pending: u64,
    released: Vec<PendingId>,
}

/// Records sends and fails them on request
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

impl MockTransport {
    /// UDP and TCP on 192.0.2.1:5060
    pub fn new() -> Self {
        let addr: SocketAddr = ([192, 0, 2, 1], 5060).into();
        Self::with_kinds(&[TransportKind::Udp, TransportKind::Tcp], addr)
    }

    pub fn with_kinds(kinds: &[TransportKind], addr: SocketAddr) -> Self {
        let state = TransportState {
            local: kinds.iter().map(|k| (*k, addr)).collect(),
            ..Default::default()
        };
        MockTransport {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Fail the next send with `error`
    pub fn fail_next(&self, error: SendError) {
        self.state.lock().scripted.push_back(error);
    }

    /// Fail every send over `kind` until [`heal`](Self::heal)
    pub fn fail_kind(&self, kind: TransportKind, error: SendError) {
        self.state.lock().failing.insert(kind, error);
    }

    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.failing.clear();
        state.scripted.clear();
    }

    /// Report sends as queued instead of sent
    pub fn set_pending(&self, pending: bool) {
        self.state.lock().pending = pending;
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.state.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<Sent> {
        std::mem::take(&mut self.state.lock().sent)
    }

    pub fn requests(&self, method: &Method) -> Vec<Sent> {
        self.sent()
            .into_iter()
            .filter(|s| s.request().is_some_and(|r| &r.method == method))
            .collect()
    }

    pub fn responses(&self) -> Vec<Sent> {
        self.sent()
            .into_iter()
            .filter(|s| s.response().is_some())
            .collect()
    }

    pub fn last_response(&self) -> Option<Response> {
        self.state
            .lock()
            .sent
            .iter()
            .rev()
            .find_map(|s| s.response().cloned())
    }

    pub fn released(&self) -> Vec<PendingId> {
        self.state.lock().released.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn send(
        &mut self,
        message: &Message,
        destination: &Destination,
    ) -> Result<SendStatus, SendError> {
        let mut state = self.state.lock();
        if let Some(error) = state.scripted.pop_front() {
            return Err(error);
        }
        if let Some(error) = state.failing.get(&destination.kind) {
            return Err(error.clone());
        }
        state.sent.push(Sent {
            message: message.clone(),
            destination: *destination,
        });
        if state.pending {
            state.next_pending += 1;
            Ok(SendStatus::Pending(PendingId(state.next_pending)))
        } else {
            Ok(SendStatus::Sent)
        }
    }

    fn release_pending(&mut self, id: PendingId) {
        self.state.lock().released.push(id);
    }

    fn supports(&self, kind: TransportKind) -> bool {
        self.state.lock().local.contains_key(&kind)
    }

    fn local_addr(&self, kind: TransportKind) -> Option<SocketAddr> {
        self.state.lock().local.get(&kind).copied()
    }
}

#[derive(Debug, Default)]
struct DnsState {
    submitted: Vec<DnsQuery>,
    canceled: Vec<DnsQuery>,
}

/// Records queries; the test feeds answers back with
/// [`Agent::dns_answer`](crate::Agent::dns_answer)
#[derive(Debug, Clone, Default)]
pub struct MockDns {
    state: Arc<Mutex<DnsState>>,
}

impl MockDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<DnsQuery> {
        self.state.lock().submitted.clone()
    }

    /// Queries submitted since the last call
    pub fn take(&self) -> Vec<DnsQuery> {
        std::mem::take(&mut self.state.lock().submitted)
    }

    pub fn canceled(&self) -> Vec<DnsQuery> {
        self.state.lock().canceled.clone()
    }
}

impl DnsBackend for MockDns {
    fn submit(&mut self, query: DnsQuery) {
        self.state.lock().submitted.push(query);
    }

    fn cancel(&mut self, query: &DnsQuery) {
        self.state.lock().canceled.push(query.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_failures_come_first() {
        let handle = MockTransport::new();
        let mut transport = handle.clone();
        let dest = Destination::udp("192.0.2.9:5060".parse().unwrap());
        let message = Message::Response(Response::new(200));

        handle.fail_next(SendError::ConnectionRefused);
        assert_eq!(
            transport.send(&message, &dest),
            Err(SendError::ConnectionRefused)
        );
        assert_eq!(transport.send(&message, &dest), Ok(SendStatus::Sent));
        assert_eq!(handle.sent().len(), 1);
        assert!(!transport.supports(TransportKind::Tls));
    }
}
