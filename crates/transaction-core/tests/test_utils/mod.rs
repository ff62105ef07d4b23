//! Shared fixtures for the transaction engine tests
//!
//! `TestEnv` wires an `Agent` to the mock transport, mock DNS and a manual
//! clock, and offers helpers to build peer messages and let time pass.
#![allow(dead_code)]

use std::time::Duration;

use siptx_sip_core::{
    generate_branch, Message, Method, NameAddr, RequestBuilder, Request, Response,
    ResponseBuilder, Via,
};
use siptx_sip_transport::Destination;
use siptx_transaction_core::testing::{ManualClock, MockDns, MockTransport, Sent};
use siptx_transaction_core::{Agent, AgentConfig, AgentEvent, IncomingId, OutgoingId};

/// Address of the remote peer in every test
pub const PEER: &str = "192.0.2.2:5060";

/// Scheduler granularity used by `run_for`
pub const STEP: Duration = Duration::from_millis(50);

pub struct TestEnv {
    pub agent: Agent,
    pub transport: MockTransport,
    pub dns: MockDns,
    pub clock: ManualClock,
}

impl TestEnv {
    pub fn new(config: AgentConfig) -> Self {
        let transport = MockTransport::new();
        let dns = MockDns::new();
        let clock = ManualClock::new();
        let agent = Agent::new(
            config.with_seed(7),
            transport.clone(),
            dns.clone(),
            clock.clone(),
        )
        .expect("valid config");
        TestEnv {
            agent,
            transport,
            dns,
            clock,
        }
    }

    /// Proxy defaults
    pub fn proxy() -> Self {
        Self::new(AgentConfig::default())
    }

    pub fn user_agent() -> Self {
        Self::new(AgentConfig::default().with_user_agent(true))
    }

    /// Advance the clock in small steps, running the scheduler after each
    pub fn run_for(&mut self, total: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            let step = STEP.min(total - elapsed);
            self.clock.advance(step);
            self.agent.tick();
            elapsed += step;
        }
    }

    pub fn events(&mut self) -> Vec<AgentEvent> {
        self.agent.drain_events()
    }

    pub fn deliver(&mut self, message: impl Into<Message>) {
        self.agent.receive(message.into(), peer());
    }

    /// Deliver a request from the peer and return the server transaction
    /// the agent announced for it
    pub fn receive_new(&mut self, request: Request) -> IncomingId {
        self.deliver(request);
        self.events()
            .into_iter()
            .find_map(|event| match event {
                AgentEvent::IncomingRequest { id, .. } => Some(id),
                _ => None,
            })
            .expect("incoming request event")
    }

    /// Responses the agent sent, oldest first
    pub fn sent_statuses(&self) -> Vec<u16> {
        self.transport
            .responses()
            .iter()
            .filter_map(|s| s.response().map(|r| r.status))
            .collect()
    }

    pub fn last_request(&self, method: &Method) -> Request {
        self.transport
            .requests(method)
            .last()
            .and_then(Sent::request)
            .cloned()
            .expect("request was sent")
    }

    /// Response events for a client transaction
    pub fn responses_for(events: &[AgentEvent], wanted: OutgoingId) -> Vec<(u16, bool)> {
        events
            .iter()
            .filter_map(|event| match event {
                AgentEvent::Response {
                    id,
                    response,
                    local,
                } if *id == wanted => Some((response.status, *local)),
                _ => None,
            })
            .collect()
    }
}

pub fn peer() -> Destination {
    Destination::udp(PEER.parse().expect("peer address"))
}

/// A request as the peer would send it, with its own Via
pub fn peer_request(method: Method, call_id: &str, cseq: u32, branch: &str) -> Request {
    RequestBuilder::new(method, "sip:alice@192.0.2.1")
        .expect("uri")
        .from("<sip:bob@biloxi.example.com>", Some("peer-tag"))
        .expect("from")
        .to("<sip:alice@atlanta.example.com>", None)
        .expect("to")
        .call_id(call_id)
        .cseq(cseq)
        .via(Via::new("UDP", "192.0.2.2", Some(5060)).with_branch(branch))
        .build()
        .expect("request")
}

/// ACK or CANCEL for a peer request, on the same transaction branch
pub fn peer_follow_up(request: &Request, method: Method, to_tag: Option<&str>) -> Request {
    let mut follow = request.clone();
    follow.method = method.clone();
    follow.headers.cseq = request.headers.cseq.as_ref().map(|c| {
        let mut c = c.clone();
        c.method = method;
        c
    });
    if let (Some(tag), Some(to)) = (to_tag, follow.headers.to.as_mut()) {
        to.set_tag(tag);
    }
    follow.body = Default::default();
    follow.headers.content_type = None;
    follow
}

/// A request the application sends
pub fn local_request(method: Method, uri: &str, call_id: &str, cseq: u32) -> Request {
    RequestBuilder::new(method, uri)
        .expect("uri")
        .from("<sip:alice@atlanta.example.com>", Some("local-tag"))
        .expect("from")
        .to("<sip:bob@biloxi.example.com>", None)
        .expect("to")
        .call_id(call_id)
        .cseq(cseq)
        .build()
        .expect("request")
}

/// Response from the peer to a request the agent sent
pub fn answer(request: &Request, status: u16, to_tag: Option<&str>) -> Response {
    let mut builder = ResponseBuilder::from_request(request, status);
    if let Some(tag) = to_tag {
        builder = builder.to_tag(tag);
    }
    builder.build()
}

pub fn new_branch() -> String {
    generate_branch()
}

pub fn name_addr(s: &str) -> NameAddr {
    s.parse().expect("name-addr")
}
