//! The transport contract seen by the transaction engine
//!
//! The engine owns all protocol state on one task, so sending is a plain
//! synchronous call that must not block. Implementations either write
//! immediately ([`SendStatus::Sent`]), accept the message for later
//! delivery ([`SendStatus::Pending`]), or classify the failure as a
//! [`SendError`] so the engine can walk its fallback ladder.

pub mod channel;
pub mod udp;

use std::net::SocketAddr;

use siptx_sip_core::Message;

use crate::error::SendError;
use crate::kind::{Destination, TransportKind};

pub use channel::ChannelTransport;
pub use udp::UdpTransport;

/// Handle for a send that was queued instead of written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingId(pub u64);

/// Successful send outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    Pending(PendingId),
}

/// Outbound half of a transport
pub trait Transport: Send {
    /// Hand a message to the wire. Must not block.
    fn send(
        &mut self,
        message: &Message,
        destination: &Destination,
    ) -> Result<SendStatus, SendError>;

    /// Drop bookkeeping for a pending send once its transaction is gone
    fn release_pending(&mut self, _id: PendingId) {}

    /// Whether the transport family is available at all
    fn supports(&self, kind: TransportKind) -> bool;

    /// Locally bound address for a transport family, used for Via and Contact
    fn local_addr(&self, kind: TransportKind) -> Option<SocketAddr>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(
        &mut self,
        message: &Message,
        destination: &Destination,
    ) -> Result<SendStatus, SendError> {
        (**self).send(message, destination)
    }

    fn release_pending(&mut self, id: PendingId) {
        (**self).release_pending(id)
    }

    fn supports(&self, kind: TransportKind) -> bool {
        (**self).supports(kind)
    }

    fn local_addr(&self, kind: TransportKind) -> Option<SocketAddr> {
        (**self).local_addr(kind)
    }
}

/// Inbound events delivered by a transport's receive loop
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A parsed message arrived
    MessageReceived {
        message: Message,
        source: Destination,
        local: SocketAddr,
    },
    /// Bytes arrived that did not parse, or the socket reported an error
    Error { error: String },
    /// The receive loop stopped
    Closed,
}
