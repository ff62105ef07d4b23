//! Transport that forwards outbound messages over a tokio channel
//!
//! Useful when the actual socket work lives on other tasks: the engine
//! pushes `(Message, Destination)` pairs and a writer task drains them.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use siptx_sip_core::Message;

use crate::error::SendError;
use crate::kind::{Destination, TransportKind};
use crate::transport::{SendStatus, Transport};

/// An outbound message and where it goes
#[derive(Debug, Clone)]
pub struct Outbound {
    pub message: Message,
    pub destination: Destination,
}

/// Channel backed [`Transport`]
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Outbound>,
    local: HashMap<TransportKind, SocketAddr>,
    max_datagram: usize,
}

impl ChannelTransport {
    /// New transport with a bounded queue of `capacity` messages
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            ChannelTransport {
                tx,
                local: HashMap::new(),
                max_datagram: 65_507,
            },
            rx,
        )
    }

    /// Register a transport family bound at `addr`
    pub fn with_local(mut self, kind: TransportKind, addr: SocketAddr) -> Self {
        self.local.insert(kind, addr);
        self
    }

    /// Largest message accepted for unreliable families
    pub fn with_max_datagram(mut self, size: usize) -> Self {
        self.max_datagram = size;
        self
    }
}

impl Transport for ChannelTransport {
    fn send(
        &mut self,
        message: &Message,
        destination: &Destination,
    ) -> Result<SendStatus, SendError> {
        if !self.local.contains_key(&destination.kind) {
            return Err(SendError::NoTransport(destination.to_string()));
        }
        if !destination.is_reliable() && message.wire_len() > self.max_datagram {
            return Err(SendError::MessageTooLarge);
        }
        match self.tx.try_send(Outbound {
            message: message.clone(),
            destination: *destination,
        }) {
            Ok(()) => {
                debug!(%destination, "queued outbound message");
                Ok(SendStatus::Sent)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%destination, "outbound queue full");
                Err(SendError::ConnectionClosed)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(SendError::Fatal("outbound channel closed".into()))
            }
        }
    }

    fn supports(&self, kind: TransportKind) -> bool {
        self.local.contains_key(&kind)
    }

    fn local_addr(&self, kind: TransportKind) -> Option<SocketAddr> {
        self.local.get(&kind).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siptx_sip_core::{Method, Request};

    fn options() -> Message {
        Message::Request(Request::new(
            Method::Options,
            "sip:bob@example.com".parse().unwrap(),
        ))
    }

    #[test]
    fn test_queue_and_classify() {
        let local: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        let (mut transport, mut rx) = ChannelTransport::new(1);
        transport = transport
            .with_local(TransportKind::Udp, local)
            .with_max_datagram(4096);
        let dest = Destination::udp("192.0.2.1:5060".parse().unwrap());

        assert_eq!(transport.send(&options(), &dest), Ok(SendStatus::Sent));
        assert_eq!(
            transport.send(&options(), &dest),
            Err(SendError::ConnectionClosed)
        );
        assert_eq!(rx.try_recv().unwrap().destination, dest);

        let tcp = dest.with_kind(TransportKind::Tcp);
        assert!(matches!(
            transport.send(&options(), &tcp),
            Err(SendError::NoTransport(_))
        ));
    }

    #[test]
    fn test_oversized_datagram() {
        let (transport, _rx) = ChannelTransport::new(4);
        let mut transport = transport
            .with_local(TransportKind::Udp, "127.0.0.1:5060".parse().unwrap())
            .with_max_datagram(10);
        let dest = Destination::udp("192.0.2.1:5060".parse().unwrap());
        assert_eq!(
            transport.send(&options(), &dest),
            Err(SendError::MessageTooLarge)
        );
    }
}
