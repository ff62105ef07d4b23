//! UDP transport for SIP messages
//!
//! Binding spawns a receive loop that parses datagrams and reports them as
//! [`TransportEvent`]s. Sending uses the non-blocking `try_send_to`, so it can
//! be called from the engine task directly.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use siptx_sip_core::Message;

use crate::error::{Error, Result, SendError};
use crate::kind::{Destination, TransportKind};
use crate::transport::{SendStatus, Transport, TransportEvent};

// Default channel capacity
const DEFAULT_CHANNEL_CAPACITY: usize = 100;

const MAX_DATAGRAM: usize = 65_535;

/// UDP transport bound to one local address
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpTransportInner>,
}

struct UdpTransportInner {
    socket: UdpSocket,
    local_addr: SocketAddr,
    closed: AtomicBool,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl UdpTransport {
    /// Creates a new UDP transport bound to the specified address
    pub async fn bind(
        addr: SocketAddr,
        channel_capacity: Option<usize>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let capacity = channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(capacity);

        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("SIP UDP transport bound to {}", local_addr);

        let transport = UdpTransport {
            inner: Arc::new(UdpTransportInner {
                socket,
                local_addr,
                closed: AtomicBool::new(false),
                events_tx,
            }),
        };
        transport.spawn_receive_loop();

        Ok((transport, events_rx))
    }

    pub fn local_socket_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    fn spawn_receive_loop(&self) {
        let transport = self.clone();

        tokio::spawn(async move {
            let inner = &transport.inner;
            let mut buf = vec![0u8; MAX_DATAGRAM];

            while !inner.closed.load(Ordering::Relaxed) {
                match inner.socket.recv_from(&mut buf).await {
                    Ok((len, src)) => {
                        trace!("Received {} bytes from {}", len, src);
                        let event = match Message::parse(&buf[..len]) {
                            Ok(message) => TransportEvent::MessageReceived {
                                message,
                                source: Destination::udp(src),
                                local: inner.local_addr,
                            },
                            Err(e) => {
                                warn!("Error parsing SIP message from {}: {}", src, e);
                                TransportEvent::Error {
                                    error: format!("Error parsing SIP message: {}", e),
                                }
                            }
                        };
                        if let Err(e) = inner.events_tx.send(event).await {
                            error!("Error sending event: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        if inner.closed.load(Ordering::Relaxed) {
                            break;
                        }
                        error!("Error receiving UDP packet: {}", e);
                        let _ = inner
                            .events_tx
                            .send(TransportEvent::Error {
                                error: format!("Error receiving packet: {}", e),
                            })
                            .await;
                    }
                }
            }

            let _ = inner.events_tx.send(TransportEvent::Closed).await;
            info!("UDP receive loop terminated");
        });
    }
}

impl Transport for UdpTransport {
    fn send(
        &mut self,
        message: &Message,
        destination: &Destination,
    ) -> std::result::Result<SendStatus, SendError> {
        if destination.kind != TransportKind::Udp {
            return Err(SendError::NoTransport(destination.to_string()));
        }
        if self.is_closed() {
            return Err(SendError::Fatal(Error::TransportClosed.to_string()));
        }
        let bytes = message.to_bytes();
        debug!("Sending {} byte message to {}", bytes.len(), destination.addr);
        match self.inner.socket.try_send_to(&bytes, destination.addr) {
            Ok(_) => Ok(SendStatus::Sent),
            Err(e) => {
                let classified = SendError::from_io(&e);
                warn!("UDP send to {} failed: {}", destination.addr, e);
                Err(classified)
            }
        }
    }

    fn supports(&self, kind: TransportKind) -> bool {
        kind == TransportKind::Udp && !self.is_closed()
    }

    fn local_addr(&self, kind: TransportKind) -> Option<SocketAddr> {
        (kind == TransportKind::Udp).then_some(self.inner.local_addr)
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UdpTransport({})", self.inner.local_addr)
    }
}
