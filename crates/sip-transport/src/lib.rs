//! SIP transport layer for the siptx stack
//!
//! This crate defines what the transaction engine expects from a transport:
//! non-blocking sends with classified failures, local address discovery and
//! an inbound event stream. It ships a channel-backed transport and a UDP
//! transport, plus the optional compression capability.

pub mod compression;
pub mod error;
pub mod kind;
pub mod transport;

pub use compression::{CompartmentId, Compressor, NoCompression};
pub use error::{Error, Result, SendError};
pub use kind::{Destination, TransportKind};
pub use transport::channel::Outbound;
pub use transport::{
    ChannelTransport, PendingId, SendStatus, Transport, TransportEvent, UdpTransport,
};

/// Bind a UDP transport to the specified address
pub async fn bind_udp(
    addr: std::net::SocketAddr,
) -> Result<(UdpTransport, tokio::sync::mpsc::Receiver<TransportEvent>)> {
    UdpTransport::bind(addr, None).await
}

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        bind_udp, ChannelTransport, Compressor, Destination, Error, NoCompression, Result,
        SendError, SendStatus, Transport, TransportEvent, TransportKind, UdpTransport,
    };
}
