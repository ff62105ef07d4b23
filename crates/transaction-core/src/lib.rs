//! # siptx-transaction-core
//!
//! SIP transaction engine (RFC 3261 section 17) with reliable provisional
//! responses (RFC 3262), server location failover (RFC 3263) and symmetric
//! response routing (RFC 3581).
//!
//! The [`Agent`] owns every server ("incoming") and client ("outgoing")
//! transaction plus the dialog legs used to route in-dialog requests. It
//! is a single-owner state machine with no interior locking:
//!
//! - messages from the transport enter through [`Agent::receive`]
//! - the application acts through handles ([`IncomingId`], [`OutgoingId`],
//!   [`LegId`]) and receives [`AgentEvent`]s
//! - time advances only in [`Agent::tick`], which fires retransmissions,
//!   expires timer queues and frees terminated transactions
//!
//! [`AgentRunner`] drives an agent on a tokio task and hands out a
//! cloneable [`AgentHandle`].
//!
//! ```rust
//! use siptx_transaction_core::prelude::*;
//! use siptx_transaction_core::testing::{ManualClock, MockDns, MockTransport};
//!
//! let transport = MockTransport::new();
//! let mut agent = Agent::new(
//!     AgentConfig::default(),
//!     transport.clone(),
//!     MockDns::new(),
//!     ManualClock::new(),
//! )
//! .unwrap();
//!
//! let request = RequestBuilder::new(Method::Options, "sip:bob@192.0.2.2")
//!     .unwrap()
//!     .from("sip:alice@192.0.2.1", Some("1928301774"))
//!     .unwrap()
//!     .to("sip:bob@192.0.2.2", None)
//!     .unwrap()
//!     .cseq(1)
//!     .build()
//!     .unwrap();
//! let destination = Destination::udp("192.0.2.2:5060".parse().unwrap());
//! let id = agent.request(RequestSpec::new(request).to(destination)).unwrap();
//! assert_eq!(agent.outgoing_state(id).unwrap(), ClientState::Trying);
//! assert_eq!(transport.sent().len(), 1);
//! ```

pub mod agent;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod hash;
pub mod incoming;
pub mod leg;
pub mod logging;
pub mod outgoing;
mod queue;
mod reliable;
pub mod runner;
pub mod stats;
pub mod testing;
mod timer;

pub use agent::Agent;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AgentConfig, ServerRport};
pub use error::{Error, Result};
pub use events::AgentEvent;
pub use incoming::{ResponseSpec, ServerState};
pub use leg::LegSpec;
pub use logging::{setup_logging, LoggingConfig};
pub use outgoing::{ClientState, RequestSpec};
pub use queue::{IncomingId, LegId, OutgoingId};
pub use runner::{AgentHandle, AgentRunner};
pub use stats::AgentStats;

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        Agent, AgentConfig, AgentEvent, AgentHandle, AgentRunner, ClientState, Error,
        IncomingId, LegId, LegSpec, OutgoingId, RequestSpec, ResponseSpec, Result,
        ServerState, SystemClock,
    };
    pub use siptx_sip_core::prelude::*;
    pub use siptx_sip_transport::{Destination, TransportEvent, TransportKind};
}
