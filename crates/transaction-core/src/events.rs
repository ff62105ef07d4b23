//! Notifications from the agent to its user
//!
//! The agent never calls back into application code. Everything the
//! application has to react to is queued as an [`AgentEvent`] and collected
//! with [`Agent::drain_events`](crate::Agent::drain_events) or received
//! from the [`AgentRunner`](crate::runner::AgentRunner) channel.

use siptx_sip_core::{Request, Response};
use siptx_sip_transport::Destination;

use crate::queue::{IncomingId, LegId, OutgoingId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// A new server transaction was created
    IncomingRequest {
        id: IncomingId,
        request: Request,
        source: Destination,
        /// Matched dialog or destination leg
        leg: Option<LegId>,
    },

    /// A request that did not create a transaction: stateless mode, or an
    /// ACK for a 2xx that no longer has a server transaction
    TransactionlessRequest {
        request: Request,
        source: Destination,
        leg: Option<LegId>,
    },

    /// ACK for a 2xx sent by this INVITE transaction
    Ack { id: IncomingId, request: Request },

    /// The INVITE transaction was canceled by the client
    Canceled { id: IncomingId, request: Request },

    /// A reliable provisional response was acknowledged
    Prack {
        id: IncomingId,
        rseq: u32,
        request: Request,
    },

    /// The server transaction failed after its final response was decided:
    /// no ACK arrived (408), the reliable response was never PRACKed (504)
    /// or the final response could not be sent (500)
    IncomingFailed { id: IncomingId, status: u16 },

    /// A response for a client transaction. `local` marks responses the
    /// agent generated itself (timeouts, transport and DNS failures).
    Response {
        id: OutgoingId,
        response: Response,
        local: bool,
    },
}

impl AgentEvent {
    /// Status of a response event
    pub fn status(&self) -> Option<u16> {
        match self {
            AgentEvent::Response { response, .. } => Some(response.status),
            AgentEvent::IncomingFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}
