//! Reliable provisional responses (RFC 3262)
//!
//! Each INVITE server transaction that negotiated 100rel owns a
//! [`ReliableQueue`]. Provisional responses get consecutive RSeq values and
//! are sent one at a time: the next one leaves only after the previous one
//! was PRACKed. A final response carrying a body is held back while an
//! unacknowledged provisional with a body is outstanding, and released by
//! the PRACK that empties the queue.

use std::collections::VecDeque;

use siptx_sip_core::{Method, RAck, Response, OPTION_100REL};
use tracing::trace;

#[derive(Debug, Clone)]
pub(crate) struct ReliableResponse {
    pub rseq: u32,
    pub response: Response,
    /// Carries session content; a final with a body must wait for its PRACK
    pub precious: bool,
}

/// What a PRACK did to the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PrackOutcome {
    /// RAck does not name the response in flight
    NoMatch,
    Acked {
        rseq: u32,
        /// Next reliable provisional to send
        next: Option<Response>,
        /// Final response that was waiting for the queue to drain
        released: Option<Response>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct ReliableQueue {
    next_rseq: u32,
    pending: VecDeque<ReliableResponse>,
    deferred_final: Option<Response>,
}

impl ReliableQueue {
    /// `seed` is the first RSeq, 1..2^31 per RFC 3262
    pub fn new(seed: u32) -> Self {
        ReliableQueue {
            next_rseq: seed.clamp(1, 0x7fff_ffff),
            pending: VecDeque::new(),
            deferred_final: None,
        }
    }

    /// Number the response and queue it. Returns it if it can go out now.
    pub fn enqueue(&mut self, mut response: Response) -> (u32, Option<Response>) {
        let rseq = self.next_rseq;
        self.next_rseq = self.next_rseq.wrapping_add(1);
        response.headers.rseq = Some(rseq);
        if !response.headers.requires(OPTION_100REL) {
            response.headers.require.push(OPTION_100REL.to_string());
        }
        let precious = !response.body.is_empty();
        self.pending.push_back(ReliableResponse {
            rseq,
            response: response.clone(),
            precious,
        });
        trace!(rseq, queued = self.pending.len(), "reliable response queued");
        if self.pending.len() == 1 {
            (rseq, Some(response))
        } else {
            (rseq, None)
        }
    }

    /// Response currently waiting for its PRACK
    pub fn in_flight(&self) -> Option<&ReliableResponse> {
        self.pending.front()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// A final response with a body has to wait for outstanding PRACKs
    pub fn must_defer(&self, final_response: &Response) -> bool {
        !final_response.body.is_empty() && self.pending.iter().any(|r| r.precious)
    }

    pub fn defer_final(&mut self, response: Response) {
        self.deferred_final = Some(response);
    }

    pub fn has_deferred_final(&self) -> bool {
        self.deferred_final.is_some()
    }

    /// Apply a PRACK's RAck for the INVITE with sequence number `cseq`
    pub fn prack(&mut self, rack: &RAck, cseq: u32) -> PrackOutcome {
        let matches = self.pending.front().is_some_and(|head| {
            head.rseq == rack.rseq && rack.cseq == cseq && rack.method == Method::Invite
        });
        if !matches {
            return PrackOutcome::NoMatch;
        }
        let Some(acked) = self.pending.pop_front() else {
            return PrackOutcome::NoMatch;
        };
        let next = self.pending.front().map(|r| r.response.clone());
        let released = if self.pending.is_empty() {
            self.deferred_final.take()
        } else {
            None
        };
        PrackOutcome::Acked {
            rseq: acked.rseq,
            next,
            released,
        }
    }

    /// Drop everything still queued; a final response went out
    pub fn clear(&mut self) {
        self.pending.clear();
        self.deferred_final = None;
    }
}
