//! Scheduler step
//!
//! [`Agent::tick`] is the only place where time moves the state machines
//! forward and where terminated transactions are freed. Each step:
//!
//! 1. fires due retransmissions, at most `retransmit_batch`
//! 2. expires up to `timeout_batch` members of every timer queue; entries
//!    whose epoch no longer matches the transaction were superseded by a
//!    later queue move and are skipped
//! 3. reaps the terminated queues
//!
//! Work left over because of the batch limits is picked up by the next
//! step, which [`Agent::next_wakeup`] schedules immediately.

use std::time::Instant;

use tracing::{debug, trace};

use crate::agent::{Agent, Lifecycle};
use crate::incoming::Incoming;
use crate::outgoing::Outgoing;
use crate::queue::{QueueKind, TxRef};

/// Transactions removed in one reap, dropped off the engine task when large
#[derive(Debug, Default)]
pub(crate) struct Reaped {
    pub incoming: Vec<Incoming>,
    pub outgoing: Vec<Outgoing>,
}

impl Reaped {
    pub fn len(&self) -> usize {
        self.incoming.len() + self.outgoing.len()
    }
}

impl Agent {
    /// Run one scheduler step at the clock's current time. Returns the
    /// number of timers that fired.
    pub fn tick(&mut self) -> usize {
        let now = self.now();
        let mut fired = 0;

        for _ in 0..self.config.retransmit_batch {
            let Some((key, tx)) = self.retry.pop_due(now) else {
                break;
            };
            if !self.take_retry(tx, key) {
                continue;
            }
            fired += 1;
            match tx {
                TxRef::Incoming(id) => self.incoming_retry(id),
                TxRef::Outgoing(id) => self.outgoing_retry(id),
            }
        }

        for kind in QueueKind::ALL {
            if kind.is_terminated() {
                continue;
            }
            for _ in 0..self.config.timeout_batch {
                let Some(entry) = self.queues.get_mut(kind).pop_expired(now) else {
                    break;
                };
                if !self.entry_is_current(entry.tx, kind, entry.epoch) {
                    continue;
                }
                fired += 1;
                trace!(tx = %entry.tx, queue = ?kind, "queue deadline");
                match entry.tx {
                    TxRef::Incoming(id) => self.incoming_timeout(id, kind),
                    TxRef::Outgoing(id) => self.outgoing_timeout(id, kind),
                }
            }
        }

        self.reap(now, false);
        fired
    }

    /// When [`tick`](Self::tick) has work next
    pub fn next_wakeup(&self) -> Option<Instant> {
        let pending_reap = [QueueKind::InTerminated, QueueKind::OutTerminated]
            .into_iter()
            .filter_map(|kind| self.queues.get(kind).front_deadline())
            .min();
        [
            self.queues.next_deadline(),
            self.retry.next_deadline(),
            pending_reap,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Free terminated transactions. `force` ignores the batch limit.
    pub(crate) fn reap(&mut self, now: Instant, force: bool) {
        let limit = if force {
            usize::MAX
        } else {
            self.config.timeout_batch
        };
        let mut reaped = Reaped::default();

        let kind = QueueKind::InTerminated;
        for _ in 0..limit {
            let Some(entry) = self.queues.get_mut(kind).pop_expired(now) else {
                break;
            };
            let TxRef::Incoming(id) = entry.tx else {
                continue;
            };
            if !self.entry_is_current(entry.tx, kind, entry.epoch) {
                continue;
            }
            let Some(mut irq) = self.incoming.remove(id.0) else {
                continue;
            };
            self.in_table.remove(irq.hash, id);
            if let Some(compartment) = irq.compartment.take() {
                self.compressor.close(compartment);
            }
            irq.lifecycle = Lifecycle::Freed;
            trace!(id = %id, "server transaction freed");
            reaped.incoming.push(irq);
        }

        let kind = QueueKind::OutTerminated;
        for _ in 0..limit {
            let Some(entry) = self.queues.get_mut(kind).pop_expired(now) else {
                break;
            };
            let TxRef::Outgoing(id) = entry.tx else {
                continue;
            };
            if !self.entry_is_current(entry.tx, kind, entry.epoch) {
                continue;
            }
            let Some(mut orq) = self.outgoing.remove(id.0) else {
                continue;
            };
            self.out_table.remove(orq.hash, id);
            if let Some(parent) = orq.parent.and_then(|p| self.outgoing.get_mut(p.0)) {
                parent.forks.retain(|fork| *fork != id);
            }
            if let Some(compartment) = orq.compartment.take() {
                self.compressor.close(compartment);
            }
            orq.lifecycle = Lifecycle::Freed;
            trace!(id = %id, "client transaction freed");
            reaped.outgoing.push(orq);
        }

        self.release(reaped);
    }

    fn release(&mut self, reaped: Reaped) {
        let count = reaped.len();
        if count == 0 {
            return;
        }
        if count < self.config.bulk_free_threshold {
            return;
        }
        debug!(count, "bulk release of terminated transactions");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn_blocking(move || drop(reaped));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use siptx_sip_core::{Method, RequestBuilder};
    use siptx_sip_transport::Destination;

    use crate::clock::ManualClock;
    use crate::config::AgentConfig;
    use crate::outgoing::RequestSpec;
    use crate::testing::{MockDns, MockTransport};

    use super::*;

    fn options() -> siptx_sip_core::Request {
        RequestBuilder::new(Method::Options, "sip:bob@192.0.2.2")
            .unwrap()
            .from("sip:alice@192.0.2.1", Some("a1"))
            .unwrap()
            .to("sip:bob@192.0.2.2", None)
            .unwrap()
            .call_id("timer-test")
            .cseq(1)
            .build()
            .unwrap()
    }

    #[test]
    fn test_idle_agent_has_no_wakeup() {
        let clock = ManualClock::new();
        let mut agent = Agent::new(
            AgentConfig::default(),
            MockTransport::new(),
            MockDns::new(),
            clock,
        )
        .unwrap();
        assert_eq!(agent.next_wakeup(), None);
        assert_eq!(agent.tick(), 0);
    }

    #[test]
    fn test_retransmission_then_timeout_frees_transaction() {
        let clock = ManualClock::new();
        let transport = MockTransport::new();
        let mut agent = Agent::new(
            AgentConfig::default(),
            transport.clone(),
            MockDns::new(),
            clock.clone(),
        )
        .unwrap();
        let dest = Destination::udp("192.0.2.2:5060".parse().unwrap());
        let id = agent.request(RequestSpec::new(options()).to(dest)).unwrap();
        assert_eq!(transport.sent().len(), 1);

        let wake = agent.next_wakeup().unwrap();
        assert_eq!(wake - agent.now(), agent.config().t1);

        clock.advance(Duration::from_millis(500));
        assert_eq!(agent.tick(), 1);
        assert_eq!(transport.sent().len(), 2);

        // Timer F
        clock.advance(agent.config().t1x64);
        agent.tick();
        let events = agent.drain_events();
        assert_eq!(events.last().and_then(|e| e.status()), Some(408));
        assert!(agent.outgoing_state(id).is_err());
        assert_eq!(agent.stats().outgoing_table, 0);
    }
}
