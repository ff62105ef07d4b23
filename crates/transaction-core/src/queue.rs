//! Storage and timing primitives
//!
//! - [`Arena`]: generational slot storage for transactions and legs. Handles
//!   handed to the application are arena keys, so a stale handle never
//!   aliases a newer object.
//! - [`TimerQueue`]: FIFO of transactions that entered the same state. All
//!   members share one linger time, so entry order is deadline order.
//! - [`RetryList`]: retransmission deadlines, sorted by time.
//!
//! Moving a transaction to another queue bumps its epoch; queue entries with
//! an old epoch are skipped when they surface.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// Generational index into an [`Arena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    index: u32,
    generation: u32,
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) Key);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

handle!(
    /// Handle of a server transaction
    IncomingId,
    "in"
);
handle!(
    /// Handle of a client transaction
    OutgoingId,
    "out"
);
handle!(
    /// Handle of a dialog or destination leg
    LegId,
    "leg"
);

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> Arena<T> {
    pub fn insert(&mut self, value: T) -> Key {
        self.len += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.value = Some(value);
                Key {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    value: Some(value),
                });
                Key {
                    index,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, key: Key) -> Option<&T> {
        self.slots
            .get(key.index as usize)
            .filter(|s| s.generation == key.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|s| s.generation == key.generation)
            .and_then(|s| s.value.as_mut())
    }

    pub fn contains(&self, key: Key) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: Key) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        self.free.push(key.index);
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn keys(&self) -> Vec<Key> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.value.is_some())
            .map(|(i, s)| Key {
                index: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|s| s.value.as_ref())
    }
}

/// Either side's transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum TxRef {
    Incoming(IncomingId),
    Outgoing(OutgoingId),
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxRef::Incoming(id) => id.fmt(f),
            TxRef::Outgoing(id) => id.fmt(f),
        }
    }
}

/// Every queue a transaction can sit in. The queue is the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum QueueKind {
    /// Request received, nothing sent yet (N1)
    InTrying,
    /// Provisional sent, waiting for the application
    InProceeding,
    /// Reliable provisional waiting for PRACK (P2)
    InPreliminary,
    /// Non-INVITE final sent (J)
    InCompleted,
    /// INVITE final sent, waiting for ACK (H)
    InInvCompleted,
    /// ACK received for a non-2xx final (I)
    InInvConfirmed,
    /// Final response could not be sent; one more try
    InFinalFailed,
    InTerminated,

    /// Waiting for DNS
    OutResolving,
    /// CANCEL waiting for the first provisional of its INVITE
    OutDelayed,
    /// Non-INVITE sent (F), also while proceeding
    OutTrying,
    /// INVITE sent, nothing received (B)
    OutInvCalling,
    /// INVITE got a provisional (C)
    OutInvProceeding,
    /// Non-INVITE final received (K)
    OutCompleted,
    /// INVITE non-2xx final received and ACKed (D)
    OutInvCompleted,
    /// INVITE 2xx received; absorbs retransmissions and forks
    OutInvAccepted,
    OutTerminated,
}

impl QueueKind {
    pub const ALL: [QueueKind; 17] = [
        QueueKind::InTrying,
        QueueKind::InProceeding,
        QueueKind::InPreliminary,
        QueueKind::InCompleted,
        QueueKind::InInvCompleted,
        QueueKind::InInvConfirmed,
        QueueKind::InFinalFailed,
        QueueKind::InTerminated,
        QueueKind::OutResolving,
        QueueKind::OutDelayed,
        QueueKind::OutTrying,
        QueueKind::OutInvCalling,
        QueueKind::OutInvProceeding,
        QueueKind::OutCompleted,
        QueueKind::OutInvCompleted,
        QueueKind::OutInvAccepted,
        QueueKind::OutTerminated,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn is_terminated(self) -> bool {
        matches!(self, QueueKind::InTerminated | QueueKind::OutTerminated)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueEntry {
    pub tx: TxRef,
    pub deadline: Instant,
    pub epoch: u64,
}

/// FIFO of transactions sharing one linger time
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    /// `None`: members never expire
    linger: Option<Duration>,
    entries: VecDeque<QueueEntry>,
}

impl TimerQueue {
    /// Append a member; returns its deadline when the queue expires members
    pub fn push(&mut self, tx: TxRef, now: Instant, epoch: u64) -> Option<Instant> {
        let deadline = now + self.linger?;
        self.entries.push_back(QueueEntry {
            tx,
            deadline,
            epoch,
        });
        Some(deadline)
    }

    pub fn front_deadline(&self) -> Option<Instant> {
        self.entries.front().map(|e| e.deadline)
    }

    pub fn pop_expired(&mut self, now: Instant) -> Option<QueueEntry> {
        if self.entries.front()?.deadline <= now {
            self.entries.pop_front()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// All timer queues of an agent
#[derive(Debug)]
pub(crate) struct Queues {
    queues: Vec<TimerQueue>,
}

impl Queues {
    pub fn new(linger: impl Fn(QueueKind) -> Option<Duration>) -> Self {
        Queues {
            queues: QueueKind::ALL
                .iter()
                .map(|k| TimerQueue {
                    linger: linger(*k),
                    entries: VecDeque::new(),
                })
                .collect(),
        }
    }

    pub fn get(&self, kind: QueueKind) -> &TimerQueue {
        &self.queues[kind.index()]
    }

    pub fn get_mut(&mut self, kind: QueueKind) -> &mut TimerQueue {
        &mut self.queues[kind.index()]
    }

    /// Earliest deadline over all queues
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queues.iter().filter_map(TimerQueue::front_deadline).min()
    }
}

/// Position of a transaction in the [`RetryList`]
pub(crate) type RetryKey = (Instant, u64);

/// Retransmission schedule sorted by deadline, then by insertion
#[derive(Debug, Default)]
pub(crate) struct RetryList {
    entries: BTreeSet<(Instant, u64, TxRef)>,
    seq: u64,
}

impl RetryList {
    pub fn schedule(&mut self, at: Instant, tx: TxRef) -> RetryKey {
        self.seq += 1;
        self.entries.insert((at, self.seq, tx));
        (at, self.seq)
    }

    pub fn cancel(&mut self, key: RetryKey, tx: TxRef) {
        self.entries.remove(&(key.0, key.1, tx));
    }

    pub fn pop_due(&mut self, now: Instant) -> Option<(RetryKey, TxRef)> {
        let first = *self.entries.iter().next()?;
        if first.0 > now {
            return None;
        }
        self.entries.remove(&first);
        Some(((first.0, first.1), first.2))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().next().map(|e| e.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_generations() {
        let mut arena = Arena::default();
        let a = arena.insert("a");
        assert_eq!(arena.remove(a), Some("a"));
        let b = arena.insert("b");
        // Slot reused with a new generation
        assert_eq!(a.index, b.index);
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.keys(), vec![b]);
    }

    #[test]
    fn test_timer_queue_fifo() {
        let now = Instant::now();
        let mut queues = Queues::new(|k| match k {
            QueueKind::InCompleted => Some(Duration::from_secs(1)),
            _ => None,
        });
        let a = TxRef::Incoming(IncomingId(Key {
            index: 1,
            generation: 0,
        }));
        let b = TxRef::Incoming(IncomingId(Key {
            index: 2,
            generation: 0,
        }));
        let q = queues.get_mut(QueueKind::InCompleted);
        q.push(a, now, 1);
        q.push(b, now + Duration::from_millis(10), 1);
        assert!(queues.get_mut(QueueKind::InTrying).push(a, now, 2).is_none());
        assert_eq!(queues.next_deadline(), Some(now + Duration::from_secs(1)));

        let q = queues.get_mut(QueueKind::InCompleted);
        assert!(q.pop_expired(now).is_none());
        let later = now + Duration::from_secs(2);
        assert_eq!(q.pop_expired(later).map(|e| e.tx), Some(a));
        assert_eq!(q.pop_expired(later).map(|e| e.tx), Some(b));
        assert!(q.pop_expired(later).is_none());
    }

    #[test]
    fn test_retry_list_order_and_cancel() {
        let now = Instant::now();
        let mut list = RetryList::default();
        let tx = |i| {
            TxRef::Outgoing(OutgoingId(Key {
                index: i,
                generation: 0,
            }))
        };
        let k1 = list.schedule(now + Duration::from_millis(500), tx(1));
        list.schedule(now + Duration::from_millis(100), tx(2));
        list.schedule(now + Duration::from_millis(100), tx(3));
        list.cancel(k1, tx(1));
        assert_eq!(list.next_deadline(), Some(now + Duration::from_millis(100)));

        let due = now + Duration::from_secs(1);
        assert_eq!(list.pop_due(due).map(|e| e.1), Some(tx(2)));
        assert_eq!(list.pop_due(due).map(|e| e.1), Some(tx(3)));
        assert!(list.pop_due(due).is_none());
        assert_eq!(list.len(), 0);
    }
}
