//! Matching asynchronous replies back to the callers waiting for them.

use crate::dispatcher::DispatchError;
use crate::envelope::{CorrelationId, NO_REPLY, StreamCommand};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

const COUNTER_BITS: u32 = 48;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

/// Issues correlation ids that are unique for the lifetime of the process.
///
/// The high 16 bits hold an instance discriminator so ids from two gateway
/// processes sharing a worker never collide; the low 48 bits are a counter.
pub struct CorrelationIdGenerator {
    instance: u64,
    counter: AtomicU64,
}

impl CorrelationIdGenerator {
    pub fn new(instance: u16) -> Self {
        CorrelationIdGenerator {
            instance: (instance as u64) << COUNTER_BITS,
            counter: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> CorrelationId {
        loop {
            let seq = self.counter.fetch_add(1, Ordering::Relaxed) & COUNTER_MASK;
            let id = self.instance | seq;
            if id != NO_REPLY {
                return id;
            }
        }
    }
}

/// What happened to a frame offered to the table.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Nobody is waiting, e.g. the caller already timed out.
    NoWaiter,
    /// The frame carries no correlation id and is never matched.
    Unsolicited,
}

#[derive(Default)]
pub struct CorrelationTable {
    slots: Mutex<HashMap<CorrelationId, oneshot::Sender<StreamCommand>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a one-shot slot for `id`. The slot lives as long as the returned guard.
    pub fn open(&self, id: CorrelationId) -> Result<PendingReply<'_>, DispatchError> {
        if id == NO_REPLY {
            return Err(DispatchError::CorrelationCollision(id));
        }

        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock();
        if slots.contains_key(&id) {
            return Err(DispatchError::CorrelationCollision(id));
        }
        slots.insert(id, tx);

        Ok(PendingReply {
            id,
            rx,
            table: self,
        })
    }

    /// Hands `reply` to the caller waiting on its correlation id. Never blocks.
    pub fn deliver(&self, reply: StreamCommand) -> Delivery {
        let id = reply.correlation_id();
        if id == NO_REPLY {
            return Delivery::Unsolicited;
        }

        let Some(tx) = self.slots.lock().remove(&id) else {
            return Delivery::NoWaiter;
        };

        // The receiver can only be gone if the guard is mid-drop.
        match tx.send(reply) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::NoWaiter,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn close(&self, id: CorrelationId) {
        self.slots.lock().remove(&id);
    }
}

/// A caller's claim on one correlation id. Dropping it removes the slot.
pub struct PendingReply<'a> {
    id: CorrelationId,
    rx: oneshot::Receiver<StreamCommand>,
    table: &'a CorrelationTable,
}

impl PendingReply<'_> {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Waits for the reply. `None` if the slot was closed without one.
    pub async fn recv(&mut self) -> Option<StreamCommand> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.table.close(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_unique_across_threads() {
        let ids = Arc::new(CorrelationIdGenerator::new(3));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..10_000).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert_ne!(id, NO_REPLY);
                assert_eq!(id >> COUNTER_BITS, 3);
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 40_000);
    }

    #[test]
    fn test_instance_zero_never_yields_zero() {
        let ids = CorrelationIdGenerator::new(0);
        ids.counter.store(COUNTER_MASK + 1, Ordering::Relaxed);
        assert_ne!(ids.next_id(), NO_REPLY);
    }

    #[tokio::test]
    async fn test_deliver_to_waiter() {
        let table = CorrelationTable::new();
        let mut pending = table.open(7).unwrap();
        assert_eq!(table.len(), 1);

        let reply = StreamCommand::new(Command::CheckTx).with_correlation_id(7);
        assert_eq!(table.deliver(reply.clone()), Delivery::Delivered);
        assert_eq!(pending.recv().await, Some(reply));

        drop(pending);
        assert!(table.is_empty());
    }

    #[test]
    fn test_late_and_unsolicited_replies() {
        let table = CorrelationTable::new();
        let pending = table.open(11).unwrap();
        let other = table.open(12).unwrap();
        drop(pending);

        let late = StreamCommand::new(Command::CheckTx).with_correlation_id(11);
        assert_eq!(table.deliver(late), Delivery::NoWaiter);
        assert_eq!(table.deliver(StreamCommand::keepalive()), Delivery::Unsolicited);

        // The other pending slot is untouched
        assert_eq!(table.len(), 1);
        assert_eq!(other.id(), 12);
    }

    #[test]
    fn test_collisions_rejected() {
        let table = CorrelationTable::new();
        let _pending = table.open(5).unwrap();
        assert!(matches!(
            table.open(5),
            Err(DispatchError::CorrelationCollision(5))
        ));
        assert!(matches!(
            table.open(NO_REPLY),
            Err(DispatchError::CorrelationCollision(NO_REPLY))
        ));
    }
}
