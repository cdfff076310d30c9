//! Correlation wait table shared by calling threads and the demultiplexer.
//!
//! Slots are registered before the call is pushed, so a reply can never
//! arrive for an id nobody is waiting on yet.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

use dashmap::DashMap;

use super::ContextError;
use crate::bridge::protocol::{CorrelationId, Reply};

pub struct WaitTable {
    slots: DashMap<CorrelationId, SyncSender<Reply>>,
    next_id: AtomicU64,
    outstanding: AtomicUsize,
    closed: AtomicBool,
    limit: usize,
}

impl WaitTable {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            limit: limit.max(1),
        }
    }

    /// Fresh id; ids are never reused.
    pub fn next_id(&self) -> CorrelationId {
        CorrelationId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Allocate an id and a slot to wait on.
    pub fn register(&self) -> Result<(CorrelationId, Receiver<Reply>), ContextError> {
        if self.is_closed() {
            return Err(ContextError::Stopped);
        }
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .map_err(|_| ContextError::Saturated { limit: self.limit })?;

        let id = self.next_id();
        let (tx, rx) = sync_channel(1);
        self.slots.insert(id, tx);

        // A close that ran between the first check and the insert has
        // already drained the table and will not see this slot.
        if self.is_closed() {
            self.abandon(id);
            return Err(ContextError::Stopped);
        }
        Ok((id, rx))
    }

    /// Hand a reply to its waiter. Returns `false` for unknown ids.
    pub fn deliver(&self, id: CorrelationId, reply: Reply) -> bool {
        match self.take(id) {
            Some(tx) => {
                // The waiter may have given up in the meantime.
                let _ = tx.try_send(reply);
                true
            }
            None => false,
        }
    }

    /// Drop a slot whose caller stopped waiting. A late reply for it is then
    /// reported as unknown.
    pub fn abandon(&self, id: CorrelationId) {
        self.take(id);
    }

    /// Reject new registrations and cancel every outstanding waiter.
    pub fn close_and_cancel(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<CorrelationId> = self.slots.iter().map(|entry| *entry.key()).collect();
        let mut cancelled = 0;
        for id in ids {
            if self.deliver(id, Reply::Cancelled) {
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn take(&self, id: CorrelationId) -> Option<SyncSender<Reply>> {
        let (_, tx) = self.slots.remove(&id)?;
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        Some(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn deliver_reaches_registered_waiter_once() {
        let table = WaitTable::new(4);
        let (id, rx) = table.register().unwrap();

        assert!(table.deliver(id, Reply::Triggered));
        assert_eq!(rx.recv().unwrap(), Reply::Triggered);
        assert!(!table.deliver(id, Reply::Triggered));
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_id_is_reported() {
        let table = WaitTable::new(4);
        assert!(!table.deliver(CorrelationId::new(999), Reply::NotFound));
    }

    #[test]
    fn ids_are_never_reused() {
        let table = Arc::new(WaitTable::new(1024));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    (0..100)
                        .map(|_| {
                            let (id, _rx) = table.register().unwrap();
                            table.abandon(id);
                            id
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {id} allocated twice");
            }
        }
        assert_eq!(seen.len(), 800);
    }

    #[test]
    fn limit_bounds_outstanding_slots() {
        let table = WaitTable::new(2);
        assert_eq!(table.limit(), 2);
        assert_eq!(WaitTable::new(0).limit(), 1);
        let (a, _ra) = table.register().unwrap();
        let (_b, _rb) = table.register().unwrap();
        assert!(matches!(
            table.register(),
            Err(ContextError::Saturated { limit: 2 })
        ));

        table.abandon(a);
        assert!(table.register().is_ok());
    }

    #[test]
    fn close_cancels_waiters_and_rejects_new_ones() {
        let table = WaitTable::new(8);
        let receivers: Vec<_> = (0..3).map(|_| table.register().unwrap().1).collect();

        assert_eq!(table.close_and_cancel(), 3);
        for rx in receivers {
            assert_eq!(rx.recv().unwrap(), Reply::Cancelled);
        }
        assert!(matches!(table.register(), Err(ContextError::Stopped)));
        assert!(table.is_empty());
    }
}
