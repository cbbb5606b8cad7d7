// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{validate_tuple, ClientId, Pattern, StoreError, TupleSpace};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

/// A take that found nothing and is waiting for a matching put.
#[derive(Debug)]
struct PendingTake {
    ticket: u64,
    pattern: Pattern,
}

#[derive(Debug, Default)]
struct StoreState {
    space: TupleSpace,
    // Served oldest-first.
    pending: VecDeque<PendingTake>,
    // Tuples a put handed straight to a pending take, keyed by ticket.
    handoffs: HashMap<u64, String>,
    next_ticket: u64,
}

/// Outcome of a non-blocking take attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TakeTicket {
    Taken(String),
    /// Nothing matched; the take is queued and `await_handoff` will yield
    /// the tuple a later put delivers to it.
    Pending(u64),
}

/// `ReplicaStore` is the authoritative tuple collection of one replica.
///
/// Every operation runs under a single mutex. The only suspension points are
/// blocking `read` and waiting on a queued take, and both re-check their
/// condition under the lock each time they wake, so a put landing between
/// the check and the wait is never missed.
///
/// A put first offers its tuple to the oldest pending take whose pattern
/// matches; if one exists the tuple goes to that waiter and is never stored.
/// Otherwise it is appended and every blocked reader is woken to re-check.
#[derive(Debug, Default)]
pub struct ReplicaStore {
    state: Mutex<StoreState>,
    changed: Condvar,
}

impl ReplicaStore {
    pub fn new() -> Self {
        ReplicaStore::default()
    }

    pub fn put(&self, tuple: String) -> Result<(), StoreError> {
        validate_tuple(&tuple)?;
        let mut st = self.state.lock();
        let waiter = st.pending.iter().position(|p| p.pattern.matches(&tuple));
        match waiter.and_then(|pos| st.pending.remove(pos)) {
            Some(p) => {
                debug!("put {} handed to pending take #{}", tuple, p.ticket);
                st.handoffs.insert(p.ticket, tuple);
            }
            None => {
                trace!("put {}", tuple);
                st.space.insert(tuple);
            }
        }
        self.changed.notify_all();
        Ok(())
    }

    /// Returns the first tuple matching `pattern`, blocking until one exists.
    /// Never removes anything.
    pub fn read(&self, pattern: &str) -> Result<String, StoreError> {
        let pattern = Pattern::parse(pattern)?;
        let mut st = self.state.lock();
        loop {
            if let Some(found) = st.space.find(&pattern) {
                return Ok(found.to_string());
            }
            trace!("read {} waiting for a match", pattern);
            self.changed.wait(&mut st);
        }
    }

    /// Phase 1: reserves every unreserved tuple matching `pattern` for
    /// `client` and returns them. An empty result is immediate, not a wait.
    pub fn reserve_pattern(
        &self,
        pattern: &str,
        client: ClientId,
    ) -> Result<Vec<String>, StoreError> {
        let pattern = Pattern::parse(pattern)?;
        let reserved = self.state.lock().space.reserve(&pattern, client);
        debug!(
            "client {} reserved {} tuple(s) for {}",
            client,
            reserved.len(),
            pattern
        );
        Ok(reserved)
    }

    /// Phase 1 release: unlocks everything `client` holds. Idempotent.
    pub fn release_reservations(&self, client: ClientId) {
        let released = self.state.lock().space.release(client);
        debug!("client {} released {} reservation(s)", client, released);
    }

    /// Phase 2: removes `tuple` if and only if `client` holds it.
    pub fn commit_removal(&self, tuple: &str, client: ClientId) -> Result<(), StoreError> {
        self.state.lock().space.commit(tuple, client)?;
        debug!("client {} committed removal of {}", client, tuple);
        Ok(())
    }

    /// Removes the first unreserved match, or queues a pending take.
    pub fn take_or_enqueue(&self, pattern: Pattern) -> TakeTicket {
        let mut st = self.state.lock();
        if let Some(t) = st.space.remove_first(&pattern) {
            return TakeTicket::Taken(t);
        }
        let ticket = st.next_ticket;
        st.next_ticket += 1;
        debug!("take {} queued as #{}", pattern, ticket);
        st.pending.push_back(PendingTake { ticket, pattern });
        TakeTicket::Pending(ticket)
    }

    /// Blocks until a put hands a tuple to the queued take `ticket`.
    pub fn await_handoff(&self, ticket: u64) -> String {
        let mut st = self.state.lock();
        loop {
            if let Some(t) = st.handoffs.remove(&ticket) {
                return t;
            }
            self.changed.wait(&mut st);
        }
    }

    /// Removes and returns a matching tuple, blocking until one is put.
    pub fn take(&self, pattern: &str) -> Result<String, StoreError> {
        let pattern = Pattern::parse(pattern)?;
        Ok(match self.take_or_enqueue(pattern) {
            TakeTicket::Taken(t) => t,
            TakeTicket::Pending(ticket) => self.await_handoff(ticket),
        })
    }

    /// Copy of every stored tuple, in insertion order.
    pub fn snapshot(&self) -> Vec<String> {
        self.state.lock().space.values()
    }

    /// Copy of the full state, reservations included.
    pub fn space(&self) -> TupleSpace {
        self.state.lock().space.clone()
    }

    pub fn pending_takes(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn wait_for_pending(store: &ReplicaStore, n: usize) {
        while store.pending_takes() < n {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn put_then_read_leaves_tuple() {
        let s = ReplicaStore::new();
        s.put("<a,1>".into()).unwrap();
        assert_eq!(s.read("<a,[0-9]+>").unwrap(), "<a,1>");
        assert_eq!(s.snapshot(), vec!["<a,1>"]);
    }

    #[test]
    fn put_rejects_malformed_tuple() {
        let s = ReplicaStore::new();
        assert_eq!(
            s.put("a,1".into()),
            Err(StoreError::InvalidTuple("a,1".into()))
        );
        assert!(s.snapshot().is_empty());
    }

    #[test]
    fn read_rejects_malformed_pattern() {
        let s = ReplicaStore::new();
        assert!(matches!(s.read("a"), Err(StoreError::InvalidPattern(_))));
        assert!(matches!(
            s.reserve_pattern("a", ClientId(1)),
            Err(StoreError::InvalidPattern(_))
        ));
    }

    #[test]
    fn blocked_read_wakes_on_matching_put() {
        let s = Arc::new(ReplicaStore::new());
        let reader = {
            let s = s.clone();
            thread::spawn(move || s.read("<b,.*>"))
        };
        thread::sleep(Duration::from_millis(20));
        s.put("<a,1>".into()).unwrap();
        s.put("<b,2>".into()).unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), "<b,2>");
        assert_eq!(s.snapshot(), vec!["<a,1>", "<b,2>"]);
    }

    #[test]
    fn blocked_readers_all_wake() {
        let s = Arc::new(ReplicaStore::new());
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let s = s.clone();
                thread::spawn(move || s.read("<x>"))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        s.put("<x>".into()).unwrap();
        for r in readers {
            assert_eq!(r.join().unwrap().unwrap(), "<x>");
        }
    }

    #[test]
    fn reservation_scenario() {
        let s = ReplicaStore::new();
        s.put("<a,1>".into()).unwrap();
        s.put("<a,2>".into()).unwrap();
        assert_eq!(
            s.reserve_pattern("<a,[0-9]+>", ClientId(5)).unwrap(),
            vec!["<a,1>", "<a,2>"]
        );
        assert!(s
            .reserve_pattern("<a,[0-9]+>", ClientId(7))
            .unwrap()
            .is_empty());
        assert!(matches!(
            s.commit_removal("<a,1>", ClientId(7)),
            Err(StoreError::NotHolder { .. })
        ));
        assert_eq!(s.snapshot(), vec!["<a,1>", "<a,2>"]);
        s.release_reservations(ClientId(5));
        assert_eq!(
            s.reserve_pattern("<a,1>", ClientId(7)).unwrap(),
            vec!["<a,1>"]
        );
        s.commit_removal("<a,1>", ClientId(7)).unwrap();
        assert_eq!(s.snapshot(), vec!["<a,2>"]);
    }

    #[test]
    fn release_without_holdings_is_noop() {
        let s = ReplicaStore::new();
        s.put("<a>".into()).unwrap();
        s.release_reservations(ClientId(42));
        s.release_reservations(ClientId(42));
        assert_eq!(s.space().holders("<a>"), vec![None]);
    }

    #[test]
    fn take_removes_immediately_when_present() {
        let s = ReplicaStore::new();
        s.put("<a,1>".into()).unwrap();
        assert_eq!(s.take("<a,.>").unwrap(), "<a,1>");
        assert!(s.snapshot().is_empty());
    }

    #[test]
    fn put_serves_oldest_pending_take_only() {
        let s = Arc::new(ReplicaStore::new());
        let first = {
            let s = s.clone();
            thread::spawn(move || s.take("<t,.*>"))
        };
        wait_for_pending(&s, 1);
        let second = {
            let s = s.clone();
            thread::spawn(move || s.take("<t,.*>"))
        };
        wait_for_pending(&s, 2);

        s.put("<t,1>".into()).unwrap();
        assert_eq!(first.join().unwrap().unwrap(), "<t,1>");
        assert_eq!(s.pending_takes(), 1);
        // Handed-off tuples never become visible.
        assert!(s.snapshot().is_empty());

        s.put("<t,2>".into()).unwrap();
        assert_eq!(second.join().unwrap().unwrap(), "<t,2>");
        assert_eq!(s.pending_takes(), 0);
    }

    #[test]
    fn non_matching_put_is_stored() {
        let s = Arc::new(ReplicaStore::new());
        let ticket = s.take_or_enqueue(Pattern::parse("<t>").unwrap());
        assert_eq!(ticket, TakeTicket::Pending(0));
        s.put("<u>".into()).unwrap();
        assert_eq!(s.snapshot(), vec!["<u>"]);
        s.put("<t>".into()).unwrap();
        assert_eq!(s.await_handoff(0), "<t>");
    }
}
