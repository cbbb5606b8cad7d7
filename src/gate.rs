// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Pattern, ReplicaStore, StoreError, TakeTicket};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

// How many applied numbers are remembered for answering repeats.
const HISTORY: usize = 4096;

/// A mutating operation stamped by the sequencer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SequencedOp {
    Put(String),
    Take(String),
}

/// What applying a `SequencedOp` did to the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    Put,
    Taken(String),
    /// The take found nothing and was queued; finish it with `await_take`.
    Pending(u64),
}

#[derive(Clone, Debug)]
enum Outcome {
    Put,
    Taken(String),
    Waiting,
    Failed(StoreError),
}

#[derive(Clone, Debug)]
struct Record {
    op: SequencedOp,
    outcome: Outcome,
}

#[derive(Debug)]
struct Turn {
    next: u64,
    history: BTreeMap<u64, Record>,
}

/// `SequencedApplyGate` makes every replica apply puts and takes in the
/// single order a sequencer hands out. An operation numbered `n` waits until
/// all operations numbered below `n` have been applied here.
///
/// A number that never arrives stalls every later operation on this replica
/// for good; nothing here times out.
///
/// A take that finds no match is queued in order and then waits for its
/// tuple *outside* the gate, so it does not hold up later numbers. Reads do
/// not pass through the gate at all.
///
/// Recently applied numbers are remembered with their outcome. The same
/// operation arriving again under the same number gets the same answer
/// without being applied twice, so a client may resend a number after a
/// transport failure. Anything else below the next expected number is
/// `StaleSequence`.
#[derive(Debug)]
pub struct SequencedApplyGate {
    store: Arc<ReplicaStore>,
    turn: Mutex<Turn>,
    advanced: Condvar,
}

impl SequencedApplyGate {
    pub fn new(store: Arc<ReplicaStore>, first: u64) -> Self {
        SequencedApplyGate {
            store,
            turn: Mutex::new(Turn {
                next: first,
                history: BTreeMap::new(),
            }),
            advanced: Condvar::new(),
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.turn.lock().next
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }

    /// Waits for turn `seq`, applies `op`, and admits `seq + 1`.
    ///
    /// A malformed argument still uses up its number, otherwise it would
    /// wedge this replica. Its validation error is returned after the
    /// counter has moved on.
    pub fn apply_at(&self, seq: u64, op: SequencedOp) -> Result<Applied, StoreError> {
        let mut turn = self.turn.lock();
        loop {
            if turn.next == seq {
                break;
            }
            if turn.next > seq {
                return self.replay(turn, seq, &op);
            }
            trace!("seq #{} waiting, replica at #{}", seq, turn.next);
            self.advanced.wait(&mut turn);
        }
        let applied = self.apply(&op);
        let outcome = match &applied {
            Ok(Applied::Put) => Outcome::Put,
            Ok(Applied::Taken(t)) => Outcome::Taken(t.clone()),
            Ok(Applied::Pending(_)) => Outcome::Waiting,
            Err(e) => {
                if e.is_validation() {
                    debug!("seq #{} consumed by invalid op: {}", seq, e);
                }
                Outcome::Failed(e.clone())
            }
        };
        turn.history.insert(seq, Record { op, outcome });
        while turn.history.len() > HISTORY {
            let oldest = turn.history.keys().next().copied();
            match oldest {
                Some(k) => turn.history.remove(&k),
                None => break,
            };
        }
        turn.next += 1;
        debug!("applied seq #{}, next #{}", seq, turn.next);
        self.advanced.notify_all();
        applied
    }

    // Answers an operation whose number was already applied here.
    fn replay(
        &self,
        mut turn: MutexGuard<'_, Turn>,
        seq: u64,
        op: &SequencedOp,
    ) -> Result<Applied, StoreError> {
        loop {
            let outcome = match turn.history.get(&seq) {
                Some(r) if r.op == *op => r.outcome.clone(),
                _ => {
                    return Err(StoreError::StaleSequence {
                        seq,
                        next: turn.next,
                    })
                }
            };
            debug!("seq #{} repeated, answering {:?}", seq, outcome);
            match outcome {
                Outcome::Put => return Ok(Applied::Put),
                Outcome::Taken(t) => return Ok(Applied::Taken(t)),
                Outcome::Failed(e) => return Err(e),
                // The first delivery is still waiting for its tuple.
                Outcome::Waiting => self.advanced.wait(&mut turn),
            }
        }
    }

    fn apply(&self, op: &SequencedOp) -> Result<Applied, StoreError> {
        match op {
            SequencedOp::Put(tuple) => {
                self.store.put(tuple.clone())?;
                Ok(Applied::Put)
            }
            SequencedOp::Take(pattern) => {
                let pattern = Pattern::parse(pattern)?;
                Ok(match self.store.take_or_enqueue(pattern) {
                    TakeTicket::Taken(t) => Applied::Taken(t),
                    TakeTicket::Pending(ticket) => Applied::Pending(ticket),
                })
            }
        }
    }

    /// Blocks until the take queued at `seq` as `ticket` receives its tuple,
    /// and records it so a repeat of `seq` gets the same tuple.
    pub fn await_take(&self, seq: u64, ticket: u64) -> String {
        let tuple = self.store.await_handoff(ticket);
        let mut turn = self.turn.lock();
        if let Some(r) = turn.history.get_mut(&seq) {
            r.outcome = Outcome::Taken(tuple.clone());
        }
        self.advanced.notify_all();
        tuple
    }

    pub fn put_at(&self, seq: u64, tuple: String) -> Result<(), StoreError> {
        self.apply_at(seq, SequencedOp::Put(tuple)).map(|_| ())
    }

    /// Takes in sequence order, blocking (after the turn is released) until
    /// a matching tuple is delivered if none was present.
    pub fn take_at(&self, seq: u64, pattern: String) -> Result<String, StoreError> {
        Ok(match self.apply_at(seq, SequencedOp::Take(pattern))? {
            Applied::Taken(t) => t,
            Applied::Pending(ticket) => self.await_take(seq, ticket),
            Applied::Put => {
                return Err(StoreError::StaleSequence {
                    seq,
                    next: self.next_expected(),
                })
            }
        })
    }
}
