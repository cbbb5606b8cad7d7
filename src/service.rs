// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Reply, ReplicaStore, Request, Response, SequencedApplyGate};
use std::sync::Arc;
use tracing::{debug, trace};

/// `ReplicaService` is the server side of one replica: it owns the store and
/// its sequencing gate and turns each `Request` into store calls. Handling
/// may block (reads, sequenced operations waiting for their turn), so every
/// request is expected to run on its own thread.
#[derive(Debug)]
pub struct ReplicaService {
    qualifier: String,
    store: Arc<ReplicaStore>,
    gate: SequencedApplyGate,
}

impl ReplicaService {
    pub fn new(qualifier: &str, first_sequence: u64) -> Self {
        let store = Arc::new(ReplicaStore::new());
        ReplicaService {
            qualifier: qualifier.to_string(),
            gate: SequencedApplyGate::new(store.clone(), first_sequence),
            store,
        }
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }

    pub fn gate(&self) -> &SequencedApplyGate {
        &self.gate
    }

    pub fn handle(&self, request: Request) -> Reply {
        if request.is_mutation() {
            debug!("replica {} handling {}", self.qualifier, request.procedure());
        } else {
            trace!("replica {} handling {}", self.qualifier, request.procedure());
        }
        let store = &self.store;
        match request {
            Request::Put { tuple } => store.put(tuple).map(|_| Response::Put),
            Request::Read { pattern } => store.read(&pattern).map(|result| Response::Read { result }),
            Request::TakePhase1 { pattern, client_id } => store
                .reserve_pattern(&pattern, client_id)
                .map(|reserved_tuples| Response::TakePhase1 { reserved_tuples }),
            Request::TakePhase1Release { client_id } => {
                store.release_reservations(client_id);
                Ok(Response::TakePhase1Release)
            }
            Request::TakePhase2 { tuple, client_id } => store
                .commit_removal(&tuple, client_id)
                .map(|_| Response::TakePhase2),
            Request::GetState => Ok(Response::GetState {
                tuples: store.snapshot(),
            }),
            Request::SequencedPut { tuple, seq } => {
                self.gate.put_at(seq, tuple).map(|_| Response::SequencedPut)
            }
            Request::SequencedTake { pattern, seq } => self
                .gate
                .take_at(seq, pattern)
                .map(|result| Response::SequencedTake { result }),
        }
    }
}
