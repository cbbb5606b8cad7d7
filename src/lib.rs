// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate implements a replicated Linda-style tuple space: a shared bag of
 * string tuples that clients `put` into, `read` from (non-destructively, by
 * pattern) and `take` from (destructively, by pattern), held by a fixed set
 * of replicas with no leader among them.
 *
 * Puts and reads are simple fan-outs. The interesting operation is take,
 * which must remove a tuple from every replica while guaranteeing that two
 * clients racing for the same tuple never both get it. It comes in two
 * flavours:
 *
 *   - A _quorum take_, in two phases. Phase 1 asks every replica to reserve
 *     all matching tuples for this client; a replica's reservations are
 *     exclusive, so a tuple held by one client is invisible to another.
 *     Depending on how many replicas reserved something, the client backs
 *     off and retries (a minority), waits briefly and asks only the missing
 *     replicas (a partial majority), or intersects the reserved lists and, in
 *     phase 2, commits the removal of one common tuple everywhere (all of
 *     them). The decisions live in an explicit state machine, `TakeMachine`,
 *     that the model checker drives through every interleaving.
 *
 *   - A _sequenced take_, where a sequencer hands every mutation a global
 *     number and each replica's `SequencedApplyGate` applies mutations in
 *     exactly that order. A take that finds nothing queues for the next
 *     matching put.
 *
 * Clients find replicas through a `NameService`, talk to them through a
 * `ReplicaTransport` (in-process, or newline-delimited JSON over TCP), and
 * on any transport failure forget the replica set and look it up again.
 *
 * ## Name
 *
 * Linda is the coordination language of Gelernter and Carriero, built around
 * exactly this tuple space and its `out`, `rd` and `in` operations.
 */

mod client;
mod collector;
mod command;
mod config;
mod error;
mod gate;
mod message;
mod naming;
mod net;
mod pattern;
mod sequencer;
mod service;
mod session;
mod space;
mod store;
mod take;
mod transport;

pub use client::{ReplicaHandle, ReplicaSetClient};
pub use collector::ResponseCollector;
pub use command::Command;
pub use config::{Config, ConfigError, TakeConfig, TakeMode};
pub use error::{ClientError, NamingError, StoreError, TransportError};
pub use gate::{Applied, SequencedApplyGate, SequencedOp};
pub use message::{Reply, Request, Response};
pub use naming::{validate_address, NameRegistry, NameService, ReplicaDescriptor};
pub use net::{serve, spawn_server, TcpConnector, TcpReplica};
pub use pattern::{validate_tuple, Pattern};
pub use sequencer::{LocalSequencer, Sequencer};
pub use service::ReplicaService;
pub use session::{Outcome, Session};
pub use space::{ClientId, Entry, TupleSpace};
pub use store::{ReplicaStore, TakeTicket};
pub use take::{
    classify, intersection, Pause, Quorum, QuorumTakeCoordinator, TakeAction, TakeMachine,
    TakePolicy, TakeStage,
};
pub use transport::{Connector, LocalCluster, LocalReplica, ReplicaTransport};


#[cfg(test)]
mod stateright_tests;
