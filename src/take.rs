// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{ClientError, ClientId, Pattern, ReplicaSetClient, Request, Response, TransportError};
use itertools::Itertools;
use rand::Rng;
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

// The take protocol _could_ be written as one blocking function that talks
// to the replicas directly, and the driver at the bottom of this file is
// exactly that. But the decisions are kept in an explicit state machine,
// `TakeMachine`, which never touches the network or a clock: it is stepped
// with the replies to its last request and answers with the next thing to
// do. That keeps every variable of an in-flight take inspectable and
// cloneable, so the model checker can drive the same code through every
// interleaving of concurrent takes.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum TakeStage {
    Reserve,    // Send phase 1 to every replica not yet locked.
    Reserving,  // Awaiting phase 1 replies.
    Release,    // Send phase 1 release to every replica we locked.
    Releasing,  // Awaiting release acknowledgements.
    Pause,      // Sleep, then back to Reserve.
    Commit,     // Send phase 2 for the chosen tuple.
    Committing, // Awaiting phase 2 acknowledgements.
    Fini,       // Took a tuple.
    Exhausted,  // Ran out of backoff retries.
}

/// How long to wait between rounds. The machine only names the kind of
/// pause; the driver turns it into a duration.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Pause {
    /// Random exponential backoff after a minority round.
    Backoff { retry: u32 },
    /// Short fixed delay letting other clients release what they hold.
    Settle,
}

/// How much of the replica set one phase 1 round managed to lock.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Quorum {
    Minority,
    PartialMajority,
    Full,
}

/// Classifies `locked` replicas out of `total`. At most half is a minority;
/// a strict majority short of everyone is partial.
pub fn classify(locked: usize, total: usize) -> Quorum {
    if total > 0 && locked == total {
        Quorum::Full
    } else if locked * 2 <= total {
        Quorum::Minority
    } else {
        Quorum::PartialMajority
    }
}

/// Elements of the first list present in every other list, in first-list order.
pub fn intersection(lists: &[Vec<String>]) -> Vec<String> {
    match lists.split_first() {
        None => Vec::new(),
        Some((first, rest)) => first
            .iter()
            .filter(|t| rest.iter().all(|l| l.contains(t)))
            .cloned()
            .collect(),
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct TakePolicy {
    /// Minority rounds (and, if configured, empty intersections) allowed
    /// before giving up with `BackoffExceeded`.
    pub max_retries: u32,
    pub empty_intersection_consumes_budget: bool,
}

impl Default for TakePolicy {
    fn default() -> Self {
        TakePolicy {
            max_retries: 5,
            empty_intersection_consumes_budget: false,
        }
    }
}

/// What the driver of a `TakeMachine` should do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TakeAction {
    /// Send `request` to each of `targets` and step again with every reply.
    Send { targets: Vec<String>, request: Request },
    /// Sleep, then step again with no replies.
    Pause(Pause),
    Taken(String),
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct TakeMachine {
    client: ClientId,
    pattern: String,
    replicas: Vec<String>,
    policy: TakePolicy,

    stage: TakeStage,
    retries: u32,
    // Set once the budget is spent; the machine still releases first.
    exhausted: bool,

    // Replicas that reserved something for us this attempt, with what they
    // reserved. Survives partial-majority rounds, cleared on release.
    locked: BTreeMap<String, Vec<String>>,
    awaiting: Vec<String>,
    pause: Option<Pause>,
    chosen: Option<String>,
}

impl TakeMachine {
    /// `replicas` must be in the fixed replica-set order; intersection and
    /// tie-breaking follow it.
    pub fn new(client: ClientId, pattern: &str, replicas: Vec<String>, policy: TakePolicy) -> Self {
        TakeMachine {
            client,
            pattern: pattern.to_string(),
            replicas,
            policy,
            stage: TakeStage::Reserve,
            retries: 0,
            exhausted: false,
            locked: BTreeMap::new(),
            awaiting: Vec::new(),
            pause: None,
            chosen: None,
        }
    }

    pub fn stage(&self) -> TakeStage {
        self.stage
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Replicas currently holding reservations for this take.
    pub fn locked_replicas(&self) -> Vec<String> {
        self.in_replica_order(|r| self.locked.contains_key(r))
    }

    /// Replicas whose reply the machine is waiting for.
    pub fn awaiting(&self) -> &[String] {
        &self.awaiting
    }

    pub fn is_fini(&self) -> bool {
        self.stage == TakeStage::Fini
    }

    pub fn chosen(&self) -> Option<&str> {
        self.chosen.as_deref()
    }

    fn in_replica_order<F: Fn(&String) -> bool>(&self, keep: F) -> Vec<String> {
        self.replicas.iter().filter(|r| keep(r)).cloned().collect()
    }

    fn protocol_error(&self, reason: String) -> ClientError {
        ClientError::Transport(TransportError::Protocol {
            replica: self.awaiting.iter().join(","),
            reason,
        })
    }

    fn spend_retry(&mut self) {
        self.retries += 1;
        if self.retries >= self.policy.max_retries {
            self.exhausted = true;
        }
    }

    fn after_release(&self) -> TakeStage {
        if self.exhausted {
            TakeStage::Exhausted
        } else {
            TakeStage::Pause
        }
    }

    // Consumes the replies to the request last handed out.
    fn absorb(&mut self, replies: Vec<(String, Response)>) -> Result<(), ClientError> {
        let expecting = matches!(
            self.stage,
            TakeStage::Reserving | TakeStage::Releasing | TakeStage::Committing
        );
        if !expecting {
            if replies.is_empty() {
                return Ok(());
            }
            return Err(self.protocol_error(format!(
                "{} unexpected replies in stage {:?}",
                replies.len(),
                self.stage
            )));
        }
        let answered: Vec<&String> = replies.iter().map(|(r, _)| r).sorted().collect();
        let wanted: Vec<&String> = self.awaiting.iter().sorted().collect();
        if answered != wanted {
            return Err(self.protocol_error(format!(
                "replies from {:?} do not match requests to {:?}",
                answered, wanted
            )));
        }
        self.awaiting.clear();
        match self.stage {
            TakeStage::Reserving => {
                for (replica, response) in replies {
                    let reserved = response.into_reserved(&replica)?;
                    if !reserved.is_empty() {
                        self.locked.insert(replica, reserved);
                    }
                }
                self.classify_round();
            }
            TakeStage::Releasing => {
                for (replica, response) in replies {
                    response.into_ack(&replica)?;
                }
                self.stage = self.after_release();
            }
            _ => {
                for (replica, response) in replies {
                    response.into_ack(&replica)?;
                }
                self.stage = TakeStage::Fini;
            }
        }
        Ok(())
    }

    fn classify_round(&mut self) {
        let quorum = classify(self.locked.len(), self.replicas.len());
        debug!(
            "client {} locked {}/{} replicas: {:?}",
            self.client,
            self.locked.len(),
            self.replicas.len(),
            quorum
        );
        match quorum {
            Quorum::Minority => {
                self.spend_retry();
                self.pause = Some(Pause::Backoff {
                    retry: self.retries,
                });
                self.stage = TakeStage::Release;
            }
            Quorum::PartialMajority => {
                self.pause = Some(Pause::Settle);
                self.stage = TakeStage::Pause;
            }
            Quorum::Full => {
                let lists: Vec<Vec<String>> = self
                    .replicas
                    .iter()
                    .filter_map(|r| self.locked.get(r).cloned())
                    .collect();
                match intersection(&lists).into_iter().next() {
                    Some(t) => {
                        debug!("client {} chose {}", self.client, t);
                        self.chosen = Some(t);
                        self.stage = TakeStage::Commit;
                    }
                    None => {
                        debug!("client {} found empty intersection", self.client);
                        if self.policy.empty_intersection_consumes_budget {
                            self.spend_retry();
                        }
                        self.pause = Some(Pause::Settle);
                        self.stage = TakeStage::Release;
                    }
                }
            }
        }
    }

    /// Advances the machine. `replies` must hold one reply from every target
    /// of the last `Send`, and nothing otherwise.
    pub fn step(&mut self, replies: Vec<(String, Response)>) -> Result<TakeAction, ClientError> {
        self.absorb(replies)?;
        loop {
            trace!("client {} take stage {:?}", self.client, self.stage);
            match self.stage {
                TakeStage::Reserve => {
                    let targets = self.in_replica_order(|r| !self.locked.contains_key(r));
                    self.awaiting = targets.clone();
                    self.stage = TakeStage::Reserving;
                    return Ok(TakeAction::Send {
                        targets,
                        request: Request::TakePhase1 {
                            pattern: self.pattern.clone(),
                            client_id: self.client,
                        },
                    });
                }
                TakeStage::Release => {
                    let targets = self.locked_replicas();
                    self.locked.clear();
                    if targets.is_empty() {
                        self.stage = self.after_release();
                        continue;
                    }
                    self.awaiting = targets.clone();
                    self.stage = TakeStage::Releasing;
                    return Ok(TakeAction::Send {
                        targets,
                        request: Request::TakePhase1Release {
                            client_id: self.client,
                        },
                    });
                }
                TakeStage::Pause => {
                    self.stage = TakeStage::Reserve;
                    if let Some(p) = self.pause.take() {
                        return Ok(TakeAction::Pause(p));
                    }
                }
                TakeStage::Commit => {
                    let tuple = match &self.chosen {
                        Some(t) => t.clone(),
                        None => return Err(self.protocol_error("commit without a tuple".into())),
                    };
                    self.awaiting = self.replicas.clone();
                    self.stage = TakeStage::Committing;
                    return Ok(TakeAction::Send {
                        targets: self.replicas.clone(),
                        request: Request::TakePhase2 {
                            tuple,
                            client_id: self.client,
                        },
                    });
                }
                TakeStage::Fini => {
                    return match &self.chosen {
                        Some(t) => Ok(TakeAction::Taken(t.clone())),
                        None => Err(self.protocol_error("finished without a tuple".into())),
                    };
                }
                TakeStage::Exhausted => {
                    return Err(ClientError::BackoffExceeded {
                        retries: self.retries,
                    });
                }
                TakeStage::Reserving | TakeStage::Releasing | TakeStage::Committing => {
                    return Err(self.protocol_error(format!(
                        "stepped in stage {:?} without replies",
                        self.stage
                    )));
                }
            }
        }
    }
}

/// `QuorumTakeCoordinator` runs takes against a replica set with no replica
/// acting as coordinator: a tuple is removed only after this client held a
/// reservation on it at every replica at once, and reservations are
/// exclusive per replica, so no two clients can both remove it.
///
/// Any failed request aborts the take with that error; retries happen only
/// on contention. Before returning the error the coordinator asks every
/// replica it can still reach to drop this client's reservations.
#[derive(Clone, Debug)]
pub struct QuorumTakeCoordinator {
    client: ClientId,
    policy: TakePolicy,
    slot: Duration,
    settle: Duration,
}

impl QuorumTakeCoordinator {
    pub fn new(client: ClientId, policy: TakePolicy, slot: Duration, settle: Duration) -> Self {
        QuorumTakeCoordinator {
            client,
            policy,
            slot,
            settle,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client
    }

    /// Backoff after retry `n` sleeps a random 1..=2^n slots.
    pub fn pause_duration(&self, pause: Pause) -> Duration {
        match pause {
            Pause::Settle => self.settle,
            Pause::Backoff { retry } => {
                let ceiling = 1u32 << retry.min(16);
                let slots = rand::thread_rng().gen_range(0..ceiling) + 1;
                self.slot * slots
            }
        }
    }

    fn abandon(&self, replicas: &ReplicaSetClient, cause: &ClientError) {
        warn!(
            code = cause.error_code(),
            "client {} abandoning take: {}", self.client, cause
        );
        let release = Request::TakePhase1Release {
            client_id: self.client,
        };
        if let Err(e) = replicas.fan_out(&replicas.qualifiers(), &release) {
            debug!("client {} release after abort incomplete: {}", self.client, e);
        }
    }

    pub fn take(&self, replicas: &ReplicaSetClient, pattern: &str) -> Result<String, ClientError> {
        Pattern::parse(pattern).map_err(ClientError::Invalid)?;
        self.drive(replicas, pattern).map_err(|e| {
            // An exhausted machine has already released.
            if !matches!(e, ClientError::BackoffExceeded { .. }) {
                self.abandon(replicas, &e);
            }
            e
        })
    }

    fn drive(&self, replicas: &ReplicaSetClient, pattern: &str) -> Result<String, ClientError> {
        let mut machine = TakeMachine::new(self.client, pattern, replicas.qualifiers(), self.policy);
        let mut replies = Vec::new();
        loop {
            match machine.step(replies)? {
                TakeAction::Send { targets, request } => {
                    trace!("client {} sending {} to {:?}", self.client, request.procedure(), targets);
                    replies = replicas.fan_out(&targets, &request)?;
                }
                TakeAction::Pause(pause) => {
                    let d = self.pause_duration(pause);
                    debug!("client {} pausing {:?} ({:?})", self.client, d, pause);
                    thread::sleep(d);
                    replies = Vec::new();
                }
                TakeAction::Taken(t) => {
                    info!("client {} took {} after {} retries", self.client, t, machine.retries());
                    return Ok(t);
                }
            }
        }
    }
}
