// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

// Two clients run quorum takes against three replicas. Every message
// delivery is a separate checker action, so the checker explores every
// order in which the replicas see the two clients' reservations, releases
// and commits.

use crate::{ClientId, Pattern, Request, Response, TakeAction, TakeMachine, TakePolicy, TupleSpace};
use stateright::{Checker, Model, Property};

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct Client {
    machine: TakeMachine,
    // Requests sent but not yet applied at their replica.
    outbox: Vec<(String, Request)>,
    // Replies not yet stepped into the machine.
    inbox: Vec<(String, Response)>,
    taken: Option<String>,
    gave_up: bool,
    broken: bool,
}

impl Client {
    fn done(&self) -> bool {
        self.taken.is_some() || self.gave_up || self.broken
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct World {
    spaces: Vec<TupleSpace>,
    clients: Vec<Client>,
    // Set if a replica ever refused a phase 2.
    rejected_commit: bool,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
enum Action {
    Deliver { client: usize, index: usize },
    Step { client: usize },
}

struct TakeModel {
    qualifiers: Vec<String>,
    tuples: Vec<String>,
    patterns: Vec<String>,
    policy: TakePolicy,
}

impl TakeModel {
    fn replica_index(&self, qualifier: &str) -> Option<usize> {
        self.qualifiers.iter().position(|q| q == qualifier)
    }
}

fn apply(space: &mut TupleSpace, request: Request) -> (Response, bool) {
    match request {
        Request::TakePhase1 { pattern, client_id } => {
            let reserved_tuples = match Pattern::parse(&pattern) {
                Ok(p) => space.reserve(&p, client_id),
                Err(_) => Vec::new(),
            };
            (Response::TakePhase1 { reserved_tuples }, true)
        }
        Request::TakePhase1Release { client_id } => {
            space.release(client_id);
            (Response::TakePhase1Release, true)
        }
        Request::TakePhase2 { tuple, client_id } => {
            let ok = space.commit(&tuple, client_id).is_ok();
            (Response::TakePhase2, ok)
        }
        other => panic!("take protocol sent {:?}", other),
    }
}

impl Model for TakeModel {
    type State = World;
    type Action = Action;

    fn init_states(&self) -> Vec<World> {
        let mut space = TupleSpace::new();
        for t in &self.tuples {
            space.insert(t.clone());
        }
        let clients = self
            .patterns
            .iter()
            .enumerate()
            .map(|(i, p)| Client {
                machine: TakeMachine::new(
                    ClientId(i as u32 + 1),
                    p,
                    self.qualifiers.clone(),
                    self.policy,
                ),
                outbox: vec![],
                inbox: vec![],
                taken: None,
                gave_up: false,
                broken: false,
            })
            .collect();
        vec![World {
            spaces: vec![space; self.qualifiers.len()],
            clients,
            rejected_commit: false,
        }]
    }

    fn actions(&self, state: &World, actions: &mut Vec<Action>) {
        for (client, c) in state.clients.iter().enumerate() {
            if c.done() {
                continue;
            }
            if c.outbox.is_empty() {
                actions.push(Action::Step { client });
            } else {
                for index in 0..c.outbox.len() {
                    actions.push(Action::Deliver { client, index });
                }
            }
        }
    }

    fn next_state(&self, state: &World, action: Action) -> Option<World> {
        let mut next = state.clone();
        match action {
            Action::Deliver { client, index } => {
                let (qualifier, request) = next.clients[client].outbox.remove(index);
                let r = self.replica_index(&qualifier)?;
                let (response, ok) = apply(&mut next.spaces[r], request);
                next.rejected_commit |= !ok;
                next.clients[client].inbox.push((qualifier, response));
            }
            Action::Step { client } => {
                let c = &mut next.clients[client];
                let replies = std::mem::take(&mut c.inbox);
                match c.machine.step(replies) {
                    Ok(TakeAction::Send { targets, request }) => {
                        c.outbox = targets
                            .into_iter()
                            .map(|t| (t, request.clone()))
                            .collect();
                    }
                    Ok(TakeAction::Pause(_)) => (),
                    Ok(TakeAction::Taken(t)) => c.taken = Some(t),
                    Err(crate::ClientError::BackoffExceeded { .. }) => c.gave_up = true,
                    Err(_) => c.broken = true,
                }
            }
        }
        Some(next)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            Property::always("no tuple taken twice", |_, state: &World| {
                let taken: Vec<&String> =
                    state.clients.iter().filter_map(|c| c.taken.as_ref()).collect();
                taken
                    .iter()
                    .enumerate()
                    .all(|(i, t)| !taken[i + 1..].contains(t))
            }),
            Property::always("commits only held tuples", |_, state: &World| {
                !state.rejected_commit
            }),
            Property::always("machines never misbehave", |_, state: &World| {
                state.clients.iter().all(|c| !c.broken)
            }),
            Property::always("finished takes leave replicas agreed and unlocked", |_, state: &World| {
                if !state.clients.iter().all(|c| c.done()) {
                    return true;
                }
                let first = state.spaces[0].values();
                state.spaces.iter().all(|s| {
                    s.values() == first && s.values().iter().all(|v| s.holders(v).iter().all(Option::is_none))
                })
            }),
            Property::sometimes("a take succeeds", |_, state: &World| {
                state.clients.iter().any(|c| c.taken.is_some())
            }),
            Property::sometimes("both takes succeed", |_, state: &World| {
                state.clients.iter().all(|c| c.taken.is_some())
            }),
        ]
    }
}

fn model(tuples: &[&str], patterns: &[&str]) -> TakeModel {
    TakeModel {
        qualifiers: vec!["A".into(), "B".into(), "C".into()],
        tuples: tuples.iter().map(|t| t.to_string()).collect(),
        patterns: patterns.iter().map(|p| p.to_string()).collect(),
        policy: TakePolicy {
            max_retries: 2,
            empty_intersection_consumes_budget: false,
        },
    }
}

#[test]
fn model_check_competing_takes() {
    model(&["<t,1>", "<t,2>"], &["<t,.>", "<t,.>"])
        .checker()
        .spawn_bfs()
        .join()
        .assert_properties();
}

#[test]
fn model_check_overlapping_patterns() {
    model(&["<t,1>", "<t,2>"], &["<t,1>", "<t,.>"])
        .checker()
        .spawn_bfs()
        .join()
        .assert_properties();
}
