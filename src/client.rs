// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    validate_tuple, ClientError, Pattern, ReplicaDescriptor, ReplicaTransport, Request,
    ResponseCollector, Response,
};
use itertools::Itertools;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

/// One member of the replica set as seen from a client.
pub struct ReplicaHandle {
    pub descriptor: ReplicaDescriptor,
    transport: Arc<dyn ReplicaTransport>,
    // Artificial delay applied before every request to this replica.
    delay_ms: AtomicU64,
}

impl ReplicaHandle {
    pub fn new(descriptor: ReplicaDescriptor, transport: Arc<dyn ReplicaTransport>) -> Self {
        ReplicaHandle {
            descriptor,
            transport,
            delay_ms: AtomicU64::new(0),
        }
    }

    pub fn qualifier(&self) -> &str {
        &self.descriptor.qualifier
    }
}

/// `ReplicaSetClient` sends requests to a fixed, ordered set of replicas.
/// Each request to each replica runs on its own thread and completes into a
/// `ResponseCollector`; the calling thread waits there.
///
/// The set is sorted by qualifier once, at construction, and never changes.
/// To talk to a different set, build a new client.
pub struct ReplicaSetClient {
    replicas: Vec<ReplicaHandle>,
}

impl ReplicaSetClient {
    pub fn new(replicas: Vec<ReplicaHandle>) -> Self {
        // Stable: replicas sharing a qualifier keep lookup order.
        let replicas = replicas
            .into_iter()
            .sorted_by(|a, b| a.descriptor.qualifier.cmp(&b.descriptor.qualifier))
            .collect();
        ReplicaSetClient { replicas }
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn qualifiers(&self) -> Vec<String> {
        self.replicas
            .iter()
            .map(|r| r.qualifier().to_string())
            .collect()
    }

    fn handle(&self, qualifier: &str) -> Result<&ReplicaHandle, ClientError> {
        self.replicas
            .iter()
            .find(|r| r.qualifier() == qualifier)
            .ok_or_else(|| ClientError::UnknownReplica(qualifier.to_string()))
    }

    /// Delays every future request to replica `qualifier` by `delay`.
    pub fn set_delay(&self, qualifier: &str, delay: Duration) -> Result<(), ClientError> {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.handle(qualifier)?.delay_ms.store(millis, Ordering::SeqCst);
        debug!("delay for replica {} set to {:?}", qualifier, delay);
        Ok(())
    }

    /// Sends `request` to the named replicas without waiting. Each reply is
    /// passed through `convert` and recorded in `collector`; a replica-side
    /// error or a transport failure is recorded as a failure.
    pub fn dispatch<T, F>(
        &self,
        targets: &[String],
        request: &Request,
        collector: &Arc<ResponseCollector<T>>,
        convert: F,
    ) -> Result<(), ClientError>
    where
        T: Clone + Send + 'static,
        F: Fn(&str, Response) -> Result<T, ClientError> + Clone + Send + 'static,
    {
        let handles = targets
            .iter()
            .map(|q| self.handle(q))
            .collect::<Result<Vec<_>, _>>()?;
        for handle in handles {
            let qualifier = handle.qualifier();
            let transport = handle.transport.clone();
            let delay = Duration::from_millis(handle.delay_ms.load(Ordering::SeqCst));
            let replica = qualifier.to_string();
            let request = request.clone();
            let convert = convert.clone();
            let done = collector.callback();
            trace!("sending {} to replica {}", request.procedure(), replica);
            thread::spawn(move || {
                if delay > Duration::from_millis(0) {
                    thread::sleep(delay);
                }
                let outcome = match transport.call(request) {
                    Ok(Ok(response)) => convert(&replica, response),
                    Ok(Err(source)) => Err(ClientError::Rejected {
                        replica: replica.clone(),
                        source,
                    }),
                    Err(e) => Err(ClientError::Transport(e)),
                };
                done(outcome);
            });
        }
        Ok(())
    }

    /// Sends `request` to `targets` and waits for every one of them. Any
    /// failure fails the whole fan-out.
    pub fn fan_out(
        &self,
        targets: &[String],
        request: &Request,
    ) -> Result<Vec<(String, Response)>, ClientError> {
        let collector = Arc::new(ResponseCollector::new());
        collector.set_task_count(targets.len());
        self.dispatch(targets, request, &collector, |replica, response| {
            Ok((replica.to_string(), response))
        })?;
        collector.await_task_completion();
        match collector.first_failure() {
            Some(e) => Err(e),
            None => Ok(collector.responses()),
        }
    }

    /// Stores `tuple` on every replica.
    pub fn put(&self, tuple: &str) -> Result<(), ClientError> {
        validate_tuple(tuple).map_err(ClientError::Invalid)?;
        let request = Request::Put {
            tuple: tuple.to_string(),
        };
        self.acknowledged_by_all(&request)
    }

    /// Reads from every replica and returns the first answer to arrive.
    pub fn read(&self, pattern: &str) -> Result<String, ClientError> {
        Pattern::parse(pattern).map_err(ClientError::Invalid)?;
        let request = Request::Read {
            pattern: pattern.to_string(),
        };
        self.first_tuple(&request)
    }

    /// Full tuple list of one replica.
    pub fn get_state(&self, qualifier: &str) -> Result<Vec<String>, ClientError> {
        self.handle(qualifier)?;
        let collector = Arc::new(ResponseCollector::new());
        self.dispatch(
            &[qualifier.to_string()],
            &Request::GetState,
            &collector,
            |replica, response| response.into_state(replica),
        )?;
        collector.await_count(1);
        if let Some(e) = collector.first_failure() {
            return Err(e);
        }
        Ok(collector.responses().into_iter().next().unwrap_or_default())
    }

    pub fn sequenced_put(&self, seq: u64, tuple: &str) -> Result<(), ClientError> {
        validate_tuple(tuple).map_err(ClientError::Invalid)?;
        let request = Request::SequencedPut {
            tuple: tuple.to_string(),
            seq,
        };
        self.acknowledged_by_all(&request)
    }

    /// Every replica applies the take at `seq`. All of them must answer,
    /// since a replica that missed the number would stall; they answer
    /// alike, and the first answer is returned.
    pub fn sequenced_take(&self, seq: u64, pattern: &str) -> Result<String, ClientError> {
        Pattern::parse(pattern).map_err(ClientError::Invalid)?;
        let request = Request::SequencedTake {
            pattern: pattern.to_string(),
            seq,
        };
        let collector = Arc::new(ResponseCollector::new());
        self.dispatch(&self.qualifiers(), &request, &collector, |replica, response| {
            response.into_tuple(replica)
        })?;
        collector.await_count(self.len());
        if let Some(e) = collector.first_failure() {
            return Err(e);
        }
        collector
            .responses()
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::NoReplicas {
                service: String::new(),
            })
    }

    fn acknowledged_by_all(&self, request: &Request) -> Result<(), ClientError> {
        let collector = Arc::new(ResponseCollector::new());
        self.dispatch(&self.qualifiers(), request, &collector, |replica, response| {
            response.into_ack(replica)
        })?;
        collector.await_count(self.len());
        match collector.first_failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn first_tuple(&self, request: &Request) -> Result<String, ClientError> {
        if self.is_empty() {
            return Err(ClientError::NoReplicas {
                service: String::new(),
            });
        }
        let collector = Arc::new(ResponseCollector::new());
        self.dispatch(&self.qualifiers(), request, &collector, |replica, response| {
            response.into_tuple(replica)
        })?;
        collector.await_count(1);
        if let Some(e) = collector.first_failure() {
            return Err(e);
        }
        collector
            .responses()
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::NoReplicas {
                service: String::new(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LocalReplica, ReplicaService, StoreError};
    use std::time::Instant;

    fn replica_set(qualifiers: &[&str]) -> (ReplicaSetClient, Vec<Arc<LocalReplica>>) {
        let mut locals = vec![];
        let mut handles = vec![];
        for (i, q) in qualifiers.iter().enumerate() {
            let local = Arc::new(LocalReplica::new(Arc::new(ReplicaService::new(q, 1))));
            let d = ReplicaDescriptor::new(q, &format!("local:{}", 2001 + i)).unwrap();
            handles.push(ReplicaHandle::new(d, local.clone()));
            locals.push(local);
        }
        (ReplicaSetClient::new(handles), locals)
    }

    #[test]
    fn replicas_are_ordered_by_qualifier() {
        let (c, _) = replica_set(&["C", "A", "B"]);
        assert_eq!(c.qualifiers(), vec!["A", "B", "C"]);
    }

    #[test]
    fn put_reaches_every_replica() {
        let (c, locals) = replica_set(&["A", "B", "C"]);
        c.put("<a,1>").unwrap();
        for l in &locals {
            assert_eq!(l.service().store().snapshot(), vec!["<a,1>"]);
        }
        assert_eq!(c.read("<a,[0-9]+>").unwrap(), "<a,1>");
        assert_eq!(c.get_state("B").unwrap(), vec!["<a,1>"]);
    }

    #[test]
    fn invalid_input_never_leaves_client() {
        let (c, locals) = replica_set(&["A"]);
        assert_eq!(
            c.put("nope"),
            Err(ClientError::Invalid(StoreError::InvalidTuple("nope".into())))
        );
        assert!(matches!(
            c.read("nope"),
            Err(ClientError::Invalid(StoreError::InvalidPattern(_)))
        ));
        assert!(locals[0].service().store().snapshot().is_empty());
    }

    #[test]
    fn put_fails_if_any_replica_is_down() {
        let (c, locals) = replica_set(&["A", "B", "C"]);
        locals[1].set_up(false);
        let err = c.put("<a>").unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn read_takes_first_answer() {
        let (c, locals) = replica_set(&["A", "B"]);
        // Only B has the tuple; A's read blocks forever in the background.
        locals[1].service().store().put("<x>".into()).unwrap();
        assert_eq!(c.read("<x>").unwrap(), "<x>");
    }

    #[test]
    fn unknown_qualifier_rejected() {
        let (c, _) = replica_set(&["A"]);
        assert_eq!(
            c.get_state("Z"),
            Err(ClientError::UnknownReplica("Z".into()))
        );
        assert!(c.set_delay("Z", Duration::from_millis(1)).is_err());
    }

    #[test]
    fn unknown_target_sends_nothing() {
        let (c, locals) = replica_set(&["A", "B"]);
        let err = c
            .fan_out(
                &["A".to_string(), "Z".to_string()],
                &Request::Put { tuple: "<a>".into() },
            )
            .unwrap_err();
        assert_eq!(err, ClientError::UnknownReplica("Z".into()));
        thread::sleep(Duration::from_millis(20));
        assert!(locals[0].service().store().snapshot().is_empty());
    }

    #[test]
    fn delay_applies_to_one_replica() {
        let (c, _) = replica_set(&["A", "B"]);
        c.set_delay("B", Duration::from_millis(60)).unwrap();
        let start = Instant::now();
        c.put("<d>").unwrap();
        assert!(start.elapsed() >= Duration::from_millis(60));
        let start = Instant::now();
        c.get_state("A").unwrap();
        assert!(start.elapsed() < Duration::from_millis(60));
    }

    #[test]
    fn fan_out_reports_each_replica() {
        let (c, _) = replica_set(&["A", "B", "C"]);
        let mut got = c
            .fan_out(&["A".to_string(), "C".to_string()], &Request::GetState)
            .unwrap();
        got.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            got.into_iter().map(|(q, _)| q).collect::<Vec<_>>(),
            vec!["A", "C"]
        );
    }

    #[test]
    fn rejected_request_names_replica() {
        let (c, _) = replica_set(&["A"]);
        let err = c
            .fan_out(
                &["A".to_string()],
                &Request::TakePhase2 {
                    tuple: "<a>".into(),
                    client_id: crate::ClientId(1),
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Rejected {
                source: StoreError::NotHolder { .. },
                ..
            }
        ));
    }
}
