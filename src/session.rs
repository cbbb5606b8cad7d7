// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    validate_tuple, ClientError, ClientId, Command, Config, Connector, NameService, Pattern,
    QuorumTakeCoordinator, ReplicaHandle, ReplicaSetClient, Sequencer, TakeMode,
};
use itertools::Itertools;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a successfully executed command produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Tuple(String),
    Tuples(Vec<String>),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Done => write!(f, "OK"),
            Outcome::Tuple(t) => write!(f, "OK\n{}", t),
            Outcome::Tuples(ts) => write!(f, "OK\n[{}]", ts.iter().join(", ")),
        }
    }
}

/// `Session` is one client's view of the tuple space. It finds the replica
/// set through the name service on first use and keeps it until a transport
/// failure, at which point the descriptors are dropped and looked up again
/// on the next attempt.
pub struct Session {
    config: Config,
    names: Arc<dyn NameService>,
    connector: Arc<dyn Connector>,
    sequencer: Option<Arc<dyn Sequencer>>,
    coordinator: QuorumTakeCoordinator,
    replicas: Mutex<Option<Arc<ReplicaSetClient>>>,
}

impl Session {
    pub fn new(config: Config, names: Arc<dyn NameService>, connector: Arc<dyn Connector>) -> Self {
        let coordinator = Self::coordinator_for(&config, ClientId::random());
        Session {
            config,
            names,
            connector,
            sequencer: None,
            coordinator,
            replicas: Mutex::new(None),
        }
    }

    fn coordinator_for(config: &Config, client: ClientId) -> QuorumTakeCoordinator {
        QuorumTakeCoordinator::new(
            client,
            config.take.policy(),
            config.take.slot(),
            config.take.settle_delay(),
        )
    }

    pub fn with_sequencer(mut self, sequencer: Arc<dyn Sequencer>) -> Self {
        self.sequencer = Some(sequencer);
        self
    }

    pub fn with_client_id(mut self, client: ClientId) -> Self {
        self.coordinator = Self::coordinator_for(&self.config, client);
        self
    }

    pub fn client_id(&self) -> ClientId {
        self.coordinator.client_id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The current replica set, looked up and connected if needed.
    pub fn replicas(&self) -> Result<Arc<ReplicaSetClient>, ClientError> {
        let mut current = self.replicas.lock();
        if let Some(r) = &*current {
            return Ok(r.clone());
        }
        let service = &self.config.service_name;
        let found = self
            .names
            .lookup(service, self.config.qualifier.as_deref())?;
        if found.is_empty() {
            return Err(ClientError::NoReplicas {
                service: service.clone(),
            });
        }
        let mut handles = Vec::with_capacity(found.len());
        for descriptor in found {
            let transport = self.connector.connect(&descriptor)?;
            handles.push(ReplicaHandle::new(descriptor, transport));
        }
        let client = Arc::new(ReplicaSetClient::new(handles));
        info!(
            "client {} resolved {} to [{}]",
            self.client_id(),
            service,
            client.qualifiers().iter().join(", ")
        );
        *current = Some(client.clone());
        Ok(client)
    }

    fn forget_replicas(&self) {
        if self.replicas.lock().take().is_some() {
            debug!("client {} dropped replica descriptors", self.client_id());
        }
    }

    // Runs `op` against the replica set, re-resolving and retrying on
    // transport failures up to the configured number of times.
    fn run<T, F>(&self, op: F) -> Result<T, ClientError>
    where
        F: Fn(&ReplicaSetClient) -> Result<T, ClientError>,
    {
        let mut attempt = 0;
        loop {
            let result = self.replicas().and_then(|r| op(&r));
            match result {
                Err(e) if e.is_transport() => {
                    self.forget_replicas();
                    if attempt >= self.config.rpc_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    warn!(
                        code = e.error_code(),
                        "client {} retrying after {} (attempt {} of {})",
                        self.client_id(),
                        e,
                        attempt,
                        self.config.rpc_retries
                    );
                }
                other => return other,
            }
        }
    }

    fn next_sequence(&self) -> Result<u64, ClientError> {
        match &self.sequencer {
            Some(s) => s.next_sequence(),
            None => Err(ClientError::Sequencer("no sequencer configured".to_string())),
        }
    }

    pub fn put(&self, tuple: &str) -> Result<(), ClientError> {
        validate_tuple(tuple).map_err(ClientError::Invalid)?;
        match self.config.take_mode {
            TakeMode::Quorum => self.run(|r| r.put(tuple)),
            // A retry reuses the number: replicas that missed it are still
            // waiting for it.
            TakeMode::Sequenced => {
                let seq = self.next_sequence()?;
                self.run(|r| r.sequenced_put(seq, tuple))
            }
        }
    }

    pub fn read(&self, pattern: &str) -> Result<String, ClientError> {
        Pattern::parse(pattern).map_err(ClientError::Invalid)?;
        self.run(|r| r.read(pattern))
    }

    pub fn take(&self, pattern: &str) -> Result<String, ClientError> {
        Pattern::parse(pattern).map_err(ClientError::Invalid)?;
        match self.config.take_mode {
            TakeMode::Quorum => self.run(|r| self.coordinator.take(r, pattern)),
            TakeMode::Sequenced => {
                let seq = self.next_sequence()?;
                self.run(|r| r.sequenced_take(seq, pattern))
            }
        }
    }

    pub fn get_state(&self, qualifier: &str) -> Result<Vec<String>, ClientError> {
        self.run(|r| r.get_state(qualifier))
    }

    /// Lasts only as long as the current descriptors.
    pub fn set_delay(&self, qualifier: &str, delay: Duration) -> Result<(), ClientError> {
        self.replicas()?.set_delay(qualifier, delay)
    }

    pub fn execute(&self, command: Command) -> Result<Outcome, ClientError> {
        debug!("client {} executing {:?}", self.client_id(), command);
        match command {
            Command::Put(t) => self.put(&t).map(|_| Outcome::Done),
            Command::Read(p) => self.read(&p).map(Outcome::Tuple),
            Command::Take(p) => self.take(&p).map(Outcome::Tuple),
            Command::GetState(q) => self.get_state(&q).map(Outcome::Tuples),
            Command::Sleep(secs) => {
                thread::sleep(Duration::from_secs(secs));
                Ok(Outcome::Done)
            }
            Command::SetDelay { qualifier, secs } => self
                .set_delay(&qualifier, Duration::from_secs(secs))
                .map(|_| Outcome::Done),
        }
    }
}
