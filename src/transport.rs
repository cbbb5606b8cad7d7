// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{NameRegistry, NamingError, Reply, ReplicaDescriptor, ReplicaService, Request, TransportError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// One blocking request/response exchange with one replica. Callers that
/// want concurrency run calls on their own threads.
pub trait ReplicaTransport: Send + Sync {
    fn call(&self, request: Request) -> Result<Reply, TransportError>;
}

/// Opens transports to replicas named by descriptors.
pub trait Connector: Send + Sync {
    fn connect(&self, replica: &ReplicaDescriptor) -> Result<Arc<dyn ReplicaTransport>, TransportError>;
}

/// A replica in this process, called directly. It can be marked down to
/// stand in for a crashed or partitioned server.
#[derive(Debug)]
pub struct LocalReplica {
    service: Arc<ReplicaService>,
    up: AtomicBool,
}

impl LocalReplica {
    pub fn new(service: Arc<ReplicaService>) -> Self {
        LocalReplica {
            service,
            up: AtomicBool::new(true),
        }
    }

    pub fn service(&self) -> &Arc<ReplicaService> {
        &self.service
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

impl ReplicaTransport for LocalReplica {
    fn call(&self, request: Request) -> Result<Reply, TransportError> {
        if !self.up.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable {
                replica: self.service.qualifier().to_string(),
                reason: "replica is down".to_string(),
            });
        }
        Ok(self.service.handle(request))
    }
}

/// A set of in-process replicas addressed as if they were remote.
#[derive(Debug)]
pub struct LocalCluster {
    first_sequence: u64,
    replicas: Mutex<BTreeMap<String, Arc<LocalReplica>>>,
}

impl LocalCluster {
    pub fn new(first_sequence: u64) -> Self {
        LocalCluster {
            first_sequence,
            replicas: Mutex::new(BTreeMap::new()),
        }
    }

    /// Starts a replica at `address` and registers it under `service`.
    pub fn start(
        &self,
        names: &NameRegistry,
        service: &str,
        qualifier: &str,
        address: &str,
    ) -> Result<Arc<LocalReplica>, NamingError> {
        names.register(service, qualifier, address)?;
        let replica = Arc::new(LocalReplica::new(Arc::new(ReplicaService::new(
            qualifier,
            self.first_sequence,
        ))));
        info!("started local replica {} at {}", qualifier, address);
        self.replicas
            .lock()
            .insert(address.to_string(), replica.clone());
        Ok(replica)
    }

    pub fn replica(&self, address: &str) -> Option<Arc<LocalReplica>> {
        self.replicas.lock().get(address).cloned()
    }
}

impl Connector for LocalCluster {
    fn connect(&self, replica: &ReplicaDescriptor) -> Result<Arc<dyn ReplicaTransport>, TransportError> {
        match self.replica(&replica.address) {
            Some(r) => Ok(r as Arc<dyn ReplicaTransport>),
            None => Err(TransportError::Unreachable {
                replica: replica.qualifier.clone(),
                reason: format!("nothing listening at {}", replica.address),
            }),
        }
    }
}
