// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::NamingError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

/// Where one replica of a service lives.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub qualifier: String,
    pub address: String,
}

impl ReplicaDescriptor {
    pub fn new(qualifier: &str, address: &str) -> Result<Self, NamingError> {
        if qualifier.is_empty() {
            return Err(NamingError::InvalidEntry(
                "qualifier cannot be empty".to_string(),
            ));
        }
        validate_address(address)?;
        Ok(ReplicaDescriptor {
            qualifier: qualifier.to_string(),
            address: address.to_string(),
        })
    }
}

impl fmt::Display for ReplicaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.qualifier, self.address)
    }
}

/// Accepts `host:port` with a port in 1..=65535.
pub fn validate_address(address: &str) -> Result<(), NamingError> {
    let mut parts = address.split(':');
    let (host, port) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), None) => (h, p),
        _ => {
            return Err(NamingError::InvalidEntry(format!(
                "wrong address format: {}",
                address
            )))
        }
    };
    if host.is_empty() {
        return Err(NamingError::InvalidEntry(format!(
            "missing host: {}",
            address
        )));
    }
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(()),
        _ => Err(NamingError::InvalidEntry(format!(
            "not a valid port number: {}",
            port
        ))),
    }
}

/// Resolves a service name to the replicas currently serving it.
pub trait NameService: Send + Sync {
    fn lookup(
        &self,
        service: &str,
        qualifier: Option<&str>,
    ) -> Result<Vec<ReplicaDescriptor>, NamingError>;
}

/// In-memory name registry. Each service name indexes a list of entries;
/// an address may appear at most once per service.
#[derive(Debug, Default)]
pub struct NameRegistry {
    table: Mutex<BTreeMap<String, Vec<ReplicaDescriptor>>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        NameRegistry::default()
    }

    pub fn register(&self, service: &str, qualifier: &str, address: &str) -> Result<(), NamingError> {
        let entry = ReplicaDescriptor::new(qualifier, address)?;
        let mut table = self.table.lock();
        let entries = table.entry(service.to_string()).or_default();
        if entries.iter().any(|e| e.address == entry.address) {
            return Err(NamingError::AlreadyRegistered {
                service: service.to_string(),
                qualifier: qualifier.to_string(),
                address: address.to_string(),
            });
        }
        info!("registered {} as {}", service, entry);
        entries.push(entry);
        Ok(())
    }

    pub fn delete(&self, service: &str, address: &str) -> Result<(), NamingError> {
        validate_address(address)?;
        let mut table = self.table.lock();
        let not_registered = || NamingError::NotRegistered {
            service: service.to_string(),
            address: address.to_string(),
        };
        let entries = table.get_mut(service).ok_or_else(not_registered)?;
        let pos = entries
            .iter()
            .position(|e| e.address == address)
            .ok_or_else(not_registered)?;
        let removed = entries.remove(pos);
        info!("deleted {} entry {}", service, removed);
        Ok(())
    }
}

impl NameService for NameRegistry {
    fn lookup(
        &self,
        service: &str,
        qualifier: Option<&str>,
    ) -> Result<Vec<ReplicaDescriptor>, NamingError> {
        let table = self.table.lock();
        let found: Vec<ReplicaDescriptor> = match table.get(service) {
            None => Vec::new(),
            Some(entries) => entries
                .iter()
                .filter(|e| qualifier.map_or(true, |q| e.qualifier == q))
                .cloned()
                .collect(),
        };
        debug!("lookup {} {:?} found {}", service, qualifier, found.len());
        Ok(found)
    }
}
