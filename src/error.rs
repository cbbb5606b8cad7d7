// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Error taxonomy for replicas, transports and clients.

use crate::ClientId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors a replica raises. These cross the wire intact, so they are
/// serializable and carry only owned, plain data.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum StoreError {
    #[error("invalid tuple: {0}")]
    InvalidTuple(String),

    #[error("invalid search pattern: {0}")]
    InvalidPattern(String),

    /// Phase 2 named a tuple the client does not hold on this replica.
    #[error("client {client} does not hold a reservation on {tuple}")]
    NotHolder { tuple: String, client: ClientId },

    /// A sequenced operation arrived with a number the replica already applied.
    #[error("sequence number {seq} already applied (next expected {next})")]
    StaleSequence { seq: u64, next: u64 },
}

impl StoreError {
    /// Validation errors are the caller's fault and are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidTuple(_) | Self::InvalidPattern(_))
    }
}

/// Connectivity-level failure of a single RPC.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("replica {replica} unreachable: {reason}")]
    Unreachable { replica: String, reason: String },

    /// The replica answered with something that is not a reply to our request.
    #[error("replica {replica} protocol violation: {reason}")]
    Protocol { replica: String, reason: String },
}

/// Errors surfaced to users of a replica set.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Input rejected locally, before anything was sent.
    #[error(transparent)]
    Invalid(StoreError),

    /// A replica answered the request with an error.
    #[error("replica {replica} rejected request: {source}")]
    Rejected { replica: String, source: StoreError },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("could not acquire a tuple after {retries} retries with backoff")]
    BackoffExceeded { retries: u32 },

    #[error("no replicas available for service {service}")]
    NoReplicas { service: String },

    #[error("no replica with qualifier {0}")]
    UnknownReplica(String),

    #[error("name service failure: {0}")]
    NameService(#[from] NamingError),

    #[error("sequencer failure: {0}")]
    Sequencer(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl ClientError {
    /// Connectivity failures invalidate the current replica descriptors.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Short static label, handy for structured log fields.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid",
            Self::Rejected { .. } => "rejected",
            Self::Transport(_) => "transport",
            Self::BackoffExceeded { .. } => "backoff_exceeded",
            Self::NoReplicas { .. } => "no_replicas",
            Self::UnknownReplica(_) => "unknown_replica",
            Self::NameService(_) => "name_service",
            Self::Sequencer(_) => "sequencer",
            Self::InvalidCommand(_) => "invalid_command",
        }
    }
}

/// Name registry errors.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum NamingError {
    #[error("invalid service entry: {0}")]
    InvalidEntry(String),

    #[error("service entry {service} {qualifier} {address} already exists")]
    AlreadyRegistered {
        service: String,
        qualifier: String,
        address: String,
    },

    #[error("no service {service} registered at {address}")]
    NotRegistered { service: String, address: String },
}
