// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{ClientError, ClientId, StoreError, TransportError};
use serde::{Deserialize, Serialize};

/// Requests are the procedures every replica exposes. Each is answered by
/// exactly one `Response` of the matching kind, or by a `StoreError`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Request {
    Put { tuple: String },
    Read { pattern: String },
    TakePhase1 { pattern: String, client_id: ClientId },
    TakePhase1Release { client_id: ClientId },
    TakePhase2 { tuple: String, client_id: ClientId },
    GetState,
    SequencedPut { tuple: String, seq: u64 },
    SequencedTake { pattern: String, seq: u64 },
}

impl Request {
    pub fn procedure(&self) -> &'static str {
        match self {
            Request::Put { .. } => "put",
            Request::Read { .. } => "read",
            Request::TakePhase1 { .. } => "take phase 1",
            Request::TakePhase1Release { .. } => "take phase 1 release",
            Request::TakePhase2 { .. } => "take phase 2",
            Request::GetState => "get state",
            Request::SequencedPut { .. } => "sequenced put",
            Request::SequencedTake { .. } => "sequenced take",
        }
    }

    /// True for the operations that change replica state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Request::Read { .. } | Request::GetState)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Response {
    Put,
    Read { result: String },
    TakePhase1 { reserved_tuples: Vec<String> },
    TakePhase1Release,
    TakePhase2,
    GetState { tuples: Vec<String> },
    SequencedPut,
    SequencedTake { result: String },
}

/// What a replica sends back for one request.
pub type Reply = Result<Response, StoreError>;

impl Response {
    fn mismatch(&self, replica: &str, wanted: &str) -> ClientError {
        ClientError::Transport(TransportError::Protocol {
            replica: replica.to_string(),
            reason: format!("expected {} reply, got {:?}", wanted, self),
        })
    }

    /// Unwraps an acknowledgement-only reply.
    pub fn into_ack(self, replica: &str) -> Result<(), ClientError> {
        match self {
            Response::Put
            | Response::TakePhase1Release
            | Response::TakePhase2
            | Response::SequencedPut => Ok(()),
            other => Err(other.mismatch(replica, "acknowledgement")),
        }
    }

    /// Unwraps a reply carrying one tuple (read or sequenced take).
    pub fn into_tuple(self, replica: &str) -> Result<String, ClientError> {
        match self {
            Response::Read { result } | Response::SequencedTake { result } => Ok(result),
            other => Err(other.mismatch(replica, "tuple")),
        }
    }

    pub fn into_reserved(self, replica: &str) -> Result<Vec<String>, ClientError> {
        match self {
            Response::TakePhase1 { reserved_tuples } => Ok(reserved_tuples),
            other => Err(other.mismatch(replica, "take phase 1")),
        }
    }

    pub fn into_state(self, replica: &str) -> Result<Vec<String>, ClientError> {
        match self {
            Response::GetState { tuples } => Ok(tuples),
            other => Err(other.mismatch(replica, "get state")),
        }
    }
}
