// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::ClientError;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Hands out globally increasing sequence numbers, one per mutating request.
pub trait Sequencer: Send + Sync {
    fn next_sequence(&self) -> Result<u64, ClientError>;
}

/// A sequencer living in this process. Each instance owns its own counter.
#[derive(Debug)]
pub struct LocalSequencer {
    next: AtomicU64,
}

impl LocalSequencer {
    pub fn new(first: u64) -> Self {
        LocalSequencer {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for LocalSequencer {
    fn default() -> Self {
        LocalSequencer::new(1)
    }
}

impl Sequencer for LocalSequencer {
    fn next_sequence(&self) -> Result<u64, ClientError> {
        let seq = self.next.fetch_add(1, Ordering::SeqCst);
        trace!("issued sequence #{}", seq);
        Ok(seq)
    }
}
