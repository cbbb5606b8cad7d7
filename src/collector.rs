// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::ClientError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug)]
struct Collected<T> {
    responses: Vec<T>,
    failures: Vec<ClientError>,
    outstanding: usize,
}

/// `ResponseCollector` is where asynchronous per-replica replies meet the
/// thread that is waiting on them. Callbacks record into it from any thread;
/// the waiting thread blocks in one of two modes:
///
///   - `await_count(n)` until `n` replies (successes plus failures) arrived;
///   - `await_task_completion()` until the outstanding-task counter set with
///     `set_task_count` drops to zero. Every recorded reply, failure or not,
///     decrements it once.
///
/// The collector never interprets failures. Callers check `first_failure()`
/// after waiting and treat any failure as failure of the whole fan-out.
#[derive(Debug)]
pub struct ResponseCollector<T> {
    inner: Mutex<Collected<T>>,
    arrived: Condvar,
}

impl<T> Default for ResponseCollector<T> {
    fn default() -> Self {
        ResponseCollector {
            inner: Mutex::new(Collected {
                responses: Vec::new(),
                failures: Vec::new(),
                outstanding: 0,
            }),
            arrived: Condvar::new(),
        }
    }
}

impl<T: Clone + Send + 'static> ResponseCollector<T> {
    pub fn new() -> Self {
        ResponseCollector::default()
    }

    pub fn record(&self, response: T) {
        let mut c = self.inner.lock();
        c.responses.push(response);
        c.outstanding = c.outstanding.saturating_sub(1);
        self.arrived.notify_all();
    }

    pub fn record_failure(&self, error: ClientError) {
        trace!("collector recorded failure: {}", error);
        let mut c = self.inner.lock();
        c.failures.push(error);
        c.outstanding = c.outstanding.saturating_sub(1);
        self.arrived.notify_all();
    }

    /// A one-shot completion callback feeding this collector.
    pub fn callback(self: &Arc<Self>) -> impl FnOnce(Result<T, ClientError>) + Send + 'static {
        let collector = self.clone();
        move |outcome| match outcome {
            Ok(r) => collector.record(r),
            Err(e) => collector.record_failure(e),
        }
    }

    pub fn set_task_count(&self, n: usize) {
        self.inner.lock().outstanding = n;
    }

    pub fn await_count(&self, n: usize) {
        let mut c = self.inner.lock();
        while c.responses.len() + c.failures.len() < n {
            self.arrived.wait(&mut c);
        }
    }

    pub fn await_task_completion(&self) {
        let mut c = self.inner.lock();
        while c.outstanding > 0 {
            self.arrived.wait(&mut c);
        }
    }

    pub fn responses(&self) -> Vec<T> {
        self.inner.lock().responses.clone()
    }

    /// The first recorded failure, if the fan-out had any.
    pub fn first_failure(&self) -> Option<ClientError> {
        self.inner.lock().failures.first().cloned()
    }
}
