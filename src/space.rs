// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Pattern, StoreError};
use im::Vector;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a client for the purpose of attributing reservations. Drawn at
/// random once per client and kept for the lifetime of its take loops.
#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ClientId(pub u32);

impl ClientId {
    pub fn random() -> Self {
        ClientId(rand::thread_rng().gen_range(1..=i32::MAX as u32))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One stored tuple and the client currently holding it, if any.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Entry {
    pub value: String,
    pub holder: Option<ClientId>,
}

/// `TupleSpace` is the plain state of one replica: a multiset of tuples in
/// insertion order, each with at most one reservation holder. It does no
/// locking and never blocks; `ReplicaStore` wraps it for concurrent use, and
/// the model checker explores it directly, which is why it is `Clone + Hash`
/// and backed by a persistent vector.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct TupleSpace {
    entries: Vector<Entry>,
}

impl TupleSpace {
    pub fn new() -> Self {
        TupleSpace::default()
    }

    pub fn insert(&mut self, tuple: String) {
        self.entries.push_back(Entry {
            value: tuple,
            holder: None,
        });
    }

    /// First tuple matching `pattern`, held or not.
    pub fn find(&self, pattern: &Pattern) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| pattern.matches(&e.value))
            .map(|e| e.value.as_str())
    }

    /// Removes and returns the first unreserved tuple matching `pattern`.
    pub fn remove_first(&mut self, pattern: &Pattern) -> Option<String> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.holder.is_none() && pattern.matches(&e.value))?;
        Some(self.entries.remove(pos).value)
    }

    /// Marks every unreserved tuple matching `pattern` as held by `client`
    /// and returns their values in store order, along with any matching
    /// tuples `client` already held here from an abandoned attempt.
    pub fn reserve(&mut self, pattern: &Pattern, client: ClientId) -> Vec<String> {
        let mut reserved = Vec::new();
        for e in self.entries.iter_mut() {
            let free = e.holder.map_or(true, |h| h == client);
            if free && pattern.matches(&e.value) {
                e.holder = Some(client);
                reserved.push(e.value.clone());
            }
        }
        reserved
    }

    /// Unlocks everything `client` holds; returns how many tuples that was.
    pub fn release(&mut self, client: ClientId) -> usize {
        let mut released = 0;
        for e in self.entries.iter_mut() {
            if e.holder == Some(client) {
                e.holder = None;
                released += 1;
            }
        }
        released
    }

    /// Removes one copy of `tuple` held by `client`, then unlocks anything
    /// else that client still holds here.
    pub fn commit(&mut self, tuple: &str, client: ClientId) -> Result<(), StoreError> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.holder == Some(client) && e.value == tuple)
            .ok_or_else(|| StoreError::NotHolder {
                tuple: tuple.to_string(),
                client,
            })?;
        self.entries.remove(pos);
        self.release(client);
        Ok(())
    }

    /// Holders of every copy of `tuple`, in store order.
    pub fn holders(&self, tuple: &str) -> Vec<Option<ClientId>> {
        self.entries
            .iter()
            .filter(|e| e.value == tuple)
            .map(|e| e.holder)
            .collect()
    }

    pub fn values(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.value.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(tuples: &[&str]) -> TupleSpace {
        let mut s = TupleSpace::new();
        for t in tuples {
            s.insert(t.to_string());
        }
        s
    }

    fn pat(s: &str) -> Pattern {
        Pattern::parse(s).unwrap()
    }

    #[test]
    fn reserve_skips_held_tuples() {
        let mut s = space(&["<a,1>", "<b,1>", "<a,2>"]);
        let p = pat("<a,[0-9]+>");
        assert_eq!(s.reserve(&p, ClientId(5)), vec!["<a,1>", "<a,2>"]);
        assert!(s.reserve(&p, ClientId(7)).is_empty());
        assert_eq!(s.holders("<a,1>"), vec![Some(ClientId(5))]);
        assert_eq!(s.holders("<b,1>"), vec![None]);
    }

    #[test]
    fn reserve_returns_own_earlier_holdings() {
        let mut s = space(&["<a,1>", "<a,2>"]);
        s.reserve(&pat("<a,1>"), ClientId(5));
        assert_eq!(s.reserve(&pat("<a,.>"), ClientId(5)), vec!["<a,1>", "<a,2>"]);
        assert!(s.reserve(&pat("<a,.>"), ClientId(7)).is_empty());
    }

    #[test]
    fn duplicates_are_reserved_separately() {
        let mut s = space(&["<a>", "<a>"]);
        assert_eq!(s.reserve(&pat("<a>"), ClientId(1)).len(), 2);
        s.commit("<a>", ClientId(1)).unwrap();
        // The other copy was unlocked by the commit.
        assert_eq!(s.holders("<a>"), vec![None]);
    }

    #[test]
    fn commit_requires_holding() {
        let mut s = space(&["<a,1>"]);
        s.reserve(&pat("<a,1>"), ClientId(5));
        assert_eq!(
            s.commit("<a,1>", ClientId(7)),
            Err(StoreError::NotHolder {
                tuple: "<a,1>".into(),
                client: ClientId(7)
            })
        );
        assert_eq!(s.values(), vec!["<a,1>"]);
        s.commit("<a,1>", ClientId(5)).unwrap();
        assert!(s.is_empty());
    }

    #[test]
    fn commit_releases_leftover_reservations() {
        let mut s = space(&["<a,1>", "<a,2>", "<a,3>"]);
        s.reserve(&pat("<a,.*>"), ClientId(2));
        s.commit("<a,2>", ClientId(2)).unwrap();
        assert_eq!(s.values(), vec!["<a,1>", "<a,3>"]);
        assert_eq!(s.holders("<a,1>"), vec![None]);
        assert_eq!(s.holders("<a,3>"), vec![None]);
    }

    #[test]
    fn release_is_idempotent() {
        let mut s = space(&["<a>"]);
        assert_eq!(s.release(ClientId(9)), 0);
        s.reserve(&pat("<a>"), ClientId(9));
        assert_eq!(s.release(ClientId(9)), 1);
        assert_eq!(s.release(ClientId(9)), 0);
    }

    #[test]
    fn remove_first_ignores_reserved() {
        let mut s = space(&["<a,1>", "<a,2>"]);
        s.reserve(&pat("<a,1>"), ClientId(1));
        assert_eq!(s.remove_first(&pat("<a,.>")), Some("<a,2>".to_string()));
        assert_eq!(s.remove_first(&pat("<a,.>")), None);
        assert_eq!(s.find(&pat("<a,.>")), Some("<a,1>"));
    }
}
