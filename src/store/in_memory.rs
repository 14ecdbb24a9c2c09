//! In-memory implementation of the queue store.
//!
//! Suitable for tests and single-process deployments; contents are lost on
//! restart. Requests are held as live objects, so hooks attached by the
//! producer survive the trip through staging and domain buckets.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};

use parking_lot::RwLock;

use crate::error::Result;
use crate::request::FetchRequest;

use super::QueueStore;

/// Priority-queue entry ordered by score, then member name for
/// deterministic ties.
#[derive(Debug, Clone)]
struct Entry {
    score: f64,
    member: String,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.member.cmp(&other.member))
    }
}

#[derive(Default)]
struct Zset {
    entries: BTreeSet<Entry>,
    scores: HashMap<String, f64>,
}

impl Zset {
    fn push(&mut self, member: &str, score: f64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.entries.remove(&Entry {
                score: old,
                member: member.to_string(),
            });
        }
        self.entries.insert(Entry {
            score,
            member: member.to_string(),
        });
    }

    fn push_if_absent(&mut self, member: &str, score: f64) -> bool {
        if self.scores.contains_key(member) {
            return false;
        }
        self.push(member, score);
        true
    }

    fn peek(&self) -> Option<(String, f64)> {
        self.entries.first().map(|e| (e.member.clone(), e.score))
    }

    fn pop(&mut self) -> Option<String> {
        let entry = self.entries.pop_first()?;
        self.scores.remove(&entry.member);
        Some(entry.member)
    }
}

#[derive(Default)]
struct Inner {
    fifos: HashMap<String, VecDeque<FetchRequest>>,
    priorities: HashMap<String, Zset>,
}

/// In-memory [`QueueStore`].
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for InMemoryStore {
    fn fifo_push(&self, name: &str, req: FetchRequest) -> Result<()> {
        self.inner
            .write()
            .fifos
            .entry(name.to_string())
            .or_default()
            .push_back(req);
        Ok(())
    }

    fn fifo_pop(&self, name: &str) -> Result<Option<FetchRequest>> {
        Ok(self
            .inner
            .write()
            .fifos
            .get_mut(name)
            .and_then(VecDeque::pop_front))
    }

    fn fifo_len(&self, name: &str) -> Result<usize> {
        Ok(self.inner.read().fifos.get(name).map_or(0, VecDeque::len))
    }

    fn priority_push(&self, name: &str, member: &str, score: f64) -> Result<()> {
        self.inner
            .write()
            .priorities
            .entry(name.to_string())
            .or_default()
            .push(member, score);
        Ok(())
    }

    fn priority_push_if_absent(&self, name: &str, member: &str, score: f64) -> Result<bool> {
        Ok(self
            .inner
            .write()
            .priorities
            .entry(name.to_string())
            .or_default()
            .push_if_absent(member, score))
    }

    fn priority_peek(&self, name: &str) -> Result<Option<(String, f64)>> {
        Ok(self.inner.read().priorities.get(name).and_then(Zset::peek))
    }

    fn priority_pop(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .write()
            .priorities
            .get_mut(name)
            .and_then(Zset::pop))
    }

    fn priority_len(&self, name: &str) -> Result<usize> {
        Ok(self
            .inner
            .read()
            .priorities
            .get(name)
            .map_or(0, |z| z.entries.len()))
    }

    fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let inner = self.inner.read();
        let mut keys: Vec<String> = inner
            .fifos
            .iter()
            .filter(|(name, queue)| name.starts_with(prefix) && !queue.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
