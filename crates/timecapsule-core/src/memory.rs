//! In-process backend with sorted-set semantics.
//!
//! The second of the two interchangeable transports, and the hermetic one:
//! digger tests run against it without any external store. Entries are
//! ordered by `(score, member)`, so `pop_min` matches the external store's
//! selection order. Clones share the same underlying set, the way two client
//! handles share one server — several stores (and several diggers) built
//! over clones of one `MemoryBackend` poll the same logical queue.
//!
//! Like its external counterpart, the probe and the pop each take the lock
//! separately, so the premature-pop race of the dig protocol is real here
//! too, not locked away.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::Result;
use crate::store::{Backend, CapsuleStore};

/// A [`CapsuleStore`] over the in-process transport.
pub type MemoryStore<P> = CapsuleStore<P, MemoryBackend>;

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<Mutex<BTreeSet<(i64, String)>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently buried.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// All `(score, member)` entries in score order. Diagnostic only.
    pub fn entries(&self) -> Vec<(i64, String)> {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<(i64, String)>> {
        self.entries.lock().expect("memory backend poisoned")
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, score: i64, member: &str) -> Result<()> {
        let mut entries = self.lock();
        // Insert-or-update on the member, mirroring sorted-set semantics.
        entries.retain(|(_, m)| m != member);
        entries.insert((score, member.to_owned()));
        Ok(())
    }

    async fn any_due(&self, max_score: i64) -> Result<bool> {
        // The set is ordered by score, so the first entry is the minimum.
        Ok(self
            .lock()
            .first()
            .is_some_and(|(score, _)| *score <= max_score))
    }

    async fn pop_min(&self) -> Result<Option<(i64, String)>> {
        Ok(self.lock().pop_first())
    }

    async fn remove(&self, member: &str) -> Result<()> {
        self.lock().retain(|(_, m)| m != member);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }
}
