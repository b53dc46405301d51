//! DREAM replay: the eligible-cycle index and the two-slot warm buffer

use crate::error::StoreError;
use crate::ports::PersistenceStore;
use mindcycle_core::MindMoment;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

// ============================================================
// DreamCache
// ============================================================

/// In-memory index of replayable cycle ids. Selection is one random index.
pub struct DreamCache {
    cycles: Vec<u64>,
    members: HashSet<u64>,
    rng: StdRng,
}

impl DreamCache {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic selection, for tests.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self { cycles: Vec::new(), members: HashSet::new(), rng }
    }

    /// Fetch the eligible set from the store.
    pub async fn load(store: &dyn PersistenceStore) -> Result<Self, StoreError> {
        let mut cache = Self::new();
        cache.replace(store.eligible_dream_cycles().await?);
        Ok(cache)
    }

    /// Swap in a fresh id set, deduplicated, first occurrence order kept.
    pub fn replace(&mut self, cycles: impl IntoIterator<Item = u64>) {
        self.cycles.clear();
        self.members.clear();
        for cycle in cycles {
            self.insert(cycle);
        }
    }

    /// Returns false if already present.
    pub fn insert(&mut self, cycle: u64) -> bool {
        if !self.members.insert(cycle) {
            return false;
        }
        self.cycles.push(cycle);
        true
    }

    pub fn remove(&mut self, cycle: u64) -> bool {
        if !self.members.remove(&cycle) {
            return false;
        }
        if let Some(pos) = self.cycles.iter().position(|c| *c == cycle) {
            self.cycles.swap_remove(pos);
        }
        true
    }

    pub fn contains(&self, cycle: u64) -> bool {
        self.members.contains(&cycle)
    }

    pub fn len(&self) -> usize {
        self.cycles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }

    /// Uniformly random cycle id.
    pub fn pick(&mut self) -> Option<u64> {
        if self.cycles.is_empty() {
            return None;
        }
        let i = self.rng.gen_range(0..self.cycles.len());
        Some(self.cycles[i])
    }
}

impl Default for DreamCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Hydrate one cycle for replay.
pub async fn hydrate(store: &dyn PersistenceStore, cycle: u64) -> Result<Option<MindMoment>, StoreError> {
    Ok(store.mind_moment_by_cycle(cycle).await?.map(MindMoment::into_dream))
}

// ============================================================
// DreamBuffer
// ============================================================

/// `current` is what this DREAM cycle shows; `next` is kept warm by the loader.
#[derive(Debug, Default)]
pub struct DreamBuffer {
    current: Option<MindMoment>,
    next: Option<MindMoment>,
    loading: bool,
    fresh: bool,
}

impl DreamBuffer {
    /// Buffer after the DREAM-start preload. The first cycle shows `current` as is.
    pub fn preloaded(current: Option<MindMoment>, next: Option<MindMoment>) -> Self {
        let (current, next) = match current {
            Some(c) => (Some(c), next),
            None => (next, None),
        };
        Self { current, next, loading: false, fresh: true }
    }

    pub fn current(&self) -> Option<&MindMoment> {
        self.current.as_ref()
    }

    pub fn next(&self) -> Option<&MindMoment> {
        self.next.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Claim the single load slot. False when `next` is full or a load is in flight.
    pub fn begin_load(&mut self) -> bool {
        if self.loading || self.next.is_some() {
            return false;
        }
        self.loading = true;
        true
    }

    /// Release the load slot, filling `next` if the load produced something.
    /// A failed load (None) keeps both slots as they were.
    pub fn finish_load(&mut self, loaded: Option<MindMoment>) {
        self.loading = false;
        if let Some(m) = loaded {
            if self.current.is_none() {
                self.current = Some(m);
            } else {
                self.next = Some(m);
            }
        }
    }

    /// Called at each DREAM cycle start. Rotates `next` in when there is one,
    /// otherwise `current` repeats.
    pub fn advance(&mut self) -> Option<&MindMoment> {
        if std::mem::take(&mut self.fresh) && self.current.is_some() {
            return self.current.as_ref();
        }
        if let Some(next) = self.next.take() {
            self.current = Some(next);
        }
        self.current.as_ref()
    }
}
