//! Percept accumulation for the PERCEPTS phase

use mindcycle_core::{Modality, Percept};

/// Accumulates percepts until the PERCEPTS→SPOOL boundary.
#[derive(Debug, Default)]
pub struct PerceptAggregator {
    percepts: Vec<Percept>,
}

impl PerceptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, percept: Percept) {
        self.percepts.push(percept);
    }

    pub fn len(&self) -> usize {
        self.percepts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.percepts.is_empty()
    }

    /// Take everything accumulated so far, leaving the aggregator empty.
    pub fn dump(&mut self) -> PerceptSnapshot {
        PerceptSnapshot::from_percepts(std::mem::take(&mut self.percepts))
    }
}

/// Percepts of one cycle, split by modality, arrival order preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerceptSnapshot {
    pub visual: Vec<Percept>,
    pub audio: Vec<Percept>,
}

impl PerceptSnapshot {
    pub fn from_percepts(percepts: Vec<Percept>) -> Self {
        let (visual, audio) = percepts
            .into_iter()
            .partition(|p| p.modality == Modality::Visual);
        Self { visual, audio }
    }

    pub fn len(&self) -> usize {
        self.visual.len() + self.audio.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
