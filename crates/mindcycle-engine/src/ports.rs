//! Collaborator seams: persistence, sigil rendering, rasterization, broadcast
//!
//! The engine only ever holds these as `Arc<dyn _>`.

use crate::error::{RenderError, StoreError};
use async_trait::async_trait;
use mindcycle_core::{MindMoment, MomentId, Percept, PhaseEvent, SigilArt};
use serde::{Deserialize, Serialize};

/// Relational store of mind moments.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Persist a text-complete moment (art null). Returns the store id.
    async fn insert_mind_moment(&self, moment: &MindMoment) -> Result<MomentId, StoreError>;

    /// Attach rendered art to a previously inserted moment.
    async fn update_mind_moment_art(&self, id: &MomentId, art: &SigilArt) -> Result<(), StoreError>;

    /// Most recent moments first, at most `limit`.
    async fn prior_moments(&self, limit: usize) -> Result<Vec<MindMoment>, StoreError>;

    /// Cycles with rendered art and at least one percept.
    async fn eligible_dream_cycles(&self) -> Result<Vec<u64>, StoreError>;

    async fn mind_moment_by_cycle(&self, cycle: u64) -> Result<Option<MindMoment>, StoreError>;

    /// Highest persisted cycle, if any.
    async fn latest_cycle(&self) -> Result<Option<u64>, StoreError>;
}

/// Drawing program produced for an essence phrase. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawingCommands {
    pub phrase: String,
    pub program: String,
}

/// Raster output. Same shape the moment stores.
pub type RasterImage = SigilArt;

#[async_trait]
pub trait SigilRenderer: Send + Sync {
    async fn generate(&self, phrase: &str) -> Result<DrawingCommands, RenderError>;
}

#[async_trait]
pub trait Rasterizer: Send + Sync {
    async fn render(&self, commands: &DrawingCommands) -> Result<RasterImage, RenderError>;
}

/// Fire-and-forget fan-out to display clients.
pub trait Broadcaster: Send + Sync {
    fn publish_phase(&self, event: &PhaseEvent);
    fn publish_moment(&self, moment: &MindMoment);
    fn publish_percept(&self, percept: &Percept, replayed: bool);
}
