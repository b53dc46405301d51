//! Mindcycle Engine - the fixed-cadence consciousness cycle
//!
//! Architecture:
//! - PhaseClock: virtual clock stepping PERCEPTS → SPOOL → SIGILIN → SIGILHOLD → SIGILOUT → RESET
//! - LIVE: percepts aggregate during PERCEPTS; at the SPOOL boundary they are dumped into a
//!   background cognition run whose result is shown one cycle later (CycleBuffer)
//! - DREAM: persisted moments replayed from a warm two-slot buffer (DreamBuffer) fed by an
//!   in-memory id index (DreamCache), with their percepts re-dispersed over PERCEPTS
//! - CycleEngine: single actor task owning all of the above; EngineHandle talks to it

pub mod aggregator;
pub mod broadcast;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod dispersal;
pub mod dream;
pub mod engine;
pub mod error;
pub mod noop;
pub mod observers;
pub mod pipeline;
pub mod ports;
pub mod prompts;
pub mod response;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use engine::{Collaborators, CycleEngine, EngineHandle, EngineStatus};
pub use error::{EngineError, PipelineError, RenderError, StoreError};
