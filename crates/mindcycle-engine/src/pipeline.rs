//! CognitionPipeline - one LIVE cycle's background work
//!
//! context fetch → LLM → parse → persist (text) → sigil → rasterize → persist (art)
//!
//! Only the LLM stage can fail the run. Every later stage degrades: a store
//! failure leaves the moment without an id, a render failure leaves it without art.

use crate::aggregator::PerceptSnapshot;
use crate::config::LiveConfig;
use crate::error::{PipelineError, RenderError};
use crate::ports::{PersistenceStore, Rasterizer, SigilRenderer};
use crate::{prompts, response};
use chrono::Utc;
use mindcycle_core::{MindMoment, Origin, SigilArt};
use mindcycle_llm::LlmProvider;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A completed run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub moment: MindMoment,
    /// Art was rendered and written against the stored id.
    pub art_persisted: bool,
}

impl PipelineOutput {
    /// Replayable in DREAM without a cache refresh.
    pub fn is_dream_eligible(&self) -> bool {
        self.art_persisted && self.moment.is_dream_eligible()
    }
}

pub struct CognitionPipeline {
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn PersistenceStore>,
    renderer: Arc<dyn SigilRenderer>,
    rasterizer: Arc<dyn Rasterizer>,
    config: LiveConfig,
}

impl CognitionPipeline {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        store: Arc<dyn PersistenceStore>,
        renderer: Arc<dyn SigilRenderer>,
        rasterizer: Arc<dyn Rasterizer>,
        config: LiveConfig,
    ) -> Self {
        Self { llm, store, renderer, rasterizer, config }
    }

    pub async fn run(
        &self,
        cycle: u64,
        snapshot: PerceptSnapshot,
        cancel: CancellationToken,
    ) -> Result<PipelineOutput, PipelineError> {
        debug!("Cycle {}: thinking over {} percepts", cycle, snapshot.len());

        let context = match self.store.prior_moments(self.config.prior_context).await {
            Ok(moments) => moments,
            Err(e) => {
                warn!("Cycle {}: prior context unavailable ({}), thinking without it", cycle, e);
                Vec::new()
            }
        };

        let request = prompts::build_request(&self.config, cycle, &snapshot, &context);
        let raw = self.llm.generate(request, Some(cancel)).await?;
        let thought = response::parse_response(&raw)?;

        let mut moment = MindMoment {
            id: None,
            cycle,
            text: thought.text,
            essence_phrase: thought.essence_phrase,
            mood: thought.mood,
            visual_percepts: snapshot.visual,
            audio_percepts: snapshot.audio,
            prior_moment_refs: context.iter().map(|m| m.cycle).collect(),
            art: None,
            sound_brief: thought.sound_brief,
            origin: Origin::Live,
            timestamp: Utc::now(),
        };

        match self.store.insert_mind_moment(&moment).await {
            Ok(id) => moment.id = Some(id),
            Err(e) => warn!("Cycle {}: moment not persisted: {}", cycle, e),
        }

        let mut art_persisted = false;
        if let Some(phrase) = moment.essence_phrase.clone() {
            match self.render(&phrase).await {
                Ok(art) => {
                    if let Some(id) = &moment.id {
                        match self.store.update_mind_moment_art(id, &art).await {
                            Ok(()) => art_persisted = true,
                            Err(e) => warn!("Cycle {}: art not persisted: {}", cycle, e),
                        }
                    }
                    moment.art = Some(art);
                }
                Err(e) => warn!("Cycle {}: sigil for {:?} failed, staying text-only: {}", cycle, phrase, e),
            }
        }

        info!(
            "Cycle {}: moment ready (stored={}, art={})",
            cycle,
            moment.id.is_some(),
            moment.has_art()
        );
        Ok(PipelineOutput { moment, art_persisted })
    }

    async fn render(&self, phrase: &str) -> Result<SigilArt, RenderError> {
        let commands = self.renderer.generate(phrase).await?;
        self.rasterizer.render(&commands).await
    }
}
