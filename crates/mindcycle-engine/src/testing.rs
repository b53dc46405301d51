//! Deterministic collaborators for exercising the engine without a network,
//! a database or a renderer.

use crate::config::MindcycleConfig;
use crate::engine::Collaborators;
use crate::error::{RenderError, StoreError};
use crate::ports::{Broadcaster, DrawingCommands, PersistenceStore, RasterImage, Rasterizer, SigilRenderer};
use crate::store::MemoryStore;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use mindcycle_core::{MindMoment, MomentId, Modality, Percept, PhaseEvent, SigilArt};
use mindcycle_llm::{CancellationToken, LlmError, LlmProvider, LlmRequest, LlmResult, LlmStream, StreamDelta};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================
// LLM
// ============================================================

/// One scripted completion.
#[derive(Clone, Debug)]
pub enum Reply {
    Text(String),
    Error(String),
    /// Text delivered after a (virtual) delay. Cancellation ends the wait.
    Delayed(Duration, String),
}

/// Each call pops the next reply; when the script runs out the default repeats.
pub struct ScriptedLlm {
    script: Mutex<VecDeque<Reply>>,
    default: Reply,
    requests: Mutex<Vec<LlmRequest>>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn constant(reply: Reply) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: reply,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn replying(text: impl Into<String>) -> Self {
        Self::constant(Reply::Text(text.into()))
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::constant(Reply::Error(message.into()))
    }

    /// Replies consumed in order, then `default`.
    pub fn sequence(replies: Vec<Reply>, default: Reply) -> Self {
        let llm = Self::constant(default);
        *lock(&llm.script) = replies.into();
        llm
    }

    pub fn push(&self, reply: Reply) {
        lock(&self.script).push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        lock(&self.requests).clone()
    }

    fn next_reply(&self) -> Reply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.script).pop_front().unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    fn models(&self) -> &[&str] {
        &["scripted"]
    }

    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    async fn complete_stream(
        &self,
        request: LlmRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<LlmStream> {
        lock(&self.requests).push(request);
        let text = match self.next_reply() {
            Reply::Text(text) => text,
            Reply::Error(message) => return Err(LlmError::RequestFailed(message)),
            Reply::Delayed(delay, text) => {
                let cancel = cancel.unwrap_or_default();
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                    _ = tokio::time::sleep(delay) => text,
                }
            }
        };
        let deltas = vec![
            Ok(StreamDelta::Text(text)),
            Ok(StreamDelta::Done { stop_reason: Some("end_turn".into()), usage: None }),
        ];
        Ok(Box::pin(futures::stream::iter(deltas)))
    }
}

/// A well-formed reply for `text`, with an essence phrase so art gets rendered.
pub fn json_reply(text: &str) -> String {
    serde_json::json!({
        "mindMoment": text,
        "essencePhrase": format!("sigil of {}", text),
        "mood": { "valence": 0.2, "arousal": 0.5 },
    })
    .to_string()
}

// ============================================================
// Store
// ============================================================

/// MemoryStore with switchable read and write failures and a slow dream listing.
pub struct FaultyStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    inserts: AtomicUsize,
    listing_delay: Mutex<Duration>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::wrap(MemoryStore::new())
    }

    pub fn wrap(inner: MemoryStore) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            inserts: AtomicUsize::new(0),
            listing_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every `eligible_dream_cycles` call sleeps this long first.
    pub fn slow_listing(&self, delay: Duration) {
        *lock(&self.listing_delay) = delay;
    }

    /// Successful inserts so far.
    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

impl Default for FaultyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceStore for FaultyStore {
    async fn insert_mind_moment(&self, moment: &MindMoment) -> Result<MomentId, StoreError> {
        self.check_write()?;
        let id = self.inner.insert_mind_moment(moment).await?;
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn update_mind_moment_art(&self, id: &MomentId, art: &SigilArt) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.update_mind_moment_art(id, art).await
    }

    async fn prior_moments(&self, limit: usize) -> Result<Vec<MindMoment>, StoreError> {
        self.check_read()?;
        self.inner.prior_moments(limit).await
    }

    async fn eligible_dream_cycles(&self) -> Result<Vec<u64>, StoreError> {
        let delay = *lock(&self.listing_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_read()?;
        self.inner.eligible_dream_cycles().await
    }

    async fn mind_moment_by_cycle(&self, cycle: u64) -> Result<Option<MindMoment>, StoreError> {
        self.check_read()?;
        self.inner.mind_moment_by_cycle(cycle).await
    }

    async fn latest_cycle(&self) -> Result<Option<u64>, StoreError> {
        self.check_read()?;
        self.inner.latest_cycle().await
    }
}

// ============================================================
// Renderer
// ============================================================

/// Renders every phrase to a tiny raster, or fails on demand.
#[derive(Default)]
pub struct StubRenderer {
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl StubRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Sigil generation attempts.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SigilRenderer for StubRenderer {
    async fn generate(&self, phrase: &str) -> Result<DrawingCommands, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RenderError::Generation(format!("cannot draw {:?}", phrase)));
        }
        Ok(DrawingCommands { phrase: phrase.to_string(), program: format!("stroke({:?})", phrase) })
    }
}

#[async_trait]
impl Rasterizer for StubRenderer {
    async fn render(&self, commands: &DrawingCommands) -> Result<RasterImage, RenderError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RenderError::Rasterize("stub rasterizer failing".into()));
        }
        Ok(SigilArt { width: 2, height: 2, bytes: commands.program.as_bytes().to_vec() })
    }
}

// ============================================================
// Broadcaster
// ============================================================

#[derive(Clone, Debug)]
pub enum Published {
    Phase(PhaseEvent),
    Moment(MindMoment),
    Percept { percept: Percept, replayed: bool },
}

/// Remembers every publication with the (virtual) instant it happened.
#[derive(Default)]
pub struct RecordingBroadcaster {
    log: Mutex<Vec<(Instant, Published)>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(Instant, Published)> {
        lock(&self.log).clone()
    }

    pub fn phases(&self) -> Vec<(Instant, PhaseEvent)> {
        self.events()
            .into_iter()
            .filter_map(|(at, p)| match p {
                Published::Phase(e) => Some((at, e)),
                _ => None,
            })
            .collect()
    }

    pub fn moments(&self) -> Vec<MindMoment> {
        self.events()
            .into_iter()
            .filter_map(|(_, p)| match p {
                Published::Moment(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn percepts(&self) -> Vec<(Instant, Percept, bool)> {
        self.events()
            .into_iter()
            .filter_map(|(at, p)| match p {
                Published::Percept { percept, replayed } => Some((at, percept, replayed)),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.log).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.log).clear();
    }

    fn record(&self, p: Published) {
        lock(&self.log).push((Instant::now(), p));
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn publish_phase(&self, event: &PhaseEvent) {
        self.record(Published::Phase(event.clone()));
    }

    fn publish_moment(&self, moment: &MindMoment) {
        self.record(Published::Moment(moment.clone()));
    }

    fn publish_percept(&self, percept: &Percept, replayed: bool) {
        self.record(Published::Percept { percept: percept.clone(), replayed });
    }
}

// ============================================================
// Fixtures
// ============================================================

/// Config with a one-second cycle: 400/100/100/200/100/100 ms, loader every 50 ms.
pub fn fast_config() -> MindcycleConfig {
    let mut config = MindcycleConfig::default();
    config.cycle.percepts_ms = 400;
    config.cycle.spool_ms = 100;
    config.cycle.sigil_in_ms = 100;
    config.cycle.sigil_hold_ms = 200;
    config.cycle.sigil_out_ms = 100;
    config.cycle.reset_ms = 100;
    config.dream.loader_poll_ms = 50;
    config
}

/// A replayable historical moment whose percepts were captured at the given
/// second offsets (visual at even positions, audio at odd).
pub fn dream_moment(cycle: u64, percept_secs: &[i64]) -> MindMoment {
    let base = 1_700_000_000 + cycle as i64 * 60;
    let mut m = MindMoment::text_only(cycle, format!("remembered {}", cycle));
    m.essence_phrase = Some(format!("echo {}", cycle));
    m.art = Some(SigilArt { width: 2, height: 2, bytes: vec![cycle as u8; 4] });
    for (i, secs) in percept_secs.iter().enumerate() {
        let at = Utc.timestamp_opt(base + secs, 0).single().unwrap_or_else(Utc::now);
        let modality = if i % 2 == 0 { Modality::Visual } else { Modality::Audio };
        let p = Percept::new(modality, serde_json::json!(format!("p{}-{}", cycle, i)), at);
        match modality {
            Modality::Visual => m.visual_percepts.push(p),
            Modality::Audio => m.audio_percepts.push(p),
        }
    }
    m
}

/// Every double, wired together.
pub struct Harness {
    pub llm: Arc<ScriptedLlm>,
    pub store: Arc<FaultyStore>,
    pub renderer: Arc<StubRenderer>,
    pub broadcaster: Arc<RecordingBroadcaster>,
}

impl Harness {
    pub fn new(llm: ScriptedLlm, store: MemoryStore) -> Self {
        Self {
            llm: Arc::new(llm),
            store: Arc::new(FaultyStore::wrap(store)),
            renderer: Arc::new(StubRenderer::new()),
            broadcaster: Arc::new(RecordingBroadcaster::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            llm: self.llm.clone(),
            store: self.store.clone(),
            renderer: self.renderer.clone(),
            rasterizer: self.renderer.clone(),
            broadcaster: self.broadcaster.clone(),
        }
    }
}
