//! CycleEngine - the actor that owns the heartbeat
//!
//! One task owns every piece of engine state and multiplexes:
//! - background results (cognition runs, dream loads) reported over a channel
//! - the next deadline: phase transition or replayed percept, whichever is sooner
//! - commands from `EngineHandle`s
//! - the dream loader interval (DREAM only)
//!
//! Nothing slow runs on the tick path: LLM calls, store reads for dreams and
//! rendering happen in spawned tasks. The store is only awaited inline while
//! preparing a mode, before the clock exists. Every spawned task carries the generation
//! it was started under; anything that reports back under an older generation
//! is dropped.

use crate::aggregator::{PerceptAggregator, PerceptSnapshot};
use crate::buffer::{fallback_placeholder, CycleBuffer};
use crate::clock::{Generation, PhaseClock, PhaseSchedule, PhaseTick};
use crate::config::MindcycleConfig;
use crate::dispersal::Dispersal;
use crate::dream::{self, DreamBuffer, DreamCache};
use crate::error::{EngineError, PipelineError, StoreError};
use crate::observers::{Listener, ListenerId, ObserverRegistry};
use crate::pipeline::{CognitionPipeline, PipelineOutput};
use crate::ports::{Broadcaster, PersistenceStore, Rasterizer, SigilRenderer};
use mindcycle_core::{MindMoment, Mode, Percept, Phase, PhaseEvent};
use mindcycle_llm::LlmProvider;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const COMMAND_CAPACITY: usize = 64;

/// External collaborators the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub llm: Arc<dyn LlmProvider>,
    pub store: Arc<dyn PersistenceStore>,
    pub renderer: Arc<dyn SigilRenderer>,
    pub rasterizer: Arc<dyn Rasterizer>,
    pub broadcaster: Arc<dyn Broadcaster>,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub mode: Mode,
    pub running: bool,
    pub phase: Option<Phase>,
    /// Cycle number the clock is on (per-session in DREAM).
    pub cycle: Option<u64>,
    /// Global LIVE counter.
    pub live_cycle: u64,
    pub generation: u64,
    pub pipeline_in_flight: bool,
    pub pending_percepts: usize,
    pub dream_cache_size: usize,
    pub has_ready_moment: bool,
    pub current_dream: Option<u64>,
    pub listeners: usize,
}

enum Command {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    SwitchMode(Mode, oneshot::Sender<()>),
    Percept(Percept),
    RefreshDreams(oneshot::Sender<Result<usize, EngineError>>),
    Subscribe(Listener<MindMoment>, oneshot::Sender<ListenerId>),
    Unsubscribe(ListenerId, oneshot::Sender<bool>),
    Status(oneshot::Sender<EngineStatus>),
    Shutdown(oneshot::Sender<()>),
}

enum Background {
    Pipeline {
        generation: Generation,
        run_id: u64,
        cycle: u64,
        result: Result<PipelineOutput, PipelineError>,
    },
    DreamLoaded {
        generation: Generation,
        cycle: u64,
        result: Result<Option<MindMoment>, StoreError>,
    },
    CacheRefreshed {
        generation: Generation,
        result: Result<Vec<u64>, StoreError>,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
}

struct InFlight {
    run_id: u64,
    cycle: u64,
    handle: JoinHandle<()>,
}

pub struct CycleEngine {
    schedule: PhaseSchedule,
    loader_poll: Duration,
    collab: Collaborators,
    pipeline: Arc<CognitionPipeline>,

    mode: Mode,
    generation: Generation,
    clock: Option<PhaseClock>,
    live_cycle: u64,

    aggregator: PerceptAggregator,
    buffer: CycleBuffer,
    in_flight: Option<InFlight>,
    /// Run that finished before its result was read; its message is still queued.
    settling: Option<u64>,
    next_run_id: u64,
    listeners: ObserverRegistry<MindMoment>,

    dream_cache: DreamCache,
    dream_buffer: DreamBuffer,
    dispersal: Option<Dispersal>,

    bg_tx: mpsc::UnboundedSender<Background>,
    bg_rx: Option<mpsc::UnboundedReceiver<Background>>,
    shutdown: CancellationToken,
}

impl CycleEngine {
    /// Build a stopped engine. Hydrates the LIVE cycle counter from the store.
    pub async fn new(config: &MindcycleConfig, collab: Collaborators) -> Result<Self, EngineError> {
        let schedule = config.cycle.schedule()?;
        let live_cycle = match collab.store.latest_cycle().await {
            Ok(latest) => latest.unwrap_or(0),
            Err(e) => {
                warn!("Could not read latest cycle ({}), counting from 0", e);
                0
            }
        };
        info!(
            "Engine ready: mode={}, cycle length {:?}, last cycle {}",
            config.cycle.start_mode,
            schedule.cycle_length(),
            live_cycle
        );

        let pipeline = Arc::new(CognitionPipeline::new(
            collab.llm.clone(),
            collab.store.clone(),
            collab.renderer.clone(),
            collab.rasterizer.clone(),
            config.live.clone(),
        ));
        let (bg_tx, bg_rx) = mpsc::unbounded_channel();

        Ok(Self {
            schedule,
            loader_poll: config.dream.loader_poll(),
            collab,
            pipeline,
            mode: config.cycle.start_mode,
            generation: Generation::default(),
            clock: None,
            live_cycle,
            aggregator: PerceptAggregator::new(),
            buffer: CycleBuffer::default(),
            in_flight: None,
            settling: None,
            next_run_id: 0,
            listeners: ObserverRegistry::new(),
            dream_cache: DreamCache::new(),
            dream_buffer: DreamBuffer::default(),
            dispersal: None,
            bg_tx,
            bg_rx: Some(bg_rx),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the actor loop. The engine starts stopped; call `EngineHandle::start`.
    pub fn spawn(self) -> (EngineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let task = tokio::spawn(self.run(rx));
        (EngineHandle { tx }, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let Some(mut background) = self.bg_rx.take() else {
            error!("Engine loop started twice");
            return;
        };
        let mut loader = tokio::time::interval(self.loader_poll);
        loader.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.next_deadline();
            let dreaming = self.clock.is_some() && self.mode == Mode::Dream;

            tokio::select! {
                biased;

                Some(bg) = background.recv() => self.handle_background(bg),

                _ = sleep_until(deadline) => self.on_deadline(Instant::now()),

                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => {
                        info!("All engine handles dropped");
                        break;
                    }
                },

                _ = loader.tick(), if dreaming => self.poll_dream_loader(),
            }
        }

        self.halt();
        self.shutdown.cancel();
        info!("Engine loop stopped");
    }

    // ========================================================
    // Commands
    // ========================================================

    /// Returns false when the loop should exit.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Start(reply) => {
                self.start().await;
                let _ = reply.send(());
            }
            Command::Stop(reply) => {
                self.halt();
                let _ = reply.send(());
            }
            Command::SwitchMode(mode, reply) => {
                self.switch_mode(mode).await;
                let _ = reply.send(());
            }
            Command::Percept(percept) => self.on_percept(percept),
            Command::RefreshDreams(reply) => {
                if self.clock.is_some() {
                    self.spawn_cache_refresh(reply);
                } else {
                    let result = self.refresh_dream_cache().await;
                    if let Err(e) = &result {
                        warn!("Dream cache refresh failed, keeping {} cached cycles: {}", self.dream_cache.len(), e);
                    }
                    let _ = reply.send(result);
                }
            }
            Command::Subscribe(listener, reply) => {
                let _ = reply.send(self.listeners.subscribe(listener));
            }
            Command::Unsubscribe(id, reply) => {
                let _ = reply.send(self.listeners.unsubscribe(id));
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown(reply) => {
                self.halt();
                self.shutdown.cancel();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn start(&mut self) {
        if self.clock.is_some() {
            debug!("Engine already running");
            return;
        }
        self.generation = self.generation.next();
        match self.mode {
            Mode::Live => self.prepare_live().await,
            Mode::Dream => self.prepare_dream().await,
        }

        let first_cycle = match self.mode {
            Mode::Live => self.live_cycle + 1,
            Mode::Dream => 1,
        };
        let (clock, tick) = PhaseClock::start(self.schedule, self.generation, Instant::now(), first_cycle);
        self.clock = Some(clock);
        info!("Engine started: {} mode, cycle {} ({})", self.mode, first_cycle, self.generation);
        self.enter_phase(tick);
    }

    /// Stop the clock and invalidate everything started under it.
    /// In-flight cognition is detached; its result will arrive stale and be dropped.
    fn halt(&mut self) {
        self.generation = self.generation.next();
        let was_running = self.clock.take().is_some();
        self.dispersal = None;
        if let Some(run) = self.in_flight.take() {
            debug!("Detaching cycle {} cognition", run.cycle);
        }
        self.settling = None;
        let dropped = self.aggregator.dump().len();
        if dropped > 0 {
            debug!("Dropped {} unconsumed percepts", dropped);
        }
        let cleared = self.listeners.clear();
        if cleared > 0 {
            debug!("Cleared {} result listeners", cleared);
        }
        self.dream_buffer = DreamBuffer::default();
        if was_running {
            info!("Engine stopped ({})", self.generation);
        }
    }

    async fn switch_mode(&mut self, mode: Mode) {
        if mode == self.mode {
            debug!("Already in {} mode", mode);
            return;
        }
        let was_running = self.clock.is_some();
        self.halt();
        info!("Mode {} -> {}", self.mode, mode);
        self.mode = mode;
        if was_running {
            self.start().await;
        }
    }

    fn on_percept(&mut self, percept: Percept) {
        match (self.mode, self.clock.is_some()) {
            (Mode::Live, true) => {
                self.collab.broadcaster.publish_percept(&percept, false);
                self.aggregator.push(percept);
            }
            (Mode::Live, false) => debug!("Ignoring percept while stopped"),
            (Mode::Dream, _) => debug!("Ignoring live percept while dreaming"),
        }
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            mode: self.mode,
            running: self.clock.is_some(),
            phase: self.clock.as_ref().map(PhaseClock::phase),
            cycle: self.clock.as_ref().map(PhaseClock::cycle),
            live_cycle: self.live_cycle,
            generation: self.generation.value(),
            pipeline_in_flight: self.in_flight.is_some(),
            pending_percepts: self.aggregator.len(),
            dream_cache_size: self.dream_cache.len(),
            has_ready_moment: self.buffer.ready().is_some(),
            current_dream: self.dream_buffer.current().map(|m| m.cycle),
            listeners: self.listeners.len(),
        }
    }

    // ========================================================
    // Mode preparation
    // ========================================================

    async fn prepare_live(&mut self) {
        if let Err(e) = self.refresh_dream_cache().await {
            warn!("History unavailable for placeholder: {}", e);
        }
        let placeholder = self.load_placeholder().await;
        self.buffer = CycleBuffer::new(placeholder);
    }

    async fn load_placeholder(&mut self) -> MindMoment {
        let Some(cycle) = self.dream_cache.pick() else {
            info!("No history yet, using the built-in placeholder");
            return fallback_placeholder();
        };
        let store = self.collab.store.clone();
        match store.mind_moment_by_cycle(cycle).await {
            Ok(Some(moment)) => {
                info!("Placeholder: cycle {}", cycle);
                moment
            }
            Ok(None) => {
                warn!("Placeholder cycle {} vanished, using the built-in placeholder", cycle);
                fallback_placeholder()
            }
            Err(e) => {
                warn!("Placeholder load failed ({}), using the built-in placeholder", e);
                fallback_placeholder()
            }
        }
    }

    async fn prepare_dream(&mut self) {
        if let Err(e) = self.refresh_dream_cache().await {
            warn!("Dream cache refresh failed, keeping {} cached cycles: {}", self.dream_cache.len(), e);
        }
        let current = self.preload_dream().await;
        let next = self.preload_dream().await;
        self.dream_buffer = DreamBuffer::preloaded(current, next);
        if self.dream_buffer.current().is_none() {
            warn!("Nothing to dream about yet");
        }
    }

    async fn preload_dream(&mut self) -> Option<MindMoment> {
        let cycle = self.dream_cache.pick()?;
        let store = self.collab.store.clone();
        match dream::hydrate(store.as_ref(), cycle).await {
            Ok(Some(moment)) => Some(moment),
            Ok(None) => {
                warn!("Dream cycle {} vanished, evicting", cycle);
                self.dream_cache.remove(cycle);
                None
            }
            Err(e) => {
                warn!("Dream cycle {} failed to preload: {}", cycle, e);
                None
            }
        }
    }

    async fn refresh_dream_cache(&mut self) -> Result<usize, EngineError> {
        let store = self.collab.store.clone();
        let cycles = store.eligible_dream_cycles().await?;
        self.dream_cache.replace(cycles);
        info!("Dream cache: {} eligible cycles", self.dream_cache.len());
        Ok(self.dream_cache.len())
    }

    // ========================================================
    // Time
    // ========================================================

    fn next_deadline(&self) -> Option<Instant> {
        let clock = self.clock.as_ref().map(PhaseClock::next_deadline);
        let replay = self.dispersal.as_ref().and_then(Dispersal::next_deadline);
        match (clock, replay) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn on_deadline(&mut self, now: Instant) {
        if let Some(dispersal) = self.dispersal.as_mut() {
            for percept in dispersal.due(now) {
                self.collab.broadcaster.publish_percept(&percept, true);
            }
        }
        let ticks = self.clock.as_mut().map(|c| c.poll(now)).unwrap_or_default();
        for tick in ticks {
            self.enter_phase(tick);
        }
    }

    fn enter_phase(&mut self, tick: PhaseTick) {
        if tick.generation != self.generation {
            debug!("Ignoring {} from stale {}", tick.phase, tick.generation);
            return;
        }
        let event = tick.event(self.mode);

        match (self.mode, tick.phase) {
            (Mode::Live, Phase::Percepts) => {
                self.live_cycle = tick.cycle;
                self.publish_phase(&event);
            }
            (Mode::Live, Phase::Spool) => {
                let snapshot = self.aggregator.dump();
                self.start_pipeline(tick.cycle, snapshot);
                self.publish_phase(&event);
                let shown = self.buffer.display();
                debug!("LIVE SPOOL {} shows cycle {}", tick.cycle, shown.cycle);
                self.collab.broadcaster.publish_moment(shown);
            }
            (Mode::Dream, Phase::Percepts) => {
                self.publish_phase(&event);
                self.dispersal = match self.dream_buffer.advance() {
                    Some(dream) => {
                        debug!("Dream cycle {} replays cycle {}", tick.cycle, dream.cycle);
                        Some(Dispersal::for_moment(dream, tick.started_at, tick.duration))
                    }
                    None => {
                        warn!("Dream cycle {} has nothing to replay", tick.cycle);
                        None
                    }
                };
            }
            (Mode::Dream, Phase::Spool) => {
                if let Some(left) = self.dispersal.take().filter(|d| !d.is_empty()) {
                    debug!("Discarding {} undelivered replay percepts", left.len());
                }
                self.publish_phase(&event);
                match self.dream_buffer.current() {
                    Some(dream) => self.collab.broadcaster.publish_moment(dream),
                    None => warn!("No dream loaded for SPOOL of dream cycle {}", tick.cycle),
                }
            }
            _ => self.publish_phase(&event),
        }
    }

    fn publish_phase(&self, event: &PhaseEvent) {
        if event.phase == Phase::Percepts {
            info!("{} cycle {}", event.mode, event.cycle_number);
        } else {
            trace!("{} {} (cycle {})", event.mode, event.phase, event.cycle_number);
        }
        self.collab.broadcaster.publish_phase(event);
    }

    // ========================================================
    // Background work
    // ========================================================

    fn start_pipeline(&mut self, cycle: u64, snapshot: PerceptSnapshot) {
        if let Some(prev) = self.in_flight.take() {
            if prev.handle.is_finished() {
                debug!("Cycle {} cognition finished, result not yet read", prev.cycle);
                self.settling = Some(prev.run_id);
            } else {
                warn!(
                    "Cycle {} cognition still running at cycle {} boundary, aborting it",
                    prev.cycle, cycle
                );
                prev.handle.abort();
            }
        }

        self.next_run_id += 1;
        let run_id = self.next_run_id;
        let generation = self.generation;
        let pipeline = self.pipeline.clone();
        let tx = self.bg_tx.clone();
        let cancel = self.shutdown.child_token();
        debug!("Cycle {}: cognition run {} over {} percepts", cycle, run_id, snapshot.len());

        let handle = tokio::spawn(async move {
            let result = pipeline.run(cycle, snapshot, cancel).await;
            let _ = tx.send(Background::Pipeline { generation, run_id, cycle, result });
        });
        self.in_flight = Some(InFlight { run_id, cycle, handle });
    }

    fn poll_dream_loader(&mut self) {
        if !self.dream_buffer.begin_load() {
            return;
        }
        let Some(cycle) = self.dream_cache.pick() else {
            self.dream_buffer.finish_load(None);
            trace!("Dream cache empty, nothing to load");
            return;
        };
        let store = self.collab.store.clone();
        let tx = self.bg_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = dream::hydrate(store.as_ref(), cycle).await;
            let _ = tx.send(Background::DreamLoaded { generation, cycle, result });
        });
    }

    fn spawn_cache_refresh(&self, reply: oneshot::Sender<Result<usize, EngineError>>) {
        let store = self.collab.store.clone();
        let tx = self.bg_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = store.eligible_dream_cycles().await;
            let _ = tx.send(Background::CacheRefreshed { generation, result, reply });
        });
    }

    fn handle_background(&mut self, bg: Background) {
        match bg {
            Background::Pipeline { generation, run_id, cycle, result } => {
                self.on_pipeline_result(generation, run_id, cycle, result)
            }
            Background::DreamLoaded { generation, cycle, result } => {
                self.on_dream_loaded(generation, cycle, result)
            }
            Background::CacheRefreshed { generation, result, reply } => {
                let _ = reply.send(self.on_cache_refreshed(generation, result));
            }
        }
    }

    fn on_cache_refreshed(
        &mut self,
        generation: Generation,
        result: Result<Vec<u64>, StoreError>,
    ) -> Result<usize, EngineError> {
        let cycles = match result {
            Ok(cycles) => cycles,
            Err(e) => {
                warn!("Dream cache refresh failed, keeping {} cached cycles: {}", self.dream_cache.len(), e);
                return Err(e.into());
            }
        };
        if generation != self.generation {
            debug!("Discarding dream cache listing from stale {}", generation);
            return Ok(self.dream_cache.len());
        }
        self.dream_cache.replace(cycles);
        info!("Dream cache: {} eligible cycles", self.dream_cache.len());
        Ok(self.dream_cache.len())
    }

    fn on_pipeline_result(
        &mut self,
        generation: Generation,
        run_id: u64,
        cycle: u64,
        result: Result<PipelineOutput, PipelineError>,
    ) {
        if generation != self.generation {
            info!("Discarding cycle {} result from stale {}", cycle, generation);
            return;
        }
        if self.in_flight.as_ref().map(|r| r.run_id) == Some(run_id) {
            self.in_flight = None;
        } else if self.settling == Some(run_id) {
            self.settling = None;
        } else {
            debug!("Discarding superseded cycle {} result", cycle);
            return;
        }

        match result {
            Ok(output) => {
                if output.is_dream_eligible() && self.dream_cache.insert(cycle) {
                    debug!("Cycle {} is now dreamable", cycle);
                }
                self.listeners.notify(&output.moment);
                self.buffer.offer(output.moment);
            }
            Err(e) => error!("Cycle {}: cognition failed, display keeps the previous moment: {}", cycle, e),
        }
    }

    fn on_dream_loaded(
        &mut self,
        generation: Generation,
        cycle: u64,
        result: Result<Option<MindMoment>, StoreError>,
    ) {
        if generation != self.generation {
            debug!("Discarding dream load of cycle {} from stale {}", cycle, generation);
            return;
        }
        match result {
            Ok(Some(moment)) => {
                debug!("Dream cycle {} loaded", cycle);
                self.dream_buffer.finish_load(Some(moment));
            }
            Ok(None) => {
                warn!("Dream cycle {} vanished, evicting", cycle);
                self.dream_cache.remove(cycle);
                self.dream_buffer.finish_load(None);
            }
            Err(e) => {
                warn!("Dream cycle {} failed to load: {}", cycle, e);
                self.dream_buffer.finish_load(None);
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ============================================================
// Handle
// ============================================================

/// Cloneable handle to a running engine. Every method fails with
/// `EngineError::Closed` once the engine loop has exited.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Start cycling in the current mode. No-op if already running.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.request(Command::Start).await
    }

    /// Stop cycling. Pending transitions and replays are cancelled.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.request(Command::Stop).await
    }

    /// Switch mode. If running, the new mode's first cycle starts immediately.
    pub async fn switch_mode(&self, mode: Mode) -> Result<(), EngineError> {
        self.request(|reply| Command::SwitchMode(mode, reply)).await
    }

    pub async fn push_percept(&self, percept: Percept) -> Result<(), EngineError> {
        self.tx
            .send(Command::Percept(percept))
            .await
            .map_err(|_| EngineError::Closed)
    }

    /// Re-read the eligible dream set. Returns its new size.
    pub async fn refresh_dreams(&self) -> Result<usize, EngineError> {
        self.request(Command::RefreshDreams).await?
    }

    /// Register a listener for accepted LIVE results. Cleared on stop and mode switch.
    pub async fn on_moment<F>(&self, listener: F) -> Result<ListenerId, EngineError>
    where
        F: Fn(&MindMoment) + Send + Sync + 'static,
    {
        self.request(|reply| Command::Subscribe(Box::new(listener), reply)).await
    }

    pub async fn unsubscribe(&self, id: ListenerId) -> Result<bool, EngineError> {
        self.request(|reply| Command::Unsubscribe(id, reply)).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(Command::Status).await
    }

    /// Stop and exit the engine loop. In-flight LLM calls are cancelled.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(Command::Shutdown).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
