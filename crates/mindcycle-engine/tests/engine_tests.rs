//! Engine behaviour on tokio's paused clock.
//!
//! `fast_config()` gives a one-second cycle:
//!   PERCEPTS 0-400, SPOOL 400-500, SIGILIN 500-600, SIGILHOLD 600-800,
//!   SIGILOUT 800-900, RESET 900-1000 (ms from cycle start)

use mindcycle_core::{MindMoment, Mode, Percept, Phase};
use mindcycle_engine::config::MindcycleConfig;
use mindcycle_engine::ports::PersistenceStore;
use mindcycle_engine::store::MemoryStore;
use mindcycle_engine::testing::*;
use mindcycle_engine::{CycleEngine, EngineError, EngineHandle};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

async fn boot(h: &Harness, config: MindcycleConfig) -> EngineHandle {
    let engine = CycleEngine::new(&config, h.collaborators()).await.unwrap();
    let (handle, _task) = engine.spawn();
    handle
}

async fn stored(h: &Harness, cycle: u64) -> Option<MindMoment> {
    h.store.inner().mind_moment_by_cycle(cycle).await.unwrap()
}

fn since(t0: Instant, at: Instant) -> u64 {
    (at - t0).as_millis() as u64
}

type Seen = Arc<Mutex<Vec<MindMoment>>>;

async fn collect_results(handle: &EngineHandle) -> Seen {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    handle
        .on_moment(move |m| sink.lock().unwrap().push(m.clone()))
        .await
        .unwrap();
    seen
}

fn replies(texts: &[&str]) -> Vec<Reply> {
    texts.iter().map(|t| Reply::Text(json_reply(t))).collect()
}

// ===========================================================================
// Phase clock through the engine
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn live_phase_sequence_and_timing() {
    let h = Harness::new(ScriptedLlm::replying(json_reply("hello")), MemoryStore::new());
    let handle = boot(&h, fast_config()).await;

    let t0 = Instant::now();
    handle.start().await.unwrap();
    sleep(ms(1050)).await;

    let phases = h.broadcaster.phases();
    let seq: Vec<Phase> = phases.iter().map(|(_, e)| e.phase).collect();
    assert_eq!(
        seq,
        vec![
            Phase::Percepts,
            Phase::Spool,
            Phase::SigilIn,
            Phase::SigilHold,
            Phase::SigilOut,
            Phase::Reset,
            Phase::Percepts,
        ]
    );
    let offsets: Vec<u64> = phases.iter().map(|(at, _)| since(t0, *at)).collect();
    assert_eq!(offsets, vec![0, 400, 500, 600, 800, 900, 1000]);

    let total: u64 = phases[..6].iter().map(|(_, e)| e.duration_ms).sum();
    assert_eq!(total, 1000);
    assert!(phases[..6].iter().all(|(_, e)| e.cycle_number == 1 && e.mode == Mode::Live));
    assert_eq!(phases[6].1.cycle_number, 2);
    assert_eq!(phases[1].1.next_phase, Phase::SigilIn);
    assert_eq!(phases[5].1.next_phase, Phase::Percepts);
}

#[tokio::test(start_paused = true)]
async fn live_cycle_counter_hydrates_from_store() {
    let store = MemoryStore::with_moments(vec![MindMoment::text_only(41, "long ago")]);
    let h = Harness::new(ScriptedLlm::replying(json_reply("x")), store);
    let handle = boot(&h, fast_config()).await;

    handle.start().await.unwrap();
    sleep(ms(10)).await;

    let phases = h.broadcaster.phases();
    assert_eq!(phases[0].1.cycle_number, 42);
    assert_eq!(handle.status().await.unwrap().live_cycle, 42);
}

// ===========================================================================
// LIVE double buffering
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn spool_shows_previous_cycle_result() {
    let llm = ScriptedLlm::sequence(replies(&["one", "two", "three"]), Reply::Text(json_reply("later")));
    let h = Harness::new(llm, MemoryStore::new());
    let handle = boot(&h, fast_config()).await;

    handle.start().await.unwrap();
    sleep(ms(2_450)).await;

    let spools: Vec<u64> = h
        .broadcaster
        .phases()
        .into_iter()
        .filter(|(_, e)| e.phase == Phase::Spool)
        .map(|(_, e)| e.cycle_number)
        .collect();
    let shown = h.broadcaster.moments();
    assert_eq!(spools, vec![1, 2, 3]);
    assert_eq!(shown.len(), 3);

    // Empty store: the built-in placeholder comes first.
    assert_eq!(shown[0].cycle, 0);
    assert_eq!(shown[1].cycle, 1);
    assert_eq!(shown[1].text, "one");
    assert_eq!(shown[2].cycle, 2);
    assert_eq!(shown[2].text, "two");
    for (spool_cycle, moment) in spools.iter().zip(&shown) {
        assert!(moment.cycle < *spool_cycle, "SPOOL {} showed cycle {}", spool_cycle, moment.cycle);
        assert!(!moment.is_dream());
    }
}

#[tokio::test(start_paused = true)]
async fn percepts_are_snapshotted_once_per_cycle() {
    let h = Harness::new(ScriptedLlm::replying(json_reply("noticed")), MemoryStore::new());
    let handle = boot(&h, fast_config()).await;
    handle.start().await.unwrap();
    let seen = collect_results(&handle).await;

    for i in 0..3 {
        handle.push_percept(Percept::visual(json!(format!("sight {}", i)))).await.unwrap();
    }
    for i in 0..2 {
        handle.push_percept(Percept::audio(json!(format!("sound {}", i)))).await.unwrap();
    }
    sleep(ms(450)).await;

    assert_eq!(h.llm.calls(), 1);
    assert_eq!(handle.status().await.unwrap().pending_percepts, 0);
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].visual_percepts.len(), 3);
        assert_eq!(seen[0].audio_percepts.len(), 2);
    }
    let prompt = h.llm.requests()[0].messages[0].content.clone();
    assert!(prompt.contains("sight 2") && prompt.contains("sound 1"));

    // Next cycle gets only what arrived after the boundary.
    sleep(ms(600)).await;
    handle.push_percept(Percept::audio(json!("late sound"))).await.unwrap();
    sleep(ms(400)).await;

    assert_eq!(h.llm.calls(), 2);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].cycle, 2);
    assert!(seen[1].visual_percepts.is_empty());
    assert_eq!(seen[1].audio_percepts.len(), 1);

    let live: Vec<_> = h.broadcaster.percepts().into_iter().filter(|(_, _, r)| !r).collect();
    assert_eq!(live.len(), 6, "live percepts are forwarded as they arrive");
}

#[tokio::test(start_paused = true)]
async fn provider_error_keeps_stale_moment_on_display() {
    let llm = ScriptedLlm::sequence(
        vec![Reply::Text(json_reply("good")), Reply::Error("boom".into())],
        Reply::Error("still down".into()),
    );
    let h = Harness::new(llm, MemoryStore::new());
    let handle = boot(&h, fast_config()).await;

    handle.start().await.unwrap();
    sleep(ms(2_450)).await;

    let shown: Vec<u64> = h.broadcaster.moments().iter().map(|m| m.cycle).collect();
    assert_eq!(shown, vec![0, 1, 1]);
    assert!(stored(&h, 2).await.is_none());
    assert!(handle.status().await.unwrap().has_ready_moment);
}

#[tokio::test(start_paused = true)]
async fn render_failure_still_displays_text_moment() {
    let h = Harness::new(ScriptedLlm::replying(json_reply("plain")), MemoryStore::new());
    h.renderer.set_failing(true);
    let handle = boot(&h, fast_config()).await;

    handle.start().await.unwrap();
    handle.push_percept(Percept::visual(json!("a coat"))).await.unwrap();
    sleep(ms(1_450)).await;

    let shown = h.broadcaster.moments();
    assert_eq!(shown[1].cycle, 1);
    assert_eq!(shown[1].text, "plain");
    assert!(shown[1].art.is_none());

    let moment = stored(&h, 1).await.unwrap();
    assert!(moment.art.is_none());
    assert_eq!(handle.status().await.unwrap().dream_cache_size, 0);
}

#[tokio::test(start_paused = true)]
async fn art_complete_results_become_dreamable() {
    let h = Harness::new(ScriptedLlm::replying(json_reply("vivid")), MemoryStore::new());
    let handle = boot(&h, fast_config()).await;

    handle.start().await.unwrap();
    handle.push_percept(Percept::visual(json!("a kite"))).await.unwrap();
    sleep(ms(450)).await;

    assert_eq!(handle.status().await.unwrap().dream_cache_size, 1);
    let moment = stored(&h, 1).await.unwrap();
    assert!(moment.is_dream_eligible());
}

#[tokio::test(start_paused = true)]
async fn overrunning_run_is_aborted_at_next_boundary() {
    let llm = ScriptedLlm::sequence(
        vec![Reply::Delayed(ms(1_500), json_reply("slow")), Reply::Text(json_reply("fast"))],
        Reply::Text(json_reply("later")),
    );
    let h = Harness::new(llm, MemoryStore::new());
    let handle = boot(&h, fast_config()).await;
    handle.start().await.unwrap();
    let seen = collect_results(&handle).await;

    sleep(ms(3_000)).await;

    let shown = h.broadcaster.moments();
    assert!(shown.iter().all(|m| m.text != "slow"));
    let shown: Vec<u64> = shown.iter().map(|m| m.cycle).collect();
    assert_eq!(shown, vec![0, 0, 2]);

    let seen = seen.lock().unwrap();
    assert!(seen.iter().all(|m| m.cycle != 1));
    assert!(stored(&h, 1).await.is_none());
}

// ===========================================================================
// Stop / switch
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn stop_silences_everything() {
    let llm = ScriptedLlm::constant(Reply::Delayed(ms(300), json_reply("after stop")));
    let h = Harness::new(llm, MemoryStore::new());
    let handle = boot(&h, fast_config()).await;
    handle.start().await.unwrap();
    let seen = collect_results(&handle).await;

    sleep(ms(450)).await;
    handle.stop().await.unwrap();
    let frozen = h.broadcaster.len();

    sleep(ms(3_000)).await;
    assert_eq!(h.broadcaster.len(), frozen, "no events after stop");
    assert!(seen.lock().unwrap().is_empty(), "detached result is discarded");

    let status = handle.status().await.unwrap();
    assert!(!status.running);
    assert!(!status.has_ready_moment);
    assert_eq!(status.listeners, 0);

    // The detached run still finished its own writes.
    assert!(stored(&h, 1).await.is_some());

    // Restart continues the counter and shows the placeholder, not the stale result.
    handle.start().await.unwrap();
    sleep(ms(450)).await;
    let phases = h.broadcaster.phases();
    assert_eq!(phases[phases.len() - 2].1.cycle_number, 2);
    let shown = h.broadcaster.moments();
    assert_eq!(shown.last().map(|m| m.cycle), Some(0));
}

#[tokio::test(start_paused = true)]
async fn live_to_dream_switch_mid_cycle() {
    let store = MemoryStore::with_moments(vec![
        dream_moment(10, &[0, 5, 10]),
        dream_moment(11, &[0]),
    ]);
    let h = Harness::new(ScriptedLlm::replying(json_reply("never")), store);
    let handle = boot(&h, fast_config()).await;

    handle.start().await.unwrap();
    sleep(ms(250)).await;
    let t_switch = Instant::now();
    handle.switch_mode(Mode::Dream).await.unwrap();
    sleep(ms(2_000)).await;

    let phases = h.broadcaster.phases();
    let live_after: Vec<_> = phases
        .iter()
        .filter(|(at, e)| e.mode == Mode::Live && *at >= t_switch)
        .collect();
    assert!(live_after.is_empty(), "LIVE timers must be cancelled");

    let first_dream = phases.iter().find(|(_, e)| e.mode == Mode::Dream).unwrap();
    assert_eq!(first_dream.0, t_switch);
    assert_eq!(first_dream.1.phase, Phase::Percepts);
    assert_eq!(first_dream.1.cycle_number, 1);

    assert_eq!(h.llm.calls(), 0, "switch landed before the LIVE boundary");
    let dreams: Vec<_> = h.broadcaster.moments().into_iter().filter(|m| m.is_dream()).collect();
    assert_eq!(dreams.len(), 2);
    assert!(dreams.iter().all(|m| m.cycle == 10 || m.cycle == 11));
}

#[tokio::test(start_paused = true)]
async fn stale_pipeline_result_is_discarded_after_switch() {
    let llm = ScriptedLlm::constant(Reply::Delayed(ms(300), json_reply("stale")));
    let h = Harness::new(llm, MemoryStore::new());
    let handle = boot(&h, fast_config()).await;

    handle.start().await.unwrap();
    sleep(ms(450)).await;
    handle.switch_mode(Mode::Dream).await.unwrap();
    sleep(ms(550)).await;
    handle.switch_mode(Mode::Live).await.unwrap();
    sleep(ms(450)).await;

    let shown = h.broadcaster.moments();
    assert!(!shown.is_empty());
    assert!(shown.iter().all(|m| m.text != "stale"));
    assert!(!handle.status().await.unwrap().has_ready_moment);
}

#[tokio::test(start_paused = true)]
async fn switching_to_current_mode_is_a_no_op() {
    let h = Harness::new(ScriptedLlm::replying(json_reply("x")), MemoryStore::new());
    let handle = boot(&h, fast_config()).await;
    handle.start().await.unwrap();
    let before = handle.status().await.unwrap().generation;
    handle.switch_mode(Mode::Live).await.unwrap();
    assert_eq!(handle.status().await.unwrap().generation, before);
}

// ===========================================================================
// DREAM
// ===========================================================================

fn dream_config() -> MindcycleConfig {
    let mut config = fast_config();
    config.cycle.start_mode = Mode::Dream;
    config
}

#[tokio::test(start_paused = true)]
async fn dream_percepts_are_dispersed_over_percepts_phase() {
    // Captured at 0s, 10s, 40s -> replayed at 0, 100, 400 ms of a 400 ms window.
    let store = MemoryStore::with_moments(vec![dream_moment(10, &[0, 10, 40])]);
    let h = Harness::new(ScriptedLlm::replying(json_reply("unused")), store);
    let handle = boot(&h, dream_config()).await;

    let t0 = Instant::now();
    handle.start().await.unwrap();
    sleep(ms(450)).await;

    let replayed = h.broadcaster.percepts();
    assert!(replayed.iter().all(|(_, _, r)| *r));
    let offsets: Vec<u64> = replayed.iter().map(|(at, _, _)| since(t0, *at)).collect();
    assert_eq!(offsets, vec![0, 100, 400]);

    let shown = h.broadcaster.moments();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].cycle, 10);
    assert!(shown[0].is_dream());

    // The last percept lands before SPOOL.
    let events = h.broadcaster.events();
    let spool_idx = events
        .iter()
        .position(|(_, p)| matches!(p, Published::Phase(e) if e.phase == Phase::Spool))
        .unwrap();
    assert!(matches!(events[spool_idx - 1].1, Published::Percept { .. }));
    assert_eq!(h.llm.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn dream_cycles_rotate_and_never_stall() {
    let store = MemoryStore::with_moments(vec![
        dream_moment(1, &[0]),
        dream_moment(2, &[0, 1]),
        dream_moment(3, &[0, 2]),
    ]);
    let h = Harness::new(ScriptedLlm::replying(json_reply("unused")), store);
    let handle = boot(&h, dream_config()).await;

    handle.start().await.unwrap();
    sleep(ms(5_450)).await;

    let spools = h
        .broadcaster
        .phases()
        .into_iter()
        .filter(|(_, e)| e.phase == Phase::Spool)
        .count();
    let shown = h.broadcaster.moments();
    assert_eq!(spools, 6);
    assert_eq!(shown.len(), 6, "every DREAM SPOOL shows a dream");
    assert!(shown.iter().all(|m| m.is_dream() && (1..=3).contains(&m.cycle)));

    let status = handle.status().await.unwrap();
    assert_eq!(status.dream_cache_size, 3);
    assert!(status.current_dream.is_some());
}

#[tokio::test(start_paused = true)]
async fn loader_fills_buffer_once_history_exists() {
    let h = Harness::new(ScriptedLlm::replying(json_reply("unused")), MemoryStore::new());
    let handle = boot(&h, dream_config()).await;

    handle.start().await.unwrap();
    sleep(ms(100)).await;
    assert!(handle.status().await.unwrap().current_dream.is_none());

    // A moment becomes eligible out-of-band.
    let moment = dream_moment(7, &[0, 3]);
    let art = moment.art.clone().unwrap();
    let id = h.store.inner().insert_mind_moment(&moment).await.unwrap();
    h.store.inner().update_mind_moment_art(&id, &art).await.unwrap();
    assert_eq!(handle.refresh_dreams().await.unwrap(), 1);

    sleep(ms(100)).await;
    assert_eq!(handle.status().await.unwrap().current_dream, Some(7));

    // Next DREAM SPOOL (cycle 2 at 1400 ms) shows it.
    sleep(ms(1_250)).await;
    let shown = h.broadcaster.moments();
    assert_eq!(shown.last().map(|m| m.cycle), Some(7));
}

#[tokio::test(start_paused = true)]
async fn live_percepts_are_ignored_while_dreaming() {
    let store = MemoryStore::with_moments(vec![dream_moment(5, &[0])]);
    let h = Harness::new(ScriptedLlm::replying(json_reply("unused")), store);
    let handle = boot(&h, dream_config()).await;

    handle.start().await.unwrap();
    handle.push_percept(Percept::visual(json!("someone waves"))).await.unwrap();
    sleep(ms(50)).await;

    assert!(h.broadcaster.percepts().iter().all(|(_, _, replayed)| *replayed));
    assert_eq!(handle.status().await.unwrap().pending_percepts, 0);
}

#[tokio::test(start_paused = true)]
async fn slow_dream_refresh_does_not_delay_the_heartbeat() {
    let store = MemoryStore::with_moments(vec![dream_moment(4, &[0])]);
    let h = Harness::new(ScriptedLlm::replying(json_reply("x")), store);
    let handle = boot(&h, fast_config()).await;

    let t0 = Instant::now();
    handle.start().await.unwrap();
    h.store.slow_listing(ms(500));
    sleep(ms(300)).await;

    assert_eq!(handle.refresh_dreams().await.unwrap(), 1);
    assert_eq!(since(t0, Instant::now()), 800);
    sleep(ms(250)).await;

    let offsets: Vec<(Phase, u64)> = h
        .broadcaster
        .phases()
        .iter()
        .map(|(at, e)| (e.phase, since(t0, *at)))
        .collect();
    assert_eq!(offsets[1], (Phase::Spool, 400));
    assert_eq!(offsets[6], (Phase::Percepts, 1000));
    assert_eq!(h.llm.calls(), 1);
    assert_eq!(h.broadcaster.moments().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn refresh_failure_reports_store_error() {
    let h = Harness::new(ScriptedLlm::replying(json_reply("x")), MemoryStore::new());
    let handle = boot(&h, fast_config()).await;
    h.store.fail_reads(true);
    assert!(matches!(handle.refresh_dreams().await, Err(EngineError::Store(_))));
}

// ===========================================================================
// Lifecycle
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn start_twice_is_idempotent() {
    let h = Harness::new(ScriptedLlm::replying(json_reply("x")), MemoryStore::new());
    let handle = boot(&h, fast_config()).await;
    handle.start().await.unwrap();
    handle.start().await.unwrap();
    sleep(ms(10)).await;
    assert_eq!(h.broadcaster.phases().len(), 1);
    assert!(handle.status().await.unwrap().running);
}

#[tokio::test(start_paused = true)]
async fn handle_reports_closed_after_shutdown() {
    let h = Harness::new(ScriptedLlm::replying(json_reply("x")), MemoryStore::new());
    let engine = CycleEngine::new(&fast_config(), h.collaborators()).await.unwrap();
    let (handle, task) = engine.spawn();

    handle.start().await.unwrap();
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert!(matches!(handle.start().await, Err(EngineError::Closed)));
    assert!(matches!(handle.status().await, Err(EngineError::Closed)));
    assert!(matches!(
        handle.push_percept(Percept::visual(json!("x"))).await,
        Err(EngineError::Closed)
    ));
    assert!(handle.is_closed());
}

#[tokio::test(start_paused = true)]
async fn zero_length_cycle_is_rejected() {
    let h = Harness::new(ScriptedLlm::replying(json_reply("x")), MemoryStore::new());
    let mut config = fast_config();
    config.cycle.percepts_ms = 0;
    config.cycle.spool_ms = 0;
    config.cycle.sigil_in_ms = 0;
    config.cycle.sigil_hold_ms = 0;
    config.cycle.sigil_out_ms = 0;
    config.cycle.reset_ms = 0;
    assert!(matches!(
        CycleEngine::new(&config, h.collaborators()).await,
        Err(EngineError::Config(_))
    ));
}
