//! PhaseClock - the virtual clock that drives a cycle
//!
//! The clock never sleeps. The engine loop sleeps until `next_deadline()` and
//! then calls `poll(now)`, which returns every transition that has come due,
//! in order, catching up if the loop lagged. Every tick carries the generation
//! the clock was started under so the engine can drop ticks from a clock it has
//! since replaced.

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use mindcycle_core::{Mode, Phase, PhaseEvent};
use std::time::Duration;
use tokio::time::Instant;

/// Engine-scoped token bumped on every start, stop and mode switch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Durations of the six phases, in phase order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhaseSchedule {
    durations: [Duration; 6],
}

impl PhaseSchedule {
    pub fn new(durations: [Duration; 6]) -> Result<Self, EngineError> {
        let schedule = Self { durations };
        if schedule.cycle_length().is_zero() {
            return Err(EngineError::Config("phase durations sum to zero".into()));
        }
        Ok(schedule)
    }

    pub fn duration(&self, phase: Phase) -> Duration {
        self.durations[phase.index()]
    }

    /// Offset of a phase's start from the start of its cycle.
    pub fn offset(&self, phase: Phase) -> Duration {
        self.durations[..phase.index()].iter().sum()
    }

    pub fn cycle_length(&self) -> Duration {
        self.durations.iter().sum()
    }
}

impl Default for PhaseSchedule {
    fn default() -> Self {
        Self {
            durations: [35_000, 2_000, 3_000, 15_000, 3_000, 2_000].map(Duration::from_millis),
        }
    }
}

/// One phase entry.
#[derive(Clone, Debug, PartialEq)]
pub struct PhaseTick {
    pub generation: Generation,
    pub phase: Phase,
    pub cycle: u64,
    /// Virtual instant the phase began (its scheduled deadline, not when it was polled).
    pub started_at: Instant,
    /// Wall-clock equivalent of `started_at`.
    pub start_time: DateTime<Utc>,
    pub duration: Duration,
}

impl PhaseTick {
    pub fn event(&self, mode: Mode) -> PhaseEvent {
        PhaseEvent {
            phase: self.phase,
            mode,
            next_phase: self.phase.next(),
            start_time: self.start_time,
            duration_ms: self.duration.as_millis() as u64,
            cycle_number: self.cycle,
        }
    }
}

pub struct PhaseClock {
    schedule: PhaseSchedule,
    generation: Generation,
    cycle: u64,
    phase: Phase,
    phase_started: Instant,
    anchor: Instant,
    wall_anchor: DateTime<Utc>,
}

impl PhaseClock {
    /// Start a clock at PERCEPTS of `first_cycle`. Returns the clock and the first tick.
    pub fn start(
        schedule: PhaseSchedule,
        generation: Generation,
        now: Instant,
        first_cycle: u64,
    ) -> (Self, PhaseTick) {
        let clock = Self {
            schedule,
            generation,
            cycle: first_cycle,
            phase: Phase::Percepts,
            phase_started: now,
            anchor: now,
            wall_anchor: Utc::now(),
        };
        let tick = clock.current();
        (clock, tick)
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn schedule(&self) -> &PhaseSchedule {
        &self.schedule
    }

    /// Instant of the next transition.
    pub fn next_deadline(&self) -> Instant {
        self.phase_started + self.schedule.duration(self.phase)
    }

    /// Advance through every transition due at `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<PhaseTick> {
        let mut ticks = Vec::new();
        // A non-zero cycle length bounds this loop.
        while now >= self.next_deadline() {
            let at = self.next_deadline();
            self.phase = self.phase.next();
            if self.phase == Phase::Percepts {
                self.cycle += 1;
            }
            self.phase_started = at;
            ticks.push(self.current());
        }
        ticks
    }

    fn current(&self) -> PhaseTick {
        let offset = self.phase_started.saturating_duration_since(self.anchor);
        let start_time = self.wall_anchor
            + chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero());
        PhaseTick {
            generation: self.generation,
            phase: self.phase,
            cycle: self.cycle,
            started_at: self.phase_started,
            start_time,
            duration: self.schedule.duration(self.phase),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn small() -> PhaseSchedule {
        PhaseSchedule::new([ms(400), ms(100), ms(100), ms(200), ms(100), ms(100)]).unwrap()
    }

    #[test]
    fn schedule_offsets_and_length() {
        let s = PhaseSchedule::default();
        assert_eq!(s.cycle_length(), Duration::from_secs(60));
        assert_eq!(s.offset(Phase::Percepts), Duration::ZERO);
        assert_eq!(s.offset(Phase::Spool), ms(35_000));
        assert_eq!(s.offset(Phase::Reset), ms(58_000));
        assert_eq!(s.duration(Phase::SigilHold), ms(15_000));
    }

    #[test]
    fn zero_schedule_is_rejected() {
        assert!(matches!(
            PhaseSchedule::new([Duration::ZERO; 6]),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn start_emits_percepts() {
        let now = Instant::now();
        let (clock, tick) = PhaseClock::start(small(), Generation::default(), now, 7);
        assert_eq!(tick.phase, Phase::Percepts);
        assert_eq!(tick.cycle, 7);
        assert_eq!(tick.started_at, now);
        assert_eq!(tick.duration, ms(400));
        assert_eq!(clock.next_deadline(), now + ms(400));
    }

    #[test]
    fn poll_before_deadline_is_empty() {
        let now = Instant::now();
        let (mut clock, _) = PhaseClock::start(small(), Generation::default(), now, 1);
        assert!(clock.poll(now + ms(399)).is_empty());
        assert_eq!(clock.phase(), Phase::Percepts);
    }

    #[test]
    fn full_cycle_sequence_and_rollover() {
        let now = Instant::now();
        let (mut clock, first) = PhaseClock::start(small(), Generation::default(), now, 1);
        let ticks = clock.poll(now + ms(1_000));

        let phases: Vec<Phase> = std::iter::once(first.phase)
            .chain(ticks.iter().map(|t| t.phase))
            .collect();
        assert_eq!(
            phases,
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
        assert!(ticks[..5].iter().all(|t| t.cycle == 1));
        assert_eq!(ticks[5].cycle, 2);
        assert_eq!(ticks[5].started_at, now + ms(1_000));

        let total: Duration = std::iter::once(first.duration)
            .chain(ticks[..5].iter().map(|t| t.duration))
            .sum();
        assert_eq!(total, clock.schedule().cycle_length());
    }

    #[test]
    fn lagging_poll_catches_up_at_scheduled_instants() {
        let now = Instant::now();
        let (mut clock, _) = PhaseClock::start(small(), Generation::default(), now, 1);
        let ticks = clock.poll(now + ms(650));
        let starts: Vec<Duration> = ticks.iter().map(|t| t.started_at - now).collect();
        assert_eq!(starts, vec![ms(400), ms(500), ms(600)]);
        assert_eq!(clock.phase(), Phase::SigilHold);
    }

    #[test]
    fn ticks_carry_generation_and_event_shape() {
        let now = Instant::now();
        let generation = Generation::default().next().next();
        let (mut clock, _) = PhaseClock::start(small(), generation, now, 3);
        let tick = clock.poll(now + ms(400)).remove(0);
        assert_eq!(tick.generation, generation);

        let event = tick.event(Mode::Dream);
        assert_eq!(event.phase, Phase::Spool);
        assert_eq!(event.next_phase, Phase::SigilIn);
        assert_eq!(event.mode, Mode::Dream);
        assert_eq!(event.duration_ms, 100);
        assert_eq!(event.cycle_number, 3);
    }

    #[test]
    fn zero_length_phase_is_still_entered() {
        let schedule =
            PhaseSchedule::new([ms(100), Duration::ZERO, ms(100), ms(100), ms(100), ms(100)]).unwrap();
        let now = Instant::now();
        let (mut clock, _) = PhaseClock::start(schedule, Generation::default(), now, 1);
        let phases: Vec<Phase> = clock.poll(now + ms(100)).iter().map(|t| t.phase).collect();
        assert_eq!(phases, vec![Phase::Spool, Phase::SigilIn]);
    }

    #[test]
    fn wall_clock_start_times_follow_virtual_offsets() {
        let now = Instant::now();
        let (mut clock, first) = PhaseClock::start(small(), Generation::default(), now, 1);
        let tick = clock.poll(now + ms(400)).remove(0);
        assert_eq!(
            (tick.start_time - first.start_time).num_milliseconds(),
            400
        );
    }
}
