//! CycleBuffer - one-cycle-delayed handoff between generation and display (LIVE)

use chrono::{TimeZone, Utc};
use mindcycle_core::{MindMoment, MoodVector, Origin};
use tracing::debug;

pub struct CycleBuffer {
    ready: Option<MindMoment>,
    ready_shown: bool,
    placeholder: MindMoment,
}

impl CycleBuffer {
    pub fn new(placeholder: MindMoment) -> Self {
        Self { ready: None, ready_shown: false, placeholder }
    }

    /// Overwrite `ready`. An earlier result that never reached a SPOOL is dropped.
    pub fn offer(&mut self, moment: MindMoment) {
        if let Some(prev) = &self.ready {
            if !self.ready_shown {
                debug!("Cycle {} superseded before display by cycle {}", prev.cycle, moment.cycle);
            }
        }
        self.ready = Some(moment);
        self.ready_shown = false;
    }

    /// What SPOOL shows: the latest result, else the placeholder. Does not consume.
    pub fn display(&mut self) -> &MindMoment {
        match &self.ready {
            Some(m) => {
                self.ready_shown = true;
                m
            }
            None => &self.placeholder,
        }
    }

    pub fn ready(&self) -> Option<&MindMoment> {
        self.ready.as_ref()
    }

    pub fn placeholder(&self) -> &MindMoment {
        &self.placeholder
    }
}

impl Default for CycleBuffer {
    fn default() -> Self {
        Self::new(fallback_placeholder())
    }
}

/// Shown when storage is empty or unreachable at LIVE start.
pub fn fallback_placeholder() -> MindMoment {
    MindMoment {
        id: None,
        cycle: 0,
        text: "I am waking. The room comes into focus, one shape at a time.".into(),
        essence_phrase: Some("waking".into()),
        mood: MoodVector { valence: 0.1, arousal: 0.2 },
        visual_percepts: Vec::new(),
        audio_percepts: Vec::new(),
        prior_moment_refs: Vec::new(),
        art: None,
        sound_brief: None,
        origin: Origin::Live,
        timestamp: Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now),
    }
}
