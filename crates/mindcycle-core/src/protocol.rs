//! Wire protocol - JSON event push to display clients, plus sensor ingress bodies
//!
//! Server → Client (event push, one JSON object per frame):
//!   { "event": "phase",   "data": { "phase": "SPOOL", "mode": "LIVE", "nextPhase": "SIGILIN", ... } }
//!   { "event": "moment",  "data": { "cycle": 42, "text": "...", "isDream": false, ... } }
//!   { "event": "percept", "data": { "timestamp": "...", "modality": "visual", "replayed": true, ... } }
//!
//! Client → Server (HTTP bodies):
//!   POST /percepts  { "modality": "audio", "payload": { "transcript": "..." } }
//!   POST /mode      { "mode": "dream" }

use crate::error::{Error, Result};
use crate::types::{MindMoment, Modality, Mode, MoodVector, Percept, PhaseEvent, SigilArt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Server → Client: Event push
// ---------------------------------------------------------------------------

/// Server-pushed event (no id, no request correlation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub event: String,
    pub data: serde_json::Value,
}

impl EventMessage {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Phase entry event.
    pub fn phase(event: &PhaseEvent) -> Self {
        Self::new(
            "phase",
            serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
        )
    }

    /// Moment display event.
    pub fn moment(moment: &MindMoment) -> Self {
        Self::new(
            "moment",
            serde_json::to_value(MomentPayload::from(moment)).unwrap_or(serde_json::Value::Null),
        )
    }

    /// Percept event. `replayed` is true for dream dispersal.
    pub fn percept(percept: &Percept, replayed: bool) -> Self {
        Self::new(
            "percept",
            serde_json::to_value(PerceptPayload {
                timestamp: percept.timestamp.clone(),
                modality: percept.modality,
                payload: percept.payload.clone(),
                replayed,
            })
            .unwrap_or(serde_json::Value::Null),
        )
    }

    /// Info event (sent on connection).
    pub fn info(version: &str, mode: Mode) -> Self {
        Self::new(
            "info",
            serde_json::json!({ "version": version, "mode": mode }),
        )
    }
}

/// Moment as shown to display clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MomentPayload {
    pub cycle: u64,
    pub text: String,
    pub essence_phrase: Option<String>,
    pub mood_vector: MoodVector,
    pub visual_percepts: Vec<Percept>,
    pub audio_percepts: Vec<Percept>,
    pub prior_moments: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub art: Option<SigilArt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound_brief: Option<serde_json::Value>,
    pub is_dream: bool,
    pub timestamp: DateTime<Utc>,
}

impl From<&MindMoment> for MomentPayload {
    fn from(m: &MindMoment) -> Self {
        Self {
            cycle: m.cycle,
            text: m.text.clone(),
            essence_phrase: m.essence_phrase.clone(),
            mood_vector: m.mood,
            visual_percepts: m.visual_percepts.clone(),
            audio_percepts: m.audio_percepts.clone(),
            prior_moments: m.prior_moment_refs.clone(),
            art: m.art.clone(),
            sound_brief: m.sound_brief.clone(),
            is_dream: m.is_dream(),
            timestamp: m.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerceptPayload {
    pub timestamp: String,
    pub modality: Modality,
    pub payload: serde_json::Value,
    pub replayed: bool,
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// Sensor ingress body. A missing timestamp means "now".
#[derive(Debug, Clone, Deserialize)]
pub struct PerceptInput {
    pub modality: Modality,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl PerceptInput {
    pub fn into_percept(self) -> Result<Percept> {
        if self.payload.is_null() {
            return Err(Error::invalid_message("percept payload is empty"));
        }
        match self.timestamp {
            None => Ok(Percept::now(self.modality, self.payload)),
            Some(ts) => {
                let at = DateTime::parse_from_rfc3339(&ts)
                    .map_err(|e| Error::InvalidTimestamp(format!("{}: {}", ts, e)))?;
                Ok(Percept::new(
                    self.modality,
                    self.payload,
                    at.with_timezone(&Utc),
                ))
            }
        }
    }
}

/// Mode switch body.
#[derive(Debug, Clone, Deserialize)]
pub struct ModeRequest {
    pub mode: Mode,
}
