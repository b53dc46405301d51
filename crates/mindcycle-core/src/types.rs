//! Core types for Mindcycle

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned identifier of a persisted mind moment.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MomentId(String);

impl MomentId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MomentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MomentId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for MomentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// Phase / Mode
// ---------------------------------------------------------------------------

/// One of the six phases of a cycle. Order is fixed and cyclic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Percepts,
    Spool,
    SigilIn,
    SigilHold,
    SigilOut,
    Reset,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Percepts,
        Phase::Spool,
        Phase::SigilIn,
        Phase::SigilHold,
        Phase::SigilOut,
        Phase::Reset,
    ];

    pub fn index(self) -> usize {
        match self {
            Phase::Percepts => 0,
            Phase::Spool => 1,
            Phase::SigilIn => 2,
            Phase::SigilHold => 3,
            Phase::SigilOut => 4,
            Phase::Reset => 5,
        }
    }

    pub fn from_index(i: usize) -> Self {
        Self::ALL[i % Self::ALL.len()]
    }

    /// The phase that follows this one. RESET wraps to PERCEPTS.
    pub fn next(self) -> Self {
        Self::from_index(self.index() + 1)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Percepts => "PERCEPTS",
            Phase::Spool => "SPOOL",
            Phase::SigilIn => "SIGILIN",
            Phase::SigilHold => "SIGILHOLD",
            Phase::SigilOut => "SIGILOUT",
            Phase::Reset => "RESET",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    #[default]
    #[serde(alias = "live")]
    Live,
    #[serde(alias = "dream")]
    Dream,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Live => "LIVE",
            Mode::Dream => "DREAM",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Mode::Live),
            "dream" => Ok(Mode::Dream),
            other => Err(crate::Error::UnknownMode(other.to_string())),
        }
    }
}

/// Emitted on every phase entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseEvent {
    pub phase: Phase,
    pub mode: Mode,
    pub next_phase: Phase,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub cycle_number: u64,
}

// ---------------------------------------------------------------------------
// Percepts
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Visual,
    Audio,
}

/// A single timestamped sensory event.
///
/// The timestamp is kept as RFC 3339 text: replayed percepts come back from
/// storage verbatim and may not parse.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Percept {
    pub timestamp: String,
    pub modality: Modality,
    pub payload: serde_json::Value,
}

impl Percept {
    pub fn new(modality: Modality, payload: serde_json::Value, at: DateTime<Utc>) -> Self {
        Self {
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            modality,
            payload,
        }
    }

    /// Percept stamped with the current wall-clock time.
    pub fn now(modality: Modality, payload: serde_json::Value) -> Self {
        Self::new(modality, payload, Utc::now())
    }

    pub fn visual(payload: serde_json::Value) -> Self {
        Self::now(Modality::Visual, payload)
    }

    pub fn audio(payload: serde_json::Value) -> Self {
        Self::now(Modality::Audio, payload)
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Short human-readable rendering of the payload, used in prompts.
    pub fn describe(&self) -> String {
        match &self.payload {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(map) => ["description", "transcript", "text", "summary"]
                .iter()
                .find_map(|k| map.get(*k).and_then(|v| v.as_str()))
                .map(str::to_string)
                .unwrap_or_else(|| self.payload.to_string()),
            other => other.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Mind moments
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MoodVector {
    pub valence: f64,
    pub arousal: f64,
}

impl MoodVector {
    pub const VALENCE_RANGE: (f64, f64) = (-1.0, 1.0);
    pub const AROUSAL_RANGE: (f64, f64) = (0.0, 1.0);

    /// Clamp both axes into their valid ranges. NaN collapses to the lower bound.
    pub fn clamped(self) -> Self {
        Self {
            valence: clamp_axis(self.valence, Self::VALENCE_RANGE),
            arousal: clamp_axis(self.arousal, Self::AROUSAL_RANGE),
        }
    }
}

fn clamp_axis(v: f64, (lo, hi): (f64, f64)) -> f64 {
    if v.is_nan() {
        lo
    } else {
        v.clamp(lo, hi)
    }
}

/// Rendered sigil raster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SigilArt {
    pub width: u32,
    pub height: u32,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    #[default]
    Live,
    Dream,
}

/// The structured record produced each LIVE cycle, or replayed each DREAM cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MindMoment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MomentId>,
    pub cycle: u64,
    pub text: String,
    #[serde(default)]
    pub essence_phrase: Option<String>,
    #[serde(default)]
    pub mood: MoodVector,
    #[serde(default)]
    pub visual_percepts: Vec<Percept>,
    #[serde(default)]
    pub audio_percepts: Vec<Percept>,
    #[serde(default)]
    pub prior_moment_refs: Vec<u64>,
    #[serde(default)]
    pub art: Option<SigilArt>,
    #[serde(default)]
    pub sound_brief: Option<serde_json::Value>,
    #[serde(default)]
    pub origin: Origin,
    pub timestamp: DateTime<Utc>,
}

impl MindMoment {
    /// A text-only LIVE moment with no percepts or context.
    pub fn text_only(cycle: u64, text: impl Into<String>) -> Self {
        Self {
            id: None,
            cycle,
            text: text.into(),
            essence_phrase: None,
            mood: MoodVector::default(),
            visual_percepts: Vec::new(),
            audio_percepts: Vec::new(),
            prior_moment_refs: Vec::new(),
            art: None,
            sound_brief: None,
            origin: Origin::Live,
            timestamp: Utc::now(),
        }
    }

    pub fn is_dream(&self) -> bool {
        self.origin == Origin::Dream
    }

    pub fn has_art(&self) -> bool {
        self.art.is_some()
    }

    pub fn percept_count(&self) -> usize {
        self.visual_percepts.len() + self.audio_percepts.len()
    }

    /// Replay requires rendered art and at least one percept.
    pub fn is_dream_eligible(&self) -> bool {
        self.has_art() && self.percept_count() > 0
    }

    /// Mark a hydrated record as a replay.
    pub fn into_dream(mut self) -> Self {
        self.origin = Origin::Dream;
        self
    }

    /// All percepts, visual first, each modality in stored order.
    pub fn percepts(&self) -> impl Iterator<Item = &Percept> {
        self.visual_percepts.iter().chain(self.audio_percepts.iter())
    }
}

/// Base64 text encoding for raster bytes, in storage and on the wire.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
