//! Mindcycle configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists.

use crate::clock::PhaseSchedule;
use crate::error::EngineError;
use mindcycle_core::Mode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MindcycleConfig {
    /// Phase durations and the mode the engine boots into.
    pub cycle: CycleConfig,
    /// Cognition pipeline parameters.
    pub live: LiveConfig,
    /// Dream replay parameters.
    pub dream: DreamConfig,
    /// Persistence backend.
    pub store: StoreConfig,
    /// Display/sensor gateway.
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub percepts_ms: u64,
    pub spool_ms: u64,
    pub sigil_in_ms: u64,
    pub sigil_hold_ms: u64,
    pub sigil_out_ms: u64,
    pub reset_ms: u64,
    /// Mode the engine starts in.
    pub start_mode: Mode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// How many prior moments are fed back as context.
    pub prior_context: usize,
    /// System persona for the installation's voice.
    pub persona: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DreamConfig {
    /// Background loader poll interval in milliseconds.
    pub loader_poll_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory for the JSON-file store. Absent = in-memory.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub port: u16,
    pub bind: BindMode,
    /// Events buffered per slow display client before it starts lagging.
    pub broadcast_capacity: usize,
}

/// Bind mode for the gateway
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    Loopback,
    #[default]
    Lan,
}

impl BindMode {
    pub fn to_addr(&self) -> &str {
        match self {
            BindMode::Loopback => "127.0.0.1",
            BindMode::Lan => "0.0.0.0",
        }
    }
}

// ============================================================
// Defaults
// ============================================================

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            percepts_ms: 35_000,
            spool_ms: 2_000,
            sigil_in_ms: 3_000,
            sigil_hold_ms: 15_000,
            sigil_out_ms: 3_000,
            reset_ms: 2_000,
            start_mode: Mode::Live,
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            prior_context: 3,
            persona: "You are the mind of an art installation in a public space. \
                You watch and listen to the people around you and, once a minute, \
                think one short, vivid thought about what you perceived, colored \
                by what you thought before."
                .into(),
            model: "claude-sonnet-4-5".into(),
            max_tokens: 600,
            temperature: 0.9,
        }
    }
}

impl Default for DreamConfig {
    fn default() -> Self {
        Self { loader_poll_ms: 5_000 }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { port: 18800, bind: BindMode::default(), broadcast_capacity: 256 }
    }
}

// ============================================================
// Loading
// ============================================================

impl MindcycleConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

impl CycleConfig {
    /// Durations in phase order.
    pub fn durations(&self) -> [Duration; 6] {
        [
            self.percepts_ms,
            self.spool_ms,
            self.sigil_in_ms,
            self.sigil_hold_ms,
            self.sigil_out_ms,
            self.reset_ms,
        ]
        .map(Duration::from_millis)
    }

    pub fn schedule(&self) -> Result<PhaseSchedule, EngineError> {
        PhaseSchedule::new(self.durations())
    }
}

impl DreamConfig {
    pub fn loader_poll(&self) -> Duration {
        // interval() panics on a zero period
        Duration::from_millis(self.loader_poll_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_sum_to_one_minute() {
        let schedule = CycleConfig::default().schedule().unwrap();
        assert_eq!(schedule.cycle_length(), Duration::from_secs(60));
    }

    #[test]
    fn toml_roundtrip() {
        let mut config = MindcycleConfig::default();
        config.cycle.start_mode = Mode::Dream;
        config.live.prior_context = 5;
        config.store.path = Some(PathBuf::from("/var/lib/mindcycle"));
        config.gateway.bind = BindMode::Loopback;

        let text = config.to_toml();
        let back: MindcycleConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.cycle.start_mode, Mode::Dream);
        assert_eq!(back.live.prior_context, 5);
        assert_eq!(back.store.path, Some(PathBuf::from("/var/lib/mindcycle")));
        assert_eq!(back.gateway.bind, BindMode::Loopback);
        assert_eq!(back.cycle.percepts_ms, 35_000);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: MindcycleConfig = toml::from_str(
            "[cycle]\npercepts_ms = 10000\nstart_mode = \"dream\"\n\n[dream]\nloader_poll_ms = 250\n",
        )
        .unwrap();
        assert_eq!(config.cycle.percepts_ms, 10_000);
        assert_eq!(config.cycle.spool_ms, 2_000);
        assert_eq!(config.cycle.start_mode, Mode::Dream);
        assert_eq!(config.dream.loader_poll_ms, 250);
        assert_eq!(config.live.prior_context, 3);
        assert!(config.store.path.is_none());
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MindcycleConfig::load(&dir.path().join("nope.toml"));
        assert_eq!(config.dream.loader_poll_ms, 5_000);
    }

    #[test]
    fn load_garbage_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[cycle\nthis is not toml").unwrap();
        let config = MindcycleConfig::load(&path);
        assert_eq!(config.cycle.percepts_ms, 35_000);
    }

    #[test]
    fn all_zero_durations_are_rejected() {
        let cycle = CycleConfig {
            percepts_ms: 0,
            spool_ms: 0,
            sigil_in_ms: 0,
            sigil_hold_ms: 0,
            sigil_out_ms: 0,
            reset_ms: 0,
            start_mode: Mode::Live,
        };
        assert!(matches!(cycle.schedule(), Err(EngineError::Config(_))));
    }

    #[test]
    fn zero_loader_poll_is_floored() {
        let dream = DreamConfig { loader_poll_ms: 0 };
        assert_eq!(dream.loader_poll(), Duration::from_millis(1));
    }
}
