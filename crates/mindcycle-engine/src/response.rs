//! LLM response parsing
//!
//! Preferred shape is a JSON object, bare or inside a ```json fence:
//!   { "mindMoment": "...", "essencePhrase": "...", "mood": { "valence": 0.2, "arousal": 0.6 },
//!     "soundBrief": { ... } }
//!
//! Older prompts produced labelled lines, still accepted:
//!   MIND MOMENT: ...
//!   SIGIL PHRASE: ...
//!   VALENCE: 0.2
//!   AROUSAL: 0.6
//!
//! Plain prose with neither shape is taken as the moment text itself.

use crate::error::PipelineError;
use mindcycle_core::MoodVector;
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

/// Normalized result of one cognition call.
#[derive(Debug, Clone, PartialEq)]
pub struct Thought {
    pub text: String,
    pub essence_phrase: Option<String>,
    pub mood: MoodVector,
    pub sound_brief: Option<serde_json::Value>,
}

pub fn parse_response(raw: &str) -> Result<Thought, PipelineError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(PipelineError::Unparseable("empty response".into()));
    }
    if let Some(thought) = parse_structured(raw) {
        return Ok(thought);
    }
    if let Some(thought) = parse_labelled(raw) {
        return Ok(thought);
    }
    // Prose fallback, unless it looks like JSON we failed to read.
    if raw.starts_with('{') || raw.starts_with("```") {
        return Err(PipelineError::Unparseable(preview(raw)));
    }
    Ok(Thought {
        text: raw.to_string(),
        essence_phrase: None,
        mood: MoodVector::default(),
        sound_brief: None,
    })
}

// ---------------------------------------------------------------------------
// Structured
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StructuredThought {
    #[serde(rename = "mindMoment", alias = "mind_moment", alias = "text", alias = "moment")]
    mind_moment: Option<String>,
    #[serde(
        default,
        rename = "essencePhrase",
        alias = "essence_phrase",
        alias = "sigilPhrase",
        alias = "sigil_phrase"
    )]
    essence_phrase: Option<String>,
    #[serde(default, alias = "moodVector", alias = "mood_vector")]
    mood: Option<RawMood>,
    #[serde(default, rename = "soundBrief", alias = "sound_brief")]
    sound_brief: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawMood {
    #[serde(default)]
    valence: f64,
    #[serde(default)]
    arousal: f64,
}

fn parse_structured(raw: &str) -> Option<Thought> {
    let body = extract_json_object(raw)?;
    let parsed: StructuredThought = serde_json::from_str(body).ok()?;
    let text = parsed.mind_moment.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())?;
    let mood = parsed
        .mood
        .map(|m| MoodVector { valence: m.valence, arousal: m.arousal })
        .unwrap_or_default()
        .clamped();
    Some(Thought {
        text,
        essence_phrase: parsed.essence_phrase.and_then(clean_phrase),
        mood,
        sound_brief: parsed.sound_brief.filter(|v| !v.is_null()),
    })
}

/// The outermost `{ ... }` span, after stripping any code fence.
fn extract_json_object(raw: &str) -> Option<&str> {
    let unfenced = match raw.find("```") {
        Some(start) => {
            let after = &raw[start + 3..];
            let after = after.strip_prefix("json").unwrap_or(after);
            match after.find("```") {
                Some(end) => &after[..end],
                None => after,
            }
        }
        None => raw,
    };
    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    (end > start).then(|| &unfenced[start..=end])
}

// ---------------------------------------------------------------------------
// Labelled lines
// ---------------------------------------------------------------------------

fn label_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?im)^\s*\**\s*(mind\s*moment|moment|sigil\s*phrase|essence(?:\s*phrase)?|valence|arousal)\s*\**\s*:\s*\**\s*(.+?)\s*$",
        )
        .ok()
    })
    .as_ref()
}

fn parse_labelled(raw: &str) -> Option<Thought> {
    let mut text = None;
    let mut phrase = None;
    let mut mood = MoodVector::default();

    for caps in label_regex()?.captures_iter(raw) {
        let label = caps[1].to_ascii_lowercase();
        let value = caps[2].trim();
        let label: String = label.split_whitespace().collect::<Vec<_>>().join(" ");
        match label.as_str() {
            "mind moment" | "mindmoment" | "moment" => text = Some(value.to_string()),
            "valence" => mood.valence = leading_number(value).unwrap_or(0.0),
            "arousal" => mood.arousal = leading_number(value).unwrap_or(0.0),
            _ => phrase = clean_phrase(value.to_string()),
        }
    }

    Some(Thought {
        text: text.filter(|t| !t.is_empty())?,
        essence_phrase: phrase,
        mood: mood.clamped(),
        sound_brief: None,
    })
}

fn leading_number(s: &str) -> Option<f64> {
    let end = s
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '-' || *c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s[..end].parse().ok()
}

fn clean_phrase(phrase: String) -> Option<String> {
    let trimmed = phrase.trim().trim_matches(|c| c == '"' || c == '\'' || c == '*').trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn preview(raw: &str) -> String {
    raw.chars().take(80).collect()
}
