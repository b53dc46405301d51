//! Prompt assembly for one cognition call

use crate::aggregator::PerceptSnapshot;
use crate::config::LiveConfig;
use mindcycle_core::{MindMoment, Percept};
use mindcycle_llm::LlmRequest;
use std::fmt::Write;

const RESPONSE_FORMAT: &str = "Reply with a single JSON object and nothing else:\n\
{\"mindMoment\": \"<one or two sentences, present tense, first person>\",\n \
\"essencePhrase\": \"<two to four words distilling the moment>\",\n \
\"mood\": {\"valence\": <-1.0..1.0>, \"arousal\": <0.0..1.0>},\n \
\"soundBrief\": {\"texture\": \"<a few words>\", \"tempo\": \"slow|medium|fast\"}}";

pub fn build_request(
    config: &LiveConfig,
    cycle: u64,
    snapshot: &PerceptSnapshot,
    context: &[MindMoment],
) -> LlmRequest {
    let system = format!("{}\n\n{}", config.persona.trim(), RESPONSE_FORMAT);
    LlmRequest::new(config.model.clone())
        .with_system(system)
        .with_max_tokens(config.max_tokens)
        .with_temperature(config.temperature)
        .user(user_prompt(cycle, snapshot, context))
}

fn user_prompt(cycle: u64, snapshot: &PerceptSnapshot, context: &[MindMoment]) -> String {
    let mut out = format!("Cycle {}.\n", cycle);

    if !context.is_empty() {
        out.push_str("\nYour recent thoughts, newest first:\n");
        for m in context {
            let _ = writeln!(out, "- [{}] {}", m.cycle, m.text);
        }
    }

    out.push_str("\nWhat you saw:\n");
    write_percepts(&mut out, &snapshot.visual);
    out.push_str("\nWhat you heard:\n");
    write_percepts(&mut out, &snapshot.audio);
    out
}

fn write_percepts(out: &mut String, percepts: &[Percept]) {
    if percepts.is_empty() {
        out.push_str("(nothing)\n");
        return;
    }
    for p in percepts {
        let _ = writeln!(out, "- {}", p.describe());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_carries_persona_context_and_percepts() {
        let config = LiveConfig::default();
        let snapshot = PerceptSnapshot {
            visual: vec![Percept::visual(json!({"description": "a dog on a leash"}))],
            audio: vec![],
        };
        let context = vec![MindMoment::text_only(8, "The square is quiet.")];
        let req = build_request(&config, 9, &snapshot, &context);

        assert_eq!(req.model, config.model);
        assert!(req.system.as_deref().unwrap().contains("mindMoment"));
        assert_eq!(req.messages.len(), 1);
        let body = &req.messages[0].content;
        assert!(body.starts_with("Cycle 9."));
        assert!(body.contains("- [8] The square is quiet."));
        assert!(body.contains("- a dog on a leash"));
        assert!(body.contains("What you heard:\n(nothing)"));
    }

    #[test]
    fn empty_context_is_omitted() {
        let req = build_request(&LiveConfig::default(), 1, &PerceptSnapshot::default(), &[]);
        assert!(!req.messages[0].content.contains("recent thoughts"));
    }
}
