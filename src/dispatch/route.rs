//! Intent routing
//!
//! Deterministic keyword rules run first; only when no rule fires is the
//! text LLM consulted with a fixed prompt listing the available skills,
//! expecting a single-token tag. The tag goes through the usual strict →
//! lenient → retry ladder; anything unrecognized falls back to the free-form
//! skill. The LLM may also answer `ambiguous`, which triggers clarification.

use std::sync::Arc;

use regex::RegexBuilder;
use tracing::debug;

use crate::llm::{ChatMessage, LlmOptions, TextLlm};
use crate::skills::{Skill as _, SkillRegistry};

/// Tag the router LLM may return instead of a skill name
pub const AMBIGUOUS_TAG: &str = "ambiguous";

/// Outcome of the deterministic + LLM routing pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Skill(String),
    /// Two or more disjoint skills matched, or the LLM pre-check punted
    Ambiguous { candidates: Vec<String> },
}

/// All skills whose keyword rules fire on the utterance.
pub fn keyword_matches(registry: &SkillRegistry, utterance: &str) -> Vec<String> {
    let mut matched = Vec::new();
    for skill in registry.iter() {
        let hit = skill.keywords().iter().any(|rule| {
            RegexBuilder::new(rule)
                .case_insensitive(true)
                .build()
                .map(|re| re.is_match(utterance))
                .unwrap_or(false)
        });
        if hit {
            matched.push(skill.name().to_string());
        }
    }
    matched
}

/// Full routing decision for an utterance.
///
/// `min_words` implements the short-utterance ambiguity rule: very short
/// requests that match nothing deterministic are not guessed at with
/// keywords alone.
pub async fn route(
    registry: &SkillRegistry,
    llm: &Arc<dyn TextLlm>,
    utterance: &str,
    min_words: usize,
) -> Route {
    let matched = keyword_matches(registry, utterance);

    match matched.len() {
        1 => return Route::Skill(matched.into_iter().next().unwrap()),
        n if n > 1 => return Route::Ambiguous { candidates: matched },
        _ => {}
    }

    // Nothing deterministic fired; ask the model.
    let tag = llm_route(registry, llm, utterance).await;
    debug!(%utterance, ?tag, "llm route");

    match tag {
        Some(tag) if tag == AMBIGUOUS_TAG => Route::Ambiguous {
            candidates: Vec::new(),
        },
        Some(tag) => Route::Skill(tag),
        // Too short to mean anything and the model was no help: ask rather
        // than guess.
        None if utterance.split_whitespace().count() < min_words => Route::Ambiguous {
            candidates: Vec::new(),
        },
        None => Route::Skill(crate::skills::FREE_FORM.to_string()),
    }
}

/// Single-token skill tag from the text LLM, one retry, `None` when the
/// model is unreachable or keeps answering prose.
async fn llm_route(
    registry: &SkillRegistry,
    llm: &Arc<dyn TextLlm>,
    utterance: &str,
) -> Option<String> {
    let listing: Vec<String> = registry
        .iter()
        .map(|s| format!("- {}: {}", s.name(), s.description()))
        .collect();
    let prompt = format!(
        "Route the user request to one skill.\n\nSkills:\n{}\n\n\
         Request: {}\n\n\
         Respond with exactly one skill name from the list, or `{}` if the \
         request could mean several of them.",
        listing.join("\n"),
        utterance,
        AMBIGUOUS_TAG,
    );

    let messages = [ChatMessage::user(prompt)];
    let options = LlmOptions::default();

    for attempt in 0..2 {
        let reply = match llm.chat(&messages, &options).await {
            Ok(reply) => reply,
            Err(_) => return None,
        };
        if let Some(tag) = parse_tag(registry, &reply) {
            return Some(tag);
        }
        if attempt == 0 {
            debug!("router reply unparseable, retrying once");
        }
    }
    None
}

/// Strict single token first, then a lenient scan for exactly one known tag.
fn parse_tag(registry: &SkillRegistry, reply: &str) -> Option<String> {
    let trimmed = reply.trim().trim_matches(|c: char| "`'\".".contains(c));

    if trimmed.eq_ignore_ascii_case(AMBIGUOUS_TAG) {
        return Some(AMBIGUOUS_TAG.to_string());
    }
    if registry.get(&trimmed.to_lowercase()).is_some() {
        return Some(trimmed.to_lowercase());
    }

    // Lenient: exactly one known skill name mentioned anywhere.
    let lower = reply.to_lowercase();
    let mentioned: Vec<String> = registry
        .iter()
        .map(|s| s.name().to_string())
        .filter(|name| lower.contains(name.as_str()))
        .collect();
    if mentioned.len() == 1 {
        return Some(mentioned.into_iter().next().unwrap());
    }
    None
}
