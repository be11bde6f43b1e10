//! Prompt rendering and response parsing. The prompt text is a
//! serialization detail of this adapter: the engine hands over a
//! structured request and gets a structured draft back, never free text.

use anyhow::{Context, Result};
use memoir_core::{
    DraftChapter, GenerationMode, GenerationRequest, LifePeriod, NarrativeDraft,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

const FULL_INSTRUCTIONS: &str = "Write a life biography from the memories below. Group \
memories into chapters by life period, in chronological order. Reference memories only \
by the ids given. Respond with exactly one JSON object: {\"introduction\": string, \
\"chapters\": [{\"title\": string, \"content\": string, \"life_period\": string, \
\"memory_ids\": [string], \"age_range_start\": number|null, \"age_range_end\": \
number|null}], \"conclusion\": string}. No other text.";

const UPDATE_INSTRUCTIONS: &str = "Rewrite the existing chapter below so it also weaves \
in the new memory. Keep the chapter's voice and scope; do not append the memory \
verbatim. Respond with exactly one JSON object of the same shape, containing a single \
chapter. No other text.";

const INSERTION_INSTRUCTIONS: &str = "Write one new biography chapter around the memory \
below. Respond with exactly one JSON object of the same shape, containing a single \
chapter. No other text.";

/// Render the structured request as the prompt body.
pub fn render(request: &GenerationRequest) -> Result<String> {
    let instructions = match request.mode {
        GenerationMode::FullBiography => FULL_INSTRUCTIONS,
        GenerationMode::ChapterUpdate => UPDATE_INSTRUCTIONS,
        GenerationMode::MemoryInsertion => INSERTION_INSTRUCTIONS,
    };
    let payload = json!({
        "profile": request.context.profile,
        "preferences": request.context.preferences,
        "topics": request.context.topics,
        "memories": request.context.memories,
        "existing_chapter": request.chapter,
    });
    Ok(format!(
        "{}\n\nInput:\n{}",
        instructions,
        serde_json::to_string_pretty(&payload).context("Failed to encode prompt payload")?
    ))
}

// Wire shape is looser than the domain type: models omit optional fields
// and occasionally invent period names, so everything defaults.
#[derive(Debug, Deserialize)]
struct WireDraft {
    #[serde(default)]
    introduction: String,
    #[serde(default)]
    chapters: Vec<WireChapter>,
    #[serde(default)]
    conclusion: String,
}

#[derive(Debug, Deserialize)]
struct WireChapter {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    life_period: String,
    #[serde(default)]
    memory_ids: Vec<Uuid>,
    #[serde(default)]
    age_range_start: Option<i32>,
    #[serde(default)]
    age_range_end: Option<i32>,
}

/// Parse the model's reply into a draft, tolerating code fences.
pub fn parse_draft(text: &str) -> Result<NarrativeDraft> {
    let body = strip_code_fences(text);
    let wire: WireDraft =
        serde_json::from_str(body).context("Backend reply was not the expected JSON draft")?;
    Ok(NarrativeDraft {
        introduction: wire.introduction,
        conclusion: wire.conclusion,
        chapters: wire
            .chapters
            .into_iter()
            .map(|c| DraftChapter {
                title: c.title,
                content: c.content,
                life_period: LifePeriod::parse(&c.life_period)
                    .unwrap_or(LifePeriod::Comprehensive),
                age_range_start: c.age_range_start,
                age_range_end: c.age_range_end,
                memory_ids: c.memory_ids,
            })
            .collect(),
    })
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}
