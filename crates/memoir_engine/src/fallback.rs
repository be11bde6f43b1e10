//! Deterministic fallback generation. When the text backend is down, the
//! biography must still be producible: these templates build structurally
//! valid prose from nothing but the memory titles, dates and locations
//! already in the context.

use chrono::Datelike;
use memoir_core::{
    DraftChapter, GenerationContext, LifePeriod, MemorySummary, NarrativeDraft,
};
use std::collections::BTreeMap;

use crate::periods::period_for_age;

/// Title of the single placeholder chapter a zero-memory biography gets.
/// This is the one chapter exempt from the non-empty `memory_ids`
/// invariant.
pub const SENTINEL_TITLE: &str = "The Story Begins";

fn narrator_name(ctx: &GenerationContext) -> String {
    ctx.profile
        .name
        .clone()
        .unwrap_or_else(|| "this storyteller".to_string())
}

fn summary_age(summary: &MemorySummary, birth_year: Option<i32>, assumed_age: i32) -> i32 {
    match birth_year {
        Some(year) => (summary.resolved_date.year() - year).max(0),
        None => assumed_age,
    }
}

fn memory_sentence(memory: &MemorySummary) -> String {
    let mut sentence = format!("In {}, {}", memory.resolved_date.year(), memory.title.trim());
    if let Some(location) = &memory.location {
        sentence.push_str(&format!(", in {}", location));
    }
    sentence.push('.');
    sentence
}

/// Build the full-biography fallback narrative: one chapter per occupied
/// life period, every chapter carrying the ids it was built from.
pub fn fallback_draft(ctx: &GenerationContext, assumed_age: i32) -> NarrativeDraft {
    let birth_year = ctx.profile.birth_year();
    let name = narrator_name(ctx);

    let mut buckets: BTreeMap<LifePeriod, Vec<&MemorySummary>> = BTreeMap::new();
    for memory in &ctx.memories {
        let period = period_for_age(summary_age(memory, birth_year, assumed_age));
        buckets.entry(period).or_default().push(memory);
    }

    let chapters: Vec<DraftChapter> = buckets
        .into_iter()
        .map(|(period, memories)| {
            let mut content = String::new();
            for memory in &memories {
                content.push_str(&memory_sentence(memory));
                content.push(' ');
            }
            content.push_str(&format!(
                "These {} moments belong to the {} of {}'s life.",
                memories.len(),
                period.display_name().to_lowercase(),
                name,
            ));
            let bounds = period.age_bounds();
            DraftChapter {
                title: period.display_name().to_string(),
                content,
                life_period: period,
                age_range_start: bounds.map(|(s, _)| s),
                age_range_end: bounds.map(|(_, e)| e),
                memory_ids: memories.iter().map(|m| m.id).collect(),
            }
        })
        .collect();

    let mut introduction = format!(
        "This is the story of {}, told through {} remembered moments.",
        name,
        ctx.memories.len()
    );
    if let Some(place) = &ctx.profile.birth_place {
        introduction.push_str(&format!(" It begins in {}.", place));
    }

    let years: Vec<i32> = ctx.memories.iter().map(|m| m.resolved_date.year()).collect();
    let conclusion = match (years.iter().min(), years.iter().max()) {
        (Some(first), Some(last)) if first != last => format!(
            "From {} to {}, these memories trace a life still being written.",
            first, last
        ),
        (Some(year), _) => format!(
            "Gathered from {}, these memories are the opening lines of a longer story.",
            year
        ),
        _ => "These memories are the opening lines of a longer story.".to_string(),
    };

    NarrativeDraft {
        introduction,
        chapters,
        conclusion,
    }
}

/// The well-known sentinel narrative for a user with no memories yet.
pub fn sentinel_draft(ctx: &GenerationContext) -> NarrativeDraft {
    let name = narrator_name(ctx);
    NarrativeDraft {
        introduction: format!(
            "This is the beginning of {}'s story. No memories have been gathered yet.",
            name
        ),
        chapters: vec![DraftChapter {
            title: SENTINEL_TITLE.to_string(),
            content: format!(
                "Every life story starts with a blank page. As {} shares memories, \
                 chapters will take shape here.",
                name
            ),
            life_period: LifePeriod::Comprehensive,
            age_range_start: None,
            age_range_end: None,
            memory_ids: Vec::new(),
        }],
        conclusion: "The first remembered moment will open the first real chapter.".to_string(),
    }
}

/// Replacement content for an existing chapter gaining one new memory.
/// The returned string replaces the chapter content wholesale; it keeps
/// the prior prose and weaves one new sentence after it.
pub fn fallback_chapter_content(existing_content: &str, memory: &MemorySummary) -> String {
    format!(
        "{}\n\nAnother moment belongs here: {}",
        existing_content.trim_end(),
        memory_sentence(memory)
    )
}

/// A brand-new chapter synthesized around one memory, for the fallback
/// path of a create-new insertion.
pub fn fallback_new_chapter(memory: &MemorySummary, period: LifePeriod) -> DraftChapter {
    let bounds = period.age_bounds();
    let mut content = memory_sentence(memory);
    if !memory.summary.is_empty() {
        content.push(' ');
        content.push_str(&memory.summary);
        if !memory.summary.ends_with('.') {
            content.push('.');
        }
    }
    DraftChapter {
        title: format!("{}: {}", period.display_name(), memory.title.trim()),
        content,
        life_period: period,
        age_range_start: bounds.map(|(s, _)| s),
        age_range_end: bounds.map(|(_, e)| e),
        memory_ids: vec![memory.id],
    }
}
