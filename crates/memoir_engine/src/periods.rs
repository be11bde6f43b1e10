//! Life-period classification: maps memories to ordered age bands and
//! extracts coarse advisory themes by keyword matching.

use chrono::{Datelike, NaiveDate};
use memoir_core::{LifePeriod, MemoryRecord};

/// Theme vocabulary. Themes enrich prose and chapter titles; they are
/// never required for structural correctness.
const THEME_VOCABULARY: &[(&str, &[&str])] = &[
    (
        "family",
        &[
            "family", "mother", "father", "mom", "dad", "sister", "brother", "parents",
            "grandmother", "grandfather", "daughter", "son", "wedding", "home",
        ],
    ),
    (
        "exploration",
        &[
            "travel", "journey", "adventure", "moved", "abroad", "explore", "discovered",
            "trip", "visited", "new city",
        ],
    ),
    (
        "deep-connections",
        &[
            "friend", "love", "relationship", "partner", "together", "met", "reunion",
            "community",
        ],
    ),
    (
        "purposeful-endeavor",
        &[
            "work", "career", "job", "project", "built", "started", "founded", "studied",
            "graduated", "school", "business",
        ],
    ),
    (
        "continuous-growth",
        &[
            "learned", "growth", "changed", "realized", "understood", "lesson", "practice",
            "improved",
        ],
    ),
    (
        "resilience",
        &[
            "difficult", "loss", "struggle", "overcame", "recovered", "challenge", "illness",
            "grief", "hard time",
        ],
    ),
];

/// Map an age to its life-period band using fixed integer thresholds.
pub fn period_for_age(age: i32) -> LifePeriod {
    if age <= 12 {
        LifePeriod::EarlyFoundations
    } else if age <= 18 {
        LifePeriod::GrowingYears
    } else if age <= 28 {
        LifePeriod::ComingIntoFocus
    } else if age <= 45 {
        LifePeriod::BuildingAndCreating
    } else if age <= 65 {
        LifePeriod::Flourishing
    } else {
        LifePeriod::WisdomYears
    }
}

/// The date a memory is anchored to: its explicit date when present,
/// otherwise the day it was recorded.
pub fn resolved_date(memory: &MemoryRecord) -> NaiveDate {
    memory
        .memory_date
        .unwrap_or_else(|| memory.created_at.date_naive())
}

/// Age of the user at the time of a memory. An unknown birth year
/// classifies at `assumed_age` instead of failing.
pub fn age_at_memory(memory: &MemoryRecord, birth_year: Option<i32>, assumed_age: i32) -> i32 {
    match birth_year {
        Some(year) => (resolved_date(memory).year() - year).max(0),
        None => assumed_age,
    }
}

/// Extract advisory theme tags from free text.
pub fn extract_themes(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut themes = Vec::new();
    for (theme, keywords) in THEME_VOCABULARY {
        if keywords.iter().any(|k| lower.contains(k)) {
            themes.push((*theme).to_string());
        }
    }
    themes
}
