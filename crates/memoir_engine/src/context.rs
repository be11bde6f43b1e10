//! Memory context normalization: raw memory records plus profile become a
//! canonical, length-bounded generation context.

use memoir_core::config::GenerationConfig;
use memoir_core::{
    GenerationContext, GenerationPreferences, MemoryRecord, MemorySummary, NarrativeError, Result,
    UserProfile,
};
use uuid::Uuid;

use crate::periods::{extract_themes, resolved_date};

/// Normalize one memory: body truncated to the configured bound, date
/// resolved, themes attached.
pub fn normalize_memory(memory: &MemoryRecord, cfg: &GenerationConfig) -> MemorySummary {
    MemorySummary {
        id: memory.id,
        title: memory.title.trim().to_string(),
        summary: truncate_summary(&memory.text, cfg.summary_max_chars),
        resolved_date: resolved_date(memory),
        location: memory.memory_location.clone(),
        themes: extract_themes(&format!("{} {}", memory.title, memory.text)),
    }
}

/// Build the canonical generation context. Pure: no I/O, no clock reads.
///
/// An empty memory list is a soft condition (the engine still produces a
/// sentinel narrative), so this only fails when the caller forbids the
/// fallback path with `allow_empty = false`.
pub fn build_context(
    user_id: Uuid,
    profile: &UserProfile,
    memories: &[MemoryRecord],
    preferences: GenerationPreferences,
    topics: Vec<String>,
    cfg: &GenerationConfig,
    allow_empty: bool,
) -> Result<GenerationContext> {
    if memories.is_empty() && !allow_empty {
        return Err(NarrativeError::InvalidContext(
            "no memories available and fallback narrative not requested".to_string(),
        ));
    }

    let mut summaries: Vec<MemorySummary> =
        memories.iter().map(|m| normalize_memory(m, cfg)).collect();
    summaries.sort_by(|a, b| a.resolved_date.cmp(&b.resolved_date).then(a.id.cmp(&b.id)));

    Ok(GenerationContext {
        user_id,
        profile: profile.clone(),
        memories: summaries,
        topics,
        preferences,
    })
}

/// Truncate on a char boundary with an ellipsis, keeping prompts small
/// and deterministic.
fn truncate_summary(s: &str, max_chars: usize) -> String {
    let s = s.trim();
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(title: &str, text: &str, date: Option<&str>) -> MemoryRecord {
        MemoryRecord {
            id: Uuid::new_v4(),
            title: title.to_string(),
            text: text.to_string(),
            memory_date: date.map(|d| d.parse().unwrap()),
            memory_location: None,
            tags: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn truncation_bounds_summary_length() {
        let long = "x".repeat(500);
        let m = record("t", &long, Some("2000-01-01"));
        let cfg = GenerationConfig::default();
        let summary = normalize_memory(&m, &cfg);
        assert_eq!(summary.summary.chars().count(), 200);
        assert!(summary.summary.ends_with("..."));

        let short = record("t", "short text", Some("2000-01-01"));
        assert_eq!(normalize_memory(&short, &cfg).summary, "short text");
    }

    #[test]
    fn context_orders_memories_by_date() {
        let cfg = GenerationConfig::default();
        let a = record("later", "b", Some("2010-01-01"));
        let b = record("earlier", "a", Some("1999-01-01"));
        let ctx = build_context(
            Uuid::new_v4(),
            &UserProfile::default(),
            &[a, b],
            GenerationPreferences::default(),
            vec![],
            &cfg,
            true,
        )
        .unwrap();
        assert_eq!(ctx.memories[0].title, "earlier");
        assert_eq!(ctx.memories[1].title, "later");
    }

    #[test]
    fn empty_context_is_soft_unless_forbidden() {
        let cfg = GenerationConfig::default();
        let ok = build_context(
            Uuid::new_v4(),
            &UserProfile::default(),
            &[],
            GenerationPreferences::default(),
            vec![],
            &cfg,
            true,
        );
        assert!(ok.unwrap().is_empty());

        let err = build_context(
            Uuid::new_v4(),
            &UserProfile::default(),
            &[],
            GenerationPreferences::default(),
            vec![],
            &cfg,
            false,
        );
        assert!(matches!(err, Err(NarrativeError::InvalidContext(_))));
    }
}
