//! Persistent narrative engine: turns an unordered set of user memories
//! into a stable, chapter-based life story and keeps it incrementally
//! extensible as new memories arrive.

pub mod assignment;
pub mod consistency;
pub mod context;
pub mod fallback;
pub mod periods;
pub mod service;

pub use assignment::{assign_chapter, next_sequence, ChapterAssignment};
pub use consistency::{context_digest, should_skip_regeneration};
pub use context::{build_context, normalize_memory};
pub use fallback::{
    fallback_chapter_content, fallback_draft, fallback_new_chapter, sentinel_draft, SENTINEL_TITLE,
};
pub use periods::{age_at_memory, extract_themes, period_for_age};
pub use service::{NarrativeEngine, UserLocks};

#[cfg(test)]
mod tests;
