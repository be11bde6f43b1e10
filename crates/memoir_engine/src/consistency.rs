//! Content-addressed consistency tracking: a stable digest over the
//! generation context, used as a cache key to skip redundant regeneration.

use memoir_core::{GenerationContext, RegenerationReason};
use sha2::{Digest, Sha256};

/// Compute a stable hex digest over the parts of the context that affect
/// narrative structure: sorted memory titles, memory count, topics,
/// generation preferences, and the profile fields that frame the story.
///
/// Two contexts hashing identically are treated as producing an
/// equivalent narrative.
pub fn context_digest(ctx: &GenerationContext) -> String {
    let mut hasher = Sha256::new();

    let mut titles: Vec<&str> = ctx.memories.iter().map(|m| m.title.as_str()).collect();
    titles.sort_unstable();
    for title in titles {
        hasher.update(title.as_bytes());
        hasher.update([0x1f]);
    }
    hasher.update(ctx.memories.len().to_string().as_bytes());
    hasher.update([0x1e]);

    for topic in &ctx.topics {
        hasher.update(topic.as_bytes());
        hasher.update([0x1f]);
    }
    hasher.update([0x1e]);

    hasher.update(ctx.preferences.tone.as_bytes());
    hasher.update([0x1f]);
    hasher.update(ctx.preferences.length.as_bytes());
    hasher.update([0x1f]);
    for theme in &ctx.preferences.focus_themes {
        hasher.update(theme.as_bytes());
        hasher.update([0x1f]);
    }
    hasher.update([0x1e]);

    hasher.update(ctx.profile.name.as_deref().unwrap_or("").as_bytes());
    hasher.update([0x1f]);
    hasher.update(
        ctx.profile
            .birth_date
            .map(|d| d.to_string())
            .unwrap_or_default()
            .as_bytes(),
    );
    hasher.update([0x1f]);
    hasher.update(ctx.profile.birth_place.as_deref().unwrap_or("").as_bytes());

    format!("{:x}", hasher.finalize())
}

/// The idempotence gate: regeneration is skipped when nothing changed,
/// unless the user explicitly asked (explicit override wins).
pub fn should_skip_regeneration(
    stored_hash: &str,
    new_digest: &str,
    reason: RegenerationReason,
) -> bool {
    reason != RegenerationReason::UserRequested && stored_hash == new_digest
}
