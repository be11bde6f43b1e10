//! The narrative engine service: orchestrates normalization,
//! classification, generation and persistence behind the three caller
//! operations, serialized per user.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use memoir_core::{
    Biography, BiographyRecord, BiographyRepository, Chapter, ChapterWrite, GenerationContext,
    GenerationMode, GenerationPreferences, GenerationRequest, GeneratorKind, InsertionReport,
    InsertionWrite, MemoirConfig, MemoryRecord, MemoryStore, NarrativeDraft, NarrativeError,
    ProfileStore, RegenerationReason, Result, TextBackend, UserProfile,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::assignment::{assign_chapter, next_sequence, ChapterAssignment};
use crate::consistency::{context_digest, should_skip_regeneration};
use crate::context::{build_context, normalize_memory};
use crate::fallback::{
    fallback_chapter_content, fallback_draft, fallback_new_chapter, sentinel_draft,
};
use crate::periods::{age_at_memory, period_for_age};

/// Per-user mutual exclusion for the read-decide-write sequence. Every
/// regeneration and insertion runs under the owning user's lock; the
/// guard is dropped on all exit paths. Cross-process writers are caught
/// by the repository's revision check instead.
#[derive(Default)]
pub struct UserLocks {
    inner: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub async fn for_user(&self, user_id: Uuid) -> Arc<Mutex<()>> {
        let mut table = self.inner.lock().await;
        // Entries nobody holds anymore would otherwise accumulate for
        // every user ever seen by a long-lived process.
        table.retain(|id, lock| *id == user_id || Arc::strong_count(lock) > 1);
        table.entry(user_id).or_default().clone()
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// The stateless engine: all state lives behind the injected stores.
pub struct NarrativeEngine {
    memories: Arc<dyn MemoryStore>,
    profiles: Arc<dyn ProfileStore>,
    repository: Arc<dyn BiographyRepository>,
    backend: Arc<dyn TextBackend>,
    config: MemoirConfig,
    locks: UserLocks,
}

impl NarrativeEngine {
    pub fn new(
        memories: Arc<dyn MemoryStore>,
        profiles: Arc<dyn ProfileStore>,
        repository: Arc<dyn BiographyRepository>,
        backend: Arc<dyn TextBackend>,
        config: MemoirConfig,
    ) -> Self {
        Self {
            memories,
            profiles,
            repository,
            backend,
            config,
            locks: UserLocks::default(),
        }
    }

    /// Return the user's biography, generating it first if none exists.
    /// Idempotent: an existing biography is returned untouched.
    pub async fn get_or_create_biography(&self, user_id: Uuid) -> Result<BiographyRecord> {
        let lock = self.locks.for_user(user_id).await;
        let _guard = lock.lock().await;

        if let Some(existing) = self.repository.load(user_id).await? {
            return Ok(existing);
        }
        self.regenerate_locked(user_id, RegenerationReason::InitialCreation, None, None, None)
            .await
    }

    /// Rebuild the whole biography. Skipped (no backend call, no write)
    /// when the generation context hashes to the stored `content_hash`,
    /// unless the user explicitly asked.
    pub async fn regenerate_biography(
        &self,
        user_id: Uuid,
        reason: RegenerationReason,
        user_prompt: Option<String>,
    ) -> Result<BiographyRecord> {
        let lock = self.locks.for_user(user_id).await;
        let _guard = lock.lock().await;

        let existing = self.repository.load(user_id).await?;
        self.regenerate_locked(user_id, reason, user_prompt, existing, None)
            .await
    }

    /// Fold one new memory into the narrative: either one existing
    /// chapter is rewritten or exactly one new chapter is appended.
    pub async fn insert_memory_into_narrative(
        &self,
        user_id: Uuid,
        memory: MemoryRecord,
    ) -> Result<InsertionReport> {
        let lock = self.locks.for_user(user_id).await;
        let _guard = lock.lock().await;

        let existing = self.repository.load(user_id).await?;

        // No biography yet, or only the zero-memory sentinel: a full
        // build folds the memory in along with everything else on record.
        let record = match existing {
            Some(record) if !record.biography.memories_included.is_empty() => record,
            sentinel_or_absent => {
                let record = self
                    .regenerate_locked(
                        user_id,
                        RegenerationReason::MemoryAdded,
                        None,
                        sentinel_or_absent,
                        Some(&memory),
                    )
                    .await?;
                let chapter = record
                    .chapters
                    .iter()
                    .find(|c| c.memory_ids.contains(&memory.id))
                    .or_else(|| record.chapters.first())
                    .cloned();
                return Ok(InsertionReport {
                    updated_chapter: None,
                    new_chapter: chapter,
                });
            }
        };
        let profile = self.profiles.get_profile(user_id).await?;
        let age = age_at_memory(
            &memory,
            profile.birth_year(),
            self.config.generation.assumed_age,
        );
        let summary = normalize_memory(&memory, &self.config.generation);
        let context = self.single_memory_context(user_id, &profile, &memory)?;

        match assign_chapter(age, &record.chapters) {
            ChapterAssignment::UpdateExisting { chapter_id } => {
                let target = record
                    .chapters
                    .iter()
                    .find(|c| c.id == chapter_id)
                    .cloned()
                    .ok_or_else(|| {
                        NarrativeError::Storage(anyhow::anyhow!(
                            "assigned chapter {} missing from record",
                            chapter_id
                        ))
                    })?;

                let request = GenerationRequest {
                    context,
                    mode: GenerationMode::ChapterUpdate,
                    chapter: Some(target.clone()),
                };
                let (content, generated_by) = match self.call_backend(&request).await {
                    Ok(draft) => match draft.chapters.into_iter().next() {
                        Some(c) if !c.content.trim().is_empty() => {
                            (c.content, GeneratorKind::Backend)
                        }
                        _ => {
                            tracing::warn!(user_id = %user_id, "backend returned empty chapter update, using fallback");
                            (
                                fallback_chapter_content(&target.content, &summary),
                                GeneratorKind::Fallback,
                            )
                        }
                    },
                    Err(NarrativeError::GenerationTimeout(d)) => {
                        // Aborting beats silently replacing existing prose
                        // with template text.
                        return Err(NarrativeError::GenerationTimeout(d));
                    }
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, error = %e, "backend failed for chapter update, using fallback");
                        (
                            fallback_chapter_content(&target.content, &summary),
                            GeneratorKind::Fallback,
                        )
                    }
                };

                let mut updated = target;
                updated.content = content;
                if !updated.memory_ids.contains(&memory.id) {
                    updated.memory_ids.push(memory.id);
                }

                let write = InsertionWrite {
                    user_id,
                    expected_revision: record.biography.revision,
                    chapter: ChapterWrite::Update(updated.clone()),
                    memory_id: memory.id,
                    reason: RegenerationReason::MemoryAdded,
                    generated_by,
                };
                self.repository.apply_insertion(&write).await?;
                tracing::info!(
                    user_id = %user_id,
                    chapter = updated.sequence,
                    generated_by = generated_by.as_str(),
                    "memory woven into existing chapter"
                );
                Ok(InsertionReport {
                    updated_chapter: Some(updated),
                    new_chapter: None,
                })
            }
            ChapterAssignment::CreateNew => {
                let period = period_for_age(age);
                let request = GenerationRequest {
                    context,
                    mode: GenerationMode::MemoryInsertion,
                    chapter: None,
                };
                let (draft_chapter, generated_by) = match self.call_backend(&request).await {
                    Ok(draft) => match draft.chapters.into_iter().next() {
                        Some(c) if !c.content.trim().is_empty() => (c, GeneratorKind::Backend),
                        _ => {
                            tracing::warn!(user_id = %user_id, "backend returned empty new chapter, using fallback");
                            (fallback_new_chapter(&summary, period), GeneratorKind::Fallback)
                        }
                    },
                    Err(NarrativeError::GenerationTimeout(d)) => {
                        return Err(NarrativeError::GenerationTimeout(d));
                    }
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, error = %e, "backend failed for new chapter, using fallback");
                        (fallback_new_chapter(&summary, period), GeneratorKind::Fallback)
                    }
                };

                // Structural fields are the engine's call, not the
                // generator's: period, age bounds, id list.
                let bounds = period.age_bounds();
                let chapter = Chapter {
                    id: Uuid::new_v4(),
                    biography_id: record.biography.id,
                    sequence: next_sequence(&record.chapters),
                    title: draft_chapter.title,
                    content: draft_chapter.content,
                    life_period: period,
                    age_range_start: bounds.map(|(s, _)| s),
                    age_range_end: bounds.map(|(_, e)| e),
                    memory_ids: vec![memory.id],
                };

                let write = InsertionWrite {
                    user_id,
                    expected_revision: record.biography.revision,
                    chapter: ChapterWrite::Insert(chapter.clone()),
                    memory_id: memory.id,
                    reason: RegenerationReason::MemoryAdded,
                    generated_by,
                };
                self.repository.apply_insertion(&write).await?;
                tracing::info!(
                    user_id = %user_id,
                    sequence = chapter.sequence,
                    period = chapter.life_period.as_str(),
                    generated_by = generated_by.as_str(),
                    "new chapter appended for memory"
                );
                Ok(InsertionReport {
                    updated_chapter: None,
                    new_chapter: Some(chapter),
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals (caller must hold the user's lock)
    // ------------------------------------------------------------------

    async fn regenerate_locked(
        &self,
        user_id: Uuid,
        reason: RegenerationReason,
        user_prompt: Option<String>,
        existing: Option<BiographyRecord>,
        extra_memory: Option<&MemoryRecord>,
    ) -> Result<BiographyRecord> {
        let mut memories = self.memories.list_memories(user_id).await?;
        if let Some(extra) = extra_memory {
            if !memories.iter().any(|m| m.id == extra.id) {
                memories.push(extra.clone());
            }
        }
        let profile = self.profiles.get_profile(user_id).await?;

        let preferences = GenerationPreferences {
            tone: self.config.generation.tone.clone(),
            length: self.config.generation.length.clone(),
            focus_themes: user_prompt.into_iter().collect(),
        };
        let context = build_context(
            user_id,
            &profile,
            &memories,
            preferences,
            Vec::new(),
            &self.config.generation,
            true,
        )?;
        let context = with_topics(context);

        let digest = context_digest(&context);
        if let Some(existing) = &existing {
            if should_skip_regeneration(&existing.biography.content_hash, &digest, reason) {
                tracing::debug!(user_id = %user_id, "context unchanged, regeneration skipped");
                return Ok(existing.clone());
            }
        }

        let (draft, generated_by) = self.full_draft(&context).await;

        let biography_id = existing
            .as_ref()
            .map(|r| r.biography.id)
            .unwrap_or_else(Uuid::new_v4);
        let now = Utc::now();

        let chapters: Vec<Chapter> = draft
            .chapters
            .into_iter()
            .enumerate()
            .map(|(i, c)| Chapter {
                id: Uuid::new_v4(),
                biography_id,
                sequence: (i + 1) as i64,
                title: c.title,
                content: c.content,
                life_period: c.life_period,
                age_range_start: c.age_range_start,
                age_range_end: c.age_range_end,
                memory_ids: c.memory_ids,
            })
            .collect();

        // memories_included covers everything folded into the narrative,
        // a superset of every chapter's id list.
        let mut included: Vec<Uuid> = context.memories.iter().map(|m| m.id).collect();
        for chapter in &chapters {
            for id in &chapter.memory_ids {
                if !included.contains(id) {
                    included.push(*id);
                }
            }
        }

        let record = BiographyRecord {
            biography: Biography {
                id: biography_id,
                user_id,
                introduction: draft.introduction,
                conclusion: draft.conclusion,
                memories_included: included,
                content_hash: digest,
                last_regenerated_at: now,
                regeneration_reason: reason,
                generated_by,
                revision: existing.as_ref().map(|r| r.biography.revision).unwrap_or(0),
            },
            chapters,
        };

        let stored = self
            .repository
            .replace(&record, existing.as_ref().map(|r| r.biography.revision))
            .await?;
        tracing::info!(
            user_id = %user_id,
            chapters = stored.chapters.len(),
            reason = reason.as_str(),
            generated_by = generated_by.as_str(),
            "biography regenerated"
        );
        Ok(stored)
    }

    /// One backend call under the configured timeout, mapped into the
    /// typed taxonomy. No persistence happens before this returns.
    async fn call_backend(&self, request: &GenerationRequest) -> Result<NarrativeDraft> {
        let bound = Duration::from_secs(self.config.llm.request_timeout_secs);
        match tokio::time::timeout(bound, self.backend.generate(request)).await {
            Ok(Ok(draft)) => Ok(draft),
            Ok(Err(e)) => Err(NarrativeError::GenerationBackend(e.to_string())),
            Err(_) => Err(NarrativeError::GenerationTimeout(bound)),
        }
    }

    /// Full-biography draft: sentinel for an empty context, otherwise the
    /// backend with the deterministic fallback behind it. This path never
    /// fails; a biography is always producible.
    async fn full_draft(&self, context: &GenerationContext) -> (NarrativeDraft, GeneratorKind) {
        if context.is_empty() {
            return (sentinel_draft(context), GeneratorKind::Fallback);
        }

        let request = GenerationRequest {
            context: context.clone(),
            mode: GenerationMode::FullBiography,
            chapter: None,
        };
        match self.call_backend(&request).await {
            Ok(draft) => match sanitize_draft(draft, context) {
                Some(draft) => (draft, GeneratorKind::Backend),
                None => {
                    tracing::warn!(user_id = %context.user_id, "backend draft failed validation, using fallback");
                    (
                        fallback_draft(context, self.config.generation.assumed_age),
                        GeneratorKind::Fallback,
                    )
                }
            },
            Err(e) => {
                tracing::warn!(user_id = %context.user_id, error = %e, "backend unavailable, using fallback");
                (
                    fallback_draft(context, self.config.generation.assumed_age),
                    GeneratorKind::Fallback,
                )
            }
        }
    }

    fn single_memory_context(
        &self,
        user_id: Uuid,
        profile: &UserProfile,
        memory: &MemoryRecord,
    ) -> Result<GenerationContext> {
        let preferences = GenerationPreferences {
            tone: self.config.generation.tone.clone(),
            length: self.config.generation.length.clone(),
            focus_themes: Vec::new(),
        };
        let context = build_context(
            user_id,
            profile,
            std::slice::from_ref(memory),
            preferences,
            Vec::new(),
            &self.config.generation,
            false,
        )?;
        Ok(with_topics(context))
    }
}

/// Topics are the deduplicated union of the advisory themes found across
/// all memories; they feed both the prompt and the content hash.
fn with_topics(mut context: GenerationContext) -> GenerationContext {
    let mut topics: Vec<String> = context
        .memories
        .iter()
        .flat_map(|m| m.themes.iter().cloned())
        .collect();
    topics.sort();
    topics.dedup();
    context.topics = topics;
    context
}

/// Enforce the structural contract on a backend draft: chapters present,
/// every chapter referencing at least one known memory id, intro and
/// conclusion non-empty. Unknown ids are dropped; a draft that cannot be
/// repaired is rejected so the fallback takes over.
fn sanitize_draft(mut draft: NarrativeDraft, context: &GenerationContext) -> Option<NarrativeDraft> {
    if draft.introduction.trim().is_empty() || draft.conclusion.trim().is_empty() {
        return None;
    }
    let known: Vec<Uuid> = context.memories.iter().map(|m| m.id).collect();
    for chapter in &mut draft.chapters {
        chapter.memory_ids.retain(|id| known.contains(id));
    }
    draft
        .chapters
        .retain(|c| !c.memory_ids.is_empty() && !c.content.trim().is_empty());
    if draft.chapters.is_empty() {
        return None;
    }
    Some(draft)
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoir_core::{DraftChapter, LifePeriod, MemorySummary};

    fn context_with_ids(ids: &[Uuid]) -> GenerationContext {
        GenerationContext {
            user_id: Uuid::new_v4(),
            profile: UserProfile::default(),
            memories: ids
                .iter()
                .map(|id| MemorySummary {
                    id: *id,
                    title: "t".to_string(),
                    summary: "s".to_string(),
                    resolved_date: "2000-01-01".parse().unwrap(),
                    location: None,
                    themes: vec!["family".to_string()],
                })
                .collect(),
            topics: vec![],
            preferences: GenerationPreferences::default(),
        }
    }

    fn draft_chapter(ids: Vec<Uuid>) -> DraftChapter {
        DraftChapter {
            title: "t".to_string(),
            content: "c".to_string(),
            life_period: LifePeriod::Comprehensive,
            age_range_start: None,
            age_range_end: None,
            memory_ids: ids,
        }
    }

    #[test]
    fn sanitize_drops_unknown_ids_and_empty_chapters() {
        let known = Uuid::new_v4();
        let ctx = context_with_ids(&[known]);
        let draft = NarrativeDraft {
            introduction: "i".to_string(),
            chapters: vec![
                draft_chapter(vec![known, Uuid::new_v4()]),
                draft_chapter(vec![Uuid::new_v4()]),
            ],
            conclusion: "c".to_string(),
        };
        let cleaned = sanitize_draft(draft, &ctx).unwrap();
        assert_eq!(cleaned.chapters.len(), 1);
        assert_eq!(cleaned.chapters[0].memory_ids, vec![known]);
    }

    #[test]
    fn sanitize_rejects_structurally_broken_drafts() {
        let known = Uuid::new_v4();
        let ctx = context_with_ids(&[known]);

        let empty_intro = NarrativeDraft {
            introduction: "  ".to_string(),
            chapters: vec![draft_chapter(vec![known])],
            conclusion: "c".to_string(),
        };
        assert!(sanitize_draft(empty_intro, &ctx).is_none());

        let no_valid_chapters = NarrativeDraft {
            introduction: "i".to_string(),
            chapters: vec![draft_chapter(vec![Uuid::new_v4()])],
            conclusion: "c".to_string(),
        };
        assert!(sanitize_draft(no_valid_chapters, &ctx).is_none());
    }

    #[test]
    fn topics_are_deduplicated_union_of_themes() {
        let ctx = with_topics(context_with_ids(&[Uuid::new_v4(), Uuid::new_v4()]));
        assert_eq!(ctx.topics, vec!["family".to_string()]);
    }

    #[tokio::test]
    async fn released_user_locks_are_evicted() {
        let locks = UserLocks::default();
        let released = locks.for_user(Uuid::new_v4()).await;
        let _held = locks.for_user(Uuid::new_v4()).await;
        assert_eq!(locks.len().await, 2);

        drop(released);
        let _fresh = locks.for_user(Uuid::new_v4()).await;
        assert_eq!(locks.len().await, 2, "dropped entry must be pruned");
    }
}
