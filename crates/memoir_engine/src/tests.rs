use crate::fallback::{fallback_chapter_content, fallback_draft, fallback_new_chapter};
use crate::service::NarrativeEngine;
use crate::SENTINEL_TITLE;
use async_trait::async_trait;
use chrono::Utc;
use memoir_core::{
    BiographyRecord, GenerationMode, GenerationRequest, GeneratorKind, LifePeriod, MemoirConfig,
    MemoryRecord, NarrativeDraft, NarrativeError, RegenerationReason, TextBackend, UserProfile,
};
use memoir_store::MemoirDb;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Deterministic test backend: call-counting, optionally failing or
/// hanging, otherwise answering with the same structure the fallback
/// generator produces.
struct TestBackend {
    calls: AtomicUsize,
    fail: bool,
    hang: bool,
}

impl TestBackend {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
            hang: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
            hang: false,
        })
    }

    fn hanging() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
            hang: true,
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextBackend for TestBackend {
    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<NarrativeDraft> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        }
        if self.fail {
            anyhow::bail!("backend down");
        }
        match request.mode {
            GenerationMode::FullBiography => Ok(fallback_draft(&request.context, 30)),
            GenerationMode::ChapterUpdate => {
                let chapter = request.chapter.as_ref().expect("chapter present");
                let memory = request.context.memories.first().expect("memory present");
                Ok(NarrativeDraft {
                    introduction: String::new(),
                    chapters: vec![memoir_core::DraftChapter {
                        title: chapter.title.clone(),
                        content: fallback_chapter_content(&chapter.content, memory),
                        life_period: chapter.life_period,
                        age_range_start: chapter.age_range_start,
                        age_range_end: chapter.age_range_end,
                        memory_ids: chapter.memory_ids.clone(),
                    }],
                    conclusion: String::new(),
                })
            }
            GenerationMode::MemoryInsertion => {
                let memory = request.context.memories.first().expect("memory present");
                Ok(NarrativeDraft {
                    introduction: String::new(),
                    chapters: vec![fallback_new_chapter(memory, LifePeriod::Comprehensive)],
                    conclusion: String::new(),
                })
            }
        }
    }
}

fn memory(title: &str, date: &str) -> MemoryRecord {
    MemoryRecord {
        id: Uuid::new_v4(),
        title: title.to_string(),
        text: format!("The full story of {}.", title),
        memory_date: Some(date.parse().unwrap()),
        memory_location: None,
        tags: vec![],
        created_at: Utc::now(),
    }
}

fn engine(db: &MemoirDb, backend: Arc<TestBackend>, timeout_secs: u64) -> NarrativeEngine {
    let db = Arc::new(db.clone());
    let mut config = MemoirConfig::default();
    config.llm.request_timeout_secs = timeout_secs;
    NarrativeEngine::new(db.clone(), db.clone(), db, backend, config)
}

async fn seed_user(db: &MemoirDb, memories: &[MemoryRecord]) -> Uuid {
    let user_id = Uuid::new_v4();
    db.upsert_profile(
        user_id,
        &UserProfile {
            name: Some("Ada".to_string()),
            birth_date: Some("1990-05-01".parse().unwrap()),
            birth_place: Some("Lisbon".to_string()),
            current_location: None,
        },
    )
    .await
    .expect("profile");
    for m in memories {
        db.add_memory(user_id, m).await.expect("memory");
    }
    user_id
}

fn assert_inclusion_invariant(record: &BiographyRecord) {
    for chapter in &record.chapters {
        for id in &chapter.memory_ids {
            assert!(
                record.biography.memories_included.contains(id),
                "chapter memory {} missing from memories_included",
                id
            );
        }
    }
}

#[tokio::test]
async fn get_or_create_generates_once_and_is_idempotent() {
    let db = MemoirDb::memory().await.expect("db");
    let backend = TestBackend::ok();
    let engine = engine(&db, backend.clone(), 5);

    let user_id = seed_user(
        &db,
        &[memory("first day of school", "1996-09-01"), memory("moved abroad", "2015-03-01")],
    )
    .await;

    let first = engine.get_or_create_biography(user_id).await.expect("create");
    assert_eq!(backend.call_count(), 1);
    assert!(!first.chapters.is_empty());
    assert!(!first.biography.introduction.is_empty());
    assert_eq!(first.biography.regeneration_reason, RegenerationReason::InitialCreation);
    assert_inclusion_invariant(&first);

    let second = engine.get_or_create_biography(user_id).await.expect("get");
    assert_eq!(backend.call_count(), 1, "existing biography must not regenerate");
    assert_eq!(second.biography.content_hash, first.biography.content_hash);
    assert_eq!(second.biography.revision, first.biography.revision);
}

#[tokio::test]
async fn unchanged_context_skips_regeneration() {
    let db = MemoirDb::memory().await.expect("db");
    let backend = TestBackend::ok();
    let engine = engine(&db, backend.clone(), 5);
    let user_id = seed_user(&db, &[memory("a quiet summer", "2001-07-01")]).await;

    let first = engine
        .regenerate_biography(user_id, RegenerationReason::InitialCreation, None)
        .await
        .expect("first");
    assert_eq!(backend.call_count(), 1);

    let second = engine
        .regenerate_biography(user_id, RegenerationReason::MemoryAdded, None)
        .await
        .expect("second");
    assert_eq!(backend.call_count(), 1, "identical context must be skipped");
    assert_eq!(second.biography.content_hash, first.biography.content_hash);
    assert_eq!(second.biography.revision, first.biography.revision);

    // Explicit user request always regenerates.
    let third = engine
        .regenerate_biography(user_id, RegenerationReason::UserRequested, None)
        .await
        .expect("third");
    assert_eq!(backend.call_count(), 2);
    assert_eq!(third.biography.regeneration_reason, RegenerationReason::UserRequested);
    assert!(third.biography.revision > first.biography.revision);
}

#[tokio::test]
async fn user_prompt_changes_the_context_hash() {
    let db = MemoirDb::memory().await.expect("db");
    let backend = TestBackend::ok();
    let engine = engine(&db, backend.clone(), 5);
    let user_id = seed_user(&db, &[memory("a quiet summer", "2001-07-01")]).await;

    let plain = engine
        .regenerate_biography(user_id, RegenerationReason::InitialCreation, None)
        .await
        .expect("plain");
    let steered = engine
        .regenerate_biography(
            user_id,
            RegenerationReason::MemoryAdded,
            Some("focus on friendships".to_string()),
        )
        .await
        .expect("steered");
    assert_ne!(plain.biography.content_hash, steered.biography.content_hash);
    assert_eq!(backend.call_count(), 2);
}

#[tokio::test]
async fn failing_backend_still_produces_a_biography() {
    let db = MemoirDb::memory().await.expect("db");
    let backend = TestBackend::failing();
    let engine = engine(&db, backend.clone(), 5);
    let user_id = seed_user(
        &db,
        &[memory("first day of school", "1996-09-01"), memory("ran a marathon", "2020-10-10")],
    )
    .await;

    let record = engine.get_or_create_biography(user_id).await.expect("create");
    assert!(backend.call_count() >= 1);
    assert_eq!(record.biography.generated_by, GeneratorKind::Fallback);
    assert!(!record.chapters.is_empty());
    assert!(!record.biography.introduction.is_empty());
    assert!(!record.biography.conclusion.is_empty());
    for chapter in &record.chapters {
        assert!(!chapter.memory_ids.is_empty());
    }
    assert_inclusion_invariant(&record);
}

#[tokio::test]
async fn zero_memories_produces_the_sentinel_chapter() {
    let db = MemoirDb::memory().await.expect("db");
    let backend = TestBackend::ok();
    let engine = engine(&db, backend.clone(), 5);
    let user_id = seed_user(&db, &[]).await;

    let record = engine.get_or_create_biography(user_id).await.expect("create");
    assert_eq!(backend.call_count(), 0, "empty context never calls the backend");
    assert_eq!(record.chapters.len(), 1);
    assert_eq!(record.chapters[0].title, SENTINEL_TITLE);
    assert_eq!(record.chapters[0].life_period, LifePeriod::Comprehensive);
    assert!(record.chapters[0].memory_ids.is_empty());
    assert!(record.biography.memories_included.is_empty());
    assert!(!record.biography.introduction.is_empty());
    assert!(!record.biography.conclusion.is_empty());
}

#[tokio::test]
async fn insertion_scenarios_create_then_update_chapters() {
    let db = MemoirDb::memory().await.expect("db");
    let backend = TestBackend::ok();
    let engine = engine(&db, backend.clone(), 5);

    // Age 10 at the initial memory: one chapter covering ages 0-12.
    let childhood = memory("first day of school", "2000-09-01");
    let user_id = seed_user(&db, &[childhood.clone()]).await;
    let initial = engine.get_or_create_biography(user_id).await.expect("create");
    assert_eq!(initial.chapters.len(), 1);
    assert_eq!(initial.chapters[0].life_period, LifePeriod::EarlyFoundations);

    // Age 40 falls outside every chapter band: exactly one new chapter,
    // sequence 2.
    let midlife = memory("ran a marathon", "2030-06-15");
    db.add_memory(user_id, &midlife).await.expect("memory");
    let report = engine
        .insert_memory_into_narrative(user_id, midlife.clone())
        .await
        .expect("insert");
    assert!(report.updated_chapter.is_none());
    let new_chapter = report.new_chapter.expect("new chapter");
    assert_eq!(new_chapter.sequence, 2);
    assert_eq!(new_chapter.life_period, LifePeriod::BuildingAndCreating);
    assert_eq!(new_chapter.memory_ids, vec![midlife.id]);

    // Age 10 again: chapter 1 is updated in place, no third chapter.
    let childhood_two = memory("learning to ride a bike", "2001-05-01");
    db.add_memory(user_id, &childhood_two).await.expect("memory");
    let report = engine
        .insert_memory_into_narrative(user_id, childhood_two.clone())
        .await
        .expect("insert");
    assert!(report.new_chapter.is_none());
    let updated = report.updated_chapter.expect("updated chapter");
    assert_eq!(updated.sequence, 1);
    assert_eq!(updated.memory_ids.len(), 2);
    assert!(updated.memory_ids.contains(&childhood_two.id));

    let record = engine.get_or_create_biography(user_id).await.expect("load");
    assert_eq!(record.chapters.len(), 2);
    assert_inclusion_invariant(&record);

    // Monotonic inclusion across the whole sequence of insertions.
    for id in [childhood.id, midlife.id, childhood_two.id] {
        assert!(record.biography.memories_included.contains(&id));
    }
    let union: usize = record.chapters.iter().map(|c| c.memory_ids.len()).sum();
    assert_eq!(record.biography.memories_included.len(), union);
}

#[tokio::test]
async fn inserting_into_sentinel_biography_rebuilds_it() {
    let db = MemoirDb::memory().await.expect("db");
    let backend = TestBackend::ok();
    let engine = engine(&db, backend.clone(), 5);
    let user_id = seed_user(&db, &[]).await;

    let sentinel = engine.get_or_create_biography(user_id).await.expect("create");
    assert!(sentinel.biography.memories_included.is_empty());

    let first = memory("a quiet summer", "2001-07-01");
    db.add_memory(user_id, &first).await.expect("memory");
    let report = engine
        .insert_memory_into_narrative(user_id, first.clone())
        .await
        .expect("insert");
    let chapter = report.new_chapter.expect("chapter");
    assert!(chapter.memory_ids.contains(&first.id));

    let record = engine.get_or_create_biography(user_id).await.expect("load");
    assert!(record.biography.memories_included.contains(&first.id));
    assert!(record.chapters.iter().all(|c| !c.memory_ids.is_empty()));
    assert!(!record.chapters.iter().any(|c| c.title == SENTINEL_TITLE));
}

#[tokio::test]
async fn concurrent_insertions_get_distinct_sequences() {
    let db = MemoirDb::memory().await.expect("db");
    let backend = TestBackend::ok();
    let engine = engine(&db, backend.clone(), 5);
    let user_id = seed_user(&db, &[memory("first day of school", "2000-09-01")]).await;
    engine.get_or_create_biography(user_id).await.expect("create");

    // Ages 40 and 70 both fall outside the existing chapter band, so each
    // insertion decides to create a chapter. Run them at the same time.
    let midlife = memory("ran a marathon", "2030-06-15");
    let elder = memory("met my first grandchild", "2060-08-01");
    db.add_memory(user_id, &midlife).await.expect("memory");
    db.add_memory(user_id, &elder).await.expect("memory");

    let (first, second) = tokio::join!(
        engine.insert_memory_into_narrative(user_id, midlife.clone()),
        engine.insert_memory_into_narrative(user_id, elder.clone()),
    );
    let first = first.expect("insert").new_chapter.expect("new chapter");
    let second = second.expect("insert").new_chapter.expect("new chapter");
    assert_ne!(first.sequence, second.sequence);

    let record = engine.get_or_create_biography(user_id).await.expect("load");
    assert_eq!(record.chapters.len(), 3);
    let mut sequences: Vec<i64> = record.chapters.iter().map(|c| c.sequence).collect();
    sequences.sort_unstable();
    assert_eq!(sequences, vec![1, 2, 3]);
    for id in [midlife.id, elder.id] {
        assert!(record.biography.memories_included.contains(&id));
    }
    assert_inclusion_invariant(&record);
}

#[tokio::test]
async fn insertion_timeout_aborts_without_writing() {
    let db = MemoirDb::memory().await.expect("db");
    let user_id = seed_user(&db, &[memory("first day of school", "2000-09-01")]).await;

    // Build the biography with a healthy backend first.
    let healthy = engine(&db, TestBackend::ok(), 5);
    let before = healthy.get_or_create_biography(user_id).await.expect("create");

    // Then insert through an engine whose backend never answers in time.
    let slow = engine(&db, TestBackend::hanging(), 1);
    let late = memory("ran a marathon", "2030-06-15");
    db.add_memory(user_id, &late).await.expect("memory");
    let err = slow
        .insert_memory_into_narrative(user_id, late.clone())
        .await
        .expect_err("timeout");
    assert!(matches!(err, NarrativeError::GenerationTimeout(_)));

    let after = healthy.get_or_create_biography(user_id).await.expect("load");
    assert_eq!(after.biography.revision, before.biography.revision);
    assert_eq!(after.chapters.len(), before.chapters.len());
    assert!(!after.biography.memories_included.contains(&late.id));
}

#[tokio::test]
async fn backend_failure_on_insertion_falls_back_and_persists() {
    let db = MemoirDb::memory().await.expect("db");
    let user_id = seed_user(&db, &[memory("first day of school", "2000-09-01")]).await;

    let healthy = engine(&db, TestBackend::ok(), 5);
    healthy.get_or_create_biography(user_id).await.expect("create");

    let broken = engine(&db, TestBackend::failing(), 5);
    let late = memory("ran a marathon", "2030-06-15");
    db.add_memory(user_id, &late).await.expect("memory");
    let report = broken
        .insert_memory_into_narrative(user_id, late.clone())
        .await
        .expect("fallback insertion");
    let chapter = report.new_chapter.expect("chapter");
    assert_eq!(chapter.memory_ids, vec![late.id]);
    assert!(chapter.content.contains("ran a marathon"));

    let record = healthy.get_or_create_biography(user_id).await.expect("load");
    assert_eq!(record.biography.generated_by, GeneratorKind::Fallback);
    assert!(record.biography.memories_included.contains(&late.id));
}
