pub mod config;
pub mod error;

pub use config::MemoirConfig;
pub use error::NarrativeError;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result alias for engine operations with a typed failure reason.
pub type Result<T> = std::result::Result<T, NarrativeError>;

/// A raw journaled memory. Owned by the external memory store; the
/// narrative engine only ever holds these by reference to their ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub title: String,
    pub text: String,
    pub memory_date: Option<NaiveDate>,
    pub memory_location: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Profile fields that affect narrative framing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub birth_place: Option<String>,
    pub current_location: Option<String>,
}

impl UserProfile {
    pub fn birth_year(&self) -> Option<i32> {
        use chrono::Datelike;
        self.birth_date.map(|d| d.year())
    }
}

/// Fixed ordered set of life-period bands. `Comprehensive` is the residual
/// bucket used when an age cannot be computed for a memory at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifePeriod {
    EarlyFoundations,
    GrowingYears,
    ComingIntoFocus,
    BuildingAndCreating,
    Flourishing,
    WisdomYears,
    Comprehensive,
}

impl LifePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifePeriod::EarlyFoundations => "early_foundations",
            LifePeriod::GrowingYears => "growing_years",
            LifePeriod::ComingIntoFocus => "coming_into_focus",
            LifePeriod::BuildingAndCreating => "building_and_creating",
            LifePeriod::Flourishing => "flourishing",
            LifePeriod::WisdomYears => "wisdom_years",
            LifePeriod::Comprehensive => "comprehensive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "early_foundations" => Some(LifePeriod::EarlyFoundations),
            "growing_years" => Some(LifePeriod::GrowingYears),
            "coming_into_focus" => Some(LifePeriod::ComingIntoFocus),
            "building_and_creating" => Some(LifePeriod::BuildingAndCreating),
            "flourishing" => Some(LifePeriod::Flourishing),
            "wisdom_years" => Some(LifePeriod::WisdomYears),
            "comprehensive" => Some(LifePeriod::Comprehensive),
            _ => None,
        }
    }

    /// Human-readable chapter heading for this band.
    pub fn display_name(&self) -> &'static str {
        match self {
            LifePeriod::EarlyFoundations => "Early Foundations",
            LifePeriod::GrowingYears => "Growing Years",
            LifePeriod::ComingIntoFocus => "Coming Into Focus",
            LifePeriod::BuildingAndCreating => "Building and Creating",
            LifePeriod::Flourishing => "Flourishing",
            LifePeriod::WisdomYears => "Wisdom Years",
            LifePeriod::Comprehensive => "A Life in Full",
        }
    }

    /// Inclusive age band covered by this period, or None for the
    /// non-chronological residual bucket.
    pub fn age_bounds(&self) -> Option<(i32, i32)> {
        match self {
            LifePeriod::EarlyFoundations => Some((0, 12)),
            LifePeriod::GrowingYears => Some((13, 18)),
            LifePeriod::ComingIntoFocus => Some((19, 28)),
            LifePeriod::BuildingAndCreating => Some((29, 45)),
            LifePeriod::Flourishing => Some((46, 65)),
            LifePeriod::WisdomYears => Some((66, 120)),
            LifePeriod::Comprehensive => None,
        }
    }
}

/// Why the current narrative text was (re)generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegenerationReason {
    InitialCreation,
    MemoryAdded,
    UserRequested,
}

impl RegenerationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegenerationReason::InitialCreation => "initial_creation",
            RegenerationReason::MemoryAdded => "memory_added",
            RegenerationReason::UserRequested => "user_requested",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial_creation" => Some(RegenerationReason::InitialCreation),
            "memory_added" => Some(RegenerationReason::MemoryAdded),
            "user_requested" => Some(RegenerationReason::UserRequested),
            _ => None,
        }
    }
}

/// Whether the stored narrative text came from the text backend or from
/// the deterministic fallback generator. Logged, never user-facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorKind {
    Backend,
    Fallback,
}

impl GeneratorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeneratorKind::Backend => "backend",
            GeneratorKind::Fallback => "fallback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backend" => Some(GeneratorKind::Backend),
            "fallback" => Some(GeneratorKind::Fallback),
            _ => None,
        }
    }
}

/// The persisted, user-scoped narrative aggregate root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Biography {
    pub id: Uuid,
    pub user_id: Uuid,
    pub introduction: String,
    pub conclusion: String,
    /// Memory ids folded into the current narrative. Grows monotonically
    /// except across a full regeneration, and is always a superset of the
    /// union of all chapters' `memory_ids`.
    pub memories_included: Vec<Uuid>,
    /// Digest of the generation context that produced the current text.
    pub content_hash: String,
    pub last_regenerated_at: DateTime<Utc>,
    pub regeneration_reason: RegenerationReason,
    pub generated_by: GeneratorKind,
    /// Optimistic-concurrency counter; every persisted write bumps it.
    pub revision: i64,
}

/// One ordered narrative unit covering a life period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: Uuid,
    pub biography_id: Uuid,
    /// 1-based, strictly increasing. Reading/insertion order, which is not
    /// necessarily chronological once incremental insertions have run.
    pub sequence: i64,
    pub title: String,
    pub content: String,
    pub life_period: LifePeriod,
    pub age_range_start: Option<i32>,
    pub age_range_end: Option<i32>,
    /// Non-empty for every chapter except the zero-memory sentinel.
    pub memory_ids: Vec<Uuid>,
}

impl Chapter {
    /// True when `age` falls inside this chapter's inclusive age band.
    /// Chapters without bounds never contain any age.
    pub fn contains_age(&self, age: i32) -> bool {
        match (self.age_range_start, self.age_range_end) {
            (Some(start), Some(end)) => age >= start && age <= end,
            _ => false,
        }
    }
}

/// Biography plus its chapters, ordered by `sequence`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiographyRecord {
    pub biography: Biography,
    pub chapters: Vec<Chapter>,
}

/// User steering knobs for narrative generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationPreferences {
    pub tone: String,
    pub length: String,
    pub focus_themes: Vec<String>,
}

impl Default for GenerationPreferences {
    fn default() -> Self {
        Self {
            tone: "warm".to_string(),
            length: "standard".to_string(),
            focus_themes: Vec::new(),
        }
    }
}

/// A single memory, normalized for prompting: body truncated to a fixed
/// bound, date resolved, advisory themes attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySummary {
    pub id: Uuid,
    pub title: String,
    pub summary: String,
    pub resolved_date: NaiveDate,
    pub location: Option<String>,
    pub themes: Vec<String>,
}

/// Canonical, length-bounded input to narrative generation. Building one
/// has no side effects; two equal contexts produce equal digests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationContext {
    pub user_id: Uuid,
    pub profile: UserProfile,
    pub memories: Vec<MemorySummary>,
    pub topics: Vec<String>,
    pub preferences: GenerationPreferences,
}

impl GenerationContext {
    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }
}

/// Which shape of narrative the text backend is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    /// Introduction + all chapters + conclusion from the full context.
    FullBiography,
    /// Rewrite one existing chapter to weave in one new memory.
    ChapterUpdate,
    /// Write one brand-new chapter around one new memory.
    MemoryInsertion,
}

/// Structured request handed to the text backend. The prompt text the
/// backend builds from this is a serialization detail; the engine never
/// re-parses free text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub context: GenerationContext,
    pub mode: GenerationMode,
    /// Present only in `ChapterUpdate` mode: the chapter being rewritten.
    pub chapter: Option<Chapter>,
}

/// One chapter as proposed by a generator, before persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftChapter {
    pub title: String,
    pub content: String,
    pub life_period: LifePeriod,
    pub age_range_start: Option<i32>,
    pub age_range_end: Option<i32>,
    pub memory_ids: Vec<Uuid>,
}

/// Generator output: the whole narrative for `FullBiography`, or a single
/// chapter (with intro/conclusion ignored) for the incremental modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativeDraft {
    pub introduction: String,
    pub chapters: Vec<DraftChapter>,
    pub conclusion: String,
}

/// Outcome of `insert_memory_into_narrative`: exactly one of the two
/// fields is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertionReport {
    pub updated_chapter: Option<Chapter>,
    pub new_chapter: Option<Chapter>,
}

/// The single-chapter write applied by an incremental insertion.
#[derive(Debug, Clone)]
pub enum ChapterWrite {
    /// Replace the content and memory_ids of an existing chapter row.
    Update(Chapter),
    /// Insert exactly one new chapter row.
    Insert(Chapter),
}

/// Everything the repository needs to apply one incremental insertion
/// atomically: the chapter write plus the biography bookkeeping.
#[derive(Debug, Clone)]
pub struct InsertionWrite {
    pub user_id: Uuid,
    /// Revision the caller read; a mismatch at write time means a
    /// concurrent writer got there first.
    pub expected_revision: i64,
    pub chapter: ChapterWrite,
    pub memory_id: Uuid,
    pub reason: RegenerationReason,
    pub generated_by: GeneratorKind,
}

/// Read-only view of the external memory store.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn list_memories(&self, user_id: Uuid) -> anyhow::Result<Vec<MemoryRecord>>;
}

/// Read-only view of the external profile store.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, user_id: Uuid) -> anyhow::Result<UserProfile>;
}

/// Stateless text-generation service. Implementations must be swappable
/// and callable with a bounded timeout; the engine treats any error as
/// recoverable via the deterministic fallback generator.
#[async_trait]
pub trait TextBackend: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<NarrativeDraft>;
}

/// Transactional access to the Biography + Chapter aggregate.
#[async_trait]
pub trait BiographyRepository: Send + Sync {
    /// Load the aggregate for one user, chapters ordered by sequence.
    async fn load(&self, user_id: Uuid) -> Result<Option<BiographyRecord>>;

    /// Full regeneration: upsert the biography row, drop all previous
    /// chapters and insert the new set, in one transaction. Pass
    /// `expected_revision = None` when no biography existed at read time.
    /// Returns the stored record with its new revision.
    async fn replace(
        &self,
        record: &BiographyRecord,
        expected_revision: Option<i64>,
    ) -> Result<BiographyRecord>;

    /// Incremental insertion: apply exactly one chapter write plus the
    /// biography bookkeeping (memories_included, reason, timestamps,
    /// revision bump), in one transaction. Returns the updated biography.
    async fn apply_insertion(&self, write: &InsertionWrite) -> Result<Biography>;
}
