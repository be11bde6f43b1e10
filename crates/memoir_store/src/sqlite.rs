//! SQLite persistence for the biography aggregate, plus SQLite-backed
//! implementations of the read-only memory/profile store interfaces.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use memoir_core::{
    Biography, BiographyRecord, BiographyRepository, Chapter, ChapterWrite, GeneratorKind,
    InsertionWrite, LifePeriod, MemoryRecord, MemoryStore, NarrativeError, ProfileStore,
    RegenerationReason, UserProfile,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use std::path::Path;
use uuid::Uuid;

#[derive(Clone)]
pub struct MemoirDb {
    pool: Pool<Sqlite>,
}

impl MemoirDb {
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA foreign_keys = ON").execute(conn).await?;
                    Ok(())
                })
            })
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory database on a single-connection pool. SQLite gives every
    /// connection its own private `:memory:` database, so the pool must
    /// never open a second one.
    pub async fn memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA foreign_keys = ON").execute(conn).await?;
                    Ok(())
                })
            })
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS biography (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL UNIQUE,
                introduction TEXT NOT NULL,
                conclusion TEXT NOT NULL,
                memories_included_json TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                last_regenerated_at INTEGER NOT NULL,
                regeneration_reason TEXT NOT NULL,
                generated_by TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 1
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create biography table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS biography_chapter (
                id TEXT PRIMARY KEY,
                biography_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                life_period TEXT NOT NULL,
                age_range_start INTEGER,
                age_range_end INTEGER,
                memory_ids_json TEXT NOT NULL,
                FOREIGN KEY(biography_id) REFERENCES biography(id) ON DELETE CASCADE,
                UNIQUE(biography_id, sequence)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create biography_chapter table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chapter_biography ON biography_chapter(biography_id)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create chapter index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memory (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                memory_date TEXT,
                memory_location TEXT,
                tags_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create memory table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_memory_user ON memory(user_id)")
            .execute(&self.pool)
            .await
            .context("Failed to create memory index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS profile (
                user_id TEXT PRIMARY KEY,
                name TEXT,
                birth_date TEXT,
                birth_place TEXT,
                current_location TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create profile table")?;

        tracing::debug!("memoir schema ready");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Seed helpers for the memory/profile stores (the engine itself only
    // ever reads these tables through the store traits)
    // ------------------------------------------------------------------

    pub async fn add_memory(&self, user_id: Uuid, memory: &MemoryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO memory (id, user_id, title, body, memory_date, memory_location, tags_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(memory.id.to_string())
        .bind(user_id.to_string())
        .bind(&memory.title)
        .bind(&memory.text)
        .bind(memory.memory_date.map(|d| d.to_string()))
        .bind(&memory.memory_location)
        .bind(serde_json::to_string(&memory.tags)?)
        .bind(memory.created_at.timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to insert memory")?;
        Ok(())
    }

    pub async fn upsert_profile(&self, user_id: Uuid, profile: &UserProfile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profile (user_id, name, birth_date, birth_place, current_location)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                name = excluded.name,
                birth_date = excluded.birth_date,
                birth_place = excluded.birth_place,
                current_location = excluded.current_location
            "#,
        )
        .bind(user_id.to_string())
        .bind(&profile.name)
        .bind(profile.birth_date.map(|d| d.to_string()))
        .bind(&profile.birth_place)
        .bind(&profile.current_location)
        .execute(&self.pool)
        .await
        .context("Failed to upsert profile")?;
        Ok(())
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Invalid uuid in row: {}", s))
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    s.parse()
        .map_err(|e| anyhow!("Invalid date in row ({}): {}", s, e))
}

fn parse_timestamp(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0).ok_or_else(|| anyhow!("Invalid timestamp in row: {}", ts))
}

fn biography_from_row(row: &SqliteRow) -> Result<Biography> {
    let id: String = row.get("id");
    let user_id: String = row.get("user_id");
    let memories_json: String = row.get("memories_included_json");
    let reason: String = row.get("regeneration_reason");
    let generated_by: String = row.get("generated_by");

    Ok(Biography {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        introduction: row.get("introduction"),
        conclusion: row.get("conclusion"),
        memories_included: serde_json::from_str(&memories_json)
            .context("Invalid memories_included_json")?,
        content_hash: row.get("content_hash"),
        last_regenerated_at: parse_timestamp(row.get("last_regenerated_at"))?,
        regeneration_reason: RegenerationReason::parse(&reason)
            .ok_or_else(|| anyhow!("Unknown regeneration_reason: {}", reason))?,
        generated_by: GeneratorKind::parse(&generated_by)
            .ok_or_else(|| anyhow!("Unknown generated_by: {}", generated_by))?,
        revision: row.get("revision"),
    })
}

fn chapter_from_row(row: &SqliteRow) -> Result<Chapter> {
    let id: String = row.get("id");
    let biography_id: String = row.get("biography_id");
    let period: String = row.get("life_period");
    let ids_json: String = row.get("memory_ids_json");

    Ok(Chapter {
        id: parse_uuid(&id)?,
        biography_id: parse_uuid(&biography_id)?,
        sequence: row.get("sequence"),
        title: row.get("title"),
        content: row.get("content"),
        life_period: LifePeriod::parse(&period)
            .ok_or_else(|| anyhow!("Unknown life_period: {}", period))?,
        age_range_start: row.get("age_range_start"),
        age_range_end: row.get("age_range_end"),
        memory_ids: serde_json::from_str(&ids_json).context("Invalid memory_ids_json")?,
    })
}

fn memory_from_row(row: &SqliteRow) -> Result<MemoryRecord> {
    let id: String = row.get("id");
    let date: Option<String> = row.get("memory_date");
    let tags_json: String = row.get("tags_json");

    Ok(MemoryRecord {
        id: parse_uuid(&id)?,
        title: row.get("title"),
        text: row.get("body"),
        memory_date: date.as_deref().map(parse_date).transpose()?,
        memory_location: row.get("memory_location"),
        tags: serde_json::from_str(&tags_json).context("Invalid tags_json")?,
        created_at: parse_timestamp(row.get("created_at"))?,
    })
}

async fn insert_chapter_tx(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    chapter: &Chapter,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO biography_chapter
            (id, biography_id, sequence, title, content, life_period,
             age_range_start, age_range_end, memory_ids_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(chapter.id.to_string())
    .bind(chapter.biography_id.to_string())
    .bind(chapter.sequence)
    .bind(&chapter.title)
    .bind(&chapter.content)
    .bind(chapter.life_period.as_str())
    .bind(chapter.age_range_start)
    .bind(chapter.age_range_end)
    .bind(serde_json::to_string(&chapter.memory_ids)?)
    .execute(&mut **tx)
    .await
    .context("Failed to insert chapter")?;
    Ok(())
}

// =============================================================================
// Trait implementations
// =============================================================================

#[async_trait]
impl MemoryStore for MemoirDb {
    async fn list_memories(&self, user_id: Uuid) -> Result<Vec<MemoryRecord>> {
        let rows = sqlx::query("SELECT * FROM memory WHERE user_id = ? ORDER BY created_at")
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to query memories")?;
        rows.iter().map(memory_from_row).collect()
    }
}

#[async_trait]
impl ProfileStore for MemoirDb {
    async fn get_profile(&self, user_id: Uuid) -> Result<UserProfile> {
        let row = sqlx::query("SELECT * FROM profile WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query profile")?;

        match row {
            Some(row) => {
                let birth: Option<String> = row.get("birth_date");
                Ok(UserProfile {
                    name: row.get("name"),
                    birth_date: birth.as_deref().map(parse_date).transpose()?,
                    birth_place: row.get("birth_place"),
                    current_location: row.get("current_location"),
                })
            }
            None => Ok(UserProfile::default()),
        }
    }
}

#[async_trait]
impl BiographyRepository for MemoirDb {
    async fn load(&self, user_id: Uuid) -> memoir_core::Result<Option<BiographyRecord>> {
        let row = sqlx::query("SELECT * FROM biography WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query biography")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let biography = biography_from_row(&row)?;

        let chapter_rows = sqlx::query(
            "SELECT * FROM biography_chapter WHERE biography_id = ? ORDER BY sequence",
        )
        .bind(biography.id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query chapters")?;

        let chapters = chapter_rows
            .iter()
            .map(chapter_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(BiographyRecord { biography, chapters }))
    }

    async fn replace(
        &self,
        record: &BiographyRecord,
        expected_revision: Option<i64>,
    ) -> memoir_core::Result<BiographyRecord> {
        let biography = &record.biography;
        let new_revision = expected_revision.map(|r| r + 1).unwrap_or(1);
        let memories_json = serde_json::to_string(&biography.memories_included)
            .context("Failed to encode memories_included")?;

        let mut tx = self.pool.begin().await.context("Failed to begin tx")?;

        // The revision predicate makes the upsert conditional: losing a
        // race surfaces as zero affected rows, never as a partial write.
        let affected = match expected_revision {
            Some(revision) => sqlx::query(
                r#"
                UPDATE biography SET
                    introduction = ?, conclusion = ?, memories_included_json = ?,
                    content_hash = ?, last_regenerated_at = ?, regeneration_reason = ?,
                    generated_by = ?, revision = ?
                WHERE user_id = ? AND revision = ?
                "#,
            )
            .bind(&biography.introduction)
            .bind(&biography.conclusion)
            .bind(&memories_json)
            .bind(&biography.content_hash)
            .bind(biography.last_regenerated_at.timestamp())
            .bind(biography.regeneration_reason.as_str())
            .bind(biography.generated_by.as_str())
            .bind(new_revision)
            .bind(biography.user_id.to_string())
            .bind(revision)
            .execute(&mut *tx)
            .await
            .context("Failed to update biography")?
            .rows_affected(),
            None => sqlx::query(
                r#"
                INSERT INTO biography
                    (id, user_id, introduction, conclusion, memories_included_json,
                     content_hash, last_regenerated_at, regeneration_reason,
                     generated_by, revision)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(user_id) DO NOTHING
                "#,
            )
            .bind(biography.id.to_string())
            .bind(biography.user_id.to_string())
            .bind(&biography.introduction)
            .bind(&biography.conclusion)
            .bind(&memories_json)
            .bind(&biography.content_hash)
            .bind(biography.last_regenerated_at.timestamp())
            .bind(biography.regeneration_reason.as_str())
            .bind(biography.generated_by.as_str())
            .bind(new_revision)
            .execute(&mut *tx)
            .await
            .context("Failed to insert biography")?
            .rows_affected(),
        };
        if affected == 0 {
            return Err(NarrativeError::PersistenceConflict(biography.user_id));
        }

        sqlx::query("DELETE FROM biography_chapter WHERE biography_id = ?")
            .bind(biography.id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete previous chapters")?;

        for chapter in &record.chapters {
            insert_chapter_tx(&mut tx, chapter).await?;
        }

        tx.commit().await.context("Failed to commit replace")?;

        let mut stored = record.clone();
        stored.biography.revision = new_revision;
        Ok(stored)
    }

    async fn apply_insertion(&self, write: &InsertionWrite) -> memoir_core::Result<Biography> {
        let mut tx = self.pool.begin().await.context("Failed to begin tx")?;

        let row = sqlx::query("SELECT * FROM biography WHERE user_id = ?")
            .bind(write.user_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to query biography")?;
        let Some(row) = row else {
            return Err(NarrativeError::PersistenceConflict(write.user_id));
        };
        let mut biography = biography_from_row(&row)?;
        if biography.revision != write.expected_revision {
            return Err(NarrativeError::PersistenceConflict(write.user_id));
        }

        match &write.chapter {
            ChapterWrite::Update(chapter) => {
                let affected = sqlx::query(
                    r#"
                    UPDATE biography_chapter
                    SET title = ?, content = ?, memory_ids_json = ?
                    WHERE id = ? AND biography_id = ?
                    "#,
                )
                .bind(&chapter.title)
                .bind(&chapter.content)
                .bind(serde_json::to_string(&chapter.memory_ids).context("Failed to encode ids")?)
                .bind(chapter.id.to_string())
                .bind(biography.id.to_string())
                .execute(&mut *tx)
                .await
                .context("Failed to update chapter")?
                .rows_affected();
                if affected == 0 {
                    return Err(NarrativeError::PersistenceConflict(write.user_id));
                }
            }
            ChapterWrite::Insert(chapter) => {
                insert_chapter_tx(&mut tx, chapter).await?;
            }
        }

        if !biography.memories_included.contains(&write.memory_id) {
            biography.memories_included.push(write.memory_id);
        }
        biography.last_regenerated_at = Utc::now();
        biography.regeneration_reason = write.reason;
        biography.generated_by = write.generated_by;
        biography.revision += 1;

        sqlx::query(
            r#"
            UPDATE biography SET
                memories_included_json = ?, last_regenerated_at = ?,
                regeneration_reason = ?, generated_by = ?, revision = ?
            WHERE id = ?
            "#,
        )
        .bind(
            serde_json::to_string(&biography.memories_included)
                .context("Failed to encode memories_included")?,
        )
        .bind(biography.last_regenerated_at.timestamp())
        .bind(biography.regeneration_reason.as_str())
        .bind(biography.generated_by.as_str())
        .bind(biography.revision)
        .bind(biography.id.to_string())
        .execute(&mut *tx)
        .await
        .context("Failed to update biography bookkeeping")?;

        tx.commit().await.context("Failed to commit insertion")?;
        Ok(biography)
    }
}
