//! Chapter assignment: the two-state decision for inserting one new
//! memory into an existing biography.

use memoir_core::Chapter;
use uuid::Uuid;

/// Decision for one new memory against the existing chapter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapterAssignment {
    /// The memory's age falls inside an existing chapter's band; rewrite
    /// that chapter with the memory woven in.
    UpdateExisting { chapter_id: Uuid },
    /// No chapter covers the age (or no chapter carries age bounds at
    /// all); synthesize a new chapter.
    CreateNew,
}

/// Scan chapters for one whose inclusive age band contains `age`.
///
/// Overlapping ranges tie-break deterministically: the containing chapter
/// with the lowest `sequence` wins. Chapters without bounds never match.
///
/// Known ordering property: a memory whose age falls in a band gap gets a
/// new chapter appended at the end, so `sequence` reflects insertion
/// order, not age order. Existing chapters are never reordered.
pub fn assign_chapter(age: i32, chapters: &[Chapter]) -> ChapterAssignment {
    chapters
        .iter()
        .filter(|c| c.contains_age(age))
        .min_by_key(|c| c.sequence)
        .map(|c| ChapterAssignment::UpdateExisting { chapter_id: c.id })
        .unwrap_or(ChapterAssignment::CreateNew)
}

/// Sequence number for a newly created chapter: one past the current max.
pub fn next_sequence(chapters: &[Chapter]) -> i64 {
    chapters.iter().map(|c| c.sequence).max().unwrap_or(0) + 1
}
