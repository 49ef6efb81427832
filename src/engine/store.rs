use ulid::Ulid;

use crate::model::*;

/// The ordered timeline of one display.
///
/// Entries are kept sorted by `(span.start, id)`; every read returns them in
/// that order. Inactive entries are stored but skipped by the playback
/// queries (`overlapping`, `current`, `next_after`).
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    entries: Vec<ScheduleEntry>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ── Reads ────────────────────────────────────────────────

    pub fn by_id(&self, id: &Ulid) -> Option<&ScheduleEntry> {
        self.entries.iter().find(|e| e.id == *id)
    }

    pub fn all(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn by_content(&self, content_id: Ulid) -> impl Iterator<Item = &ScheduleEntry> {
        self.entries.iter().filter(move |e| e.content_id == content_id)
    }

    pub fn active(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.entries.iter().filter(|e| e.active)
    }

    /// Active entries whose span overlaps `query` (half-open on both sides).
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &ScheduleEntry> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self.entries.partition_point(|e| e.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.active && e.span.end > query.start)
    }

    /// The active entry covering `now`. If several do (only possible after a
    /// shift that was not re-checked), the one that started last wins.
    pub fn current(&self, now: Ms) -> Option<&ScheduleEntry> {
        let right_bound = self.entries.partition_point(|e| e.span.start <= now);
        self.entries[..right_bound]
            .iter()
            .rev()
            .find(|e| e.active && e.span.contains_instant(now))
    }

    /// The active entry with the smallest start strictly after `after`.
    pub fn next_after(&self, after: Ms) -> Option<&ScheduleEntry> {
        let left_bound = self.entries.partition_point(|e| e.span.start <= after);
        self.entries[left_bound..].iter().find(|e| e.active)
    }

    // ── Writes ───────────────────────────────────────────────

    /// Insert maintaining sort order by `(span.start, id)`.
    pub fn insert(&mut self, entry: ScheduleEntry) {
        let key = (entry.span.start, entry.id);
        let pos = self
            .entries
            .binary_search_by(|e| (e.span.start, e.id).cmp(&key))
            .unwrap_or_else(|p| p);
        self.entries.insert(pos, entry);
    }

    /// Replace the entry with the same id, re-sorting it. Returns the old
    /// version, or `None` (and inserts nothing) if the id is unknown.
    pub fn update(&mut self, entry: ScheduleEntry) -> Option<ScheduleEntry> {
        let old = self.remove(&entry.id)?;
        self.insert(entry);
        Some(old)
    }

    pub fn remove(&mut self, id: &Ulid) -> Option<ScheduleEntry> {
        let pos = self.entries.iter().position(|e| e.id == *id)?;
        Some(self.entries.remove(pos))
    }
}
