use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_schedule(&self, id: Ulid) -> Option<ScheduleEntry> {
        self.timeline.read().await.by_id(&id).cloned()
    }

    /// Every entry, active or not, ordered by start.
    pub async fn list_schedules(&self) -> Vec<ScheduleEntry> {
        self.timeline.read().await.all().to_vec()
    }

    pub async fn schedules_for_content(&self, content_id: Ulid) -> Vec<ScheduleEntry> {
        self.timeline
            .read()
            .await
            .by_content(content_id)
            .cloned()
            .collect()
    }

    /// Active entries overlapping `[start, end)`. An empty window matches nothing.
    pub async fn schedules_overlapping(&self, start: Ms, end: Ms) -> Vec<ScheduleEntry> {
        if start >= end {
            return Vec::new();
        }
        let query = Span::new(start, end);
        self.timeline
            .read()
            .await
            .overlapping(&query)
            .cloned()
            .collect()
    }

    /// The entry playing at `now`, if any.
    pub async fn current_at(&self, now: Ms) -> Option<ScheduleEntry> {
        self.timeline.read().await.current(now).cloned()
    }

    /// The entry playing right now according to the engine clock.
    pub async fn current(&self) -> Option<ScheduleEntry> {
        self.current_at(self.clock.now()).await
    }

    /// The active entry starting after the given entry's start.
    pub async fn next_after(&self, entry_id: Ulid) -> Result<Option<ScheduleEntry>, EngineError> {
        let guard = self.timeline.read().await;
        let reference = guard
            .by_id(&entry_id)
            .ok_or(EngineError::ScheduleNotFound(entry_id))?;
        Ok(guard.next_after(reference.span.start).cloned())
    }

    /// Current and following entry in one consistent snapshot. With nothing
    /// playing, "next" is the first entry starting after `now`.
    pub async fn playlist_at(&self, now: Ms) -> (Option<NowPlaying>, Option<NowPlaying>) {
        let guard = self.timeline.read().await;
        let current = guard.current(now);
        let next = match current {
            Some(c) => guard.next_after(c.span.start),
            None => guard.next_after(now),
        };
        (
            current.and_then(|e| self.describe(e)),
            next.and_then(|e| self.describe(e)),
        )
    }

    /// Join an entry with its content for display.
    pub fn describe(&self, entry: &ScheduleEntry) -> Option<NowPlaying> {
        let content = self.catalog.get(&entry.content_id)?;
        Some(NowPlaying {
            entry: entry.clone(),
            title: content.title,
            kind: content.kind,
        })
    }

    pub fn get_content(&self, id: Ulid) -> Option<Content> {
        self.catalog.get(&id)
    }

    pub fn list_contents(&self) -> Vec<Content> {
        self.catalog.list()
    }
}
