use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::catalog::{validate_content, validate_default_duration, validate_title};
use super::conflict::{adjustment_note, first_conflict, resolve, validate_span};
use super::interval::{derive_span, resolve_duration};
use super::{Engine, EngineError, Timeline, WalCommand};

fn validate_owner(owner: &str) -> Result<(), EngineError> {
    if owner.len() > MAX_OWNER_LEN {
        return Err(EngineError::LimitExceeded("owner too long"));
    }
    Ok(())
}

fn check_duration(secs: Secs) -> Result<(), EngineError> {
    if secs <= 0 {
        return Err(EngineError::InvalidDuration(secs));
    }
    if secs > MAX_DURATION_SECS {
        return Err(EngineError::LimitExceeded("duration too long"));
    }
    Ok(())
}

/// Derive the re-timed entries for a new content default without writing
/// anything. Fails if any new span leaves the valid range.
fn plan_cascade(
    timeline: &Timeline,
    content_id: Ulid,
    new_duration_secs: Secs,
) -> Result<Vec<ScheduleEntry>, EngineError> {
    let mut changed = Vec::new();
    for e in timeline.by_content(content_id) {
        if !e.duration_source.follows_content() {
            continue;
        }
        let span = derive_span(e.span.start, new_duration_secs)?;
        validate_span(&span)?;
        if span == e.span && e.duration_source == DurationSource::ContentDefault {
            continue;
        }
        changed.push(ScheduleEntry {
            span,
            duration_secs: new_duration_secs,
            duration_source: DurationSource::ContentDefault,
            ..e.clone()
        });
    }
    Ok(changed)
}

impl Engine {
    /// Run conflict resolution for a slot and apply the re-check policy.
    fn place(
        &self,
        timeline: &Timeline,
        start: Ms,
        duration_secs: Secs,
        exclude: Option<Ulid>,
    ) -> Result<(Span, Option<Ulid>, Option<String>), EngineError> {
        validate_span(&derive_span(start, duration_secs)?)?;
        let placed = resolve(
            start,
            duration_secs,
            timeline.all(),
            exclude,
            self.config.shift_anchor,
        )?;
        if !placed.adjusted {
            return Ok((placed.span, None, None));
        }

        validate_span(&placed.span)?;
        if self.config.recheck_after_shift
            && let Some(still) = first_conflict(&placed.span, timeline.all(), exclude)
        {
            metrics::counter!(crate::observability::CONFLICTS_UNRESOLVED_TOTAL).increment(1);
            return Err(EngineError::ConflictUnresolved(still.id));
        }

        metrics::counter!(crate::observability::SHIFTS_TOTAL).increment(1);
        let conflict_with = placed.conflict_with;
        let note = conflict_with.map(|c| adjustment_note(c, placed.span.start));
        Ok((placed.span, conflict_with, note))
    }

    /// Schedule `content_id` to play at `start`.
    ///
    /// The duration is the requested one, else the content's default, else the
    /// configured fallback. If the slot overlaps an active entry it is shifted
    /// once; the returned placement says so.
    pub async fn create_schedule(
        &self,
        content_id: Ulid,
        start: Ms,
        requested_duration: Option<Secs>,
        owner: Option<String>,
    ) -> Result<Placement, EngineError> {
        let owner = owner.unwrap_or_else(|| SYSTEM_OWNER.to_string());
        validate_owner(&owner)?;

        let mut guard = self.timeline.write().await;
        if guard.len() >= MAX_ENTRIES_PER_TIMELINE {
            return Err(EngineError::LimitExceeded("too many schedules on timeline"));
        }

        let content_default = self.catalog.default_duration(&content_id)?;
        let (duration_secs, duration_source) = resolve_duration(
            requested_duration,
            content_default,
            self.config.fallback_duration_secs,
        )?;
        check_duration(duration_secs)?;

        let (span, conflict_with, note) = self.place(&guard, start, duration_secs, None)?;

        let entry = ScheduleEntry {
            id: Ulid::new(),
            content_id,
            span,
            duration_secs,
            duration_source,
            active: true,
            owner,
        };
        let event = Event::ScheduleCreated { entry: entry.clone() };
        self.persist_and_apply(&mut guard, &event).await?;

        if let Some(n) = &note {
            info!("schedule {}: {n}", entry.id);
        }
        Ok(Placement {
            entry,
            adjusted: conflict_with.is_some(),
            conflict_with,
            note,
        })
    }

    /// Replace content, start and duration of an existing entry. The entry's
    /// own slot is ignored during conflict resolution, so re-submitting the
    /// current values is a no-op.
    pub async fn update_schedule(
        &self,
        id: Ulid,
        content_id: Ulid,
        start: Ms,
        requested_duration: Option<Secs>,
    ) -> Result<Placement, EngineError> {
        let mut guard = self.timeline.write().await;
        let existing = guard
            .by_id(&id)
            .cloned()
            .ok_or(EngineError::ScheduleNotFound(id))?;

        let content_default = self.catalog.default_duration(&content_id)?;
        let (duration_secs, duration_source) = resolve_duration(
            requested_duration,
            content_default,
            self.config.fallback_duration_secs,
        )?;
        check_duration(duration_secs)?;

        let (span, conflict_with, note) = if existing.active {
            self.place(&guard, start, duration_secs, Some(id))?
        } else {
            // Inactive entries are outside the no-overlap set until re-enabled.
            let span = derive_span(start, duration_secs)?;
            validate_span(&span)?;
            (span, None, None)
        };

        let entry = ScheduleEntry {
            content_id,
            span,
            duration_secs,
            duration_source,
            ..existing
        };
        let event = Event::ScheduleUpdated { entry: entry.clone() };
        self.persist_and_apply(&mut guard, &event).await?;

        if let Some(n) = &note {
            info!("schedule {id}: {n}");
        }
        Ok(Placement {
            entry,
            adjusted: conflict_with.is_some(),
            conflict_with,
            note,
        })
    }

    pub async fn delete_schedule(&self, id: Ulid) -> Result<ScheduleEntry, EngineError> {
        let mut guard = self.timeline.write().await;
        let existing = guard
            .by_id(&id)
            .cloned()
            .ok_or(EngineError::ScheduleNotFound(id))?;
        let event = Event::ScheduleDeleted { id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(existing)
    }

    /// Soft-disable or re-enable an entry. Re-enabling puts the entry back
    /// under the no-overlap rule, so it goes through conflict resolution.
    pub async fn set_schedule_active(&self, id: Ulid, active: bool) -> Result<Placement, EngineError> {
        let mut guard = self.timeline.write().await;
        let existing = guard
            .by_id(&id)
            .cloned()
            .ok_or(EngineError::ScheduleNotFound(id))?;

        if existing.active == active {
            return Ok(Placement {
                entry: existing,
                adjusted: false,
                conflict_with: None,
                note: None,
            });
        }

        let (span, conflict_with, note) = if active {
            self.place(&guard, existing.span.start, existing.duration_secs, Some(id))?
        } else {
            (existing.span, None, None)
        };

        let entry = ScheduleEntry {
            span,
            active,
            ..existing
        };
        let event = Event::ScheduleUpdated { entry: entry.clone() };
        self.persist_and_apply(&mut guard, &event).await?;

        Ok(Placement {
            entry,
            adjusted: conflict_with.is_some(),
            conflict_with,
            note,
        })
    }

    /// Set the default duration of `content_id` and recompute `end` for every
    /// entry whose duration follows it. Overlap is not re-checked.
    pub async fn on_content_duration_changed(
        &self,
        content_id: Ulid,
        new_duration_secs: Secs,
    ) -> Result<Vec<ScheduleEntry>, EngineError> {
        check_duration(new_duration_secs)?;
        let mut guard = self.timeline.write().await;
        let current = self
            .catalog
            .get(&content_id)
            .ok_or(EngineError::ContentNotFound(content_id))?;

        let changed = plan_cascade(&guard, content_id, new_duration_secs)?;
        if current.default_duration != Some(new_duration_secs) {
            let event = Event::ContentUpdated {
                id: content_id,
                title: current.title,
                default_duration: Some(new_duration_secs),
            };
            self.persist_and_apply(&mut guard, &event).await?;
        }
        self.persist_cascade(&mut guard, content_id, new_duration_secs, &changed)
            .await?;
        Ok(changed)
    }

    async fn persist_cascade(
        &self,
        timeline: &mut Timeline,
        content_id: Ulid,
        new_duration_secs: Secs,
        changed: &[ScheduleEntry],
    ) -> Result<(), EngineError> {
        for entry in changed {
            let event = Event::ScheduleUpdated { entry: entry.clone() };
            self.persist_and_apply(timeline, &event).await?;
        }
        if !changed.is_empty() {
            info!(
                "content {content_id}: duration now {new_duration_secs}s, {} schedules recomputed",
                changed.len()
            );
        }
        Ok(())
    }

    // ── Contents ─────────────────────────────────────────────

    pub async fn register_content(&self, content: Content) -> Result<(), EngineError> {
        validate_content(&content)?;
        let mut guard = self.timeline.write().await;
        if self.catalog.len() >= MAX_CONTENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many contents"));
        }
        if self.catalog.contains(&content.id) {
            return Err(EngineError::AlreadyExists(content.id));
        }
        let event = Event::ContentRegistered { content };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Change title and/or default duration. `default_duration: Some(None)`
    /// clears the default. A new positive default re-times every entry that
    /// follows it.
    pub async fn update_content(
        &self,
        id: Ulid,
        title: Option<String>,
        default_duration: Option<Option<Secs>>,
    ) -> Result<Content, EngineError> {
        if let Some(t) = &title {
            validate_title(t)?;
        }
        if let Some(d) = default_duration {
            validate_default_duration(d)?;
        }

        let mut guard = self.timeline.write().await;
        let current = self
            .catalog
            .get(&id)
            .ok_or(EngineError::ContentNotFound(id))?;
        let title = title.unwrap_or_else(|| current.title.clone());
        let new_default = default_duration.unwrap_or(current.default_duration);

        // Validate the re-timed spans before the new default is stored.
        let cascade = match new_default {
            Some(secs) if new_default != current.default_duration => {
                Some((secs, plan_cascade(&guard, id, secs)?))
            }
            _ => None,
        };

        let event = Event::ContentUpdated {
            id,
            title: title.clone(),
            default_duration: new_default,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        if let Some((secs, changed)) = cascade {
            self.persist_cascade(&mut guard, id, secs, &changed).await?;
        }

        Ok(Content {
            title,
            default_duration: new_default,
            ..current
        })
    }

    /// Remove a content item together with every entry that plays it.
    /// Returns how many entries went with it.
    pub async fn remove_content(&self, id: Ulid) -> Result<usize, EngineError> {
        let mut guard = self.timeline.write().await;
        if !self.catalog.contains(&id) {
            return Err(EngineError::ContentNotFound(id));
        }
        let doomed: Vec<Ulid> = guard.by_content(id).map(|e| e.id).collect();
        for sid in &doomed {
            let event = Event::ScheduleDeleted { id: *sid };
            self.persist_and_apply(&mut guard, &event).await?;
        }
        let event = Event::ContentRemoved { id };
        self.persist_and_apply(&mut guard, &event).await?;
        if !doomed.is_empty() {
            info!("content {id} removed with {} schedules", doomed.len());
        }
        Ok(doomed.len())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Hold the read lock so no mutation lands between snapshot and swap.
        let guard = self.timeline.read().await;
        let mut events: Vec<Event> = self
            .catalog
            .list()
            .into_iter()
            .map(|content| Event::ContentRegistered { content })
            .collect();
        events.extend(
            guard
                .all()
                .iter()
                .map(|entry| Event::ScheduleCreated { entry: entry.clone() }),
        );

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guard);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
