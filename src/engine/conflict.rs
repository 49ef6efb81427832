use std::str::FromStr;

use ulid::Ulid;

use crate::model::*;

use super::EngineError;
use super::interval::{derive_span, overlaps};

/// Which entry a conflicting candidate is moved behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShiftAnchor {
    /// The active entry with the latest end on the whole timeline.
    #[default]
    LatestActive,
    /// The latest-ending entry among those the candidate actually overlaps.
    LatestConflicting,
}

impl FromStr for ShiftAnchor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest_active" => Ok(ShiftAnchor::LatestActive),
            "latest_conflicting" => Ok(ShiftAnchor::LatestConflicting),
            other => Err(format!("unknown shift anchor: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPlacement {
    pub span: Span,
    pub adjusted: bool,
    /// First (lowest start) entry the requested span overlapped.
    pub conflict_with: Option<Ulid>,
    /// Entry the shifted span was placed behind.
    pub anchor: Option<Ulid>,
}

/// First active entry (other than `exclude`) overlapping `span`, by start.
pub(crate) fn first_conflict<'a>(
    span: &Span,
    existing: &'a [ScheduleEntry],
    exclude: Option<Ulid>,
) -> Option<&'a ScheduleEntry> {
    existing
        .iter()
        .filter(|e| e.active && Some(e.id) != exclude)
        .find(|e| overlaps(&e.span, span))
}

/// Place a candidate slot of `duration_secs` starting at `start`.
///
/// If it overlaps any active entry, it is shifted once to start one second
/// after the anchor's end. The shifted span is not checked again here.
pub fn resolve(
    start: Ms,
    duration_secs: Secs,
    existing: &[ScheduleEntry],
    exclude: Option<Ulid>,
    anchor: ShiftAnchor,
) -> Result<ResolvedPlacement, EngineError> {
    let span = derive_span(start, duration_secs)?;

    let candidates = move || {
        existing
            .iter()
            .filter(move |e| e.active && Some(e.id) != exclude)
    };
    let conflicts: Vec<&ScheduleEntry> = candidates().filter(|e| overlaps(&e.span, &span)).collect();
    let Some(&first) = conflicts.first() else {
        return Ok(ResolvedPlacement {
            span,
            adjusted: false,
            conflict_with: None,
            anchor: None,
        });
    };

    // Latest end wins; equal ends go to the smallest id.
    let latest = |a: &&ScheduleEntry, b: &&ScheduleEntry| {
        a.span.end.cmp(&b.span.end).then(b.id.cmp(&a.id))
    };
    let anchor_entry = match anchor {
        ShiftAnchor::LatestActive => candidates().max_by(latest),
        ShiftAnchor::LatestConflicting => conflicts.iter().copied().max_by(latest),
    }
    .unwrap_or(first);

    let new_start = anchor_entry
        .span
        .end
        .checked_add(crate::limits::SHIFT_GAP_SECS * MS_PER_SEC)
        .ok_or(EngineError::LimitExceeded("shifted start overflows"))?;
    Ok(ResolvedPlacement {
        span: derive_span(new_start, duration_secs)?,
        adjusted: true,
        conflict_with: Some(first.id),
        anchor: Some(anchor_entry.id),
    })
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn adjustment_note(conflict_with: Ulid, new_start: Ms) -> String {
    let when = chrono::DateTime::from_timestamp_millis(new_start)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| new_start.to_string());
    format!("overlaps schedule {conflict_with}; rescheduled to start at {when} UTC")
}
