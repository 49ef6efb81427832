use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

/// Whole seconds — the only duration type for playback slots.
pub type Secs = i64;

pub const MS_PER_SEC: Ms = 1000;

/// Owner recorded when the caller has no identity of its own.
pub const SYSTEM_OWNER: &str = "admin";

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Where an entry's duration came from. Only `Explicit` durations survive a
/// change of the content's default duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurationSource {
    Explicit,
    ContentDefault,
    Fallback,
}

impl DurationSource {
    pub fn follows_content(self) -> bool {
        !matches!(self, DurationSource::Explicit)
    }
}

/// One playback slot on the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: Ulid,
    pub content_id: Ulid,
    pub span: Span,
    pub duration_secs: Secs,
    pub duration_source: DurationSource,
    pub active: bool,
    pub owner: String,
}

impl ScheduleEntry {
    pub fn start(&self) -> Ms {
        self.span.start
    }

    pub fn end(&self) -> Ms {
        self.span.end
    }
}

/// What a content item plays. Only the default duration matters to the
/// scheduler; the rest is carried for the display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentKind {
    Video { url: String },
    Banner { image_url: String, text: Option<String> },
    Text { text: String },
}

impl ContentKind {
    pub fn label(&self) -> &'static str {
        match self {
            ContentKind::Video { .. } => "video",
            ContentKind::Banner { .. } => "banner",
            ContentKind::Text { .. } => "text",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub id: Ulid,
    pub title: String,
    pub kind: ContentKind,
    pub default_duration: Option<Secs>,
    pub owner: String,
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ContentRegistered {
        content: Content,
    },
    ContentUpdated {
        id: Ulid,
        title: String,
        default_duration: Option<Secs>,
    },
    ContentRemoved {
        id: Ulid,
    },
    ScheduleCreated {
        entry: ScheduleEntry,
    },
    ScheduleUpdated {
        entry: ScheduleEntry,
    },
    ScheduleDeleted {
        id: Ulid,
    },
}

// ── Result types ─────────────────────────────────────────────────

/// Outcome of a create/update: the persisted entry plus what the resolver did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub entry: ScheduleEntry,
    pub adjusted: bool,
    /// The first entry the requested slot collided with.
    pub conflict_with: Option<Ulid>,
    /// Human-readable adjustment note, present only when `adjusted`.
    pub note: Option<String>,
}

/// A schedule entry joined with the content it plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NowPlaying {
    pub entry: ScheduleEntry,
    pub title: String,
    pub kind: ContentKind,
}
