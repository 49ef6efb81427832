use crate::model::{Ms, Secs};

// ── Time ─────────────────────────────────────────────────────────

/// Earliest accepted instant (Unix epoch).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// Latest accepted instant, roughly year 4199.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 1 << 46;

/// A single slot may not play for longer than a year.
pub const MAX_DURATION_SECS: Secs = 366 * 24 * 3600;

/// Used when neither the request nor the content supplies a duration.
pub const DEFAULT_FALLBACK_DURATION_SECS: Secs = 5;

/// Gap inserted after the anchor entry when a candidate is shifted.
pub const SHIFT_GAP_SECS: Secs = 1;

// ── Sizes ────────────────────────────────────────────────────────

pub const MAX_ENTRIES_PER_TIMELINE: usize = 100_000;
pub const MAX_CONTENTS_PER_TENANT: usize = 10_000;
pub const MAX_TITLE_LEN: usize = 100;
pub const MAX_BODY_LEN: usize = 2048;
pub const MAX_OWNER_LEN: usize = 64;

// ── Tenants ──────────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;
