use crate::model::*;

use super::EngineError;

/// `start + duration_secs`, in ms. Rejects non-positive durations.
pub fn derive_end(start: Ms, duration_secs: Secs) -> Result<Ms, EngineError> {
    if duration_secs <= 0 {
        return Err(EngineError::InvalidDuration(duration_secs));
    }
    duration_secs
        .checked_mul(MS_PER_SEC)
        .and_then(|d| start.checked_add(d))
        .ok_or(EngineError::LimitExceeded("end time overflows"))
}

/// Build the span a slot starting at `start` occupies.
pub fn derive_span(start: Ms, duration_secs: Secs) -> Result<Span, EngineError> {
    let end = derive_end(start, duration_secs)?;
    Ok(Span::new(start, end))
}

pub fn overlaps(a: &Span, b: &Span) -> bool {
    a.overlaps(b)
}

/// Pick the first positive duration: requested, then content default, then
/// fallback. The source tells the caller whether the entry should follow later
/// changes of the content default.
pub fn resolve_duration(
    requested: Option<Secs>,
    content_default: Option<Secs>,
    fallback: Secs,
) -> Result<(Secs, DurationSource), EngineError> {
    if let Some(req) = requested {
        if req > 0 {
            let source = if content_default == Some(req) {
                DurationSource::ContentDefault
            } else {
                DurationSource::Explicit
            };
            return Ok((req, source));
        }
    }
    if let Some(def) = content_default
        && def > 0
    {
        return Ok((def, DurationSource::ContentDefault));
    }
    if fallback > 0 {
        return Ok((fallback, DurationSource::Fallback));
    }
    Err(EngineError::InvalidDuration(
        requested.or(content_default).unwrap_or(fallback),
    ))
}

/// Distance from the end of the earlier span to the start of the later one.
/// Zero means adjacent, negative means the two overlap.
pub fn gap(a: &Span, b: &Span) -> Ms {
    let (first, second) = if a.start <= b.start { (a, b) } else { (b, a) };
    second.start - first.end
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Ms = 1_700_000_000_000;

    #[test]
    fn derive_end_adds_seconds() {
        assert_eq!(derive_end(T, 10).unwrap(), T + 10_000);
        assert_eq!(derive_end(0, 1).unwrap(), 1_000);
    }

    #[test]
    fn derive_end_rejects_non_positive() {
        assert!(matches!(derive_end(T, 0), Err(EngineError::InvalidDuration(0))));
        assert!(matches!(derive_end(T, -5), Err(EngineError::InvalidDuration(-5))));
    }

    #[test]
    fn derive_end_overflow_is_limit() {
        assert!(matches!(
            derive_end(Ms::MAX - 10, 1),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn touching_spans_do_not_overlap() {
        let a = Span::new(0, 10_000);
        let b = Span::new(10_000, 20_000);
        assert!(!overlaps(&a, &b));
        assert!(overlaps(&a, &Span::new(9_999, 20_000)));
    }

    #[test]
    fn resolve_duration_prefers_request() {
        assert_eq!(
            resolve_duration(Some(7), Some(10), 5).unwrap(),
            (7, DurationSource::Explicit)
        );
    }

    #[test]
    fn resolve_duration_request_equal_to_default_follows_content() {
        assert_eq!(
            resolve_duration(Some(10), Some(10), 5).unwrap(),
            (10, DurationSource::ContentDefault)
        );
    }

    #[test]
    fn resolve_duration_skips_non_positive_request() {
        assert_eq!(
            resolve_duration(Some(0), Some(10), 5).unwrap(),
            (10, DurationSource::ContentDefault)
        );
        assert_eq!(
            resolve_duration(Some(-3), None, 5).unwrap(),
            (5, DurationSource::Fallback)
        );
    }

    #[test]
    fn resolve_duration_all_absent_fails() {
        assert!(matches!(
            resolve_duration(None, None, 0),
            Err(EngineError::InvalidDuration(0))
        ));
        assert!(matches!(
            resolve_duration(Some(-1), Some(0), -2),
            Err(EngineError::InvalidDuration(-1))
        ));
    }

    #[test]
    fn gap_is_symmetric() {
        let a = Span::new(0, 10_000);
        let b = Span::new(11_000, 12_000);
        assert_eq!(gap(&a, &b), 1_000);
        assert_eq!(gap(&b, &a), 1_000);
        assert_eq!(gap(&a, &Span::new(10_000, 12_000)), 0);
        assert_eq!(gap(&a, &Span::new(5_000, 12_000)), -5_000);
    }
}
