use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Turn raw bounds into a span, rejecting inverted or out-of-range input.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::Validation(format!(
            "start ({start}) must be before end ({end})"
        )));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(Span::new(start, end))
}

pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::Validation(format!(
            "start ({start}) must be before end ({end})"
        )));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(Span::new(start, end))
}

pub(crate) fn validate_buffer(buffer_after: Option<Ms>) -> Result<(), EngineError> {
    match buffer_after {
        Some(b) if b < 0 => Err(EngineError::Validation(format!(
            "buffer_after must not be negative, got {b}"
        ))),
        Some(b) if b > MAX_BUFFER_AFTER_MS => Err(EngineError::LimitExceeded("buffer_after too long")),
        _ => Ok(()),
    }
}

pub(crate) fn validate_text(
    value: &Option<String>,
    max: usize,
    what: &'static str,
) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

/// First active reservation that would collide with `span`, if any.
///
/// With a turnaround buffer `b`, an existing reservation `e` collides iff
/// `e.start < span.end + b && span.start < e.end + b`. With no buffer this is
/// the plain half-open overlap, so back-to-back rentals never collide.
pub(crate) fn find_conflict(rs: &ResourceState, span: &Span) -> Option<Ulid> {
    let buffer = rs.buffer_after.unwrap_or(0);
    let search = Span::new(span.start - buffer, span.end + buffer);

    rs.overlapping(&search)
        .filter(|r| r.is_active())
        .find(|r| r.span.start < span.end + buffer && span.start < r.span.end + buffer)
        .map(|r| r.id)
}

/// Active reservations touching `window`, padded by the turnaround buffer
/// on both sides and sorted by start.
pub(crate) fn occupied_spans(rs: &ResourceState, window: &Span) -> Vec<Span> {
    let buffer = rs.buffer_after.unwrap_or(0);
    let search = window.padded(buffer);
    let mut spans: Vec<Span> = rs
        .overlapping(&search)
        .filter(|r| r.is_active())
        .map(|r| r.span.padded(buffer))
        .collect();
    spans.sort_by_key(|s| s.start);
    spans
}
