use crate::model::Ms;

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 50_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CATEGORY_LEN: usize = 64;
pub const MAX_CUSTOMER_FIELD_LEN: usize = 320;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// A single rental may not exceed one year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;
/// Calendar queries (free windows, fleet search) are capped at two years.
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 366 * 24 * 3_600_000;
/// Turnaround may not exceed a week.
pub const MAX_BUFFER_AFTER_MS: Ms = 7 * 24 * 3_600_000;

pub const MAX_STATEMENT_LEN: usize = 64 * 1024;
