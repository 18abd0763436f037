// HTTP Range header parsing and resolution against a known resource length.

use crate::error::{RelayError, RelayResult};

#[derive(Debug, PartialEq, Eq)]
pub enum ParsedRange {
    StartEnd {
        start: u64,
        end_inclusive: Option<u64>,
    },
    Suffix {
        len: u64,
    },
}

/// Parse a Range header value.
/// Supports:
/// - bytes=start-end
/// - bytes=start-
/// - bytes=-suffix_len
///
/// Multi-range requests are not supported and parse as `None`.
pub fn parse_range_header(value: &str) -> Option<ParsedRange> {
    let value = value.trim();
    let rest = value.strip_prefix("bytes=")?;
    if rest.contains(',') {
        return None;
    }
    let mut parts = rest.splitn(2, '-');
    let start_str = parts.next()?.trim();
    let end_str = parts.next()?.trim();

    if start_str.is_empty() {
        let len: u64 = end_str.parse().ok()?;
        if len == 0 {
            return None;
        }
        Some(ParsedRange::Suffix { len })
    } else {
        let start: u64 = start_str.parse().ok()?;
        let end_inclusive = if end_str.is_empty() {
            None
        } else {
            Some(end_str.parse::<u64>().ok()?)
        };
        Some(ParsedRange::StartEnd {
            start,
            end_inclusive,
        })
    }
}

/// Inclusive byte range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// The whole resource. `length` must be non-zero.
    pub fn full(length: u64) -> Self {
        Self {
            start: 0,
            end: length.saturating_sub(1),
        }
    }

    /// Never zero: a resolved range always covers at least one byte.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for this range within a resource of `total` bytes.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Resolve an optional Range header against a resource of `length` bytes.
///
/// Returns `Ok(None)` when the whole resource should be served (no header, or
/// a header that does not parse), and `RangeNotSatisfiable` when the requested
/// window falls outside the resource.
pub fn resolve_range(header: Option<&str>, length: u64) -> RelayResult<Option<ByteRange>> {
    let parsed = match header.and_then(parse_range_header) {
        Some(p) => p,
        None => return Ok(None),
    };

    if length == 0 {
        return Err(RelayError::RangeNotSatisfiable { length });
    }
    let last = length - 1;

    let range = match parsed {
        ParsedRange::StartEnd {
            start,
            end_inclusive,
        } => {
            let end = end_inclusive.unwrap_or(last).min(last);
            if start > end {
                return Err(RelayError::RangeNotSatisfiable { length });
            }
            ByteRange { start, end }
        }
        ParsedRange::Suffix { len } => ByteRange {
            start: length.saturating_sub(len),
            end: last,
        },
    };
    Ok(Some(range))
}
