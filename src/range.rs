//! Range Module
//!
//! Parses HTTP `Range: bytes=...` header values and normalizes them against
//! a known object size. Only single-interval ranges are supported; multi-range
//! values are rejected as unparseable.

use crate::{GatewayError, Result};

/// A parsed but unresolved range: the raw start/end bounds as they appeared
/// in the header. `start == None` indicates the suffix form `bytes=-N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

/// A normalized byte range with inclusive bounds, valid against some total
/// size `T`: `0 <= start <= end < T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
}

impl RangeSpec {
    /// Number of bytes covered by this range
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` header value for a 206 response over a body of
    /// `total` bytes
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Parse the syntactic form of a Range header value without knowing the
/// object size. Fails with `UnparseableRange` on anything that is not a
/// single `bytes=` interval.
pub fn parse_bounds(value: &str) -> Result<RawRange> {
    let value = value.trim();
    let spec = value
        .strip_prefix("bytes=")
        .ok_or_else(|| GatewayError::UnparseableRange(value.to_string()))?;

    if spec.contains(',') {
        // Multi-range requests are not supported
        return Err(GatewayError::UnparseableRange(value.to_string()));
    }

    let (start_str, end_str) = spec
        .split_once('-')
        .ok_or_else(|| GatewayError::UnparseableRange(value.to_string()))?;

    let start = parse_bound(start_str, value)?;
    let end = parse_bound(end_str, value)?;

    if start.is_none() && end.is_none() {
        return Err(GatewayError::UnparseableRange(value.to_string()));
    }

    Ok(RawRange { start, end })
}

fn parse_bound(digits: &str, original: &str) -> Result<Option<u64>> {
    if digits.is_empty() {
        return Ok(None);
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(GatewayError::UnparseableRange(original.to_string()));
    }
    digits
        .parse::<u64>()
        .map(Some)
        .map_err(|_| GatewayError::UnparseableRange(original.to_string()))
}

/// Resolve raw bounds against the total object size.
///
/// Defaulting rules: a missing end means "to the last byte"; the suffix form
/// `bytes=-N` selects the final N bytes and clamps to the whole body when
/// `N >= total`. Fails with `UnsatisfiableRange` when the start lands at or
/// past the end of the body, or start exceeds end.
pub fn resolve(raw: RawRange, total: u64) -> Result<RangeSpec> {
    let (start, end) = match (raw.start, raw.end) {
        (Some(start), Some(end)) => (start, end.min(total.saturating_sub(1))),
        (Some(start), None) => (start, total.saturating_sub(1)),
        (None, Some(suffix)) => {
            if suffix == 0 {
                return Err(GatewayError::UnsatisfiableRange(format!(
                    "suffix of 0 bytes against total {}",
                    total
                )));
            }
            let start = total.saturating_sub(suffix);
            (start, total.saturating_sub(1))
        }
        (None, None) => {
            return Err(GatewayError::UnparseableRange("empty range".to_string()));
        }
    };

    if start >= total {
        return Err(GatewayError::UnsatisfiableRange(format!(
            "start {} beyond total {}",
            start, total
        )));
    }
    if start > end {
        return Err(GatewayError::UnsatisfiableRange(format!(
            "start {} after end {}",
            start, end
        )));
    }

    Ok(RangeSpec { start, end })
}

/// Parse a Range header value and normalize it against `total`
pub fn parse(value: &str, total: u64) -> Result<RangeSpec> {
    resolve(parse_bounds(value)?, total)
}
