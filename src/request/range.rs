//! Byte ranges of the `Range` header
use crate::error::Error;


/// A byte range, `end` is exclusive
///
/// Before `fix_lengths` is called unknown bounds are negative: `-N` (suffix
/// range) has `start == -1` and `end == N`, `N-` has `end == -1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub end: i64,
    pub len: i64,
}

impl Range {
    pub fn new(start: i64, end: i64) -> Range {
        Range { start, end, len: end - start }
    }
    /// Value for the `Content-Range` header
    pub fn content_range(&self, entity_length: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end - 1, entity_length)
    }
}

fn number(val: &str) -> Result<i64, Error> {
    let val = val.trim();
    if val.is_empty() || !val.bytes().all(|c| c.is_ascii_digit()) {
        return Err(Error::BadRange);
    }
    val.parse().map_err(|_| Error::BadRange)
}

/// Parses value of the `Range` header
pub fn parse(value: &str) -> Result<Vec<Range>, Error> {
    let value = value.trim();
    let spec = match value.find('=') {
        Some(idx) if value[..idx].trim().eq_ignore_ascii_case("bytes")
        => &value[idx+1..],
        _ => return Err(Error::BadRange),
    };
    let mut ranges = Vec::new();
    for item in spec.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let dash = item.find('-').ok_or(Error::BadRange)?;
        let (first, last) = (&item[..dash], &item[dash+1..]);
        let range = if first.trim().is_empty() {
            Range { start: -1, end: number(last)?, len: 0 }
        } else if last.trim().is_empty() {
            Range { start: number(first)?, end: -1, len: 0 }
        } else {
            let (start, end) = (number(first)?, number(last)? + 1);
            Range { start, end, len: end - start }
        };
        ranges.push(range);
    }
    if ranges.is_empty() {
        return Err(Error::BadRange);
    }
    validate(&ranges)?;
    Ok(ranges)
}

fn validate(ranges: &[Range]) -> Result<(), Error> {
    for (idx, r) in ranges.iter().enumerate() {
        if r.end != -1 && r.start >= r.end {
            return Err(Error::BadRange);
        }
        if r.start < 0 && r.end < 0 {
            return Err(Error::BadRange);
        }
        if let Some(next) = ranges.get(idx+1) {
            // suffix and open ranges extend to the end of the entity
            if r.start < 0 || r.end < 0 {
                return Err(Error::BadRange);
            }
            if next.start >= 0 && r.end > next.start {
                return Err(Error::BadRange);
            }
        }
    }
    Ok(())
}

/// Resolves open bounds against the entity length
///
/// Ranges starting past the end are dropped, when nothing is left the
/// request is not satisfiable.
pub fn fix_lengths(ranges: &mut Vec<Range>, length: u64)
    -> Result<(), Error>
{
    let length = length as i64;
    for r in ranges.iter_mut() {
        if r.start < 0 {
            r.start = (length - r.end).max(0);
            r.end = length;
        }
        if r.end < 0 || r.end > length {
            r.end = length;
        }
        r.len = r.end - r.start;
    }
    ranges.retain(|r| r.start < length && r.len > 0);
    if ranges.is_empty() {
        return Err(Error::RangeNotSatisfiable);
    }
    Ok(())
}
