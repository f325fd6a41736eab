//! Single byte-range requests (`Range: bytes=...`).

/// Inclusive byte interval `[start, end]` within a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered. Never zero.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a 206 response.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Outcome of evaluating a `Range` header against a resource length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// No usable range: serve the whole resource with 200.
    Full,
    /// Serve this interval with 206.
    Partial(ByteRange),
    /// The range lies wholly outside the resource: 416.
    Unsatisfiable,
}

/// Evaluate a `Range` header value for a resource of `len` bytes.
///
/// Unknown units, multiple ranges and syntactically invalid ranges are
/// ignored (the full resource is served), as HTTP allows.
pub fn evaluate(header: Option<&str>, len: u64) -> RangeRequest {
    let Some(header) = header else {
        return RangeRequest::Full;
    };
    let header = header.trim();
    let Some((unit, spec)) = header.split_once('=') else {
        return RangeRequest::Full;
    };
    if !unit.trim().eq_ignore_ascii_case("bytes") || spec.contains(',') {
        return RangeRequest::Full;
    }
    let Some((first, last)) = spec.trim().split_once('-') else {
        return RangeRequest::Full;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        // Suffix range: the final `n` bytes.
        let Ok(suffix) = last.parse::<u64>() else {
            return RangeRequest::Full;
        };
        if suffix == 0 || len == 0 {
            return RangeRequest::Unsatisfiable;
        }
        return RangeRequest::Partial(ByteRange {
            start: len.saturating_sub(suffix),
            end: len - 1,
        });
    }

    let Ok(start) = first.parse::<u64>() else {
        return RangeRequest::Full;
    };
    let end = if last.is_empty() {
        u64::MAX
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => end,
            _ => return RangeRequest::Full,
        }
    };

    if start >= len {
        return RangeRequest::Unsatisfiable;
    }
    RangeRequest::Partial(ByteRange {
        start,
        end: end.min(len - 1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(start: u64, end: u64) -> RangeRequest {
        RangeRequest::Partial(ByteRange { start, end })
    }

    #[test]
    fn test_no_header_is_full() {
        assert_eq!(evaluate(None, 100), RangeRequest::Full);
    }

    #[test]
    fn test_closed_range() {
        assert_eq!(evaluate(Some("bytes=0-9"), 100), partial(0, 9));
        assert_eq!(evaluate(Some("bytes=99-99"), 100), partial(99, 99));
    }

    #[test]
    fn test_end_is_clamped() {
        assert_eq!(evaluate(Some("bytes=90-500"), 100), partial(90, 99));
    }

    #[test]
    fn test_open_ended_range() {
        assert_eq!(evaluate(Some("bytes=50-"), 100), partial(50, 99));
    }

    #[test]
    fn test_suffix_range() {
        assert_eq!(evaluate(Some("bytes=-10"), 100), partial(90, 99));
        assert_eq!(evaluate(Some("bytes=-1000"), 100), partial(0, 99));
        assert_eq!(evaluate(Some("bytes=-0"), 100), RangeRequest::Unsatisfiable);
    }

    #[test]
    fn test_out_of_bounds_is_unsatisfiable() {
        assert_eq!(evaluate(Some("bytes=100-"), 100), RangeRequest::Unsatisfiable);
        assert_eq!(evaluate(Some("bytes=200-300"), 100), RangeRequest::Unsatisfiable);
        assert_eq!(evaluate(Some("bytes=0-0"), 0), RangeRequest::Unsatisfiable);
    }

    #[test]
    fn test_ignored_forms() {
        assert_eq!(evaluate(Some("items=0-5"), 100), RangeRequest::Full);
        assert_eq!(evaluate(Some("bytes=0-5,10-20"), 100), RangeRequest::Full);
        assert_eq!(evaluate(Some("bytes=9-3"), 100), RangeRequest::Full);
        assert_eq!(evaluate(Some("bytes=abc"), 100), RangeRequest::Full);
    }

    #[test]
    fn test_content_range() {
        let range = ByteRange { start: 10, end: 19 };
        assert_eq!(range.len(), 10);
        assert_eq!(range.content_range(100), "bytes 10-19/100");
    }
}
