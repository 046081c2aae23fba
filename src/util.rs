/*!
Utility types shared by every engine in this crate: spans, matches and
capture groups.
*/

use std::ops::Range;

/// A half-open range of byte offsets into a haystack. Similar to
/// [`std::ops::Range`], but implements Copy. It is also repr(C) so the
/// jitted code can fill span tables directly.
#[derive(Copy, Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct Span {
    pub from: usize,
    pub to: usize,
}

impl Span {
    pub fn empty(&self) -> bool {
        self.from == self.to
    }

    pub fn valid(&self) -> bool {
        self.from <= self.to
    }

    /// The sentinel span of a capture group that did not participate in
    /// the match.
    pub fn invalid() -> Span {
        Span { from: 1, to: 0 }
    }
}

impl From<Range<usize>> for Span {
    fn from(value: Range<usize>) -> Self {
        Self {
            from: value.start,
            to: value.end,
        }
    }
}

impl From<Span> for Range<usize> {
    fn from(val: Span) -> Self {
        val.from..val.to
    }
}

/// Successful non-capturing match. Contains only the bounds of the
/// overall match.
#[derive(Copy, Debug, Clone)]
pub struct Match<'h> {
    pub haystack: &'h [u8],
    pub span: Span,
}

impl<'h> Match<'h> {
    pub fn new(haystack: &'h [u8], span: impl Into<Span>) -> Self {
        let span = span.into();
        Self { haystack, span }
    }

    pub fn as_bytes(&self) -> &'h [u8] {
        &self.haystack[self.span.from..self.span.to]
    }

    /// Returns the byte offset where the next non-overlapping match may
    /// start. An empty match must advance by one byte, otherwise an
    /// iterator would yield the same empty match forever.
    pub fn next_match_start(&self) -> usize {
        if self.span.empty() {
            self.span.to + 1
        } else {
            self.span.to
        }
    }
}

/// Successful capturing match. Contains the bounds (if any) of all capture
/// groups defined in the pattern, including the implicit group 0.
#[derive(Debug, Clone)]
pub struct Captures<'h> {
    haystack: &'h [u8],
    spans: Box<[Span]>,
}

impl<'h> Captures<'h> {
    pub fn new(haystack: &'h [u8], spans: Box<[Span]>) -> Self {
        Self { haystack, spans }
    }

    pub fn get(&self, group_index: usize) -> Option<Match<'h>> {
        let span = *self.spans.get(group_index)?;
        if !span.valid() {
            return None;
        }

        Some(Match {
            haystack: self.haystack,
            span,
        })
    }

    /// The overall match. Always set.
    pub fn group0(&self) -> Match<'h> {
        self.get(0).unwrap()
    }

    pub fn group_len(&self) -> usize {
        self.spans.len()
    }
}
