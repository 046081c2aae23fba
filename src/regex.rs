//! Types and API for regex matching.
//!
//! This module defines [`Regex`], a thin wrapper over one of the available
//! engine implementations, and [`Context`], the caller-owned scratch space
//! every match call runs in.

#[cfg(target_arch = "x86_64")]
use std::error::Error as StdError;

use crate::syntax::Error;
use crate::thompson::arena::Arena;
use crate::thompson::bytecode::Program;
#[cfg(target_arch = "x86_64")]
use crate::thompson::pike_jit::PikeJit;
use crate::thompson::pike_vm::PikeVm;
use crate::util::{Captures, Match, Span};

/// Reusable scratch space for match calls.
///
/// A context owns the arena all executor state is allocated in. Its
/// capacity persists between calls, so a context reused across many
/// matches stops allocating once it has grown enough. A compiled
/// [`Regex`] is immutable and may be shared freely between threads; a
/// context holds mutable state and therefore may not, which is exactly
/// what `&mut Context` says.
#[derive(Debug, Default)]
pub struct Context {
    pub(crate) arena: Arena,
}

impl Context {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
        }
    }
}

/// A compiled regular expression.
pub struct Regex {
    engine: RegexEngine,
    group_count: usize,
}

impl Regex {
    /// Compile a pattern with the preferred engine for this platform:
    /// the JIT where available, the interpreter otherwise (or if native
    /// compilation fails, e.g. for programs beyond its size limits).
    pub fn new(pattern: impl AsRef<[u8]>) -> Result<Self, Error> {
        let parsed = crate::syntax::parse(pattern.as_ref())?;
        Ok(Self::from_program_auto(Program::compile(parsed)))
    }

    #[cfg(target_arch = "x86_64")]
    fn from_program_auto(program: Program) -> Self {
        match PikeJit::from_program(program.clone()) {
            Ok(jit) => {
                let group_count = jit.group_count();
                Self {
                    engine: RegexEngine::PikeJit(jit),
                    group_count,
                }
            }
            Err(_) => Self::from_vm(PikeVm::from_program(program)),
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn from_program_auto(program: Program) -> Self {
        Self::from_vm(PikeVm::from_program(program))
    }

    fn from_vm(vm: PikeVm) -> Self {
        let group_count = vm.group_count();
        Self {
            engine: RegexEngine::PikeVm(vm),
            group_count,
        }
    }

    /// Compile a pattern for the interpreted engine.
    pub fn pike_vm(pattern: impl AsRef<[u8]>) -> Result<Self, Error> {
        Ok(Self::from_vm(PikeVm::new(pattern.as_ref())?))
    }

    /// Compile a pattern for the jitted engine.
    #[cfg(target_arch = "x86_64")]
    pub fn pike_jit(
        pattern: impl AsRef<[u8]>,
    ) -> Result<Self, Box<dyn StdError + Send + Sync + 'static>> {
        let jit = PikeJit::new(pattern.as_ref())?;
        let group_count = jit.group_count();
        Ok(Self {
            engine: RegexEngine::PikeJit(jit),
            group_count,
        })
    }

    /// The number of capturing groups, counting the implicit group 0 that
    /// spans the whole match.
    pub fn group_count(&self) -> usize {
        self.group_count
    }

    /// Returns whether the input matches anywhere. Equivalent to
    /// `find(..).is_some()`, but faster: the engines short-circuit on the
    /// first match and skip all bookkeeping of bounds.
    pub fn is_match(&self, context: &mut Context, haystack: impl AsRef<[u8]>) -> bool {
        self.engine.is_match(context, haystack.as_ref(), 0)
    }

    /// Returns the leftmost match, or None.
    pub fn find<'h>(&self, context: &mut Context, haystack: &'h [u8]) -> Option<Match<'h>> {
        self.find_at(context, haystack, 0)
    }

    /// Returns the leftmost match with the bounds of every capture group.
    /// If only the overall bounds are needed, prefer [`Regex::find`],
    /// which tracks two positions per thread instead of two per group.
    pub fn captures<'h>(&self, context: &mut Context, haystack: &'h [u8]) -> Option<Captures<'h>> {
        self.captures_at(context, haystack, 0)
    }

    /// Iterator over all non-overlapping matches.
    pub fn find_iter<'r, 'c, 'h>(
        &'r self,
        context: &'c mut Context,
        haystack: &'h [u8],
    ) -> FindIter<'r, 'c, 'h> {
        FindIter {
            regex: self,
            context,
            haystack,
            at: 0,
        }
    }

    /// Iterator over all non-overlapping matches, with capture groups.
    pub fn captures_iter<'r, 'c, 'h>(
        &'r self,
        context: &'c mut Context,
        haystack: &'h [u8],
    ) -> CapturesIter<'r, 'c, 'h> {
        CapturesIter {
            regex: self,
            context,
            haystack,
            at: 0,
        }
    }

    fn find_at<'h>(
        &self,
        context: &mut Context,
        haystack: &'h [u8],
        start: usize,
    ) -> Option<Match<'h>> {
        let mut spans = [Span::invalid()];
        self.engine
            .find_captures(context, haystack, start, &mut spans)
            .then(|| Match::new(haystack, spans[0]))
    }

    fn captures_at<'h>(
        &self,
        context: &mut Context,
        haystack: &'h [u8],
        start: usize,
    ) -> Option<Captures<'h>> {
        let mut spans = vec![Span::invalid(); self.group_count].into_boxed_slice();
        self.engine
            .find_captures(context, haystack, start, &mut spans)
            .then(|| Captures::new(haystack, spans))
    }
}

/// Iterator over all matches of a regex.
pub struct FindIter<'r, 'c, 'h> {
    regex: &'r Regex,
    context: &'c mut Context,
    haystack: &'h [u8],
    at: usize,
}

impl<'r, 'c, 'h> Iterator for FindIter<'r, 'c, 'h> {
    type Item = Match<'h>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = self.regex.find_at(self.context, self.haystack, self.at)?;
        self.at = result.next_match_start();
        Some(result)
    }
}

/// Iterator over all matches and their capture groups.
pub struct CapturesIter<'r, 'c, 'h> {
    regex: &'r Regex,
    context: &'c mut Context,
    haystack: &'h [u8],
    at: usize,
}

impl<'r, 'c, 'h> Iterator for CapturesIter<'r, 'c, 'h> {
    type Item = Captures<'h>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = self
            .regex
            .captures_at(self.context, self.haystack, self.at)?;
        self.at = result.group0().next_match_start();
        Some(result)
    }
}

/// A regex implementation. Used to dispatch to the chosen engine at
/// runtime.
enum RegexEngine {
    PikeVm(PikeVm),
    #[cfg(target_arch = "x86_64")]
    PikeJit(PikeJit),
}

impl RegexImpl for RegexEngine {
    fn group_count(&self) -> usize {
        match self {
            RegexEngine::PikeVm(vm) => vm.group_count(),
            #[cfg(target_arch = "x86_64")]
            RegexEngine::PikeJit(jit) => jit.group_count(),
        }
    }

    fn is_match(&self, context: &mut Context, haystack: &[u8], start: usize) -> bool {
        match self {
            RegexEngine::PikeVm(vm) => vm.is_match(context, haystack, start),
            #[cfg(target_arch = "x86_64")]
            RegexEngine::PikeJit(jit) => jit.is_match(context, haystack, start),
        }
    }

    fn find_captures(
        &self,
        context: &mut Context,
        haystack: &[u8],
        start: usize,
        spans: &mut [Span],
    ) -> bool {
        match self {
            RegexEngine::PikeVm(vm) => vm.find_captures(context, haystack, start, spans),
            #[cfg(target_arch = "x86_64")]
            RegexEngine::PikeJit(jit) => jit.find_captures(context, haystack, start, spans),
        }
    }
}

/// The lower-level API every engine in this crate implements. Technically
/// only `find_captures` is strictly needed (the span slice determines
/// what gets tracked), but a dedicated boolean entry lets engines
/// short-circuit.
pub(crate) trait RegexImpl {
    fn group_count(&self) -> usize;

    /// Returns whether the input matches at or after `start`.
    fn is_match(&self, context: &mut Context, haystack: &[u8], start: usize) -> bool;

    /// Finds the leftmost match at or after `start` and fills the given
    /// span slice. With a slice of length n, only the first n groups are
    /// tracked; slots beyond the pattern's group count are left alone.
    /// Returns whether anything matched; on false the slice is untouched.
    fn find_captures(
        &self,
        context: &mut Context,
        haystack: &[u8],
        start: usize,
        spans: &mut [Span],
    ) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn front_end_find_and_captures() {
        let regex = Regex::new(r"(\w+)-(\d+)").unwrap();
        let mut context = Context::new();

        let m = regex.find(&mut context, b"see test-42 here").unwrap();
        assert_eq!(m.as_bytes(), b"test-42");

        let caps = regex.captures(&mut context, b"see test-42 here").unwrap();
        assert_eq!(caps.get(1).unwrap().as_bytes(), b"test");
        assert_eq!(caps.get(2).unwrap().as_bytes(), b"42");
        assert_eq!(regex.group_count(), 3);
    }

    #[test]
    fn find_iter_non_overlapping() {
        let regex = Regex::new(r"\d+").unwrap();
        let mut context = Context::new();

        let all: Vec<_> = regex
            .find_iter(&mut context, b"1, 23, and 456")
            .map(|m| (m.span.from, m.span.to))
            .collect();
        assert_eq!(all, vec![(0, 1), (3, 5), (11, 14)]);
    }

    #[test]
    fn find_iter_empty_matches_advance() {
        let regex = Regex::new(r"b*").unwrap();
        let mut context = Context::new();

        let all: Vec<_> = regex
            .find_iter(&mut context, b"abb")
            .map(|m| (m.span.from, m.span.to))
            .collect();
        assert_eq!(all, vec![(0, 0), (1, 3), (3, 3)]);
    }

    #[test]
    fn captures_iter() {
        let regex = Regex::new(r"(\d)(\d)?").unwrap();
        let mut context = Context::new();

        let all: Vec<_> = regex
            .captures_iter(&mut context, b"12 3")
            .map(|caps| {
                (
                    caps.get(1).map(|m| m.span.from),
                    caps.get(2).map(|m| m.span.from),
                )
            })
            .collect();
        assert_eq!(all, vec![(Some(0), Some(1)), (Some(3), None)]);
    }

    #[test]
    fn compile_errors_surface() {
        assert_eq!(Regex::new(r"a{3,1}").err(), Some(Error::BadRepetition));
        assert_eq!(Regex::new(r"(a").err(), Some(Error::UnmatchedOpenParen));
    }

    #[test]
    fn engines_choose_explicitly() {
        let vm = Regex::pike_vm(r"ab+").unwrap();
        let mut context = Context::new();
        assert!(vm.is_match(&mut context, b"cabbage"));

        #[cfg(target_arch = "x86_64")]
        {
            let jit = Regex::pike_jit(r"ab+").unwrap();
            assert!(jit.is_match(&mut context, b"cabbage"));
        }
    }
}
