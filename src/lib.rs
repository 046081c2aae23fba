//! # bregex
//!
//! **bregex** is a byte-oriented regular expression library with a
//! compile-once / match-many API and two interchangeable engines.
//!
//! ## Features
//!
//! - **Multiple engines:** an interpreted Pike VM, and on x86-64 a
//!   JIT-compiled variant of the same executor. Both guarantee linear-time
//!   matching (no catastrophic backtracking) while preserving the answers
//!   a leftmost-first backtracking engine would give.
//! - **Bytes end to end:** patterns and haystacks are `&[u8]`; character
//!   classes are 256-bit byte sets. There is no Unicode layer.
//! - **Reusable contexts:** match calls run in a caller-owned [`Context`]
//!   whose arena is recycled between calls, so matching in a loop stops
//!   allocating once the context has warmed up.
//!
//! ## Usage
//!
//! ```rust
//! use bregex::{Context, Regex};
//!
//! let re = Regex::new(r"(\d+)\.(\d+)").unwrap();
//! let mut ctx = Context::new();
//!
//! assert!(re.is_match(&mut ctx, b"pi is 3.14"));
//! let caps = re.captures(&mut ctx, b"pi is 3.14").unwrap();
//! assert_eq!(caps.group0().as_bytes(), b"3.14");
//! assert_eq!(caps.get(1).unwrap().as_bytes(), b"3");
//! ```
//!
//! ## Pattern dialect
//!
//! Literals, `.`, `[...]` classes (ranges, negation, `[:posix:]` names),
//! `\d \D \s \S \w \W`, escapes `\a \f \n \r \t \v \xhh`, anchors
//! `^ $ \A \z \b \B` (`^`/`$` are line anchors), alternation, greedy and
//! lazy repetition (`* + ? {lo} {lo,} {lo,hi}` with optional `?`),
//! capturing `(...)` and non-capturing `(?:...)` groups. Backreferences,
//! lookaround and named groups are not supported.
//!
//! ## Crate organization
//!
//! - `regex`: core API and engine dispatch
//! - `syntax`: byte classes, lexer and parser
//! - `thompson`: the bytecode form of the NFA and both executors
//! - `util`: shared types (spans, matches, captures)

pub mod regex;
pub mod syntax;
pub mod thompson;
pub mod util;

pub use regex::{Context, Regex};
pub use syntax::Error;
pub use util::{Captures, Match, Span};
