//! Generative differential suites: random inputs in the shapes the engine
//! is typically pointed at (dotted quads, word lists, counted
//! repetitions), all checked against the reference engine.

mod utils;

use proptest::prelude::*;
use utils::check;

const IPV4: &str =
    r"\A(0|[1-9][0-9]{0,2})\.(0|[1-9][0-9]{0,2})\.(0|[1-9][0-9]{0,2})\.(0|[1-9][0-9]{0,2})\z";

proptest! {
    #[test]
    fn dotted_quads(
        a in 0u32..400,
        b in 0u32..400,
        c in 0u32..400,
        d in 0u32..400,
        mangle in 0usize..4,
    ) {
        let mut input = format!("{a}.{b}.{c}.{d}");
        // occasionally damage the quad so the reject paths get exercised
        match mangle {
            0 => input = input.replacen('.', "..", 1),
            1 => input.push('.'),
            2 => input = input.replacen('.', "", 1),
            _ => {}
        }
        check(IPV4, input.as_bytes());
    }

    #[test]
    fn word_boundaries(
        words in proptest::collection::vec("[a-z]{1,8}", 1..8),
        needle in "[a-z]{1,4}",
    ) {
        let haystack = words.join(" ");
        check(&format!(r"\b{needle}\b"), haystack.as_bytes());
        check(&format!(r"\b(?:{needle})+\b"), haystack.as_bytes());
    }

    #[test]
    fn counted_repetitions(
        lo in 0u32..5,
        extra in 0u32..5,
        lazy in proptest::bool::ANY,
        run in 0usize..12,
        unbounded in proptest::bool::ANY,
    ) {
        let hi = lo + extra;
        let suffix = if lazy { "?" } else { "" };
        let pattern = if unbounded {
            format!("xa{{{lo},}}{suffix}y?")
        } else {
            format!("xa{{{lo},{hi}}}{suffix}y?")
        };
        let haystack = format!("zx{}yz", "a".repeat(run));
        check(&pattern, haystack.as_bytes());
    }

    #[test]
    fn random_haystacks(haystack in proptest::collection::vec(any::<u8>(), 0..64)) {
        for pattern in [
            r"[A-Za-z]+",
            r"\d+(?:\.\d+)?",
            r"(.)\x00?",
            r"\w+\s*=\s*\w+",
            r"[^\x00-\x1f]+",
            r"(a|ab|abc)+",
        ] {
            check(pattern, &haystack);
        }
    }

    #[test]
    fn ascii_haystacks(haystack in "[ab\n ]{0,32}") {
        for pattern in [
            r"^a+",
            r"b*$",
            r"\ba\b",
            r"(a+b)+",
            r"a*?b",
            r"\A[ab ]*\z",
        ] {
            check(pattern, haystack.as_bytes());
        }
    }
}
