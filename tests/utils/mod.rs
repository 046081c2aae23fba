use bregex::{Context, Regex};
use regex as rust_regex;

/// Compile a pattern on every engine this build provides. Returns None if
/// the pattern is rejected, and panics if the engines disagree about
/// whether it is valid syntax.
pub fn compile_engines(pattern: &str) -> Option<Vec<Regex>> {
    let mut engines = Vec::new();

    if let Ok(vm) = Regex::pike_vm(pattern) {
        engines.push(vm);
    }

    #[cfg(target_arch = "x86_64")]
    match Regex::pike_jit(pattern) {
        Ok(jit) => {
            assert!(
                !engines.is_empty(),
                "pike_jit accepts {pattern:?} but pike_vm rejects it"
            );
            engines.push(jit);
        }
        Err(err) => {
            // native compilation may fail for resource reasons; only a
            // syntax disagreement is a bug
            if err.downcast_ref::<bregex::Error>().is_some() {
                assert!(
                    engines.is_empty(),
                    "pike_jit rejects {pattern:?} but pike_vm accepts it"
                );
            }
        }
    }

    if engines.is_empty() { None } else { Some(engines) }
}

/// The reference engine, configured to speak this crate's dialect: byte
/// oriented, ASCII classes, `^`/`$` as line anchors.
pub fn oracle(pattern: &str) -> Option<rust_regex::bytes::Regex> {
    rust_regex::bytes::RegexBuilder::new(pattern)
        .multi_line(true)
        .unicode(false)
        .build()
        .ok()
}

fn spans_of(regex: &Regex, context: &mut Context, haystack: &[u8]) -> Option<Vec<Option<(usize, usize)>>> {
    let caps = regex.captures(context, haystack)?;
    Some(
        (0..caps.group_len())
            .map(|i| caps.get(i).map(|m| (m.span.from, m.span.to)))
            .collect(),
    )
}

/// Match `pattern` against `haystack` on every engine and compare the
/// results of every query mode, against each other and (when the oracle
/// accepts the pattern; dialect gaps like brace literals land on our side
/// only) against the `regex` crate.
pub fn check(pattern: &str, haystack: &[u8]) {
    let engines = match compile_engines(pattern) {
        Some(engines) => engines,
        None => {
            // Our front end rejected the pattern. The oracle should agree;
            // anything else means the corpus holds a pattern it shouldn't.
            assert!(
                oracle(pattern).is_none(),
                "engines rejected {pattern:?} but the oracle accepts it"
            );
            return;
        }
    };

    let reference = oracle(pattern);
    let mut context = Context::new();

    // is_match
    let answers: Vec<bool> = engines
        .iter()
        .map(|re| re.is_match(&mut context, haystack))
        .collect();
    for answer in &answers {
        assert_eq!(
            *answer, answers[0],
            "engines disagree on is_match for {pattern:?} / {:?}",
            haystack.escape_ascii().to_string()
        );
    }
    if let Some(reference) = &reference {
        assert_eq!(
            answers[0],
            reference.is_match(haystack),
            "is_match mismatch for {pattern:?} / {:?}",
            haystack.escape_ascii().to_string()
        );
    }

    // find
    let finds: Vec<Option<(usize, usize)>> = engines
        .iter()
        .map(|re| {
            re.find(&mut context, haystack)
                .map(|m| (m.span.from, m.span.to))
        })
        .collect();
    for find in &finds {
        assert_eq!(
            *find, finds[0],
            "engines disagree on find for {pattern:?} / {:?}",
            haystack.escape_ascii().to_string()
        );
    }
    if let Some(reference) = &reference {
        let expected = reference.find(haystack).map(|m| (m.start(), m.end()));
        assert_eq!(
            finds[0], expected,
            "find mismatch for {pattern:?} / {:?}",
            haystack.escape_ascii().to_string()
        );
    }

    // find_iter
    let all: Vec<Vec<(usize, usize)>> = engines
        .iter()
        .map(|re| {
            re.find_iter(&mut context, haystack)
                .map(|m| (m.span.from, m.span.to))
                .collect()
        })
        .collect();
    for one in &all {
        assert_eq!(
            *one, all[0],
            "engines disagree on find_iter for {pattern:?} / {:?}",
            haystack.escape_ascii().to_string()
        );
    }
    if let Some(reference) = &reference {
        let expected: Vec<(usize, usize)> = reference
            .find_iter(haystack)
            .map(|m| (m.start(), m.end()))
            .collect();
        assert_eq!(
            all[0], expected,
            "find_iter mismatch for {pattern:?} / {:?}",
            haystack.escape_ascii().to_string()
        );
    }

    // captures
    let groups: Vec<Option<Vec<Option<(usize, usize)>>>> = engines
        .iter()
        .map(|re| spans_of(re, &mut context, haystack))
        .collect();
    for one in &groups {
        assert_eq!(
            *one, groups[0],
            "engines disagree on captures for {pattern:?} / {:?}",
            haystack.escape_ascii().to_string()
        );
    }
    if let Some(reference) = &reference {
        let expected = reference.captures(haystack).map(|caps| {
            (0..caps.len())
                .map(|i| caps.get(i).map(|m| (m.start(), m.end())))
                .collect::<Vec<_>>()
        });
        assert_eq!(
            groups[0], expected,
            "captures mismatch for {pattern:?} / {:?}",
            haystack.escape_ascii().to_string()
        );
    }

    // captures_iter
    if let Some(reference) = &reference {
        let expected: Vec<Vec<Option<(usize, usize)>>> = reference
            .captures_iter(haystack)
            .map(|caps| {
                (0..caps.len())
                    .map(|i| caps.get(i).map(|m| (m.start(), m.end())))
                    .collect()
            })
            .collect();
        for re in &engines {
            let ours: Vec<Vec<Option<(usize, usize)>>> = re
                .captures_iter(&mut context, haystack)
                .map(|caps| {
                    (0..caps.group_len())
                        .map(|i| caps.get(i).map(|m| (m.span.from, m.span.to)))
                        .collect()
                })
                .collect();
            assert_eq!(
                ours, expected,
                "captures_iter mismatch for {pattern:?} / {:?}",
                haystack.escape_ascii().to_string()
            );
        }
    }
}
