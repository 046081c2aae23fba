mod utils;

use bregex::{Context, Regex};
use utils::check;

#[test]
fn fixed_corpus() {
    const CASES: &[(&str, &str)] = &[
        (r"\d+", "abc123def"),
        (r"foo", "foobar"),
        (r"bar", "foobar"),
        (r"baz", "foobar"),
        (r"(\w+)-(\d+)", "test-42"),
        (r"(\d+)?", ""),
        (r"[a-z]{3}", "xyz"),
        (r"\d+=\d+", "124221=12323=2=abd"),
        (
            r"Sherlock Holmes|Shrelock Holm|John Watson|Irene Adler|Inspector Lestrade|Professor Moriarty",
            "Professor Moriarty\nSherlock Holmes\nJohn Watson\nIrene Adler\n",
        ),
        (r".*d", "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaad"),
        (r"^$", ""),
        (r"^$", "a\n\nb"),
        (r"^[a-z]+@[a-z]+\.com$", "foo@bar.com foo@baz.com"),
        (r"\s+", "a b\tc\nd"),
        (r"^foo", "foobar\nfoo\nbarfoo"),
        (r"^foo$", "foo\nbar\nfoo\nbaz"),
        (r"bar$", "foobar\nfoo\nbarfoo"),
        (r"colou?r", "color colour colouur"),
        (r"ab{2,4}c", "abc abbc abbbc abbbbc abbbbbc"),
        (r"ab{2,4}?c", "abc abbc abbbc abbbbc abbbbbc"),
        (r"(?:abc)+", "abcabcabcx"),
        (r"[A-Z]{2,}", "abc DEF GHI jkl"),
        (r"[^0-9]+", "abc123!@#"),
        (r".*[^A-Z]|[A-Z]", "AAAAAAAAAAAAAAAAAAAA"),
        (r".*[^A-Z]|[A-Z]", "AAAAB"),
        (r".*[^A-Z]|[A-Z]", "AABAB"),
        (r"a*", "aaa"),
        (r"a*?", "aaa"),
        (r"(a|b)*c", "abbaabc"),
        (r"(a+)(a+)", "aaaa"),
        (r"\b\w+\b", "one two,three"),
        (r"\B\d", "a1 23"),
        (r"[[:alpha:]]+[[:digit:]]+", "abc123"),
        (r"[\d\s]+", "a1 2\t3b"),
        (r"\x41{2}", "zAAAz"),
        (r"(|a)b", "ab"),
        (r"(a)(b)(c)?", "xabx"),
        (r"((a)(b+))c?", "zabbc"),
        (r"\A[ab]+\z", "abba"),
        (r"\A[ab]+\z", "abca"),
        (r"x{0,2}y", "xxxy"),
        (r"", "abc"),
        // brace-fallback cases: a malformed repetition is a literal '{'
        (r"a{", "a{b"),
        (r"a{1,2", "a{1,2"),
    ];

    for (pattern, input) in CASES {
        check(pattern, input.as_bytes());
    }
}

#[test]
fn specified_scenarios() {
    // the worked end-to-end examples this engine is expected to answer
    check(r"a+|b*|c?\x41\xAA", b"aaab");

    let ipv4 =
        r"\A(0|[1-9][0-9]{0,2})\.(0|[1-9][0-9]{0,2})\.(0|[1-9][0-9]{0,2})\.(0|[1-9][0-9]{0,2})\z";
    check(ipv4, b"127.0.0.1");
    check(ipv4, b"999.999.999.999");
    check(ipv4, b"256..0.1");

    check(r"a{13,37}?", b"aaaaaaaaaaaaa");
    check(
        r"([1-9][0-9]*)(?:\.([0-9]+))?(?:[eE](-?[1-9][0-9]*))?",
        b"1.3e37",
    );
    check(r"\b(hello|goodbye) world!\z", b"goodbye world!");
    check(r"\b(hello|goodbye) world!\z", b"oh, hello world!");
}

#[test]
fn non_utf8_haystacks() {
    check(r"\xAA+", b"\x01\xaa\xaa\x02");
    check(r"[\x80-\xff]+", b"ascii\x80\x81\xfe binary");
    check(r".+", b"\xff\xfe\n\xfd");
}

#[test]
fn compile_failures_are_shared() {
    for pattern in [
        r"(a", r"a)", r"a{2,1}", r"[abc", r"\q", r"\x4", r"[a-\d]", r"[[:wibble:]]",
    ] {
        check(pattern, b"anything");
    }
}

#[test]
fn long_inputs_stay_linear() {
    // quadratic or exponential executors time out here long before the
    // assertions matter
    let haystack = "a".repeat(10_000);
    check(r"(?:a*)*b", haystack.as_bytes());
    check(r"(?:a|a)+c", haystack.as_bytes());
    check(r"a*a*a*a*b", haystack.as_bytes());
}

#[test]
fn context_reuse_across_patterns() {
    let mut context = Context::new();
    let first = Regex::new(r"(\w+)@(\w+)").unwrap();
    let second = Regex::new(r"\d{4}").unwrap();

    for _ in 0..3 {
        let caps = first.captures(&mut context, b"mail me@here now").unwrap();
        assert_eq!(caps.get(1).unwrap().as_bytes(), b"me");
        assert_eq!(caps.get(2).unwrap().as_bytes(), b"here");

        let m = second.find(&mut context, b"year 2038 bug").unwrap();
        assert_eq!(m.as_bytes(), b"2038");
    }
}
