//! The portable executor: an interpreter for [`crate::thompson::bytecode`].
//!
//! This is a so-called PikeVM. It simulates the NFA over all alternatives
//! in lockstep, one input position at a time. Live threads form a singly
//! linked list in the context arena, ordered by priority (head first); a
//! thread is a next-handle, a parked instruction pointer and one slot per
//! group bound. The first thread to reach the end of the program wins, and
//! everything behind it in the list is discarded, which yields the same
//! leftmost-first answers as a backtracking engine in O(input · program)
//! time.

use crate::regex::{Context, RegexImpl};
use crate::syntax::classes::{BCC_WORD, BUILTIN_CLASSES, ByteClass};
use crate::syntax::{self, Error};
use crate::thompson::arena::{Arena, Handle, NULL_HANDLE};
use crate::thompson::bytecode::{
    OP_ANCHOR_BOF, OP_ANCHOR_BOL, OP_ANCHOR_EOF, OP_ANCHOR_EOL, OP_ANCHOR_NOT_WORD_BOUNDARY,
    OP_ANCHOR_WORD_BOUNDARY, OP_BUILTIN_CHAR_CLASS, OP_CHAR_CLASS, OP_CHARACTER, OP_JUMP,
    OP_SPLIT_BACKWARDS_EAGER, OP_SPLIT_BACKWARDS_PASSIVE, OP_SPLIT_EAGER, OP_SPLIT_PASSIVE,
    OP_TEST_AND_SET_FLAG, OP_WRITE_POINTER, Program, read_operand, unpack_opcode,
    unpack_operand_size,
};
use crate::util::Span;

/// The interpreted engine.
pub struct PikeVm {
    program: Program,
}

impl PikeVm {
    pub fn new(pattern: &[u8]) -> Result<Self, Error> {
        let parsed = syntax::parse(pattern)?;
        Ok(Self::from_program(Program::compile(parsed)))
    }

    pub fn from_program(program: Program) -> Self {
        Self { program }
    }

    /// Run the program over `haystack[start..]` with `slot_count` thread
    /// slots (0, 2, or 2 per group) and copy the winning thread's bounds
    /// into `spans`. Returns whether anything matched.
    fn exec(
        &self,
        context: &mut Context,
        haystack: &[u8],
        start: usize,
        slot_count: usize,
        spans: &mut [Span],
    ) -> bool {
        debug_assert!(slot_count <= 2 * self.program.group_count);

        if start > haystack.len() {
            return false;
        }

        let arena = &mut context.arena;
        arena.reset();

        // The flag bitmap is the very first allocation so it sits at
        // handle 0.
        let flag_words = self.program.flag_count.div_ceil(64);
        let flags = arena.alloc(flag_words);
        debug_assert_eq!(flags, 0);

        let mut executor = Executor {
            code: &self.program.code,
            classes: &self.program.classes,
            slot_count,
            thread_size: 2 + slot_count,
            flag_words,
            arena,
            head: NULL_HANDLE,
            matched: NULL_HANDLE,
        };

        let mut pos = start;
        loop {
            let character = haystack.get(pos).copied();
            let prev_character = if pos == 0 {
                None
            } else {
                Some(haystack[pos - 1])
            };

            match executor.step_all(pos, character, prev_character) {
                ExecStatus::Done => break,
                ExecStatus::Continue => {}
            }

            if pos == haystack.len() {
                break;
            }
            pos += 1;
        }

        if executor.matched == NULL_HANDLE {
            return false;
        }

        let arena = &*executor.arena;
        let matched = executor.matched;
        for (i, span) in spans.iter_mut().enumerate().take(slot_count / 2) {
            let from = arena.get(matched, 2 + 2 * i);
            let to = arena.get(matched, 2 + 2 * i + 1);
            *span = if from == u64::MAX || to == u64::MAX {
                Span::invalid()
            } else {
                Span {
                    from: from as usize,
                    to: to as usize,
                }
            };
        }

        true
    }
}

impl RegexImpl for PikeVm {
    fn group_count(&self) -> usize {
        self.program.group_count
    }

    fn is_match(&self, context: &mut Context, haystack: &[u8], start: usize) -> bool {
        self.exec(context, haystack, start, 0, &mut [])
    }

    fn find_captures(
        &self,
        context: &mut Context,
        haystack: &[u8],
        start: usize,
        spans: &mut [Span],
    ) -> bool {
        let slot_count = 2 * usize::min(spans.len(), self.program.group_count);
        self.exec(context, haystack, start, slot_count, spans)
    }
}

enum ExecStatus {
    Continue,
    Done,
}

enum ThreadStatus {
    /// Keep executing instructions in the same thread.
    Continue,
    /// The thread consumed the current character; park it for the next
    /// position.
    Parked,
    /// Character mismatch, failed anchor, or an already-set flag.
    Rejected,
    /// The instruction pointer reached the end of the program.
    Matched,
}

// Thread block layout, in words from the thread handle
const T_NEXT: usize = 0;
const T_INSTR_POINTER: usize = 1;
const T_SLOTS: usize = 2;

struct Executor<'a> {
    code: &'a [u8],
    classes: &'a [ByteClass],
    slot_count: usize,
    thread_size: usize,
    flag_words: usize,
    arena: &'a mut Arena,
    head: Handle,
    matched: Handle,
}

impl<'a> Executor<'a> {
    /// Advance every live thread by one input position, in priority order.
    fn step_all(
        &mut self,
        pos: usize,
        character: Option<u8>,
        prev_character: Option<u8>,
    ) -> ExecStatus {
        self.arena.fill(0, self.flag_words, 0);

        // Once a match is recorded no new start positions are tried, so a
        // drained list means nothing can outrank the match anymore.
        if self.head == NULL_HANDLE && self.matched != NULL_HANDLE {
            return ExecStatus::Done;
        }

        let mut spawned = false;
        let mut thread = self.head;
        let mut prev_thread = NULL_HANDLE;

        loop {
            if thread == NULL_HANDLE {
                // Trying a fresh start at every position is what makes the
                // search unanchored; once a match is recorded, later start
                // positions can only lose.
                if spawned || self.matched != NULL_HANDLE {
                    break;
                }
                thread = self.spawn(prev_thread);
                spawned = true;
            }

            let mut instr_pointer = self.arena.get(thread, T_INSTR_POINTER) as usize;

            let status = loop {
                debug_assert!(instr_pointer <= self.code.len());

                if instr_pointer == self.code.len() {
                    break ThreadStatus::Matched;
                }

                match self.step_thread(thread, &mut instr_pointer, pos, character, prev_character)
                {
                    ThreadStatus::Continue => {}
                    status => break status,
                }
            };

            match status {
                ThreadStatus::Rejected => {
                    thread = self.destroy(thread, prev_thread);
                }

                ThreadStatus::Matched => {
                    // Short-circuit for boolean searches
                    if self.slot_count == 0 {
                        self.matched = thread;
                        return ExecStatus::Done;
                    }

                    if self.matched != NULL_HANDLE {
                        self.arena.free(self.matched);
                    }
                    self.matched = thread;

                    // Any match reached through a successor of this thread
                    // would be of lower priority
                    let mut tail = self.arena.get_handle(thread, T_NEXT);
                    while tail != NULL_HANDLE {
                        tail = self.destroy(tail, thread);
                    }

                    // Unlink the matched thread but keep its block alive;
                    // its slots are read once the search settles
                    thread = self.remove(thread, prev_thread);
                }

                ThreadStatus::Parked => {
                    self.arena.set(thread, T_INSTR_POINTER, instr_pointer as u64);
                    prev_thread = thread;
                    thread = self.arena.get_handle(thread, T_NEXT);
                }

                ThreadStatus::Continue => unreachable!(),
            }
        }

        ExecStatus::Continue
    }

    fn step_thread(
        &mut self,
        thread: Handle,
        instr_pointer: &mut usize,
        pos: usize,
        character: Option<u8>,
        prev_character: Option<u8>,
    ) -> ThreadStatus {
        let byte = self.code[*instr_pointer];
        *instr_pointer += 1;

        let opcode = unpack_opcode(byte);
        let operand_size = unpack_operand_size(byte);
        let operand = read_operand(&self.code[*instr_pointer..], operand_size);
        *instr_pointer += operand_size;

        match opcode {
            OP_CHARACTER => {
                if character == Some(operand as u8) {
                    ThreadStatus::Parked
                } else {
                    ThreadStatus::Rejected
                }
            }

            OP_CHAR_CLASS => match character {
                Some(c) if self.classes[operand].test(c) => ThreadStatus::Parked,
                _ => ThreadStatus::Rejected,
            },

            OP_BUILTIN_CHAR_CLASS => match character {
                Some(c) if BUILTIN_CLASSES[operand].test(c) => ThreadStatus::Parked,
                _ => ThreadStatus::Rejected,
            },

            OP_ANCHOR_BOF => {
                if prev_character.is_none() {
                    ThreadStatus::Continue
                } else {
                    ThreadStatus::Rejected
                }
            }

            OP_ANCHOR_BOL => {
                if prev_character.is_none() || prev_character == Some(b'\n') {
                    ThreadStatus::Continue
                } else {
                    ThreadStatus::Rejected
                }
            }

            OP_ANCHOR_EOF => {
                if character.is_none() {
                    ThreadStatus::Continue
                } else {
                    ThreadStatus::Rejected
                }
            }

            OP_ANCHOR_EOL => {
                if character.is_none() || character == Some(b'\n') {
                    ThreadStatus::Continue
                } else {
                    ThreadStatus::Rejected
                }
            }

            OP_ANCHOR_WORD_BOUNDARY | OP_ANCHOR_NOT_WORD_BOUNDARY => {
                let word = &BUILTIN_CLASSES[BCC_WORD];
                let prev_is_word = prev_character.is_some_and(|b| word.test(b));
                let char_is_word = character.is_some_and(|b| word.test(b));

                let on_boundary = prev_is_word != char_is_word;
                let want_boundary = opcode == OP_ANCHOR_WORD_BOUNDARY;

                if on_boundary == want_boundary {
                    ThreadStatus::Continue
                } else {
                    ThreadStatus::Rejected
                }
            }

            OP_JUMP => {
                *instr_pointer += operand;
                debug_assert!(*instr_pointer <= self.code.len());
                ThreadStatus::Continue
            }

            OP_SPLIT_PASSIVE | OP_SPLIT_EAGER | OP_SPLIT_BACKWARDS_PASSIVE
            | OP_SPLIT_BACKWARDS_EAGER => {
                // The passive side is enqueued just after the current
                // thread; the active side keeps running in it.
                let split_pointer = match opcode {
                    OP_SPLIT_PASSIVE => *instr_pointer + operand,
                    OP_SPLIT_BACKWARDS_PASSIVE => *instr_pointer - operand,
                    OP_SPLIT_EAGER => {
                        let passive = *instr_pointer;
                        *instr_pointer += operand;
                        passive
                    }
                    _ => {
                        let passive = *instr_pointer;
                        *instr_pointer -= operand;
                        passive
                    }
                };

                debug_assert!(*instr_pointer <= self.code.len());
                debug_assert!(split_pointer <= self.code.len());

                self.split(thread, split_pointer);
                ThreadStatus::Continue
            }

            OP_WRITE_POINTER => {
                if operand < self.slot_count {
                    self.arena.set(thread, T_SLOTS + operand, pos as u64);
                }
                ThreadStatus::Continue
            }

            OP_TEST_AND_SET_FLAG => {
                let word = operand >> 6;
                let bit = 1u64 << (operand & 63);

                let flags = self.arena.get(0, word);
                if flags & bit != 0 {
                    ThreadStatus::Rejected
                } else {
                    self.arena.set(0, word, flags | bit);
                    ThreadStatus::Continue
                }
            }

            _ => unreachable!("corrupt opcode {opcode}"),
        }
    }

    /// Append a fresh thread (instruction pointer 0, no bounds) at the
    /// tail of the list.
    fn spawn(&mut self, prev_thread: Handle) -> Handle {
        let thread = self.arena.alloc(self.thread_size);

        self.arena.set_handle(thread, T_NEXT, NULL_HANDLE);
        self.arena.set(thread, T_INSTR_POINTER, 0);
        self.arena.fill(thread + T_SLOTS, self.slot_count, u64::MAX);

        if prev_thread == NULL_HANDLE {
            self.head = thread;
        } else {
            self.arena.set_handle(prev_thread, T_NEXT, thread);
        }

        thread
    }

    /// Clone the current thread, pointing the copy at `instr_pointer`, and
    /// insert it immediately after the original.
    fn split(&mut self, thread: Handle, instr_pointer: usize) {
        let copy = self.arena.alloc(self.thread_size);

        let next = self.arena.get(thread, T_NEXT);
        self.arena.set(copy, T_NEXT, next);
        self.arena.set(copy, T_INSTR_POINTER, instr_pointer as u64);
        self.arena
            .copy_within(thread + T_SLOTS, copy + T_SLOTS, self.slot_count);

        self.arena.set_handle(thread, T_NEXT, copy);
    }

    fn remove(&mut self, thread: Handle, prev_thread: Handle) -> Handle {
        let next = self.arena.get_handle(thread, T_NEXT);

        if prev_thread == NULL_HANDLE {
            self.head = next;
        } else {
            self.arena.set_handle(prev_thread, T_NEXT, next);
        }

        next
    }

    fn destroy(&mut self, thread: Handle, prev_thread: Handle) -> Handle {
        let next = self.remove(thread, prev_thread);
        self.arena.free(thread);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regex::Context;

    fn vm(pattern: &[u8]) -> PikeVm {
        PikeVm::new(pattern).unwrap()
    }

    fn find(pattern: &[u8], haystack: &[u8]) -> Option<(usize, usize)> {
        let vm = vm(pattern);
        let mut context = Context::new();
        let mut spans = [Span::invalid()];
        vm.find_captures(&mut context, haystack, 0, &mut spans)
            .then(|| (spans[0].from, spans[0].to))
    }

    fn captures(pattern: &[u8], haystack: &[u8]) -> Option<Vec<Option<(usize, usize)>>> {
        let vm = vm(pattern);
        let mut context = Context::new();
        let mut spans = vec![Span::invalid(); vm.group_count()];
        vm.find_captures(&mut context, haystack, 0, &mut spans)
            .then(|| {
                spans
                    .iter()
                    .map(|s| s.valid().then(|| (s.from, s.to)))
                    .collect()
            })
    }

    #[test]
    fn literal_find() {
        assert_eq!(find(b"bc", b"abcd"), Some((1, 3)));
        assert_eq!(find(b"bc", b"acbd"), None);
    }

    #[test]
    fn leftmost_wins() {
        assert_eq!(find(b"a+", b"xxaaayaa"), Some((2, 5)));
        // even when a later match would be longer
        assert_eq!(find(b"ab|cdef", b"abcdef"), Some((0, 2)));
    }

    #[test]
    fn greedy_vs_lazy() {
        assert_eq!(find(b"a*", b"aaa"), Some((0, 3)));
        assert_eq!(find(b"a*?", b"aaa"), Some((0, 0)));
        assert_eq!(find(b"a{1,3}?", b"aaa"), Some((0, 1)));
        assert_eq!(find(b"a{13,37}?", b"aaaaaaaaaaaaa"), Some((0, 13)));
    }

    #[test]
    fn first_branch_preferred() {
        assert_eq!(find(b"a+|b*|c?\\x41\\xAA", b"aaab"), Some((0, 3)));
    }

    #[test]
    fn empty_pattern_matches_empty() {
        assert_eq!(find(b"", b""), Some((0, 0)));
        assert_eq!(find(b"", b"xyz"), Some((0, 0)));
        assert_eq!(find(b"b*", b"xyz"), Some((0, 0)));
    }

    #[test]
    fn anchors() {
        assert_eq!(find(b"^b", b"a\nb"), Some((2, 3)));
        assert_eq!(find(b"a$", b"a\nxa"), Some((0, 1)));
        assert_eq!(find(b"\\Ab", b"a\nb"), None);
        assert_eq!(find(b"a\\z", b"a\nxa"), Some((3, 4)));
        assert_eq!(find(b"\\bcat\\b", b"concat cat"), Some((7, 10)));
        assert_eq!(find(b"\\Bcat", b"concat cat"), Some((3, 6)));
    }

    #[test]
    fn eof_only_match() {
        // the extra executor step at end-of-input is what lets this match
        assert_eq!(find(b"a\\z", b"a"), Some((0, 1)));
        assert_eq!(find(b"\\z", b""), Some((0, 0)));
    }

    #[test]
    fn group_extraction() {
        assert_eq!(
            captures(b"(a+)(b+)", b"xaabbb").unwrap(),
            vec![Some((1, 6)), Some((1, 3)), Some((3, 6))]
        );
    }

    #[test]
    fn unmatched_groups_are_invalid() {
        assert_eq!(
            captures(b"(a)|(b)", b"b").unwrap(),
            vec![Some((0, 1)), None, Some((0, 1))]
        );
        assert_eq!(captures(b"(a)(b)?", b"a").unwrap(), vec![
            Some((0, 1)),
            Some((0, 1)),
            None
        ]);
    }

    #[test]
    fn no_match_leaves_spans_invalid() {
        let vm = vm(b"(a)(b)");
        let mut context = Context::new();
        let mut spans = vec![Span::invalid(); vm.group_count()];
        assert!(!vm.find_captures(&mut context, b"zzz", 0, &mut spans));
        assert!(spans.iter().all(|s| !s.valid()));
    }

    #[test]
    fn group_nesting_invariant() {
        let caps = captures(b"((a)(b+))c?", b"zabbc").unwrap();
        let group0 = caps[0].unwrap();
        for group in caps.iter().flatten() {
            assert!(group.0 <= group.1);
            assert!(group0.0 <= group.0 && group.1 <= group0.1);
        }
    }

    #[test]
    fn ipv4_scenarios() {
        let pattern =
            br"\A(0|[1-9][0-9]{0,2})\.(0|[1-9][0-9]{0,2})\.(0|[1-9][0-9]{0,2})\.(0|[1-9][0-9]{0,2})\z";

        assert_eq!(
            captures(pattern, b"127.0.0.1").unwrap(),
            vec![
                Some((0, 9)),
                Some((0, 3)),
                Some((4, 5)),
                Some((6, 7)),
                Some((8, 9))
            ]
        );
        assert_eq!(
            captures(pattern, b"999.999.999.999").unwrap()[0],
            Some((0, 15))
        );
        assert_eq!(captures(pattern, b"256..0.1"), None);
    }

    #[test]
    fn float_scenario() {
        let caps = captures(
            br"([1-9][0-9]*)(?:\.([0-9]+))?(?:[eE](-?[1-9][0-9]*))?",
            b"1.3e37",
        )
        .unwrap();
        assert_eq!(caps[1], Some((0, 1)));
        assert_eq!(caps[2], Some((2, 3)));
        assert_eq!(caps[3], Some((4, 6)));
    }

    #[test]
    fn word_scenarios() {
        let caps = captures(br"\b(hello|goodbye) world!\z", b"goodbye world!").unwrap();
        assert_eq!(caps[1], Some((0, 7)));

        // unanchored at the front: the match starts after the prefix
        let caps = captures(br"\b(hello|goodbye) world!\z", b"oh, hello world!").unwrap();
        assert_eq!(caps[0], Some((4, 16)));
    }

    #[test]
    fn flags_keep_repetitions_linear() {
        // Without the flag latches this would blow up exponentially
        let haystack = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        assert_eq!(find(b"(?:a*)*b", haystack), None);
        assert_eq!(find(b"(?:a|a)*c", haystack), None);
    }

    #[test]
    fn context_reuse_is_idempotent() {
        let vm = vm(b"(a+)(b?)");
        let mut context = Context::new();

        let mut run = |context: &mut Context| {
            let mut spans = vec![Span::invalid(); vm.group_count()];
            let matched = vm.find_captures(context, b"xxaab", 0, &mut spans);
            (matched, spans)
        };

        let first = run(&mut context);
        let second = run(&mut context);
        assert_eq!(first, second);

        // a context that has grown on a different input gives the same
        // answer too
        let mut spans = vec![Span::invalid(); vm.group_count()];
        vm.find_captures(&mut context, &[b'a'; 4096], 0, &mut spans);
        let third = run(&mut context);
        assert_eq!(first, third);
    }

    #[test]
    fn find_at_offset() {
        let vm = vm(b"\\ba+");
        let mut context = Context::new();
        let mut spans = [Span::invalid()];

        assert!(vm.find_captures(&mut context, b"aa aa", 0, &mut spans));
        assert_eq!((spans[0].from, spans[0].to), (0, 2));

        // starting inside the first word: not at a boundary anymore
        let mut spans = [Span::invalid()];
        assert!(vm.find_captures(&mut context, b"aa aa", 1, &mut spans));
        assert_eq!((spans[0].from, spans[0].to), (3, 5));
    }

    #[test]
    fn is_match_short_circuits() {
        let vm = vm(b"a");
        let mut context = Context::new();
        assert!(vm.is_match(&mut context, b"za", 0));
        assert!(!vm.is_match(&mut context, b"zz", 0));
    }
}
