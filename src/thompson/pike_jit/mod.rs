//! The JIT-compiled engine.
//!
//! The whole executor is lowered to x86-64 machine code at compile time:
//! the outer loop over input positions, the inner loop over the priority
//! list of threads, and one fragment of code per bytecode instruction.
//! A parked thread stores the machine-code address of its next fragment,
//! so resuming a thread is a single indirect jump.
//!
//! Register assignment (sysv64, chosen so the allocation helper can call
//! back into Rust without spilling the executor core):
//!
//! | reg | holds |
//! |-----|-------|
//! | rax | scratch / resume address handed to `keep` |
//! | rcx | second scratch |
//! | rdx | input cursor |
//! | rbx | builtin class table base |
//! | rsp+0..56 | initial-pushed flag, head, matched, eof, cell, result |
//! | rbp | current thread handle |
//! | rsi | predecessor thread handle |
//! | rdi | previous character (-1 at start of input) |
//! | r8  | slot count for this call (0, 2 or 2·groups) |
//! | r9  | ad-hoc class table base |
//! | r10 | freelist head handle |
//! | r11 | first 64 flag bits |
//! | r12 | arena capacity in bytes |
//! | r13 | arena bump watermark |
//! | r14 | current character (-1 at end of input) |
//! | r15 | arena buffer base |
//!
//! Thread blocks live in the caller's context arena and are addressed by
//! byte-offset handles, so the buffer may be reallocated by the grow
//! callback mid-match; only r15/r12 need reloading afterwards.

use std::error::Error as StdError;
use std::collections::HashMap;
use std::{fmt, mem};

use dynasmrt::{AssemblyOffset, ExecutableBuffer, mmap::MutableBuffer};

use crate::regex::{Context, RegexImpl};
use crate::syntax;
use crate::syntax::classes::{BCC_WORD, BUILTIN_CLASSES};
use crate::thompson::arena::Arena;
use crate::thompson::bytecode::{Instruction, Program};
use crate::util::Span;

pub mod asm;

use asm::{Assembler, Cc, Label, Mem, Reg, Scale};

const R_SCRATCH: Reg = Reg::Rax;
const R_SCRATCH_2: Reg = Reg::Rcx;
const R_STR: Reg = Reg::Rdx;
const R_BUILTINS: Reg = Reg::Rbx;
const R_STATE: Reg = Reg::Rbp;
const R_PREDECESSOR: Reg = Reg::Rsi;
const R_PREV_CHARACTER: Reg = Reg::Rdi;
const R_N_SLOTS: Reg = Reg::R8;
const R_CLASSES: Reg = Reg::R9;
const R_FREELIST: Reg = Reg::R10;
const R_FLAGS: Reg = Reg::R11;
const R_CAPACITY: Reg = Reg::R12;
const R_BUMP: Reg = Reg::R13;
const R_CHARACTER: Reg = Reg::R14;
const R_BUFFER: Reg = Reg::R15;

// Stack frame, relative to rsp after the prologue
const M_INITIAL_STATE_PUSHED: i32 = 0;
const M_HEAD: i32 = 8;
const M_MATCHED_STATE: i32 = 16;
const M_EOF: i32 = 24;
const M_CELL: i32 = 32;
const M_RESULT: i32 = 40;
const FRAME_SIZE: i8 = 56;

// Thread block layout, in bytes from the handle
const T_NEXT: i32 = 0;
const T_INSTR_POINTER: i32 = 8;
const T_SLOTS: i32 = 16;

/// The part of the executor state shared with the generated code. The
/// grow callback rewrites `buffer` and `capacity` in place; the emitted
/// allocation helper reloads both after every call.
#[repr(C)]
struct ExecCell {
    buffer: *mut u8,
    capacity: usize,
    arena: *mut Arena,
}

unsafe extern "sysv64" fn grow_cell(cell: *mut ExecCell, required: usize) {
    unsafe {
        let cell = &mut *cell;
        let arena = &mut *cell.arena;
        arena.grow_bytes(required);
        cell.buffer = arena.as_mut_ptr() as *mut u8;
        cell.capacity = arena.capacity_bytes();
    }
}

type Entry = unsafe extern "sysv64" fn(
    *mut u64,        // result slot buffer
    *mut ExecCell,   // arena cell
    *const u8,       // input cursor start
    *const u8,       // input end
    u64,             // slot count
    *const u8,       // ad-hoc class table
    i64,             // character before the start position, or -1
) -> u64;

/// Native compilation failure. Matching semantics are unaffected: the
/// caller falls back to the interpreter.
#[derive(Debug)]
pub enum CompileError {
    /// The generated program would exceed a 32-bit branch displacement.
    CodeTooLarge,
    /// The operating system refused an executable mapping.
    ExecutableMemory,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::CodeTooLarge => write!(f, "Compiled pattern exceeds code size limits"),
            CompileError::ExecutableMemory => {
                write!(f, "Failed to allocate executable memory")
            }
        }
    }
}

impl StdError for CompileError {}

/// The jitted engine.
pub struct PikeJit {
    program: Program,
    code: ExecutableBuffer,
    entry: AssemblyOffset,
}

impl PikeJit {
    pub fn new(pattern: &[u8]) -> Result<Self, Box<dyn StdError + Send + Sync + 'static>> {
        let parsed = syntax::parse(pattern)?;
        Ok(Self::from_program(Program::compile(parsed))?)
    }

    pub fn from_program(program: Program) -> Result<Self, CompileError> {
        let final_code = Lowerer::lower(&program).map_err(|_| CompileError::CodeTooLarge)?;

        let mut buffer = MutableBuffer::new(final_code.len())
            .map_err(|_| CompileError::ExecutableMemory)?;
        buffer.set_len(final_code.len());
        buffer[..].copy_from_slice(&final_code);
        let code = buffer
            .make_exec()
            .map_err(|_| CompileError::ExecutableMemory)?;

        Ok(Self {
            program,
            code,
            entry: AssemblyOffset(0),
        })
    }

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

        let arena: *mut Arena = &mut context.arena;
        let mut cell = unsafe {
            (*arena).reset();
            ExecCell {
                buffer: (*arena).as_mut_ptr() as *mut u8,
                capacity: (*arena).capacity_bytes(),
                arena,
            }
        };

        // The generated code records haystack pointers; offsets are
        // recovered below. Slot 0 doubles as the matched flag per pair.
        let mut slots = vec![0u64; slot_count];

        let prev_character: i64 = if start == 0 {
            -1
        } else {
            haystack[start - 1] as i64
        };

        let base = haystack.as_ptr();
        let entry: Entry = unsafe { mem::transmute(self.code.ptr(self.entry)) };

        let matched = unsafe {
            entry(
                slots.as_mut_ptr(),
                &mut cell,
                base.add(start),
                base.add(haystack.len()),
                slot_count as u64,
                self.program.classes.as_ptr() as *const u8,
                prev_character,
            )
        };

        if matched == 0 {
            return false;
        }

        for (i, span) in spans.iter_mut().enumerate().take(slot_count / 2) {
            let from = slots[2 * i];
            let to = slots[2 * i + 1];
            *span = if from == 0 || to == 0 {
                Span::invalid()
            } else {
                Span {
                    from: from as usize - base as usize,
                    to: to as usize - base as usize,
                }
            };
        }

        true
    }
}

impl RegexImpl for PikeJit {
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

/// Labels shared by every part of the generated executor.
struct SharedLabels {
    /// Unlink the current thread, chain it onto the freelist, continue.
    destroy_state: Label,
    /// Unlink the current thread without freeing it; rax holds its
    /// successor.
    remove_state: Label,
    /// Park the current thread; rax holds its resume address.
    keep_state: Label,
    epilogue: Label,
    /// Allocate a thread block; handle returned in rax.
    alloc_state_block: Label,
    /// Allocate rax bytes; handle returned in rax.
    alloc_memory: Label,
    /// Duplicate the current thread after itself; rax = new block,
    /// rcx = its resume address.
    push_state_copy: Label,
    string_loop_head: Label,
    post_string_loop: Label,
    state_loop_head: Label,
    have_state: Label,
    post_state_loop: Label,
}

struct Lowerer<'p> {
    asm: Assembler,
    program: &'p Program,
    labels: SharedLabels,
    instr_labels: HashMap<usize, Label>,
}

impl<'p> Lowerer<'p> {
    fn lower(program: &'p Program) -> Result<Vec<u8>, asm::DisplacementOverflow> {
        let mut asm = Assembler::new();
        let labels = SharedLabels {
            destroy_state: asm.new_label(),
            remove_state: asm.new_label(),
            keep_state: asm.new_label(),
            epilogue: asm.new_label(),
            alloc_state_block: asm.new_label(),
            alloc_memory: asm.new_label(),
            push_state_copy: asm.new_label(),
            string_loop_head: asm.new_label(),
            post_string_loop: asm.new_label(),
            state_loop_head: asm.new_label(),
            have_state: asm.new_label(),
            post_state_loop: asm.new_label(),
        };

        let mut lowerer = Lowerer {
            asm,
            program,
            labels,
            instr_labels: HashMap::new(),
        };

        lowerer.emit_prologue();
        lowerer.emit_string_loop();
        lowerer.emit_result_coda();
        lowerer.emit_epilogue();
        lowerer.emit_allocator();
        lowerer.emit_push_state_copy();

        for (position, next, instruction) in program.instructions() {
            lowerer.emit_instruction(position, next, instruction);
        }
        lowerer.emit_match(program.code.len());

        Ok(lowerer.asm.finalize()?.code)
    }

    fn instr_label(&mut self, position: usize) -> Label {
        if let Some(label) = self.instr_labels.get(&position) {
            return *label;
        }
        let label = self.asm.new_label();
        self.instr_labels.insert(position, label);
        label
    }

    /// How many qwords of flag bits overflow into arena memory.
    fn flag_memory_words(&self) -> usize {
        self.program.flag_count.saturating_sub(64).div_ceil(64)
    }

    fn deref_handle(reg: Reg, disp: i32) -> Mem {
        Mem::base_index(R_BUFFER, reg).displaced(disp)
    }

    fn frame(disp: i32) -> Mem {
        Mem::base_disp(Reg::Rsp, disp)
    }

    fn emit_prologue(&mut self) {
        let asm = &mut self.asm;

        for reg in [Reg::Rbx, Reg::Rbp, Reg::R12, Reg::R13, Reg::R14, Reg::R15] {
            asm.push_reg(reg);
        }

        // Seventh argument: the character preceding the start position.
        // It seeds r14, which the first loop iteration rotates into rdi.
        asm.mov_rm(R_CHARACTER, Mem::base_disp(Reg::Rsp, 56));

        asm.sub_ri8(Reg::Rsp, FRAME_SIZE);
        asm.mov_mr(Self::frame(M_RESULT), Reg::Rdi);
        asm.mov_mr(Self::frame(M_CELL), Reg::Rsi);
        asm.mov_mr(Self::frame(M_EOF), Reg::Rcx);
        asm.mov_mi(Self::frame(M_MATCHED_STATE), -1);
        asm.mov_mi(Self::frame(M_HEAD), -1);

        asm.mov_rm(R_BUFFER, Mem::base(Reg::Rsi));
        asm.mov_rm(R_CAPACITY, Mem::base_disp(Reg::Rsi, 8));

        asm.mov_ri64(R_BUILTINS, BUILTIN_CLASSES.as_ptr() as u64);

        asm.xor_rr32(R_BUMP, R_BUMP);
        asm.mov_ri(R_FREELIST, -1);

        // Flags beyond the first 64 live at the bottom of the arena;
        // allocating them first pins them at handle 0
        let flag_memory_words = self.flag_memory_words();
        if flag_memory_words > 0 {
            self.asm
                .mov_r32_i(R_SCRATCH, (flag_memory_words * 8) as u32);
            let alloc_memory = self.labels.alloc_memory;
            self.asm.call_label(alloc_memory);
        }
    }

    fn emit_string_loop(&mut self) {
        let SharedLabels {
            string_loop_head,
            post_string_loop,
            ..
        } = self.labels;

        self.asm.define_label(string_loop_head);

        // Rotate the current character into the previous one, then fetch
        // (or synthesize -1 at end of input)
        self.asm.mov_rr32(R_PREV_CHARACTER, R_CHARACTER);
        self.asm.mov_r32_i(R_CHARACTER, u32::MAX);
        self.asm.cmp_rm(R_STR, Self::frame(M_EOF));
        let at_eof = self.asm.jcc_short(Cc::E);
        self.asm.movzx_rm8(R_CHARACTER, Mem::base(R_STR));
        self.asm.bind_short(at_eof);

        self.emit_state_list_loop();

        // Stop before the increment: the EOF position has already run
        self.asm.cmp_rm(R_STR, Self::frame(M_EOF));
        self.asm.jcc_label(Cc::E, post_string_loop);
        self.asm.inc_r(R_STR);
        self.asm.jmp_label(string_loop_head);

        self.asm.define_label(post_string_loop);
    }

    fn emit_state_list_loop(&mut self) {
        let SharedLabels {
            destroy_state,
            remove_state,
            keep_state,
            alloc_state_block,
            post_string_loop,
            state_loop_head,
            have_state,
            post_state_loop,
            ..
        } = self.labels;

        let clear_flags = self.asm.new_label();

        self.asm.mov_rm(R_STATE, Self::frame(M_HEAD));
        self.asm.mov_ri(R_PREDECESSOR, -1);

        // Once the list drains after a match, nothing can outrank the
        // match anymore: leave the string loop early
        self.asm.cmp_ri8(R_STATE, -1);
        self.asm.jcc_label(Cc::Ne, clear_flags);
        self.asm.cmp_mi8(Self::frame(M_MATCHED_STATE), -1);
        self.asm.jcc_label(Cc::Ne, post_string_loop);
        self.asm.define_label(clear_flags);

        if self.program.flag_count > 0 {
            self.asm.xor_rr32(R_FLAGS, R_FLAGS);
        }
        for word in 0..self.flag_memory_words() {
            self.asm
                .mov_mi(Mem::base_disp(R_BUFFER, (word * 8) as i32), 0);
        }

        // The initial state is pushed at most once per position, and not
        // at all once a match is recorded; a recorded match leaves the
        // pushed bit set for the rest of the search
        self.asm.cmp_mi8(Self::frame(M_MATCHED_STATE), -1);
        let match_found = self.asm.jcc_short(Cc::Ne);
        self.asm.mov_m32_i(Self::frame(M_INITIAL_STATE_PUSHED), 0);
        self.asm.bind_short(match_found);

        self.asm.define_label(state_loop_head);
        self.asm.cmp_ri8(R_STATE, -1);
        self.asm.jcc_label(Cc::Ne, have_state);

        // End of the list: push the initial state, unless that already
        // happened at this position
        self.asm.bts_m32_i8(Self::frame(M_INITIAL_STATE_PUSHED), 0);
        self.asm.jcc_label(Cc::C, post_state_loop);

        self.asm.call_label(alloc_state_block);

        // Link the fresh state after the predecessor (or at the head)
        self.asm.cmp_ri8(R_PREDECESSOR, -1);
        let link_prev = self.asm.jcc_short(Cc::Ne);
        self.asm.mov_mr(Self::frame(M_HEAD), R_SCRATCH);
        let linked = self.asm.jmp_short();
        self.asm.bind_short(link_prev);
        self.asm
            .mov_mr(Self::deref_handle(R_PREDECESSOR, T_NEXT), R_SCRATCH);
        self.asm.bind_short(linked);

        self.asm.mov_mi(Self::deref_handle(R_SCRATCH, T_NEXT), -1);
        let first_instr = self.instr_label(0);
        self.asm.lea_label(R_SCRATCH_2, first_instr);
        self.asm
            .mov_mr(Self::deref_handle(R_SCRATCH, T_INSTR_POINTER), R_SCRATCH_2);

        // Clear the slot words
        self.asm.push_reg(R_STR);
        self.asm.lea(R_STR, Self::deref_handle(R_SCRATCH, T_SLOTS));
        self.asm.xor_rr32(R_SCRATCH_2, R_SCRATCH_2);
        let zero_head = self.asm.here();
        self.asm.cmp_rr(R_SCRATCH_2, R_N_SLOTS);
        let zero_done = self.asm.jcc_short(Cc::Ae);
        self.asm
            .mov_mi(Mem::base_index_scale(R_STR, R_SCRATCH_2, Scale::X8), 0);
        self.asm.inc_r(R_SCRATCH_2);
        self.asm.jmp_short_back(zero_head);
        self.asm.bind_short(zero_done);
        self.asm.pop_reg(R_STR);

        self.asm.mov_rr(R_STATE, R_SCRATCH);

        // Resume the state wherever it parked
        self.asm.define_label(have_state);
        self.asm
            .jmp_mem(Self::deref_handle(R_STATE, T_INSTR_POINTER));

        // Fragments come back here when the state dies: chain the block
        // onto the freelist, then fall through into the removal
        self.asm.define_label(destroy_state);
        self.asm.mov_rm(R_SCRATCH, Self::deref_handle(R_STATE, T_NEXT));
        self.asm
            .mov_mr(Self::deref_handle(R_STATE, T_NEXT), R_FREELIST);
        self.asm.mov_rr(R_FREELIST, R_STATE);

        // rax holds the successor of the departing state
        self.asm.define_label(remove_state);
        self.asm.mov_rr(R_STATE, R_SCRATCH);
        self.asm.cmp_ri8(R_PREDECESSOR, -1);
        let unlink_prev = self.asm.jcc_short(Cc::Ne);
        self.asm.mov_mr(Self::frame(M_HEAD), R_STATE);
        let unlinked = self.asm.jmp_short();
        self.asm.bind_short(unlink_prev);
        self.asm
            .mov_mr(Self::deref_handle(R_PREDECESSOR, T_NEXT), R_STATE);
        self.asm.bind_short(unlinked);
        self.asm.jmp_label(state_loop_head);

        // rax holds the resume address of the surviving state
        self.asm.define_label(keep_state);
        self.asm
            .mov_mr(Self::deref_handle(R_STATE, T_INSTR_POINTER), R_SCRATCH);
        self.asm.mov_rr(R_PREDECESSOR, R_STATE);
        self.asm.mov_rm(R_STATE, Self::deref_handle(R_STATE, T_NEXT));
        self.asm.jmp_label(state_loop_head);

        self.asm.define_label(post_state_loop);
    }

    fn emit_result_coda(&mut self) {
        let SharedLabels { epilogue, .. } = self.labels;
        let no_match = self.asm.new_label();

        // A boolean search short-circuits straight to the epilogue on
        // match, so reaching this point with slots requested means the
        // matched state (if any) holds the answer
        self.asm.mov_rm(R_SCRATCH, Self::frame(M_RESULT));
        self.asm.mov_rm(R_STR, Self::frame(M_MATCHED_STATE));
        self.asm.cmp_ri8(R_STR, -1);
        self.asm.jcc_label(Cc::E, no_match);

        self.asm
            .lea(R_PREDECESSOR, Self::deref_handle(R_STR, T_SLOTS));
        self.asm.xor_rr32(R_SCRATCH_2, R_SCRATCH_2);
        let copy_head = self.asm.here();
        self.asm.cmp_rr(R_SCRATCH_2, R_N_SLOTS);
        let copy_done = self.asm.jcc_short(Cc::Ae);
        self.asm.mov_rm(
            R_STR,
            Mem::base_index_scale(R_PREDECESSOR, R_SCRATCH_2, Scale::X8),
        );
        self.asm.mov_mr(
            Mem::base_index_scale(R_SCRATCH, R_SCRATCH_2, Scale::X8),
            R_STR,
        );
        self.asm.inc_r(R_SCRATCH_2);
        self.asm.jmp_short_back(copy_head);
        self.asm.bind_short(copy_done);

        self.asm.mov_r32_i(R_SCRATCH, 1);
        self.asm.jmp_label(epilogue);

        self.asm.define_label(no_match);
        self.asm.xor_rr32(R_SCRATCH, R_SCRATCH);
    }

    fn emit_epilogue(&mut self) {
        let SharedLabels { epilogue, .. } = self.labels;
        self.asm.define_label(epilogue);

        self.asm.add_ri8(Reg::Rsp, FRAME_SIZE);
        for reg in [Reg::R15, Reg::R14, Reg::R13, Reg::R12, Reg::Rbp, Reg::Rbx] {
            self.asm.pop_reg(reg);
        }
        self.asm.ret();
    }

    fn emit_allocator(&mut self) {
        let SharedLabels {
            alloc_state_block,
            alloc_memory,
            ..
        } = self.labels;

        // Thread blocks are next + instruction pointer + one word per slot
        self.asm.define_label(alloc_state_block);
        self.asm.mov_rr(R_SCRATCH, R_N_SLOTS);
        self.asm.add_ri8(R_SCRATCH, 2);
        self.asm.shl_ri8(R_SCRATCH, 3);

        // General entry: byte count in rax
        self.asm.define_label(alloc_memory);

        // Fast path: bump
        self.asm.mov_rr(R_SCRATCH_2, R_BUMP);
        self.asm.add_rr(R_SCRATCH_2, R_SCRATCH);
        self.asm.cmp_rr(R_SCRATCH_2, R_CAPACITY);
        let try_freelist = self.asm.jcc_short(Cc::A);
        self.asm.mov_rr(R_SCRATCH, R_BUMP);
        self.asm.mov_rr(R_BUMP, R_SCRATCH_2);
        self.asm.ret();
        self.asm.bind_short(try_freelist);

        // Freelist next; all freed blocks are thread-sized
        self.asm.cmp_ri8(R_FREELIST, -1);
        let grow = self.asm.jcc_short(Cc::E);
        self.asm.mov_rr(R_SCRATCH, R_FREELIST);
        self.asm
            .mov_rm(R_FREELIST, Self::deref_handle(R_FREELIST, 0));
        self.asm.ret();
        self.asm.bind_short(grow);

        // Slow path: grow the arena through the Rust callback, then
        // reload the (possibly moved) buffer and retry the bump, which
        // cannot fail now. rcx still holds bump + size, the capacity the
        // callback must provide.
        for reg in [
            R_STR,
            R_PREV_CHARACTER,
            R_PREDECESSOR,
            R_N_SLOTS,
            R_CLASSES,
            R_FREELIST,
            R_FLAGS,
        ] {
            self.asm.push_reg(reg);
        }
        self.asm.push_reg(R_SCRATCH);
        self.asm.sub_ri8(Reg::Rsp, 8);

        // Stack here: 8 pad + 64 pushed + 8 return address + frame
        self.asm
            .mov_rm(Reg::Rdi, Mem::base_disp(Reg::Rsp, 8 + 64 + 8 + M_CELL));
        self.asm.mov_rr(Reg::Rsi, R_SCRATCH_2);
        let grow: unsafe extern "sysv64" fn(*mut ExecCell, usize) = grow_cell;
        self.asm.mov_ri64(R_SCRATCH, grow as usize as u64);
        self.asm.call_reg(R_SCRATCH);

        self.asm
            .mov_rm(R_SCRATCH, Mem::base_disp(Reg::Rsp, 8 + 64 + 8 + M_CELL));
        self.asm.mov_rm(R_BUFFER, Mem::base(R_SCRATCH));
        self.asm.mov_rm(R_CAPACITY, Mem::base_disp(R_SCRATCH, 8));

        self.asm.add_ri8(Reg::Rsp, 8);
        self.asm.pop_reg(R_SCRATCH);

        self.asm.mov_rr(R_SCRATCH_2, R_SCRATCH);
        self.asm.mov_rr(R_SCRATCH, R_BUMP);
        self.asm.add_rr(R_BUMP, R_SCRATCH_2);

        for reg in [
            R_FLAGS,
            R_FREELIST,
            R_CLASSES,
            R_N_SLOTS,
            R_PREDECESSOR,
            R_PREV_CHARACTER,
            R_STR,
        ] {
            self.asm.pop_reg(reg);
        }
        self.asm.ret();
    }

    fn emit_push_state_copy(&mut self) {
        let SharedLabels {
            push_state_copy, ..
        } = self.labels;

        // rax: freshly allocated block, rcx: resume address for it.
        // Splices the copy right after the current state, preserving
        // priority order.
        self.asm.define_label(push_state_copy);
        self.asm
            .mov_mr(Self::deref_handle(R_SCRATCH, T_INSTR_POINTER), R_SCRATCH_2);
        self.asm
            .mov_rm(R_SCRATCH_2, Self::deref_handle(R_STATE, T_NEXT));
        self.asm
            .mov_mr(Self::deref_handle(R_SCRATCH, T_NEXT), R_SCRATCH_2);
        self.asm.mov_mr(Self::deref_handle(R_STATE, T_NEXT), R_SCRATCH);

        self.asm.push_reg(R_PREDECESSOR);
        self.asm.push_reg(R_STR);
        self.asm
            .lea(R_PREDECESSOR, Self::deref_handle(R_STATE, T_SLOTS));
        self.asm.lea(R_STR, Self::deref_handle(R_SCRATCH, T_SLOTS));
        self.asm.xor_rr32(R_SCRATCH_2, R_SCRATCH_2);
        let copy_head = self.asm.here();
        self.asm.cmp_rr(R_SCRATCH_2, R_N_SLOTS);
        let copy_done = self.asm.jcc_short(Cc::Ae);
        self.asm.mov_rm(
            R_SCRATCH,
            Mem::base_index_scale(R_PREDECESSOR, R_SCRATCH_2, Scale::X8),
        );
        self.asm.mov_mr(
            Mem::base_index_scale(R_STR, R_SCRATCH_2, Scale::X8),
            R_SCRATCH,
        );
        self.asm.inc_r(R_SCRATCH_2);
        self.asm.jmp_short_back(copy_head);
        self.asm.bind_short(copy_done);
        self.asm.pop_reg(R_STR);
        self.asm.pop_reg(R_PREDECESSOR);
        self.asm.ret();
    }

    /// One fragment per bytecode instruction. Consuming fragments park the
    /// thread via `keep_state`; everything else either falls through to
    /// the next fragment or jumps away explicitly.
    fn emit_instruction(&mut self, position: usize, next: usize, instruction: Instruction) {
        let label = self.instr_label(position);
        self.asm.define_label(label);

        let SharedLabels {
            destroy_state,
            keep_state,
            alloc_state_block,
            push_state_copy,
            ..
        } = self.labels;

        match instruction {
            Instruction::Character(byte) => {
                if byte < 128 {
                    self.asm.cmp_r32_i8(R_CHARACTER, byte as i8);
                } else {
                    self.asm.cmp_r32_i32(R_CHARACTER, byte as i32);
                }
                self.asm.jcc_label(Cc::Ne, destroy_state);
                let resume = self.instr_label(next);
                self.asm.lea_label(R_SCRATCH, resume);
                self.asm.jmp_label(keep_state);
            }

            Instruction::CharClass(index) | Instruction::BuiltinCharClass(index) => {
                let base = if matches!(instruction, Instruction::CharClass(_)) {
                    R_CLASSES
                } else {
                    R_BUILTINS
                };

                // -1 (end of input) is not in any class
                self.asm.cmp_r32_i8(R_CHARACTER, -1);
                self.asm.jcc_label(Cc::E, destroy_state);
                self.asm.bt_m_r32(
                    Mem::base_disp(base, (32 * index) as i32),
                    R_CHARACTER,
                );
                self.asm.jcc_label(Cc::Nc, destroy_state);
                let resume = self.instr_label(next);
                self.asm.lea_label(R_SCRATCH, resume);
                self.asm.jmp_label(keep_state);
            }

            Instruction::AnchorBof => {
                self.asm.cmp_r32_i8(R_PREV_CHARACTER, -1);
                self.asm.jcc_label(Cc::Ne, destroy_state);
            }

            Instruction::AnchorBol => {
                let passed = self.asm.new_label();
                self.asm.cmp_r32_i8(R_PREV_CHARACTER, -1);
                self.asm.jcc_label(Cc::E, passed);
                self.asm.cmp_r32_i8(R_PREV_CHARACTER, b'\n' as i8);
                self.asm.jcc_label(Cc::Ne, destroy_state);
                self.asm.define_label(passed);
            }

            Instruction::AnchorEof => {
                self.asm.cmp_r32_i8(R_CHARACTER, -1);
                self.asm.jcc_label(Cc::Ne, destroy_state);
            }

            Instruction::AnchorEol => {
                let passed = self.asm.new_label();
                self.asm.cmp_r32_i8(R_CHARACTER, -1);
                self.asm.jcc_label(Cc::E, passed);
                self.asm.cmp_r32_i8(R_CHARACTER, b'\n' as i8);
                self.asm.jcc_label(Cc::Ne, destroy_state);
                self.asm.define_label(passed);
            }

            Instruction::AnchorWordBoundary | Instruction::AnchorNotWordBoundary => {
                let word_class = Mem::base_disp(R_BUILTINS, (32 * BCC_WORD) as i32);

                self.asm.xor_rr32(R_SCRATCH, R_SCRATCH);
                self.asm.cmp_r32_i8(R_PREV_CHARACTER, -1);
                let bof = self.asm.jcc_short(Cc::E);
                self.asm.bt_m_r32(word_class, R_PREV_CHARACTER);
                self.asm.setc(R_SCRATCH);
                self.asm.bind_short(bof);

                self.asm.xor_rr32(R_SCRATCH_2, R_SCRATCH_2);
                self.asm.cmp_r32_i8(R_CHARACTER, -1);
                let eof = self.asm.jcc_short(Cc::E);
                self.asm.bt_m_r32(word_class, R_CHARACTER);
                self.asm.setc(R_SCRATCH_2);
                self.asm.bind_short(eof);

                self.asm.xor_rr32(R_SCRATCH, R_SCRATCH_2);
                if matches!(instruction, Instruction::AnchorWordBoundary) {
                    // fail when both sides agree
                    self.asm.jcc_label(Cc::E, destroy_state);
                } else {
                    self.asm.jcc_label(Cc::Ne, destroy_state);
                }
            }

            Instruction::Jump(delta) => {
                let target = self.instr_label(next + delta);
                self.asm.jmp_label(target);
            }

            Instruction::SplitPassive(delta)
            | Instruction::SplitEager(delta)
            | Instruction::SplitBackwardsPassive(delta)
            | Instruction::SplitBackwardsEager(delta) => {
                // The passive side goes into the list just after the
                // current thread; the active side keeps the machine
                let passive = match instruction {
                    Instruction::SplitPassive(_) => next + delta,
                    Instruction::SplitBackwardsPassive(_) => next - delta,
                    _ => next,
                };

                self.asm.call_label(alloc_state_block);
                let passive_label = self.instr_label(passive);
                self.asm.lea_label(R_SCRATCH_2, passive_label);
                self.asm.call_label(push_state_copy);

                match instruction {
                    Instruction::SplitEager(_) => {
                        let active = self.instr_label(next + delta);
                        self.asm.jmp_label(active);
                    }
                    Instruction::SplitBackwardsEager(_) => {
                        let active = self.instr_label(next - delta);
                        self.asm.jmp_label(active);
                    }
                    _ => {} // passive splits fall through
                }
            }

            Instruction::WritePointer(slot) => {
                if slot < 128 {
                    self.asm.cmp_r32_i8(R_N_SLOTS, slot as i8);
                } else {
                    self.asm.cmp_r32_i32(R_N_SLOTS, slot as i32);
                }
                let out_of_range = self.asm.jcc_short(Cc::Be);
                self.asm.mov_mr(
                    Self::deref_handle(R_STATE, T_SLOTS + 8 * slot as i32),
                    R_STR,
                );
                self.asm.bind_short(out_of_range);
            }

            Instruction::TestAndSetFlag(flag) => {
                if flag < 64 {
                    self.asm.bts_r_i8(R_FLAGS, flag as u8);
                } else {
                    let word = (flag - 64) / 32;
                    self.asm.bts_m32_i8(
                        Mem::base_disp(R_BUFFER, (4 * word) as i32),
                        (flag % 32) as u8,
                    );
                }
                self.asm.jcc_label(Cc::C, destroy_state);
            }
        }
    }

    /// Control falls off the end of the program into this block: record
    /// the match and discard everything of lower priority.
    fn emit_match(&mut self, end: usize) {
        let label = self.instr_label(end);
        self.asm.define_label(label);

        let SharedLabels {
            remove_state,
            epilogue,
            ..
        } = self.labels;

        let record = self.asm.new_label();

        // Boolean searches short-circuit on the first match
        self.asm.cmp_r32_i8(R_N_SLOTS, 0);
        self.asm.jcc_label(Cc::Ne, record);
        self.asm.mov_r32_i(R_SCRATCH, 1);
        self.asm.jmp_label(epilogue);

        self.asm.define_label(record);

        // Free the previously matched state, if any
        self.asm.mov_rm(R_SCRATCH, Self::frame(M_MATCHED_STATE));
        self.asm.cmp_ri8(R_SCRATCH, -1);
        let no_previous = self.asm.jcc_short(Cc::E);
        self.asm
            .mov_mr(Self::deref_handle(R_SCRATCH, T_NEXT), R_FREELIST);
        self.asm.mov_rr(R_FREELIST, R_SCRATCH);
        self.asm.bind_short(no_previous);

        self.asm.mov_mr(Self::frame(M_MATCHED_STATE), R_STATE);

        // Everything after this thread in the list is lower priority;
        // free it all
        self.asm.mov_rm(R_SCRATCH, Self::deref_handle(R_STATE, T_NEXT));
        let free_head = self.asm.here();
        self.asm.cmp_ri8(R_SCRATCH, -1);
        let freed = self.asm.jcc_short(Cc::E);
        self.asm
            .mov_rm(R_SCRATCH_2, Self::deref_handle(R_SCRATCH, T_NEXT));
        self.asm
            .mov_mr(Self::deref_handle(R_SCRATCH, T_NEXT), R_FREELIST);
        self.asm.mov_rr(R_FREELIST, R_SCRATCH);
        self.asm.mov_rr(R_SCRATCH, R_SCRATCH_2);
        self.asm.jmp_short_back(free_head);
        self.asm.bind_short(freed);

        // No fresh starts once a match is in hand
        self.asm.mov_m32_i(Self::frame(M_INITIAL_STATE_PUSHED), 1);

        // Unlink without freeing; the successor is gone
        self.asm.mov_ri(R_SCRATCH, -1);
        self.asm.jmp_label(remove_state);
    }
}
