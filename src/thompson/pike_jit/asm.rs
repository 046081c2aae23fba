//! A small x86-64 assembler with symbolic labels.
//!
//! Instructions are emitted eagerly into a byte buffer. Instructions whose
//! operand is a label (`call`, `jmp`, `jcc`, `lea reg, [rip + label]`) are
//! emitted as maximum-width placeholders and recorded in a side table;
//! [`Assembler::finalize`] then runs a fixpoint pass that rewrites each
//! `jmp`/`jcc` in its 2-byte short form whenever the settled displacement
//! fits in a signed byte. Every successful shrink moves later code closer,
//! which can enable further shrinks, so the pass repeats until a full
//! sweep changes nothing.
//!
//! Purely local control flow inside a fragment uses [`Assembler::jcc_short`]
//! and friends instead of the label engine; those branches must not span a
//! shrinkable label use, which is asserted in debug builds.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[rustfmt::skip]
pub enum Reg {
    Rax = 0, Rcx, Rdx, Rbx, Rsp, Rbp, Rsi, Rdi,
    R8, R9, R10, R11, R12, R13, R14, R15,
}

impl Reg {
    #[inline]
    fn low(self) -> u8 {
        self as u8 & 7
    }

    #[inline]
    fn ext(self) -> u8 {
        self as u8 >> 3
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum Scale {
    X1 = 0,
    X2,
    X4,
    X8,
}

/// A memory operand: `[base + index * scale + disp]`.
#[derive(Debug, Clone, Copy)]
pub struct Mem {
    base: Reg,
    index: Option<(Reg, Scale)>,
    disp: i32,
}

impl Mem {
    pub fn base(base: Reg) -> Mem {
        Mem {
            base,
            index: None,
            disp: 0,
        }
    }

    pub fn base_disp(base: Reg, disp: i32) -> Mem {
        Mem {
            base,
            index: None,
            disp,
        }
    }

    pub fn base_index(base: Reg, index: Reg) -> Mem {
        Mem::base_index_scale(base, index, Scale::X1)
    }

    pub fn base_index_scale(base: Reg, index: Reg, scale: Scale) -> Mem {
        assert!(!matches!(index, Reg::Rsp), "rsp cannot be an index");
        Mem {
            base,
            index: Some((index, scale)),
            disp: 0,
        }
    }

    pub fn displaced(mut self, extra: i32) -> Mem {
        self.disp += extra;
        self
    }
}

/// Condition codes, by encoding value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[rustfmt::skip]
pub enum Cc {
    B = 2, Ae = 3, E = 4, Ne = 5, Be = 6, A = 7,
}

impl Cc {
    /// Carry set / carry clear, as produced by `bt` and `bts`.
    pub const C: Cc = Cc::B;
    pub const Nc: Cc = Cc::Ae;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy)]
enum UseKind {
    Call,
    Jmp,
    Jcc(Cc),
    Lea(Reg),
}

impl UseKind {
    fn reserved(self) -> usize {
        match self {
            UseKind::Call => 5,
            UseKind::Jmp => 5,
            UseKind::Jcc(_) => 6,
            UseKind::Lea(_) => 7,
        }
    }
}

struct LabelUse {
    offset: usize,
    label: Label,
    kind: UseKind,
    is_short: bool,
}

impl LabelUse {
    fn size(&self) -> usize {
        if self.is_short { 2 } else { self.kind.reserved() }
    }

    fn gain(&self) -> usize {
        if self.is_short {
            self.kind.reserved() - 2
        } else {
            0
        }
    }
}

/// Assembly failed: some displacement cannot be represented in 32 bits,
/// i.e. the generated code would exceed 2 GiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplacementOverflow;

impl fmt::Display for DisplacementOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "branch displacement exceeds 32 bits")
    }
}

impl std::error::Error for DisplacementOverflow {}

/// A pending local forward branch; resolved by [`Assembler::bind_short`].
#[must_use]
pub struct ShortJump {
    patch_at: usize,
    uses_len: usize,
}

/// A local backward branch target, captured by [`Assembler::here`].
#[derive(Clone, Copy)]
pub struct BackTarget {
    offset: usize,
    uses_len: usize,
}

/// The finished machine code, before it is made executable.
pub struct FinalCode {
    pub code: Vec<u8>,
    /// Final offset of every defined label.
    pub labels: Vec<usize>,
}

#[derive(Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    uses: Vec<LabelUse>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn define_label(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none(), "label defined twice");
        self.labels[label.0] = Some(self.code.len());
    }

    // Label-operand instructions: emit a placeholder, record the use.

    fn push_use(&mut self, label: Label, kind: UseKind) {
        self.uses.push(LabelUse {
            offset: self.code.len(),
            label,
            kind,
            is_short: false,
        });
        self.code
            .extend(std::iter::repeat_n(0x90u8, kind.reserved()));
    }

    pub fn call_label(&mut self, label: Label) {
        self.push_use(label, UseKind::Call);
    }

    pub fn jmp_label(&mut self, label: Label) {
        self.push_use(label, UseKind::Jmp);
    }

    pub fn jcc_label(&mut self, cc: Cc, label: Label) {
        self.push_use(label, UseKind::Jcc(cc));
    }

    /// `lea reg, [rip + label]`; always 7 bytes, never shrunk.
    pub fn lea_label(&mut self, reg: Reg, label: Label) {
        self.push_use(label, UseKind::Lea(reg));
    }

    // Local short branches. These never interact with the label engine and
    // must not span a label use, since label resolution moves code.

    pub fn jcc_short(&mut self, cc: Cc) -> ShortJump {
        self.code.push(0x70 + cc as u8);
        self.code.push(0);
        ShortJump {
            patch_at: self.code.len() - 1,
            uses_len: self.uses.len(),
        }
    }

    pub fn jmp_short(&mut self) -> ShortJump {
        self.code.push(0xeb);
        self.code.push(0);
        ShortJump {
            patch_at: self.code.len() - 1,
            uses_len: self.uses.len(),
        }
    }

    pub fn bind_short(&mut self, jump: ShortJump) {
        debug_assert_eq!(
            jump.uses_len,
            self.uses.len(),
            "local branch spans a label use"
        );
        let displacement = self.code.len() - jump.patch_at - 1;
        assert!(displacement <= 127);
        self.code[jump.patch_at] = displacement as u8;
    }

    pub fn here(&self) -> BackTarget {
        BackTarget {
            offset: self.code.len(),
            uses_len: self.uses.len(),
        }
    }

    pub fn jcc_short_back(&mut self, cc: Cc, target: BackTarget) {
        debug_assert_eq!(
            target.uses_len,
            self.uses.len(),
            "local branch spans a label use"
        );
        let displacement = self.code.len() + 2 - target.offset;
        assert!(displacement <= 128);
        self.code.push(0x70 + cc as u8);
        self.code.push(-(displacement as i32) as u8);
    }

    pub fn jmp_short_back(&mut self, target: BackTarget) {
        debug_assert_eq!(
            target.uses_len,
            self.uses.len(),
            "local branch spans a label use"
        );
        let displacement = self.code.len() + 2 - target.offset;
        assert!(displacement <= 128);
        self.code.push(0xeb);
        self.code.push(-(displacement as i32) as u8);
    }

    // Encoding plumbing

    fn rex_for_rr(&mut self, w: bool, reg: u8, rm: Reg) {
        let rex = (w as u8) << 3 | (reg >> 3) << 2 | rm.ext();
        if rex != 0 {
            self.code.push(0x40 | rex);
        }
    }

    fn rex_for_mem(&mut self, w: bool, reg: u8, mem: &Mem) {
        let x = mem.index.map_or(0, |(index, _)| index.ext());
        let rex = (w as u8) << 3 | (reg >> 3) << 2 | x << 1 | mem.base.ext();
        if rex != 0 {
            self.code.push(0x40 | rex);
        }
    }

    /// ModRM (+ SIB + displacement) for a register rm operand.
    fn modrm_rr(&mut self, reg: u8, rm: Reg) {
        self.code.push(0xc0 | (reg & 7) << 3 | rm.low());
    }

    /// ModRM (+ SIB + displacement) for a memory rm operand.
    fn modrm_mem(&mut self, reg: u8, mem: &Mem) {
        // [rbp] and [r13] have no disp-free encoding (that bit pattern
        // means rip-relative); [rsp] and [r12] always need a SIB byte
        let (mod_bits, disp_size) = if mem.disp == 0 && mem.base.low() != 5 {
            (0u8, 0)
        } else if -128 <= mem.disp && mem.disp <= 127 {
            (1, 1)
        } else {
            (2, 4)
        };

        let need_sib = mem.index.is_some() || mem.base.low() == 4;

        if need_sib {
            let (index_low, scale) = match mem.index {
                Some((index, scale)) => (index.low(), scale as u8),
                // index 100 in a SIB byte means "no index"
                None => (4, 0),
            };
            self.code.push(mod_bits << 6 | (reg & 7) << 3 | 4);
            self.code.push(scale << 6 | index_low << 3 | mem.base.low());
        } else {
            self.code.push(mod_bits << 6 | (reg & 7) << 3 | mem.base.low());
        }

        match disp_size {
            0 => {}
            1 => self.code.push(mem.disp as u8),
            _ => self.code.extend_from_slice(&mem.disp.to_le_bytes()),
        }
    }

    fn op_rr(&mut self, w: bool, opcode: &[u8], reg: u8, rm: Reg) {
        self.rex_for_rr(w, reg, rm);
        self.code.extend_from_slice(opcode);
        self.modrm_rr(reg, rm);
    }

    fn op_mem(&mut self, w: bool, opcode: &[u8], reg: u8, mem: &Mem) {
        self.rex_for_mem(w, reg, mem);
        self.code.extend_from_slice(opcode);
        self.modrm_mem(reg, mem);
    }

    // Instructions

    pub fn push_reg(&mut self, reg: Reg) {
        if reg.ext() != 0 {
            self.code.push(0x41);
        }
        self.code.push(0x50 + reg.low());
    }

    pub fn pop_reg(&mut self, reg: Reg) {
        if reg.ext() != 0 {
            self.code.push(0x41);
        }
        self.code.push(0x58 + reg.low());
    }

    pub fn ret(&mut self) {
        self.code.push(0xc3);
    }

    pub fn nop(&mut self) {
        self.code.push(0x90);
    }

    /// mov dst, src (64-bit)
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.op_rr(true, &[0x89], src as u8, dst);
    }

    /// mov dst32, src32; zero-extends into the full register
    pub fn mov_rr32(&mut self, dst: Reg, src: Reg) {
        self.op_rr(false, &[0x89], src as u8, dst);
    }

    /// mov dst, qword [mem]
    pub fn mov_rm(&mut self, dst: Reg, mem: Mem) {
        self.op_mem(true, &[0x8b], dst as u8, &mem);
    }

    /// mov qword [mem], src
    pub fn mov_mr(&mut self, mem: Mem, src: Reg) {
        self.op_mem(true, &[0x89], src as u8, &mem);
    }

    /// mov qword [mem], imm32 (sign-extended)
    pub fn mov_mi(&mut self, mem: Mem, imm: i32) {
        self.op_mem(true, &[0xc7], 0, &mem);
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /// mov dword [mem], imm32
    pub fn mov_m32_i(&mut self, mem: Mem, imm: i32) {
        self.op_mem(false, &[0xc7], 0, &mem);
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /// mov reg, imm32 sign-extended to 64 bits
    pub fn mov_ri(&mut self, reg: Reg, imm: i32) {
        self.op_rr(true, &[0xc7], 0, reg);
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /// mov reg32, imm32; zero-extends
    pub fn mov_r32_i(&mut self, reg: Reg, imm: u32) {
        if reg.ext() != 0 {
            self.code.push(0x41);
        }
        self.code.push(0xb8 + reg.low());
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /// movabs reg, imm64
    pub fn mov_ri64(&mut self, reg: Reg, imm: u64) {
        self.code.push(0x48 | reg.ext());
        self.code.push(0xb8 + reg.low());
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /// movzx dst32, byte [mem]
    pub fn movzx_rm8(&mut self, dst: Reg, mem: Mem) {
        self.op_mem(false, &[0x0f, 0xb6], dst as u8, &mem);
    }

    /// lea dst, [mem]
    pub fn lea(&mut self, dst: Reg, mem: Mem) {
        self.op_mem(true, &[0x8d], dst as u8, &mem);
    }

    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.op_rr(true, &[0x01], src as u8, dst);
    }

    pub fn add_ri8(&mut self, reg: Reg, imm: i8) {
        self.op_rr(true, &[0x83], 0, reg);
        self.code.push(imm as u8);
    }

    pub fn sub_ri8(&mut self, reg: Reg, imm: i8) {
        self.op_rr(true, &[0x83], 5, reg);
        self.code.push(imm as u8);
    }

    /// shl reg, imm
    pub fn shl_ri8(&mut self, reg: Reg, imm: u8) {
        self.op_rr(true, &[0xc1], 4, reg);
        self.code.push(imm);
    }

    pub fn inc_r(&mut self, reg: Reg) {
        self.op_rr(true, &[0xff], 0, reg);
    }

    /// xor dst32, src32; the usual way to zero a register
    pub fn xor_rr32(&mut self, dst: Reg, src: Reg) {
        self.op_rr(false, &[0x31], src as u8, dst);
    }

    /// cmp left, right (64-bit)
    pub fn cmp_rr(&mut self, left: Reg, right: Reg) {
        self.op_rr(true, &[0x39], right as u8, left);
    }

    pub fn cmp_ri8(&mut self, reg: Reg, imm: i8) {
        self.op_rr(true, &[0x83], 7, reg);
        self.code.push(imm as u8);
    }

    pub fn cmp_r32_i8(&mut self, reg: Reg, imm: i8) {
        self.op_rr(false, &[0x83], 7, reg);
        self.code.push(imm as u8);
    }

    pub fn cmp_r32_i32(&mut self, reg: Reg, imm: i32) {
        self.op_rr(false, &[0x81], 7, reg);
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /// cmp reg, qword [mem]
    pub fn cmp_rm(&mut self, reg: Reg, mem: Mem) {
        self.op_mem(true, &[0x3b], reg as u8, &mem);
    }

    /// cmp qword [mem], imm8 (sign-extended)
    pub fn cmp_mi8(&mut self, mem: Mem, imm: i8) {
        self.op_mem(true, &[0x83], 7, &mem);
        self.code.push(imm as u8);
    }

    /// bt dword [mem], reg32; bit-string test, CF := bit
    pub fn bt_m_r32(&mut self, mem: Mem, reg: Reg) {
        self.op_mem(false, &[0x0f, 0xa3], reg as u8, &mem);
    }

    /// bts reg64, imm8; CF := old bit
    pub fn bts_r_i8(&mut self, reg: Reg, imm: u8) {
        self.op_rr(true, &[0x0f, 0xba], 5, reg);
        self.code.push(imm);
    }

    /// bts dword [mem], imm8
    pub fn bts_m32_i8(&mut self, mem: Mem, imm: u8) {
        self.op_mem(false, &[0x0f, 0xba], 5, &mem);
        self.code.push(imm);
    }

    /// setc reg8
    pub fn setc(&mut self, reg: Reg) {
        // sil/dil and up need a REX prefix to address their low byte
        if reg.ext() != 0 || matches!(reg, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi) {
            self.code.push(0x40 | reg.ext());
        }
        self.code.extend_from_slice(&[0x0f, 0x92]);
        self.modrm_rr(0, reg);
    }

    pub fn call_reg(&mut self, reg: Reg) {
        if reg.ext() != 0 {
            self.code.push(0x41);
        }
        self.code.push(0xff);
        self.modrm_rr(2, reg);
    }

    /// jmp qword [mem]
    pub fn jmp_mem(&mut self, mem: Mem) {
        self.op_mem(false, &[0xff], 4, &mem);
    }

    /// Resolve labels, shrink branches, and produce the final code.
    pub fn finalize(self) -> Result<FinalCode, DisplacementOverflow> {
        let Assembler {
            code,
            labels,
            mut uses,
        } = self;

        let labels: Vec<usize> = labels
            .into_iter()
            .map(|offset| offset.expect("label used but never defined"))
            .collect();

        // Offsets of uses are strictly increasing, so the shift a given
        // offset has accumulated is a prefix sum over the uses before it.
        let shift_at = |uses: &[LabelUse], offset: usize| -> usize {
            let mut shift = 0;
            for use_ in uses {
                if use_.offset >= offset {
                    break;
                }
                shift += use_.gain();
            }
            shift
        };

        // Fixpoint: marking a branch short only ever shrinks displacements,
        // so passes are monotone and terminate.
        loop {
            let mut changed = false;

            for i in 0..uses.len() {
                let use_ = &uses[i];
                if use_.is_short || !matches!(use_.kind, UseKind::Jmp | UseKind::Jcc(_)) {
                    continue;
                }

                let gain = use_.kind.reserved() - 2;
                let label_offset = labels[use_.label.0];

                let origin = use_.offset - shift_at(&uses, use_.offset) + 2;
                let mut target = label_offset - shift_at(&uses, label_offset);
                if label_offset > use_.offset {
                    // Shrinking this very use moves a downstream target
                    target -= gain;
                }

                let displacement = target as i64 - origin as i64;
                if (-128..=127).contains(&displacement) {
                    uses[i].is_short = true;
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }

        // Rewrite into the final layout
        let final_labels: Vec<usize> = labels
            .iter()
            .map(|&offset| offset - shift_at(&uses, offset))
            .collect();

        let mut out = Vec::with_capacity(code.len());
        let mut copied_to = 0;

        for use_ in &uses {
            out.extend_from_slice(&code[copied_to..use_.offset]);
            copied_to = use_.offset + use_.kind.reserved();

            let target = final_labels[use_.label.0] as i64;
            let origin = (out.len() + use_.size()) as i64;
            let displacement = target - origin;

            if !(i32::MIN as i64..=i32::MAX as i64).contains(&displacement) {
                return Err(DisplacementOverflow);
            }

            match (use_.kind, use_.is_short) {
                (UseKind::Call, _) => {
                    out.push(0xe8);
                    out.extend_from_slice(&(displacement as i32).to_le_bytes());
                }
                (UseKind::Jmp, true) => {
                    debug_assert!((-128..=127).contains(&displacement));
                    out.push(0xeb);
                    out.push(displacement as i8 as u8);
                }
                (UseKind::Jmp, false) => {
                    out.push(0xe9);
                    out.extend_from_slice(&(displacement as i32).to_le_bytes());
                }
                (UseKind::Jcc(cc), true) => {
                    debug_assert!((-128..=127).contains(&displacement));
                    out.push(0x70 + cc as u8);
                    out.push(displacement as i8 as u8);
                }
                (UseKind::Jcc(cc), false) => {
                    out.push(0x0f);
                    out.push(0x80 + cc as u8);
                    out.extend_from_slice(&(displacement as i32).to_le_bytes());
                }
                (UseKind::Lea(reg), _) => {
                    out.push(0x48 | (reg.ext()) << 2);
                    out.push(0x8d);
                    // mod 00, rm 101: rip-relative
                    out.push((reg.low()) << 3 | 5);
                    out.extend_from_slice(&(displacement as i32).to_le_bytes());
                }
            }
        }

        out.extend_from_slice(&code[copied_to..]);

        Ok(FinalCode {
            code: out,
            labels: final_labels,
        })
    }
}
