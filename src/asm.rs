//! The assembler: reverse-growing code cursors and the mnemonic layer.
//!
//! Code is written backwards. `emit` stores a whole 64-bit template ending at
//! the cursor and then steps the cursor back by the encoded length, so the
//! scratch bytes below each instruction are overlaid by whatever is emitted
//! next. Walking the LIR in reverse program order therefore produces
//! forward-order machine code.
//!
//! Two cursors share one discipline: the main stream and the exit stream
//! (side-exit stubs), swappable as a pair. `underrun_protect` keeps every
//! write inside the current chunk, bridging into a fresh chunk with an
//! unconditional jump when space runs out.

use std::collections::HashMap;
use std::fmt;
use std::ptr;

use tracing::trace;

use crate::codemem::{CodeChunk, CHUNK_BYTES};
use crate::encode::*;
use crate::lir::{GuardRecord, LabelId, Lir};
use crate::pool::LiteralPool;
use crate::regalloc::{Ar, RegState, ValueState};
use crate::regs::*;
use crate::{AssmError, Config};

/// Largest byte count any single emission may ask `underrun_protect` for.
pub const LARGEST_UNDERRUN_PROT: usize = 48;

/// Per-compilation assembler state. One instance per fragment; nothing is
/// shared across compilations except the process blind masks.
pub struct Assembler<'l> {
    pub(crate) lir: &'l Lir,
    pub(crate) config: Config,

    // current stream cursor and chunk bounds
    pub(crate) n_ins: *mut u8,
    pub(crate) code_start: *mut u8,
    pub(crate) code_end: *mut u8,
    // parked exit-stream cursor
    pub(crate) n_exit_ins: *mut u8,
    pub(crate) exit_start: *mut u8,
    pub(crate) exit_end: *mut u8,
    pub(crate) in_exit: bool,
    pub(crate) chunks: Vec<CodeChunk>,
    /// End of the emitted stream (address one past the last instruction).
    pub(crate) frag_end: *mut u8,
    /// Prologue-skipping entry used when another fragment jumps in.
    pub(crate) patch_entry: *mut u8,

    pub(crate) error: Option<AssmError>,

    // register allocation
    pub(crate) regs: RegState,
    pub(crate) state: Vec<ValueState>,
    pub(crate) ar: Ar,
    pub(crate) max_stk_used: i32,

    // fragment plumbing
    pub(crate) epilogue: Option<*mut u8>,
    pub(crate) pool: LiteralPool,
    pub(crate) guard_records: Vec<Box<GuardRecord>>,
    pub(crate) jump_tables: Vec<Box<[usize]>>,
    pub(crate) label_addr: HashMap<LabelId, *mut u8>,
    pub(crate) pending_labels: HashMap<LabelId, Vec<*mut u8>>,
}

impl<'l> Assembler<'l> {
    pub fn new(lir: &'l Lir, config: Config) -> Assembler<'l> {
        let guard_records = (0..lir.exits.len())
            .map(|i| {
                Box::new(GuardRecord {
                    exit: i as u32,
                    jmp: ptr::null_mut(),
                })
            })
            .collect();
        Assembler {
            lir,
            config,
            n_ins: ptr::null_mut(),
            code_start: ptr::null_mut(),
            code_end: ptr::null_mut(),
            n_exit_ins: ptr::null_mut(),
            exit_start: ptr::null_mut(),
            exit_end: ptr::null_mut(),
            in_exit: false,
            chunks: Vec::new(),
            frag_end: ptr::null_mut(),
            patch_entry: ptr::null_mut(),
            error: None,
            regs: RegState::new(MANAGED_REGS),
            state: vec![ValueState::default(); lir.ins.len()],
            ar: Ar::new(),
            max_stk_used: 0,
            epilogue: None,
            pool: LiteralPool::new(),
            guard_records,
            jump_tables: Vec::new(),
            label_addr: HashMap::new(),
            pending_labels: HashMap::new(),
        }
    }

    /// Park a jump table; the returned address stays stable for the life of
    /// the fragment.
    pub(crate) fn jump_tables_push(&mut self, table: Vec<usize>) -> *const usize {
        let boxed = table.into_boxed_slice();
        let ptr = boxed.as_ptr();
        self.jump_tables.push(boxed);
        ptr
    }

    pub fn set_error(&mut self, e: AssmError) {
        if self.error.is_none() {
            self.error = Some(e);
        }
    }

    pub fn error(&self) -> Option<AssmError> {
        self.error
    }

    // ─── Chunk management ───────────────────────────────────────────────────

    pub(crate) fn native_page_setup(&mut self) -> Result<(), AssmError> {
        debug_assert!(!self.in_exit);
        if self.n_ins.is_null() {
            self.code_alloc()?;
            self.frag_end = self.n_ins;
        }
        Ok(())
    }

    fn code_alloc(&mut self) -> Result<(), AssmError> {
        let chunk = CodeChunk::new(CHUNK_BYTES)?;
        self.code_start = chunk.start();
        self.code_end = chunk.end();
        self.n_ins = chunk.end();
        self.chunks.push(chunk);
        Ok(())
    }

    /// Ensure at least `bytes` plus the 8-byte write margin remain in the
    /// current chunk; otherwise start a new chunk and bridge to the old
    /// cursor with an unconditional jump.
    pub(crate) fn underrun_protect(&mut self, bytes: usize) {
        debug_assert!(bytes <= LARGEST_UNDERRUN_PROT);
        let pc = self.n_ins;
        if (pc as usize).saturating_sub(bytes) < self.code_start as usize {
            if self.code_alloc().is_err() {
                self.set_error(AssmError::OutOfMemory);
                return;
            }
            trace!(target: "strix::asm", "new chunk at {:?}", self.n_ins);
            // On the fresh chunk this jump cannot underrun again.
            self.jmp(Some(pc));
        }
    }

    /// Exchange the main and exit cursors. The exit chunk is allocated lazily
    /// on first swap.
    pub fn swap_code_chunks(&mut self) -> Result<(), AssmError> {
        if self.n_exit_ins.is_null() {
            let chunk = CodeChunk::new(CHUNK_BYTES)?;
            self.exit_start = chunk.start();
            self.exit_end = chunk.end();
            self.n_exit_ins = chunk.end();
            self.chunks.push(chunk);
        }
        std::mem::swap(&mut self.n_ins, &mut self.n_exit_ins);
        std::mem::swap(&mut self.code_start, &mut self.exit_start);
        std::mem::swap(&mut self.code_end, &mut self.exit_end);
        self.in_exit = !self.in_exit;
        Ok(())
    }

    pub fn cursor(&self) -> *mut u8 {
        self.n_ins
    }

    // ─── Raw emission ───────────────────────────────────────────────────────

    /// Write a template word ending at the cursor and step back by its
    /// length. Only the mnemonic layer calls this.
    pub(crate) fn emit(&mut self, op: u64) {
        let len = oplen(op);
        // The write is 8 bytes wide even for shorter instructions; the
        // margin in underrun_protect keeps it inside the chunk.
        self.underrun_protect(8);
        unsafe {
            ptr::write_unaligned(self.n_ins.sub(8) as *mut u64, op);
            self.n_ins = self.n_ins.sub(len);
        }
    }

    pub(crate) fn emit8(&mut self, op: u64, v: i32) {
        debug_assert!(is_s8(v as i64));
        self.emit(op | ((v as i8 as u8) as u64) << 56);
    }

    fn emit_target8(&mut self, underrun: usize, op: u64, target: *mut u8) {
        // Reserve space first: the offset is computed against the cursor and
        // must not move afterwards.
        self.underrun_protect(underrun);
        // A relative branch is relative to the next instruction, which in
        // reverse emission is the most recently written one, i.e. the cursor.
        let offset = target as i64 - self.n_ins as i64;
        debug_assert!(is_s8(offset));
        self.emit(op | ((offset as i8 as u8) as u64) << 56);
    }

    fn emit_target32(&mut self, underrun: usize, op: u64, target: Option<*mut u8>) {
        self.underrun_protect(underrun);
        let offset = match target {
            Some(t) => t as i64 - self.n_ins as i64,
            None => 0,
        };
        if !is_s32(offset) {
            self.set_error(AssmError::BranchTooFar);
        }
        self.emit(op | ((offset as u32) as u64) << 32);
    }

    fn emit_target64(&mut self, underrun: usize, op: u64, target: Option<*mut u8>) {
        debug_assert!(underrun >= 16);
        self.underrun_protect(underrun);
        unsafe {
            ptr::write_unaligned(
                self.n_ins.sub(8) as *mut u64,
                target.map_or(0, |t| t as u64),
            );
            self.n_ins = self.n_ins.sub(8);
        }
        self.emit(op);
    }

    // 2-register modrm form
    pub(crate) fn emitrr(&mut self, op: u64, r: Register, b: Register) {
        self.emit(rexrb(mod_rr(op, r, b), r, b));
    }

    // 2-register modrm form, 8-bit operand size
    pub(crate) fn emitrr8(&mut self, op: u64, r: Register, b: Register) {
        self.emit(rexrb8(mod_rr(op, r, b), r, b));
    }

    // 2-register form with a mandatory prefix
    pub(crate) fn emitprr(&mut self, op: u64, r: Register, b: Register) {
        self.emit(rexprb(mod_rr(op, r, b), r, b));
    }

    // 3-register modrm+sib form
    fn emitrxb(&mut self, op: u64, r: Register, x: Register, b: Register) {
        self.emit(rexrxb(mod_rxb(op, r, x, b), r, x, b));
    }

    fn emitrxb_imm(&mut self, op: u64, r: Register, x: Register, b: Register, imm: i32) {
        self.underrun_protect(4 + 8);
        unsafe {
            self.n_ins = self.n_ins.sub(4);
            ptr::write_unaligned(self.n_ins as *mut i32, imm);
        }
        self.emitrxb(op, r, x, b);
    }

    // single-register forms: the register lands in the template's top byte
    // (opcode low bits or ModR/M rm field)
    pub(crate) fn emitr(&mut self, op: u64, r: Register) {
        let op = op | r.low3() << 56;
        self.emit(rexrb(op, RZERO, r));
    }

    pub(crate) fn emitr8(&mut self, op: u64, r: Register) {
        let op = op | r.low3() << 56;
        self.emit(rexrb8(op, RZERO, r));
    }

    // disp32 modrm form with the displacement inside the template
    pub(crate) fn emitrm(&mut self, op: u64, r: Register, d: i32, b: Register) {
        self.emit(rexrb(mod_disp32(op, r, b, d), r, b));
    }

    pub(crate) fn emitrm8(&mut self, op: u64, r: Register, d: i32, b: Register) {
        self.emit(rexrb8(mod_disp32(op, r, b, d), r, b));
    }

    /// Write a displacement ahead of a 4+ byte opcode template whose ModR/M
    /// placeholder sits in the top byte (mod=10). Shrinks to disp8 form when
    /// possible by flipping the mode bits.
    fn emit_disp32(&mut self, op: u64, d: i32) -> u64 {
        if is_s8(d as i64) && (op >> 56) & 0xc0 == 0x80 {
            self.underrun_protect(1 + 8);
            unsafe {
                self.n_ins = self.n_ins.sub(1);
                self.n_ins.write(d as i8 as u8);
            }
            op ^ 0xc000_0000_0000_0000
        } else {
            self.underrun_protect(4 + 8);
            unsafe {
                self.n_ins = self.n_ins.sub(4);
                ptr::write_unaligned(self.n_ins as *mut i32, d);
            }
            op
        }
    }

    pub(crate) fn emitrm_wide(&mut self, op: u64, r: Register, d: i32, b: Register) {
        let op = self.emit_disp32(op, d);
        self.emitrr(op, r, b);
    }

    pub(crate) fn emitprm(&mut self, op: u64, r: Register, d: i32, b: Register) {
        let op = self.emit_disp32(op, d);
        self.emitprr(op, r, b);
    }

    fn emitrm_imm32(&mut self, op: u64, b: Register, d: i32, imm: i32) {
        debug_assert!(b.is_gp() && b.low3() != 4);
        self.underrun_protect(4 + 4 + 8);
        unsafe {
            self.n_ins = self.n_ins.sub(4);
            ptr::write_unaligned(self.n_ins as *mut i32, imm);
        }
        self.emitrm_wide(op, RZERO, d, b);
    }

    fn emitprm_imm16(&mut self, op: u64, b: Register, d: i32, imm: i32) {
        debug_assert!(b.is_gp() && b.low3() != 4);
        self.underrun_protect(2 + 4 + 8);
        unsafe {
            self.n_ins = self.n_ins.sub(2);
            ptr::write_unaligned(self.n_ins as *mut i16, imm as i16);
        }
        self.emitprm(op, RZERO, d, b);
    }

    fn emitrm_imm8(&mut self, op: u64, b: Register, d: i32, imm: i32) {
        debug_assert!(b.is_gp() && b.low3() != 4);
        self.underrun_protect(1 + 4 + 8);
        unsafe {
            self.n_ins = self.n_ins.sub(1);
            self.n_ins.write(imm as i8 as u8);
        }
        self.emitrm_wide(op, RZERO, d, b);
    }

    fn emitrr_imm(&mut self, op: u64, r: Register, b: Register, imm: i32) {
        debug_assert!(r.is_gp() && b.is_gp());
        self.underrun_protect(4 + 8);
        unsafe {
            self.n_ins = self.n_ins.sub(4);
            ptr::write_unaligned(self.n_ins as *mut i32, imm);
        }
        self.emitrr(op, r, b);
    }

    fn emitrr_imm8(&mut self, op: u64, r: Register, b: Register, imm: u8) {
        debug_assert!(r.is_fp() && b.is_fp());
        self.underrun_protect(1 + 8);
        unsafe {
            self.n_ins = self.n_ins.sub(1);
            self.n_ins.write(imm);
        }
        self.emitrr(op, r, b);
    }

    fn emitprr_imm8(&mut self, op: u64, r: Register, b: Register, imm: u8) {
        debug_assert!((r.is_gp() && b.is_gp()) || (r.is_fp() && b.is_fp()));
        self.underrun_protect(1 + 8);
        unsafe {
            self.n_ins = self.n_ins.sub(1);
            self.n_ins.write(imm);
        }
        self.emitprr(op, r, b);
    }

    fn emitr_imm(&mut self, op: u64, r: Register, imm: i32) {
        self.underrun_protect(4 + 8);
        unsafe {
            self.n_ins = self.n_ins.sub(4);
            ptr::write_unaligned(self.n_ins as *mut i32, imm);
        }
        self.emitr(op, r);
    }

    fn emitr_imm8(&mut self, op: u64, b: Register, imm8: i32) {
        debug_assert!(b.is_gp() && is_s8(imm8 as i64));
        let op = op | ((imm8 as i8 as u8) as u64) << 56 | b.low3() << 48;
        self.emit(rexrb(op, RZERO, b));
    }

    fn emitr_imm64(&mut self, op: u64, r: Register, imm64: u64) {
        self.underrun_protect(8 + 8);
        unsafe {
            self.n_ins = self.n_ins.sub(8);
            ptr::write_unaligned(self.n_ins as *mut u64, imm64);
        }
        self.emitr(op, r);
    }

    // xmm op with an absolute-32 memory operand
    fn emitxm_abs(&mut self, op: u64, r: Register, addr32: i32) {
        self.underrun_protect(4 + 8);
        unsafe {
            self.n_ins = self.n_ins.sub(4);
            ptr::write_unaligned(self.n_ins as *mut i32, addr32);
        }
        let op = op | (r.low3() << 3) << 48;
        let op = rexrb(op, r, RZERO);
        self.emit(op);
    }

    // xmm op with a RIP-relative memory operand; the displacement is from
    // the end of the instruction, which is the cursor before this call
    fn emitxm_rel(&mut self, op: u64, r: Register, addr: *const u8) {
        self.underrun_protect(4 + 8);
        let d = (addr as i64 - self.n_ins as i64) as i32;
        unsafe {
            self.n_ins = self.n_ins.sub(4);
            ptr::write_unaligned(self.n_ins as *mut i32, d);
        }
        self.emitrr(op, r, RZERO);
    }

    // RSP-relative store forms carry their own SIB byte ahead of the
    // displacement; shuffle it out of the way of emit_disp32 and back.
    fn emit_disp32_sib(&mut self, op: u64, d: i32) -> u64 {
        let sib = op & 0xff00_0000_0000_0000;
        let out = self.emit_disp32((op & 0x00ff_ffff_ffff_ffff) << 8, d);
        (out >> 8) | sib
    }

    // ─── Reach tests ────────────────────────────────────────────────────────

    /// True when `target` is within a signed 8-bit branch of the cursor.
    /// Calls `underrun_protect` first so the answer stays valid for the
    /// branch about to be emitted.
    pub(crate) fn is_target_within_s8(&mut self, target: *mut u8) -> bool {
        self.underrun_protect(8);
        if self.config.force_long_branch {
            return false;
        }
        is_s8(target as i64 - self.n_ins as i64)
    }

    pub(crate) fn is_target_within_s32(&mut self, target: *const u8) -> bool {
        self.is_target_within_s32_max(target, 8)
    }

    /// Some disp32 instructions are longer than 8 bytes (packed loads with
    /// separate displacement); they pass their worst-case size.
    pub(crate) fn is_target_within_s32_max(&mut self, target: *const u8, max_inst: usize) -> bool {
        self.underrun_protect(max_inst);
        if self.config.force_long_branch {
            return false;
        }
        is_s32(target as i64 - self.n_ins as i64)
    }

    // ─── Disassembly mirror ─────────────────────────────────────────────────

    pub(crate) fn note(&self, args: fmt::Arguments<'_>) {
        trace!(target: "strix::disasm", "{:p}  {}", self.n_ins, args);
    }
}

// ─── Mnemonic layer ─────────────────────────────────────────────────────────
//
// One routine per native instruction. Each asserts its operand preconditions,
// composes the encoder primitives, and mirrors itself to the trace log.

#[allow(dead_code)]
impl Assembler<'_> {
    pub(crate) fn pushr(&mut self, r: Register) {
        self.emitr(X64_PUSHR, r);
        self.note(format_args!("push {}", name_q(r)));
    }

    pub(crate) fn popr(&mut self, r: Register) {
        self.emitr(X64_POPR, r);
        self.note(format_args!("pop {}", name_q(r)));
    }

    pub(crate) fn notl(&mut self, r: Register) {
        self.emitr(X64_NOT, r);
        self.note(format_args!("notl {}", name_l(r)));
    }

    pub(crate) fn negl(&mut self, r: Register) {
        self.emitr(X64_NEG, r);
        self.note(format_args!("negl {}", name_l(r)));
    }

    pub(crate) fn idivl(&mut self, r: Register) {
        self.emitr(X64_IDIV, r);
        self.note(format_args!("idivl edx:eax, {}", name_l(r)));
    }

    // shifts by CL
    pub(crate) fn shr(&mut self, r: Register) {
        self.emitr(X64_SHR, r);
        self.note(format_args!("shrl {}, cl", name_l(r)));
    }

    pub(crate) fn sar(&mut self, r: Register) {
        self.emitr(X64_SAR, r);
        self.note(format_args!("sarl {}, cl", name_l(r)));
    }

    pub(crate) fn shl(&mut self, r: Register) {
        self.emitr(X64_SHL, r);
        self.note(format_args!("shll {}, cl", name_l(r)));
    }

    pub(crate) fn shrq(&mut self, r: Register) {
        self.emitr(X64_SHRQ, r);
        self.note(format_args!("shrq {}, cl", name_q(r)));
    }

    pub(crate) fn sarq(&mut self, r: Register) {
        self.emitr(X64_SARQ, r);
        self.note(format_args!("sarq {}, cl", name_q(r)));
    }

    pub(crate) fn shlq(&mut self, r: Register) {
        self.emitr(X64_SHLQ, r);
        self.note(format_args!("shlq {}, cl", name_q(r)));
    }

    // shifts by immediate
    fn shift_imm(&mut self, template: u64, r: Register, i: i32) {
        self.emit8(rexrb(template | r.low3() << 48, RZERO, r), i);
    }

    pub(crate) fn shri(&mut self, r: Register, i: i32) {
        self.shift_imm(X64_SHRI, r, i);
        self.note(format_args!("shrl {}, {}", name_l(r), i));
    }

    pub(crate) fn sari(&mut self, r: Register, i: i32) {
        self.shift_imm(X64_SARI, r, i);
        self.note(format_args!("sarl {}, {}", name_l(r), i));
    }

    pub(crate) fn shli(&mut self, r: Register, i: i32) {
        self.shift_imm(X64_SHLI, r, i);
        self.note(format_args!("shll {}, {}", name_l(r), i));
    }

    pub(crate) fn shrqi(&mut self, r: Register, i: i32) {
        self.shift_imm(X64_SHRQI, r, i);
        self.note(format_args!("shrq {}, {}", name_q(r), i));
    }

    pub(crate) fn sarqi(&mut self, r: Register, i: i32) {
        self.shift_imm(X64_SARQI, r, i);
        self.note(format_args!("sarq {}, {}", name_q(r), i));
    }

    pub(crate) fn shlqi(&mut self, r: Register, i: i32) {
        self.shift_imm(X64_SHLQI, r, i);
        self.note(format_args!("shlq {}, {}", name_q(r), i));
    }

    pub(crate) fn setcc(&mut self, cc: Cc, r: Register) {
        self.emitr8(X64_SETCC | (cc as u64) << 48, r);
        self.note(format_args!("set{} {}", cc.name(), name_b(r)));
    }

    // 32-bit integer ALU, register-register
    pub(crate) fn addrr(&mut self, l: Register, r: Register) {
        self.emitrr(X64_ADDRR, l, r);
        self.note(format_args!("addl {}, {}", name_l(l), name_l(r)));
    }

    pub(crate) fn subrr(&mut self, l: Register, r: Register) {
        self.emitrr(X64_SUBRR, l, r);
        self.note(format_args!("subl {}, {}", name_l(l), name_l(r)));
    }

    pub(crate) fn andrr(&mut self, l: Register, r: Register) {
        self.emitrr(X64_ANDRR, l, r);
        self.note(format_args!("andl {}, {}", name_l(l), name_l(r)));
    }

    pub(crate) fn orrr(&mut self, l: Register, r: Register) {
        self.emitrr(X64_ORRR, l, r);
        self.note(format_args!("orl {}, {}", name_l(l), name_l(r)));
    }

    pub(crate) fn xorrr(&mut self, l: Register, r: Register) {
        self.emitrr(X64_XORRR, l, r);
        self.note(format_args!("xorl {}, {}", name_l(l), name_l(r)));
    }

    pub(crate) fn imulrr(&mut self, l: Register, r: Register) {
        self.emitrr(X64_IMULRR, l, r);
        self.note(format_args!("imull {}, {}", name_l(l), name_l(r)));
    }

    pub(crate) fn cmplr(&mut self, l: Register, r: Register) {
        self.emitrr(X64_CMPRR, l, r);
        self.note(format_args!("cmpl {}, {}", name_l(l), name_l(r)));
    }

    pub(crate) fn movlr(&mut self, l: Register, r: Register) {
        self.emitrr(X64_MOVRR, l, r);
        self.note(format_args!("movl {}, {}", name_l(l), name_l(r)));
    }

    // 64-bit integer ALU, register-register
    pub(crate) fn addqrr(&mut self, l: Register, r: Register) {
        self.emitrr(X64_ADDQRR, l, r);
        self.note(format_args!("addq {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn subqrr(&mut self, l: Register, r: Register) {
        self.emitrr(X64_SUBQRR, l, r);
        self.note(format_args!("subq {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn andqrr(&mut self, l: Register, r: Register) {
        self.emitrr(X64_ANDQRR, l, r);
        self.note(format_args!("andq {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn orqrr(&mut self, l: Register, r: Register) {
        self.emitrr(X64_ORQRR, l, r);
        self.note(format_args!("orq {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn xorqrr(&mut self, l: Register, r: Register) {
        self.emitrr(X64_XORQRR, l, r);
        self.note(format_args!("xorq {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn cmpqr(&mut self, l: Register, r: Register) {
        self.emitrr(X64_CMPQRR, l, r);
        self.note(format_args!("cmpq {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn movqr(&mut self, l: Register, r: Register) {
        self.emitrr(X64_MOVQRR, l, r);
        self.note(format_args!("movq {}, {}", name_q(l), name_q(r)));
    }

    /// GP-to-GP move, the workhorse 2-address compensation copy.
    pub(crate) fn mr(&mut self, d: Register, s: Register) {
        debug_assert!(d.is_gp() && s.is_gp());
        self.movqr(d, s);
    }

    pub(crate) fn cmov(&mut self, cc: Cc, l: Register, r: Register) {
        self.emitrr(X64_CMOVCC | (cc as u64) << 48, l, r);
        self.note(format_args!("cmov{} {}, {}", cc.name(), name_l(l), name_l(r)));
    }

    pub(crate) fn cmovq(&mut self, cc: Cc, l: Register, r: Register) {
        self.emitrr(X64_CMOVQCC | (cc as u64) << 48, l, r);
        self.note(format_args!("cmov{} {}, {}", cc.name(), name_q(l), name_q(r)));
    }

    pub(crate) fn movsxdr(&mut self, l: Register, r: Register) {
        self.emitrr(X64_MOVSXDR, l, r);
        self.note(format_args!("movsxd {}, {}", name_q(l), name_l(r)));
    }

    pub(crate) fn movzx8(&mut self, l: Register, r: Register) {
        self.emitrr8(X64_MOVZX8, l, r);
        self.note(format_args!("movzx {}, {}", name_q(l), name_b(r)));
    }

    // XORPS rather than XORPD: one byte shorter, and it is only used for
    // zeroing or sign-flipping whole registers.
    pub(crate) fn xorps(&mut self, l: Register, r: Register) {
        self.emitrr(X64_XORPS, l, r);
        self.note(format_args!("xorps {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn movapsr(&mut self, l: Register, r: Register) {
        self.emitrr(X64_MOVAPSR, l, r);
        self.note(format_args!("movaps {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn unpcklps(&mut self, l: Register, r: Register) {
        self.emitrr(X64_UNPCKLPS, l, r);
        self.note(format_args!("unpcklps {}, {}", name_q(l), name_q(r)));
    }

    // scalar double
    pub(crate) fn addsd(&mut self, l: Register, r: Register) {
        self.emitprr(X64_ADDSD, l, r);
        self.note(format_args!("addsd {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn subsd(&mut self, l: Register, r: Register) {
        self.emitprr(X64_SUBSD, l, r);
        self.note(format_args!("subsd {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn mulsd(&mut self, l: Register, r: Register) {
        self.emitprr(X64_MULSD, l, r);
        self.note(format_args!("mulsd {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn divsd(&mut self, l: Register, r: Register) {
        self.emitprr(X64_DIVSD, l, r);
        self.note(format_args!("divsd {}, {}", name_q(l), name_q(r)));
    }

    // scalar single
    pub(crate) fn addss(&mut self, l: Register, r: Register) {
        self.emitprr(X64_ADDSS, l, r);
        self.note(format_args!("addss {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn subss(&mut self, l: Register, r: Register) {
        self.emitprr(X64_SUBSS, l, r);
        self.note(format_args!("subss {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn mulss(&mut self, l: Register, r: Register) {
        self.emitprr(X64_MULSS, l, r);
        self.note(format_args!("mulss {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn divss(&mut self, l: Register, r: Register) {
        self.emitprr(X64_DIVSS, l, r);
        self.note(format_args!("divss {}, {}", name_q(l), name_q(r)));
    }

    // packed 4 x f32
    pub(crate) fn addps(&mut self, l: Register, r: Register) {
        self.emitrr(X64_ADDPS, l, r);
        self.note(format_args!("addps {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn subps(&mut self, l: Register, r: Register) {
        self.emitrr(X64_SUBPS, l, r);
        self.note(format_args!("subps {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn mulps(&mut self, l: Register, r: Register) {
        self.emitrr(X64_MULPS, l, r);
        self.note(format_args!("mulps {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn divps(&mut self, l: Register, r: Register) {
        self.emitrr(X64_DIVPS, l, r);
        self.note(format_args!("divps {}, {}", name_q(l), name_q(r)));
    }

    // conversions
    pub(crate) fn cvtsi2sd(&mut self, l: Register, r: Register) {
        self.emitprr(X64_CVTSI2SD, l, r);
        self.note(format_args!("cvtsi2sd {}, {}", name_q(l), name_l(r)));
    }

    pub(crate) fn cvtsi2ss(&mut self, l: Register, r: Register) {
        self.emitprr(X64_CVTSI2SS, l, r);
        self.note(format_args!("cvtsi2ss {}, {}", name_q(l), name_l(r)));
    }

    pub(crate) fn cvtsq2sd(&mut self, l: Register, r: Register) {
        self.emitprr(X64_CVTSQ2SD, l, r);
        self.note(format_args!("cvtsi2sdq {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn cvtsq2ss(&mut self, l: Register, r: Register) {
        self.emitprr(X64_CVTSQ2SS, l, r);
        self.note(format_args!("cvtsi2ssq {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn cvtss2sd(&mut self, l: Register, r: Register) {
        self.emitprr(X64_CVTSS2SD, l, r);
        self.note(format_args!("cvtss2sd {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn cvtsd2ss(&mut self, l: Register, r: Register) {
        self.emitprr(X64_CVTSD2SS, l, r);
        self.note(format_args!("cvtsd2ss {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn cvttss2si(&mut self, l: Register, r: Register) {
        self.emitprr(X64_CVTTSS2SI, l, r);
        self.note(format_args!("cvttss2si {}, {}", name_l(l), name_q(r)));
    }

    pub(crate) fn cvttsd2si(&mut self, l: Register, r: Register) {
        self.emitprr(X64_CVTTSD2SI, l, r);
        self.note(format_args!("cvttsd2si {}, {}", name_l(l), name_q(r)));
    }

    pub(crate) fn ucomiss(&mut self, l: Register, r: Register) {
        self.emitrr(X64_UCOMISS, l, r);
        self.note(format_args!("ucomiss {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn ucomisd(&mut self, l: Register, r: Register) {
        self.emitprr(X64_UCOMISD, l, r);
        self.note(format_args!("ucomisd {}, {}", name_q(l), name_q(r)));
    }

    // GP <-> XMM; r and l are swapped inside movqrx because the encoding's
    // reg field holds the xmm operand
    pub(crate) fn movqrx(&mut self, d: Register, s: Register) {
        self.emitprr(X64_MOVQRX, s, d);
        self.note(format_args!("movq {}, {}", name_q(d), name_q(s)));
    }

    pub(crate) fn movqxr(&mut self, d: Register, s: Register) {
        self.emitprr(X64_MOVQXR, d, s);
        self.note(format_args!("movq {}, {}", name_q(d), name_q(s)));
    }

    pub(crate) fn movdxr(&mut self, d: Register, s: Register) {
        self.emitprr(X64_MOVDXR, d, s);
        self.note(format_args!("movd {}, {}", name_q(d), name_l(s)));
    }

    pub(crate) fn pmovmskb(&mut self, l: Register, r: Register) {
        debug_assert!(l.is_gp() && r.is_fp());
        self.emitprr(X64_PMOVMSKB, l, r);
        self.note(format_args!("pmovmskb {}, {}", name_l(l), name_q(r)));
    }

    pub(crate) fn cmpneqps(&mut self, l: Register, r: Register) {
        self.emitrr_imm8(X64_CMPPSR, l, r, 4);
        self.note(format_args!("cmpneqps {}, {}", name_q(l), name_q(r)));
    }

    pub(crate) fn pshufd(&mut self, l: Register, r: Register, mask: u8) {
        self.emitprr_imm8(X64_PSHUFD, l, r, mask);
        self.note(format_args!("pshufd {}, {}, {:#x}", name_q(l), name_q(r), mask));
    }

    pub(crate) fn shufpd(&mut self, l: Register, r: Register, mask: u8) {
        self.emitprr_imm8(X64_SHUFPD, l, r, mask);
        self.note(format_args!("shufpd {}, {}, {:#x}", name_q(l), name_q(r), mask));
    }

    // immediate ALU; MOVI must not affect condition codes
    pub(crate) fn movi(&mut self, r: Register, i: i32) {
        self.emitr_imm(X64_MOVI, r, i);
        self.note(format_args!("movl {}, {}", name_l(r), i));
    }

    pub(crate) fn addlri(&mut self, r: Register, i: i32) {
        self.emitr_imm(X64_ADDRI, r, i);
        self.note(format_args!("addl {}, {}", name_l(r), i));
    }

    pub(crate) fn sublri(&mut self, r: Register, i: i32) {
        self.emitr_imm(X64_SUBRI, r, i);
        self.note(format_args!("subl {}, {}", name_l(r), i));
    }

    pub(crate) fn andlri(&mut self, r: Register, i: i32) {
        self.emitr_imm(X64_ANDRI, r, i);
        self.note(format_args!("andl {}, {}", name_l(r), i));
    }

    pub(crate) fn orlri(&mut self, r: Register, i: i32) {
        self.emitr_imm(X64_ORRI, r, i);
        self.note(format_args!("orl {}, {}", name_l(r), i));
    }

    pub(crate) fn xorlri(&mut self, r: Register, i: i32) {
        self.emitr_imm(X64_XORRI, r, i);
        self.note(format_args!("xorl {}, {}", name_l(r), i));
    }

    pub(crate) fn cmplri(&mut self, r: Register, i: i32) {
        self.emitr_imm(X64_CMPRI, r, i);
        self.note(format_args!("cmpl {}, {}", name_l(r), i));
    }

    pub(crate) fn addqri(&mut self, r: Register, i: i32) {
        self.emitr_imm(X64_ADDQRI, r, i);
        self.note(format_args!("addq {}, {}", name_q(r), i));
    }

    pub(crate) fn subqri(&mut self, r: Register, i: i32) {
        self.emitr_imm(X64_SUBQRI, r, i);
        self.note(format_args!("subq {}, {}", name_q(r), i));
    }

    pub(crate) fn andqri(&mut self, r: Register, i: i32) {
        self.emitr_imm(X64_ANDQRI, r, i);
        self.note(format_args!("andq {}, {}", name_q(r), i));
    }

    pub(crate) fn orqri(&mut self, r: Register, i: i32) {
        self.emitr_imm(X64_ORQRI, r, i);
        self.note(format_args!("orq {}, {}", name_q(r), i));
    }

    pub(crate) fn xorqri(&mut self, r: Register, i: i32) {
        self.emitr_imm(X64_XORQRI, r, i);
        self.note(format_args!("xorq {}, {}", name_q(r), i));
    }

    pub(crate) fn cmpqri(&mut self, r: Register, i: i32) {
        self.emitr_imm(X64_CMPQRI, r, i);
        self.note(format_args!("cmpq {}, {}", name_q(r), i));
    }

    pub(crate) fn movqi32(&mut self, r: Register, i: i32) {
        self.emitr_imm(X64_MOVQI32, r, i);
        self.note(format_args!("movq {}, {}", name_q(r), i));
    }

    pub(crate) fn addlr8(&mut self, r: Register, i: i32) {
        self.emitr_imm8(X64_ADDR8, r, i);
        self.note(format_args!("addl {}, {}", name_l(r), i));
    }

    pub(crate) fn sublr8(&mut self, r: Register, i: i32) {
        self.emitr_imm8(X64_SUBR8, r, i);
        self.note(format_args!("subl {}, {}", name_l(r), i));
    }

    pub(crate) fn andlr8(&mut self, r: Register, i: i32) {
        self.emitr_imm8(X64_ANDR8, r, i);
        self.note(format_args!("andl {}, {}", name_l(r), i));
    }

    pub(crate) fn orlr8(&mut self, r: Register, i: i32) {
        self.emitr_imm8(X64_ORR8, r, i);
        self.note(format_args!("orl {}, {}", name_l(r), i));
    }

    pub(crate) fn xorlr8(&mut self, r: Register, i: i32) {
        self.emitr_imm8(X64_XORR8, r, i);
        self.note(format_args!("xorl {}, {}", name_l(r), i));
    }

    pub(crate) fn cmplr8(&mut self, r: Register, i: i32) {
        self.emitr_imm8(X64_CMPR8, r, i);
        self.note(format_args!("cmpl {}, {}", name_l(r), i));
    }

    pub(crate) fn addqr8(&mut self, r: Register, i: i32) {
        self.emitr_imm8(X64_ADDQR8, r, i);
        self.note(format_args!("addq {}, {}", name_q(r), i));
    }

    pub(crate) fn subqr8(&mut self, r: Register, i: i32) {
        self.emitr_imm8(X64_SUBQR8, r, i);
        self.note(format_args!("subq {}, {}", name_q(r), i));
    }

    pub(crate) fn andqr8(&mut self, r: Register, i: i32) {
        self.emitr_imm8(X64_ANDQR8, r, i);
        self.note(format_args!("andq {}, {}", name_q(r), i));
    }

    pub(crate) fn orqr8(&mut self, r: Register, i: i32) {
        self.emitr_imm8(X64_ORQR8, r, i);
        self.note(format_args!("orq {}, {}", name_q(r), i));
    }

    pub(crate) fn xorqr8(&mut self, r: Register, i: i32) {
        self.emitr_imm8(X64_XORQR8, r, i);
        self.note(format_args!("xorq {}, {}", name_q(r), i));
    }

    pub(crate) fn cmpqr8(&mut self, r: Register, i: i32) {
        self.emitr_imm8(X64_CMPQR8, r, i);
        self.note(format_args!("cmpq {}, {}", name_q(r), i));
    }

    pub(crate) fn imuli(&mut self, l: Register, r: Register, i: i32) {
        self.emitrr_imm(X64_IMULRI, l, r, i);
        self.note(format_args!("imull {}, {}, {}", name_l(l), name_l(r), i));
    }

    pub(crate) fn movqi(&mut self, r: Register, v: u64) {
        self.emitr_imm64(X64_MOVQI, r, v);
        self.note(format_args!("movabs {}, {:#x}", name_q(r), v));
    }

    pub(crate) fn learip(&mut self, r: Register, d: i32) {
        self.emitrm(X64_LEARIP, r, d, RZERO);
        self.note(format_args!("lea {}, [rip{:+#x}]", name_q(r), d));
    }

    pub(crate) fn lealrm(&mut self, r: Register, d: i32, b: Register) {
        self.emitrm(X64_LEALRM, r, d, b);
        self.note(format_args!("leal {}, [{}{:+}]", name_l(r), name_l(b), d));
    }

    pub(crate) fn leaqrm(&mut self, r: Register, d: i32, b: Register) {
        self.emitrm(X64_LEAQRM, r, d, b);
        self.note(format_args!("leaq {}, [{}{:+}]", name_q(r), name_q(b), d));
    }

    // integer loads
    pub(crate) fn movlrm(&mut self, r: Register, d: i32, b: Register) {
        self.emitrm(X64_MOVLRM, r, d, b);
        self.note(format_args!("movl {}, [{}{:+}]", name_l(r), name_q(b), d));
    }

    pub(crate) fn movqrm(&mut self, r: Register, d: i32, b: Register) {
        self.emitrm(X64_MOVQRM, r, d, b);
        self.note(format_args!("movq {}, [{}{:+}]", name_q(r), name_q(b), d));
    }

    pub(crate) fn movzx8m(&mut self, r: Register, d: i32, b: Register) {
        self.emitrm_wide(X64_MOVZX8M, r, d, b);
        self.note(format_args!("movzxb {}, [{}{:+}]", name_q(r), name_q(b), d));
    }

    pub(crate) fn movzx16m(&mut self, r: Register, d: i32, b: Register) {
        self.emitrm_wide(X64_MOVZX16M, r, d, b);
        self.note(format_args!("movzxw {}, [{}{:+}]", name_q(r), name_q(b), d));
    }

    pub(crate) fn movsx8m(&mut self, r: Register, d: i32, b: Register) {
        self.emitrm_wide(X64_MOVSX8M, r, d, b);
        self.note(format_args!("movsxb {}, [{}{:+}]", name_q(r), name_q(b), d));
    }

    pub(crate) fn movsx16m(&mut self, r: Register, d: i32, b: Register) {
        self.emitrm_wide(X64_MOVSX16M, r, d, b);
        self.note(format_args!("movsxw {}, [{}{:+}]", name_q(r), name_q(b), d));
    }

    // integer stores
    pub(crate) fn movbmr(&mut self, r: Register, d: i32, b: Register) {
        self.emitrm8(X64_MOVBMR, r, d, b);
        self.note(format_args!("movb [{}{:+}], {}", name_q(b), d, name_b(r)));
    }

    pub(crate) fn movsmr(&mut self, r: Register, d: i32, b: Register) {
        self.emitprm(X64_MOVSMR, r, d, b);
        self.note(format_args!("movw [{}{:+}], {}", name_q(b), d, name_s(r)));
    }

    pub(crate) fn movlmr(&mut self, r: Register, d: i32, b: Register) {
        self.emitrm(X64_MOVLMR, r, d, b);
        self.note(format_args!("movl [{}{:+}], {}", name_q(b), d, name_l(r)));
    }

    pub(crate) fn movqmr(&mut self, r: Register, d: i32, b: Register) {
        self.emitrm(X64_MOVQMR, r, d, b);
        self.note(format_args!("movq [{}{:+}], {}", name_q(b), d, name_q(r)));
    }

    // float loads/stores
    pub(crate) fn movsdrm(&mut self, r: Register, d: i32, b: Register) {
        self.emitprm(X64_MOVSDRM, r, d, b);
        self.note(format_args!("movsd {}, [{}{:+}]", name_q(r), name_q(b), d));
    }

    pub(crate) fn movsdmr(&mut self, r: Register, d: i32, b: Register) {
        self.emitprm(X64_MOVSDMR, r, d, b);
        self.note(format_args!("movsd [{}{:+}], {}", name_q(b), d, name_q(r)));
    }

    pub(crate) fn movssrm(&mut self, r: Register, d: i32, b: Register) {
        self.emitprm(X64_MOVSSRM, r, d, b);
        self.note(format_args!("movss {}, [{}{:+}]", name_q(r), name_q(b), d));
    }

    pub(crate) fn movssmr(&mut self, r: Register, d: i32, b: Register) {
        self.emitprm(X64_MOVSSMR, r, d, b);
        self.note(format_args!("movss [{}{:+}], {}", name_q(b), d, name_q(r)));
    }

    pub(crate) fn movupsrm(&mut self, r: Register, d: i32, b: Register) {
        self.emitrm_wide(X64_MOVUPSRM, r, d, b);
        self.note(format_args!("movups {}, [{}{:+}]", name_q(r), name_q(b), d));
    }

    pub(crate) fn movupsmr(&mut self, r: Register, d: i32, b: Register) {
        self.emitrm_wide(X64_MOVUPSMR, r, d, b);
        self.note(format_args!("movups [{}{:+}], {}", name_q(b), d, name_q(r)));
    }

    pub(crate) fn movapsrm(&mut self, r: Register, d: i32, b: Register) {
        self.emitrm_wide(X64_MOVAPSRM, r, d, b);
        self.note(format_args!("movaps {}, [{}{:+}]", name_q(r), name_q(b), d));
    }

    pub(crate) fn movupsrm_rip(&mut self, r: Register, d: i32) {
        self.emitrm_wide(X64_MOVUPSRIP, r, d, RZERO);
        self.note(format_args!("movups {}, [rip{:+#x}]", name_q(r), d));
    }

    pub(crate) fn movapsrm_rip(&mut self, r: Register, d: i32) {
        self.emitrm_wide(X64_MOVAPSRIP, r, d, RZERO);
        self.note(format_args!("movaps {}, [rip{:+#x}]", name_q(r), d));
    }

    // outgoing-argument stores relative to RSP
    pub(crate) fn movqspr(&mut self, d: i32, r: Register) {
        debug_assert!(is_s8(d as i64));
        let op = X64_MOVQSPR
            | ((d as i8 as u8) as u64) << 56
            | (r.low3() << 3) << 40
            | (r.hi() >> 1) << 24;
        self.emit(op);
        self.note(format_args!("movq [rsp{:+}], {}", d, name_q(r)));
    }

    pub(crate) fn movssspr(&mut self, r: Register, d: i32) {
        let op = self.emit_disp32_sib(X64_MOVSSSPR, d);
        self.emit(op | (r.low3() << 3) << 48 | (r.hi() >> 1) << 24);
        self.note(format_args!("movss [rsp{:+}], {}", d, name_q(r)));
    }

    pub(crate) fn movsdspr(&mut self, r: Register, d: i32) {
        let op = self.emit_disp32_sib(X64_MOVSDSPR, d);
        self.emit(op | (r.low3() << 3) << 48 | (r.hi() >> 1) << 24);
        self.note(format_args!("movsd [rsp{:+}], {}", d, name_q(r)));
    }

    pub(crate) fn movupsspr(&mut self, r: Register, d: i32) {
        let op = self.emit_disp32_sib(X64_MOVUPSSPR, d);
        self.emit(op | (r.low3() << 3) << 48 | (r.hi() >> 1) << 24);
        self.note(format_args!("movups [rsp{:+}], {}", d, name_q(r)));
    }

    // memory-immediate stores
    pub(crate) fn movqmi(&mut self, b: Register, d: i32, imm: i32) {
        self.emitrm_imm32(X64_MOVQMI, b, d, imm);
        self.note(format_args!("movq [{}{:+}], {}", name_q(b), d, imm));
    }

    pub(crate) fn movlmi(&mut self, b: Register, d: i32, imm: i32) {
        self.emitrm_imm32(X64_MOVLMI, b, d, imm);
        self.note(format_args!("movl [{}{:+}], {}", name_q(b), d, imm));
    }

    pub(crate) fn movsmi(&mut self, b: Register, d: i32, imm: i32) {
        self.emitprm_imm16(X64_MOVSMI, b, d, imm);
        self.note(format_args!("movw [{}{:+}], {}", name_q(b), d, imm));
    }

    pub(crate) fn movbmi(&mut self, b: Register, d: i32, imm: i32) {
        self.emitrm_imm8(X64_MOVBMI, b, d, imm);
        self.note(format_args!("movb [{}{:+}], {}", name_q(b), d, imm));
    }

    // sign-mask forms for float negation
    pub(crate) fn xorpsa(&mut self, r: Register, addr32: i32) {
        self.emitxm_abs(X64_XORPSA, r, addr32);
        self.note(format_args!("xorps {}, [{:#x}]", name_q(r), addr32));
    }

    pub(crate) fn xorpsm(&mut self, r: Register, addr: *const u8) {
        self.emitxm_rel(X64_XORPSM, r, addr);
        self.note(format_args!("xorps {}, [{:?}]", name_q(r), addr));
    }

    // jumps; `n` is the underrun reservation for the whole branch sequence
    pub(crate) fn jmp8(&mut self, n: usize, t: *mut u8) {
        self.emit_target8(n, X64_JMP8, t);
        self.note(format_args!("jmp {:?}", t));
    }

    pub(crate) fn jmp32(&mut self, n: usize, t: Option<*mut u8>) {
        self.emit_target32(n, X64_JMP32, t);
        self.note(format_args!("jmp {:?}", t));
    }

    pub(crate) fn jmp64(&mut self, n: usize, t: Option<*mut u8>) {
        self.emit_target64(n, X64_JMPI, t);
        self.note(format_args!("jmp {:?}", t));
    }

    pub(crate) fn jcc(&mut self, cc: Cc, n: usize, t: Option<*mut u8>) {
        self.emit_target32(n, X64_JCC32 | (cc as u64) << 24, t);
        self.note(format_args!("j{} {:?}", cc.name(), t));
    }

    pub(crate) fn jcc8(&mut self, cc: Cc, n: usize, t: *mut u8) {
        self.emit_target8(n, X64_JCC8 | (cc as u64) << 48, t);
        self.note(format_args!("j{} {:?}", cc.name(), t));
    }

    /// Indexed jump through an absolute table in the low/high 2GB.
    pub(crate) fn jmpx(&mut self, indexreg: Register, table: i32) {
        self.emitrxb_imm(X64_JMPX, RZERO, indexreg, RBP, table);
        self.note(format_args!("jmp [{}*8{:+#x}]", name_q(indexreg), table));
    }

    /// Indexed jump through a table whose base is in a register.
    pub(crate) fn jmpxb(&mut self, indexreg: Register, tablereg: Register) {
        self.emitrxb(X64_JMPX, RZERO, indexreg, tablereg);
        self.note(format_args!(
            "jmp [{}*8+{}]",
            name_q(indexreg),
            name_q(tablereg)
        ));
    }

    pub(crate) fn call(&mut self, n: usize, t: *mut u8) {
        self.emit_target32(n, X64_CALL, Some(t));
        self.note(format_args!("call {:?}", t));
    }

    pub(crate) fn callrax(&mut self) {
        self.emit(X64_CALLRAX);
        self.note(format_args!("call rax"));
    }

    pub(crate) fn ret(&mut self) {
        self.emit(X64_RET);
        self.note(format_args!("ret"));
    }

    // no-REX byte forms for the eqd parity dance; only rax..rbx have an
    // addressable high byte
    pub(crate) fn and8r_hi(&mut self, r: Register) {
        debug_assert!(r.num() < 4);
        self.emit(X86_AND8R | ((r.num() as u64) << 3 | (r.num() as u64 | 4)) << 56);
        self.note(format_args!("andb {}, {}", name_b(r), name_b_hi(r)));
    }

    pub(crate) fn setnp_hi(&mut self, r: Register) {
        debug_assert!(r.num() < 4);
        self.emit(X86_SETNP | (r.num() as u64 | 4) << 56);
        self.note(format_args!("setnp {}", name_b_hi(r)));
    }

    pub(crate) fn sete_lo(&mut self, r: Register) {
        debug_assert!(r.num() < 4);
        self.emit(X86_SETE | (r.num() as u64) << 56);
        self.note(format_args!("sete {}", name_b(r)));
    }

    /// Bump a 32-bit counter in memory without disturbing registers or using
    /// an allocator temp: spill RAX to the red zone around the increment.
    pub(crate) fn asm_inc_m32(&mut self, ctr: *const u32) {
        self.emitr(X64_POPR, RAX);
        self.emit(X64_INCLM_RAX);
        self.asm_immq(RAX, ctr as u64, true, false);
        self.emitr(X64_PUSHR, RAX);
        self.note(format_args!("incl [{:?}]", ctr));
    }

    /// Smallest unconditional jump that reaches `target`; unknown targets get
    /// the 64-bit form.
    pub(crate) fn jmp(&mut self, target: Option<*mut u8>) {
        match target {
            Some(t) if self.is_target_within_s8(t) => self.jmp8(8, t),
            Some(t) if self.is_target_within_s32(t) => self.jmp32(8, Some(t)),
            _ => self.jmp64(16, target),
        }
    }

    /// Patchable jump: at least the 32-bit form, since an 8-bit displacement
    /// cannot be retargeted safely.
    pub(crate) fn jmpl(&mut self, target: Option<*mut u8>) {
        match target {
            Some(t) if self.is_target_within_s32(t) => self.jmp32(8, Some(t)),
            _ => self.jmp64(16, target),
        }
    }

    /// Save all fifteen caller-visible GP registers (RSP's slot holds RBX as
    /// a placeholder) below a 32-byte scratch area.
    pub(crate) fn asm_pushstate(&mut self) {
        self.subqri(RSP, 32);
        for r in [R15, R14, R13, R12, R11, R10, R9, R8, RDI, RSI, RBP] {
            self.pushr(r);
        }
        self.pushr(RBX); // placeholder for RSP
        for r in [RBX, RDX, RCX, RAX] {
            self.pushr(r);
        }
    }

    pub(crate) fn asm_popstate(&mut self) {
        for r in [RAX, RCX, RDX, RBX] {
            self.popr(r);
        }
        self.popr(RBX); // placeholder for RSP
        for r in [RBP, RSI, RDI, R8, R9, R10, R11, R12, R13, R14, R15] {
            self.popr(r);
        }
        self.addqri(RSP, 32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::Lir;

    fn fresh<'l>(lir: &'l Lir) -> Assembler<'l> {
        let mut asm = Assembler::new(lir, Config::default());
        asm.native_page_setup().unwrap();
        asm
    }

    fn emitted(asm: &Assembler<'_>) -> Vec<u8> {
        let len = asm.frag_end as usize - asm.n_ins as usize;
        unsafe { std::slice::from_raw_parts(asm.n_ins, len).to_vec() }
    }

    #[test]
    fn reverse_emission_orders_forward() {
        let lir = Lir::new();
        let mut asm = fresh(&lir);
        // emitted in reverse: the ret lands last
        asm.ret();
        asm.movi(RAX, 7);
        assert_eq!(emitted(&asm), [0xb8, 0x07, 0x00, 0x00, 0x00, 0xc3]);
    }

    #[test]
    fn mov_load_uses_expected_modrm() {
        let lir = Lir::new();
        let mut asm = fresh(&lir);
        // mov rax, [rdi+16] → 48 8b 47 10
        asm.movqrm(RAX, 16, RDI);
        assert_eq!(emitted(&asm), [0x48, 0x8b, 0x47, 0x10]);
    }

    #[test]
    fn r13_base_gets_disp8_zero() {
        let lir = Lir::new();
        let mut asm = fresh(&lir);
        asm.movqrm(RAX, 0, R13);
        assert_eq!(emitted(&asm), [0x49, 0x8b, 0x45, 0x00]);
    }

    #[test]
    fn sse_store_with_wide_disp() {
        let lir = Lir::new();
        let mut asm = fresh(&lir);
        // movsd [rdi+0x200], xmm1 → f2 0f 11 8f 00 02 00 00
        asm.movsdmr(XMM1, 0x200, RDI);
        assert_eq!(
            emitted(&asm),
            [0xf2, 0x0f, 0x11, 0x8f, 0x00, 0x02, 0x00, 0x00]
        );
    }

    #[test]
    fn sse_store_shrinks_small_disp() {
        let lir = Lir::new();
        let mut asm = fresh(&lir);
        // movss [rsi+8], xmm0 → f3 0f 11 46 08
        asm.movssmr(XMM0, 8, RSI);
        assert_eq!(emitted(&asm), [0xf3, 0x0f, 0x11, 0x46, 0x08]);
    }

    #[test]
    fn rsp_relative_arg_store() {
        let lir = Lir::new();
        let mut asm = fresh(&lir);
        // mov [rsp+8], rdx → 48 89 54 24 08
        asm.movqspr(8, RDX);
        assert_eq!(emitted(&asm), [0x48, 0x89, 0x54, 0x24, 0x08]);
    }

    #[test]
    fn short_jump_reaches_backward_target() {
        let lir = Lir::new();
        let mut asm = fresh(&lir);
        asm.ret();
        let target = asm.cursor();
        asm.jmp(Some(target));
        // jmp rel8 +0: the displacement is measured from the instruction
        // after the jump, which is exactly `target`
        assert_eq!(emitted(&asm), [0xeb, 0x00, 0xc3]);
    }

    #[test]
    fn long_jump_forced_by_config() {
        let lir = Lir::new();
        let mut asm = Assembler::new(
            &lir,
            Config {
                force_long_branch: true,
                ..Config::default()
            },
        );
        asm.native_page_setup().unwrap();
        asm.ret();
        let target = asm.cursor();
        asm.jmp(Some(target));
        let bytes = emitted(&asm);
        // jmp [rip+0] + absolute target + ret
        assert_eq!(&bytes[..6], &[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
        let abs = u64::from_le_bytes(bytes[6..14].try_into().unwrap());
        assert_eq!(abs, target as u64);
        assert_eq!(bytes[14], 0xc3);
    }

    #[test]
    fn branch_too_far_poisons_assembler() {
        let lir = Lir::new();
        let mut asm = fresh(&lir);
        let far = (asm.cursor() as usize).wrapping_add(1 << 40) as *mut u8;
        asm.jmp32(8, Some(far));
        assert_eq!(asm.error(), Some(AssmError::BranchTooFar));
    }

    #[test]
    fn underrun_protect_bridges_chunks() {
        let lir = Lir::new();
        let mut asm = fresh(&lir);
        asm.ret();
        let tail = asm.cursor();
        // Fill the whole first chunk; every instruction is 5 bytes.
        while asm.chunks.len() == 1 {
            asm.movi(RAX, 0x12345678);
        }
        assert_eq!(asm.chunks.len(), 2);
        // The bridge at the bottom of the new chunk is an unconditional jump
        // into the old chunk, keeping `tail` reachable.
        assert!(asm.chunks[1].contains(asm.cursor()));
        let _ = tail;
        assert!(asm.error().is_none());
    }

    #[test]
    fn cc_mnemonics_encode_condition() {
        let lir = Lir::new();
        let mut asm = fresh(&lir);
        asm.setcc(Cc::G, RCX);
        // setg cl → 0f 9f c1
        assert_eq!(emitted(&asm), [0x0f, 0x9f, 0xc1]);
    }

    #[test]
    fn cmov_keeps_rex_for_high_regs() {
        let lir = Lir::new();
        let mut asm = fresh(&lir);
        asm.cmovq(Cc::Ne, RAX, R9);
        // cmovne rax, r9 → 49 0f 45 c1
        assert_eq!(emitted(&asm), [0x49, 0x0f, 0x45, 0xc1]);
    }
}
