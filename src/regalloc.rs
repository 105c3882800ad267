//! Greedy backwards register allocation.
//!
//! Registers are handed out at use sites while the LIR is walked in reverse
//! program order, so a value's register is decided at its last use and
//! released at its definition. When the file runs dry the least recently
//! touched candidate is evicted: a reload (or rematerialization) is emitted
//! at the eviction point, which in execution order runs just before the uses
//! already emitted, and the definition later stores to the assigned spill
//! slot. The evicted value gets its second chance in whatever register is
//! free at its next (earlier) use.
//!
//! Register state at every label is empty by construction: processing a
//! label evicts everything live, so control-flow merges agree on "values are
//! in their slots" without per-label state maps.

use crate::asm::Assembler;
use crate::lir::{InsId, Op, Payload, Ty};
use crate::regs::*;
use crate::blind;

/// Per-value allocation state, indexed by [`InsId`].
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ValueState {
    pub reg: Option<Register>,
    /// Highest activation-record word of this value's spill region, if any.
    pub ar: Option<u32>,
}

/// The register file: free set, active values, recency for eviction.
pub(crate) struct RegState {
    free: RegisterMask,
    managed: RegisterMask,
    active: [Option<InsId>; 32],
    usepri: [u64; 32],
    tick: u64,
}

impl RegState {
    pub fn new(managed: RegisterMask) -> RegState {
        RegState {
            free: managed,
            managed,
            active: [None; 32],
            usepri: [0; 32],
            tick: 0,
        }
    }

    pub fn managed(&self) -> RegisterMask {
        self.managed
    }

    pub fn active_mask(&self) -> RegisterMask {
        self.managed & !self.free
    }

    pub fn get_active(&self, r: Register) -> Option<InsId> {
        self.active[r.num() as usize]
    }

    fn set_active(&mut self, r: Register, ins: InsId) {
        self.free &= !rmask(r);
        self.active[r.num() as usize] = Some(ins);
        self.touch(r);
    }

    pub fn retire(&mut self, r: Register) {
        self.active[r.num() as usize] = None;
        self.free |= rmask(r) & self.managed;
    }

    fn touch(&mut self, r: Register) {
        self.tick += 1;
        self.usepri[r.num() as usize] = self.tick;
    }

    /// Least recently touched register in `mask`.
    fn coldest(&self, mask: RegisterMask) -> Option<Register> {
        let mut best: Option<Register> = None;
        let mut m = mask;
        while let Some(r) = lowest_set(m) {
            m &= !rmask(r);
            if best.is_none_or(|b| self.usepri[r.num() as usize] < self.usepri[b.num() as usize]) {
                best = Some(r);
            }
        }
        best
    }
}

/// Activation-record (spill area) bookkeeping, in 4-byte words below the
/// frame pointer. Word `m` lives at `FP - 4*m`; multi-word regions end on a
/// word index that is a multiple of their size so quads land 8-aligned and
/// vectors 16-aligned.
pub(crate) struct Ar {
    used: u32,
}

impl Ar {
    pub fn new() -> Ar {
        Ar { used: 0 }
    }

    fn alloc(&mut self, nwords: u32) -> u32 {
        let mut m = self.used + nwords;
        m = m.div_ceil(nwords) * nwords;
        self.used = m;
        m
    }

    pub fn words_used(&self) -> u32 {
        self.used
    }
}

fn spill_words(ty: Ty) -> u32 {
    match ty {
        Ty::I | Ty::F => 1,
        Ty::Q | Ty::D => 2,
        Ty::F4 => 4,
        Ty::V => 1,
    }
}

pub(crate) const SAVED_MASK: RegisterMask = {
    let mut m = 0;
    let mut i = 0;
    while i < SAVED_REGS.len() {
        m |= rmask(SAVED_REGS[i]);
        i += 1;
    }
    m
};

impl Assembler<'_> {
    pub(crate) fn is_in_reg(&self, i: InsId) -> bool {
        self.state[i.index()].reg.is_some()
    }

    pub(crate) fn get_reg(&self, i: InsId) -> Register {
        self.state[i.index()].reg.expect("value not in a register")
    }

    pub(crate) fn is_in_reg_mask(&self, i: InsId, mask: RegisterMask) -> bool {
        matches!(self.state[i.index()].reg, Some(r) if rmask(r) & mask != 0)
    }

    pub(crate) fn is_in_ar(&self, i: InsId) -> bool {
        self.state[i.index()].ar.is_some()
    }

    /// A value is extant when something downstream (already emitted) takes
    /// it from a register or a spill slot; dead definitions are skipped.
    pub(crate) fn is_extant(&self, i: InsId) -> bool {
        let s = self.state[i.index()];
        s.reg.is_some() || s.ar.is_some()
    }

    /// Frame-pointer displacement of the value's spill region.
    pub(crate) fn ar_disp(&mut self, i: InsId) -> i32 {
        let m = self.state[i.index()].ar.expect("value has no stack slot");
        -4 * m as i32
    }

    /// Assign (once) a spill region and return its displacement.
    pub(crate) fn find_mem_for(&mut self, i: InsId) -> i32 {
        if self.state[i.index()].ar.is_none() {
            let ins = &self.lir.ins[i];
            let nwords = match ins.payload {
                Payload::Alloc { size } => size.div_ceil(4).max(1),
                _ => spill_words(ins.ty),
            };
            let m = self.ar.alloc(nwords);
            self.state[i.index()].ar = Some(m);
        }
        self.ar_disp(i)
    }

    // ─── Core allocation ────────────────────────────────────────────────────

    /// Grab a register from `allow` (preferring `prefer`), evicting the
    /// least recently touched occupant if none is free. When `who` is given,
    /// the register becomes active for that value.
    fn register_alloc(&mut self, who: Option<InsId>, allow: RegisterMask, prefer: RegisterMask) -> Register {
        let allowed = allow & self.regs.managed();
        assert!(allowed != 0, "empty allow set");
        let free = self.regs.free_mask();
        let pick = lowest_set(free & allowed & prefer)
            .or_else(|| lowest_set(free & allowed))
            .unwrap_or_else(|| {
                let victim = self
                    .regs
                    .coldest(self.regs.active_mask() & allowed)
                    .expect("no evictable register in allow set");
                self.evict(victim);
                victim
            });
        match who {
            Some(i) => {
                self.regs.set_active(pick, i);
                self.state[i.index()].reg = Some(pick);
            }
            None => {
                // Temporary: stays free, valid only within the current
                // emission block.
                self.regs.touch(pick);
            }
        }
        pick
    }

    /// Short-lived scratch register for a single mnemonic-emission block.
    pub(crate) fn alloc_temp_reg(&mut self, allow: RegisterMask) -> Register {
        self.register_alloc(None, allow, 0)
    }

    /// Kick a value out of `r`, reloading it (in execution order) just before
    /// the uses that were already emitted.
    pub(crate) fn evict(&mut self, r: Register) {
        let ins = self.regs.get_active(r).expect("evicting a free register");
        self.regs.retire(r);
        self.state[ins.index()].reg = None;
        self.asm_restore(ins, r);
    }

    pub(crate) fn evict_if_active(&mut self, r: Register) {
        if self.regs.get_active(r).is_some() {
            self.evict(r);
        }
    }

    /// Evict every caller-saved register not in `ignore` (call boundaries).
    pub(crate) fn evict_scratch_regs_except(&mut self, ignore: RegisterMask) {
        let mut scratch = self.regs.active_mask() & !SAVED_MASK & !ignore;
        while let Some(r) = lowest_set(scratch) {
            scratch &= !rmask(r);
            self.evict(r);
        }
    }

    /// Evict everything; used at labels so every control-flow merge sees the
    /// same (empty) register state.
    pub(crate) fn evict_all_active(&mut self) {
        let mut active = self.regs.active_mask();
        while let Some(r) = lowest_set(active) {
            active &= !rmask(r);
            self.evict(r);
        }
    }

    // ─── Use-site interface ─────────────────────────────────────────────────

    /// Place `i` in some register from `allow`, emitting a register-to-
    /// register copy when it already lives elsewhere.
    pub(crate) fn find_reg_for(&mut self, i: InsId, allow: RegisterMask) -> Register {
        if let Some(r) = self.state[i.index()].reg {
            if rmask(r) & allow != 0 {
                self.regs.touch(r);
                return r;
            }
            // Downstream code reads the value from `r`; the current use needs
            // it in `allow`. Rebind to a new register and copy into the old
            // one (the copy executes after this use).
            self.regs.retire(r);
            self.state[i.index()].reg = None;
            let prefer = self.n_hint(i) & allow;
            let candidates = self.n_reg_copy_candidates(r, allow);
            let s = self.register_alloc(Some(i), candidates, prefer);
            if r.is_gp() && s.is_gp() {
                self.mr(r, s);
            } else {
                self.asm_nongp_copy(r, s);
            }
            s
        } else {
            let prefer = self.n_hint(i) & allow;
            self.register_alloc(Some(i), allow, prefer)
        }
    }

    /// Registers for two (possibly aliased) values at once.
    pub(crate) fn find_reg_for2(
        &mut self,
        allowa: RegisterMask,
        ia: InsId,
        allowb: RegisterMask,
        ib: InsId,
    ) -> (Register, Register) {
        if ia == ib {
            let r = self.find_reg_for(ia, allowa & allowb);
            (r, r)
        } else {
            let rb = self.find_reg_for(ib, allowb);
            let ra = self.find_reg_for(ia, allowa & !rmask(rb));
            (ra, rb)
        }
    }

    pub(crate) fn find_specific_reg_for(&mut self, i: InsId, w: Register) -> Register {
        self.find_reg_for(i, rmask(w))
    }

    /// Bind an unallocated value to exactly `w` without emitting anything.
    pub(crate) fn find_specific_reg_for_unallocated(&mut self, i: InsId, w: Register) {
        debug_assert!(!self.is_in_reg(i));
        self.register_alloc(Some(i), rmask(w), 0);
    }

    /// Reserve the result register at a definition site and, if the value was
    /// spilled somewhere below, emit the spill store (which executes after
    /// the definition).
    pub(crate) fn prepare_result_reg(&mut self, i: InsId, allow: RegisterMask) -> Register {
        let r = self.find_reg_for(i, allow);
        self.asm_maybe_spill(i);
        r
    }

    fn asm_maybe_spill(&mut self, i: InsId) {
        if self.is_in_ar(i) {
            let d = self.ar_disp(i);
            let r = self.get_reg(i);
            let nwords = spill_words(self.lir.ins[i].ty);
            self.asm_spill(r, d, nwords);
        }
    }

    pub(crate) fn asm_spill(&mut self, rr: Register, d: i32, nwords: u32) {
        debug_assert!(d != 0);
        if rr.is_gp() {
            debug_assert!(matches!(nwords, 1 | 2));
            if nwords == 2 {
                self.movqmr(rr, d, FP);
            } else {
                self.movlmr(rr, d, FP);
            }
        } else {
            match nwords {
                1 => self.movssmr(rr, d, FP),
                2 => self.movsdmr(rr, d, FP),
                4 => self.movupsmr(rr, d, FP),
                _ => unreachable!("bad spill size"),
            }
        }
    }

    /// The definition has been emitted; release the value's resources.
    pub(crate) fn free_resources_of(&mut self, i: InsId) {
        let s = self.state[i.index()];
        if let Some(r) = s.reg {
            self.regs.retire(r);
        }
        self.state[i.index()] = ValueState::default();
    }

    /// Drop all register bindings without reloads. Only sound where no path
    /// continues (return sites).
    pub(crate) fn release_registers(&mut self) {
        let mut active = self.regs.active_mask();
        while let Some(r) = lowest_set(active) {
            active &= !rmask(r);
            let ins = self.regs.get_active(r).unwrap();
            self.regs.retire(r);
            self.state[ins.index()].reg = None;
        }
    }

    /// Pin saved-kind params back to their callee-saved registers (used at
    /// return sites so the epilogue restores the right values).
    pub(crate) fn assign_saved_regs(&mut self) {
        self.release_registers();
        for idx in 0..self.lir.ins.len() {
            let id = InsId::new(idx as u32);
            let ins = &self.lir.ins[id];
            if ins.op == Op::Param && ins.param_kind() == crate::lir::ParamKind::Saved {
                let arg = ins.param_arg() as usize;
                if arg < SAVED_REGS.len() {
                    self.find_specific_reg_for_unallocated(id, SAVED_REGS[arg]);
                }
            }
        }
    }

    // ─── 2-address begin/end helpers ────────────────────────────────────────

    /// Register setup for `R = op R` forms. Pairs with `end_op_regs`.
    pub(crate) fn begin_op1_regs(&mut self, i: InsId, allow: RegisterMask) -> (Register, Register) {
        let a = self.lir.ins[i].oprnd1();
        let rr = self.prepare_result_reg(i, allow);
        // If 'a' isn't in a register it can be clobbered by 'i' and computed
        // directly into rr.
        let ra = if self.is_in_reg(a) { self.get_reg(a) } else { rr };
        debug_assert!(rmask(ra) & allow != 0);
        (rr, ra)
    }

    /// Register setup for `R = R op B` forms. Pairs with `end_op_regs`.
    pub(crate) fn begin_op2_regs(
        &mut self,
        i: InsId,
        mut allow: RegisterMask,
    ) -> (Register, Register, Register) {
        let a = self.lir.ins[i].oprnd1();
        let b = self.lir.ins[i].oprnd2();
        let mut rb = RZERO;
        if a != b {
            rb = self.find_reg_for(b, allow);
            allow &= !rmask(rb);
        }
        let rr = self.prepare_result_reg(i, allow);
        let ra = if self.is_in_reg(a) { self.get_reg(a) } else { rr };
        debug_assert!(rmask(ra) & allow != 0);
        if a == b {
            rb = ra;
        }
        (rr, ra, rb)
    }

    /// Release the result and bind a clobbered left operand to `ra`.
    pub(crate) fn end_op_regs(&mut self, i: InsId, rr: Register, ra: Register) {
        let a = self.lir.ins[i].oprnd1();
        debug_assert!(self.get_reg(i) == rr);
        self.free_resources_of(i);
        // A left operand without a register was computed in place; bind it
        // so the allocator spills or rematerializes it there.
        if !self.is_in_reg(a) {
            debug_assert!(ra == rr);
            self.find_specific_reg_for_unallocated(a, ra);
        }
    }

    // ─── Rematerialization ──────────────────────────────────────────────────

    /// Can this definition be dropped and rebuilt at a use, without touching
    /// condition codes or other registers? LEA-expressible pointer offsets
    /// and most immediates qualify; blinded immediates do not, because the
    /// XOR synthesis would alter the CCs. `asm_restore` mirrors this
    /// decision; an external allocator driver consults it before discarding
    /// a definition.
    pub fn can_remat(&self, i: InsId) -> bool {
        let ins = &self.lir.ins[i];
        let blindable_imm = (ins.is_imm_i()
            && ins.is_tainted()
            && self.config.blinding
            && blind::should_blind32(ins.imm_i()))
            || (ins.is_imm_q()
                && ins.is_tainted()
                && self.config.blinding
                && blind::should_blind64(ins.imm_q()));
        (ins.is_imm_any() && !blindable_imm) || ins.op == Op::Alloc || self.can_remat_lea(i)
    }

    /// `addi/addq reg, imm` pairs rebuild with a flag-neutral LEA when the
    /// left side is a live base register and the immediate is not blinded.
    pub(crate) fn can_remat_lea(&self, i: InsId) -> bool {
        let ins = &self.lir.ins[i];
        match ins.op {
            Op::AddI => {
                let (a, b) = match ins.payload {
                    Payload::Bin(a, b) => (a, b),
                    _ => return false,
                };
                let rhs = &self.lir.ins[b];
                self.is_in_reg_mask(a, BASE_REGS)
                    && rhs.is_imm_i()
                    && !(rhs.is_tainted() && self.config.blinding && blind::should_blind32(rhs.imm_i()))
            }
            Op::AddQ => {
                let (a, b) = match ins.payload {
                    Payload::Bin(a, b) => (a, b),
                    _ => return false,
                };
                let rhs = &self.lir.ins[b];
                self.is_in_reg_mask(a, BASE_REGS)
                    && rhs.is_imm_q()
                    && crate::encode::is_s32(rhs.imm_q() as i64)
                    && !(rhs.is_tainted()
                        && self.config.blinding
                        && blind::should_blind64(rhs.imm_q()))
            }
            _ => false,
        }
    }

    /// Rebuild `i` into `r` at an eviction point. Must not affect condition
    /// codes: comparisons and their consumers are emitted back to back and a
    /// reload can land between them.
    pub(crate) fn asm_restore(&mut self, i: InsId, r: Register) {
        let ins = &self.lir.ins[i];
        let op = ins.op;
        let tainted = ins.is_tainted();
        let blinding = self.config.blinding;
        if op == Op::Alloc {
            let d = self.find_mem_for(i);
            self.leaqrm(r, d, FP);
        } else if ins.is_imm_i() && !(tainted && blinding && blind::should_blind32(ins.imm_i())) {
            // Blinded literals reload from their slot instead: the XOR
            // synthesis would clobber the CCs.
            let v = ins.imm_i();
            self.asm_immi(r, v, false, false);
        } else if ins.is_imm_q() && !(tainted && blinding && blind::should_blind64(ins.imm_q())) {
            let v = ins.imm_q();
            self.asm_immq(r, v, false, false);
        } else if ins.is_imm_d() && !tainted {
            let v = ins.imm_d_bits();
            self.asm_immd(r, v, false, false);
        } else if ins.is_imm_f() && !tainted {
            let v = ins.imm_f_bits();
            self.asm_immf(r, v, false, false);
        } else if ins.is_imm_f4() {
            // Vector literals always come from the pool, so taint costs
            // nothing here.
            let v = ins.imm_f4();
            self.asm_immf4(r, v, false, tainted);
        } else if self.can_remat_lea(i) {
            let (a, b) = match self.lir.ins[i].payload {
                Payload::Bin(a, b) => (a, b),
                _ => unreachable!(),
            };
            let lhs = self.get_reg(a);
            if op == Op::AddQ {
                let d = self.lir.ins[b].imm_q() as i32;
                self.leaqrm(r, d, lhs);
            } else {
                let d = self.lir.ins[b].imm_i();
                self.lealrm(r, d, lhs);
            }
        } else {
            let ty = self.lir.ins[i].ty;
            let d = self.find_mem_for(i);
            match ty {
                Ty::D => {
                    debug_assert!(r.is_fp());
                    self.movsdrm(r, d, FP);
                }
                Ty::Q => {
                    debug_assert!(r.is_gp());
                    self.movqrm(r, d, FP);
                }
                Ty::F => {
                    debug_assert!(r.is_fp());
                    self.movssrm(r, d, FP);
                }
                Ty::F4 => {
                    debug_assert!(r.is_fp());
                    self.movupsrm(r, d, FP);
                }
                _ => {
                    debug_assert!(r.is_gp());
                    self.movlrm(r, d, FP);
                }
            }
        }
    }

    /// Per-opcode result-register hints.
    pub(crate) fn n_hint(&self, i: InsId) -> RegisterMask {
        let ins = &self.lir.ins[i];
        match ins.op {
            Op::Call => match ins.ty {
                Ty::D | Ty::F | Ty::F4 => rmask(XMM0),
                Ty::V => 0,
                _ => rmask(RAX),
            },
            Op::Param => {
                let arg = ins.param_arg() as usize;
                match ins.param_kind() {
                    crate::lir::ParamKind::Arg if arg < ARG_REGS.len() => rmask(ARG_REGS[arg]),
                    crate::lir::ParamKind::Saved if arg < SAVED_REGS.len() => {
                        rmask(SAVED_REGS[arg])
                    }
                    _ => 0,
                }
            }
            _ => 0,
        }
    }

    /// Copy candidates when shuffling a value between classes: any register
    /// transfers freely on x86-64.
    pub(crate) fn n_reg_copy_candidates(&self, _r: Register, allow: RegisterMask) -> RegisterMask {
        allow
    }
}

impl RegState {
    pub(crate) fn free_mask(&self) -> RegisterMask {
        self.free
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::Lir;
    use crate::Config;

    #[test]
    fn ar_regions_are_size_aligned() {
        let mut ar = Ar::new();
        let w1 = ar.alloc(1);
        let q = ar.alloc(2);
        let v = ar.alloc(4);
        assert_eq!(w1, 1);
        assert_eq!(q % 2, 0);
        assert_eq!(v % 4, 0);
        // displacements: word m sits at FP - 4m
        assert_eq!(-4 * (q as i32) % 8, 0);
        assert_eq!(-4 * (v as i32) % 16, 0);
        assert!(ar.words_used() >= 7);
    }

    #[test]
    fn eviction_prefers_least_recently_touched() {
        let mut rs = RegState::new(0b111);
        rs.set_active(Register(0), InsId::new(0));
        rs.set_active(Register(1), InsId::new(1));
        rs.set_active(Register(2), InsId::new(2));
        rs.touch(Register(0));
        assert_eq!(rs.coldest(rs.active_mask()), Some(Register(1)));
        rs.touch(Register(1));
        assert_eq!(rs.coldest(rs.active_mask()), Some(Register(2)));
    }

    #[test]
    fn remat_policy_follows_taint() {
        let mut lir = Lir::new();
        let plain = lir.imm_i(0x11223344);
        let hot = lir.imm_i(0x55667788);
        lir.set_tainted(hot);
        let small_hot = lir.imm_i(7);
        lir.set_tainted(small_hot);
        let slab = lir.alloc(16);
        let asm = Assembler::new(&lir, Config::default());
        assert!(asm.can_remat(plain));
        // Blind-worthy tainted literal: synthesis would clobber flags.
        assert!(!asm.can_remat(hot));
        // Small tainted constants are never blinded, so they still remat.
        assert!(asm.can_remat(small_hot));
        assert!(asm.can_remat(slab));
    }
}
