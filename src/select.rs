//! Code selection: one routine per LIR opcode family.
//!
//! Routines are written in source order but executed in reverse, since the
//! cursor decrements: a 2-address op emits the ALU instruction first and the
//! compensation `mov rr, ra` second, which materializes as mov-then-op in
//! memory. Every `asm_*` routine leaves the allocator consistent for the
//! instruction above it.

use tracing::debug;

use crate::asm::Assembler;
use crate::blind;
use crate::encode::{is_s32, is_s8, Cc};
use crate::lir::{ArgTy, ExitId, InsId, Op, ParamKind, Payload, Ty};
use crate::regs::*;
use crate::AssmError;

/// Branch patch locations handed back to the driver; float equality needs
/// two.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Branches {
    pub patch1: Option<*mut u8>,
    pub patch2: Option<*mut u8>,
}

impl Branches {
    fn one(p: *mut u8) -> Branches {
        Branches {
            patch1: Some(p),
            patch2: None,
        }
    }
}

#[repr(align(16))]
struct Align16<T>(T);

static NEGATE_MASK_D: Align16<[u64; 2]> = Align16([0x8000_0000_0000_0000, 0]);
static NEGATE_MASK_F: Align16<[u32; 4]> = Align16([0x8000_0000, 0, 0, 0]);
static NEGATE_MASK_F4: Align16<[u32; 4]> =
    Align16([0x8000_0000, 0x8000_0000, 0x8000_0000, 0x8000_0000]);

/// Taken-sense condition code for an integer (or eqf4) comparison opcode.
fn cc_of(op: Op) -> Cc {
    use Op::*;
    match op {
        EqI | EqQ | EqF4 => Cc::E,
        LtI | LtQ => Cc::L,
        GtI | GtQ => Cc::G,
        LeI | LeQ => Cc::Le,
        GeI | GeQ => Cc::Ge,
        LtUI | LtUQ => Cc::B,
        GtUI | GtUQ => Cc::A,
        LeUI | LeUQ => Cc::Be,
        GeUI | GeUQ => Cc::Ae,
        _ => panic!("no condition code for {op:?}"),
    }
}

fn is_imm32(ins: &crate::lir::Ins) -> bool {
    ins.is_imm_i() || (ins.is_imm_q() && is_s32(ins.imm_q() as i64))
}

fn get_imm32(ins: &crate::lir::Ins) -> i32 {
    if ins.is_imm_i() {
        ins.imm_i()
    } else {
        ins.imm_q() as i32
    }
}

impl Assembler<'_> {
    // ─── Driver ─────────────────────────────────────────────────────────────

    /// Assemble the whole trace, returning the fragment entry point.
    pub(crate) fn assemble(&mut self) -> Result<*mut u8, AssmError> {
        self.native_page_setup()?;
        for idx in (0..self.lir.ins.len()).rev() {
            if self.error.is_some() {
                break;
            }
            self.r#gen(InsId::new(idx as u32));
        }
        if !self.pending_labels.is_empty() {
            self.set_error(AssmError::UnsupportedOp);
        }
        if let Some(e) = self.error {
            return Err(e);
        }
        let entry = self.gen_prologue();
        debug!(target: "strix::asm", ?entry, words = self.ar.words_used(), "fragment assembled");
        match self.error {
            Some(e) => Err(e),
            None => Ok(entry),
        }
    }

    fn r#gen(&mut self, i: InsId) {
        use Op::*;
        let op = self.lir.ins[i].op;
        match op {
            ImmI | ImmQ | ImmD | ImmF | ImmF4 => {
                if self.is_extant(i) {
                    self.asm_imm_ins(i);
                }
            }
            Param => {
                if self.is_extant(i) {
                    self.asm_param(i);
                }
            }
            Alloc => {
                if self.is_extant(i) {
                    self.asm_alloc(i);
                }
            }
            AddI | SubI | MulI | AndI | OrI | XorI | AddQ | SubQ | AndQ | OrQ | XorQ => {
                if self.is_extant(i) {
                    self.asm_arith(i);
                }
            }
            LshI | RshI | RshUI | LshQ | RshQ | RshUQ => {
                if self.is_extant(i) {
                    self.asm_shift(i);
                }
            }
            DivI => {
                // A div feeding a mod was already emitted by asm_div_mod.
                if self.is_extant(i) {
                    self.asm_div(i);
                }
            }
            ModI => {
                if self.is_extant(i) {
                    self.asm_div_mod(i);
                }
            }
            NotI | NegI => {
                if self.is_extant(i) {
                    self.asm_neg_not(i);
                }
            }
            AddJovI | SubJovI | MulJovI | AddJovQ | SubJovQ => self.asm_jov(i),
            AddD | SubD | MulD | DivD | AddF | SubF | MulF | DivF | AddF4 | SubF4 | MulF4
            | DivF4 => {
                if self.is_extant(i) {
                    self.asm_fop(i);
                }
            }
            NegD | NegF | NegF4 => {
                if self.is_extant(i) {
                    self.asm_neg_abs(i);
                }
            }
            EqI | LtI | GtI | LeI | GeI | LtUI | GtUI | LeUI | GeUI | EqQ | LtQ | GtQ | LeQ
            | GeQ | LtUQ | GtUQ | LeUQ | GeUQ => {
                if self.is_extant(i) {
                    self.asm_cond(i);
                }
            }
            EqD | LtD | GtD | LeD | GeD | EqF | LtF | GtF | LeF | GeF => {
                if self.is_extant(i) {
                    self.asm_condd(i);
                }
            }
            EqF4 => {
                if self.is_extant(i) {
                    self.asm_condf4(i);
                }
            }
            I2Q | Ui2Uq => {
                if self.is_extant(i) {
                    self.asm_ui2uq(i);
                }
            }
            Q2I => {
                if self.is_extant(i) {
                    self.asm_q2i(i);
                }
            }
            I2D | Q2D | Ui2D | I2F | Ui2F => {
                if self.is_extant(i) {
                    self.asm_int2fp(i);
                }
            }
            F2I | D2I => {
                if self.is_extant(i) {
                    self.asm_fp2int(i);
                }
            }
            F2D | D2F => {
                if self.is_extant(i) {
                    self.asm_fp2fp(i);
                }
            }
            F2F4 => {
                if self.is_extant(i) {
                    self.asm_f2f4(i);
                }
            }
            Ffff2F4 => {
                if self.is_extant(i) {
                    self.asm_ffff2f4(i);
                }
            }
            F4X | F4Y | F4Z | F4W | SwzF4 => {
                if self.is_extant(i) {
                    self.asm_f4comp(i);
                }
            }
            DasQ => {
                if self.is_extant(i) {
                    self.asm_dasq(i);
                }
            }
            QasD => {
                if self.is_extant(i) {
                    self.asm_qasd(i);
                }
            }
            CmovI | CmovQ | CmovD | CmovF | CmovF4 => {
                if self.is_extant(i) {
                    self.asm_cmov(i);
                }
            }
            LdI | LdUc2Ui | LdUs2Ui | LdC2I | LdS2I => {
                if self.is_extant(i) {
                    self.asm_load32(i);
                }
            }
            LdQ | LdD | LdF | LdF2D => {
                if self.is_extant(i) {
                    self.asm_load64(i);
                }
            }
            LdF4 => {
                if self.is_extant(i) {
                    self.asm_load128(i);
                }
            }
            StI | StI2C | StI2S => self.asm_store32(i),
            StQ | StD | StF | StD2F => self.asm_store64(i),
            StF4 => self.asm_store128(i),
            Call => self.asm_call(i),
            Label => self.asm_label(i),
            J | Jt | Jf => self.asm_branch_to_label(i),
            Jtbl => self.asm_jtbl(i),
            X | Xt | Xf => self.asm_guard(i),
            Ret => self.asm_ret(i),
        }
    }

    // ─── Integer arithmetic ─────────────────────────────────────────────────

    fn asm_arith(&mut self, i: InsId) {
        let b = self.lir.ins[i].oprnd2();
        let bi = &self.lir.ins[b];
        if is_imm32(bi) {
            let val = get_imm32(bi);
            if bi.is_tainted() && self.config.blinding && blind::should_blind32(val) {
                if self.asm_arith_imm_blind(i) {
                    return;
                }
                // fall through to the register form
            } else {
                self.asm_arith_imm(i);
                return;
            }
        }

        let (rr, ra, rb) = self.begin_op2_regs(i, GP_REGS);
        use Op::*;
        match self.lir.ins[i].op {
            OrI => self.orrr(rr, rb),
            SubI | SubJovI => self.subrr(rr, rb),
            AddI | AddJovI => self.addrr(rr, rb),
            AndI => self.andrr(rr, rb),
            XorI => self.xorrr(rr, rb),
            MulI | MulJovI => self.imulrr(rr, rb),
            XorQ => self.xorqrr(rr, rb),
            OrQ => self.orqrr(rr, rb),
            AndQ => self.andqrr(rr, rb),
            AddQ | AddJovQ => self.addqrr(rr, rb),
            SubQ | SubJovQ => self.subqrr(rr, rb),
            op => panic!("asm_arith on {op:?}"),
        }
        if rr != ra {
            self.mr(rr, ra);
        }
        self.end_op_regs(i, rr, ra);
    }

    /// Binary op whose right side is a 32-bit immediate.
    fn asm_arith_imm(&mut self, i: InsId) {
        let b = self.lir.ins[i].oprnd2();
        let imm = get_imm32(&self.lir.ins[b]);
        let op = self.lir.ins[i].op;
        use Op::*;

        if matches!(op, MulI | MulJovI) {
            // imul-by-imm has a true 3-address form, so no compensation move.
            let (rr, ra) = self.begin_op1_regs(i, GP_REGS);
            self.imuli(rr, ra, imm);
            self.end_op_regs(i, rr, ra);
            return;
        }

        let (rr, ra) = self.begin_op1_regs(i, GP_REGS);
        if is_s8(imm as i64) {
            match op {
                AddI | AddJovI => self.addlr8(rr, imm),
                AndI => self.andlr8(rr, imm),
                OrI => self.orlr8(rr, imm),
                SubI | SubJovI => self.sublr8(rr, imm),
                XorI => self.xorlr8(rr, imm),
                AddQ | AddJovQ => self.addqr8(rr, imm),
                SubQ | SubJovQ => self.subqr8(rr, imm),
                AndQ => self.andqr8(rr, imm),
                OrQ => self.orqr8(rr, imm),
                XorQ => self.xorqr8(rr, imm),
                op => panic!("asm_arith_imm on {op:?}"),
            }
        } else {
            match op {
                AddI | AddJovI => self.addlri(rr, imm),
                AndI => self.andlri(rr, imm),
                OrI => self.orlri(rr, imm),
                SubI | SubJovI => self.sublri(rr, imm),
                XorI => self.xorlri(rr, imm),
                AddQ | AddJovQ => self.addqri(rr, imm),
                SubQ | SubJovQ => self.subqri(rr, imm),
                AndQ => self.andqri(rr, imm),
                OrQ => self.orqri(rr, imm),
                XorQ => self.xorqri(rr, imm),
                op => panic!("asm_arith_imm on {op:?}"),
            }
        }
        if rr != ra {
            self.mr(rr, ra);
        }
        self.end_op_regs(i, rr, ra);
    }

    /// Rewrite `op r, k` as a mask pair so the raw constant never appears.
    /// Sets CCs the plain form would not, so callers must only use this where
    /// the flags are dead. Returns false for opcodes with no pair form.
    fn asm_arith_imm_blind(&mut self, i: InsId) -> bool {
        use Op::*;
        let op = self.lir.ins[i].op;
        match op {
            AddI | AndI | OrI | SubI | XorI | AddQ | SubQ | AndQ | OrQ | XorQ => {}
            _ => return false,
        }

        let b = self.lir.ins[i].oprnd2();
        let imm = get_imm32(&self.lir.ins[b]);
        let mask = blind::mask32() as i32;
        // Short immediates are not routed here; the imm8 forms stay plain.
        debug_assert!(!is_s8(imm as i64));

        let (rr, ra) = self.begin_op1_regs(i, GP_REGS);
        match op {
            AddI => {
                self.addlri(rr, mask);
                self.addlri(rr, imm.wrapping_sub(mask));
            }
            AddQ => {
                self.addqri(rr, mask);
                self.addqri(rr, imm.wrapping_sub(mask));
            }
            SubI => {
                self.sublri(rr, mask);
                self.sublri(rr, imm.wrapping_sub(mask));
            }
            SubQ => {
                self.subqri(rr, mask);
                self.subqri(rr, imm.wrapping_sub(mask));
            }
            AndI => {
                self.andlri(rr, (imm & mask) | !mask);
                self.andlri(rr, (imm & !mask) | mask);
            }
            AndQ => {
                self.andqri(rr, (imm & mask) | !mask);
                self.andqri(rr, (imm & !mask) | mask);
            }
            OrI => {
                self.orlri(rr, imm & mask);
                self.orlri(rr, imm & !mask);
            }
            OrQ => {
                self.orqri(rr, imm & mask);
                self.orqri(rr, imm & !mask);
            }
            XorI => {
                self.xorlri(rr, mask);
                self.xorlri(rr, imm ^ mask);
            }
            XorQ => {
                self.xorqri(rr, mask);
                self.xorqri(rr, imm ^ mask);
            }
            _ => unreachable!(),
        }
        if rr != ra {
            self.mr(rr, ra);
        }
        self.end_op_regs(i, rr, ra);
        true
    }

    fn asm_neg_not(&mut self, i: InsId) {
        let (rr, ra) = self.begin_op1_regs(i, GP_REGS);
        if self.lir.ins[i].op == Op::NotI {
            self.notl(rr);
        } else {
            self.negl(rr);
        }
        if rr != ra {
            self.mr(rr, ra);
        }
        self.end_op_regs(i, rr, ra);
    }

    // ─── Shifts ─────────────────────────────────────────────────────────────

    fn asm_shift(&mut self, i: InsId) {
        // Variable shifts want the count in RCX. Immediate shift counts are
        // masked to six bits and therefore never blinded.
        let a = self.lir.ins[i].oprnd1();
        let b = self.lir.ins[i].oprnd2();
        if self.lir.ins[b].is_imm_i() {
            self.asm_shift_imm(i);
            return;
        }

        let (rr, ra);
        if a != b {
            self.find_specific_reg_for(b, RCX);
            let pair = self.begin_op1_regs(i, GP_REGS & !rmask(RCX));
            rr = pair.0;
            ra = pair.1;
        } else {
            // With aliased operands the count and value share RCX; the MR
            // below moves the value in.
            rr = self.prepare_result_reg(i, rmask(RCX));
            ra = if self.is_in_reg(a) { self.get_reg(a) } else { rr };
            debug_assert!(rmask(ra) & GP_REGS != 0);
        }

        use Op::*;
        match self.lir.ins[i].op {
            RshUQ => self.shrq(rr),
            RshQ => self.sarq(rr),
            LshQ => self.shlq(rr),
            RshUI => self.shr(rr),
            RshI => self.sar(rr),
            LshI => self.shl(rr),
            op => panic!("asm_shift on {op:?}"),
        }
        if rr != ra {
            self.mr(rr, ra);
        }
        self.end_op_regs(i, rr, ra);
    }

    fn asm_shift_imm(&mut self, i: InsId) {
        let (rr, ra) = self.begin_op1_regs(i, GP_REGS);
        let b = self.lir.ins[i].oprnd2();
        let shift = self.lir.ins[b].imm_i() & 63;
        use Op::*;
        match self.lir.ins[i].op {
            RshUQ => self.shrqi(rr, shift),
            RshQ => self.sarqi(rr, shift),
            LshQ => self.shlqi(rr, shift),
            RshUI => self.shri(rr, shift),
            RshI => self.sari(rr, shift),
            LshI => self.shli(rr, shift),
            op => panic!("asm_shift_imm on {op:?}"),
        }
        if rr != ra {
            self.mr(rr, ra);
        }
        self.end_op_regs(i, rr, ra);
    }

    // ─── Division ───────────────────────────────────────────────────────────

    /// A lone divi: idiv wants RDX:RAX, result in RAX.
    fn asm_div(&mut self, i: InsId) {
        debug_assert!(self.lir.ins[i].op == Op::DivI);
        let a = self.lir.ins[i].oprnd1();
        let b = self.lir.ins[i].oprnd2();

        self.evict_if_active(RDX);
        self.prepare_result_reg(i, rmask(RAX));

        let rb = self.find_reg_for(b, GP_REGS & !(rmask(RAX) | rmask(RDX)));
        let ra = if self.is_in_reg(a) { self.get_reg(a) } else { RAX };

        // Executed: mov eax, ra; cdq (as mov+sar pair); idiv rb.
        self.idivl(rb);
        self.sari(RDX, 31);
        self.mr(RDX, RAX);
        if RAX != ra {
            self.mr(RAX, ra);
        }

        self.free_resources_of(i);
        if !self.is_in_reg(a) {
            debug_assert!(ra == RAX);
            self.find_specific_reg_for_unallocated(a, RAX);
        }
    }

    /// modi(divi(..)): one idiv produces both quotient (RAX) and remainder
    /// (RDX).
    fn asm_div_mod(&mut self, i: InsId) {
        let div = self.lir.ins[i].oprnd1();
        debug_assert!(self.lir.ins[i].op == Op::ModI);
        assert!(
            self.lir.ins[div].op == Op::DivI,
            "modi must consume a divi"
        );

        let div_l = self.lir.ins[div].oprnd1();
        let div_r = self.lir.ins[div].oprnd2();

        self.prepare_result_reg(i, rmask(RDX));
        self.prepare_result_reg(div, rmask(RAX));

        let r_div_r = self.find_reg_for(div_r, GP_REGS & !(rmask(RAX) | rmask(RDX)));
        let r_div_l = if self.is_in_reg(div_l) {
            self.get_reg(div_l)
        } else {
            RAX
        };

        self.idivl(r_div_r);
        self.sari(RDX, 31);
        self.mr(RDX, RAX);
        if RAX != r_div_l {
            self.mr(RAX, r_div_l);
        }

        self.free_resources_of(i);
        self.free_resources_of(div);
        if !self.is_in_reg(div_l) {
            debug_assert!(r_div_l == RAX);
            self.find_specific_reg_for_unallocated(div_l, RAX);
        }
    }

    // ─── Float arithmetic ───────────────────────────────────────────────────

    fn asm_fop(&mut self, i: InsId) {
        let (rr, ra, rb) = self.begin_op2_regs(i, FP_REGS);
        use Op::*;
        match self.lir.ins[i].op {
            DivD => self.divsd(rr, rb),
            MulD => self.mulsd(rr, rb),
            AddD => self.addsd(rr, rb),
            SubD => self.subsd(rr, rb),
            DivF => self.divss(rr, rb),
            MulF => self.mulss(rr, rb),
            AddF => self.addss(rr, rb),
            SubF => self.subss(rr, rb),
            DivF4 => self.divps(rr, rb),
            MulF4 => self.mulps(rr, rb),
            AddF4 => self.addps(rr, rb),
            SubF4 => self.subps(rr, rb),
            op => panic!("asm_fop on {op:?}"),
        }
        if rr != ra {
            self.asm_nongp_copy(rr, ra);
        }
        self.end_op_regs(i, rr, ra);
    }

    /// Float negation: xorps against a static sign mask.
    fn asm_neg_abs(&mut self, i: InsId) {
        let (rr, ra) = self.begin_op1_regs(i, FP_REGS);
        let op = self.lir.ins[i].op;
        let mask: *const u8 = match op {
            Op::NegF => NEGATE_MASK_F.0.as_ptr() as *const u8,
            Op::NegF4 => NEGATE_MASK_F4.0.as_ptr() as *const u8,
            Op::NegD => NEGATE_MASK_D.0.as_ptr() as *const u8,
            op => panic!("asm_neg_abs on {op:?}"),
        };

        if is_s32(mask as i64) {
            // Mask lives in the low 2GB: absolute addressing.
            self.xorpsa(rr, mask as i32);
        } else if self.is_target_within_s32(mask) {
            self.xorpsm(rr, mask);
        } else {
            // Can't reach the static mask: build it in a temp XMM via a GP.
            let rt = self.alloc_temp_reg(FP_REGS & !(rmask(ra) | rmask(rr)));
            let gt = self.alloc_temp_reg(GP_REGS);
            self.xorps(rr, rt);
            if matches!(op, Op::NegF | Op::NegF4) {
                if op == Op::NegF4 {
                    self.pshufd(rt, rt, pshufd_mask(0, 0, 0, 0));
                }
                self.movdxr(rt, gt);
                self.asm_immi(gt, NEGATE_MASK_F.0[0] as i32, true, false);
            } else {
                self.movqxr(rt, gt);
                self.asm_immq(gt, NEGATE_MASK_D.0[0], true, false);
            }
        }
        if ra != rr {
            self.asm_nongp_copy(rr, ra);
        }
        self.end_op_regs(i, rr, ra);
    }

    // ─── Conversions ────────────────────────────────────────────────────────

    fn asm_q2i(&mut self, i: InsId) {
        let (rr, ra) = self.begin_op1_regs(i, GP_REGS);
        debug_assert!(ra.is_gp());
        // When ra == rr nothing is emitted: the upper 32 bits of a GPR are
        // never assumed zero by 32-bit code paths, so the truncation is free.
        // Widening sites (ui2uq, regarg, stkarg) always extend explicitly.
        if ra != rr {
            self.movlr(rr, ra);
        }
        self.end_op_regs(i, rr, ra);
    }

    fn asm_ui2uq(&mut self, i: InsId) {
        let (rr, ra) = self.begin_op1_regs(i, GP_REGS);
        debug_assert!(ra.is_gp());
        if self.lir.ins[i].op == Op::Ui2Uq {
            // A 32-bit mov zeroes the upper half.
            self.movlr(rr, ra);
        } else {
            self.movsxdr(rr, ra);
        }
        self.end_op_regs(i, rr, ra);
    }

    fn asm_dasq(&mut self, i: InsId) {
        let a = self.lir.ins[i].oprnd1();
        let rr = self.prepare_result_reg(i, GP_REGS);
        let ra = self.find_reg_for(a, FP_REGS);
        self.asm_nongp_copy(rr, ra);
        self.free_resources_of(i);
    }

    fn asm_qasd(&mut self, i: InsId) {
        let a = self.lir.ins[i].oprnd1();
        let rr = self.prepare_result_reg(i, FP_REGS);
        let ra = self.find_reg_for(a, GP_REGS);
        self.asm_nongp_copy(rr, ra);
        self.free_resources_of(i);
    }

    /// Integer-to-float family. cvtsi2* only writes the low lanes of the
    /// target, so an xorps precedes it (in execution order) to break the
    /// false dependency on the old register contents.
    fn asm_int2fp(&mut self, i: InsId) {
        let a = self.lir.ins[i].oprnd1();
        let rr = self.prepare_result_reg(i, FP_REGS);
        let ra = self.find_reg_for(a, GP_REGS);
        match self.lir.ins[i].op {
            Op::I2D => self.cvtsi2sd(rr, ra),
            Op::Q2D => self.cvtsq2sd(rr, ra),
            Op::I2F => self.cvtsi2ss(rr, ra),
            Op::Ui2D => {
                // Zero-extend to 64 bits and convert as a quad; the operand
                // is 32-bit so clobbering its upper half is fine.
                self.cvtsq2sd(rr, ra);
            }
            Op::Ui2F => {
                self.cvtsq2ss(rr, ra);
            }
            op => panic!("asm_int2fp on {op:?}"),
        }
        self.xorps(rr, rr);
        if matches!(self.lir.ins[i].op, Op::Ui2D | Op::Ui2F) {
            self.movlr(ra, ra);
        }
        self.free_resources_of(i);
    }

    fn asm_fp2int(&mut self, i: InsId) {
        let a = self.lir.ins[i].oprnd1();
        let rr = self.prepare_result_reg(i, GP_REGS);
        let rb = self.find_reg_for(a, FP_REGS);
        if self.lir.ins[i].op == Op::F2I {
            self.cvttss2si(rr, rb);
        } else {
            self.cvttsd2si(rr, rb);
        }
        self.free_resources_of(i);
    }

    fn asm_fp2fp(&mut self, i: InsId) {
        let a = self.lir.ins[i].oprnd1();
        let rr = self.prepare_result_reg(i, FP_REGS);
        let ra = self.find_reg_for(a, FP_REGS);
        if self.lir.ins[i].op == Op::F2D {
            self.cvtss2sd(rr, ra);
        } else {
            self.cvtsd2ss(rr, ra);
        }
        self.xorps(rr, rr);
        self.free_resources_of(i);
    }

    fn asm_f2f4(&mut self, i: InsId) {
        let a = self.lir.ins[i].oprnd1();
        let rr = self.prepare_result_reg(i, FP_REGS);
        let rb = self.find_reg_for(a, FP_REGS);
        self.pshufd(rr, rb, pshufd_mask(0, 0, 0, 0));
        self.free_resources_of(i);
    }

    /// Build a vector from four scalars with unpack shuffles. A temp is
    /// needed because input registers must not be modified.
    fn asm_ffff2f4(&mut self, i: InsId) {
        let (x, y, z, w) = match self.lir.ins[i].payload {
            Payload::F4Parts { x, y, z, w } => (x, y, z, w),
            _ => unreachable!(),
        };
        let rr = self.prepare_result_reg(i, FP_REGS);
        let rt = self.alloc_temp_reg(FP_REGS & !rmask(rr));
        self.unpcklps(rr, rt); // x y z w
        let rw = self.find_reg_for(w, FP_REGS & !(rmask(rt) | rmask(rr)));
        self.unpcklps(rt, rw); // y w y w
        let ry = self.find_reg_for(y, FP_REGS & !(rmask(rt) | rmask(rr)));
        self.movapsr(rt, ry);
        let rz = self.find_reg_for(z, FP_REGS & !rmask(rr));
        self.unpcklps(rr, rz); // x z x z
        self.free_resources_of(i);
        let rx = if self.is_in_reg(x) {
            self.find_reg_for(x, FP_REGS)
        } else {
            self.find_specific_reg_for_unallocated(x, rr);
            rr
        };
        if rx != rr {
            self.movapsr(rr, rx);
        }
    }

    fn asm_f4comp(&mut self, i: InsId) {
        let (a, swz_mask) = match self.lir.ins[i].payload {
            Payload::Swz { a, mask } => (a, Some(mask)),
            Payload::Un(a) => (a, None),
            _ => unreachable!(),
        };
        let rr = self.prepare_result_reg(i, FP_REGS);
        let rb = self.find_reg_for(a, FP_REGS);
        match self.lir.ins[i].op {
            Op::F4X => self.pshufd(rr, rb, pshufd_mask(0, 0, 0, 0)),
            Op::F4Y => self.pshufd(rr, rb, pshufd_mask(1, 1, 1, 1)),
            Op::F4Z => self.pshufd(rr, rb, pshufd_mask(2, 2, 2, 2)),
            Op::F4W => self.pshufd(rr, rb, pshufd_mask(3, 3, 3, 3)),
            Op::SwzF4 => self.pshufd(rr, rb, swz_mask.unwrap()),
            op => panic!("asm_f4comp on {op:?}"),
        }
        self.free_resources_of(i);
    }

    // ─── Comparisons ────────────────────────────────────────────────────────

    /// Emit the flag-producing compare for a condition. Must be the last
    /// thing emitted for the consumer (nothing between it and the consumer
    /// may touch EFLAGS).
    fn asm_cmp(&mut self, cond: InsId) {
        let ins = &self.lir.ins[cond];
        if ins.op == Op::EqF4 {
            self.asm_cmpf4(cond);
        } else if ins.is_cmp_d() || ins.is_cmp_f() {
            self.asm_cmpd(cond);
        } else {
            self.asm_cmpi(cond);
        }
    }

    fn asm_cmpi(&mut self, cond: InsId) {
        let b = self.lir.ins[cond].oprnd2();
        let bi = &self.lir.ins[b];
        if is_imm32(bi)
            && !(bi.is_tainted() && self.config.blinding && blind::should_blind32(get_imm32(bi)))
        {
            self.asm_cmpi_imm(cond);
            return;
        }
        let a = self.lir.ins[cond].oprnd1();
        let (ra, rb) = if a != b {
            self.find_reg_for2(GP_REGS, a, GP_REGS, b)
        } else {
            let r = self.find_reg_for(a, GP_REGS);
            (r, r)
        };
        if self.lir.ins[cond].is_cmp_q() {
            self.cmpqr(ra, rb);
        } else {
            self.cmplr(ra, rb);
        }
    }

    fn asm_cmpi_imm(&mut self, cond: InsId) {
        let a = self.lir.ins[cond].oprnd1();
        let b = self.lir.ins[cond].oprnd2();
        let ra = self.find_reg_for(a, GP_REGS);
        let imm = get_imm32(&self.lir.ins[b]);
        if self.lir.ins[cond].is_cmp_q() {
            if is_s8(imm as i64) {
                self.cmpqr8(ra, imm);
            } else {
                self.cmpqri(ra, imm);
            }
        } else if is_s8(imm as i64) {
            self.cmplr8(ra, imm);
        } else {
            self.cmplri(ra, imm);
        }
    }

    /// Unordered float compare. `lt` and `le` are rewritten as swapped `gt`
    /// and `ge` so consumers only need the above/below condition codes.
    fn asm_cmpd(&mut self, cond: InsId) {
        let ins = &self.lir.ins[cond];
        let single = ins.is_cmp_f();
        let op = d_opcode(ins.op);
        let mut a = ins.oprnd1();
        let mut b = ins.oprnd2();
        if matches!(op, Op::LtD | Op::LeD) {
            std::mem::swap(&mut a, &mut b);
        }
        let (ra, rb) = self.find_reg_for2(FP_REGS, a, FP_REGS, b);
        if single {
            self.ucomiss(ra, rb);
        } else {
            self.ucomisd(ra, rb);
        }
    }

    /// 4-lane equality: cmpneqps leaves a nonzero lane mask iff any lane
    /// differs; pmovmskb + cmp reduce it to ZF.
    fn asm_cmpf4(&mut self, cond: InsId) {
        debug_assert!(self.lir.ins[cond].op == Op::EqF4);
        let a = self.lir.ins[cond].oprnd1();
        let b = self.lir.ins[cond].oprnd2();

        let gt = self.alloc_temp_reg(GP_REGS);
        self.cmplr8(gt, 0);
        let rt = self.alloc_temp_reg(FP_REGS);
        self.pmovmskb(gt, rt);
        let (ra, rb) = self.find_reg_for2(FP_REGS & !rmask(rt), a, FP_REGS & !rmask(rt), b);
        self.cmpneqps(rt, rb);
        if ra != rt {
            self.asm_nongp_copy(rt, ra);
        }
    }

    // ─── Condition to boolean ───────────────────────────────────────────────

    fn asm_cond(&mut self, i: InsId) {
        let r = self.prepare_result_reg(i, GP_REGS);
        // setcc writes 8 bits; extend afterwards.
        self.movzx8(r, r);
        self.setcc(cc_of(self.lir.ins[i].op), r);
        self.free_resources_of(i);
        self.asm_cmpi(i);
    }

    fn asm_condd(&mut self, i: InsId) {
        let op = d_opcode(self.lir.ins[i].op);
        if op == Op::EqD {
            // Equal iff ZF & !PF (parity flags NaN). The flag logic needs a
            // high-byte register, so only rax..rbx are allowed.
            let allow = rmask(RAX) | rmask(RCX) | rmask(RDX) | rmask(RBX);
            let r = self.prepare_result_reg(i, allow);
            self.movzx8(r, r);
            self.and8r_hi(r);
            self.setnp_hi(r);
            self.sete_lo(r);
        } else {
            let r = self.prepare_result_reg(i, GP_REGS);
            self.movzx8(r, r);
            match op {
                // lt/le arrive swapped from asm_cmpd
                Op::LtD | Op::GtD => self.setcc(Cc::A, r),
                Op::LeD | Op::GeD => self.setcc(Cc::Ae, r),
                _ => panic!("asm_condd on {op:?}"),
            }
        }
        self.free_resources_of(i);
        self.asm_cmpd(i);
    }

    fn asm_condf4(&mut self, i: InsId) {
        debug_assert!(self.lir.ins[i].op == Op::EqF4);
        let r = self.prepare_result_reg(i, GP_REGS);
        self.movzx8(r, r);
        self.setcc(Cc::E, r);
        self.free_resources_of(i);
        self.asm_cmpf4(i);
    }

    // ─── Branches ───────────────────────────────────────────────────────────

    pub(crate) fn asm_branch(
        &mut self,
        on_false: bool,
        cond: InsId,
        target: Option<*mut u8>,
    ) -> Branches {
        let branches = self.asm_branch_helper(on_false, cond, target);
        self.asm_cmp(cond);
        branches
    }

    fn asm_branch_helper(
        &mut self,
        on_false: bool,
        cond: InsId,
        target: Option<*mut u8>,
    ) -> Branches {
        let ins = &self.lir.ins[cond];
        if ins.is_cmp_d() || ins.is_cmp_f() {
            return self.asm_branchd_helper(on_false, cond, target);
        }

        let cc = cc_of(self.lir.ins[cond].op);
        let cc = if on_false { cc.negate() } else { cc };
        match target {
            Some(t) if self.is_target_within_s8(t) => {
                self.jcc8(cc, 8, t);
                Branches::one(self.cursor())
            }
            Some(t) if self.is_target_within_s32(t) => {
                self.jcc(cc, 8, Some(t));
                Branches::one(self.cursor())
            }
            _ => {
                // Beyond 32-bit reach (or unknown): invert over a 64-bit
                // unconditional jump.
                self.underrun_protect(22);
                let skip = self.cursor();
                self.jmp64(16, target);
                let patch = self.cursor();
                self.jcc8(cc.negate(), 8, skip);
                Branches::one(patch)
            }
        }
    }

    /// Unordered float branches. `eqd` needs both a parity and an equality
    /// leg, so two patch locations can come back.
    fn asm_branchd_helper(
        &mut self,
        on_false: bool,
        cond: InsId,
        target: Option<*mut u8>,
    ) -> Branches {
        let op = d_opcode(self.lir.ins[cond].op);
        let mut b = Branches::default();
        if op == Op::EqD {
            if on_false {
                // branch if unordered or not-equal
                self.underrun_protect(14);
                if let Some(t) = target.filter(|&t| self.is_target_within_s32(t)) {
                    self.jcc(Cc::P, 8, Some(t));
                    b.patch1 = Some(self.cursor());
                    self.jcc(Cc::Ne, 8, Some(t));
                    b.patch2 = Some(self.cursor());
                } else {
                    self.underrun_protect(38);
                    let skip1 = self.cursor();
                    self.jmp64(16, target);
                    b.patch1 = Some(self.cursor());
                    self.jcc8(Cc::Np, 8, skip1);
                    let skip2 = self.cursor();
                    self.jmp64(16, target);
                    b.patch2 = Some(self.cursor());
                    self.jcc8(Cc::E, 8, skip2);
                }
            } else {
                self.underrun_protect(14);
                if let Some(t) = target.filter(|&t| self.is_target_within_s32(t)) {
                    let skip = self.cursor();
                    self.jcc(Cc::E, 8, Some(t));
                    b.patch1 = Some(self.cursor());
                    self.jcc8(Cc::P, 8, skip);
                } else {
                    self.underrun_protect(28);
                    let skip = self.cursor();
                    self.jmp64(16, target);
                    b.patch1 = Some(self.cursor());
                    self.jcc8(Cc::Ne, 8, skip);
                    self.jcc8(Cc::P, 8, skip);
                }
            }
            return b;
        }

        // lt/gt and le/ge share cases because asm_cmpd swaps lt into gt.
        let cc = match op {
            Op::LtD | Op::GtD => {
                if on_false {
                    Cc::Be
                } else {
                    Cc::A
                }
            }
            Op::LeD | Op::GeD => {
                if on_false {
                    Cc::B
                } else {
                    Cc::Ae
                }
            }
            op => panic!("asm_branchd on {op:?}"),
        };
        match target {
            Some(t) if self.is_target_within_s32(t) => {
                self.jcc(cc, 8, Some(t));
                b.patch1 = Some(self.cursor());
            }
            _ => {
                self.underrun_protect(22);
                let skip = self.cursor();
                self.jmp64(16, target);
                b.patch1 = Some(self.cursor());
                self.jcc8(cc.negate(), 8, skip);
            }
        }
        b
    }

    /// Overflow branch for the jov arithmetic forms.
    fn asm_branch_ov(&mut self, target: Option<*mut u8>) -> *mut u8 {
        match target {
            Some(t) if self.is_target_within_s8(t) => {
                self.jcc8(Cc::O, 8, t);
                self.cursor()
            }
            Some(t) if self.is_target_within_s32(t) => {
                self.jcc(Cc::O, 8, Some(t));
                self.cursor()
            }
            _ => {
                self.underrun_protect(22);
                let skip = self.cursor();
                self.jmp64(16, target);
                let patch = self.cursor();
                self.jcc8(Cc::No, 8, skip);
                patch
            }
        }
    }

    fn asm_jov(&mut self, i: InsId) {
        let target = match self.lir.ins[i].payload {
            Payload::JovBranch { target, .. } => target,
            _ => unreachable!(),
        };
        let taddr = self.label_addr.get(&target).copied();
        let patch = self.asm_branch_ov(taddr);
        if taddr.is_none() {
            self.pending_labels.entry(target).or_default().push(patch);
        }
        self.asm_arith(i);
    }

    // ─── Conditional move ───────────────────────────────────────────────────

    fn asm_cmov(&mut self, i: InsId) {
        let (cond, iftrue, iffalse) = match self.lir.ins[i].payload {
            Payload::Cmov {
                cond,
                iftrue,
                iffalse,
            } => (cond, iftrue, iffalse),
            _ => unreachable!(),
        };
        debug_assert!(self.lir.ins[cond].is_cmp());

        let is_float = matches!(self.lir.ins[i].ty, Ty::D | Ty::F | Ty::F4);
        let allow = if is_float { FP_REGS } else { GP_REGS };
        let rr = self.prepare_result_reg(i, allow);
        let rf = self.find_reg_for(iffalse, allow & !rmask(rr));

        if is_float {
            // No fp cmov: branch over a register copy instead. Executed:
            // cmp; j<cond> past-copy; movaps rr, rf.
            let target = self.cursor();
            self.asm_nongp_copy(rr, rf);
            self.asm_branch_helper(false, cond, Some(target));
            let rt = if self.is_in_reg(iftrue) {
                self.get_reg(iftrue)
            } else {
                rr
            };
            if rr != rt {
                self.asm_nongp_copy(rr, rt);
            }
            self.free_resources_of(i);
            if !self.is_in_reg(iftrue) {
                debug_assert!(rt == rr);
                self.find_specific_reg_for_unallocated(iftrue, rr);
            }
            self.asm_cmp(cond);
            return;
        }

        let rt = if self.is_in_reg(iftrue) {
            self.get_reg(iftrue)
        } else {
            rr
        };

        // Nothing between the cmov emission and the asm_cmpi below may write
        // EFLAGS; the register moves used here are all flag-neutral.
        let cc = cc_of(self.lir.ins[cond].op).negate();
        if self.lir.ins[i].op == Op::CmovI {
            self.cmov(cc, rr, rf);
        } else {
            debug_assert!(self.lir.ins[i].op == Op::CmovQ);
            self.cmovq(cc, rr, rf);
        }
        if rr != rt {
            self.mr(rr, rt);
        }

        self.free_resources_of(i);
        if !self.is_in_reg(iftrue) {
            debug_assert!(rt == rr);
            self.find_specific_reg_for_unallocated(iftrue, rr);
        }

        self.asm_cmpi(cond);
    }

    // ─── Memory access ──────────────────────────────────────────────────────

    /// Base register for a memory operand; stack regions address straight
    /// off the frame pointer.
    fn get_base_reg(&mut self, base: InsId, d: &mut i32, allow: RegisterMask) -> Register {
        if self.lir.ins[base].op == Op::Alloc {
            let rd = self.find_mem_for(base);
            *d += rd;
            FP
        } else {
            self.find_reg_for(base, allow)
        }
    }

    /// Base register with displacement blinding: for a tainted access the
    /// displacement is shifted by the process offset and the base rebuilt in
    /// a temporary held live only for this one access.
    fn get_base_reg_with_blinding(
        &mut self,
        base: InsId,
        d: &mut i32,
        allow: RegisterMask,
        tainted: bool,
        force: bool,
    ) -> (Register, Option<(Register, i32)>) {
        let want = self.config.blinding
            && (force || (tainted && blind::should_blind32(*d)))
            && self.lir.ins[base].op != Op::Alloc;
        if !want {
            return (self.get_base_reg(base, d, allow), None);
        }
        let ob = self.find_reg_for(base, allow & BASE_REGS);
        let t = self.alloc_temp_reg(allow & BASE_REGS & !rmask(ob));
        let off = blind::disp_offset();
        *d = d.wrapping_sub(off);
        (t, Some((ob, off)))
    }

    /// Emit the base rebuild for a blinded access; executes just before it.
    fn adjust_base_reg_for_blinding(&mut self, rb: Register, orig: Option<(Register, i32)>) {
        if let Some((ob, off)) = orig {
            self.leaqrm(rb, off, ob);
        }
    }

    /// Value and base registers for a register store.
    fn get_base_reg2_with_blinding(
        &mut self,
        allow_value: RegisterMask,
        value: InsId,
        allow_base: RegisterMask,
        base: InsId,
        d: &mut i32,
        tainted: bool,
        force: bool,
    ) -> (Register, Register, Option<(Register, i32)>) {
        let rv = self.find_reg_for(value, allow_value);
        let (rb, orig) =
            self.get_base_reg_with_blinding(base, d, allow_base & !rmask(rv), tainted, force);
        (rv, rb, orig)
    }

    /// Register setup for loads. Pairs with `end_load_regs`. The result is
    /// allocated before the base so a blinding temporary never overlaps it.
    fn begin_load_regs(
        &mut self,
        i: InsId,
        allow: RegisterMask,
    ) -> (Register, i32, Register, Option<(Register, i32)>) {
        let mut d = self.lir.ins[i].disp();
        let base = self.lir.ins[i].oprnd1();
        let tainted = self.lir.ins[i].is_tainted();
        let rr = self.prepare_result_reg(i, allow);
        let (rb, orig) =
            self.get_base_reg_with_blinding(base, &mut d, BASE_REGS & !rmask(rr), tainted, false);
        (rr, d, rb, orig)
    }

    fn end_load_regs(&mut self, i: InsId, rb: Register, orig: Option<(Register, i32)>) {
        self.adjust_base_reg_for_blinding(rb, orig);
        self.free_resources_of(i);
    }

    fn asm_load32(&mut self, i: InsId) {
        debug_assert!(self.lir.ins[i].is_i());
        let (r, d, b, orig) = self.begin_load_regs(i, GP_REGS);
        match self.lir.ins[i].op {
            Op::LdUc2Ui => self.movzx8m(r, d, b),
            Op::LdUs2Ui => self.movzx16m(r, d, b),
            Op::LdI => self.movlrm(r, d, b),
            Op::LdC2I => self.movsx8m(r, d, b),
            Op::LdS2I => self.movsx16m(r, d, b),
            op => panic!("asm_load32 on {op:?}"),
        }
        self.end_load_regs(i, b, orig);
    }

    fn asm_load64(&mut self, i: InsId) {
        match self.lir.ins[i].op {
            Op::LdQ => {
                let (r, d, b, orig) = self.begin_load_regs(i, GP_REGS);
                self.movqrm(r, d, b);
                self.end_load_regs(i, b, orig);
            }
            Op::LdD => {
                let (r, d, b, orig) = self.begin_load_regs(i, FP_REGS);
                self.movsdrm(r, d, b);
                self.end_load_regs(i, b, orig);
            }
            Op::LdF => {
                let (r, d, b, orig) = self.begin_load_regs(i, FP_REGS);
                self.movssrm(r, d, b);
                self.end_load_regs(i, b, orig);
            }
            Op::LdF2D => {
                let (r, d, b, orig) = self.begin_load_regs(i, FP_REGS);
                self.cvtss2sd(r, r);
                self.movssrm(r, d, b);
                self.end_load_regs(i, b, orig);
            }
            op => panic!("asm_load64 on {op:?}"),
        }
    }

    fn asm_load128(&mut self, i: InsId) {
        debug_assert!(self.lir.ins[i].op == Op::LdF4);
        let (r, d, b, orig) = self.begin_load_regs(i, FP_REGS);
        self.movupsrm(r, d, b);
        self.end_load_regs(i, b, orig);
    }

    fn asm_store32(&mut self, i: InsId) {
        let (value, base, mut d) = match self.lir.ins[i].payload {
            Payload::Store { val, base, disp } => (val, base, disp),
            _ => unreachable!(),
        };
        let op = self.lir.ins[i].op;
        let tainted = self.lir.ins[i].is_tainted();
        let vi = &self.lir.ins[value];

        if vi.is_imm_i()
            && !(vi.is_tainted() && self.config.blinding && blind::should_blind32(vi.imm_i()))
        {
            // Tainted store with an unblinded immediate: blind the
            // displacement instead, for a one-instruction net cost.
            let force = tainted;
            let c = vi.imm_i();
            let (rb, orig) =
                self.get_base_reg_with_blinding(base, &mut d, BASE_REGS, tainted, force);
            match op {
                Op::StI2C => self.movbmi(rb, d, c),
                Op::StI2S => self.movsmi(rb, d, c),
                Op::StI => self.movlmi(rb, d, c),
                op => panic!("asm_store32 on {op:?}"),
            }
            self.adjust_base_reg_for_blinding(rb, orig);
        } else {
            // Byte stores must avoid the registers whose no-REX encodings
            // alias AH..BH.
            let src_regs = if op == Op::StI2C {
                SINGLE_BYTE_STORE_REGS
            } else {
                GP_REGS
            };
            debug_assert!(self.lir.ins[value].is_i());
            let r = self.find_reg_for(value, src_regs);
            let (rb, orig) = self.get_base_reg_with_blinding(
                base,
                &mut d,
                BASE_REGS & !rmask(r),
                tainted,
                false,
            );
            match op {
                Op::StI2C => self.movbmr(r, d, rb),
                Op::StI2S => self.movsmr(r, d, rb),
                Op::StI => self.movlmr(r, d, rb),
                op => panic!("asm_store32 on {op:?}"),
            }
            self.adjust_base_reg_for_blinding(rb, orig);
        }
    }

    fn asm_store64(&mut self, i: InsId) {
        let (value, base, mut d) = match self.lir.ins[i].payload {
            Payload::Store { val, base, disp } => (val, base, disp),
            _ => unreachable!(),
        };
        let op = self.lir.ins[i].op;
        let tainted = self.lir.ins[i].is_tainted();
        match op {
            Op::StQ => {
                let vi = &self.lir.ins[value];
                if vi.is_imm_q()
                    && is_s32(vi.imm_q() as i64)
                    && !(vi.is_tainted()
                        && self.config.blinding
                        && blind::should_blind64(vi.imm_q()))
                {
                    let force = tainted;
                    let c = vi.imm_q() as i32;
                    let (rb, orig) =
                        self.get_base_reg_with_blinding(base, &mut d, BASE_REGS, tainted, force);
                    // The imm32 sign-extends to 64 bits.
                    self.movqmi(rb, d, c);
                    self.adjust_base_reg_for_blinding(rb, orig);
                } else {
                    let (rr, rb, orig) = self.get_base_reg2_with_blinding(
                        GP_REGS, value, BASE_REGS, base, &mut d, tainted, false,
                    );
                    self.movqmr(rr, d, rb);
                    self.adjust_base_reg_for_blinding(rb, orig);
                }
            }
            Op::StD => {
                let r = self.find_reg_for(value, FP_REGS);
                let (rb, orig) =
                    self.get_base_reg_with_blinding(base, &mut d, BASE_REGS, tainted, false);
                self.movsdmr(r, d, rb);
                self.adjust_base_reg_for_blinding(rb, orig);
            }
            Op::StF => {
                let r = self.find_reg_for(value, FP_REGS);
                let (rb, orig) =
                    self.get_base_reg_with_blinding(base, &mut d, BASE_REGS, tainted, false);
                self.movssmr(r, d, rb);
                self.adjust_base_reg_for_blinding(rb, orig);
            }
            Op::StD2F => {
                let r = self.find_reg_for(value, FP_REGS);
                let (rb, orig) =
                    self.get_base_reg_with_blinding(base, &mut d, BASE_REGS, tainted, false);
                let t = self.alloc_temp_reg(FP_REGS & !rmask(r));
                // Executed: xorps t,t; cvtsd2ss t, r; movss [rb+d], t.
                self.movssmr(t, d, rb);
                self.cvtsd2ss(t, r);
                self.xorps(t, t);
                self.adjust_base_reg_for_blinding(rb, orig);
            }
            op => panic!("asm_store64 on {op:?}"),
        }
    }

    fn asm_store128(&mut self, i: InsId) {
        let (value, base, mut d) = match self.lir.ins[i].payload {
            Payload::Store { val, base, disp } => (val, base, disp),
            _ => unreachable!(),
        };
        debug_assert!(self.lir.ins[i].op == Op::StF4);
        let tainted = self.lir.ins[i].is_tainted();
        // XMM sources are disjoint from base registers, so no exclusion.
        let r = self.find_reg_for(value, FP_REGS);
        let (rb, orig) = self.get_base_reg_with_blinding(base, &mut d, BASE_REGS, tainted, false);
        self.movupsmr(r, d, rb);
        self.adjust_base_reg_for_blinding(rb, orig);
    }

    // ─── Immediates ─────────────────────────────────────────────────────────

    fn asm_imm_ins(&mut self, i: InsId) {
        let ins = &self.lir.ins[i];
        let blind_it = ins.is_tainted() && self.config.blinding;
        match ins.payload {
            Payload::ImmI(v) => {
                let rr = self.prepare_result_reg(i, GP_REGS);
                self.asm_immi(rr, v, true, blind_it);
            }
            Payload::ImmQ(v) => {
                let rr = self.prepare_result_reg(i, GP_REGS);
                self.asm_immq(rr, v, true, blind_it);
            }
            Payload::ImmD(v) => {
                let rr = self.prepare_result_reg(i, FP_REGS);
                self.asm_immd(rr, v, true, blind_it);
            }
            Payload::ImmF(v) => {
                let rr = self.prepare_result_reg(i, FP_REGS);
                self.asm_immf(rr, v, true, blind_it);
            }
            Payload::ImmF4(v) => {
                let rr = self.prepare_result_reg(i, FP_REGS);
                self.asm_immf4(rr, v, true, blind_it);
            }
            _ => unreachable!(),
        }
        self.free_resources_of(i);
    }

    /// Materialize a 32-bit constant. `can_clobber_ccs` gates both the
    /// xor-zero idiom and blinding (whose xor also writes flags).
    pub(crate) fn asm_immi(&mut self, r: Register, v: i32, can_clobber_ccs: bool, blind_it: bool) {
        debug_assert!(r.is_gp());
        if v == 0 && can_clobber_ccs {
            self.xorrr(r, r);
        } else if blind_it && blind::should_blind32(v) {
            debug_assert!(can_clobber_ccs);
            let mask = blind::mask32() as i32;
            // Executed: mov r, v^mask; xor r, mask.
            self.xorlri(r, mask);
            self.movi(r, v ^ mask);
        } else {
            self.movi(r, v);
        }
    }

    pub(crate) fn asm_immq(&mut self, r: Register, v: u64, can_clobber_ccs: bool, blind_it: bool) {
        debug_assert!(r.is_gp());
        if v == v as u32 as u64 {
            self.asm_immi(r, v as i32, can_clobber_ccs, blind_it);
        } else if is_s32(v as i64) {
            // Sign-extendable 32-bit form.
            if blind_it && blind::should_blind32(v as i32) {
                debug_assert!(can_clobber_ccs);
                let mask = blind::mask32() as i32;
                let t = self.alloc_temp_reg(GP_REGS & !rmask(r));
                // Executed: mov r, v^mask; mov t, mask; xor r, t.
                self.xorqrr(r, t);
                self.movqi32(t, mask);
                self.movqi32(r, v as i32 ^ mask);
            } else {
                self.movqi32(r, v as i32);
            }
        } else if !(blind_it && blind::should_blind64(v))
            && self.is_target_within_s32(v as usize as *const u8)
        {
            // The value is an address within ±2GB of the code: lea off RIP.
            // Never for blinded constants, since the code address may be
            // known to an attacker.
            let d = (v as i64 - self.cursor() as i64) as i32;
            self.learip(r, d);
        } else if blind_it && blind::should_blind64(v) {
            debug_assert!(can_clobber_ccs);
            let mask = blind::mask64();
            let t = self.alloc_temp_reg(GP_REGS & !rmask(r));
            self.xorqrr(r, t);
            self.movqi(t, mask);
            self.movqi(r, v ^ mask);
        } else {
            self.movqi(r, v);
        }
    }

    /// Doubles route through a GP scratch; there is no direct imm64-to-XMM
    /// move.
    pub(crate) fn asm_immd(&mut self, r: Register, v: u64, can_clobber_ccs: bool, blind_it: bool) {
        debug_assert!(r.is_fp());
        if v == 0 && can_clobber_ccs {
            self.xorps(r, r);
        } else {
            let rt = self.alloc_temp_reg(GP_REGS);
            self.movqxr(r, rt);
            self.asm_immq(rt, v, can_clobber_ccs, blind_it);
        }
    }

    pub(crate) fn asm_immf(&mut self, r: Register, v: u32, can_clobber_ccs: bool, blind_it: bool) {
        debug_assert!(r.is_fp());
        if v == 0 && can_clobber_ccs {
            self.xorps(r, r);
        } else {
            let rt = self.alloc_temp_reg(GP_REGS);
            self.movdxr(r, rt);
            self.asm_immi(rt, v as i32, can_clobber_ccs, blind_it);
        }
    }

    /// Vector literals come from the pool: RIP-relative when reachable
    /// (aligned slots get movaps), else through a scratch pointer.
    pub(crate) fn asm_immf4(
        &mut self,
        r: Register,
        v: [f32; 4],
        can_clobber_ccs: bool,
        blind_it: bool,
    ) {
        debug_assert!(r.is_fp());
        let bits: [u32; 4] = [
            v[0].to_bits(),
            v[1].to_bits(),
            v[2].to_bits(),
            v[3].to_bits(),
        ];
        let lo = (bits[0] as u64) | (bits[1] as u64) << 32;
        let hi = (bits[2] as u64) | (bits[3] as u64) << 32;
        if lo == 0 && hi == 0 && can_clobber_ccs {
            self.xorps(r, r);
        } else if hi == 0 && !blind_it {
            self.asm_immd(r, lo, can_clobber_ccs, false);
        } else {
            let vaddr = self.pool.find_f4(v);
            let aligned = (vaddr as usize) & 0xf == 0;
            // The load makes room for its displacement plus a full-size op,
            // so the reach test must cover 12 bytes, not 8.
            if self.is_target_within_s32_max(vaddr, 12) {
                let d = (vaddr as i64 - self.cursor() as i64) as i32;
                if aligned {
                    self.movapsrm_rip(r, d);
                } else {
                    self.movupsrm_rip(r, d);
                }
            } else {
                // base-legal temp: RSP/R12 encodings would need a SIB
                let gp = self.alloc_temp_reg(BASE_REGS);
                if aligned {
                    self.movapsrm(r, 0, gp);
                } else {
                    self.movupsrm(r, 0, gp);
                }
                self.asm_immq(gp, vaddr as u64, can_clobber_ccs, false);
            }
        }
    }

    // ─── Register copies across classes ─────────────────────────────────────

    pub(crate) fn asm_nongp_copy(&mut self, d: Register, s: Register) {
        if d.is_gp() && s.is_fp() {
            self.movqrx(d, s);
        } else if d.is_fp() && s.is_fp() {
            // movaps, not movsd: movsd reg,reg merges and stalls.
            self.movapsr(d, s);
        } else {
            debug_assert!(d.is_fp() && s.is_gp());
            self.movqxr(d, s);
        }
    }

    // ─── Calls ──────────────────────────────────────────────────────────────

    fn asm_call(&mut self, i: InsId) {
        let (sig_id, args) = match &self.lir.ins[i].payload {
            Payload::Call { sig, args } => (*sig, args.clone()),
            _ => unreachable!(),
        };
        let ret = self.lir.ins[i].ty;

        if ret != Ty::V {
            let rr = match ret {
                Ty::D | Ty::F | Ty::F4 => XMM0,
                _ => RAX,
            };
            self.prepare_result_reg(i, rmask(rr));
            self.evict_scratch_regs_except(rmask(rr));
        } else {
            self.evict_scratch_regs_except(0);
        }

        let sig = self.lir.sigs[sig_id].clone();
        let mut arg_types: Vec<ArgTy> = sig.args.clone();
        let mut arg_ids = args;

        if !sig.indirect {
            let target = sig.addr as *mut u8;
            if self.is_target_within_s32(target) {
                self.call(8, target);
            } else {
                // Out of rel32 range: load the address and call through RAX.
                self.callrax();
                self.asm_immq(RAX, sig.addr as u64, true, false);
            }
            // Free now so the argument setup can reuse the result register.
            self.free_resources_of(i);
        } else {
            // Indirect target rides in RAX: unused for arguments and
            // clobbered by the call anyway.
            self.callrax();
            self.free_resources_of(i);
            let addr_arg = arg_ids.pop().expect("indirect call without target arg");
            arg_types.pop();
            self.asm_regarg(ArgTy::Q, addr_arg, RAX);
        }

        let mut stk_used: i32 = SHADOW_SPACE;
        let mut arg_index: usize = 0;
        #[cfg(not(windows))]
        let mut fr = 0u8;
        let argc = arg_ids.len();
        for j in 0..argc {
            let ty = arg_types[j];
            let arg = arg_ids[j];
            #[cfg(windows)]
            {
                if arg_index < ARG_REGS.len() {
                    match ty {
                        ArgTy::I | ArgTy::UI | ArgTy::Q => {
                            self.asm_regarg(ty, arg, ARG_REGS[arg_index]);
                        }
                        ArgTy::D | ArgTy::F => {
                            // Windows picks the XMM register by slot index.
                            self.asm_regarg(ty, arg, xmm(arg_index as u8));
                        }
                        ArgTy::F4 => {
                            // float4 goes by pointer in the GP slot.
                            self.asm_ptrarg(arg, ARG_REGS[arg_index]);
                        }
                    }
                    arg_index += 1;
                } else {
                    self.asm_stkarg(ty, arg, stk_used);
                    stk_used += 8;
                }
            }
            #[cfg(not(windows))]
            {
                let gp_arg = matches!(ty, ArgTy::I | ArgTy::UI | ArgTy::Q);
                if gp_arg && arg_index < ARG_REGS.len() {
                    self.asm_regarg(ty, arg, ARG_REGS[arg_index]);
                    arg_index += 1;
                } else if !gp_arg && fr < NUM_FP_ARG_REGS {
                    self.asm_regarg(ty, arg, xmm(fr));
                    fr += 1;
                } else {
                    self.asm_stkarg(ty, arg, stk_used);
                    // float4 overflow slots hold a pointer to the value.
                    stk_used += 8;
                }
            }
        }

        if stk_used > self.max_stk_used {
            self.max_stk_used = stk_used;
        }
    }

    fn asm_regarg(&mut self, ty: ArgTy, p: InsId, r: Register) {
        let pi = &self.lir.ins[p];
        match ty {
            ArgTy::I => {
                debug_assert!(pi.is_i());
                if pi.is_imm_i() {
                    let v = pi.imm_i() as i64 as u64;
                    let t = pi.is_tainted() && self.config.blinding;
                    self.asm_immq(r, v, true, t);
                    return;
                }
                // Executed after the value lands in r: widen in place.
                self.movsxdr(r, r);
            }
            ArgTy::UI => {
                debug_assert!(pi.is_i());
                if pi.is_imm_i() {
                    let v = pi.imm_i() as u32 as u64;
                    let t = pi.is_tainted() && self.config.blinding;
                    self.asm_immq(r, v, true, t);
                    return;
                }
                self.movlr(r, r);
            }
            _ => {}
        }
        // No point folding other immediates here: reserving the register
        // makes the restore path rematerialize the constant right next to
        // the call anyway, with more scheduling freedom for the cpu.
        self.find_specific_reg_for(p, r);
    }

    fn asm_stkarg(&mut self, ty: ArgTy, p: InsId, stk_off: i32) {
        debug_assert!(is_s8(stk_off as i64));
        match ty {
            ArgTy::I | ArgTy::UI | ArgTy::Q => {
                let r = self.find_reg_for(p, GP_REGS);
                self.movqspr(stk_off, r);
                if ty == ArgTy::I {
                    self.movsxdr(r, r);
                } else if ty == ArgTy::UI {
                    self.movlr(r, r);
                }
            }
            ArgTy::D => {
                let r = self.find_reg_for(p, FP_REGS);
                self.movsdspr(r, stk_off);
            }
            ArgTy::F => {
                let r = self.find_reg_for(p, FP_REGS);
                self.movssspr(r, stk_off);
            }
            ArgTy::F4 => {
                // The stack slot takes a pointer to the vector.
                let r = self.alloc_temp_reg(GP_REGS);
                self.movqspr(stk_off, r);
                self.asm_ptrarg(p, r);
            }
        }
    }

    /// Pass a float4 by pointer: literals point into the pool, everything
    /// else points at its spill slot.
    fn asm_ptrarg(&mut self, p: InsId, r: Register) {
        debug_assert!(r.is_gp());
        if self.lir.ins[p].is_imm_f4() {
            // Pool loads need no blinding.
            let v = self.lir.ins[p].imm_f4();
            let vaddr = self.pool.find_f4(v);
            if self.is_target_within_s32(vaddr) {
                let d = (vaddr as i64 - self.cursor() as i64) as i32;
                self.learip(r, d);
            } else {
                self.movqi(r, vaddr as u64);
            }
        } else {
            let d = self.find_mem_for(p);
            self.leaqrm(r, d, FP);
        }
    }

    // ─── Params, allocas, return ────────────────────────────────────────────

    fn asm_param(&mut self, i: InsId) {
        let a = self.lir.ins[i].param_arg() as usize;
        match self.lir.ins[i].param_kind() {
            ParamKind::Arg => {
                if a < ARG_REGS.len() {
                    // Incoming argument already sits in its register.
                    self.prepare_result_reg(i, rmask(ARG_REGS[a]));
                } else {
                    // Stack-passed incoming args are beyond this back end.
                    self.set_error(AssmError::UnsupportedOp);
                }
            }
            ParamKind::Saved => {
                if a < SAVED_REGS.len() {
                    self.prepare_result_reg(i, rmask(SAVED_REGS[a]));
                } else {
                    self.set_error(AssmError::UnsupportedOp);
                }
            }
        }
        self.free_resources_of(i);
    }

    fn asm_alloc(&mut self, i: InsId) {
        // The region's address is FP-relative; if downstream wanted it in a
        // register, build it here at the definition.
        if self.is_in_reg(i) {
            let r = self.get_reg(i);
            let d = self.find_mem_for(i);
            self.leaqrm(r, d, FP);
        }
        self.free_resources_of(i);
    }

    fn asm_ret(&mut self, i: InsId) {
        let value = match self.lir.ins[i].payload {
            Payload::Ret(v) => v,
            _ => unreachable!(),
        };
        self.gen_epilogue();
        // Undo the prologue's stack reservation.
        self.mr(RSP, FP);
        self.release_registers();
        self.assign_saved_regs();
        let r = match self.lir.ins[value].ty {
            Ty::D | Ty::F | Ty::F4 => XMM0,
            _ => RAX,
        };
        self.find_specific_reg_for(value, r);
    }

    // ─── Labels, jumps, tables ──────────────────────────────────────────────

    /// Bind a label: evict everything so every entry to this address sees
    /// values in their slots, then resolve branches that were waiting.
    fn asm_label(&mut self, i: InsId) {
        let l = match self.lir.ins[i].payload {
            Payload::Label(l) => l,
            _ => unreachable!(),
        };
        self.evict_all_active();
        let addr = self.cursor();
        self.label_addr.insert(l, addr);
        if let Some(patches) = self.pending_labels.remove(&l) {
            for p in patches {
                self.n_patch_branch(p, addr);
            }
        }
    }

    fn asm_branch_to_label(&mut self, i: InsId) {
        let (cond, target) = match self.lir.ins[i].payload {
            Payload::Branch { cond, target } => (cond, target),
            _ => unreachable!(),
        };
        let taddr = self.label_addr.get(&target).copied();
        match cond {
            None => {
                if taddr.is_some() {
                    self.jmp(taddr);
                } else {
                    // Unknown (backward) target: stay patchable.
                    self.jmpl(None);
                    let patch = self.cursor();
                    self.pending_labels.entry(target).or_default().push(patch);
                }
            }
            Some(c) => {
                let on_false = self.lir.ins[i].op == Op::Jf;
                let branches = self.asm_branch(on_false, c, taddr);
                if taddr.is_none() {
                    let pend = self.pending_labels.entry(target).or_default();
                    pend.extend(branches.patch1);
                    pend.extend(branches.patch2);
                }
            }
        }
    }

    /// Indexed jump through an 8-byte-entry table. Targets must be already
    /// bound labels (tables only jump forward in the trace).
    fn asm_jtbl(&mut self, i: InsId) {
        let (index, targets) = match &self.lir.ins[i].payload {
            Payload::Jtbl { index, targets } => (*index, targets.clone()),
            _ => unreachable!(),
        };
        let mut table: Vec<usize> = Vec::with_capacity(targets.len());
        for t in &targets {
            match self.label_addr.get(t) {
                Some(addr) => table.push(*addr as usize),
                None => {
                    self.set_error(AssmError::UnsupportedOp);
                    return;
                }
            }
        }
        let table = self.jump_tables_push(table);
        let indexreg = self.find_reg_for(index, GP_REGS);
        if is_s32(table as i64) {
            self.jmpx(indexreg, table as i32);
        } else {
            // Keep R13 out: its encoding as a SIB base in mod=00 means
            // disp32, not register.
            let tablereg = self.alloc_temp_reg(GP_REGS & !(rmask(indexreg) | rmask(R13)));
            self.jmpxb(indexreg, tablereg);
            self.asm_immq(tablereg, table as u64, true, false);
        }
    }

    // ─── Guards and fragment exits ──────────────────────────────────────────

    fn asm_guard(&mut self, i: InsId) {
        let (cond, exit) = match self.lir.ins[i].payload {
            Payload::Guard { cond, exit } => (cond, exit),
            _ => unreachable!(),
        };
        let at = match self.asm_exit(exit) {
            Ok(at) => at,
            Err(e) => {
                self.set_error(e);
                return;
            }
        };
        match self.lir.ins[i].op {
            Op::X => self.jmp(Some(at)),
            Op::Xt => {
                self.asm_branch(false, cond.unwrap(), Some(at));
            }
            Op::Xf => {
                self.asm_branch(true, cond.unwrap(), Some(at));
            }
            _ => unreachable!(),
        }
    }

    /// Compile the side-exit stub in the exit stream and return its address.
    fn asm_exit(&mut self, exit: ExitId) -> Result<*mut u8, AssmError> {
        self.swap_code_chunks()?;
        let at = self.n_frag_exit(exit);
        self.swap_code_chunks()?;
        Ok(at)
    }

    /// Exit stub: jump straight to a known fragment entry, or through the
    /// guard record's patch slot to the shared epilogue, with RAX carrying
    /// the guard record pointer.
    fn n_frag_exit(&mut self, exit: ExitId) -> *mut u8 {
        let target = self.lir.exits[exit].target;
        let mut lr: u64 = 0;
        match target {
            Some(t) => {
                self.jmp(Some(t as *mut u8));
            }
            None => {
                if self.epilogue.is_none() {
                    let epi = self.gen_epilogue();
                    self.epilogue = Some(epi);
                }
                let epi = self.epilogue;
                self.jmpl(epi);
                let jmp = self.cursor();
                let rec = &mut self.guard_records[exit.index()];
                rec.jmp = jmp;
                lr = &**rec as *const _ as u64;
            }
        }
        self.mr(RSP, RBP);
        self.asm_immq(RAX, lr, true, false);
        self.cursor()
    }

    // ─── Prologue / epilogue ────────────────────────────────────────────────

    fn gen_prologue(&mut self) -> *mut u8 {
        // Activation-record entries are 4 bytes each.
        let stack_needed = self.max_stk_used as u32 + self.ar.words_used() * 4;
        let stack_pushed = 8 + 8; // return address + saved rbp
        let aligned = (stack_needed + stack_pushed).div_ceil(STACK_ALIGN) * STACK_ALIGN;
        let amt = aligned - stack_pushed;

        #[cfg(windows)]
        {
            // Windows commits stack through a single guard page; touch every
            // page of the new frame in growth order so the OS keeps up. The
            // probes come out in reverse order of execution.
            let page = crate::codemem::page_size() as u32;
            debug_assert!(page.is_power_of_two());
            let page_rounded = amt & !(page - 1);
            let mut d = page_rounded as i32;
            while d > 0 {
                self.movlmi(RBP, -d, 0);
                d -= page as i32;
            }
        }

        if amt != 0 {
            if is_s8(amt as i64) {
                self.subqr8(RSP, amt as i32);
            } else {
                self.subqri(RSP, amt as i32);
            }
        }

        // Fragment-to-fragment control transfers land here, past the frame
        // setup, reusing the caller fragment's frame.
        self.patch_entry = self.cursor();
        self.mr(FP, RSP); // establish our frame pointer
        self.pushr(FP); // save the caller's
        self.cursor()
    }

    pub(crate) fn gen_epilogue(&mut self) -> *mut u8 {
        self.ret();
        self.popr(RBP);
        self.cursor()
    }

    // ─── Branch patching ────────────────────────────────────────────────────

    /// Redirect a recorded branch. Recognizes the three patchable shapes:
    /// `jmp rel32`, `jcc rel32`, and the `jmp [rip+0]` + absolute trampoline.
    pub(crate) fn n_patch_branch(&mut self, patch: *mut u8, target: *mut u8) {
        if let Err(e) = patch_branch_at(patch, target) {
            self.set_error(e);
        }
    }
}

fn pshufd_mask(x: u8, y: u8, z: u8, w: u8) -> u8 {
    debug_assert!(x <= 3 && y <= 3 && z <= 3 && w <= 3);
    x | y << 2 | z << 4 | w << 6
}

/// Map a single-precision comparison opcode onto its double twin; the branch
/// and setcc logic is identical.
fn d_opcode(op: Op) -> Op {
    match op {
        Op::EqF => Op::EqD,
        Op::LtF => Op::LtD,
        Op::GtF => Op::GtD,
        Op::LeF => Op::LeD,
        Op::GeF => Op::GeD,
        other => other,
    }
}

/// The raw patching primitive, shared with post-handoff patching. Applying
/// the same target twice is a no-op the second time.
pub(crate) fn patch_branch_at(patch: *mut u8, target: *mut u8) -> Result<(), AssmError> {
    unsafe {
        let b0 = patch.read();
        let b1 = patch.add(1).read();
        let next: *mut u8;
        if b0 == 0xe9 {
            next = patch.add(5);
        } else if b0 == 0x0f && (b1 & 0xf0) == 0x80 {
            next = patch.add(6);
        } else if b0 == 0xff && b1 == 0x25 {
            // jmp [rip+0]: the eight bytes after the instruction hold the
            // absolute target.
            next = patch.add(6);
            std::ptr::write_unaligned(next as *mut u64, target as u64);
            return Ok(());
        } else {
            return Err(AssmError::UnsupportedOp);
        }
        let rel = target as i64 - next as i64;
        if !is_s32(rel) {
            return Err(AssmError::BranchTooFar);
        }
        std::ptr::write_unaligned(next.sub(4) as *mut i32, rel as i32);
    }
    Ok(())
}
