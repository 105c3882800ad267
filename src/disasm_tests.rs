//! Round-trip checks against an independent disassembler.
//!
//! Every mnemonic the back end emits must decode, through yaxpeax, to the
//! expected opcode and operands. Structural checks (opcode identity, operand
//! registers, displacements by byte comparison) are preferred over exact
//! format strings so the tests don't track the disassembler's printing.

use yaxpeax_arch::{Decoder, LengthedInstruction, U8Reader};
use yaxpeax_x86::amd64::{InstDecoder, Instruction, Opcode};

use crate::asm::Assembler;
use crate::lir::{Lir, Op, ParamKind};
use crate::regs::*;
use crate::{compile, Cc, Config};

/// Decode the whole buffer, panicking on any undecodable byte.
fn decode_all(code: &[u8]) -> Vec<Instruction> {
    let decoder = InstDecoder::default();
    let mut reader = U8Reader::new(code);
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        match decoder.decode(&mut reader) {
            Ok(inst) => {
                offset += inst.len().to_const() as usize;
                out.push(inst);
            }
            Err(e) => panic!("undecodable byte at offset {offset:#x}: {e} (in {code:02x?})"),
        }
    }
    out
}

fn emitted(asm: &Assembler<'_>) -> Vec<u8> {
    let len = asm.frag_end as usize - asm.n_ins as usize;
    unsafe { std::slice::from_raw_parts(asm.n_ins, len).to_vec() }
}

fn fresh(lir: &Lir) -> Assembler<'_> {
    let mut asm = Assembler::new(lir, Config::default());
    asm.native_page_setup().unwrap();
    asm
}

#[test]
fn every_gp_load_form_decodes_to_mov() {
    // All destination registers, all legal bases, representative
    // displacements spanning the disp8/disp32 split.
    let lir = Lir::new();
    for rnum in 0..16u8 {
        let r = Register(rnum);
        for bnum in 0..16u8 {
            let b = Register(bnum);
            // RSP and R12 need a SIB byte and are not base-encodable here.
            if b == RSP || b == R12 {
                continue;
            }
            for d in [0i32, 1, 127, 128, -128, -129, 0x1234_5678, i32::MIN] {
                let mut asm = fresh(&lir);
                asm.movqrm(r, d, b);
                let insts = decode_all(&emitted(&asm));
                assert_eq!(insts.len(), 1);
                assert_eq!(insts[0].opcode(), Opcode::MOV);
                let text = insts[0].to_string();
                assert!(
                    text.contains(name_q(r)) && text.contains(name_q(b)),
                    "bad operands in {text:?} for r={r} b={b} d={d}"
                );
            }
        }
    }
}

#[test]
fn alu_rr_forms_decode() {
    let lir = Lir::new();
    let cases: &[(for<'a, 'b> fn(&'a mut Assembler<'b>, Register, Register), Opcode)] = &[
        (|asm, l, r| Assembler::addrr(asm, l, r), Opcode::ADD),
        (|asm, l, r| Assembler::subrr(asm, l, r), Opcode::SUB),
        (|asm, l, r| Assembler::andrr(asm, l, r), Opcode::AND),
        (|asm, l, r| Assembler::orrr(asm, l, r), Opcode::OR),
        (|asm, l, r| Assembler::xorrr(asm, l, r), Opcode::XOR),
        (|asm, l, r| Assembler::cmplr(asm, l, r), Opcode::CMP),
        (|asm, l, r| Assembler::movlr(asm, l, r), Opcode::MOV),
        (|asm, l, r| Assembler::addqrr(asm, l, r), Opcode::ADD),
        (|asm, l, r| Assembler::subqrr(asm, l, r), Opcode::SUB),
        (|asm, l, r| Assembler::cmpqr(asm, l, r), Opcode::CMP),
        (|asm, l, r| Assembler::imulrr(asm, l, r), Opcode::IMUL),
    ];
    for &(emit, opcode) in cases {
        for l in [RAX, RCX, RSI, R8, R12, R15] {
            for r in [RAX, RDX, RDI, R9, R13] {
                let mut asm = fresh(&lir);
                emit(&mut asm, l, r);
                let insts = decode_all(&emitted(&asm));
                assert_eq!(insts.len(), 1, "{opcode:?} {l} {r}");
                assert_eq!(insts[0].opcode(), opcode, "{l} {r}");
            }
        }
    }
}

#[test]
fn alu_imm_forms_decode_with_both_widths() {
    let lir = Lir::new();
    for (imm, label) in [(7i32, "imm8"), (0x12345i32, "imm32")] {
        let mut asm = fresh(&lir);
        if label == "imm8" {
            asm.addlr8(R10, imm);
        } else {
            asm.addlri(R10, imm);
        }
        let insts = decode_all(&emitted(&asm));
        assert_eq!(insts.len(), 1);
        assert_eq!(insts[0].opcode(), Opcode::ADD);
        let text = insts[0].to_string();
        assert!(text.contains("r10"), "{text}");
    }
}

#[test]
fn shifts_and_unaries_decode() {
    let lir = Lir::new();
    let mut asm = fresh(&lir);
    // reverse program order: written last, executed first
    asm.idivl(RSI);
    asm.negl(RBX);
    asm.notl(R11);
    asm.sarqi(RDX, 17);
    asm.shli(RCX, 3);
    asm.shrq(RAX);
    let insts = decode_all(&emitted(&asm));
    let ops: Vec<Opcode> = insts.iter().map(|i| i.opcode()).collect();
    assert_eq!(
        ops,
        [
            Opcode::SHR,
            Opcode::SHL,
            Opcode::SAR,
            Opcode::NOT,
            Opcode::NEG,
            Opcode::IDIV
        ]
    );
}

#[test]
fn sse_arith_and_moves_decode() {
    let lir = Lir::new();
    let mut asm = fresh(&lir);
    asm.movupsmr(xmm(2), 64, RSI);
    asm.movsdrm(xmm(9), -8, RDI);
    asm.cvtsi2sd(XMM0, RAX);
    asm.ucomisd(XMM1, xmm(3));
    asm.mulps(xmm(4), xmm(5));
    asm.addsd(XMM0, XMM1);
    let insts = decode_all(&emitted(&asm));
    let ops: Vec<Opcode> = insts.iter().map(|i| i.opcode()).collect();
    assert_eq!(
        ops,
        [
            Opcode::ADDSD,
            Opcode::MULPS,
            Opcode::UCOMISD,
            Opcode::CVTSI2SD,
            Opcode::MOVSD,
            Opcode::MOVUPS
        ]
    );
}

#[test]
fn setcc_cmov_all_conditions_decode() {
    let lir = Lir::new();
    for cc in [
        Cc::O,
        Cc::No,
        Cc::B,
        Cc::Ae,
        Cc::E,
        Cc::Ne,
        Cc::Be,
        Cc::A,
        Cc::S,
        Cc::Ns,
        Cc::P,
        Cc::Np,
        Cc::L,
        Cc::Ge,
        Cc::Le,
        Cc::G,
    ] {
        let mut asm = fresh(&lir);
        asm.cmovq(cc, RAX, R9);
        asm.cmov(cc, RBX, RDX);
        asm.setcc(cc, RSI);
        let code = emitted(&asm);
        // the condition nibble must land in each opcode byte
        assert_eq!(code[2], 0x90 | cc as u8, "setcc nibble, cc={}", cc.name());
        let insts = decode_all(&code);
        assert_eq!(insts.len(), 3, "cc={}", cc.name());
        // setcc first in memory (emitted last), then the two cmovs
        assert!(insts[0].to_string().starts_with("set"), "{}", insts[0]);
        for inst in &insts[1..] {
            assert!(inst.to_string().starts_with("cmov"), "{inst}");
        }
    }
}

#[test]
fn branch_forms_decode_and_reach() {
    let lir = Lir::new();
    let mut asm = fresh(&lir);
    asm.ret();
    let near = asm.cursor();
    // near target: 2-byte form
    asm.jcc8(Cc::E, 8, near);
    let short_len = asm.frag_end as usize - asm.cursor() as usize;
    assert_eq!(short_len, 2 + 1);
    // long form: 6 bytes
    asm.jcc(Cc::Ne, 8, Some(near));
    let code = emitted(&asm);
    // memory order: jcc rel32 (0f 85), jcc rel8 (74), ret
    assert_eq!(&code[..2], &[0x0f, 0x85]);
    assert_eq!(code[6], 0x74);
    let insts = decode_all(&code);
    assert_eq!(insts.len(), 3);
    assert_eq!(insts[2].opcode(), Opcode::RETURN);
}

#[test]
fn whole_fragment_decodes_cleanly() {
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let p1 = lir.param(1, ParamKind::Arg);
    let k = lir.imm_i(10);
    let t1 = lir.bin(Op::MulI, p0, k);
    let t2 = lir.bin(Op::AddI, t1, p1);
    let c = lir.bin(Op::GtI, t2, k);
    let sel = lir.cmov(crate::lir::CmovTy::I, c, t2, k);
    lir.ret(sel);
    let frag = compile(&lir, Config::default()).unwrap();
    let insts = decode_all(frag.code());
    assert!(insts.iter().any(|i| i.opcode() == Opcode::RETURN));
    // flags must survive between the cmp and the cmov: no flag-writing
    // instruction may sit between them
    let ops: Vec<Opcode> = insts.iter().map(|i| i.opcode()).collect();
    let cmp = ops.iter().position(|&o| o == Opcode::CMP).expect("no cmp");
    let cmov = ops[cmp..]
        .iter()
        .position(|o| format!("{o:?}").starts_with("CMOV"))
        .map(|i| i + cmp)
        .expect("no cmov after cmp");
    for &o in &ops[cmp + 1..cmov] {
        assert!(
            matches!(o, Opcode::MOV | Opcode::LEA),
            "flag-writing {o:?} between cmp and cmov"
        );
    }
}

#[test]
fn store_immediate_matches_expected_bytes() {
    // st32(imm 0x11223344 untainted, base = arg0, disp 16)
    // → mov dword [rdi+0x10], 0x11223344
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let v = lir.imm_i(0x11223344);
    lir.store(Op::StI, v, p0, 16);
    let z = lir.imm_i(0);
    lir.ret(z);
    let frag = compile(&lir, Config::default()).unwrap();
    let code = frag.code();
    let expect = [0xc7, 0x47, 0x10, 0x44, 0x33, 0x22, 0x11];
    assert!(
        code.windows(expect.len()).any(|w| w == expect),
        "store bytes missing in {code:02x?}"
    );
}

#[test]
fn pushstate_popstate_and_counter_decode() {
    let lir = Lir::new();
    let mut asm = fresh(&lir);
    let ctr = 0u32;
    asm.asm_popstate();
    asm.asm_inc_m32(&ctr);
    asm.asm_pushstate();
    let insts = decode_all(&emitted(&asm));
    let pushes = insts.iter().filter(|i| i.opcode() == Opcode::PUSH).count();
    let pops = insts.iter().filter(|i| i.opcode() == Opcode::POP).count();
    // 16 state slots each way, plus the counter bump's RAX spill pair.
    assert_eq!(pushes, 17);
    assert_eq!(pops, 17);
    assert!(insts.iter().any(|i| i.opcode() == Opcode::INC));
}

#[test]
fn div_sequence_matches_idiom() {
    // divi(arg0, arg1) → mov eax, edi; cdq-equivalent; idiv esi
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let p1 = lir.param(1, ParamKind::Arg);
    let q = lir.bin(Op::DivI, p0, p1);
    lir.ret(q);
    let frag = compile(&lir, Config::default()).unwrap();
    let insts = decode_all(frag.code());
    let ops: Vec<Opcode> = insts.iter().map(|i| i.opcode()).collect();
    let idiv = ops.iter().position(|&o| o == Opcode::IDIV).expect("idiv");
    // the sign-extension of edx precedes the divide
    assert!(ops[..idiv].contains(&Opcode::SAR));
}
