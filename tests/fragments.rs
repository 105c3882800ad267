//! End-to-end: build a trace, compile it, run the machine code.

use strix::lir::{ArgTy, CallSig, CmovTy, Lir, Op, ParamKind, SideExit, Ty};
use strix::{compile, Config};

fn run1(lir: &Lir, a: i64) -> i64 {
    let frag = compile(lir, Config::default()).unwrap();
    let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(frag.entry()) };
    f(a)
}

fn run2(lir: &Lir, a: i64, b: i64) -> i64 {
    let frag = compile(lir, Config::default()).unwrap();
    let f: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(frag.entry()) };
    f(a, b)
}

#[test]
fn arith_chain() {
    // (a*10 + b) ^ 0x3c
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let p1 = lir.param(1, ParamKind::Arg);
    let a = lir.un(Op::Q2I, p0);
    let b = lir.un(Op::Q2I, p1);
    let k10 = lir.imm_i(10);
    let t1 = lir.bin(Op::MulI, a, k10);
    let t2 = lir.bin(Op::AddI, t1, b);
    let k = lir.imm_i(0x3c);
    let t3 = lir.bin(Op::XorI, t2, k);
    lir.ret(t3);
    assert_eq!(run2(&lir, 3, 4) as i32, (3 * 10 + 4) ^ 0x3c);
    assert_eq!(run2(&lir, -2, 1) as i32, (-2 * 10 + 1) ^ 0x3c);
}

#[test]
fn blinded_arith_still_adds() {
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let a = lir.un(Op::Q2I, p0);
    let k = lir.imm_i(0x11223344);
    lir.set_tainted(k);
    let sum = lir.bin(Op::AddI, a, k);
    lir.ret(sum);

    let frag = compile(&lir, Config::default()).unwrap();
    let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(frag.entry()) };
    assert_eq!(f(1) as i32, 0x11223345);
    assert_eq!(f(-1) as i32, 0x11223343);
    // The raw constant must not appear in the instruction stream.
    let needle = 0x11223344i32.to_le_bytes();
    assert!(
        !frag.code().windows(4).any(|w| w == needle),
        "blinded constant leaked into code"
    );
}

#[test]
fn blinded_imm64_materialization() {
    let v: u64 = 0xdead_beef_1122_3344;
    let mut lir = Lir::new();
    let k = lir.imm_q(v);
    lir.set_tainted(k);
    lir.ret(k);

    let frag = compile(&lir, Config::default()).unwrap();
    let f: extern "C" fn() -> u64 = unsafe { std::mem::transmute(frag.entry()) };
    assert_eq!(f(), v);
    let needle = v.to_le_bytes();
    assert!(!frag.code().windows(8).any(|w| w == needle));
}

#[test]
fn untainted_imm_is_not_blinded() {
    let mut lir = Lir::new();
    let k = lir.imm_q(0x1122_3344_5566_7788);
    lir.ret(k);
    let frag = compile(&lir, Config::default()).unwrap();
    let f: extern "C" fn() -> u64 = unsafe { std::mem::transmute(frag.entry()) };
    assert_eq!(f(), 0x1122_3344_5566_7788);
    let needle = 0x1122_3344_5566_7788u64.to_le_bytes();
    assert!(frag.code().windows(8).any(|w| w == needle));
}

#[test]
fn division_and_remainder() {
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let p1 = lir.param(1, ParamKind::Arg);
    let a = lir.un(Op::Q2I, p0);
    let b = lir.un(Op::Q2I, p1);
    let q = lir.bin(Op::DivI, a, b);
    lir.ret(q);
    assert_eq!(run2(&lir, 7, 3) as i32, 2);
    assert_eq!(run2(&lir, -7, 3) as i32, -2);

    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let p1 = lir.param(1, ParamKind::Arg);
    let a = lir.un(Op::Q2I, p0);
    let b = lir.un(Op::Q2I, p1);
    let q = lir.bin(Op::DivI, a, b);
    let m = lir.un(Op::ModI, q);
    lir.ret(m);
    assert_eq!(run2(&lir, 7, 3) as i32, 1);
    assert_eq!(run2(&lir, -7, 3) as i32, -1);
    assert_eq!(run2(&lir, 6, 3) as i32, 0);
}

#[test]
fn shifts_variable_and_immediate() {
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let p1 = lir.param(1, ParamKind::Arg);
    let a = lir.un(Op::Q2I, p0);
    let n = lir.un(Op::Q2I, p1);
    let t = lir.bin(Op::LshI, a, n);
    lir.ret(t);
    assert_eq!(run2(&lir, 1, 4) as i32, 16);
    assert_eq!(run2(&lir, 3, 0) as i32, 3);

    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let a = lir.un(Op::Q2I, p0);
    let k = lir.imm_i(3);
    let t = lir.bin(Op::RshI, a, k);
    lir.ret(t);
    assert_eq!(run1(&lir, -64) as i32, -8);
}

#[test]
fn signed_and_unsigned_compare_to_bool() {
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let p1 = lir.param(1, ParamKind::Arg);
    let a = lir.un(Op::Q2I, p0);
    let b = lir.un(Op::Q2I, p1);
    let c = lir.bin(Op::LtI, a, b);
    lir.ret(c);
    assert_eq!(run2(&lir, -1, 0) as i32, 1);
    assert_eq!(run2(&lir, 0, -1) as i32, 0);

    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let p1 = lir.param(1, ParamKind::Arg);
    let a = lir.un(Op::Q2I, p0);
    let b = lir.un(Op::Q2I, p1);
    let c = lir.bin(Op::LtUI, a, b);
    lir.ret(c);
    // -1 as unsigned is huge
    assert_eq!(run2(&lir, -1, 0) as i32, 0);
    assert_eq!(run2(&lir, 0, -1) as i32, 1);
}

#[test]
fn cmov_selects_without_branching() {
    // max(a, b)
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let p1 = lir.param(1, ParamKind::Arg);
    let a = lir.un(Op::Q2I, p0);
    let b = lir.un(Op::Q2I, p1);
    let c = lir.bin(Op::GtI, a, b);
    let m = lir.cmov(CmovTy::I, c, a, b);
    lir.ret(m);
    assert_eq!(run2(&lir, 3, 9) as i32, 9);
    assert_eq!(run2(&lir, 9, 3) as i32, 9);
    assert_eq!(run2(&lir, -5, -9) as i32, -5);
}

#[test]
fn memory_roundtrip_through_scratch() {
    // *p = a as i32 (truncated); reload widened; byte store on top
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg); // pointer
    let p1 = lir.param(1, ParamKind::Arg); // value
    let v = lir.un(Op::Q2I, p1);
    lir.store(Op::StI, v, p0, 0);
    let x = lir.load(Op::LdI, p0, 0);
    lir.ret(x);
    let frag = compile(&lir, Config::default()).unwrap();
    let f: extern "C" fn(*mut i32, i64) -> i64 = unsafe { std::mem::transmute(frag.entry()) };
    let mut cell = 0i32;
    assert_eq!(f(&mut cell, 0x7654_3210), 0x7654_3210);
    assert_eq!(cell, 0x7654_3210);
}

#[test]
fn narrow_loads_extend_correctly() {
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let lo = lir.load(Op::LdC2I, p0, 0); // sign-extending byte load
    let hi = lir.load(Op::LdUc2Ui, p0, 1); // zero-extending byte load
    let k8 = lir.imm_i(8);
    let hi_shifted = lir.bin(Op::LshI, hi, k8);
    let both = lir.bin(Op::OrI, lo, hi_shifted);
    lir.ret(both);
    let frag = compile(&lir, Config::default()).unwrap();
    let f: extern "C" fn(*const u8) -> i64 = unsafe { std::mem::transmute(frag.entry()) };
    let data = [0x80u8, 0xff];
    // lo = -128 sign-extended, hi = 255 zero-extended then shifted
    assert_eq!(f(data.as_ptr()) as i32, (-128i32) | (0xff << 8));
}

#[test]
fn tainted_store_blinds_displacement() {
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let v = lir.imm_i(0x0102_0304);
    let st = lir.store(Op::StI, v, p0, 0x0010_0000);
    lir.set_tainted(st);
    let z = lir.imm_i(0);
    lir.ret(z);
    let frag = compile(&lir, Config::default()).unwrap();
    let f: extern "C" fn(*mut u8) -> i64 = unsafe { std::mem::transmute(frag.entry()) };
    let mut buf = vec![0u8; 0x0010_0004];
    f(buf.as_mut_ptr());
    assert_eq!(
        i32::from_le_bytes(buf[0x0010_0000..].try_into().unwrap()),
        0x0102_0304
    );
    // The raw displacement must not appear in the code stream.
    let needle = 0x0010_0000i32.to_le_bytes();
    assert!(
        !frag.code().windows(4).any(|w| w == needle),
        "tainted displacement leaked"
    );
}

#[test]
fn double_arithmetic_and_conversion() {
    // (double)a * 2.5 + (double)b
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let p1 = lir.param(1, ParamKind::Arg);
    let ai = lir.un(Op::Q2I, p0);
    let bi = lir.un(Op::Q2I, p1);
    let a = lir.un(Op::I2D, ai);
    let b = lir.un(Op::I2D, bi);
    let k = lir.imm_d(2.5);
    let t = lir.bin(Op::MulD, a, k);
    let s = lir.bin(Op::AddD, t, b);
    lir.ret(s);
    let frag = compile(&lir, Config::default()).unwrap();
    let f: extern "C" fn(i64, i64) -> f64 = unsafe { std::mem::transmute(frag.entry()) };
    assert_eq!(f(4, 3), 13.0);
    assert_eq!(f(-2, 1), -4.0);
}

#[test]
fn float_compare_handles_nan() {
    // a < b as unordered compare: NaN must come out false
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let p1 = lir.param(1, ParamKind::Arg);
    let a = lir.un(Op::QasD, p0);
    let b = lir.un(Op::QasD, p1);
    let c = lir.bin(Op::LtD, a, b);
    lir.ret(c);
    let frag = compile(&lir, Config::default()).unwrap();
    let f: extern "C" fn(u64, u64) -> i64 = unsafe { std::mem::transmute(frag.entry()) };
    let bits = f64::to_bits;
    assert_eq!(f(bits(1.0), bits(2.0)) as i32, 1);
    assert_eq!(f(bits(2.0), bits(1.0)) as i32, 0);
    assert_eq!(f(bits(f64::NAN), bits(1.0)) as i32, 0);
    assert_eq!(f(bits(1.0), bits(f64::NAN)) as i32, 0);
}

#[test]
fn double_equality_excludes_nan() {
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let p1 = lir.param(1, ParamKind::Arg);
    let a = lir.un(Op::QasD, p0);
    let b = lir.un(Op::QasD, p1);
    let c = lir.bin(Op::EqD, a, b);
    lir.ret(c);
    let frag = compile(&lir, Config::default()).unwrap();
    let f: extern "C" fn(u64, u64) -> i64 = unsafe { std::mem::transmute(frag.entry()) };
    let bits = f64::to_bits;
    assert_eq!(f(bits(2.0), bits(2.0)) as i32, 1);
    assert_eq!(f(bits(2.0), bits(3.0)) as i32, 0);
    assert_eq!(f(bits(f64::NAN), bits(f64::NAN)) as i32, 0);
}

#[test]
fn backward_branch_makes_a_loop() {
    // sum 1..=n by counting down through stack cells
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let counter = lir.alloc(4);
    let acc = lir.alloc(4);
    let n = lir.un(Op::Q2I, p0);
    lir.store(Op::StI, n, counter, 0);
    let zero = lir.imm_i(0);
    lir.store(Op::StI, zero, acc, 0);
    let top = lir.label();
    let c = lir.load(Op::LdI, counter, 0);
    let a = lir.load(Op::LdI, acc, 0);
    let a2 = lir.bin(Op::AddI, a, c);
    lir.store(Op::StI, a2, acc, 0);
    let one = lir.imm_i(1);
    let c2 = lir.bin(Op::SubI, c, one);
    lir.store(Op::StI, c2, counter, 0);
    let zero2 = lir.imm_i(0);
    let more = lir.bin(Op::GtI, c2, zero2);
    lir.jt(more, top);
    let out = lir.load(Op::LdI, acc, 0);
    lir.ret(out);

    assert_eq!(run1(&lir, 5) as i32, 15);
    assert_eq!(run1(&lir, 1) as i32, 1);
    assert_eq!(run1(&lir, 100) as i32, 5050);
}

#[test]
fn forward_branch_skips_code() {
    // r = if a != 0 { 7 } else { 13 }, as a default store plus a skipped
    // overwrite
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let cell = lir.alloc(4);
    let a = lir.un(Op::Q2I, p0);
    let thirteen = lir.imm_i(13);
    lir.store(Op::StI, thirteen, cell, 0);
    let zero = lir.imm_i(0);
    let c = lir.bin(Op::EqI, a, zero);
    let end = lir.new_label();
    lir.jt(c, end);
    let seven = lir.imm_i(7);
    lir.store(Op::StI, seven, cell, 0);
    lir.bind_label(end);
    let out = lir.load(Op::LdI, cell, 0);
    lir.ret(out);

    assert_eq!(run1(&lir, 5) as i32, 7);
    assert_eq!(run1(&lir, 0) as i32, 13);
}

#[test]
fn guard_exit_returns_record_and_patches() {
    // trace: return x unless x == 42, in which case the guard fires
    let mut lir = Lir::new();
    let exit = lir.exit(SideExit::default());
    let p0 = lir.param(0, ParamKind::Arg);
    let x = lir.un(Op::Q2I, p0);
    let k = lir.imm_i(42);
    let c = lir.bin(Op::EqI, x, k);
    lir.xt(c, exit);
    lir.ret(x);

    let frag = compile(&lir, Config::default()).unwrap();
    let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(frag.entry()) };
    assert_eq!(f(7) as i32, 7);

    // Guard taken: RAX carries the guard record pointer.
    let rec = frag.guard_record(0);
    let rec_addr = rec as *const _ as i64;
    assert!(!rec.jmp.is_null());
    assert_eq!(f(42), rec_addr);

    // Patch the exit into a second fragment; entry past its frame setup so
    // the first fragment's frame is reused.
    let mut lir2 = Lir::new();
    let k99 = lir2.imm_i(99);
    lir2.ret(k99);
    let frag2 = compile(&lir2, Config::default()).unwrap();

    let jmp = frag.guard_record(0).jmp;
    let mut frag = frag;
    frag.patch_branch(jmp, frag2.patch_entry()).unwrap();
    assert_eq!(f(42) as i32, 99);
    // Patching twice with the same target is a no-op.
    frag.patch_branch(jmp, frag2.patch_entry()).unwrap();
    assert_eq!(f(42) as i32, 99);
    assert_eq!(f(7) as i32, 7);
}

extern "C" fn add3(a: i64, b: i64, c: i64) -> i64 {
    a.wrapping_add(b).wrapping_add(c)
}

extern "C" fn scale(a: f64, k: f64) -> f64 {
    a * k
}

#[test]
fn call_with_gp_arguments() {
    let mut lir = Lir::new();
    let sig = lir.sig(CallSig {
        addr: add3 as usize,
        indirect: false,
        ret: Ty::Q,
        args: vec![ArgTy::Q, ArgTy::Q, ArgTy::Q],
    });
    let p0 = lir.param(0, ParamKind::Arg);
    let p1 = lir.param(1, ParamKind::Arg);
    let k = lir.imm_q(7);
    let r = lir.call(sig, vec![p0, p1, k]);
    lir.ret(r);
    assert_eq!(run2(&lir, 1, 2), 10);
    assert_eq!(run2(&lir, -1, 1), 7);
}

#[test]
fn call_with_float_arguments() {
    let mut lir = Lir::new();
    let sig = lir.sig(CallSig {
        addr: scale as usize,
        indirect: false,
        ret: Ty::D,
        args: vec![ArgTy::D, ArgTy::D],
    });
    let p0 = lir.param(0, ParamKind::Arg);
    let a = lir.un(Op::QasD, p0);
    let k = lir.imm_d(3.0);
    let r = lir.call(sig, vec![a, k]);
    lir.ret(r);
    let frag = compile(&lir, Config::default()).unwrap();
    let f: extern "C" fn(u64) -> f64 = unsafe { std::mem::transmute(frag.entry()) };
    assert_eq!(f(2.5f64.to_bits()), 7.5);
}

#[test]
fn indirect_call_through_rax() {
    let mut lir = Lir::new();
    let sig = lir.sig(CallSig {
        addr: 0,
        indirect: true,
        ret: Ty::Q,
        args: vec![ArgTy::Q, ArgTy::Q, ArgTy::Q, ArgTy::Q],
    });
    let p0 = lir.param(0, ParamKind::Arg);
    let p1 = lir.param(1, ParamKind::Arg);
    let k = lir.imm_q(100);
    let callee = lir.imm_q(add3 as usize as u64);
    // last argument is the callee address
    let r = lir.call(sig, vec![p0, p1, k, callee]);
    lir.ret(r);
    assert_eq!(run2(&lir, 1, 2), 103);
}

#[test]
fn overflow_branch_taken_and_not() {
    // r = a + b, branching to a fixup path on 32-bit overflow
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let p1 = lir.param(1, ParamKind::Arg);
    let cell = lir.alloc(4);
    let a = lir.un(Op::Q2I, p0);
    let b = lir.un(Op::Q2I, p1);
    let ov = lir.new_label();
    let out_l = lir.new_label();
    let s = lir.jov(Op::AddJovI, a, b, ov);
    lir.store(Op::StI, s, cell, 0);
    lir.j(out_l);
    lir.bind_label(ov);
    let sentinel = lir.imm_i(-1);
    lir.store(Op::StI, sentinel, cell, 0);
    lir.bind_label(out_l);
    let out = lir.load(Op::LdI, cell, 0);
    lir.ret(out);

    assert_eq!(run2(&lir, 2, 3) as i32, 5);
    assert_eq!(run2(&lir, i32::MAX as i64, 1) as i32, -1);
}

#[test]
fn float4_build_sum_lane() {
    // pack four scalars, then pull one lane back out
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let ai = lir.un(Op::Q2I, p0);
    let a = lir.un(Op::I2F, ai);
    let one = lir.imm_f(1.0);
    let two = lir.imm_f(2.0);
    let three = lir.imm_f(3.0);
    let v = lir.ffff2f4(a, one, two, three);
    let k = lir.imm_f4([1.0, 10.0, 100.0, 1000.0]);
    let prod = lir.bin(Op::MulF4, v, k);
    let lane = lir.un(Op::F4Y, prod); // 1.0 * 10.0
    let d = lir.un(Op::F2D, lane);
    lir.ret(d);
    let frag = compile(&lir, Config::default()).unwrap();
    let f: extern "C" fn(i64) -> f64 = unsafe { std::mem::transmute(frag.entry()) };
    assert_eq!(f(5), 10.0);
}

#[test]
fn force_long_branch_still_correct() {
    let mut lir = Lir::new();
    let p0 = lir.param(0, ParamKind::Arg);
    let counter = lir.alloc(4);
    let n = lir.un(Op::Q2I, p0);
    lir.store(Op::StI, n, counter, 0);
    let top = lir.label();
    let c = lir.load(Op::LdI, counter, 0);
    let one = lir.imm_i(1);
    let c2 = lir.bin(Op::SubI, c, one);
    lir.store(Op::StI, c2, counter, 0);
    let zero = lir.imm_i(0);
    let more = lir.bin(Op::GtI, c2, zero);
    lir.jt(more, top);
    let out = lir.load(Op::LdI, counter, 0);
    lir.ret(out);

    let cfg = Config {
        force_long_branch: true,
        ..Config::default()
    };
    let frag = compile(&lir, cfg).unwrap();
    let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(frag.entry()) };
    assert_eq!(f(10) as i32, 0);
}
