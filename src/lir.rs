//! The low-level IR consumed by the back end.
//!
//! A trace arrives as a flat, typed, already-linearized instruction sequence.
//! Values are instruction indices; def-use edges are operand references into
//! the same arena. The back end walks the sequence in reverse program order
//! and never mutates it; allocator state lives in a side table keyed by
//! [`InsId`].
//!
//! Every value carries a taint bit. Taint marks values derivable from
//! untrusted input; the hardening policy (`blind`) consults it before
//! embedding immediates or displacements in the code stream.

use std::fmt;
use std::marker::PhantomData;

// ─── Arena and ID types ─────────────────────────────────────────────────────

/// Typed index into an [`Arena`].
pub struct Id<T> {
    index: u32,
    _phantom: PhantomData<T>,
}

// Manual impls so Id<T> stays Copy/Eq without bounds on T.
impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

impl<T> Id<T> {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            _phantom: PhantomData,
        }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// Vec-backed arena with typed indexing.
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> Arena<T> {
    pub fn push(&mut self, item: T) -> Id<T> {
        let id = Id::new(self.items.len() as u32);
        self.items.push(item);
        id
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> std::ops::Index<Id<T>> for Arena<T> {
    type Output = T;
    fn index(&self, id: Id<T>) -> &T {
        &self.items[id.index()]
    }
}

impl<T> std::ops::IndexMut<Id<T>> for Arena<T> {
    fn index_mut(&mut self, id: Id<T>) -> &mut T {
        &mut self.items[id.index()]
    }
}

pub type InsId = Id<Ins>;
pub type SigId = Id<CallSig>;
pub type ExitId = Id<SideExit>;

/// Marker type for branch-target labels.
pub struct LabelMarker;
/// A branch target. Created first, bound to a position in the stream when
/// the target point is reached, so forward branches can reference it early.
pub type LabelId = Id<LabelMarker>;

// ─── Types ──────────────────────────────────────────────────────────────────

/// Result type of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ty {
    /// 32-bit integer.
    I,
    /// 64-bit integer or pointer.
    Q,
    /// double.
    D,
    /// single-precision float.
    F,
    /// 4 x f32 vector.
    F4,
    /// no value.
    V,
}

/// Argument type for a call descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgTy {
    /// signed 32-bit, sign-extended to 64 at the call boundary.
    I,
    /// unsigned 32-bit, zero-extended.
    UI,
    /// 64-bit integer or pointer.
    Q,
    D,
    F,
    /// 4 x f32; passed by pointer on Windows, by XMM on System V.
    F4,
}

/// Describes a callee: address, indirection, signature.
#[derive(Debug, Clone)]
pub struct CallSig {
    pub addr: usize,
    pub indirect: bool,
    pub ret: Ty,
    pub args: Vec<ArgTy>,
}

/// A trace side exit. `target` is the entry of an already-compiled fragment
/// when known; unknown targets jump through a patchable slot recorded in the
/// corresponding guard record.
#[derive(Debug, Clone, Default)]
pub struct SideExit {
    pub target: Option<usize>,
}

/// Runtime record handed back (in RAX) when a guard fires. The fragment
/// manager uses `jmp` to patch the exit to a newly compiled target.
#[derive(Debug)]
#[repr(C)]
pub struct GuardRecord {
    pub exit: u32,
    pub jmp: *mut u8,
}

/// Kind of a parameter node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Incoming ABI argument register.
    Arg,
    /// Pinned to a callee-saved register for the whole fragment.
    Saved,
}

// ─── Opcodes ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // integer arithmetic / logic
    AddI,
    SubI,
    MulI,
    AndI,
    OrI,
    XorI,
    AddQ,
    SubQ,
    AndQ,
    OrQ,
    XorQ,
    DivI,
    ModI,
    NotI,
    NegI,
    // shifts (count in oprnd2; masked to 6 bits when immediate)
    LshI,
    RshI,
    RshUI,
    LshQ,
    RshQ,
    RshUQ,
    // arithmetic with an overflow branch (target is a label)
    AddJovI,
    SubJovI,
    MulJovI,
    AddJovQ,
    SubJovQ,
    // float arithmetic
    AddD,
    SubD,
    MulD,
    DivD,
    AddF,
    SubF,
    MulF,
    DivF,
    AddF4,
    SubF4,
    MulF4,
    DivF4,
    NegD,
    NegF,
    NegF4,
    // comparisons
    EqI,
    LtI,
    GtI,
    LeI,
    GeI,
    LtUI,
    GtUI,
    LeUI,
    GeUI,
    EqQ,
    LtQ,
    GtQ,
    LeQ,
    GeQ,
    LtUQ,
    GtUQ,
    LeUQ,
    GeUQ,
    EqD,
    LtD,
    GtD,
    LeD,
    GeD,
    EqF,
    LtF,
    GtF,
    LeF,
    GeF,
    EqF4,
    // conversions and bit-casts
    I2Q,
    Ui2Uq,
    Q2I,
    I2D,
    Ui2D,
    Q2D,
    I2F,
    Ui2F,
    F2I,
    D2I,
    F2D,
    D2F,
    F2F4,
    Ffff2F4,
    F4X,
    F4Y,
    F4Z,
    F4W,
    SwzF4,
    DasQ,
    QasD,
    // memory
    LdI,
    LdQ,
    LdD,
    LdF,
    LdF4,
    LdUc2Ui,
    LdUs2Ui,
    LdC2I,
    LdS2I,
    LdF2D,
    StI,
    StI2C,
    StI2S,
    StQ,
    StD,
    StF,
    StF4,
    StD2F,
    // immediates
    ImmI,
    ImmQ,
    ImmD,
    ImmF,
    ImmF4,
    // stack allocation (value is its address)
    Alloc,
    // control
    Label,
    J,
    Jt,
    Jf,
    Jtbl,
    // guarded side exits
    X,
    Xt,
    Xf,
    // conditional moves
    CmovI,
    CmovQ,
    CmovD,
    CmovF,
    CmovF4,
    // calls / params / return
    Call,
    Param,
    Ret,
}

// ─── Instruction ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Payload {
    Un(InsId),
    Bin(InsId, InsId),
    Cmov {
        cond: InsId,
        iftrue: InsId,
        iffalse: InsId,
    },
    F4Parts {
        x: InsId,
        y: InsId,
        z: InsId,
        w: InsId,
    },
    Swz {
        a: InsId,
        mask: u8,
    },
    ImmI(i32),
    ImmQ(u64),
    /// bit pattern of an f64
    ImmD(u64),
    /// bit pattern of an f32
    ImmF(u32),
    ImmF4([f32; 4]),
    Param {
        arg: u8,
        kind: ParamKind,
    },
    Load {
        base: InsId,
        disp: i32,
    },
    Store {
        val: InsId,
        base: InsId,
        disp: i32,
    },
    Call {
        sig: SigId,
        args: Vec<InsId>,
    },
    Label(LabelId),
    Branch {
        cond: Option<InsId>,
        target: LabelId,
    },
    JovBranch {
        a: InsId,
        b: InsId,
        target: LabelId,
    },
    Guard {
        cond: Option<InsId>,
        exit: ExitId,
    },
    Jtbl {
        index: InsId,
        targets: Vec<LabelId>,
    },
    Alloc {
        size: u32,
    },
    Ret(InsId),
}

#[derive(Debug, Clone)]
pub struct Ins {
    pub op: Op,
    pub ty: Ty,
    pub payload: Payload,
    pub tainted: bool,
}

// conditional-move ops are expressed as Op-generic cmov via payload; the
// opcode is reused per type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmovTy {
    I,
    Q,
    D,
    F,
    F4,
}

impl Ins {
    pub fn is_i(&self) -> bool {
        self.ty == Ty::I
    }

    pub fn is_q(&self) -> bool {
        self.ty == Ty::Q
    }

    pub fn is_d(&self) -> bool {
        self.ty == Ty::D
    }

    pub fn is_f(&self) -> bool {
        self.ty == Ty::F
    }

    pub fn is_f4(&self) -> bool {
        self.ty == Ty::F4
    }

    pub fn is_imm_i(&self) -> bool {
        matches!(self.payload, Payload::ImmI(_))
    }

    pub fn is_imm_q(&self) -> bool {
        matches!(self.payload, Payload::ImmQ(_))
    }

    pub fn is_imm_d(&self) -> bool {
        matches!(self.payload, Payload::ImmD(_))
    }

    pub fn is_imm_f(&self) -> bool {
        matches!(self.payload, Payload::ImmF(_))
    }

    pub fn is_imm_f4(&self) -> bool {
        matches!(self.payload, Payload::ImmF4(_))
    }

    pub fn is_imm_any(&self) -> bool {
        self.is_imm_i() || self.is_imm_q() || self.is_imm_d() || self.is_imm_f() || self.is_imm_f4()
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    pub fn imm_i(&self) -> i32 {
        match self.payload {
            Payload::ImmI(v) => v,
            _ => panic!("imm_i on {:?}", self.op),
        }
    }

    pub fn imm_q(&self) -> u64 {
        match self.payload {
            Payload::ImmQ(v) => v,
            _ => panic!("imm_q on {:?}", self.op),
        }
    }

    pub fn imm_d_bits(&self) -> u64 {
        match self.payload {
            Payload::ImmD(v) => v,
            _ => panic!("imm_d_bits on {:?}", self.op),
        }
    }

    pub fn imm_f_bits(&self) -> u32 {
        match self.payload {
            Payload::ImmF(v) => v,
            _ => panic!("imm_f_bits on {:?}", self.op),
        }
    }

    pub fn imm_f4(&self) -> [f32; 4] {
        match self.payload {
            Payload::ImmF4(v) => v,
            _ => panic!("imm_f4 on {:?}", self.op),
        }
    }

    /// First operand of the canonical unary/binary shapes.
    pub fn oprnd1(&self) -> InsId {
        match &self.payload {
            Payload::Un(a) | Payload::Bin(a, _) => *a,
            Payload::Swz { a, .. } => *a,
            Payload::Load { base, .. } => *base,
            Payload::Ret(a) => *a,
            Payload::JovBranch { a, .. } => *a,
            Payload::Cmov { cond, .. } => *cond,
            _ => panic!("oprnd1 on {:?}", self.op),
        }
    }

    pub fn oprnd2(&self) -> InsId {
        match &self.payload {
            Payload::Bin(_, b) => *b,
            Payload::JovBranch { b, .. } => *b,
            Payload::Cmov { iftrue, .. } => *iftrue,
            _ => panic!("oprnd2 on {:?}", self.op),
        }
    }

    pub fn param_arg(&self) -> u8 {
        match self.payload {
            Payload::Param { arg, .. } => arg,
            _ => panic!("param_arg on {:?}", self.op),
        }
    }

    pub fn param_kind(&self) -> ParamKind {
        match self.payload {
            Payload::Param { kind, .. } => kind,
            _ => panic!("param_kind on {:?}", self.op),
        }
    }

    pub fn disp(&self) -> i32 {
        match self.payload {
            Payload::Load { disp, .. } | Payload::Store { disp, .. } => disp,
            _ => panic!("disp on {:?}", self.op),
        }
    }

    /// Is this a comparison producing condition codes.
    pub fn is_cmp(&self) -> bool {
        self.is_cmp_i() || self.is_cmp_q() || self.is_cmp_d() || self.is_cmp_f() || self.op == Op::EqF4
    }

    pub fn is_cmp_i(&self) -> bool {
        use Op::*;
        matches!(self.op, EqI | LtI | GtI | LeI | GeI | LtUI | GtUI | LeUI | GeUI)
    }

    pub fn is_cmp_q(&self) -> bool {
        use Op::*;
        matches!(self.op, EqQ | LtQ | GtQ | LeQ | GeQ | LtUQ | GtUQ | LeUQ | GeUQ)
    }

    pub fn is_cmp_d(&self) -> bool {
        use Op::*;
        matches!(self.op, EqD | LtD | GtD | LeD | GeD)
    }

    pub fn is_cmp_f(&self) -> bool {
        use Op::*;
        matches!(self.op, EqF | LtF | GtF | LeF | GeF)
    }
}

// ─── Trace container and builder ────────────────────────────────────────────

/// A linearized trace: the instruction arena plus call signatures and side
/// exits. Built front-to-back; consumed by the assembler back-to-front.
#[derive(Default)]
pub struct Lir {
    pub ins: Arena<Ins>,
    pub sigs: Arena<CallSig>,
    pub exits: Arena<SideExit>,
    labels: u32,
}

impl Lir {
    pub fn new() -> Lir {
        Lir::default()
    }

    fn push(&mut self, op: Op, ty: Ty, payload: Payload) -> InsId {
        self.ins.push(Ins {
            op,
            ty,
            payload,
            tainted: false,
        })
    }

    /// Mark a value as derived from untrusted input.
    pub fn set_tainted(&mut self, id: InsId) {
        self.ins[id].tainted = true;
    }

    pub fn imm_i(&mut self, v: i32) -> InsId {
        self.push(Op::ImmI, Ty::I, Payload::ImmI(v))
    }

    pub fn imm_q(&mut self, v: u64) -> InsId {
        self.push(Op::ImmQ, Ty::Q, Payload::ImmQ(v))
    }

    pub fn imm_d(&mut self, v: f64) -> InsId {
        self.push(Op::ImmD, Ty::D, Payload::ImmD(v.to_bits()))
    }

    pub fn imm_f(&mut self, v: f32) -> InsId {
        self.push(Op::ImmF, Ty::F, Payload::ImmF(v.to_bits()))
    }

    pub fn imm_f4(&mut self, v: [f32; 4]) -> InsId {
        self.push(Op::ImmF4, Ty::F4, Payload::ImmF4(v))
    }

    pub fn param(&mut self, arg: u8, kind: ParamKind) -> InsId {
        self.push(Op::Param, Ty::Q, Payload::Param { arg, kind })
    }

    pub fn alloc(&mut self, size: u32) -> InsId {
        self.push(Op::Alloc, Ty::Q, Payload::Alloc { size })
    }

    pub fn bin(&mut self, op: Op, a: InsId, b: InsId) -> InsId {
        let ty = binop_ty(op, &self.ins[a]);
        self.push(op, ty, Payload::Bin(a, b))
    }

    pub fn un(&mut self, op: Op, a: InsId) -> InsId {
        let ty = unop_ty(op, &self.ins[a]);
        self.push(op, ty, Payload::Un(a))
    }

    pub fn ffff2f4(&mut self, x: InsId, y: InsId, z: InsId, w: InsId) -> InsId {
        self.push(Op::Ffff2F4, Ty::F4, Payload::F4Parts { x, y, z, w })
    }

    pub fn swz_f4(&mut self, a: InsId, mask: u8) -> InsId {
        self.push(Op::SwzF4, Ty::F4, Payload::Swz { a, mask })
    }

    pub fn cmov(&mut self, ty: CmovTy, cond: InsId, iftrue: InsId, iffalse: InsId) -> InsId {
        let (op, ty) = match ty {
            CmovTy::I => (Op::CmovI, Ty::I),
            CmovTy::Q => (Op::CmovQ, Ty::Q),
            CmovTy::D => (Op::CmovD, Ty::D),
            CmovTy::F => (Op::CmovF, Ty::F),
            CmovTy::F4 => (Op::CmovF4, Ty::F4),
        };
        self.push(
            op,
            ty,
            Payload::Cmov {
                cond,
                iftrue,
                iffalse,
            },
        )
    }

    pub fn load(&mut self, op: Op, base: InsId, disp: i32) -> InsId {
        let ty = match op {
            Op::LdI | Op::LdUc2Ui | Op::LdUs2Ui | Op::LdC2I | Op::LdS2I => Ty::I,
            Op::LdQ => Ty::Q,
            Op::LdD | Op::LdF2D => Ty::D,
            Op::LdF => Ty::F,
            Op::LdF4 => Ty::F4,
            _ => panic!("load with {op:?}"),
        };
        self.push(op, ty, Payload::Load { base, disp })
    }

    pub fn store(&mut self, op: Op, val: InsId, base: InsId, disp: i32) -> InsId {
        self.push(op, Ty::V, Payload::Store { val, base, disp })
    }

    pub fn sig(&mut self, sig: CallSig) -> SigId {
        self.sigs.push(sig)
    }

    pub fn call(&mut self, sig: SigId, args: Vec<InsId>) -> InsId {
        let ty = self.sigs[sig].ret;
        self.push(Op::Call, ty, Payload::Call { sig, args })
    }

    /// Allocate a label without binding it; pair with [`Lir::bind_label`].
    /// Lets forward branches name their target before it exists.
    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId::new(self.labels);
        self.labels += 1;
        id
    }

    /// Bind a previously allocated label at the current stream position.
    pub fn bind_label(&mut self, l: LabelId) -> InsId {
        self.push(Op::Label, Ty::V, Payload::Label(l))
    }

    /// Allocate and bind in one step (backward-branch targets).
    pub fn label(&mut self) -> LabelId {
        let l = self.new_label();
        self.bind_label(l);
        l
    }

    pub fn j(&mut self, target: LabelId) -> InsId {
        self.push(
            Op::J,
            Ty::V,
            Payload::Branch {
                cond: None,
                target,
            },
        )
    }

    pub fn jt(&mut self, cond: InsId, target: LabelId) -> InsId {
        self.push(
            Op::Jt,
            Ty::V,
            Payload::Branch {
                cond: Some(cond),
                target,
            },
        )
    }

    pub fn jf(&mut self, cond: InsId, target: LabelId) -> InsId {
        self.push(
            Op::Jf,
            Ty::V,
            Payload::Branch {
                cond: Some(cond),
                target,
            },
        )
    }

    pub fn jov(&mut self, op: Op, a: InsId, b: InsId, target: LabelId) -> InsId {
        use Op::*;
        let ty = match op {
            AddJovI | SubJovI | MulJovI => Ty::I,
            AddJovQ | SubJovQ => Ty::Q,
            _ => panic!("jov with {op:?}"),
        };
        self.push(op, ty, Payload::JovBranch { a, b, target })
    }

    pub fn jtbl(&mut self, index: InsId, targets: Vec<LabelId>) -> InsId {
        self.push(Op::Jtbl, Ty::V, Payload::Jtbl { index, targets })
    }

    pub fn exit(&mut self, exit: SideExit) -> ExitId {
        self.exits.push(exit)
    }

    pub fn x(&mut self, exit: ExitId) -> InsId {
        self.push(Op::X, Ty::V, Payload::Guard { cond: None, exit })
    }

    pub fn xt(&mut self, cond: InsId, exit: ExitId) -> InsId {
        self.push(
            Op::Xt,
            Ty::V,
            Payload::Guard {
                cond: Some(cond),
                exit,
            },
        )
    }

    pub fn xf(&mut self, cond: InsId, exit: ExitId) -> InsId {
        self.push(
            Op::Xf,
            Ty::V,
            Payload::Guard {
                cond: Some(cond),
                exit,
            },
        )
    }

    pub fn ret(&mut self, val: InsId) -> InsId {
        self.push(Op::Ret, Ty::V, Payload::Ret(val))
    }
}

fn binop_ty(op: Op, a: &Ins) -> Ty {
    use Op::*;
    match op {
        AddI | SubI | MulI | AndI | OrI | XorI | DivI | LshI | RshI | RshUI => Ty::I,
        AddQ | SubQ | AndQ | OrQ | XorQ | LshQ | RshQ | RshUQ => Ty::Q,
        AddD | SubD | MulD | DivD => Ty::D,
        AddF | SubF | MulF | DivF => Ty::F,
        AddF4 | SubF4 | MulF4 | DivF4 => Ty::F4,
        EqI | LtI | GtI | LeI | GeI | LtUI | GtUI | LeUI | GeUI | EqQ | LtQ | GtQ | LeQ | GeQ
        | LtUQ | GtUQ | LeUQ | GeUQ | EqD | LtD | GtD | LeD | GeD | EqF | LtF | GtF | LeF | GeF
        | EqF4 => Ty::I,
        _ => a.ty,
    }
}

fn unop_ty(op: Op, a: &Ins) -> Ty {
    use Op::*;
    match op {
        // modi consumes the divi whose operands it shares
        NotI | NegI | ModI | Q2I | F2I | D2I => Ty::I,
        I2Q | Ui2Uq | DasQ => Ty::Q,
        I2D | Ui2D | Q2D | F2D => Ty::D,
        I2F | Ui2F | D2F | F4X | F4Y | F4Z | F4W => Ty::F,
        F2F4 => Ty::F4,
        QasD => Ty::D,
        NegD => Ty::D,
        NegF => Ty::F,
        NegF4 => Ty::F4,
        _ => a.ty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assigns_types() {
        let mut lir = Lir::new();
        let a = lir.imm_i(7);
        let b = lir.imm_i(5);
        let s = lir.bin(Op::AddI, a, b);
        assert!(lir.ins[s].is_i());
        let q = lir.un(Op::I2Q, s);
        assert!(lir.ins[q].is_q());
        let d = lir.un(Op::I2D, s);
        assert!(lir.ins[d].is_d());
        let c = lir.bin(Op::LtD, d, d);
        assert!(lir.ins[c].is_i() && lir.ins[c].is_cmp_d());
    }

    #[test]
    fn taint_propagates_to_predicate() {
        let mut lir = Lir::new();
        let k = lir.imm_i(0x11223344);
        assert!(!lir.ins[k].is_tainted());
        lir.set_tainted(k);
        assert!(lir.ins[k].is_tainted());
        assert!(lir.ins[k].is_imm_any());
        assert_eq!(lir.ins[k].imm_i(), 0x11223344);
    }

    #[test]
    fn call_takes_type_from_signature() {
        let mut lir = Lir::new();
        let sig = lir.sig(CallSig {
            addr: 0x1000,
            indirect: false,
            ret: Ty::D,
            args: vec![ArgTy::I, ArgTy::D],
        });
        let a = lir.imm_i(1);
        let b = lir.imm_d(2.0);
        let c = lir.call(sig, vec![a, b]);
        assert!(lir.ins[c].is_d());
    }
}
