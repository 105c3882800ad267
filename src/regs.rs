//! Register universe and calling-convention tables for the x86-64 back end.
//!
//! Registers are small integers: 0..15 are the general-purpose registers in
//! hardware encoding order, 16..31 are XMM0..XMM15. `RegisterMask` is a plain
//! bitset over that universe, used for allocator allow-sets and liveness
//! snapshots.

use std::fmt;

/// One of the 32 physical registers (16 GP + 16 XMM).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register(pub(crate) u8);

impl Register {
    /// Hardware encoding number (0..31).
    pub fn num(self) -> u8 {
        self.0
    }

    /// Low three bits, as packed into ModR/M and SIB fields.
    pub fn low3(self) -> u64 {
        (self.0 & 7) as u64
    }

    /// High bit, as packed into REX.R/X/B.
    pub fn hi(self) -> u64 {
        (self.0 & 8) as u64
    }

    pub fn is_gp(self) -> bool {
        self.0 < 16
    }

    pub fn is_fp(self) -> bool {
        (16..32).contains(&self.0)
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(name_q(*self))
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(name_q(*self))
    }
}

pub const RAX: Register = Register(0);
pub const RCX: Register = Register(1);
pub const RDX: Register = Register(2);
pub const RBX: Register = Register(3);
pub const RSP: Register = Register(4);
pub const RBP: Register = Register(5);
pub const RSI: Register = Register(6);
pub const RDI: Register = Register(7);
pub const R8: Register = Register(8);
pub const R9: Register = Register(9);
pub const R10: Register = Register(10);
pub const R11: Register = Register(11);
pub const R12: Register = Register(12);
pub const R13: Register = Register(13);
pub const R14: Register = Register(14);
pub const R15: Register = Register(15);

pub const XMM0: Register = Register(16);
pub const XMM1: Register = Register(17);
pub const XMM8: Register = Register(24);

/// Frame pointer alias.
pub const FP: Register = RBP;

/// Placeholder where the encoding needs a register slot without semantic
/// meaning (`/0../7` opcode extensions, RIP-relative ModR/M). Encodes as 0,
/// so it never flips a REX bit.
pub const RZERO: Register = Register(0);

pub fn xmm(n: u8) -> Register {
    debug_assert!(n < 16);
    Register(16 + n)
}

/// Bitset over the register universe.
pub type RegisterMask = u32;

pub const fn rmask(r: Register) -> RegisterMask {
    1 << r.0
}

pub const GP_REGS: RegisterMask = 0x0000_ffff & !(rmask(RSP) | rmask(RBP));
pub const FP_REGS: RegisterMask = 0xffff_0000;

// Using RSP or R12 as a base requires a SIB byte, so R12 stays out of play
// as a base register.
pub const BASE_REGS: RegisterMask = GP_REGS & !rmask(R12);

/// With a REX prefix every GP register has an addressable low byte, but the
/// encodings without REX alias AH/CH/DH/BH; restrict single-byte stores to
/// registers that are safe either way.
pub const SINGLE_BYTE_STORE_REGS: RegisterMask = GP_REGS;

pub fn lowest_set(mask: RegisterMask) -> Option<Register> {
    if mask == 0 {
        None
    } else {
        Some(Register(mask.trailing_zeros() as u8))
    }
}

// ─── Calling convention ─────────────────────────────────────────────────────

#[cfg(windows)]
pub const ARG_REGS: &[Register] = &[RCX, RDX, R8, R9];
#[cfg(windows)]
pub const SAVED_REGS: &[Register] = &[RBX, RSI, RDI, R12, R13, R14, R15];
/// Caller-reserved shadow area above the outgoing arguments.
#[cfg(windows)]
pub const SHADOW_SPACE: i32 = 32;
/// Scratch registers the allocator manages: rax-rbx, rsi, rdi, r8-r15,
/// xmm0-xmm5 (xmm6-xmm15 are callee-saved on Windows and left alone).
#[cfg(windows)]
pub const MANAGED_REGS: RegisterMask = 0x003f_ffcf & !(rmask(RSP) | rmask(RBP));

#[cfg(not(windows))]
pub const ARG_REGS: &[Register] = &[RDI, RSI, RDX, RCX, R8, R9];
#[cfg(not(windows))]
pub const SAVED_REGS: &[Register] = &[RBX, R12, R13, R14, R15];
#[cfg(not(windows))]
pub const SHADOW_SPACE: i32 = 0;
#[cfg(not(windows))]
pub const MANAGED_REGS: RegisterMask = 0xffff_ffff & !(rmask(RSP) | rmask(RBP));

/// Number of XMM registers used for float arguments (System V).
pub const NUM_FP_ARG_REGS: u8 = 8;

pub const STACK_ALIGN: u32 = 16;

// ─── Names for the disassembly mirror ───────────────────────────────────────

static NAMES_Q: [&str; 32] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8",
    "xmm9", "xmm10", "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
];

static NAMES_L: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d",
];

static NAMES_B: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
    "r13b", "r14b", "r15b",
];

static NAMES_B_HI: [&str; 4] = ["ah", "ch", "dh", "bh"];

static NAMES_S: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w", "r13w",
    "r14w", "r15w",
];

/// 64-bit (or XMM) name.
pub fn name_q(r: Register) -> &'static str {
    NAMES_Q[r.0 as usize]
}

/// 32-bit name.
pub fn name_l(r: Register) -> &'static str {
    NAMES_L[(r.0 & 15) as usize]
}

/// Low-byte name.
pub fn name_b(r: Register) -> &'static str {
    NAMES_B[(r.0 & 15) as usize]
}

/// High-byte name (AH..BH); only meaningful for rax..rbx.
pub fn name_b_hi(r: Register) -> &'static str {
    NAMES_B_HI[(r.0 & 3) as usize]
}

/// 16-bit name.
pub fn name_s(r: Register) -> &'static str {
    NAMES_S[(r.0 & 15) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_are_disjoint() {
        assert_eq!(GP_REGS & FP_REGS, 0);
        assert!(RAX.is_gp() && !RAX.is_fp());
        assert!(XMM0.is_fp() && !XMM0.is_gp());
        assert!(xmm(15).is_fp());
    }

    #[test]
    fn sp_and_fp_never_allocatable() {
        assert_eq!(MANAGED_REGS & rmask(RSP), 0);
        assert_eq!(MANAGED_REGS & rmask(RBP), 0);
        assert_eq!(GP_REGS & rmask(RSP), 0);
        assert_eq!(GP_REGS & rmask(FP), 0);
    }

    #[test]
    fn base_regs_exclude_r12() {
        assert_eq!(BASE_REGS & rmask(R12), 0);
        assert_ne!(BASE_REGS & rmask(R13), 0);
    }

    #[test]
    fn names_line_up_with_encodings() {
        assert_eq!(name_q(R8), "r8");
        assert_eq!(name_l(RDI), "edi");
        assert_eq!(name_b(RSP), "spl");
        assert_eq!(name_q(xmm(9)), "xmm9");
    }
}
