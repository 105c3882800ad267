//! strix — x86-64 machine-code back end for a trace JIT.
//!
//! The crate turns a linearized, typed LIR trace ([`lir::Lir`]) into an
//! in-memory patchable blob of x86-64 code. Instructions are emitted
//! backwards through a reverse-growing cursor while a greedy second-chance
//! allocator assigns registers; branches between fragments stay patchable
//! through recorded guard sites. Tainted constants and displacements are
//! blinded so attacker-chosen bit patterns never land verbatim in executable
//! memory.
//!
//! ```no_run
//! use strix::lir::{Lir, Op, ParamKind};
//!
//! let mut lir = Lir::new();
//! let p0 = lir.param(0, ParamKind::Arg);
//! let k = lir.imm_i(0x100);
//! let sum = lir.bin(Op::AddI, p0, k);
//! lir.ret(sum);
//!
//! let frag = strix::compile(&lir, strix::Config::default()).unwrap();
//! let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(frag.entry()) };
//! assert_eq!(f(5), 0x105);
//! ```

use std::fmt;
use std::sync::OnceLock;

pub mod lir;
pub mod regs;

mod asm;
mod blind;
mod codemem;
mod encode;
mod jit_debug;
mod pool;
mod regalloc;
mod select;

#[cfg(test)]
mod disasm_tests;

#[cfg(not(target_arch = "x86_64"))]
compile_error!("this back end emits x86-64 code only");

use codemem::CodeChunk;
use lir::{GuardRecord, Lir};
use pool::LiteralPool;

pub use asm::Assembler;
pub use encode::Cc;

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Assembly failure. The assembler is poisoned on the first error; emission
/// continues as a no-op and the error surfaces when compilation finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssmError {
    /// A disp32 site saw a target beyond ±2GiB, or a patch asked for one.
    /// Retry with `force_long_branch`.
    BranchTooFar,
    /// The trace used an operation this back end does not implement.
    UnsupportedOp,
    /// Code-chunk allocation or protection failed.
    OutOfMemory,
}

impl fmt::Display for AssmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssmError::BranchTooFar => write!(f, "branch target out of 32-bit range"),
            AssmError::UnsupportedOp => write!(f, "unsupported LIR operation"),
            AssmError::OutOfMemory => write!(f, "executable memory allocation failed"),
        }
    }
}

impl std::error::Error for AssmError {}

// ─── Configuration ──────────────────────────────────────────────────────────

/// Back-end tunables.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Force every branch into its 32/64-bit form; used for testing reach
    /// handling and by drivers retrying after [`AssmError::BranchTooFar`].
    pub force_long_branch: bool,
    /// Master switch for constant and displacement blinding of tainted
    /// values.
    pub blinding: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            force_long_branch: false,
            blinding: true,
        }
    }
}

impl Config {
    /// Defaults with environment overrides, read once:
    /// `STRIX_FORCE_LONG_BRANCH` and `STRIX_BLINDING` (`0`/`1`).
    pub fn from_env() -> Config {
        static CFG: OnceLock<Config> = OnceLock::new();
        *CFG.get_or_init(|| {
            let flag = |name: &str, default: bool| match std::env::var(name) {
                Ok(v) if v == "0" => false,
                Ok(v) if v == "1" => true,
                Ok(v) => panic!("invalid {name}={v:?}; expected \"0\" or \"1\""),
                Err(_) => default,
            };
            Config {
                force_long_branch: flag("STRIX_FORCE_LONG_BRANCH", false),
                blinding: flag("STRIX_BLINDING", true),
            }
        })
    }
}

// ─── Compiled fragment ──────────────────────────────────────────────────────

/// A compiled trace: executable chunks, entry point, guard patch records, and
/// the literal pool and jump tables the code references.
pub struct CompiledFragment {
    // Field order matters: the debugger registration must go before the
    // chunks it points into are unmapped.
    _debug: Option<jit_debug::JitRegistration>,
    chunks: Vec<CodeChunk>,
    entry: *const u8,
    patch_entry: *const u8,
    frag_end: *const u8,
    guard_records: Vec<Box<GuardRecord>>,
    _jump_tables: Vec<Box<[usize]>>,
    _pool: LiteralPool,
}

// The fragment owns all memory its code references; nothing aliases it.
unsafe impl Send for CompiledFragment {}

impl CompiledFragment {
    /// Fragment entry point. Pages are executable; call via transmute to the
    /// trace's signature.
    pub fn entry(&self) -> *const u8 {
        self.entry
    }

    /// Entry past the frame setup: the target to use when patching another
    /// fragment's guard exit into this one, so the incoming fragment's frame
    /// is reused rather than double-pushed.
    pub fn patch_entry(&self) -> *const u8 {
        self.patch_entry
    }

    /// The contiguous code run starting at the entry (up to the first chunk
    /// bridge, if the fragment spilled into more chunks).
    pub fn code(&self) -> &[u8] {
        let chunk = self
            .chunks
            .iter()
            .find(|c| c.contains(self.entry))
            .expect("entry outside all chunks");
        let end = if chunk.contains(self.frag_end) {
            self.frag_end
        } else {
            chunk.end() as *const u8
        };
        unsafe { std::slice::from_raw_parts(self.entry, end as usize - self.entry as usize) }
    }

    /// Guard record for a side exit, as handed back in RAX when it fires.
    pub fn guard_record(&self, exit: usize) -> &GuardRecord {
        &self.guard_records[exit]
    }

    /// Retarget a recorded patch site (a guard's exit jump). Recognizes
    /// `jmp rel32`, `jcc rel32`, and the absolute trampoline form; patching
    /// twice with the same target is a no-op.
    pub fn patch_branch(&mut self, patch: *mut u8, target: *const u8) -> Result<(), AssmError> {
        let chunk = self
            .chunks
            .iter_mut()
            .find(|c| c.contains(patch as *const u8))
            .ok_or(AssmError::UnsupportedOp)?;
        chunk.with_writable(|| select::patch_branch_at(patch, target as *mut u8))?
    }

    /// Register the fragment with in-process debuggers under `name`.
    pub fn register_debug(&mut self, name: &str) {
        let (ptr, len) = {
            let code = self.code();
            (code.as_ptr(), code.len())
        };
        self._debug = Some(jit_debug::register_jit_code(
            ptr,
            len,
            &[jit_debug::JitSymbol {
                name: name.to_owned(),
                offset: 0,
                size: len,
            }],
        ));
    }
}

/// Compile one trace. The assembler walks the LIR in reverse program order,
/// emits the prologue last, and flips the chunks executable before handoff.
pub fn compile(lir: &Lir, config: Config) -> Result<CompiledFragment, AssmError> {
    let mut asm = Assembler::new(lir, config);
    let entry = asm.assemble()?;
    let Assembler {
        mut chunks,
        frag_end,
        patch_entry,
        guard_records,
        jump_tables,
        pool,
        ..
    } = asm;
    for chunk in &mut chunks {
        chunk.protect_exec()?;
    }
    Ok(CompiledFragment {
        chunks,
        entry: entry as *const u8,
        patch_entry: patch_entry as *const u8,
        frag_end: frag_end as *const u8,
        guard_records,
        _jump_tables: jump_tables,
        _pool: pool,
        _debug: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{CallSig, Op, ParamKind, Ty};

    #[test]
    fn add_imm_fragment_runs() {
        let mut lir = Lir::new();
        let p0 = lir.param(0, ParamKind::Arg);
        let k = lir.imm_i(0x100);
        let sum = lir.bin(Op::AddI, p0, k);
        lir.ret(sum);

        let frag = compile(&lir, Config::default()).unwrap();
        let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(frag.entry()) };
        assert_eq!(f(5), 0x105);
        assert_eq!(f(-1), 0xff);
    }

    #[test]
    fn far_call_goes_through_rax() {
        let mut lir = Lir::new();
        let sig = lir.sig(CallSig {
            // Far outside rel32 reach of any mmap'd chunk, so the selector
            // must take the indirect path. Never actually called.
            addr: 0x7fff_0000_0000,
            indirect: false,
            ret: Ty::Q,
            args: vec![],
        });
        let c = lir.call(sig, vec![]);
        lir.ret(c);
        let frag = compile(&lir, Config::default()).unwrap();
        // mov rax, imm64 is 48 b8; the call through rax is ff d0.
        let code = frag.code();
        let pos = code
            .windows(2)
            .position(|w| w == [0xff, 0xd0])
            .expect("no call rax in code");
        assert!(code[..pos].windows(2).any(|w| w == [0x48, 0xb8]));
    }
}
