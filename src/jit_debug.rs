//! GDB JIT interface — registers compiled fragments with debuggers.
//!
//! Builds a minimal in-memory ELF carrying one function symbol per fragment
//! so GDB/LLDB backtraces show fragment names instead of `???`, and appends
//! to the perf map for profiling.
//!
//! Reference: <https://sourceware.org/gdb/current/onlinedocs/gdb.html/JIT-Interface.html>

use std::io::Write;
use std::sync::Mutex;

const JIT_NOACTION: u32 = 0;
const JIT_REGISTER_FN: u32 = 1;
const JIT_UNREGISTER_FN: u32 = 2;

#[repr(C)]
struct JitCodeEntry {
    next: *mut JitCodeEntry,
    prev: *mut JitCodeEntry,
    symfile_addr: *const u8,
    symfile_size: u64,
}

#[repr(C)]
struct JitDescriptor {
    version: u32,
    action_flag: u32,
    relevant_entry: *mut JitCodeEntry,
    first_entry: *mut JitCodeEntry,
}

// SAFETY: the linked list is only touched under DESCRIPTOR_LOCK.
unsafe impl Send for JitDescriptor {}
unsafe impl Sync for JitDescriptor {}

#[unsafe(no_mangle)]
static mut __jit_debug_descriptor: JitDescriptor = JitDescriptor {
    version: 1,
    action_flag: JIT_NOACTION,
    relevant_entry: std::ptr::null_mut(),
    first_entry: std::ptr::null_mut(),
};

#[unsafe(no_mangle)]
#[inline(never)]
extern "C" fn __jit_debug_register_code() {
    // GDB sets a breakpoint here. The body must not be optimized away.
    unsafe { std::ptr::read_volatile(&0u8) };
}

static DESCRIPTOR_LOCK: Mutex<()> = Mutex::new(());

/// A symbol inside a registered code range.
pub struct JitSymbol {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

/// Owns a debugger registration; unregisters on drop.
pub struct JitRegistration {
    entry: *mut JitCodeEntry,
    _elf: Vec<u8>,
}

// SAFETY: the entry is heap-allocated and only accessed under the lock.
unsafe impl Send for JitRegistration {}
unsafe impl Sync for JitRegistration {}

impl Drop for JitRegistration {
    fn drop(&mut self) {
        let _lock = DESCRIPTOR_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        unsafe {
            let entry = &mut *self.entry;
            if !entry.prev.is_null() {
                (*entry.prev).next = entry.next;
            } else {
                __jit_debug_descriptor.first_entry = entry.next;
            }
            if !entry.next.is_null() {
                (*entry.next).prev = entry.prev;
            }
            __jit_debug_descriptor.action_flag = JIT_UNREGISTER_FN;
            __jit_debug_descriptor.relevant_entry = self.entry;
            __jit_debug_register_code();
            drop(Box::from_raw(self.entry));
        }
    }
}

/// Register an executable range and its symbols with the debugger.
pub fn register_jit_code(base: *const u8, len: usize, symbols: &[JitSymbol]) -> JitRegistration {
    let elf = build_elf(base as u64, len, symbols);

    let entry = Box::into_raw(Box::new(JitCodeEntry {
        next: std::ptr::null_mut(),
        prev: std::ptr::null_mut(),
        symfile_addr: elf.as_ptr(),
        symfile_size: elf.len() as u64,
    }));

    let _lock = DESCRIPTOR_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    unsafe {
        let old_first = __jit_debug_descriptor.first_entry;
        (*entry).next = old_first;
        if !old_first.is_null() {
            (*old_first).prev = entry;
        }
        __jit_debug_descriptor.first_entry = entry;
        __jit_debug_descriptor.action_flag = JIT_REGISTER_FN;
        __jit_debug_descriptor.relevant_entry = entry;
        __jit_debug_register_code();
    }

    write_perf_map(base, symbols);

    JitRegistration { entry, _elf: elf }
}

/// Append to `/tmp/perf-<pid>.map` so `perf` resolves fragment names.
fn write_perf_map(base: *const u8, symbols: &[JitSymbol]) {
    let path = format!("/tmp/perf-{}.map", std::process::id());
    let Ok(mut f) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
    else {
        return;
    };
    for sym in symbols {
        let addr = base as usize + sym.offset;
        let _ = writeln!(f, "{addr:x} {:x} {}", sym.size, sym.name);
    }
}

// ─── Minimal ELF64 builder ──────────────────────────────────────────────────

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;
const NUM_SECTIONS: usize = 5; // null, .text, .symtab, .strtab, .shstrtab
const EM_X86_64: u16 = 0x3e;

fn build_elf(text_addr: u64, text_len: usize, symbols: &[JitSymbol]) -> Vec<u8> {
    // .strtab: symbol names
    let mut strtab = vec![0u8];
    let mut name_offsets = Vec::with_capacity(symbols.len());
    for sym in symbols {
        name_offsets.push(strtab.len() as u32);
        strtab.extend_from_slice(sym.name.as_bytes());
        strtab.push(0);
    }

    // .shstrtab: section names
    let mut shstrtab = vec![0u8];
    let sh_name_text = shstrtab.len() as u32;
    shstrtab.extend_from_slice(b".text\0");
    let sh_name_symtab = shstrtab.len() as u32;
    shstrtab.extend_from_slice(b".symtab\0");
    let sh_name_strtab = shstrtab.len() as u32;
    shstrtab.extend_from_slice(b".strtab\0");
    let sh_name_shstrtab = shstrtab.len() as u32;
    shstrtab.extend_from_slice(b".shstrtab\0");

    // .symtab: null entry plus one STT_FUNC per symbol
    let mut symtab = Vec::with_capacity((1 + symbols.len()) * SYM_SIZE);
    symtab.extend_from_slice(&[0u8; SYM_SIZE]);
    for (i, sym) in symbols.iter().enumerate() {
        symtab.extend_from_slice(&name_offsets[i].to_le_bytes());
        symtab.push(0x12); // STB_GLOBAL << 4 | STT_FUNC
        symtab.push(0);
        symtab.extend_from_slice(&1u16.to_le_bytes()); // shndx = .text
        symtab.extend_from_slice(&(text_addr + sym.offset as u64).to_le_bytes());
        symtab.extend_from_slice(&(sym.size as u64).to_le_bytes());
    }

    // Layout: ELF header | section headers | .symtab | .strtab | .shstrtab
    let shdr_offset = EHDR_SIZE;
    let symtab_offset = shdr_offset + NUM_SECTIONS * SHDR_SIZE;
    let strtab_offset = symtab_offset + symtab.len();
    let shstrtab_offset = strtab_offset + strtab.len();
    let total = shstrtab_offset + shstrtab.len();

    let mut elf = Vec::with_capacity(total);

    // ELF header
    elf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]); // 64-bit LSB
    elf.extend_from_slice(&[0u8; 8]);
    elf.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    elf.extend_from_slice(&EM_X86_64.to_le_bytes());
    elf.extend_from_slice(&1u32.to_le_bytes()); // EV_CURRENT
    elf.extend_from_slice(&0u64.to_le_bytes()); // e_entry
    elf.extend_from_slice(&0u64.to_le_bytes()); // e_phoff
    elf.extend_from_slice(&(shdr_offset as u64).to_le_bytes());
    elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    elf.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    elf.extend_from_slice(&0u16.to_le_bytes()); // e_phentsize
    elf.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
    elf.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
    elf.extend_from_slice(&(NUM_SECTIONS as u16).to_le_bytes());
    elf.extend_from_slice(&4u16.to_le_bytes()); // e_shstrndx

    let shdr = |elf: &mut Vec<u8>,
                name: u32,
                sh_type: u32,
                flags: u64,
                addr: u64,
                offset: u64,
                size: u64,
                link: u32,
                info: u32,
                align: u64,
                entsize: u64| {
        elf.extend_from_slice(&name.to_le_bytes());
        elf.extend_from_slice(&sh_type.to_le_bytes());
        elf.extend_from_slice(&flags.to_le_bytes());
        elf.extend_from_slice(&addr.to_le_bytes());
        elf.extend_from_slice(&offset.to_le_bytes());
        elf.extend_from_slice(&size.to_le_bytes());
        elf.extend_from_slice(&link.to_le_bytes());
        elf.extend_from_slice(&info.to_le_bytes());
        elf.extend_from_slice(&align.to_le_bytes());
        elf.extend_from_slice(&entsize.to_le_bytes());
    };

    // null section
    shdr(&mut elf, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0);
    // .text — SHT_PROGBITS, alloc+exec, pointing at the live JIT buffer
    shdr(
        &mut elf,
        sh_name_text,
        1,
        0x2 | 0x4,
        text_addr,
        0,
        text_len as u64,
        0,
        0,
        16,
        0,
    );
    // .symtab — link to .strtab (3), first global = 1
    shdr(
        &mut elf,
        sh_name_symtab,
        2,
        0,
        0,
        symtab_offset as u64,
        symtab.len() as u64,
        3,
        1,
        8,
        SYM_SIZE as u64,
    );
    // .strtab
    shdr(
        &mut elf,
        sh_name_strtab,
        3,
        0,
        0,
        strtab_offset as u64,
        strtab.len() as u64,
        0,
        0,
        1,
        0,
    );
    // .shstrtab
    shdr(
        &mut elf,
        sh_name_shstrtab,
        3,
        0,
        0,
        shstrtab_offset as u64,
        shstrtab.len() as u64,
        0,
        0,
        1,
        0,
    );

    elf.extend_from_slice(&symtab);
    elf.extend_from_slice(&strtab);
    elf.extend_from_slice(&shstrtab);
    debug_assert_eq!(elf.len(), total);
    elf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elf_layout_is_consistent() {
        let syms = [JitSymbol {
            name: "frag0".into(),
            offset: 0,
            size: 32,
        }];
        let elf = build_elf(0x1000, 32, &syms);
        assert_eq!(&elf[..4], &[0x7f, b'E', b'L', b'F']);
        // e_shnum at offset 60
        assert_eq!(u16::from_le_bytes([elf[60], elf[61]]), NUM_SECTIONS as u16);
        // the symbol name must appear in the string table
        assert!(elf.windows(5).any(|w| w == b"frag0"));
    }

    #[test]
    fn register_and_drop_roundtrip() {
        let code = [0xc3u8];
        let reg = register_jit_code(
            code.as_ptr(),
            1,
            &[JitSymbol {
                name: "ret_stub".into(),
                offset: 0,
                size: 1,
            }],
        );
        drop(reg);
    }
}
