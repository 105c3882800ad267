//! Executable memory chunks for emitted code.
//!
//! Chunks are mmap'd read-write while the assembler fills them backwards, and
//! flipped to read-execute when the finished fragment is handed off. Patching
//! a branch after handoff toggles the owning chunk writable for the duration
//! of the store.

use std::ptr::NonNull;

use crate::AssmError;

/// Default chunk size handed to the assembler. Large enough that most traces
/// fit in one chunk; `underrun_protect` bridges into a new chunk otherwise.
pub const CHUNK_BYTES: usize = 8192;

pub fn page_size() -> usize {
    #[cfg(unix)]
    unsafe {
        libc::sysconf(libc::_SC_PAGESIZE) as usize
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

/// One contiguous mmap'd region of code memory.
pub struct CodeChunk {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

// The chunk is an owned mapping; the raw pointer is not aliased elsewhere.
unsafe impl Send for CodeChunk {}

impl CodeChunk {
    /// Map a fresh read-write chunk of at least `size` bytes.
    pub fn new(size: usize) -> Result<CodeChunk, AssmError> {
        let page = page_size();
        let size = size.div_ceil(page) * page;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(AssmError::OutOfMemory);
        }
        Ok(CodeChunk {
            ptr: NonNull::new(ptr as *mut u8).ok_or(AssmError::OutOfMemory)?,
            size,
            executable: false,
        })
    }

    pub fn start(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn end(&self) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(self.size) }
    }

    pub fn contains(&self, p: *const u8) -> bool {
        let s = self.ptr.as_ptr() as usize;
        (s..s + self.size).contains(&(p as usize))
    }

    /// Flip the chunk executable (and read-only). W^X: after this, writes go
    /// through [`CodeChunk::with_writable`] only.
    pub fn protect_exec(&mut self) -> Result<(), AssmError> {
        self.protect(libc::PROT_READ | libc::PROT_EXEC)?;
        self.executable = true;
        Ok(())
    }

    /// Run `f` with the chunk temporarily writable, restoring the executable
    /// protection afterwards. Used by branch patching.
    pub fn with_writable<R>(&mut self, f: impl FnOnce() -> R) -> Result<R, AssmError> {
        let was_exec = self.executable;
        if was_exec {
            self.protect(libc::PROT_READ | libc::PROT_WRITE)?;
        }
        let r = f();
        if was_exec {
            self.protect(libc::PROT_READ | libc::PROT_EXEC)?;
        }
        Ok(r)
    }

    fn protect(&self, prot: libc::c_int) -> Result<(), AssmError> {
        let rc = unsafe { libc::mprotect(self.ptr.as_ptr() as *mut libc::c_void, self.size, prot) };
        if rc != 0 {
            return Err(AssmError::OutOfMemory);
        }
        Ok(())
    }
}

impl Drop for CodeChunk {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_is_page_aligned_and_writable() {
        let chunk = CodeChunk::new(100).unwrap();
        assert_eq!(chunk.start() as usize % page_size(), 0);
        assert!(chunk.size >= 100);
        unsafe {
            chunk.start().write(0xc3);
            assert_eq!(chunk.start().read(), 0xc3);
        }
        assert!(chunk.contains(chunk.start()));
        assert!(!chunk.contains(chunk.end()));
    }

    #[test]
    fn exec_flip_keeps_contents_readable() {
        let mut chunk = CodeChunk::new(64).unwrap();
        unsafe { chunk.start().write(0x90) };
        chunk.protect_exec().unwrap();
        unsafe { assert_eq!(chunk.start().read(), 0x90) };
    }
}
