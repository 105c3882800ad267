//! Literal pool for float constants.
//!
//! x86-64 has no general float-immediate forms, so f32/f64/f32x4 constants
//! load from memory. The pool deduplicates literals and hands out 16-byte
//! aligned slot addresses that stay stable for the life of the compiled
//! fragment (the fragment owns its pool).

use std::collections::HashMap;

#[repr(align(16))]
struct Slot([u8; 16]);

#[derive(Default)]
pub struct LiteralPool {
    slots: Vec<Box<Slot>>,
    dedup: HashMap<[u8; 16], usize>,
}

impl LiteralPool {
    pub fn new() -> LiteralPool {
        LiteralPool::default()
    }

    fn find(&mut self, bytes: [u8; 16]) -> *const u8 {
        let slots = &mut self.slots;
        let idx = *self.dedup.entry(bytes).or_insert_with(|| {
            slots.push(Box::new(Slot(bytes)));
            slots.len() - 1
        });
        self.slots[idx].0.as_ptr()
    }

    /// Slot holding a 128-bit vector literal. Always 16-byte aligned.
    pub fn find_f4(&mut self, v: [f32; 4]) -> *const u8 {
        let mut bytes = [0u8; 16];
        for (i, f) in v.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&f.to_bits().to_le_bytes());
        }
        self.find(bytes)
    }

    /// Slot holding a double, zero-padded to 16 bytes.
    pub fn find_d(&mut self, bits: u64) -> *const u8 {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&bits.to_le_bytes());
        self.find(bytes)
    }

    /// Slot holding a float, zero-padded to 16 bytes.
    pub fn find_f(&mut self, bits: u32) -> *const u8 {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&bits.to_le_bytes());
        self.find(bytes)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_aligned_and_deduplicated() {
        let mut pool = LiteralPool::new();
        let a = pool.find_d(1.5f64.to_bits());
        let b = pool.find_d(1.5f64.to_bits());
        let c = pool.find_d(2.5f64.to_bits());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a as usize % 16, 0);
        assert_eq!(c as usize % 16, 0);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn addresses_survive_growth() {
        let mut pool = LiteralPool::new();
        let first = pool.find_f(1.0f32.to_bits());
        for i in 0..100 {
            pool.find_f((i as f32).to_bits());
        }
        assert_eq!(first, pool.find_f(1.0f32.to_bits()));
        unsafe {
            assert_eq!((first as *const u32).read(), 1.0f32.to_bits());
        }
    }
}
