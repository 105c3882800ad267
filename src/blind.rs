//! Constant-blinding policy.
//!
//! JIT spraying feeds attacker-chosen constants through the compiler hoping
//! they land verbatim in executable memory, where a misaligned jump turns
//! them into a useful instruction sequence. The countermeasure mixes every
//! tainted, blind-worthy constant with a process-wide random mask so the raw
//! bits never appear in the code stream.
//!
//! The masks are drawn once per process from the thread RNG and never change;
//! per-site rewrites (ALU pairs, xor-materialization, displacement shifts)
//! live in the selector.

use std::sync::OnceLock;

use rand::Rng;

struct Masks {
    mask32: u32,
    mask64: u64,
}

fn masks() -> &'static Masks {
    static MASKS: OnceLock<Masks> = OnceLock::new();
    MASKS.get_or_init(|| {
        let mut rng = rand::rng();
        Masks {
            mask32: rng.random(),
            mask64: rng.random(),
        }
    })
}

/// The 32-bit process blind mask.
pub fn mask32() -> u32 {
    masks().mask32
}

/// The 64-bit process blind mask.
pub fn mask64() -> u64 {
    masks().mask64
}

/// The offset mixed into blinded memory displacements.
pub fn disp_offset() -> i32 {
    masks().mask32 as i32
}

/// Is a constant worth blinding? Small values make poor forged instructions
/// (their useful encodings need multi-byte immediates an attacker cannot
/// choose freely), so only values outside the 16-bit window are rewritten.
pub fn should_blind(v: i64) -> bool {
    !(-0xffff..=0xffff).contains(&v)
}

pub fn should_blind32(v: i32) -> bool {
    should_blind(v as i64)
}

pub fn should_blind64(v: u64) -> bool {
    // Sign-extended small negatives are as harmless as small positives.
    should_blind(v as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_are_stable_across_calls() {
        assert_eq!(mask32(), mask32());
        assert_eq!(mask64(), mask64());
    }

    #[test]
    fn small_constants_are_not_blinded() {
        assert!(!should_blind(0));
        assert!(!should_blind(42));
        assert!(!should_blind(-1));
        assert!(!should_blind(0xffff));
        assert!(should_blind(0x10000));
        assert!(should_blind(0x11223344));
        assert!(should_blind(-0x7fff_ffff));
        assert!(should_blind64(0xdead_beef_dead_beef));
    }
}
