//! A small, seedable, xorshift/multiply PRNG used for the Memory Space's
//! randomized block placement. Uniform-enough over a small block count is
//! all that's required; it is not cryptographic.
//!
//! Thread-safe via a single dedicated mutex, which is always a leaf in
//! the lock order: it is never held while any other lock in this crate
//! is taken.

use std::sync::Mutex;

pub struct Prng {
    state: Mutex<u64>,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // xorshift64* requires a nonzero seed.
        Prng { state: Mutex::new(if seed == 0 { 0x9E3779B97F4A7C15 } else { seed }) }
    }

    pub fn next_u64(&self) -> u64 {
        let mut s = self.state.lock().unwrap();
        let mut x = *s;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        *s = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// A value in `[0, bound)`. Panics if `bound == 0`.
    pub fn gen_range(&self, bound: usize) -> usize {
        assert!(bound > 0, "gen_range of an empty range");
        (self.next_u64() % bound as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_under_fixed_seed() {
        let a = Prng::new(42);
        let b = Prng::new(42);
        let seq_a: Vec<u64> = (0..16).map(|_| a.next_u64()).collect();
        let seq_b: Vec<u64> = (0..16).map(|_| b.next_u64()).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn gen_range_stays_in_bounds() {
        let p = Prng::new(7);
        for _ in 0..1000 {
            assert!(p.gen_range(5) < 5);
        }
    }
}
