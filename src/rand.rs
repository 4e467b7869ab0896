//! Random numbers for the lottery scheduler.

use rand_core::{RngCore, SeedableRng, impls, le};

/// xorshift64* generator. Small, fast and plenty for drawing lottery tickets.
#[derive(Debug, Clone)]
pub struct XorShift64Star {
    state: u64,
}

impl XorShift64Star {
    /// Any nonzero state works; zero would get stuck.
    const FALLBACK: u64 = 0x9e37_79b9_7f4a_7c15;
}

impl RngCore for XorShift64Star {
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for XorShift64Star {
    type Seed = [u8; 8];

    fn from_seed(seed: Self::Seed) -> Self {
        let mut state = [0u64; 1];
        le::read_u64_into(&seed, &mut state);

        Self {
            state: match state[0] {
                0 => Self::FALLBACK,
                s => s,
            },
        }
    }
}

/// Uniform integer in `[0, bound)`. Rejects the top partial range, so there is no modulo bias.
pub fn below<R: RngCore + ?Sized>(rng: &mut R, bound: u64) -> u64 {
    assert_ne!(bound, 0, "below: empty range");

    let zone = u64::MAX - u64::MAX % bound;
    loop {
        let value = rng.next_u64();
        if value < zone {
            return value % bound;
        }
    }
}
