//! Randomness sources, split into "public" (wire-visible, e.g. padding and
//! nonces) and "private" (secret key material) the way the reference
//! implementation's `crypto/rand` usage is split by call site, even though
//! both currently draw from the same CSPRNG.

use rand::{CryptoRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// A source of randomness suitable both for wire-visible filler (padding,
/// per-datagram nonces) and for secret key/session-id material.
pub trait Generator {
    /// Fills `dest` with bytes that will be observable on the wire.
    fn public_random_fill(&mut self, dest: &mut [u8]);

    /// Fills `dest` with bytes that must remain secret (keys, session
    /// identifiers used as capability tokens).
    fn private_random_fill(&mut self, dest: &mut [u8]);
}

/// The real generator, backed by ChaCha20 seeded from the OS CSPRNG.
pub struct DefaultGenerator {
    rng: ChaCha20Rng,
}

impl DefaultGenerator {
    pub fn new() -> Self {
        Self {
            rng: ChaCha20Rng::from_entropy(),
        }
    }
}

impl Default for DefaultGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Generator for DefaultGenerator {
    fn public_random_fill(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest);
    }

    fn private_random_fill(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest);
    }
}

impl RngCore for DefaultGenerator {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}

impl CryptoRng for DefaultGenerator {}

pub mod testing {
    use super::Generator;

    /// A deterministic fill for tests: each output byte is `seed ^ index`.
    pub struct Generator {
        seed: u8,
    }

    impl Generator {
        pub fn new(seed: u8) -> Self {
            Self { seed }
        }
    }

    impl super::Generator for Generator {
        fn public_random_fill(&mut self, dest: &mut [u8]) {
            for (i, b) in dest.iter_mut().enumerate() {
                *b = self.seed ^ (i as u8);
            }
        }

        fn private_random_fill(&mut self, dest: &mut [u8]) {
            self.public_random_fill(dest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testing_generator_is_deterministic() {
        let mut a = testing::Generator::new(0x42);
        let mut b = testing::Generator::new(0x42);
        let mut buf_a = [0u8; 8];
        let mut buf_b = [0u8; 8];
        a.public_random_fill(&mut buf_a);
        b.public_random_fill(&mut buf_b);
        assert_eq!(buf_a, buf_b);
    }

    #[test]
    fn default_generator_fills_nonzero() {
        let mut gen = DefaultGenerator::new();
        let mut buf = [0u8; 32];
        gen.public_random_fill(&mut buf);
        assert!(buf.iter().any(|&b| b != 0));
    }
}
