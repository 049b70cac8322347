//! Deterministic seeding

use std::hash::Hasher;

use fnv::FnvHasher;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Derives independent, reproducible generators from one configured seed
///
/// Each consumer asks for a generator by name; the same seed and name always
/// yield the same stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedSequence {
    seed: u64,
}

impl SeedSequence {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Generator for a named consumer
    pub fn generator(&self, name: &str) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(stream_id(name));
        rng
    }
}

fn stream_id(name: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish()
}
