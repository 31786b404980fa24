// rng.rs — Small deterministic PRNG (xorshift64).
//
// Used for reproducible synthetic weights and inputs, and for the host
// backend's out-of-order scheduling choices. Not cryptographic.

#[derive(Debug, Clone)]
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        // Zero is a fixed point of xorshift.
        SimpleRng { state: seed.max(1) }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Random index in [0, n).
    pub fn next_usize(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }

    /// Uniform f32 in [lo, hi).
    pub fn next_f32(&mut self, lo: f32, hi: f32) -> f32 {
        // Top 24 bits give an exactly representable fraction.
        let unit = (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32;
        lo + (hi - lo) * unit
    }

    /// `len` draws of `next_f32(lo, hi)`.
    pub fn uniform(&mut self, len: usize, lo: f32, hi: f32) -> Vec<f32> {
        (0..len).map(|_| self.next_f32(lo, hi)).collect()
    }
}
