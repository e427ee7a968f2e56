// Minimal PRNG (no external crates).
//
// This is NOT cryptographically secure.
// It seeds hyperplanes, codebook embeddings and integrity sampling, all of
// which must be reproducible from a config seed.

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
    spare_gaussian: Option<f32>,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // Avoid a zero state.
        let seed = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
        Self {
            state: seed,
            spare_gaussian: None,
        }
    }

    /// Independent stream for `(seed, stream)`.
    ///
    /// Streams are decorrelated through splitmix64 so that e.g. LSH band `b`
    /// gets the same hyperplanes regardless of how many bands precede it.
    pub fn derive(seed: u64, stream: u64) -> Self {
        let mut z = seed ^ stream.wrapping_mul(0xD1B54A32D192ED03);
        z = z.wrapping_add(0x9E3779B97F4A7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        Self::new(z ^ (z >> 31))
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    #[inline]
    pub fn next_f32_01(&mut self) -> f32 {
        // Convert to [0,1).
        let x = self.next_u32();
        (x as f32) / (u32::MAX as f32 + 1.0)
    }

    #[inline]
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32_01()
    }

    #[inline]
    pub fn gen_range_usize(&mut self, low: usize, high: usize) -> usize {
        if high <= low {
            return low;
        }
        let span = (high - low) as u64;
        low + (self.next_u64() % span) as usize
    }

    /// Standard normal sample (Box-Muller, the second value is cached).
    pub fn next_gaussian(&mut self) -> f32 {
        if let Some(z) = self.spare_gaussian.take() {
            return z;
        }
        // u1 in (0,1] so ln() stays finite.
        let u1 = 1.0 - self.next_f32_01();
        let u2 = self.next_f32_01();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = core::f32::consts::TAU * u2;
        self.spare_gaussian = Some(r * theta.sin());
        r * theta.cos()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Prng::new(7);
        let mut b = Prng::new(7);
        for _ in 0..64 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn derived_streams_differ() {
        let mut a = Prng::derive(42, 0);
        let mut b = Prng::derive(42, 1);
        let same = (0..32).filter(|_| a.next_u64() == b.next_u64()).count();
        assert_eq!(same, 0);
    }

    #[test]
    fn gaussian_has_roughly_unit_variance() {
        let mut rng = Prng::new(99);
        let n = 20_000;
        let samples: Vec<f32> = (0..n).map(|_| rng.next_gaussian()).collect();
        let mean = samples.iter().sum::<f32>() / n as f32;
        let var = samples.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n as f32;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.1, "var {var}");
    }

    #[test]
    fn gen_range_usize_stays_in_bounds() {
        let mut rng = Prng::new(3);
        for _ in 0..1000 {
            let v = rng.gen_range_usize(5, 9);
            assert!((5..9).contains(&v));
        }
        assert_eq!(rng.gen_range_usize(4, 4), 4);
    }
}
