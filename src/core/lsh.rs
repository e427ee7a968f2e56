//! Random-hyperplane LSH partitioner.
//!
//! `num_bands * rows_per_band` Gaussian hyperplanes are drawn from a fixed
//! seed; the sign of each projection is one bit of the signature. Nothing
//! is trained, so a given vector maps to the same signature forever.

use core::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::QuantizerError;
use crate::prng::Prng;
use crate::quantizer::RegionId;
use crate::vector;

/// Quantizations required before saturation is judged.
pub const SATURATION_MIN_SAMPLES: u64 = 128;
/// A bit is saturated when its ones-ratio is outside `[r, 1 - r]`.
pub const SATURATION_RATIO: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LshConfig {
    pub num_bands: usize,
    pub rows_per_band: usize,
    pub seed: u64,
    /// Lowest-confidence bits considered for flipping in `nearby_regions`.
    pub max_flip_bits: usize,
}

impl Default for LshConfig {
    fn default() -> Self {
        Self {
            num_bands: 4,
            rows_per_band: 4,
            seed: 0x4c53_4800,
            max_flip_bits: 8,
        }
    }
}

impl LshConfig {
    pub fn with_bands(mut self, num_bands: usize, rows_per_band: usize) -> Self {
        self.num_bands = num_bands;
        self.rows_per_band = rows_per_band;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_flip_bits(mut self, bits: usize) -> Self {
        self.max_flip_bits = bits;
        self
    }

    pub fn total_bits(&self) -> usize {
        self.num_bands.saturating_mul(self.rows_per_band)
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.num_bands == 0 || self.rows_per_band == 0 {
            return Err("num_bands and rows_per_band must be > 0");
        }
        if self.total_bits() > 64 {
            return Err("num_bands * rows_per_band must be <= 64");
        }
        if self.max_flip_bits > 16 {
            return Err("max_flip_bits must be <= 16");
        }
        Ok(())
    }
}

pub struct LshPartitioner {
    cfg: LshConfig,
    dim: usize,
    /// Row-major `[bit][dim]`.
    planes: Vec<f32>,
    ones: Box<[AtomicU64]>,
    samples: AtomicU64,
}

impl LshPartitioner {
    pub fn new(cfg: LshConfig, dim: usize) -> Result<Self, QuantizerError> {
        cfg.validate().map_err(QuantizerError::InvalidConfig)?;
        if dim == 0 {
            return Err(QuantizerError::InvalidConfig("dim must be > 0"));
        }

        let bits = cfg.total_bits();
        let mut planes = Vec::with_capacity(bits * dim);
        for band in 0..cfg.num_bands {
            // One stream per band: band b's planes do not depend on the band count.
            let mut rng = Prng::derive(cfg.seed, band as u64);
            for _ in 0..cfg.rows_per_band * dim {
                planes.push(rng.next_gaussian());
            }
        }

        Ok(Self {
            ones: (0..bits).map(|_| AtomicU64::new(0)).collect(),
            samples: AtomicU64::new(0),
            cfg,
            dim,
            planes,
        })
    }

    pub fn config(&self) -> &LshConfig {
        &self.cfg
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn width(&self) -> u8 {
        self.cfg.total_bits() as u8
    }

    fn check_dim(&self, v: &[f32]) -> Result<(), QuantizerError> {
        if v.len() != self.dim {
            return Err(QuantizerError::DimensionMismatch {
                expected: self.dim,
                got: v.len(),
            });
        }
        Ok(())
    }

    fn projections(&self, v: &[f32]) -> Vec<f32> {
        self.planes
            .chunks_exact(self.dim)
            .map(|plane| vector::dot(plane, v))
            .collect()
    }

    fn signature(projections: &[f32]) -> u64 {
        projections
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, p)| if *p >= 0.0 { acc | (1 << i) } else { acc })
    }

    /// Sign-bit signature of `v`.
    pub fn quantize(&self, v: &[f32]) -> Result<RegionId, QuantizerError> {
        self.check_dim(v)?;
        let bits = Self::signature(&self.projections(v));

        self.samples.fetch_add(1, AtomicOrdering::Relaxed);
        for (i, counter) in self.ones.iter().enumerate() {
            if bits & (1 << i) != 0 {
                counter.fetch_add(1, AtomicOrdering::Relaxed);
            }
        }

        Ok(RegionId::Signature {
            bits,
            width: self.width(),
        })
    }

    /// Up to `k` signatures ordered by plausibility: the base signature first,
    /// then variants with low-confidence bits flipped, cheapest total margin first.
    ///
    /// Only the `max_flip_bits` bits with the smallest |projection| are
    /// candidates. Subsets of them are enumerated best-first, so the result
    /// for `k` is always a prefix of the result for `k + 1`.
    pub fn nearby_regions(&self, v: &[f32], k: usize) -> Result<Vec<RegionId>, QuantizerError> {
        self.check_dim(v)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let proj = self.projections(v);
        let base = Self::signature(&proj);
        let width = self.width();

        let mut order: Vec<usize> = (0..proj.len()).collect();
        order.sort_by(|&a, &b| proj[a].abs().total_cmp(&proj[b].abs()).then(a.cmp(&b)));
        order.truncate(self.cfg.max_flip_bits.min(proj.len()));
        let margins: Vec<f32> = order.iter().map(|&i| proj[i].abs()).collect();

        let mut out = Vec::with_capacity(k);
        out.push(RegionId::Signature { bits: base, width });
        if margins.is_empty() {
            return Ok(out);
        }

        let mut heap = BinaryHeap::new();
        heap.push(Reverse(FlipSet {
            cost: margins[0],
            mask: 1,
            last: 0,
        }));

        while out.len() < k {
            let Some(Reverse(set)) = heap.pop() else {
                break;
            };

            let mut flipped = base;
            for (j, &bit) in order.iter().enumerate() {
                if set.mask & (1 << j) != 0 {
                    flipped ^= 1 << bit;
                }
            }
            out.push(RegionId::Signature {
                bits: flipped,
                width,
            });

            let next = set.last + 1;
            if next < margins.len() {
                // Extend: add the next bit.
                heap.push(Reverse(FlipSet {
                    cost: set.cost + margins[next],
                    mask: set.mask | (1 << next),
                    last: next,
                }));
                // Shift: replace the last bit with the next one.
                heap.push(Reverse(FlipSet {
                    cost: set.cost - margins[set.last] + margins[next],
                    mask: (set.mask & !(1 << set.last)) | (1 << next),
                    last: next,
                }));
            }
        }

        Ok(out)
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(AtomicOrdering::Relaxed)
    }

    /// Bits whose ones-ratio has stayed outside `[1%, 99%]`.
    /// Empty until `SATURATION_MIN_SAMPLES` quantizations have been seen.
    pub fn saturated_bits(&self) -> Vec<usize> {
        let n = self.samples();
        if n < SATURATION_MIN_SAMPLES {
            return Vec::new();
        }
        self.ones
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let ratio = c.load(AtomicOrdering::Relaxed) as f64 / n as f64;
                (ratio < SATURATION_RATIO || ratio > 1.0 - SATURATION_RATIO).then_some(i)
            })
            .collect()
    }

    /// Number of distinct signatures this partitioner can emit.
    pub fn capacity(&self) -> u64 {
        let bits = self.cfg.total_bits();
        if bits >= 64 {
            u64::MAX
        } else {
            1u64 << bits
        }
    }
}

impl core::fmt::Debug for LshPartitioner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LshPartitioner")
            .field("cfg", &self.cfg)
            .field("dim", &self.dim)
            .field("samples", &self.samples())
            .finish()
    }
}

/// A subset of candidate flip bits, ordered by total margin.
#[derive(Debug, Clone, Copy)]
struct FlipSet {
    cost: f32,
    mask: u32,
    last: usize,
}

impl PartialEq for FlipSet {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FlipSet {}

impl PartialOrd for FlipSet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlipSet {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cost
            .total_cmp(&other.cost)
            .then(self.mask.count_ones().cmp(&other.mask.count_ones()))
            .then(self.mask.cmp(&other.mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::FeatureVector;

    fn random_unit(rng: &mut Prng, dim: usize) -> FeatureVector {
        FeatureVector::from_raw((0..dim).map(|_| rng.next_gaussian()).collect())
    }

    fn bits(r: &RegionId) -> u64 {
        match r {
            RegionId::Signature { bits, .. } => *bits,
            RegionId::Code(_) => panic!("expected signature"),
        }
    }

    #[test]
    fn quantization_is_stable_and_seed_dependent() {
        let a = LshPartitioner::new(LshConfig::default(), 32).unwrap();
        let b = LshPartitioner::new(LshConfig::default(), 32).unwrap();
        let c = LshPartitioner::new(LshConfig::default().with_seed(7), 32).unwrap();
        let mut rng = Prng::new(11);
        let mut differs = 0;
        for _ in 0..20 {
            let v = random_unit(&mut rng, 32);
            assert_eq!(a.quantize(v.as_slice()).unwrap(), a.quantize(v.as_slice()).unwrap());
            assert_eq!(a.quantize(v.as_slice()).unwrap(), b.quantize(v.as_slice()).unwrap());
            if a.quantize(v.as_slice()).unwrap() != c.quantize(v.as_slice()).unwrap() {
                differs += 1;
            }
        }
        assert!(differs > 0);
    }

    #[test]
    fn nearby_starts_with_base_and_flips_low_margin_bits() {
        let lsh = LshPartitioner::new(LshConfig::default(), 32).unwrap();
        let mut rng = Prng::new(5);
        let v = random_unit(&mut rng, 32);
        let base = lsh.quantize(v.as_slice()).unwrap();
        let near = lsh.nearby_regions(v.as_slice(), 6).unwrap();
        assert_eq!(near.len(), 6);
        assert_eq!(near[0], base);

        // The first neighbour flips exactly the least confident bit.
        let proj = lsh.projections(v.as_slice());
        let weakest = (0..proj.len())
            .min_by(|&a, &b| proj[a].abs().total_cmp(&proj[b].abs()))
            .unwrap();
        assert_eq!(bits(&near[1]) ^ bits(&base), 1 << weakest);

        let mut unique = near.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), near.len());
    }

    #[test]
    fn nearby_enumeration_is_prefix_stable_and_bounded() {
        let cfg = LshConfig::default().with_bands(1, 3).with_max_flip_bits(3);
        let lsh = LshPartitioner::new(cfg, 16).unwrap();
        let mut rng = Prng::new(9);
        let v = random_unit(&mut rng, 16);
        let all = lsh.nearby_regions(v.as_slice(), 100).unwrap();
        // Base plus every non-empty subset of three bits.
        assert_eq!(all.len(), 8);
        let few = lsh.nearby_regions(v.as_slice(), 4).unwrap();
        assert_eq!(&all[..4], &few[..]);
    }

    #[test]
    fn small_perturbations_mostly_keep_their_region() {
        let lsh = LshPartitioner::new(LshConfig::default(), 128).unwrap();
        let mut rng = Prng::new(21);
        let base = random_unit(&mut rng, 128);
        let region = lsh.quantize(base.as_slice()).unwrap();
        let mut same = 0;
        for _ in 0..20 {
            let noise: Vec<f32> = (0..128).map(|_| rng.next_gaussian()).collect();
            let noise = FeatureVector::from_raw(noise);
            let perturbed: Vec<f32> = base
                .as_slice()
                .iter()
                .zip(noise.as_slice())
                .map(|(b, n)| b + 0.05 * n)
                .collect();
            if lsh.quantize(&perturbed).unwrap() == region {
                same += 1;
            }
        }
        assert!(same >= 10, "only {same}/20 kept their region");
    }

    #[test]
    fn constant_input_saturates_every_bit() {
        let lsh = LshPartitioner::new(LshConfig::default(), 8).unwrap();
        let v = FeatureVector::uniform(8);
        for _ in 0..(SATURATION_MIN_SAMPLES - 1) {
            lsh.quantize(v.as_slice()).unwrap();
        }
        assert!(lsh.saturated_bits().is_empty());
        lsh.quantize(v.as_slice()).unwrap();
        assert_eq!(lsh.saturated_bits().len(), 16);
    }

    #[test]
    fn rejects_wrong_dimension_and_oversized_signatures() {
        let lsh = LshPartitioner::new(LshConfig::default(), 8).unwrap();
        assert!(matches!(
            lsh.quantize(&[0.0; 4]),
            Err(QuantizerError::DimensionMismatch { expected: 8, got: 4 })
        ));
        assert!(LshPartitioner::new(LshConfig::default().with_bands(9, 8), 8).is_err());
    }
}
