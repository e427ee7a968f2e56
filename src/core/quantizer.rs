//! Region quantization behind one interface.
//!
//! Two strategies, chosen per instance by `QuantizerConfig`:
//! - `Lsh`: static random-hyperplane signatures
//! - `Codebook`: learned vector quantization with EMA updates
//!
//! Callers only need to know which one is active when reading stats.

use core::fmt;
use core::str::FromStr;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use tracing::{info, warn};

use crate::codebook::{CodebookConfig, CodebookSnapshot, LearnedCodebook};
use crate::error::QuantizerError;
use crate::lsh::{LshConfig, LshPartitioner};
use crate::storage;
use crate::vector::FeatureVector;

/// Codebook perplexity below this (after warm-up) counts as collapse.
pub const COLLAPSE_PERPLEXITY: f32 = 1.5;

/// Discrete bucket a feature vector quantizes into.
///
/// Text form: `lsh:<bits as binary, width chars>` or `vq:<code>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegionId {
    Signature { bits: u64, width: u8 },
    Code(u32),
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RegionId::Signature { bits, width } => {
                f.write_str("lsh:")?;
                for i in (0..width).rev() {
                    f.write_str(if bits >> i & 1 == 1 { "1" } else { "0" })?;
                }
                Ok(())
            }
            RegionId::Code(code) => write!(f, "vq:{code}"),
        }
    }
}

impl fmt::Debug for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegionId({self})")
    }
}

impl FromStr for RegionId {
    type Err = QuantizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || QuantizerError::MalformedRegion(s.to_string());
        if let Some(sig) = s.strip_prefix("lsh:") {
            if sig.is_empty() || sig.len() > 64 || !sig.bytes().all(|b| b == b'0' || b == b'1') {
                return Err(malformed());
            }
            let bits = u64::from_str_radix(sig, 2).map_err(|_| malformed())?;
            return Ok(RegionId::Signature {
                bits,
                width: sig.len() as u8,
            });
        }
        if let Some(code) = s.strip_prefix("vq:") {
            return code.parse().map(RegionId::Code).map_err(|_| malformed());
        }
        Err(malformed())
    }
}

#[cfg(feature = "serde")]
impl Serialize for RegionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for RegionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

const REGION_KIND_SIGNATURE: u8 = 1;
const REGION_KIND_CODE: u8 = 2;

pub(crate) fn write_region<W: Write>(w: &mut W, region: &RegionId) -> io::Result<()> {
    match *region {
        RegionId::Signature { bits, width } => {
            storage::write_u8(w, REGION_KIND_SIGNATURE)?;
            storage::write_u8(w, width)?;
            storage::write_u64_le(w, bits)
        }
        RegionId::Code(code) => {
            storage::write_u8(w, REGION_KIND_CODE)?;
            storage::write_u32_le(w, code)
        }
    }
}

pub(crate) fn read_region<R: Read>(r: &mut R) -> io::Result<RegionId> {
    match storage::read_u8(r)? {
        REGION_KIND_SIGNATURE => {
            let width = storage::read_u8(r)?;
            let bits = storage::read_u64_le(r)?;
            if width == 0 || width > 64 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "bad signature width"));
            }
            Ok(RegionId::Signature { bits, width })
        }
        REGION_KIND_CODE => Ok(RegionId::Code(storage::read_u32_le(r)?)),
        _ => Err(io::Error::new(io::ErrorKind::InvalidData, "unknown region kind")),
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum QuantizerConfig {
    Lsh(LshConfig),
    Codebook(CodebookConfig),
}

impl Default for QuantizerConfig {
    fn default() -> Self {
        QuantizerConfig::Codebook(CodebookConfig::default())
    }
}

impl QuantizerConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        match self {
            QuantizerConfig::Lsh(c) => c.validate(),
            QuantizerConfig::Codebook(c) => c.validate(),
        }
    }

    pub fn kind(&self) -> QuantizerKind {
        match self {
            QuantizerConfig::Lsh(_) => QuantizerKind::Lsh,
            QuantizerConfig::Codebook(_) => QuantizerKind::Codebook,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum QuantizerKind {
    Lsh,
    Codebook,
}

/// Degenerate-but-not-fatal quantizer states.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum Degeneracy {
    /// Usage has concentrated on (nearly) one code.
    CodebookCollapse { perplexity: f32 },
    /// Signature bits that are (almost) always the same value.
    SignatureSaturation { saturated_bits: Vec<usize> },
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct QuantizerStats {
    pub kind: QuantizerKind,
    /// Codebook usage perplexity. The LSH strategy keeps no usage distribution
    /// and reports 0 here; the resolver fills it from activation counts.
    pub perplexity: f32,
    pub utilization: f32,
    pub active_codes: usize,
    /// Number of distinct regions the quantizer can emit.
    pub capacity: u64,
    pub updates: u64,
    pub degenerate: Option<Degeneracy>,
}

#[derive(Debug)]
pub enum Strategy {
    Lsh(LshPartitioner),
    Codebook(LearnedCodebook),
}

#[derive(Debug)]
pub struct RegionQuantizer {
    strategy: Strategy,
    /// Set while a degeneracy is being reported; logs fire on transitions only.
    degenerate: AtomicBool,
}

impl RegionQuantizer {
    pub fn new(cfg: &QuantizerConfig, dim: usize) -> Result<Self, QuantizerError> {
        let strategy = match cfg {
            QuantizerConfig::Lsh(c) => Strategy::Lsh(LshPartitioner::new(c.clone(), dim)?),
            QuantizerConfig::Codebook(c) => {
                Strategy::Codebook(LearnedCodebook::new(c.clone(), dim)?)
            }
        };
        Ok(Self::from_strategy(strategy))
    }

    pub fn from_strategy(strategy: Strategy) -> Self {
        Self {
            strategy,
            degenerate: AtomicBool::new(false),
        }
    }

    /// Codebook strategy restored from a snapshot.
    pub fn from_snapshot(
        snapshot: CodebookSnapshot,
        cfg: CodebookConfig,
    ) -> Result<Self, QuantizerError> {
        LearnedCodebook::import(snapshot, cfg).map(|cb| Self::from_strategy(Strategy::Codebook(cb)))
    }

    pub fn kind(&self) -> QuantizerKind {
        match self.strategy {
            Strategy::Lsh(_) => QuantizerKind::Lsh,
            Strategy::Codebook(_) => QuantizerKind::Codebook,
        }
    }

    pub fn dim(&self) -> usize {
        match &self.strategy {
            Strategy::Lsh(l) => l.dim(),
            Strategy::Codebook(c) => c.dim(),
        }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn codebook(&self) -> Option<&LearnedCodebook> {
        match &self.strategy {
            Strategy::Codebook(c) => Some(c),
            Strategy::Lsh(_) => None,
        }
    }

    pub fn export_codebook(&self) -> Option<CodebookSnapshot> {
        self.codebook().map(LearnedCodebook::export)
    }

    /// Same vector, same region, as long as no `update` intervenes.
    pub fn quantize(&self, v: &FeatureVector) -> Result<RegionId, QuantizerError> {
        match &self.strategy {
            Strategy::Lsh(l) => l.quantize(v.as_slice()),
            Strategy::Codebook(c) => Ok(RegionId::Code(c.quantize(v.as_slice())? as u32)),
        }
    }

    /// Up to `k` candidate regions, most plausible first; the first entry is
    /// always `quantize(v)`.
    pub fn nearby_regions(
        &self,
        v: &FeatureVector,
        k: usize,
    ) -> Result<Vec<RegionId>, QuantizerError> {
        match &self.strategy {
            Strategy::Lsh(l) => l.nearby_regions(v.as_slice(), k),
            Strategy::Codebook(c) => Ok(c
                .nearest_k(v.as_slice(), k)?
                .into_iter()
                .map(|i| RegionId::Code(i as u32))
                .collect()),
        }
    }

    /// Whether `region` is an address this quantizer can produce.
    pub fn owns(&self, region: &RegionId) -> bool {
        match (&self.strategy, region) {
            (Strategy::Lsh(l), RegionId::Signature { width, .. }) => *width == l.width(),
            (Strategy::Codebook(c), RegionId::Code(code)) => (*code as usize) < c.size(),
            _ => false,
        }
    }

    /// Quantize and learn from `v` in one step. Static for LSH.
    ///
    /// Requires `&mut self`: holding the write lock around this call is what
    /// makes quantize-then-update atomic.
    pub fn update(&mut self, v: &FeatureVector) -> Result<RegionId, QuantizerError> {
        let region = match &mut self.strategy {
            Strategy::Lsh(l) => l.quantize(v.as_slice())?,
            Strategy::Codebook(c) => RegionId::Code(c.update(v.as_slice())? as u32),
        };
        if matches!(self.strategy, Strategy::Codebook(_)) {
            self.track_degeneracy(self.degeneracy());
        }
        Ok(region)
    }

    pub fn is_learned(&self) -> bool {
        matches!(self.strategy, Strategy::Codebook(_))
    }

    fn degeneracy(&self) -> Option<Degeneracy> {
        match &self.strategy {
            Strategy::Codebook(c) => {
                let warm = c.updates() >= 2 * c.size() as u64;
                let perplexity = c.perplexity();
                (warm && perplexity < COLLAPSE_PERPLEXITY)
                    .then_some(Degeneracy::CodebookCollapse { perplexity })
            }
            Strategy::Lsh(l) => {
                let saturated_bits = l.saturated_bits();
                (!saturated_bits.is_empty())
                    .then_some(Degeneracy::SignatureSaturation { saturated_bits })
            }
        }
    }

    fn track_degeneracy(&self, current: Option<Degeneracy>) {
        let was = self.degenerate.swap(current.is_some(), Ordering::Relaxed);
        match (&current, was) {
            (Some(d), false) => warn!(degeneracy = ?d, "quantizer degenerate"),
            (None, true) => info!("quantizer recovered from degenerate state"),
            _ => {}
        }
    }

    pub fn stats(&self) -> QuantizerStats {
        let degenerate = self.degeneracy();
        self.track_degeneracy(degenerate.clone());
        match &self.strategy {
            Strategy::Codebook(c) => QuantizerStats {
                kind: QuantizerKind::Codebook,
                perplexity: c.perplexity(),
                utilization: c.utilization(),
                active_codes: c.active_codes(),
                capacity: c.size() as u64,
                updates: c.updates(),
                degenerate,
            },
            Strategy::Lsh(l) => QuantizerStats {
                kind: QuantizerKind::Lsh,
                perplexity: 0.0,
                utilization: 0.0,
                active_codes: 0,
                capacity: l.capacity(),
                updates: l.samples(),
                degenerate,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prng::Prng;

    fn random_unit(rng: &mut Prng, dim: usize) -> FeatureVector {
        FeatureVector::from_raw((0..dim).map(|_| rng.next_gaussian()).collect())
    }

    #[test]
    fn region_text_form_round_trips() {
        let sig = RegionId::Signature {
            bits: 0b1011,
            width: 6,
        };
        assert_eq!(sig.to_string(), "lsh:001011");
        assert_eq!("lsh:001011".parse::<RegionId>().unwrap(), sig);
        assert_eq!("vq:17".parse::<RegionId>().unwrap(), RegionId::Code(17));
        assert!("vq:-1".parse::<RegionId>().is_err());
        assert!("lsh:0120".parse::<RegionId>().is_err());
        assert!("17".parse::<RegionId>().is_err());
    }

    #[test]
    fn region_binary_form_round_trips() {
        let regions = [
            RegionId::Code(3),
            RegionId::Signature {
                bits: u64::MAX,
                width: 64,
            },
        ];
        let mut buf = Vec::new();
        for r in &regions {
            write_region(&mut buf, r).unwrap();
        }
        let mut cursor = io::Cursor::new(&buf);
        for r in &regions {
            assert_eq!(read_region(&mut cursor).unwrap(), *r);
        }
    }

    #[test]
    fn both_strategies_keep_most_perturbations_in_place() {
        for cfg in [
            QuantizerConfig::Lsh(LshConfig::default()),
            QuantizerConfig::Codebook(CodebookConfig::default()),
        ] {
            let q = RegionQuantizer::new(&cfg, 64).unwrap();
            let mut rng = Prng::new(4);
            let base = random_unit(&mut rng, 64);
            let region = q.quantize(&base).unwrap();
            assert_eq!(q.nearby_regions(&base, 3).unwrap()[0], region);

            let same = (0..20)
                .filter(|_| {
                    let noisy: Vec<f32> = base
                        .as_slice()
                        .iter()
                        .map(|x| x + 0.05 / 8.0 * rng.next_gaussian())
                        .collect();
                    q.quantize(&FeatureVector::from_raw(noisy)).unwrap() == region
                })
                .count();
            assert!(same >= 10, "{:?}: {same}/20", cfg.kind());
        }
    }

    #[test]
    fn identical_input_collapses_codebook_and_is_reported() {
        let cfg = QuantizerConfig::Codebook(CodebookConfig::default().with_size(4));
        let mut q = RegionQuantizer::new(&cfg, 8).unwrap();
        let v = FeatureVector::uniform(8);
        for _ in 0..8 {
            q.update(&v).unwrap();
        }
        let stats = q.stats();
        assert_eq!(stats.active_codes, 1);
        assert!(matches!(
            stats.degenerate,
            Some(Degeneracy::CodebookCollapse { perplexity }) if perplexity < 1.5
        ));
    }

    #[test]
    fn lsh_update_is_static() {
        let mut q = RegionQuantizer::new(&QuantizerConfig::Lsh(LshConfig::default()), 16).unwrap();
        let mut rng = Prng::new(2);
        let v = random_unit(&mut rng, 16);
        let r = q.quantize(&v).unwrap();
        assert_eq!(q.update(&v).unwrap(), r);
        assert_eq!(q.quantize(&v).unwrap(), r);
        assert!(q.export_codebook().is_none());
        assert_eq!(q.stats().capacity, 1 << 16);
    }
}
