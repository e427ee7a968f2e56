//! Learned vector-quantization codebook with EMA updates.
//!
//! `quantize` is a pure nearest-embedding lookup (Euclidean, ties to the
//! lowest index). `update` moves only the winning embedding toward the input
//! and is the single mutation point; callers serialize it behind one lock.

use std::io;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::QuantizerError;
use crate::prng::Prng;
use crate::storage;
use crate::vector;

const TAG_META: [u8; 4] = *b"META";
const TAG_EMBEDDINGS: [u8; 4] = *b"EMBD";
const TAG_USAGE: [u8; 4] = *b"USAG";

/// Upper bound accepted when decoding snapshots.
const MAX_CODES: usize = 1 << 16;
const MAX_DIM: usize = 1 << 14;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CodebookConfig {
    pub codebook_size: usize,
    /// Steady-state EMA decay for the winning embedding.
    pub decay: f32,
    /// Decay used for the first `warmup_updates` updates. A fast early pull
    /// specializes each code to the inputs that first claim it; with a slow
    /// one, a single code drifts toward the mean input and captures everything.
    pub warmup_decay: f32,
    pub warmup_updates: u64,
    /// Decay of the per-code usage EMA.
    pub usage_decay: f32,
    /// Usage above this counts a code as active.
    pub active_epsilon: f32,
    /// Initial embedding norm. Must stay below 0.1.
    pub init_scale: f32,
    pub seed: u64,
}

impl Default for CodebookConfig {
    fn default() -> Self {
        Self {
            codebook_size: 64,
            decay: 0.99,
            warmup_decay: 0.5,
            warmup_updates: 256,
            usage_decay: 0.99,
            active_epsilon: 1.0e-3,
            init_scale: 0.08,
            seed: 0x5651_0001,
        }
    }
}

impl CodebookConfig {
    pub fn with_size(mut self, codebook_size: usize) -> Self {
        self.codebook_size = codebook_size;
        self
    }

    pub fn with_decay(mut self, decay: f32) -> Self {
        self.decay = decay;
        self
    }

    pub fn with_warmup(mut self, updates: u64, decay: f32) -> Self {
        self.warmup_updates = updates;
        self.warmup_decay = decay;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.codebook_size < 2 || self.codebook_size > MAX_CODES {
            return Err("codebook_size must be in [2, 65536]");
        }
        let unit = |x: f32| x.is_finite() && x > 0.0 && x < 1.0;
        if !unit(self.decay) {
            return Err("decay must be in (0, 1)");
        }
        if !unit(self.warmup_decay) {
            return Err("warmup_decay must be in (0, 1)");
        }
        if !unit(self.usage_decay) {
            return Err("usage_decay must be in (0, 1)");
        }
        if !self.active_epsilon.is_finite() || self.active_epsilon <= 0.0 {
            return Err("active_epsilon must be > 0");
        }
        if !(self.init_scale > 0.0 && self.init_scale < 0.1) {
            return Err("init_scale must be in (0, 0.1)");
        }
        Ok(())
    }
}

/// Full codebook state, sufficient to reproduce quantization exactly.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CodebookSnapshot {
    pub codebook_size: usize,
    pub embedding_dim: usize,
    pub codebook: Vec<Vec<f32>>,
    pub usage_ema: Vec<f32>,
    pub updates: u64,
}

#[derive(Debug, Clone)]
pub struct LearnedCodebook {
    cfg: CodebookConfig,
    dim: usize,
    /// Row-major `[code][dim]`.
    embeddings: Vec<f32>,
    usage: Vec<f32>,
    updates: u64,
}

impl LearnedCodebook {
    pub fn new(cfg: CodebookConfig, dim: usize) -> Result<Self, QuantizerError> {
        cfg.validate().map_err(QuantizerError::InvalidConfig)?;
        if dim == 0 || dim > MAX_DIM {
            return Err(QuantizerError::InvalidConfig("dim out of range"));
        }

        let mut rng = Prng::new(cfg.seed);
        let mut embeddings = Vec::with_capacity(cfg.codebook_size * dim);
        for _ in 0..cfg.codebook_size {
            let mut e: Vec<f32> = (0..dim).map(|_| rng.next_gaussian()).collect();
            vector::l2_normalize(&mut e);
            embeddings.extend(e.iter().map(|x| x * cfg.init_scale));
        }

        Ok(Self {
            usage: vec![0.0; cfg.codebook_size],
            updates: 0,
            cfg,
            dim,
            embeddings,
        })
    }

    pub fn config(&self) -> &CodebookConfig {
        &self.cfg
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn size(&self) -> usize {
        self.cfg.codebook_size
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn embedding(&self, code: usize) -> Option<&[f32]> {
        self.embeddings.chunks_exact(self.dim).nth(code)
    }

    pub fn usage(&self) -> &[f32] {
        &self.usage
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

    /// Index of the nearest embedding; ties go to the lowest index.
    pub fn quantize(&self, v: &[f32]) -> Result<usize, QuantizerError> {
        self.check_dim(v)?;
        let mut best = 0usize;
        let mut best_d = f32::INFINITY;
        for (i, e) in self.embeddings.chunks_exact(self.dim).enumerate() {
            let d = vector::squared_distance(e, v);
            if d < best_d {
                best_d = d;
                best = i;
            }
        }
        Ok(best)
    }

    /// The `k` nearest codes ordered by (distance, index).
    pub fn nearest_k(&self, v: &[f32], k: usize) -> Result<Vec<usize>, QuantizerError> {
        self.check_dim(v)?;
        let mut scored: Vec<(f32, usize)> = self
            .embeddings
            .chunks_exact(self.dim)
            .map(|e| vector::squared_distance(e, v))
            .zip(0..)
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        Ok(scored.into_iter().take(k).map(|(_, i)| i).collect())
    }

    /// Quantize, then pull the winner toward `v`. Returns the winning code.
    ///
    /// `new = decay * old + (1 - decay) * v`; every other embedding is left
    /// untouched. Usage EMAs decay for all codes and grow for the winner.
    pub fn update(&mut self, v: &[f32]) -> Result<usize, QuantizerError> {
        let code = self.quantize(v)?;
        let decay = if self.updates < self.cfg.warmup_updates {
            self.cfg.warmup_decay
        } else {
            self.cfg.decay
        };

        let start = code * self.dim;
        for (e, &x) in self.embeddings[start..start + self.dim].iter_mut().zip(v) {
            *e = decay * *e + (1.0 - decay) * x;
        }

        let ud = self.cfg.usage_decay;
        for (i, u) in self.usage.iter_mut().enumerate() {
            *u *= ud;
            if i == code {
                *u += 1.0 - ud;
            }
        }
        self.updates += 1;
        Ok(code)
    }

    /// `exp(-Σ p log p)` over normalized usage. 0 before any update.
    pub fn perplexity(&self) -> f32 {
        let total: f32 = self.usage.iter().sum();
        if total <= 0.0 {
            return 0.0;
        }
        let entropy: f32 = self
            .usage
            .iter()
            .filter(|u| **u > 0.0)
            .map(|u| {
                let p = u / total;
                -p * p.ln()
            })
            .sum();
        entropy.exp()
    }

    pub fn active_codes(&self) -> usize {
        self.usage
            .iter()
            .filter(|u| **u > self.cfg.active_epsilon)
            .count()
    }

    pub fn utilization(&self) -> f32 {
        self.active_codes() as f32 / self.size() as f32
    }

    /// Largest embedding norm.
    pub fn max_norm(&self) -> f32 {
        self.embeddings
            .chunks_exact(self.dim)
            .map(|e| vector::dot(e, e).sqrt())
            .fold(0.0, f32::max)
    }

    pub fn export(&self) -> CodebookSnapshot {
        CodebookSnapshot {
            codebook_size: self.size(),
            embedding_dim: self.dim,
            codebook: self
                .embeddings
                .chunks_exact(self.dim)
                .map(|e| e.to_vec())
                .collect(),
            usage_ema: self.usage.clone(),
            updates: self.updates,
        }
    }

    /// Rebuild from a snapshot. The snapshot's size wins over `cfg.codebook_size`.
    pub fn import(snapshot: CodebookSnapshot, mut cfg: CodebookConfig) -> Result<Self, QuantizerError> {
        let CodebookSnapshot {
            codebook_size,
            embedding_dim,
            codebook,
            usage_ema,
            updates,
        } = snapshot;

        if embedding_dim == 0 || embedding_dim > MAX_DIM {
            return Err(QuantizerError::InvalidSnapshot("embedding_dim out of range"));
        }
        if codebook.len() != codebook_size || usage_ema.len() != codebook_size {
            return Err(QuantizerError::InvalidSnapshot("codebook_size does not match contents"));
        }
        if codebook.iter().any(|e| e.len() != embedding_dim) {
            return Err(QuantizerError::InvalidSnapshot("embedding length mismatch"));
        }
        if codebook.iter().flatten().chain(usage_ema.iter()).any(|x| !x.is_finite()) {
            return Err(QuantizerError::InvalidSnapshot("non-finite value"));
        }

        cfg.codebook_size = codebook_size;
        cfg.validate().map_err(QuantizerError::InvalidConfig)?;

        Ok(Self {
            cfg,
            dim: embedding_dim,
            embeddings: codebook.into_iter().flatten().collect(),
            usage: usage_ema,
            updates,
        })
    }
}

/// Serialize a snapshot as a sealed `NCCODE01` image.
pub fn encode_snapshot(snapshot: &CodebookSnapshot) -> io::Result<Vec<u8>> {
    let mut image = Vec::new();
    storage::write_header(&mut image, storage::CODEBOOK_MAGIC)?;

    let mut meta = Vec::with_capacity(16);
    storage::write_u32_le(&mut meta, snapshot.codebook_size as u32)?;
    storage::write_u32_le(&mut meta, snapshot.embedding_dim as u32)?;
    storage::write_u64_le(&mut meta, snapshot.updates)?;
    storage::write_chunk(&mut image, TAG_META, &meta)?;

    let mut embd = Vec::with_capacity(snapshot.codebook_size * snapshot.embedding_dim * 4);
    for row in &snapshot.codebook {
        for &x in row {
            storage::write_f32_le(&mut embd, x)?;
        }
    }
    storage::write_chunk_v2_lz4(&mut image, TAG_EMBEDDINGS, &embd)?;

    let mut usage = Vec::with_capacity(snapshot.usage_ema.len() * 4);
    storage::write_f32_slice(&mut usage, &snapshot.usage_ema)?;
    storage::write_chunk(&mut image, TAG_USAGE, &usage)?;

    storage::seal(&mut image)?;
    Ok(image)
}

pub fn decode_snapshot(image: &[u8]) -> io::Result<CodebookSnapshot> {
    let body = storage::unseal(image)?;
    let mut cursor = io::Cursor::new(body);
    storage::read_header(&mut cursor, storage::CODEBOOK_MAGIC)?;
    let rest = &body[cursor.position() as usize..];

    let mut meta: Option<(usize, usize, u64)> = None;
    let mut flat: Option<Vec<u8>> = None;
    let mut usage: Option<Vec<f32>> = None;

    storage::for_each_chunk(rest, &[TAG_EMBEDDINGS], |tag, payload| {
        let mut r = io::Cursor::new(payload);
        match tag {
            TAG_META => {
                let size = storage::read_u32_le(&mut r)? as usize;
                let dim = storage::read_u32_le(&mut r)? as usize;
                let updates = storage::read_u64_le(&mut r)?;
                if size > MAX_CODES || dim > MAX_DIM {
                    return Err(invalid("codebook shape out of range"));
                }
                meta = Some((size, dim, updates));
            }
            TAG_EMBEDDINGS => flat = Some(payload.to_vec()),
            TAG_USAGE => usage = Some(storage::read_f32_vec(&mut r, MAX_CODES)?),
            _ => {}
        }
        Ok(())
    })?;

    let (codebook_size, embedding_dim, updates) = meta.ok_or_else(|| invalid("missing META"))?;
    let flat = flat.ok_or_else(|| invalid("missing EMBD"))?;
    let usage_ema = usage.ok_or_else(|| invalid("missing USAG"))?;
    if flat.len() != codebook_size * embedding_dim * 4 || embedding_dim == 0 {
        return Err(invalid("embedding chunk has wrong length"));
    }

    let values: Vec<f32> = flat
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let codebook = values.chunks_exact(embedding_dim).map(|e| e.to_vec()).collect();

    Ok(CodebookSnapshot {
        codebook_size,
        embedding_dim,
        codebook,
        usage_ema,
        updates,
    })
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::FeatureVector;

    fn random_unit(rng: &mut Prng, dim: usize) -> Vec<f32> {
        FeatureVector::from_raw((0..dim).map(|_| rng.next_gaussian()).collect()).to_vec()
    }

    #[test]
    fn initial_embeddings_are_small() {
        let cb = LearnedCodebook::new(CodebookConfig::default(), 32).unwrap();
        assert!(cb.max_norm() < 0.1);
        assert_eq!(cb.perplexity(), 0.0);
        assert_eq!(cb.active_codes(), 0);
    }

    #[test]
    fn ties_break_to_lowest_index() {
        let snap = CodebookSnapshot {
            codebook_size: 3,
            embedding_dim: 2,
            codebook: vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 0.0]],
            usage_ema: vec![0.0; 3],
            updates: 0,
        };
        let cb = LearnedCodebook::import(snap, CodebookConfig::default()).unwrap();
        assert_eq!(cb.quantize(&[1.0, 0.0]).unwrap(), 1);
        assert_eq!(cb.nearest_k(&[1.0, 0.0], 3).unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn only_the_winner_moves() {
        let mut cb = LearnedCodebook::new(CodebookConfig::default().with_size(8), 16).unwrap();
        let mut rng = Prng::new(3);
        let v = random_unit(&mut rng, 16);
        let before = cb.export();
        let code = cb.update(&v).unwrap();
        let after = cb.export();
        for i in 0..8 {
            if i == code {
                assert_ne!(before.codebook[i], after.codebook[i]);
            } else {
                assert_eq!(before.codebook[i], after.codebook[i]);
            }
        }
        assert_eq!(cb.active_codes(), 1);
        assert!((cb.perplexity() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn ema_converges_toward_cluster_center_without_diverging() {
        let mut cb = LearnedCodebook::new(CodebookConfig::default().with_size(16), 32).unwrap();
        let mut rng = Prng::new(17);
        let center = random_unit(&mut rng, 32);
        let code = cb.quantize(&center).unwrap();
        let start = cb.embedding(code).unwrap().to_vec();
        let start_dist = vector::squared_distance(&start, &center);

        for _ in 0..150 {
            let sample: Vec<f32> = center
                .iter()
                .map(|c| c + 0.01 * rng.next_gaussian())
                .collect();
            cb.update(&sample).unwrap();
        }

        let winner = cb.quantize(&center).unwrap();
        let end = cb.embedding(winner).unwrap();
        let max_change = end
            .iter()
            .zip(&start)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_change > 1e-3);
        assert!(vector::squared_distance(end, &center) < start_dist);
        assert!(cb.max_norm() < 1.5);
    }

    #[test]
    fn warmup_uses_faster_decay() {
        let cfg = CodebookConfig::default().with_size(4).with_warmup(1, 0.5);
        let mut cb = LearnedCodebook::new(cfg, 4).unwrap();
        let v = [1.0, 0.0, 0.0, 0.0];
        let code = cb.quantize(&v).unwrap();
        let old = cb.embedding(code).unwrap()[0];
        cb.update(&v).unwrap();
        let new = cb.embedding(code).unwrap()[0];
        assert!((new - (0.5 * old + 0.5)).abs() < 1e-6);
    }

    #[test]
    fn binary_round_trip_preserves_decisions_exactly() {
        let mut cb = LearnedCodebook::new(CodebookConfig::default(), 24).unwrap();
        let mut rng = Prng::new(8);
        for _ in 0..200 {
            cb.update(&random_unit(&mut rng, 24)).unwrap();
        }
        let image = encode_snapshot(&cb.export()).unwrap();
        let restored =
            LearnedCodebook::import(decode_snapshot(&image).unwrap(), CodebookConfig::default())
                .unwrap();
        assert_eq!(restored.export(), cb.export());
        for _ in 0..200 {
            let v = random_unit(&mut rng, 24);
            assert_eq!(cb.quantize(&v).unwrap(), restored.quantize(&v).unwrap());
        }
    }

    #[test]
    fn import_rejects_inconsistent_snapshots() {
        let mut snap = LearnedCodebook::new(CodebookConfig::default().with_size(4), 8)
            .unwrap()
            .export();
        snap.codebook[2].pop();
        assert!(matches!(
            LearnedCodebook::import(snap, CodebookConfig::default()),
            Err(QuantizerError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn diverse_inputs_spread_usage() {
        let mut cb = LearnedCodebook::new(CodebookConfig::default(), 64).unwrap();
        let mut rng = Prng::new(99);
        for _ in 0..100 {
            cb.update(&random_unit(&mut rng, 64)).unwrap();
        }
        assert!(cb.active_codes() > 1);
        assert!(cb.perplexity() > 2.0);
    }
}
