//! Per-region activation counts and novelty.
//!
//! Updates are O(1): one shard lock plus two relaxed atomics. The state is a
//! plain `region -> { count, last_seen }` map, so a snapshot is enough to
//! rebuild it.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::quantizer::{self, RegionId};
use crate::shard::ShardedMap;
use crate::storage;

const TAG_RECORDS: [u8; 4] = *b"RECS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ActivationRecord {
    pub count: u64,
    /// Unix millis of the latest activation.
    pub last_seen: u64,
}

/// When stale regions may be forgotten. Disabled unless `max_idle_ms` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PrunePolicy {
    pub max_idle_ms: Option<u64>,
    /// Records with at least this many activations are never pruned.
    pub min_count: u64,
}

impl Default for PrunePolicy {
    fn default() -> Self {
        Self {
            max_idle_ms: None,
            min_count: u64::MAX,
        }
    }
}

impl PrunePolicy {
    pub fn is_enabled(&self) -> bool {
        self.max_idle_ms.is_some()
    }

    fn should_prune(&self, rec: &ActivationRecord, now: u64) -> bool {
        match self.max_idle_ms {
            Some(max_idle) => {
                now.saturating_sub(rec.last_seen) > max_idle && rec.count < self.min_count
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ActivationConfig {
    /// Steepness of the log decay.
    pub novelty_scale: f32,
    /// Novelty never drops below this.
    pub novelty_floor: f32,
    pub prune: PrunePolicy,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            novelty_scale: 0.5,
            novelty_floor: 0.05,
            prune: PrunePolicy::default(),
        }
    }
}

impl ActivationConfig {
    pub fn with_novelty(mut self, scale: f32, floor: f32) -> Self {
        self.novelty_scale = scale;
        self.novelty_floor = floor;
        self
    }

    pub fn with_prune(mut self, prune: PrunePolicy) -> Self {
        self.prune = prune;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.novelty_scale.is_finite() || self.novelty_scale <= 0.0 {
            return Err("novelty_scale must be > 0");
        }
        if !(0.0..1.0).contains(&self.novelty_floor) {
            return Err("novelty_floor must be in [0, 1)");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ActivationSnapshot {
    pub records: BTreeMap<RegionId, ActivationRecord>,
}

pub struct ActivationStatistics {
    cfg: ActivationConfig,
    records: ShardedMap<RegionId, ActivationRecord>,
    total: AtomicU64,
    generation: AtomicU64,
}

impl ActivationStatistics {
    pub fn new(cfg: ActivationConfig) -> Self {
        Self {
            cfg,
            records: ShardedMap::new(),
            total: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub fn from_snapshot(cfg: ActivationConfig, snapshot: ActivationSnapshot) -> Self {
        let stats = Self::new(cfg);
        let mut total = 0u64;
        for (region, rec) in snapshot.records {
            total = total.saturating_add(rec.count);
            stats.records.insert(region, rec);
        }
        stats.total.store(total, Ordering::Relaxed);
        stats
    }

    pub fn config(&self) -> &ActivationConfig {
        &self.cfg
    }

    pub fn record_activation(&self, region: RegionId) -> ActivationRecord {
        self.record_activation_at(region, storage::now_millis())
    }

    pub fn record_activation_at(&self, region: RegionId, now: u64) -> ActivationRecord {
        let rec = self.records.upsert(region, ActivationRecord::default, |rec| {
            rec.count = rec.count.saturating_add(1);
            rec.last_seen = rec.last_seen.max(now);
            *rec
        });
        self.total.fetch_add(1, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::Relaxed);
        rec
    }

    pub fn count(&self, region: &RegionId) -> u64 {
        self.records.read(region, |r| r.map_or(0, |r| r.count))
    }

    pub fn record(&self, region: &RegionId) -> Option<ActivationRecord> {
        self.records.get(region)
    }

    /// `floor + (1 - floor) / (1 + scale * ln(1 + count))`: 1.0 for an unseen
    /// region, decaying smoothly toward `floor`.
    pub fn novelty(&self, region: &RegionId) -> f32 {
        self.novelty_for_count(self.count(region))
    }

    pub fn novelty_for_count(&self, count: u64) -> f32 {
        let floor = self.cfg.novelty_floor;
        let decay = 1.0 + self.cfg.novelty_scale * (count as f32).ln_1p();
        floor + (1.0 - floor) / decay
    }

    /// Share of all activations that hit `region`.
    pub fn frequency(&self, region: &RegionId) -> f32 {
        let total = self.total_activations();
        if total == 0 {
            return 0.0;
        }
        self.count(region) as f32 / total as f32
    }

    pub fn total_activations(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn distinct_regions(&self) -> usize {
        self.records.len()
    }

    /// Perplexity of the activation distribution over regions.
    pub fn perplexity(&self) -> f32 {
        let total = self.total_activations();
        if total == 0 {
            return 0.0;
        }
        let mut entropy = 0.0f64;
        self.records.for_each(|_, rec| {
            if rec.count > 0 {
                let p = rec.count as f64 / total as f64;
                entropy -= p * p.ln();
            }
        });
        entropy.exp() as f32
    }

    /// Bumped on every mutation; used to skip persisting unchanged state.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Most activated regions, ties by region order.
    pub fn top_regions(&self, n: usize) -> Vec<(RegionId, ActivationRecord)> {
        let mut all = self.records.entries();
        all.sort_by(|a, b| b.1.count.cmp(&a.1.count).then(a.0.cmp(&b.0)));
        all.truncate(n);
        all
    }

    /// Apply the configured prune policy. Returns the number of regions dropped.
    pub fn prune(&self, now: u64) -> usize {
        if !self.cfg.prune.is_enabled() {
            return 0;
        }
        let policy = &self.cfg.prune;
        let mut dropped_count = 0u64;
        let removed = self.records.retain(|_, rec| {
            let drop = policy.should_prune(rec, now);
            if drop {
                dropped_count += rec.count;
            }
            !drop
        });
        if removed > 0 {
            self.total.fetch_sub(dropped_count, Ordering::Relaxed);
            self.generation.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn snapshot(&self) -> ActivationSnapshot {
        ActivationSnapshot {
            records: self.records.entries().into_iter().collect(),
        }
    }
}

/// Serialize as a sealed `NCACTV01` image (records in region order).
pub fn encode_snapshot(snapshot: &ActivationSnapshot) -> io::Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(snapshot.records.len() * 26);
    storage::write_len(&mut payload, snapshot.records.len())?;
    for (region, rec) in &snapshot.records {
        quantizer::write_region(&mut payload, region)?;
        storage::write_u64_le(&mut payload, rec.count)?;
        storage::write_u64_le(&mut payload, rec.last_seen)?;
    }

    let mut image = Vec::new();
    storage::write_header(&mut image, storage::ACTIVATION_MAGIC)?;
    storage::write_chunk_v2_lz4(&mut image, TAG_RECORDS, &payload)?;
    storage::seal(&mut image)?;
    Ok(image)
}

pub fn decode_snapshot(image: &[u8]) -> io::Result<ActivationSnapshot> {
    let body = storage::unseal(image)?;
    let mut cursor = io::Cursor::new(body);
    storage::read_header(&mut cursor, storage::ACTIVATION_MAGIC)?;
    let rest = &body[cursor.position() as usize..];

    let mut records = BTreeMap::new();
    storage::for_each_chunk(rest, &[TAG_RECORDS], |tag, payload| {
        if tag != TAG_RECORDS {
            return Ok(());
        }
        let mut r = io::Cursor::new(payload);
        let n = storage::read_u32_le(&mut r)?;
        for _ in 0..n {
            let region = quantizer::read_region(&mut r)?;
            let count = storage::read_u64_le(&mut r)?;
            let last_seen = storage::read_u64_le(&mut r)?;
            records.insert(region, ActivationRecord { count, last_seen });
        }
        Ok(())
    })?;
    Ok(ActivationSnapshot { records })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn novelty_starts_high_and_decays_to_floor() {
        let stats = ActivationStatistics::new(ActivationConfig::default());
        let r = RegionId::Code(1);
        assert_eq!(stats.novelty(&r), 1.0);

        let mut prev = 1.0;
        for _ in 0..50 {
            stats.record_activation(r);
            let n = stats.novelty(&r);
            assert!(n < prev);
            assert!(n > 0.05);
            prev = n;
        }
        assert!(stats.novelty_for_count(u64::MAX) >= 0.05);
        assert_eq!(stats.novelty(&RegionId::Code(2)), 1.0);
    }

    #[test]
    fn frequency_is_share_of_total() {
        let stats = ActivationStatistics::new(ActivationConfig::default());
        assert_eq!(stats.frequency(&RegionId::Code(0)), 0.0);
        for _ in 0..3 {
            stats.record_activation(RegionId::Code(0));
        }
        stats.record_activation(RegionId::Code(1));
        assert!((stats.frequency(&RegionId::Code(0)) - 0.75).abs() < 1e-6);
        assert_eq!(stats.total_activations(), 4);
        assert_eq!(stats.top_regions(1)[0].0, RegionId::Code(0));
    }

    #[test]
    fn snapshot_rebuilds_identical_state() {
        let stats = ActivationStatistics::new(ActivationConfig::default());
        let sig = RegionId::Signature {
            bits: 0b1101,
            width: 4,
        };
        stats.record_activation_at(sig, 10);
        stats.record_activation_at(sig, 30);
        stats.record_activation_at(RegionId::Code(5), 20);

        let image = encode_snapshot(&stats.snapshot()).unwrap();
        let restored =
            ActivationStatistics::from_snapshot(ActivationConfig::default(), decode_snapshot(&image).unwrap());
        assert_eq!(restored.snapshot(), stats.snapshot());
        assert_eq!(restored.total_activations(), 3);
        assert_eq!(
            restored.record(&sig),
            Some(ActivationRecord {
                count: 2,
                last_seen: 30
            })
        );
    }

    #[test]
    fn pruning_is_off_by_default_and_respects_policy() {
        let stats = ActivationStatistics::new(ActivationConfig::default());
        stats.record_activation_at(RegionId::Code(1), 0);
        assert_eq!(stats.prune(1_000_000), 0);

        let cfg = ActivationConfig::default().with_prune(PrunePolicy {
            max_idle_ms: Some(100),
            min_count: 3,
        });
        let stats = ActivationStatistics::new(cfg);
        stats.record_activation_at(RegionId::Code(1), 0);
        for _ in 0..3 {
            stats.record_activation_at(RegionId::Code(2), 0);
        }
        stats.record_activation_at(RegionId::Code(3), 950);
        assert_eq!(stats.prune(1000), 1);
        assert!(stats.record(&RegionId::Code(1)).is_none());
        assert!(stats.record(&RegionId::Code(2)).is_some());
        assert_eq!(stats.total_activations(), 4);
    }

    #[test]
    fn generation_tracks_mutations() {
        let stats = ActivationStatistics::new(ActivationConfig::default());
        let g0 = stats.generation();
        let _ = stats.novelty(&RegionId::Code(1));
        assert_eq!(stats.generation(), g0);
        stats.record_activation(RegionId::Code(1));
        assert!(stats.generation() > g0);
    }
}
