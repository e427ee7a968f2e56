//! Region → cluster directory and similarity-ranked expansion search.
//!
//! The mapping is many-to-many: colliding concepts share a region, and one
//! concept may be registered under several nearby regions. Cluster lists are
//! kept sorted and deduplicated so snapshots serialize deterministically.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::QuantizerError;
use crate::ids::ClusterId;
use crate::quantizer::{self, RegionId, RegionQuantizer};
use crate::shard::ShardedMap;
use crate::storage;
use crate::vector::FeatureVector;

const TAG_REGIONS: [u8; 4] = *b"RMAP";

/// Upper bound on clusters per region accepted when decoding.
const MAX_CLUSTERS_PER_REGION: u32 = 1 << 20;

/// Persisted form of the directory (representatives are not included; they
/// are rebuilt from cluster centroids).
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegionMapSnapshot {
    pub regions: BTreeMap<RegionId, Vec<ClusterId>>,
}

pub struct RegionClusterDirectory {
    regions: ShardedMap<RegionId, Vec<ClusterId>>,
    representatives: ShardedMap<ClusterId, FeatureVector>,
    generation: AtomicU64,
}

impl RegionClusterDirectory {
    pub fn new() -> Self {
        Self {
            regions: ShardedMap::new(),
            representatives: ShardedMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn clusters_for(&self, region: &RegionId) -> Vec<ClusterId> {
        self.regions.get(region).unwrap_or_default()
    }

    /// Returns true when the pair was not registered before.
    pub fn register(&self, region: RegionId, cluster: ClusterId) -> bool {
        let inserted = self.regions.upsert(region, Vec::new, |list| {
            match list.binary_search(&cluster) {
                Ok(_) => false,
                Err(pos) => {
                    list.insert(pos, cluster);
                    true
                }
            }
        });
        if inserted {
            self.generation.fetch_add(1, Ordering::Relaxed);
        }
        inserted
    }

    /// Cached vector used to score `cluster` during expansion search.
    pub fn set_representative(&self, cluster: ClusterId, vector: FeatureVector) {
        self.representatives.insert(cluster, vector);
    }

    pub fn representative(&self, cluster: &ClusterId) -> Option<FeatureVector> {
        self.representatives.get(cluster)
    }

    /// Probe `probe_regions` nearby regions of `v` and rank every cluster
    /// found there by cosine similarity to its representative.
    ///
    /// Results are sorted by descending similarity; equal scores go to the
    /// smaller `ClusterId`. Pure lookup: nothing is mutated.
    pub fn expand_search(
        &self,
        quantizer: &RegionQuantizer,
        v: &FeatureVector,
        max_clusters: usize,
        probe_regions: usize,
    ) -> Result<Vec<(ClusterId, f32)>, QuantizerError> {
        let regions = quantizer.nearby_regions(v, probe_regions.max(1))?;
        Ok(self.rank_in_regions(&regions, v, max_clusters))
    }

    /// `expand_search`, falling back to a scan of every representative when
    /// the nearby regions hold nothing at or above `threshold`.
    ///
    /// Registrations can lag behind a moving codebook; the scan guarantees
    /// that a matching cluster is found wherever it is registered. The flag
    /// is true when the scan ran.
    pub fn search(
        &self,
        quantizer: &RegionQuantizer,
        v: &FeatureVector,
        max_clusters: usize,
        probe_regions: usize,
        threshold: f32,
    ) -> Result<(Vec<(ClusterId, f32)>, bool), QuantizerError> {
        let hits = self.expand_search(quantizer, v, max_clusters, probe_regions)?;
        if hits.first().is_some_and(|(_, sim)| *sim >= threshold) {
            return Ok((hits, false));
        }
        Ok((self.rank_all(v, max_clusters), true))
    }

    /// Rank every cluster with a representative, regardless of region.
    pub fn rank_all(&self, v: &FeatureVector, max_clusters: usize) -> Vec<(ClusterId, f32)> {
        let mut scored = Vec::with_capacity(self.representatives.len());
        self.representatives
            .for_each(|id, rep| scored.push((*id, rep.cosine(v))));
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(max_clusters);
        scored
    }

    pub fn rank_in_regions(
        &self,
        regions: &[RegionId],
        v: &FeatureVector,
        max_clusters: usize,
    ) -> Vec<(ClusterId, f32)> {
        let mut candidates = BTreeSet::new();
        for region in regions {
            self.regions.read(region, |list| {
                if let Some(list) = list {
                    candidates.extend(list.iter().copied());
                }
            });
        }

        let mut scored: Vec<(ClusterId, f32)> = candidates
            .into_iter()
            .filter_map(|id| {
                self.representatives
                    .read(&id, |rep| rep.map(|rep| rep.cosine(v)))
                    .map(|sim| (id, sim))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(max_clusters);
        scored
    }

    /// Drop `cluster` from every region and the representative cache.
    /// Returns the number of region entries removed.
    pub fn remove_cluster(&self, cluster: &ClusterId) -> usize {
        self.representatives.remove(cluster);
        self.retain_clusters(|id| id != cluster)
    }

    /// Keep only clusters for which `keep` is true; empty regions are dropped.
    /// Returns the number of region entries removed.
    pub fn retain_clusters(&self, mut keep: impl FnMut(&ClusterId) -> bool) -> usize {
        let mut removed = 0;
        self.regions.retain(|_, list| {
            let before = list.len();
            list.retain(|id| keep(id));
            removed += before - list.len();
            !list.is_empty()
        });
        self.representatives.retain(|id, _| keep(id));
        if removed > 0 {
            self.generation.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn representative_count(&self) -> usize {
        self.representatives.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RegionMapSnapshot {
        RegionMapSnapshot {
            regions: self.regions.entries().into_iter().collect(),
        }
    }

    /// Replace the region map with `snapshot`. Representatives are kept.
    pub fn restore(&self, snapshot: RegionMapSnapshot) {
        self.regions.clear();
        for (region, mut clusters) in snapshot.regions {
            clusters.sort_unstable();
            clusters.dedup();
            if !clusters.is_empty() {
                self.regions.insert(region, clusters);
            }
        }
        self.generation.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for RegionClusterDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize as a sealed `NCREGN01` image.
pub fn encode_snapshot(snapshot: &RegionMapSnapshot) -> io::Result<Vec<u8>> {
    let mut payload = Vec::new();
    storage::write_len(&mut payload, snapshot.regions.len())?;
    for (region, clusters) in &snapshot.regions {
        quantizer::write_region(&mut payload, region)?;
        storage::write_len(&mut payload, clusters.len())?;
        for id in clusters {
            storage::write_uuid(&mut payload, id.as_uuid())?;
        }
    }

    let mut image = Vec::new();
    storage::write_header(&mut image, storage::REGION_MAP_MAGIC)?;
    storage::write_chunk_v2_lz4(&mut image, TAG_REGIONS, &payload)?;
    storage::seal(&mut image)?;
    Ok(image)
}

pub fn decode_snapshot(image: &[u8]) -> io::Result<RegionMapSnapshot> {
    let body = storage::unseal(image)?;
    let mut cursor = io::Cursor::new(body);
    storage::read_header(&mut cursor, storage::REGION_MAP_MAGIC)?;
    let rest = &body[cursor.position() as usize..];

    let mut regions = BTreeMap::new();
    storage::for_each_chunk(rest, &[TAG_REGIONS], |tag, payload| {
        if tag != TAG_REGIONS {
            return Ok(());
        }
        let mut r = io::Cursor::new(payload);
        let n = storage::read_u32_le(&mut r)?;
        for _ in 0..n {
            let region = quantizer::read_region(&mut r)?;
            let m = storage::read_u32_le(&mut r)?;
            if m > MAX_CLUSTERS_PER_REGION {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "region cluster list too long",
                ));
            }
            let mut clusters = Vec::with_capacity(m as usize);
            for _ in 0..m {
                clusters.push(ClusterId::from_uuid(storage::read_uuid(&mut r)?));
            }
            regions.insert(region, clusters);
        }
        Ok(())
    })?;
    Ok(RegionMapSnapshot { regions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsh::LshConfig;
    use crate::quantizer::QuantizerConfig;

    fn id(n: u128) -> ClusterId {
        ClusterId::from_u128(n)
    }

    #[test]
    fn register_is_idempotent_and_sorted() {
        let dir = RegionClusterDirectory::new();
        let r = RegionId::Code(4);
        assert!(dir.register(r, id(9)));
        assert!(dir.register(r, id(2)));
        assert!(!dir.register(r, id(9)));
        assert_eq!(dir.clusters_for(&r), vec![id(2), id(9)]);
        assert!(dir.clusters_for(&RegionId::Code(5)).is_empty());
    }

    #[test]
    fn ranking_prefers_similarity_then_smaller_id() {
        let dir = RegionClusterDirectory::new();
        let r = RegionId::Code(0);
        let q = FeatureVector::from_raw(vec![1.0, 0.0, 0.0]);
        for n in [7, 3, 5] {
            dir.register(r, id(n));
        }
        dir.set_representative(id(7), q.clone());
        dir.set_representative(id(3), q.clone());
        dir.set_representative(id(5), FeatureVector::from_raw(vec![0.0, 1.0, 0.0]));

        let ranked = dir.rank_in_regions(&[r], &q, 10);
        let ids: Vec<_> = ranked.iter().map(|(c, _)| *c).collect();
        assert_eq!(ids, vec![id(3), id(7), id(5)]);
        assert_eq!(dir.rank_in_regions(&[r], &q, 1).len(), 1);
    }

    #[test]
    fn expand_search_reaches_neighbouring_regions() {
        let quant = RegionQuantizer::new(&QuantizerConfig::Lsh(LshConfig::default()), 8).unwrap();
        let dir = RegionClusterDirectory::new();
        let v = FeatureVector::from_raw(vec![0.3, -0.2, 0.5, 0.1, -0.4, 0.2, 0.0, 0.6]);
        let near = quant.nearby_regions(&v, 4).unwrap();

        // Register only under the third candidate; a plain lookup would miss it.
        dir.register(near[2], id(1));
        dir.set_representative(id(1), v.clone());
        assert_ne!(near[0], near[2]);

        let hits = dir.expand_search(&quant, &v, 5, 4).unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
        assert!(dir.expand_search(&quant, &v, 5, 1).unwrap().is_empty());
    }

    #[test]
    fn search_scans_everything_when_nearby_regions_miss() {
        let quant = RegionQuantizer::new(&QuantizerConfig::Lsh(LshConfig::default()), 8).unwrap();
        let dir = RegionClusterDirectory::new();
        let v = FeatureVector::from_raw(vec![0.3, -0.2, 0.5, 0.1, -0.4, 0.2, 0.0, 0.6]);
        let flipped = FeatureVector::from_raw(v.as_slice().iter().map(|x| -x).collect());
        let near = quant.nearby_regions(&v, 2).unwrap();

        // Registered far outside the nearby regions.
        let far = quant.quantize(&flipped).unwrap();
        assert!(!near.contains(&far));
        dir.register(far, id(1));
        dir.set_representative(id(1), v.clone());
        dir.register(near[0], id(2));
        dir.set_representative(id(2), flipped.clone());

        assert!(dir.expand_search(&quant, &v, 5, 2).unwrap()[0].1 < 0.0);
        let (hits, scanned) = dir.search(&quant, &v, 5, 2, 0.9).unwrap();
        assert!(scanned);
        assert_eq!(hits[0].0, id(1));
        assert!((hits[0].1 - 1.0).abs() < 1e-6);

        dir.register(near[0], id(1));
        let (hits, scanned) = dir.search(&quant, &v, 5, 2, 0.9).unwrap();
        assert!(!scanned);
        assert_eq!(hits[0].0, id(1));
    }

    #[test]
    fn removal_drops_empty_regions() {
        let dir = RegionClusterDirectory::new();
        dir.register(RegionId::Code(1), id(1));
        dir.register(RegionId::Code(1), id(2));
        dir.register(RegionId::Code(2), id(1));
        assert_eq!(dir.remove_cluster(&id(1)), 2);
        assert_eq!(dir.region_count(), 1);
        assert_eq!(dir.clusters_for(&RegionId::Code(1)), vec![id(2)]);
    }

    #[test]
    fn snapshot_survives_binary_round_trip() {
        let dir = RegionClusterDirectory::new();
        dir.register(RegionId::Code(3), id(11));
        dir.register(
            RegionId::Signature {
                bits: 0xF0,
                width: 16,
            },
            id(12),
        );
        let image = encode_snapshot(&dir.snapshot()).unwrap();
        let back = decode_snapshot(&image).unwrap();
        assert_eq!(back, dir.snapshot());

        let fresh = RegionClusterDirectory::new();
        fresh.restore(back);
        assert_eq!(fresh.clusters_for(&RegionId::Code(3)), vec![id(11)]);
    }
}
