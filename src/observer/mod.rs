use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::activation::ActivationRecord;
use crate::bank::PartitionMetadata;
use crate::ids::PartitionKey;
use crate::quantizer::RegionId;
use crate::resolver::{ClusterResolver, ResolverStats};

/// A read-only snapshot of what the resolver is doing.
///
/// Design intent:
/// - Observers cannot mutate or steer the resolver.
/// - Snapshotting is *on-demand* and can allocate; the resolve path stays unchanged.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResolverSnapshot {
    pub stats: ResolverStats,
    /// Most activated regions, highest count first.
    pub top_regions: Vec<RegionActivity>,
    pub partitions: BTreeMap<PartitionKey, PartitionMetadata>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegionActivity {
    pub region: RegionId,
    pub count: u64,
    pub last_seen: u64,
    pub novelty: f32,
    pub clusters: usize,
}

pub struct ResolverAdapter<'a> {
    resolver: &'a ClusterResolver,
    top_n: usize,
}

impl<'a> ResolverAdapter<'a> {
    pub fn new(resolver: &'a ClusterResolver) -> Self {
        Self {
            resolver,
            top_n: 16,
        }
    }

    pub fn with_top_regions(mut self, n: usize) -> Self {
        self.top_n = n;
        self
    }

    pub fn snapshot(&self) -> ResolverSnapshot {
        let activation = self.resolver.activation();
        let directory = self.resolver.directory();

        let top_regions = self
            .resolver
            .top_regions(self.top_n)
            .into_iter()
            .map(|(region, ActivationRecord { count, last_seen })| RegionActivity {
                region,
                count,
                last_seen,
                novelty: activation.novelty_for_count(count),
                clusters: directory.clusters_for(&region).len(),
            })
            .collect();

        ResolverSnapshot {
            stats: self.resolver.get_stats(),
            top_regions,
            partitions: self.resolver.partition_metadata(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::StoreConfig;
    use crate::resolver::ResolverConfig;

    #[test]
    fn snapshot_reflects_activity_without_mutating() {
        let cfg = ResolverConfig::default().with_store(StoreConfig::default().with_partition_count(4));
        let r = ClusterResolver::in_memory(cfg).unwrap();
        r.learn_text("river", None).unwrap();
        r.learn_text("river", None).unwrap();
        r.learn_text("mountain", None).unwrap();

        let before = r.get_stats();
        let snap = ResolverAdapter::new(&r).with_top_regions(1).snapshot();
        assert_eq!(snap.top_regions.len(), 1);
        assert!(snap.top_regions[0].count >= 2);
        assert!(snap.top_regions[0].clusters >= 1);
        assert_eq!(snap.stats.clusters, 2);
        assert!(!snap.partitions.is_empty());
        assert_eq!(r.get_stats(), before);
    }
}
