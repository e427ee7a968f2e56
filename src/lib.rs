//! # neurocluster
//!
//! Pattern-addressed concept clusters with partitioned, incremental persistence.
//!
//! Text is encoded into a fixed-length feature vector, the vector is
//! quantized into a discrete region, the region resolves to one or more
//! neuron clusters, and the clusters' shared neurons live in a partitioned
//! bank that checkpoints only what changed.
//!
//! ## Quick Start
//!
//! ```
//! use neurocluster::prelude::*;
//!
//! let resolver = ClusterResolver::in_memory(ResolverConfig::default()).unwrap();
//!
//! let v = resolver.encode("cat");
//! let cat = resolver.find_or_create_cluster_for_pattern(&v, "cat").unwrap();
//! resolver.train_pattern(&cat, [("fur", 1.0), ("meow", 0.8)]).unwrap();
//!
//! let hits = resolver.find_clusters_matching_pattern(&v, 3).unwrap();
//! assert_eq!(hits[0].0, cat);
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): Serialize/deserialize configs, snapshots and reports
//! - `parallel`: rayon-driven partition writes and batch resolution
//! - `simd`: SIMD dot products via the `wide` crate
//!
//! ## Modules
//!
//! - [`encoder`]: Deterministic text → vector encoding
//! - [`quantizer`]: LSH and learned-codebook region quantizers
//! - [`activation`]: Per-region activation counts and novelty
//! - [`directory`]: Region → cluster directory and expansion search
//! - [`bank`]: Partitioned neuron/cluster store
//! - [`resolver`]: The facade tying them together
//! - [`observer`]: Read-only observation adapters

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/vector.rs"]
pub mod vector;

#[path = "core/ids.rs"]
pub mod ids;

#[path = "core/shard.rs"]
pub mod shard;

#[path = "core/pool.rs"]
pub mod pool;

#[path = "core/encoder.rs"]
pub mod encoder;

#[path = "core/lsh.rs"]
pub mod lsh;

#[path = "core/codebook.rs"]
pub mod codebook;

#[path = "core/quantizer.rs"]
pub mod quantizer;

#[path = "core/activation.rs"]
pub mod activation;

#[path = "core/directory.rs"]
pub mod directory;

#[path = "core/bank.rs"]
pub mod bank;

#[path = "core/resolver.rs"]
pub mod resolver;

pub mod observer;

/// Prelude module for convenient imports.
///
/// ```
/// use neurocluster::prelude::*;
/// ```
pub mod prelude {
    pub use crate::activation::{ActivationConfig, ActivationRecord, ActivationStatistics, PrunePolicy};
    pub use crate::bank::{
        ClusterRecord, IntegrityPolicy, IntegrityReport, MembershipMode, NeuronBank, NeuronRecord,
        PartitionMetadata, PartitionState, StoreConfig,
    };
    pub use crate::codebook::{CodebookConfig, CodebookSnapshot, LearnedCodebook};
    pub use crate::directory::RegionClusterDirectory;
    pub use crate::encoder::{EncoderConfig, FeatureEncoder};
    pub use crate::error::{CoreError, EncodingError, QuantizerError, StoreError};
    pub use crate::ids::{ClusterId, NeuronId, PartitionKey};
    pub use crate::lsh::{LshConfig, LshPartitioner};
    pub use crate::observer::{ResolverAdapter, ResolverSnapshot};
    pub use crate::quantizer::{
        Degeneracy, QuantizerConfig, QuantizerKind, QuantizerStats, RegionId, RegionQuantizer,
    };
    pub use crate::resolver::{
        ClusterResolver, LoadReport, PersistResult, Resolution, ResolverConfig, ResolverStats,
        TrainingOutcome,
    };
    pub use crate::vector::FeatureVector;
}
