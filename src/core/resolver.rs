//! `ClusterResolver`: the facade the orchestration layer talks to.
//!
//! Wires encoder → quantizer → directory → bank together and owns the
//! checkpoint layout under one storage root:
//!
//! ```text
//! <root>/partitions/p-XXXX.ncp   neuron bank partitions
//! <root>/regions.ncr             region -> clusters map
//! <root>/activation.nca          activation statistics
//! <root>/codebook.ncq            learned codebook (codebook strategy only)
//! <root>/manifest.json           partition metadata
//! <root>/labels.json             label -> clusters, debug only, never read
//! ```
//!
//! Concurrency:
//! - queries take the quantizer read lock and per-key shard locks only
//! - find-or-create decisions are serialized by `learn_lock`, so two callers
//!   resolving the same pattern cannot both create a cluster
//! - codebook updates take the quantizer write lock (single writer)

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use tracing::{debug, info, warn};

use crate::activation::{self, ActivationConfig, ActivationRecord, ActivationStatistics};
use crate::bank::{
    ClusterRecord, HealReport, IntegrityPolicy, IntegrityReport, MembershipMode, NeuronBank,
    PartitionMetadata, StoreConfig,
};
use crate::codebook;
use crate::directory::{self, RegionClusterDirectory};
use crate::encoder::{EncoderConfig, FeatureEncoder};
use crate::error::{CoreError, Result, StoreError};
use crate::ids::{ClusterId, NeuronId, PartitionKey};
use crate::pool;
use crate::quantizer::{Degeneracy, QuantizerConfig, QuantizerKind, RegionId, RegionQuantizer};
use crate::storage;
use crate::vector::{self, FeatureVector};

pub const REGIONS_FILE: &str = "regions.ncr";
pub const ACTIVATION_FILE: &str = "activation.nca";
pub const CODEBOOK_FILE: &str = "codebook.ncq";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const LABELS_FILE: &str = "labels.json";

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ResolverConfig {
    pub encoder: EncoderConfig,
    pub quantizer: QuantizerConfig,
    pub activation: ActivationConfig,
    pub store: StoreConfig,
    /// Minimum cosine similarity for a pattern to reuse an existing cluster.
    pub match_threshold: f32,
    /// Nearby regions probed by every search.
    pub probe_regions: usize,
    /// How far a re-resolved pattern pulls its cluster centroid.
    pub centroid_rate: f32,
    /// Hebbian step for `train_pattern`.
    pub learning_rate: f32,
    /// Feed every learned pattern into the codebook's EMA update.
    pub update_codebook_on_learn: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderConfig::default(),
            quantizer: QuantizerConfig::default(),
            activation: ActivationConfig::default(),
            store: StoreConfig::default(),
            match_threshold: 0.9,
            probe_regions: 8,
            centroid_rate: 0.1,
            learning_rate: 0.2,
            update_codebook_on_learn: true,
        }
    }
}

impl ResolverConfig {
    pub fn with_encoder(mut self, encoder: EncoderConfig) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_quantizer(mut self, quantizer: QuantizerConfig) -> Self {
        self.quantizer = quantizer;
        self
    }

    pub fn with_activation(mut self, activation: ActivationConfig) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_match_threshold(mut self, threshold: f32) -> Self {
        self.match_threshold = threshold;
        self
    }

    pub fn with_probe_regions(mut self, probes: usize) -> Self {
        self.probe_regions = probes;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        self.encoder.validate()?;
        self.quantizer.validate()?;
        self.activation.validate()?;
        self.store.validate()?;
        if !(-1.0..=1.0).contains(&self.match_threshold) {
            return Err("match_threshold must be in [-1, 1]");
        }
        if self.probe_regions == 0 {
            return Err("probe_regions must be > 0");
        }
        if !(0.0..=1.0).contains(&self.centroid_rate) {
            return Err("centroid_rate must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.learning_rate) {
            return Err("learning_rate must be in [0, 1]");
        }
        Ok(())
    }
}

/// Outcome of resolving one pattern to a cluster.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Resolution {
    pub cluster_id: ClusterId,
    pub region: RegionId,
    pub created: bool,
    /// Cosine similarity between the pattern and the cluster's representative
    /// (1.0 for a freshly created cluster).
    pub similarity: f32,
    /// Novelty of `region` before this activation was recorded.
    pub novelty: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrainingOutcome {
    pub neurons_created: usize,
    pub neurons_updated: usize,
    pub members_added: usize,
    /// Features with a non-finite value or a blank name.
    pub features_skipped: usize,
    /// Mean absolute per-weight change over the trained neurons.
    pub mean_weight_delta: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PersistResult {
    pub partitions_written: usize,
    pub partitions_skipped: usize,
    /// Partitions that stayed dirty; retry with another `persist_all`.
    pub failed_partitions: Vec<(PartitionKey, String)>,
    pub files_written: Vec<String>,
    pub failed_files: Vec<(String, String)>,
    pub bytes_written: u64,
    pub duration_ms: u64,
}

impl PersistResult {
    pub fn is_complete(&self) -> bool {
        self.failed_partitions.is_empty() && self.failed_files.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LoadReport {
    pub partitions_loaded: usize,
    pub corrupt_partitions: Vec<(PartitionKey, String)>,
    /// Sidecar files that were present but unreadable.
    pub corrupt_files: Vec<(String, String)>,
    pub clusters: usize,
    pub neurons: usize,
    /// Directory entries pointing at clusters the bank no longer has.
    pub dropped_region_entries: usize,
    /// Clusters registered again from their centroid because the region map
    /// did not know them.
    pub reregistered_clusters: usize,
    pub heal: HealReport,
    pub integrity: IntegrityReport,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResolverStats {
    pub quantizer: QuantizerKind,
    /// Codebook usage perplexity; for LSH, perplexity of activation counts.
    pub perplexity: f32,
    pub codebook_utilization: f32,
    pub active_codes: usize,
    /// Regions with at least one registered cluster.
    pub total_regions: usize,
    pub activated_regions: usize,
    pub total_activations: u64,
    pub clusters: usize,
    pub neurons: usize,
    pub memberships: usize,
    pub dirty_partitions: usize,
    pub degenerate: Option<Degeneracy>,
}

/// Last persisted state of one sidecar file.
#[derive(Debug, Clone, Copy, Default)]
struct Sidecar {
    generation: Option<u64>,
    fingerprint: Option<u64>,
}

pub struct ClusterResolver {
    cfg: ResolverConfig,
    root: Option<PathBuf>,
    encoder: FeatureEncoder,
    quantizer: RwLock<RegionQuantizer>,
    directory: RegionClusterDirectory,
    activation: ActivationStatistics,
    bank: NeuronBank,
    learn_lock: Mutex<()>,
    sidecars: Mutex<HashMap<&'static str, Sidecar>>,
    integrity_seed: AtomicU64,
}

impl ClusterResolver {
    /// Resolver without a storage root. `persist_all` fails with
    /// `StoreError::NoStorageRoot`.
    pub fn in_memory(cfg: ResolverConfig) -> Result<Self> {
        cfg.validate().map_err(CoreError::InvalidConfig)?;
        let encoder = FeatureEncoder::new(cfg.encoder.clone()).map_err(CoreError::InvalidConfig)?;
        let quantizer = RegionQuantizer::new(&cfg.quantizer, encoder.dim())?;
        let bank = NeuronBank::in_memory(cfg.store.clone())?;
        Ok(Self {
            activation: ActivationStatistics::new(cfg.activation.clone()),
            directory: RegionClusterDirectory::new(),
            quantizer: RwLock::new(quantizer),
            encoder,
            bank,
            root: None,
            learn_lock: Mutex::new(()),
            sidecars: Mutex::new(HashMap::new()),
            integrity_seed: AtomicU64::new(0x5EED),
            cfg,
        })
    }

    /// Open (or create) a resolver persisted under `root`.
    ///
    /// Damaged files degrade gracefully: a corrupt partition loads as empty, a
    /// corrupt codebook or activation snapshot starts fresh, and a missing or
    /// corrupt region map is rebuilt from cluster centroids. Every such case is
    /// logged and listed in the returned `LoadReport`.
    pub fn open(root: impl Into<PathBuf>, cfg: ResolverConfig) -> Result<(Self, LoadReport)> {
        cfg.validate().map_err(CoreError::InvalidConfig)?;
        let root = root.into();
        let encoder = FeatureEncoder::new(cfg.encoder.clone()).map_err(CoreError::InvalidConfig)?;
        let dim = encoder.dim();

        let (bank, bank_report) = NeuronBank::open(&root, cfg.store.clone())?;
        let mut report = LoadReport {
            partitions_loaded: bank_report.partitions_loaded,
            corrupt_partitions: bank_report.corrupt,
            ..LoadReport::default()
        };
        let mut sidecars = HashMap::new();

        // Codebook.
        let codebook_path = root.join(CODEBOOK_FILE);
        let codebook_bytes = read_sidecar(&codebook_path)?;
        let mut codebook_restored = false;
        let quantizer = match (&cfg.quantizer, codebook_bytes) {
            (QuantizerConfig::Codebook(cb_cfg), Some(bytes)) => {
                let restored = codebook::decode_snapshot(&bytes)
                    .map_err(|e| e.to_string())
                    .and_then(|snap| {
                        if snap.embedding_dim != dim {
                            return Err(format!(
                                "embedding dim {} does not match encoder dim {dim}",
                                snap.embedding_dim
                            ));
                        }
                        RegionQuantizer::from_snapshot(snap, cb_cfg.clone()).map_err(|e| e.to_string())
                    });
                match restored {
                    Ok(q) => {
                        sidecars.insert(CODEBOOK_FILE, Sidecar::loaded(&bytes));
                        codebook_restored = true;
                        q
                    }
                    Err(reason) => {
                        warn!(path = ?codebook_path, %reason, "codebook unusable, starting fresh");
                        report.corrupt_files.push((CODEBOOK_FILE.to_string(), reason));
                        RegionQuantizer::new(&cfg.quantizer, dim)?
                    }
                }
            }
            (QuantizerConfig::Lsh(_), Some(_)) => {
                warn!(path = ?codebook_path, "persisted codebook ignored: resolver is configured for LSH");
                RegionQuantizer::new(&cfg.quantizer, dim)?
            }
            (_, None) => RegionQuantizer::new(&cfg.quantizer, dim)?,
        };

        // Activation statistics.
        let activation_path = root.join(ACTIVATION_FILE);
        let activation = match read_sidecar(&activation_path)? {
            Some(bytes) => match activation::decode_snapshot(&bytes) {
                Ok(snap) => {
                    let stats = ActivationStatistics::from_snapshot(cfg.activation.clone(), snap);
                    sidecars.insert(ACTIVATION_FILE, Sidecar::loaded(&bytes).at(stats.generation()));
                    stats
                }
                Err(e) => {
                    warn!(path = ?activation_path, error = %e, "activation snapshot corrupt, starting fresh");
                    report.corrupt_files.push((ACTIVATION_FILE.to_string(), e.to_string()));
                    ActivationStatistics::new(cfg.activation.clone())
                }
            },
            None => ActivationStatistics::new(cfg.activation.clone()),
        };

        // Region map, reconciled against the bank.
        let directory = RegionClusterDirectory::new();
        let regions_path = root.join(REGIONS_FILE);
        let mut region_bytes = None;
        if let Some(bytes) = read_sidecar(&regions_path)? {
            match directory::decode_snapshot(&bytes) {
                Ok(mut snap) => {
                    // Addresses from another quantizer (or a discarded codebook)
                    // are meaningless; their clusters are re-registered below.
                    let before: usize = snap.regions.values().map(Vec::len).sum();
                    let trusted = quantizer.kind() == QuantizerKind::Lsh || codebook_restored;
                    snap.regions.retain(|region, _| trusted && quantizer.owns(region));
                    let stale = before - snap.regions.values().map(Vec::len).sum::<usize>();
                    if stale > 0 {
                        warn!(path = ?regions_path, stale, "region map entries do not fit the current quantizer");
                    }
                    report.dropped_region_entries += stale;
                    directory.restore(snap);
                    region_bytes = Some(bytes);
                }
                Err(e) => {
                    warn!(path = ?regions_path, error = %e, "region map corrupt, rebuilding from centroids");
                    report.corrupt_files.push((REGIONS_FILE.to_string(), e.to_string()));
                }
            }
        }
        report.dropped_region_entries += directory.retain_clusters(|id| bank.contains_cluster(id));

        let known: std::collections::BTreeSet<ClusterId> = directory
            .snapshot()
            .regions
            .into_values()
            .flatten()
            .collect();
        let mut orphans = Vec::new();
        bank.for_each_cluster(|c| {
            if c.centroid.len() == dim {
                directory.set_representative(c.id, FeatureVector::from_raw(c.centroid.clone()));
                if !known.contains(&c.id) {
                    orphans.push(c.id);
                }
            } else {
                warn!(cluster = %c.id, len = c.centroid.len(), dim, "cluster centroid has wrong dimension, not searchable");
            }
        });
        for id in &orphans {
            if let Some(rep) = directory.representative(id) {
                directory.register(quantizer.quantize(&rep)?, *id);
            }
        }
        report.reregistered_clusters = orphans.len();
        if let Some(bytes) = region_bytes {
            if report.dropped_region_entries == 0 && orphans.is_empty() {
                sidecars.insert(REGIONS_FILE, Sidecar::loaded(&bytes).at(directory.generation()));
            }
        }

        // Integrity.
        if cfg.store.integrity_policy != IntegrityPolicy::Report {
            report.heal = bank.heal(cfg.store.integrity_policy);
        }
        report.integrity = bank.verify_integrity(cfg.store.integrity_sample, 0x5EED);

        let stats = bank.stats();
        report.clusters = stats.clusters;
        report.neurons = stats.neurons;

        info!(
            root = ?root,
            clusters = report.clusters,
            neurons = report.neurons,
            regions = directory.region_count(),
            corrupt_partitions = report.corrupt_partitions.len(),
            corrupt_files = report.corrupt_files.len(),
            mismatches = report.integrity.mismatches,
            "resolver opened"
        );

        let resolver = Self {
            cfg,
            root: Some(root),
            encoder,
            quantizer: RwLock::new(quantizer),
            directory,
            activation,
            bank,
            learn_lock: Mutex::new(()),
            sidecars: Mutex::new(sidecars),
            integrity_seed: AtomicU64::new(0x5EED),
        };
        Ok((resolver, report))
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.cfg
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn encoder(&self) -> &FeatureEncoder {
        &self.encoder
    }

    pub fn directory(&self) -> &RegionClusterDirectory {
        &self.directory
    }

    pub fn activation(&self) -> &ActivationStatistics {
        &self.activation
    }

    pub fn bank(&self) -> &NeuronBank {
        &self.bank
    }

    /// Deterministic text → vector mapping. Empty or signal-free text maps to
    /// the encoder's default vector.
    pub fn encode(&self, text: &str) -> FeatureVector {
        self.encoder.encode(text)
    }

    pub fn quantize(&self, v: &FeatureVector) -> Result<RegionId> {
        Ok(self.quantizer.read().quantize(v)?)
    }

    pub fn nearby_regions(&self, v: &FeatureVector, k: usize) -> Result<Vec<RegionId>> {
        Ok(self.quantizer.read().nearby_regions(v, k)?)
    }

    pub fn cluster(&self, id: &ClusterId) -> Option<ClusterRecord> {
        self.bank.cluster(id)
    }

    // ---------------------------------------------------------------------
    // Resolution
    // ---------------------------------------------------------------------

    /// Find the cluster for `v`, creating one only when no existing
    /// representative reaches `match_threshold`. The nearby regions are
    /// searched first, then every representative.
    pub fn resolve_pattern(&self, v: &FeatureVector, label: Option<&str>) -> Result<Resolution> {
        let _guard = self.learn_lock.lock();

        let (best, scanned) = {
            let q = self.quantizer.read();
            let (hits, scanned) = self.directory.search(
                &q,
                v,
                1,
                self.cfg.probe_regions,
                self.cfg.match_threshold,
            )?;
            (hits.into_iter().next(), scanned)
        };

        let region = if self.cfg.update_codebook_on_learn && self.quantizer.read().is_learned() {
            let region = self.quantizer.write().update(v)?;
            self.follow_drift(region)?;
            region
        } else {
            self.quantizer.read().quantize(v)?
        };
        let novelty = self.activation.novelty(&region);
        self.activation.record_activation(region);

        let now = storage::now_millis();
        match best {
            Some((cluster_id, similarity)) if similarity >= self.cfg.match_threshold => {
                let rate = self.cfg.centroid_rate;
                let centroid = self.bank.update_cluster(&cluster_id, |c| {
                    if rate > 0.0 && c.centroid.len() == v.dim() {
                        let blended: Vec<f32> = c
                            .centroid
                            .iter()
                            .zip(v.as_slice())
                            .map(|(old, new)| (1.0 - rate) * old + rate * new)
                            .collect();
                        c.centroid = FeatureVector::from_raw(blended).to_vec();
                    }
                    c.activations += 1;
                    c.updated_at = now;
                    c.centroid.clone()
                })?;
                if centroid.len() == v.dim() {
                    self.directory
                        .set_representative(cluster_id, FeatureVector::from_raw(centroid));
                }
                if self.directory.register(region, cluster_id) {
                    debug!(cluster = %cluster_id, region = %region, scanned, "cluster registered under an additional region");
                }
                Ok(Resolution {
                    cluster_id,
                    region,
                    created: false,
                    similarity,
                    novelty,
                })
            }
            _ => {
                let cluster_id = ClusterId::new_random();
                let label = label.map(str::trim).filter(|l| !l.is_empty()).map(str::to_string);
                let mut record = ClusterRecord::new(cluster_id, label, v.to_vec(), now);
                record.activations = 1;
                let representative = FeatureVector::from_raw(record.centroid.clone());
                self.bank.create_cluster(record)?;
                self.directory.set_representative(cluster_id, representative);
                self.directory.register(region, cluster_id);
                debug!(cluster = %cluster_id, region = %region, novelty, "cluster created");
                Ok(Resolution {
                    cluster_id,
                    region,
                    created: true,
                    similarity: 1.0,
                    novelty,
                })
            }
        }
    }

    /// After the codebook moved `region`'s code, register each of its
    /// clusters under the region its representative now maps to.
    fn follow_drift(&self, region: RegionId) -> Result<()> {
        let q = self.quantizer.read();
        for cluster in self.directory.clusters_for(&region) {
            let Some(rep) = self.directory.representative(&cluster) else {
                continue;
            };
            let current = q.quantize(&rep)?;
            if current != region && self.directory.register(current, cluster) {
                debug!(cluster = %cluster, from = %region, to = %current, "cluster followed codebook drift");
            }
        }
        Ok(())
    }

    pub fn find_or_create_cluster_for_pattern(&self, v: &FeatureVector, debug_label: &str) -> Result<ClusterId> {
        self.resolve_pattern(v, Some(debug_label)).map(|r| r.cluster_id)
    }

    /// Clusters whose representative is most similar to `v`, best first.
    /// Falls back to a full scan when the nearby regions miss.
    /// Records an activation of `v`'s region; nothing else is mutated.
    pub fn find_clusters_matching_pattern(
        &self,
        v: &FeatureVector,
        max_clusters: usize,
    ) -> Result<Vec<(ClusterId, f32)>> {
        let (hits, region) = {
            let q = self.quantizer.read();
            let (hits, _) = self.directory.search(
                &q,
                v,
                max_clusters,
                self.cfg.probe_regions,
                self.cfg.match_threshold,
            )?;
            (hits, q.quantize(v)?)
        };
        self.activation.record_activation(region);
        Ok(hits)
    }

    pub fn learn_text(&self, text: &str, label: Option<&str>) -> Result<Resolution> {
        let v = self.encoder.encode(text);
        self.resolve_pattern(&v, label.or(Some(text)))
    }

    pub fn query_text(&self, text: &str, max_clusters: usize) -> Result<Vec<(ClusterId, f32)>> {
        let v = self.encoder.encode(text);
        self.find_clusters_matching_pattern(&v, max_clusters)
    }

    /// Learn a batch of texts with at most `max_threads` workers. Encoding and
    /// searching run in parallel; creation decisions stay serialized.
    pub fn resolve_batch<S>(&self, texts: &[S], max_threads: usize) -> Vec<Result<Resolution>>
    where
        S: AsRef<str> + Sync,
    {
        pool::map_bounded(texts, max_threads, |t| self.learn_text(t.as_ref(), None))
    }

    /// Strengthen `cluster`'s neurons for the given `(feature, value)` pairs.
    ///
    /// Each feature name names one shared neuron (`NeuronId::for_feature`).
    /// Its weights move toward the cluster's folded centroid by
    /// `learning_rate * |value|`, its strength moves toward `value`, and it
    /// joins the cluster's membership.
    pub fn train_pattern<I, K>(&self, cluster: &ClusterId, features: I) -> Result<TrainingOutcome>
    where
        I: IntoIterator<Item = (K, f32)>,
        K: AsRef<str>,
    {
        let record = self
            .bank
            .cluster(cluster)
            .ok_or(CoreError::UnknownCluster(*cluster))?;
        let signature = vector::fold(&record.centroid, self.cfg.store.weight_dim);
        let lr = self.cfg.learning_rate;
        let now = storage::now_millis();

        let mut outcome = TrainingOutcome::default();
        let mut members = Vec::new();
        let mut delta_sum = 0.0f32;
        let mut value_sum = 0.0f32;

        for (name, value) in features {
            let name = name.as_ref();
            if !value.is_finite() || name.trim().is_empty() {
                outcome.features_skipped += 1;
                continue;
            }
            let id = NeuronId::for_feature(name);
            let step = (lr * value.abs()).min(1.0);
            let (handle, delta) = self.bank.upsert_neuron(id, |n| {
                let mut delta = 0.0f32;
                for (w, s) in n.weights.iter_mut().zip(&signature) {
                    let d = step * (s - *w);
                    *w += d;
                    delta += d.abs();
                }
                n.strength += lr * (value - n.strength);
                n.last_used = now;
                delta / n.weights.len().max(1) as f32
            });
            if handle.created {
                outcome.neurons_created += 1;
            } else {
                outcome.neurons_updated += 1;
            }
            delta_sum += delta;
            value_sum += value.abs();
            members.push(id);
        }

        let trained = members.len();
        if trained == 0 {
            return Ok(outcome);
        }
        let diff = self
            .bank
            .upsert_cluster_membership(cluster, &members, MembershipMode::Merge)?;
        outcome.members_added = diff.added.len();
        outcome.mean_weight_delta = delta_sum / trained as f32;

        let mean_value = value_sum / trained as f32;
        self.bank.update_cluster(cluster, |c| {
            c.importance += lr * (mean_value - c.importance);
            c.updated_at = now;
        })?;
        Ok(outcome)
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    /// Checkpoint everything that changed since the last call.
    ///
    /// Partition failures are isolated and listed in the result; the dirty
    /// partitions stay dirty so the next call retries them. Sidecar files are
    /// skipped when their content is unchanged.
    pub fn persist_all(&self) -> Result<PersistResult> {
        let started = Instant::now();
        let root = self.root.as_ref().ok_or(StoreError::NoStorageRoot)?;

        let bank_report = self.bank.persist_all()?;
        let mut result = PersistResult {
            partitions_written: bank_report.written.len(),
            partitions_skipped: bank_report.skipped,
            failed_partitions: bank_report.failed,
            bytes_written: bank_report.bytes_written,
            ..PersistResult::default()
        };

        let region_gen = self.directory.generation();
        self.write_sidecar(root, REGIONS_FILE, Some(region_gen), &mut result, || {
            directory::encode_snapshot(&self.directory.snapshot()).map_err(|e| e.to_string())
        });

        let activation_gen = self.activation.generation();
        self.write_sidecar(root, ACTIVATION_FILE, Some(activation_gen), &mut result, || {
            activation::encode_snapshot(&self.activation.snapshot()).map_err(|e| e.to_string())
        });

        let snapshot = self.quantizer.read().export_codebook();
        if let Some(snapshot) = snapshot {
            let updates = snapshot.updates;
            self.write_sidecar(root, CODEBOOK_FILE, Some(updates), &mut result, || {
                codebook::encode_snapshot(&snapshot).map_err(|e| e.to_string())
            });
        }

        #[cfg(feature = "serde")]
        self.write_sidecar(root, MANIFEST_FILE, None, &mut result, || {
            let partitions: BTreeMap<String, PartitionMetadata> = self
                .bank
                .partition_metadata()
                .into_iter()
                .map(|(k, m)| (k.file_stem(), m))
                .collect();
            let manifest = serde_json::json!({
                "format": storage::VERSION_CURRENT,
                "partition_count": self.cfg.store.partition_count,
                "weight_dim": self.cfg.store.weight_dim,
                "partitions": partitions,
            });
            serde_json::to_vec_pretty(&manifest).map_err(|e| e.to_string())
        });

        self.write_sidecar(root, LABELS_FILE, None, &mut result, || {
            let mut labels: BTreeMap<String, Vec<String>> = BTreeMap::new();
            self.bank.for_each_cluster(|c| {
                if let Some(label) = &c.label {
                    labels.entry(label.clone()).or_default().push(c.id.to_string());
                }
            });
            for ids in labels.values_mut() {
                ids.sort();
            }
            serde_json::to_vec_pretty(&labels).map_err(|e| e.to_string())
        });

        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            written = result.partitions_written,
            skipped = result.partitions_skipped,
            failed = result.failed_partitions.len(),
            files = result.files_written.len(),
            bytes = result.bytes_written,
            duration_ms = result.duration_ms,
            "persist complete"
        );
        Ok(result)
    }

    /// Write one sidecar unless its generation or its bytes are unchanged.
    fn write_sidecar(
        &self,
        root: &Path,
        name: &'static str,
        generation: Option<u64>,
        result: &mut PersistResult,
        encode: impl FnOnce() -> std::result::Result<Vec<u8>, String>,
    ) {
        let previous = self.sidecars.lock().get(name).copied().unwrap_or_default();
        if generation.is_some() && previous.generation == generation && previous.fingerprint.is_some() {
            return;
        }
        let bytes = match encode() {
            Ok(b) => b,
            Err(reason) => {
                warn!(file = name, %reason, "failed to serialize sidecar");
                result.failed_files.push((name.to_string(), reason));
                return;
            }
        };
        let fingerprint = storage::fingerprint64(&bytes);
        if previous.fingerprint == Some(fingerprint) {
            self.sidecars.lock().insert(
                name,
                Sidecar {
                    generation,
                    fingerprint: Some(fingerprint),
                },
            );
            return;
        }
        let path = root.join(name);
        match storage::write_atomic(&path, &bytes) {
            Ok(()) => {
                result.bytes_written += bytes.len() as u64;
                result.files_written.push(name.to_string());
                self.sidecars.lock().insert(
                    name,
                    Sidecar {
                        generation,
                        fingerprint: Some(fingerprint),
                    },
                );
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "sidecar write failed");
                result.failed_files.push((name.to_string(), e.to_string()));
            }
        }
    }

    // ---------------------------------------------------------------------
    // Integrity & stats
    // ---------------------------------------------------------------------

    /// Sampled membership-vs-bank check (`StoreConfig::integrity_sample`).
    pub fn verify_integrity(&self) -> IntegrityReport {
        let seed = self.integrity_seed.fetch_add(1, Ordering::Relaxed);
        self.bank.verify_integrity(self.cfg.store.integrity_sample, seed)
    }

    /// Full scan, fixing dangling references per the configured policy.
    pub fn heal_integrity(&self) -> HealReport {
        self.bank.heal(self.cfg.store.integrity_policy)
    }

    /// Forget stale activation records per `ActivationConfig::prune`.
    pub fn prune_activations(&self) -> usize {
        self.activation.prune(storage::now_millis())
    }

    pub fn top_regions(&self, n: usize) -> Vec<(RegionId, ActivationRecord)> {
        self.activation.top_regions(n)
    }

    pub fn partition_metadata(&self) -> BTreeMap<PartitionKey, PartitionMetadata> {
        self.bank.partition_metadata()
    }

    pub fn get_stats(&self) -> ResolverStats {
        let q = self.quantizer.read().stats();
        let bank = self.bank.stats();
        let activated = self.activation.distinct_regions();

        let (perplexity, utilization, active_codes) = match q.kind {
            QuantizerKind::Codebook => (q.perplexity, q.utilization, q.active_codes),
            QuantizerKind::Lsh => {
                let utilization = if q.capacity == 0 {
                    0.0
                } else {
                    (activated as f64 / q.capacity as f64) as f32
                };
                (self.activation.perplexity(), utilization, activated)
            }
        };

        ResolverStats {
            quantizer: q.kind,
            perplexity,
            codebook_utilization: utilization,
            active_codes,
            total_regions: self.directory.region_count(),
            activated_regions: activated,
            total_activations: self.activation.total_activations(),
            clusters: bank.clusters,
            neurons: bank.neurons,
            memberships: bank.memberships,
            dirty_partitions: bank.dirty_partitions,
            degenerate: q.degenerate,
        }
    }
}

impl Sidecar {
    fn loaded(bytes: &[u8]) -> Self {
        Self {
            generation: None,
            fingerprint: Some(storage::fingerprint64(bytes)),
        }
    }

    fn at(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }
}

fn read_sidecar(path: &Path) -> std::result::Result<Option<Vec<u8>>, StoreError> {
    storage::read_optional(path).map_err(|e| StoreError::io(path, e))
}
