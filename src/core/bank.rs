//! Partitioned, diff-aware neuron and cluster store.
//!
//! Neurons and clusters live in `partition_count` partitions, each behind its
//! own mutex. A neuron lives in the partition of its own id, a cluster in the
//! partition of its cluster id. Clusters only hold `NeuronId` references; the
//! canonical neuron record exists exactly once, in the bank.
//!
//! Partition lifecycle: `Clean -> Dirty -> Saving -> Clean`.
//! - any change marks the partition `Dirty` and bumps its generation
//! - `persist_all` serializes under the lock, marks `Saving`, writes with the
//!   lock released, then returns to `Clean` only if no mutation happened
//!   meanwhile
//! - a partition whose serialized image has the same length and fingerprint
//!   as the last write is not rewritten
//!
//! On disk every partition is one sealed `NCPART01` image written with
//! write-to-temp-then-rename, so a crash mid-persist leaves every partition
//! either at its old or its new version.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::ids::{ClusterId, NeuronId, PartitionKey};
use crate::pool;
use crate::prng::Prng;
use crate::storage;

pub const PARTITION_DIR: &str = "partitions";
pub const PARTITION_EXT: &str = "ncp";

const TAG_META: [u8; 4] = *b"META";
const TAG_NEURONS: [u8; 4] = *b"NEUR";
const TAG_CLUSTERS: [u8; 4] = *b"CLUS";

const MAX_WEIGHT_DIM: usize = 1 << 14;
const MAX_MEMBERS: u32 = 1 << 24;

/// What to do with a membership reference that has no bank record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum IntegrityPolicy {
    /// Log only.
    Report,
    /// Remove the reference from the cluster.
    #[default]
    DropDangling,
    /// Create a zero-initialized neuron for the reference.
    RecreateMissing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StoreConfig {
    pub partition_count: u16,
    /// Length of every neuron weight vector.
    pub weight_dim: usize,
    /// Memberships sampled by `verify_integrity`; 0 checks all of them.
    pub integrity_sample: usize,
    pub integrity_policy: IntegrityPolicy,
    /// Concurrent partition writers during `persist_all`.
    pub write_parallelism: usize,
    /// Extra attempts after a failed partition write.
    pub max_write_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            partition_count: 64,
            weight_dim: 16,
            integrity_sample: 256,
            integrity_policy: IntegrityPolicy::default(),
            write_parallelism: 4,
            max_write_retries: 2,
        }
    }
}

impl StoreConfig {
    pub fn with_partition_count(mut self, count: u16) -> Self {
        self.partition_count = count;
        self
    }

    pub fn with_weight_dim(mut self, dim: usize) -> Self {
        self.weight_dim = dim;
        self
    }

    pub fn with_integrity_policy(mut self, policy: IntegrityPolicy) -> Self {
        self.integrity_policy = policy;
        self
    }

    pub fn with_write_parallelism(mut self, threads: usize) -> Self {
        self.write_parallelism = threads;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.partition_count == 0 {
            return Err("partition_count must be > 0");
        }
        if self.weight_dim == 0 || self.weight_dim > MAX_WEIGHT_DIM {
            return Err("weight_dim must be in [1, 16384]");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NeuronRecord {
    pub weights: Vec<f32>,
    /// Unix millis.
    pub last_used: u64,
    pub strength: f32,
}

impl NeuronRecord {
    pub fn zeroed(weight_dim: usize) -> Self {
        Self {
            weights: vec![0.0; weight_dim],
            last_used: 0,
            strength: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClusterRecord {
    pub id: ClusterId,
    /// Debug-only concept label.
    pub label: Option<String>,
    pub members: BTreeSet<NeuronId>,
    /// Representative feature vector (unit length).
    pub centroid: Vec<f32>,
    pub importance: f32,
    pub activations: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ClusterRecord {
    pub fn new(id: ClusterId, label: Option<String>, centroid: Vec<f32>, now: u64) -> Self {
        Self {
            id,
            label,
            members: BTreeSet::new(),
            centroid,
            importance: 0.0,
            activations: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PartitionState {
    Clean,
    Dirty,
    Saving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipMode {
    /// Add to the existing set.
    Merge,
    /// Make the set exactly the given ids.
    Replace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    pub added: Vec<NeuronId>,
    pub removed: Vec<NeuronId>,
    /// Neurons that had to be created to back new references.
    pub created_neurons: usize,
}

impl MembershipDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeuronHandle {
    pub id: NeuronId,
    pub partition: PartitionKey,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PartitionMetadata {
    pub cluster_ids: Vec<ClusterId>,
    pub neuron_count: usize,
    pub dirty: bool,
    pub state: PartitionState,
    /// Unix millis of the last successful write.
    pub last_write: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BankPersistReport {
    pub written: Vec<PartitionKey>,
    pub skipped: usize,
    pub failed: Vec<(PartitionKey, String)>,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BankLoadReport {
    pub partitions_loaded: usize,
    pub corrupt: Vec<(PartitionKey, String)>,
    pub clusters: usize,
    pub neurons: usize,
    /// Records found in a partition other than the one their id maps to
    /// (e.g. after changing `partition_count`); they were moved.
    pub rehomed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IntegrityReport {
    pub total_memberships: usize,
    pub sampled: usize,
    pub mismatches: usize,
    pub dangling: Vec<(ClusterId, NeuronId)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HealReport {
    pub dangling: usize,
    pub dropped: usize,
    pub recreated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactReport {
    pub rewritten: usize,
    pub removed_files: usize,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BankStats {
    pub partitions: usize,
    pub dirty_partitions: usize,
    pub clusters: usize,
    pub neurons: usize,
    pub memberships: usize,
}

#[derive(Debug)]
struct Partition {
    neurons: BTreeMap<NeuronId, NeuronRecord>,
    clusters: BTreeMap<ClusterId, ClusterRecord>,
    state: PartitionState,
    generation: u64,
    /// Length and fingerprint of the last image written or loaded.
    persisted: Option<ImageDigest>,
    last_write: Option<u64>,
}

impl Partition {
    fn empty() -> Self {
        Self {
            neurons: BTreeMap::new(),
            clusters: BTreeMap::new(),
            state: PartitionState::Clean,
            generation: 0,
            persisted: None,
            last_write: None,
        }
    }

    fn mark_dirty(&mut self) {
        self.state = PartitionState::Dirty;
        self.generation += 1;
    }

    fn is_empty(&self) -> bool {
        self.neurons.is_empty() && self.clusters.is_empty()
    }
}

/// Length plus 64-bit fingerprint of a partition image. Two images with the
/// same digest are treated as identical; a fingerprint collision at equal
/// length would skip one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ImageDigest {
    len: usize,
    fingerprint: u64,
}

impl ImageDigest {
    fn of(bytes: &[u8]) -> Self {
        Self {
            len: bytes.len(),
            fingerprint: storage::fingerprint64(bytes),
        }
    }
}

#[cfg(test)]
type WriteHook = fn(&NeuronBank, PartitionKey);

enum WriteOutcome {
    Written(u64),
    Skipped,
    Failed(String),
}

pub struct NeuronBank {
    cfg: StoreConfig,
    root: Option<PathBuf>,
    partitions: Box<[Mutex<Partition>]>,
    /// Runs after a partition is serialized and before its file is written.
    #[cfg(test)]
    before_write: Mutex<Option<WriteHook>>,
}

impl NeuronBank {
    /// Bank with no storage root; `persist_all` reports `NoStorageRoot`.
    pub fn in_memory(cfg: StoreConfig) -> Result<Self, StoreError> {
        cfg.validate().map_err(StoreError::InvalidConfig)?;
        let partitions = (0..cfg.partition_count)
            .map(|_| Mutex::new(Partition::empty()))
            .collect();
        Ok(Self {
            cfg,
            root: None,
            partitions,
            #[cfg(test)]
            before_write: Mutex::new(None),
        })
    }

    /// Open (or create) a bank under `root`, loading every readable partition.
    ///
    /// A partition file that fails to decode is treated as empty and reported;
    /// the rest of the store loads normally.
    pub fn open(root: impl Into<PathBuf>, cfg: StoreConfig) -> Result<(Self, BankLoadReport), StoreError> {
        let mut bank = Self::in_memory(cfg)?;
        let root = root.into();
        let dir = root.join(PARTITION_DIR);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        bank.root = Some(root);

        let mut report = BankLoadReport::default();
        let mut files: Vec<(PartitionKey, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PARTITION_EXT) {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(PartitionKey::from_file_stem)
            else {
                continue;
            };
            files.push((key, path));
        }
        files.sort();

        for (key, path) in files {
            let bytes = match fs::read(&path) {
                Ok(b) => b,
                Err(e) => {
                    warn!(partition = %key, path = ?path, error = %e, "unreadable partition, treating as empty");
                    report.corrupt.push((key, e.to_string()));
                    continue;
                }
            };
            let decoded = match decode_partition(&bytes, bank.cfg.weight_dim) {
                Ok(d) => d,
                Err(e) => {
                    warn!(partition = %key, path = ?path, error = %e, "corrupt partition, treating as empty");
                    report.corrupt.push((key, e.to_string()));
                    continue;
                }
            };
            report.partitions_loaded += 1;
            report.rehomed += bank.absorb(key, decoded, ImageDigest::of(&bytes));
        }

        let stats = bank.stats();
        report.clusters = stats.clusters;
        report.neurons = stats.neurons;
        info!(
            partitions = report.partitions_loaded,
            corrupt = report.corrupt.len(),
            clusters = report.clusters,
            neurons = report.neurons,
            "neuron bank loaded"
        );
        Ok((bank, report))
    }

    /// Place decoded records into their partitions. Returns how many records
    /// did not belong to `file_key`.
    fn absorb(&self, file_key: PartitionKey, decoded: DecodedPartition, digest: ImageDigest) -> usize {
        let count = self.cfg.partition_count;
        let mut rehomed = 0;
        for (id, rec) in decoded.neurons {
            let key = id.partition_key(count);
            if key != file_key {
                rehomed += 1;
            }
            let mut p = self.partitions[key.index() as usize].lock();
            p.neurons.insert(id, rec);
            if key != file_key {
                p.mark_dirty();
            }
        }
        for (id, rec) in decoded.clusters {
            let key = id.partition_key(count);
            if key != file_key {
                rehomed += 1;
            }
            let mut p = self.partitions[key.index() as usize].lock();
            p.clusters.insert(id, rec);
            if key != file_key {
                p.mark_dirty();
            }
        }

        if (file_key.index() as usize) < self.partitions.len() {
            let mut p = self.partitions[file_key.index() as usize].lock();
            if rehomed > 0 {
                // The file still holds the moved records; rewrite it.
                p.mark_dirty();
            } else if p.state == PartitionState::Clean {
                p.persisted = Some(digest);
            }
        }
        rehomed
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn partition_count(&self) -> u16 {
        self.cfg.partition_count
    }

    fn neuron_partition(&self, id: &NeuronId) -> (PartitionKey, &Mutex<Partition>) {
        let key = id.partition_key(self.cfg.partition_count);
        (key, &self.partitions[key.index() as usize])
    }

    fn cluster_partition(&self, id: &ClusterId) -> &Mutex<Partition> {
        let key = id.partition_key(self.cfg.partition_count);
        &self.partitions[key.index() as usize]
    }

    pub fn partition_path(&self, key: PartitionKey) -> Option<PathBuf> {
        self.root.as_ref().map(|root| partition_path(root, key))
    }

    // ---------------------------------------------------------------------
    // Neurons
    // ---------------------------------------------------------------------

    /// Load the neuron if resident, else create a zero-initialized record.
    /// Never creates a second record for an existing id.
    pub fn get_or_create_neuron(&self, id: NeuronId) -> NeuronHandle {
        let (partition, lock) = self.neuron_partition(&id);
        let mut p = lock.lock();
        let created = !p.neurons.contains_key(&id);
        if created {
            p.neurons.insert(id, NeuronRecord::zeroed(self.cfg.weight_dim));
            p.mark_dirty();
        }
        NeuronHandle {
            id,
            partition,
            created,
        }
    }

    pub fn neuron(&self, id: &NeuronId) -> Option<NeuronRecord> {
        self.neuron_partition(id).1.lock().neurons.get(id).cloned()
    }

    pub fn contains_neuron(&self, id: &NeuronId) -> bool {
        self.neuron_partition(id).1.lock().neurons.contains_key(id)
    }

    /// Mutate an existing neuron. The partition is marked dirty only if the
    /// record actually changed.
    pub fn update_neuron<R>(&self, id: &NeuronId, f: impl FnOnce(&mut NeuronRecord) -> R) -> Option<R> {
        let mut p = self.neuron_partition(id).1.lock();
        let rec = p.neurons.get_mut(id)?;
        let before = rec.clone();
        let out = f(rec);
        let changed = *rec != before;
        if changed {
            p.mark_dirty();
        }
        Some(out)
    }

    /// Create-if-missing then mutate, under one partition lock.
    pub fn upsert_neuron<R>(&self, id: NeuronId, f: impl FnOnce(&mut NeuronRecord) -> R) -> (NeuronHandle, R) {
        let (partition, lock) = self.neuron_partition(&id);
        let mut p = lock.lock();
        let created = !p.neurons.contains_key(&id);
        let weight_dim = self.cfg.weight_dim;
        let rec = p
            .neurons
            .entry(id)
            .or_insert_with(|| NeuronRecord::zeroed(weight_dim));
        let before = rec.clone();
        let out = f(rec);
        let changed = created || *rec != before;
        if changed {
            p.mark_dirty();
        }
        (
            NeuronHandle {
                id,
                partition,
                created,
            },
            out,
        )
    }

    // ---------------------------------------------------------------------
    // Clusters
    // ---------------------------------------------------------------------

    pub fn create_cluster(&self, record: ClusterRecord) -> Result<(), StoreError> {
        let mut p = self.cluster_partition(&record.id).lock();
        if p.clusters.contains_key(&record.id) {
            return Err(StoreError::DuplicateCluster(record.id));
        }
        p.clusters.insert(record.id, record);
        p.mark_dirty();
        Ok(())
    }

    pub fn cluster(&self, id: &ClusterId) -> Option<ClusterRecord> {
        self.cluster_partition(id).lock().clusters.get(id).cloned()
    }

    pub fn contains_cluster(&self, id: &ClusterId) -> bool {
        self.cluster_partition(id).lock().clusters.contains_key(id)
    }

    /// Mutate a cluster's scalar fields. Marks dirty only on change.
    pub fn update_cluster<R>(
        &self,
        id: &ClusterId,
        f: impl FnOnce(&mut ClusterRecord) -> R,
    ) -> Result<R, StoreError> {
        let mut p = self.cluster_partition(id).lock();
        let rec = p.clusters.get_mut(id).ok_or(StoreError::UnknownCluster(*id))?;
        let before = rec.clone();
        let out = f(rec);
        let changed = *rec != before;
        if changed {
            p.mark_dirty();
        }
        Ok(out)
    }

    /// Merge (or replace) a cluster's membership set.
    ///
    /// Every referenced neuron is created in the bank before the reference is
    /// recorded, so membership never points at a missing record. Locks are
    /// taken one partition at a time. The cluster's partition is marked dirty
    /// only when the set actually changed.
    pub fn upsert_cluster_membership(
        &self,
        cluster: &ClusterId,
        neuron_ids: &[NeuronId],
        mode: MembershipMode,
    ) -> Result<MembershipDiff, StoreError> {
        if !self.contains_cluster(cluster) {
            return Err(StoreError::UnknownCluster(*cluster));
        }

        let wanted: BTreeSet<NeuronId> = neuron_ids.iter().copied().collect();
        let mut created_neurons = 0;
        for id in &wanted {
            if self.get_or_create_neuron(*id).created {
                created_neurons += 1;
            }
        }

        let mut p = self.cluster_partition(cluster).lock();
        let rec = p
            .clusters
            .get_mut(cluster)
            .ok_or(StoreError::UnknownCluster(*cluster))?;

        let added: Vec<NeuronId> = wanted.difference(&rec.members).copied().collect();
        let removed: Vec<NeuronId> = match mode {
            MembershipMode::Merge => Vec::new(),
            MembershipMode::Replace => rec.members.difference(&wanted).copied().collect(),
        };

        let diff = MembershipDiff {
            added,
            removed,
            created_neurons,
        };
        if diff.is_empty() {
            if created_neurons > 0 {
                debug!(cluster = %cluster, "membership unchanged; only backing neurons created");
            }
            return Ok(diff);
        }

        for id in &diff.added {
            rec.members.insert(*id);
        }
        for id in &diff.removed {
            rec.members.remove(id);
        }
        rec.updated_at = storage::now_millis();
        p.mark_dirty();
        Ok(diff)
    }

    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        let mut out = Vec::new();
        for lock in self.partitions.iter() {
            out.extend(lock.lock().clusters.keys().copied());
        }
        out.sort();
        out
    }

    /// Visit every cluster, one partition lock at a time.
    pub fn for_each_cluster(&self, mut f: impl FnMut(&ClusterRecord)) {
        for lock in self.partitions.iter() {
            let p = lock.lock();
            for rec in p.clusters.values() {
                f(rec);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    /// Write every dirty partition whose image differs from the last one
    /// written, compared by length and 64-bit fingerprint.
    ///
    /// Partitions are written concurrently, at most `write_parallelism` at a
    /// time. A partition that fails after all retries stays `Dirty` and is
    /// listed in `failed`; the other partitions still commit.
    pub fn persist_all(&self) -> Result<BankPersistReport, StoreError> {
        let root = self.root.as_ref().ok_or(StoreError::NoStorageRoot)?;
        let dir = root.join(PARTITION_DIR);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let indices: Vec<usize> = (0..self.partitions.len()).collect();
        let outcomes = pool::map_bounded(&indices, self.cfg.write_parallelism, |&i| {
            self.persist_partition(root, i)
        });

        let mut report = BankPersistReport::default();
        for (i, outcome) in outcomes.into_iter().enumerate() {
            let key = PartitionKey::new(i as u16);
            match outcome {
                WriteOutcome::Written(bytes) => {
                    report.written.push(key);
                    report.bytes_written += bytes;
                }
                WriteOutcome::Skipped => report.skipped += 1,
                WriteOutcome::Failed(reason) => report.failed.push((key, reason)),
            }
        }
        Ok(report)
    }

    fn persist_partition(&self, root: &Path, index: usize) -> WriteOutcome {
        let key = PartitionKey::new(index as u16);
        let lock = &self.partitions[index];

        let (bytes, digest, generation) = {
            let mut p = lock.lock();
            if p.state != PartitionState::Dirty {
                return WriteOutcome::Skipped;
            }
            let bytes = match encode_partition(key, self.cfg.partition_count, self.cfg.weight_dim, &p) {
                Ok(b) => b,
                Err(e) => {
                    warn!(partition = %key, error = %e, "failed to serialize partition");
                    return WriteOutcome::Failed(e.to_string());
                }
            };
            let digest = ImageDigest::of(&bytes);
            if p.persisted == Some(digest) {
                debug!(partition = %key, "partition unchanged on disk; skipping write");
                p.state = PartitionState::Clean;
                return WriteOutcome::Skipped;
            }
            p.state = PartitionState::Saving;
            (bytes, digest, p.generation)
        };

        #[cfg(test)]
        {
            let hook = *self.before_write.lock();
            if let Some(hook) = hook {
                hook(self, key);
            }
        }

        let path = partition_path(root, key);
        let mut attempt = 0;
        let result = loop {
            match storage::write_atomic(&path, &bytes) {
                Ok(()) => break Ok(()),
                Err(e) if attempt < self.cfg.max_write_retries => {
                    attempt += 1;
                    debug!(partition = %key, attempt, error = %e, "retrying partition write");
                }
                Err(e) => break Err(e),
            }
        };

        let mut p = lock.lock();
        match result {
            Ok(()) => {
                p.persisted = Some(digest);
                p.last_write = Some(storage::now_millis());
                // A mutation during Saving bumped the generation and must be written next time.
                p.state = if p.generation == generation {
                    PartitionState::Clean
                } else {
                    PartitionState::Dirty
                };
                WriteOutcome::Written(bytes.len() as u64)
            }
            Err(e) => {
                p.state = PartitionState::Dirty;
                warn!(partition = %key, path = ?path, error = %e, "partition write failed");
                WriteOutcome::Failed(e.to_string())
            }
        }
    }

    /// Rewrite every non-empty partition, delete files of empty partitions and
    /// leftover temp files. Clears the metadata of emptied partitions.
    pub fn compact(&self) -> Result<CompactReport, StoreError> {
        let root = self.root.as_ref().ok_or(StoreError::NoStorageRoot)?;
        let dir = root.join(PARTITION_DIR);
        let mut report = CompactReport::default();

        for (i, lock) in self.partitions.iter().enumerate() {
            let key = PartitionKey::new(i as u16);
            let path = partition_path(root, key);
            let mut p = lock.lock();
            if p.is_empty() {
                match fs::remove_file(&path) {
                    Ok(()) => report.removed_files += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(StoreError::io(&path, e)),
                }
                p.persisted = None;
                p.last_write = None;
                p.state = PartitionState::Clean;
                continue;
            }
            let bytes = encode_partition(key, self.cfg.partition_count, self.cfg.weight_dim, &p)
                .map_err(|e| StoreError::io(&path, e))?;
            storage::write_atomic(&path, &bytes).map_err(|e| StoreError::io(&path, e))?;
            p.persisted = Some(ImageDigest::of(&bytes));
            p.last_write = Some(storage::now_millis());
            p.state = PartitionState::Clean;
            report.rewritten += 1;
            report.bytes_written += bytes.len() as u64;
        }

        // Stray files: temp leftovers and partitions beyond the current count.
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let stray_tmp = name.ends_with(".tmp");
            let out_of_range = path.extension().and_then(|e| e.to_str()) == Some(PARTITION_EXT)
                && path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(PartitionKey::from_file_stem)
                    .map_or(false, |k| k.index() >= self.cfg.partition_count);
            if stray_tmp || out_of_range {
                fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
                report.removed_files += 1;
            }
        }

        info!(
            rewritten = report.rewritten,
            removed = report.removed_files,
            bytes = report.bytes_written,
            "neuron bank compacted"
        );
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // Integrity
    // ---------------------------------------------------------------------

    /// Every (cluster, neuron) membership pair, gathered one partition at a time.
    fn memberships_in(&self, index: usize) -> Vec<(ClusterId, NeuronId)> {
        let p = self.partitions[index].lock();
        p.clusters
            .values()
            .flat_map(|c| c.members.iter().map(move |n| (c.id, *n)))
            .collect()
    }

    /// Sample up to `sample` memberships (0 = all) and confirm each referenced
    /// neuron has a bank record. Reservoir sampling keeps memory bounded.
    pub fn verify_integrity(&self, sample: usize, seed: u64) -> IntegrityReport {
        let mut rng = Prng::new(seed);
        let mut reservoir: Vec<(ClusterId, NeuronId)> = Vec::new();
        let mut total = 0usize;

        for i in 0..self.partitions.len() {
            for pair in self.memberships_in(i) {
                total += 1;
                if sample == 0 || reservoir.len() < sample {
                    reservoir.push(pair);
                } else {
                    let j = rng.gen_range_usize(0, total);
                    if j < sample {
                        reservoir[j] = pair;
                    }
                }
            }
        }

        let dangling: Vec<(ClusterId, NeuronId)> = reservoir
            .iter()
            .filter(|(_, n)| !self.contains_neuron(n))
            .copied()
            .collect();
        for (cluster, neuron) in &dangling {
            warn!(cluster = %cluster, neuron = %neuron, "membership references missing neuron");
        }

        IntegrityReport {
            total_memberships: total,
            sampled: reservoir.len(),
            mismatches: dangling.len(),
            dangling,
        }
    }

    /// Full scan for dangling references, fixed according to `policy`.
    /// Every affected reference is logged.
    pub fn heal(&self, policy: IntegrityPolicy) -> HealReport {
        let mut report = HealReport::default();
        for i in 0..self.partitions.len() {
            let dangling: Vec<(ClusterId, NeuronId)> = self
                .memberships_in(i)
                .into_iter()
                .filter(|(_, n)| !self.contains_neuron(n))
                .collect();
            report.dangling += dangling.len();

            for (cluster, neuron) in dangling {
                match policy {
                    IntegrityPolicy::Report => {
                        warn!(cluster = %cluster, neuron = %neuron, "dangling membership left in place");
                    }
                    IntegrityPolicy::DropDangling => {
                        let mut p = self.partitions[i].lock();
                        let removed = p
                            .clusters
                            .get_mut(&cluster)
                            .map_or(false, |c| c.members.remove(&neuron));
                        if removed {
                            p.mark_dirty();
                            report.dropped += 1;
                            warn!(cluster = %cluster, neuron = %neuron, "dropped dangling membership");
                        }
                    }
                    IntegrityPolicy::RecreateMissing => {
                        if self.get_or_create_neuron(neuron).created {
                            report.recreated += 1;
                            warn!(cluster = %cluster, neuron = %neuron, "recreated missing neuron");
                        }
                    }
                }
            }
        }
        report
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    /// Metadata for every partition that holds data or has been written.
    pub fn partition_metadata(&self) -> BTreeMap<PartitionKey, PartitionMetadata> {
        let mut out = BTreeMap::new();
        for (i, lock) in self.partitions.iter().enumerate() {
            let p = lock.lock();
            if p.is_empty() && p.last_write.is_none() && p.state == PartitionState::Clean {
                continue;
            }
            out.insert(
                PartitionKey::new(i as u16),
                PartitionMetadata {
                    cluster_ids: p.clusters.keys().copied().collect(),
                    neuron_count: p.neurons.len(),
                    dirty: p.state != PartitionState::Clean,
                    state: p.state,
                    last_write: p.last_write,
                },
            );
        }
        out
    }

    pub fn stats(&self) -> BankStats {
        let mut s = BankStats {
            partitions: self.partitions.len(),
            ..BankStats::default()
        };
        for lock in self.partitions.iter() {
            let p = lock.lock();
            if p.state != PartitionState::Clean {
                s.dirty_partitions += 1;
            }
            s.clusters += p.clusters.len();
            s.neurons += p.neurons.len();
            s.memberships += p.clusters.values().map(|c| c.members.len()).sum::<usize>();
        }
        s
    }

    #[cfg(test)]
    fn remove_neuron_for_test(&self, id: &NeuronId) {
        let mut p = self.neuron_partition(id).1.lock();
        p.neurons.remove(id);
        p.mark_dirty();
    }
}

pub fn partition_path(root: &Path, key: PartitionKey) -> PathBuf {
    root.join(PARTITION_DIR)
        .join(format!("{}.{PARTITION_EXT}", key.file_stem()))
}

// -------------------------------------------------------------------------
// Partition image
// -------------------------------------------------------------------------

struct DecodedPartition {
    neurons: Vec<(NeuronId, NeuronRecord)>,
    clusters: Vec<(ClusterId, ClusterRecord)>,
}

/// Deterministic: records are written in id order and no write-time
/// values are embedded, so unchanged content gives identical bytes.
fn encode_partition(
    key: PartitionKey,
    partition_count: u16,
    weight_dim: usize,
    p: &Partition,
) -> io::Result<Vec<u8>> {
    let mut image = Vec::new();
    storage::write_header(&mut image, storage::PARTITION_MAGIC)?;

    let mut meta = Vec::with_capacity(16);
    storage::write_u16_le(&mut meta, key.index())?;
    storage::write_u16_le(&mut meta, partition_count)?;
    storage::write_len(&mut meta, weight_dim)?;
    storage::write_len(&mut meta, p.neurons.len())?;
    storage::write_len(&mut meta, p.clusters.len())?;
    storage::write_chunk(&mut image, TAG_META, &meta)?;

    let mut neurons = Vec::with_capacity(p.neurons.len() * (16 + 12 + 4 + weight_dim * 4));
    for (id, rec) in &p.neurons {
        storage::write_uuid(&mut neurons, id.as_uuid())?;
        storage::write_u64_le(&mut neurons, rec.last_used)?;
        storage::write_f32_le(&mut neurons, rec.strength)?;
        storage::write_f32_slice(&mut neurons, &rec.weights)?;
    }
    storage::write_chunk_v2_lz4(&mut image, TAG_NEURONS, &neurons)?;

    let mut clusters = Vec::new();
    for (id, rec) in &p.clusters {
        storage::write_uuid(&mut clusters, id.as_uuid())?;
        match &rec.label {
            Some(label) => {
                storage::write_u8(&mut clusters, 1)?;
                storage::write_string(&mut clusters, label)?;
            }
            None => storage::write_u8(&mut clusters, 0)?,
        }
        storage::write_f32_le(&mut clusters, rec.importance)?;
        storage::write_u64_le(&mut clusters, rec.activations)?;
        storage::write_u64_le(&mut clusters, rec.created_at)?;
        storage::write_u64_le(&mut clusters, rec.updated_at)?;
        storage::write_f32_slice(&mut clusters, &rec.centroid)?;
        storage::write_len(&mut clusters, rec.members.len())?;
        for n in &rec.members {
            storage::write_uuid(&mut clusters, n.as_uuid())?;
        }
    }
    storage::write_chunk_v2_lz4(&mut image, TAG_CLUSTERS, &clusters)?;

    storage::seal(&mut image)?;
    Ok(image)
}

fn decode_partition(image: &[u8], weight_dim: usize) -> io::Result<DecodedPartition> {
    let body = storage::unseal(image)?;
    let mut cursor = io::Cursor::new(body);
    storage::read_header(&mut cursor, storage::PARTITION_MAGIC)?;
    let rest = &body[cursor.position() as usize..];

    let mut counts: Option<(usize, usize)> = None;
    let mut out = DecodedPartition {
        neurons: Vec::new(),
        clusters: Vec::new(),
    };

    storage::for_each_chunk(rest, &[TAG_NEURONS, TAG_CLUSTERS], |tag, payload| {
        let mut r = io::Cursor::new(payload);
        match tag {
            TAG_META => {
                let _index = storage::read_u16_le(&mut r)?;
                let _count = storage::read_u16_le(&mut r)?;
                let _stored_dim = storage::read_u32_le(&mut r)?;
                let neurons = storage::read_u32_le(&mut r)? as usize;
                let clusters = storage::read_u32_le(&mut r)? as usize;
                counts = Some((neurons, clusters));
            }
            TAG_NEURONS => {
                while (r.position() as usize) < payload.len() {
                    let id = NeuronId::from_uuid(storage::read_uuid(&mut r)?);
                    let last_used = storage::read_u64_le(&mut r)?;
                    let strength = storage::read_f32_le(&mut r)?;
                    let mut weights = storage::read_f32_vec(&mut r, MAX_WEIGHT_DIM)?;
                    // Weight width follows the current config.
                    weights.resize(weight_dim, 0.0);
                    out.neurons.push((
                        id,
                        NeuronRecord {
                            weights,
                            last_used,
                            strength,
                        },
                    ));
                }
            }
            TAG_CLUSTERS => {
                while (r.position() as usize) < payload.len() {
                    let id = ClusterId::from_uuid(storage::read_uuid(&mut r)?);
                    let label = match storage::read_u8(&mut r)? {
                        0 => None,
                        1 => Some(storage::read_string(&mut r)?),
                        _ => return Err(invalid("bad label flag")),
                    };
                    let importance = storage::read_f32_le(&mut r)?;
                    let activations = storage::read_u64_le(&mut r)?;
                    let created_at = storage::read_u64_le(&mut r)?;
                    let updated_at = storage::read_u64_le(&mut r)?;
                    let centroid = storage::read_f32_vec(&mut r, MAX_WEIGHT_DIM)?;
                    let m = storage::read_u32_le(&mut r)?;
                    if m > MAX_MEMBERS {
                        return Err(invalid("member list too long"));
                    }
                    let mut members = BTreeSet::new();
                    for _ in 0..m {
                        members.insert(NeuronId::from_uuid(storage::read_uuid(&mut r)?));
                    }
                    out.clusters.push((
                        id,
                        ClusterRecord {
                            id,
                            label,
                            members,
                            centroid,
                            importance,
                            activations,
                            created_at,
                            updated_at,
                        },
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    })?;

    let (neurons, clusters) = counts.ok_or_else(|| invalid("missing META chunk"))?;
    if neurons != out.neurons.len() || clusters != out.clusters.len() {
        return Err(invalid("record count mismatch"));
    }
    Ok(out)
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> StoreConfig {
        StoreConfig::default().with_partition_count(8).with_weight_dim(4)
    }

    fn cluster(n: u128) -> ClusterRecord {
        ClusterRecord::new(ClusterId::from_u128(n), Some(format!("c{n}")), vec![1.0, 0.0], 1)
    }

    fn neurons(names: &[&str]) -> Vec<NeuronId> {
        names.iter().map(|n| NeuronId::for_feature(n)).collect()
    }

    #[test]
    fn get_or_create_never_duplicates() {
        let bank = NeuronBank::in_memory(cfg()).unwrap();
        let id = NeuronId::for_feature("fur");
        assert!(bank.get_or_create_neuron(id).created);
        assert!(!bank.get_or_create_neuron(id).created);
        let upper = NeuronId::parse(&id.to_string().to_uppercase()).unwrap();
        assert!(!bank.get_or_create_neuron(upper).created);
        assert_eq!(bank.stats().neurons, 1);
        assert_eq!(bank.neuron(&id).unwrap().weights, vec![0.0; 4]);
    }

    #[test]
    fn membership_merges_and_backs_every_reference() {
        let bank = NeuronBank::in_memory(cfg()).unwrap();
        let c = cluster(1);
        let id = c.id;
        bank.create_cluster(c).unwrap();

        let d1 = bank
            .upsert_cluster_membership(&id, &neurons(&["a", "b"]), MembershipMode::Merge)
            .unwrap();
        assert_eq!(d1.added.len(), 2);
        assert_eq!(d1.created_neurons, 2);

        let d2 = bank
            .upsert_cluster_membership(&id, &neurons(&["b", "c"]), MembershipMode::Merge)
            .unwrap();
        assert_eq!(d2.added, neurons(&["c"]));
        assert!(d2.removed.is_empty());
        assert_eq!(bank.cluster(&id).unwrap().size(), 3);

        let d3 = bank
            .upsert_cluster_membership(&id, &neurons(&["c"]), MembershipMode::Replace)
            .unwrap();
        assert_eq!(d3.removed.len(), 2);
        assert_eq!(bank.cluster(&id).unwrap().size(), 1);

        for n in neurons(&["a", "b", "c"]) {
            assert!(bank.contains_neuron(&n));
        }
        assert_eq!(bank.verify_integrity(0, 1).mismatches, 0);
    }

    #[test]
    fn unchanged_membership_does_not_dirty_partition() {
        let dir = tempfile::tempdir().unwrap();
        let (bank, _) = NeuronBank::open(dir.path(), cfg()).unwrap();
        let c = cluster(2);
        let id = c.id;
        bank.create_cluster(c).unwrap();
        bank.upsert_cluster_membership(&id, &neurons(&["x"]), MembershipMode::Merge)
            .unwrap();
        bank.persist_all().unwrap();
        assert_eq!(bank.stats().dirty_partitions, 0);

        let diff = bank
            .upsert_cluster_membership(&id, &neurons(&["x"]), MembershipMode::Merge)
            .unwrap();
        assert!(diff.is_empty());
        assert_eq!(bank.stats().dirty_partitions, 0);
    }

    #[test]
    fn unknown_and_duplicate_clusters_are_errors() {
        let bank = NeuronBank::in_memory(cfg()).unwrap();
        assert!(matches!(
            bank.upsert_cluster_membership(&ClusterId::from_u128(9), &[], MembershipMode::Merge),
            Err(StoreError::UnknownCluster(_))
        ));
        bank.create_cluster(cluster(3)).unwrap();
        assert!(matches!(
            bank.create_cluster(cluster(3)),
            Err(StoreError::DuplicateCluster(_))
        ));
        assert!(matches!(bank.persist_all(), Err(StoreError::NoStorageRoot)));
    }

    #[test]
    fn persist_is_idempotent_and_reload_restores_records() {
        let dir = tempfile::tempdir().unwrap();
        let (bank, _) = NeuronBank::open(dir.path(), cfg()).unwrap();
        for n in 0..20u128 {
            let c = cluster(n * 7919 + 1);
            let id = c.id;
            bank.create_cluster(c).unwrap();
            bank.upsert_cluster_membership(&id, &neurons(&["shared", format!("n{n}").as_str()]), MembershipMode::Merge)
                .unwrap();
        }
        bank.update_neuron(&NeuronId::for_feature("shared"), |r| r.strength = 0.5)
            .unwrap();

        let first = bank.persist_all().unwrap();
        assert!(!first.written.is_empty());
        assert!(first.bytes_written > 0);
        assert!(first.failed.is_empty());

        let second = bank.persist_all().unwrap();
        assert!(second.written.is_empty());
        assert_eq!(second.bytes_written, 0);
        assert_eq!(second.skipped, 8);

        let (reloaded, report) = NeuronBank::open(dir.path(), cfg()).unwrap();
        assert!(report.corrupt.is_empty());
        assert_eq!(report.clusters, 20);
        assert_eq!(report.neurons, 21);
        assert_eq!(reloaded.cluster_ids(), bank.cluster_ids());
        assert_eq!(
            reloaded.neuron(&NeuronId::for_feature("shared")).unwrap().strength,
            0.5
        );
        // Freshly loaded partitions are clean and byte-identical.
        assert!(reloaded.persist_all().unwrap().written.is_empty());
    }

    #[test]
    fn byte_identical_content_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let (bank, _) = NeuronBank::open(dir.path(), cfg()).unwrap();
        let id = NeuronId::for_feature("w");
        bank.get_or_create_neuron(id);
        bank.persist_all().unwrap();

        bank.update_neuron(&id, |r| r.strength = 1.0).unwrap();
        bank.update_neuron(&id, |r| r.strength = 0.0).unwrap();
        assert_eq!(bank.stats().dirty_partitions, 1);
        let report = bank.persist_all().unwrap();
        assert!(report.written.is_empty());
        assert_eq!(bank.stats().dirty_partitions, 0);
    }

    #[test]
    fn change_during_write_leaves_partition_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let (bank, _) = NeuronBank::open(dir.path(), cfg()).unwrap();
        let id = NeuronId::for_feature("busy");
        let key = bank.get_or_create_neuron(id).partition;

        let bump: WriteHook = |bank: &NeuronBank, _: PartitionKey| {
            bank.update_neuron(&NeuronId::for_feature("busy"), |r| r.strength += 1.0);
        };
        *bank.before_write.lock() = Some(bump);
        let first = bank.persist_all().unwrap();
        assert_eq!(first.written, vec![key]);
        assert_eq!(bank.partition_metadata()[&key].state, PartitionState::Dirty);
        assert_eq!(bank.stats().dirty_partitions, 1);

        *bank.before_write.lock() = None;
        let second = bank.persist_all().unwrap();
        assert_eq!(second.written, vec![key]);
        assert_eq!(bank.stats().dirty_partitions, 0);

        let (reloaded, _) = NeuronBank::open(dir.path(), cfg()).unwrap();
        assert_eq!(reloaded.neuron(&id).unwrap().strength, 1.0);
    }

    #[test]
    fn failed_partition_write_is_isolated_and_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let (bank, _) = NeuronBank::open(dir.path(), cfg()).unwrap();
        let mut ids = Vec::new();
        for n in 0..40u128 {
            let c = cluster(n * 104_729 + 3);
            ids.push(c.id);
            bank.create_cluster(c).unwrap();
        }
        let victim = ids[0].partition_key(8);
        let path = bank.partition_path(victim).unwrap();
        // A directory where the file should go makes the rename fail.
        fs::create_dir_all(&path).unwrap();

        let report = bank.persist_all().unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, victim);
        assert!(!report.written.is_empty());
        assert_eq!(bank.partition_metadata()[&victim].state, PartitionState::Dirty);

        fs::remove_dir_all(&path).unwrap();
        let retry = bank.persist_all().unwrap();
        assert_eq!(retry.written, vec![victim]);
        assert!(retry.failed.is_empty());
    }

    #[test]
    fn corrupt_partition_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (bank, _) = NeuronBank::open(dir.path(), cfg()).unwrap();
        let mut ids = Vec::new();
        for n in 0..30u128 {
            let c = cluster(n * 6_700_417 + 5);
            ids.push(c.id);
            bank.create_cluster(c).unwrap();
        }
        bank.persist_all().unwrap();

        let victim = ids[0].partition_key(8);
        let path = bank.partition_path(victim).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x5A;
        fs::write(&path, bytes).unwrap();

        let (reloaded, report) = NeuronBank::open(dir.path(), cfg()).unwrap();
        assert_eq!(report.corrupt.len(), 1);
        assert_eq!(report.corrupt[0].0, victim);
        for id in &ids {
            let in_victim = id.partition_key(8) == victim;
            assert_eq!(reloaded.contains_cluster(id), !in_victim);
        }
    }

    #[test]
    fn heal_applies_policy() {
        let bank = NeuronBank::in_memory(cfg()).unwrap();
        let c = cluster(4);
        let id = c.id;
        bank.create_cluster(c).unwrap();
        let members = neurons(&["p", "q"]);
        bank.upsert_cluster_membership(&id, &members, MembershipMode::Merge)
            .unwrap();
        bank.remove_neuron_for_test(&members[0]);

        let report = bank.verify_integrity(0, 7);
        assert_eq!(report.mismatches, 1);
        assert_eq!(report.dangling, vec![(id, members[0])]);

        assert_eq!(bank.heal(IntegrityPolicy::Report).dropped, 0);
        assert_eq!(bank.verify_integrity(0, 7).mismatches, 1);

        let healed = bank.heal(IntegrityPolicy::RecreateMissing);
        assert_eq!(healed.recreated, 1);
        assert_eq!(bank.verify_integrity(0, 7).mismatches, 0);

        bank.remove_neuron_for_test(&members[1]);
        let healed = bank.heal(IntegrityPolicy::DropDangling);
        assert_eq!(healed.dropped, 1);
        assert_eq!(bank.cluster(&id).unwrap().size(), 1);
        assert_eq!(bank.verify_integrity(0, 7).mismatches, 0);
    }

    #[test]
    fn sampling_is_bounded() {
        let bank = NeuronBank::in_memory(cfg()).unwrap();
        let c = cluster(5);
        let id = c.id;
        bank.create_cluster(c).unwrap();
        let many: Vec<NeuronId> = (0..100).map(|i| NeuronId::for_feature(&format!("f{i}"))).collect();
        bank.upsert_cluster_membership(&id, &many, MembershipMode::Merge)
            .unwrap();
        let r = bank.verify_integrity(10, 3);
        assert_eq!(r.total_memberships, 100);
        assert_eq!(r.sampled, 10);
        assert_eq!(r.mismatches, 0);
    }

    #[test]
    fn compaction_removes_strays_and_empty_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let (bank, _) = NeuronBank::open(dir.path(), cfg()).unwrap();
        bank.create_cluster(cluster(6)).unwrap();
        bank.persist_all().unwrap();

        let parts = dir.path().join(PARTITION_DIR);
        fs::write(parts.join("p-0003.ncp.tmp"), b"junk").unwrap();
        fs::write(parts.join("p-00ff.ncp"), b"junk").unwrap();

        let report = bank.compact().unwrap();
        assert_eq!(report.rewritten, 1);
        assert_eq!(report.removed_files, 2);
        assert!(!parts.join("p-00ff.ncp").exists());
        assert_eq!(bank.partition_metadata().len(), 1);
    }

    #[test]
    fn changing_partition_count_rehomes_records() {
        let dir = tempfile::tempdir().unwrap();
        let (bank, _) = NeuronBank::open(dir.path(), cfg()).unwrap();
        for n in 0..10u128 {
            bank.create_cluster(cluster(n * 31 + 1)).unwrap();
        }
        bank.persist_all().unwrap();

        let (wide, report) =
            NeuronBank::open(dir.path(), cfg().with_partition_count(16)).unwrap();
        assert_eq!(wide.stats().clusters, 10);
        assert!(report.rehomed > 0);
        for id in bank.cluster_ids() {
            assert!(wide.contains_cluster(&id));
        }
    }
}
