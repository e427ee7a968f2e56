//! Line-delimited JSON protocol.
//!
//! One request per line, one response per line, tagged by `"type"`.
//! A pattern is given either as `text` (encoded by the daemon) or as a raw
//! `vector` of the encoder's dimension.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use neurocluster::bank::{HealReport, IntegrityReport};
use neurocluster::ids::ClusterId;
use neurocluster::observer::{ResolverAdapter, ResolverSnapshot};
use neurocluster::resolver::{ClusterResolver, PersistResult, Resolution, ResolverStats, TrainingOutcome};
use neurocluster::vector::FeatureVector;

use crate::error::DaemonError;

fn default_max_clusters() -> usize {
    5
}

fn default_top_regions() -> usize {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Encode {
        text: String,
    },
    FindOrCreate {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        vector: Option<Vec<f32>>,
        #[serde(default)]
        label: Option<String>,
    },
    FindMatching {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        vector: Option<Vec<f32>>,
        #[serde(default = "default_max_clusters")]
        max_clusters: usize,
    },
    Train {
        cluster_id: ClusterId,
        features: BTreeMap<String, f32>,
    },
    Persist,
    Stats,
    Snapshot {
        #[serde(default = "default_top_regions")]
        top_regions: usize,
    },
    Verify {
        #[serde(default)]
        heal: bool,
    },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMatch {
    pub cluster_id: ClusterId,
    pub similarity: f32,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Vector {
        values: Vec<f32>,
    },
    Resolved {
        resolution: Resolution,
    },
    Matches {
        matches: Vec<ClusterMatch>,
    },
    Trained {
        outcome: TrainingOutcome,
    },
    Persisted {
        result: PersistResult,
    },
    Stats {
        stats: ResolverStats,
    },
    Snapshot {
        snapshot: ResolverSnapshot,
    },
    Integrity {
        report: IntegrityReport,
        #[serde(default)]
        heal: Option<HealReport>,
    },
    Success {
        message: String,
    },
    Error {
        message: String,
    },
}

impl Response {
    pub fn error(e: impl std::fmt::Display) -> Self {
        Response::Error {
            message: e.to_string(),
        }
    }
}

fn pattern(
    resolver: &ClusterResolver,
    text: Option<&str>,
    vector: Option<&[f32]>,
) -> Result<FeatureVector, DaemonError> {
    match (vector, text) {
        (Some(values), _) => {
            let expected = resolver.encoder().dim();
            if values.len() != expected {
                return Err(DaemonError::Dimension {
                    expected,
                    got: values.len(),
                });
            }
            Ok(FeatureVector::from_raw(values.to_vec()))
        }
        (None, Some(text)) => Ok(resolver.encode(text)),
        (None, None) => Err(DaemonError::MissingPattern),
    }
}

/// Execute one request against the (synchronous) core.
///
/// `Shutdown` is handled by the connection loop; here it only acknowledges.
pub fn dispatch(resolver: &ClusterResolver, request: Request) -> Response {
    match try_dispatch(resolver, request) {
        Ok(response) => response,
        Err(e) => Response::error(e),
    }
}

fn try_dispatch(resolver: &ClusterResolver, request: Request) -> Result<Response, DaemonError> {
    let response = match request {
        Request::Encode { text } => Response::Vector {
            values: resolver.encode(&text).to_vec(),
        },
        Request::FindOrCreate {
            text,
            vector,
            label,
        } => {
            let v = pattern(resolver, text.as_deref(), vector.as_deref())?;
            let label = label.or(text);
            Response::Resolved {
                resolution: resolver.resolve_pattern(&v, label.as_deref())?,
            }
        }
        Request::FindMatching {
            text,
            vector,
            max_clusters,
        } => {
            let v = pattern(resolver, text.as_deref(), vector.as_deref())?;
            let matches = resolver
                .find_clusters_matching_pattern(&v, max_clusters)?
                .into_iter()
                .map(|(cluster_id, similarity)| ClusterMatch {
                    cluster_id,
                    similarity,
                    label: resolver.cluster(&cluster_id).and_then(|c| c.label),
                })
                .collect();
            Response::Matches { matches }
        }
        Request::Train {
            cluster_id,
            features,
        } => Response::Trained {
            outcome: resolver.train_pattern(&cluster_id, features)?,
        },
        Request::Persist => Response::Persisted {
            result: resolver.persist_all()?,
        },
        Request::Stats => Response::Stats {
            stats: resolver.get_stats(),
        },
        Request::Snapshot { top_regions } => Response::Snapshot {
            snapshot: ResolverAdapter::new(resolver)
                .with_top_regions(top_regions)
                .snapshot(),
        },
        Request::Verify { heal } => {
            let heal = heal.then(|| resolver.heal_integrity());
            Response::Integrity {
                report: resolver.verify_integrity(),
                heal,
            }
        }
        Request::Shutdown => Response::Success {
            message: "shutting down".to_string(),
        },
    };
    Ok(response)
}
