use std::path::Path;

use serde::{Deserialize, Serialize};

use neurocluster::resolver::ResolverConfig;

use crate::error::DaemonError;

pub const ADDR_ENV: &str = "NEUROCLUSTERD_ADDR";
pub const WORKERS_ENV: &str = "NEUROCLUSTERD_WORKERS";
pub const AUTOSAVE_ENV: &str = "NEUROCLUSTERD_AUTOSAVE_SECS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub addr: String,
    /// Requests processed concurrently.
    pub workers: usize,
    /// Periodic checkpoint interval; 0 disables it.
    pub autosave_secs: u64,
    pub resolver: ResolverConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9877".to_string(),
            workers: 4,
            autosave_secs: 0,
            resolver: ResolverConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// `config.json` if present, else defaults.
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| DaemonError::Config {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn apply_env(&mut self) -> Result<(), DaemonError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), DaemonError> {
        if let Some(addr) = lookup(ADDR_ENV).filter(|a| !a.trim().is_empty()) {
            self.addr = addr.trim().to_string();
        }
        if let Some(raw) = lookup(WORKERS_ENV) {
            self.workers = raw.trim().parse().map_err(|_| DaemonError::Env {
                var: WORKERS_ENV,
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = lookup(AUTOSAVE_ENV) {
            self.autosave_secs = raw.trim().parse().map_err(|_| DaemonError::Env {
                var: AUTOSAVE_ENV,
                value: raw.clone(),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.workers == 0 {
            return Err("workers must be > 0");
        }
        self.resolver.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = DaemonConfig::default();
        cfg.apply_overrides(|var| match var {
            ADDR_ENV => Some("0.0.0.0:1234".to_string()),
            WORKERS_ENV => Some(" 8 ".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.addr, "0.0.0.0:1234");
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.autosave_secs, 0);

        let err = cfg.apply_overrides(|var| (var == AUTOSAVE_ENV).then(|| "soon".to_string()));
        assert!(matches!(err, Err(DaemonError::Env { var: AUTOSAVE_ENV, .. })));
    }

    #[test]
    fn partial_config_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "workers": 2, "resolver": { "match_threshold": 0.8, "quantizer": { "kind": "lsh", "num_bands": 2 } } }"#,
        )
        .unwrap();
        let cfg = DaemonConfig::load(&path).unwrap();
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.resolver.match_threshold, 0.8);
        assert_eq!(cfg.resolver.probe_regions, 8);
        assert!(cfg.validate().is_ok());

        let missing = DaemonConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(missing, DaemonConfig::default());
    }
}
