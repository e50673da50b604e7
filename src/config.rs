// config.rs
// Runtime settings - per-phase defaults overridden from the environment

use crate::error::ConfigError;
use crate::pipeline::cluster::ClusterConfig;
use crate::pipeline::embed::EmbeddingConfig;
use crate::pipeline::index::IndexConfig;
use crate::pipeline::score::ScoringConfig;
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Everything an analysis run needs to know
#[derive(Debug, Clone)]
pub struct Settings {
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub cluster: ClusterConfig,
    pub scoring: ScoringConfig,

    /// Root of per-project artifact directories
    pub data_dir: PathBuf,

    /// Load an existing embedding artifact instead of calling the provider
    pub reuse_embeddings: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            cluster: ClusterConfig::default(),
            scoring: ScoringConfig::default(),
            data_dir: PathBuf::from("./data"),
            reuse_embeddings: false,
        }
    }
}

impl Settings {
    /// Load `.env`, then read overrides from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(endpoint) = lookup("EMBEDDINGS_ENDPOINT") {
            settings.embedding.endpoint = endpoint;
        }
        if let Some(model) = lookup("EMBEDDINGS_MODEL") {
            settings.embedding.model = model;
        }
        if let Some(batch) = parse("EMBED_BATCH", &lookup)? {
            settings.embedding.batch_size = batch;
        }
        if let Some(secs) = parse::<u64, _>("EMBED_TIMEOUT_SECS", &lookup)? {
            settings.embedding.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse::<u64, _>("EMBED_PAUSE_MS", &lookup)? {
            settings.embedding.batch_pause = Duration::from_millis(ms);
        }

        if let Some(k) = parse("KNN_K", &lookup)? {
            settings.index.k = k;
        }
        if let Some(limit) = parse("EXACT_INDEX_LIMIT", &lookup)? {
            settings.index.exact_limit = limit;
        }
        // One threshold drives both neighbor filtering and scoring
        if let Some(threshold) = parse::<f32, _>("SIM_THRESHOLD", &lookup)? {
            settings.index.similarity_threshold = threshold;
            settings.scoring.similarity_threshold = threshold;
        }

        if let Some(dmax) = parse("DMAX", &lookup)? {
            settings.scoring.max_hops = dmax;
        }
        if let Some(hops) = parse("HOPS_THRESHOLD", &lookup)? {
            settings.scoring.hops_threshold = hops;
        }

        if let Some(seed) = parse("CLUSTER_SEED", &lookup)? {
            settings.cluster.seed = seed;
        }
        if let Some(dir) = lookup("DATA_DIR") {
            settings.data_dir = PathBuf::from(dir);
        }
        if let Some(reuse) = parse("REUSE_EMBEDDINGS", &lookup)? {
            settings.reuse_embeddings = reuse;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding.batch_size == 0 {
            return Err(invalid("EMBED_BATCH", 0, "must be at least 1"));
        }
        if self.scoring.max_hops == 0 {
            return Err(invalid("DMAX", 0, "must be at least 1"));
        }
        let threshold = self.scoring.similarity_threshold;
        if !(-1.0..=1.0).contains(&threshold) {
            return Err(invalid("SIM_THRESHOLD", threshold, "must be within [-1, 1]"));
        }
        Ok(())
    }
}

fn parse<T, F>(key: &'static str, lookup: &F) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, &raw, e)),
    }
}

fn invalid(key: &'static str, value: impl Display, reason: impl Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.embedding.batch_size, 250);
        assert_eq!(s.embedding.model, "BAAI/bge-m3");
        assert_eq!(s.embedding.timeout, Duration::from_secs(3600));
        assert_eq!(s.index.k, 20);
        assert_eq!(s.scoring.max_hops, 8);
        assert_eq!(s.scoring.hops_threshold, 3);
        assert_eq!(s.scoring.similarity_threshold, 0.80);
        assert_eq!(s.cluster.seed, 42);
        assert_eq!(s.data_dir, PathBuf::from("./data"));
        assert!(!s.reuse_embeddings);
    }

    #[test]
    fn environment_overrides_defaults() {
        let s = settings(&[
            ("EMBED_BATCH", "32"),
            ("SIM_THRESHOLD", "0.7"),
            ("DMAX", "5"),
            ("EMBED_PAUSE_MS", "0"),
            ("REUSE_EMBEDDINGS", "true"),
            ("DATA_DIR", "/tmp/prox"),
        ])
        .unwrap();

        assert_eq!(s.embedding.batch_size, 32);
        assert_eq!(s.index.similarity_threshold, 0.7);
        assert_eq!(s.scoring.similarity_threshold, 0.7);
        assert_eq!(s.scoring.max_hops, 5);
        assert_eq!(s.embedding.batch_pause, Duration::ZERO);
        assert!(s.reuse_embeddings);
        assert_eq!(s.data_dir, PathBuf::from("/tmp/prox"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            settings(&[("KNN_K", "many")]),
            Err(ConfigError::Invalid { key: "KNN_K", .. })
        ));
        assert!(matches!(
            settings(&[("EMBED_BATCH", "0")]),
            Err(ConfigError::Invalid { key: "EMBED_BATCH", .. })
        ));
        assert!(matches!(
            settings(&[("SIM_THRESHOLD", "1.5")]),
            Err(ConfigError::Invalid { key: "SIM_THRESHOLD", .. })
        ));
    }
}
