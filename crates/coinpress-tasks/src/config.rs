//! Runtime settings for schedulers, storage, and workers.
//!
//! Layers, lowest to highest precedence: built-in defaults, an optional
//! JSON file, then `COINPRESS_*` environment variables. A `.env` file in
//! the working directory is loaded into the environment first.

use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use coinpress_pipeline::ReliefMeshBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::queue::QueueType;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "COINPRESS_";

/// Upper bound on every configured period or lifetime: one year.
pub const MAX_PERIOD_SECS: u64 = 365 * 24 * 60 * 60;

/// Errors raised while loading or validating [`Settings`].
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The config file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`Settings`].
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// An environment override could not be parsed.
    #[error("{key}={value:?}: {reason}")]
    Env {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A value is out of range.
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Radial-grid resolution of the default mesh builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSettings {
    /// Angular subdivisions.
    pub sectors: usize,
    /// Radial subdivisions.
    pub rings: usize,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            sectors: ReliefMeshBuilder::DEFAULT_SECTORS,
            rings: ReliefMeshBuilder::DEFAULT_RINGS,
        }
    }
}

/// Everything a scheduler or worker process needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Backend selected at startup.
    pub queue_type: QueueType,
    /// Concurrent generations (local pool size; advisory for distributed).
    pub max_workers: usize,
    /// Where STL artifacts are written.
    pub artifact_dir: PathBuf,
    /// Artifact lifetime, and retention of failed/cancelled records.
    pub artifact_ttl_secs: u64,
    /// Period of the background sweep.
    pub sweep_interval_secs: u64,
    /// Delete an artifact once it has been fetched.
    pub delete_on_fetch: bool,
    /// Root of the distributed broker and status store.
    pub spool_dir: PathBuf,
    /// RUNNING tasks older than this are failed by the reaper.
    pub task_timeout_secs: u64,
    /// Period of the reaper.
    pub reaper_interval_secs: u64,
    /// How long an idle distributed worker sleeps between polls.
    pub worker_poll_millis: u64,
    /// Longest heightmap axis; larger images are downsampled.
    pub max_heightmap_resolution: u32,
    /// Mesh builder resolution.
    pub mesh: MeshSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let root = std::env::temp_dir().join("coinpress");
        Self {
            queue_type: QueueType::Local,
            max_workers: 4,
            artifact_dir: root.join("artifacts"),
            artifact_ttl_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
            delete_on_fetch: false,
            spool_dir: root.join("spool"),
            task_timeout_secs: 10 * 60,
            reaper_interval_secs: 60,
            worker_poll_millis: 250,
            max_heightmap_resolution: coinpress_pipeline::heightmap::DEFAULT_MAX_RESOLUTION,
            mesh: MeshSettings::default(),
        }
    }
}

impl Settings {
    /// Load defaults, then `file` if given, then the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] if the file is unreadable or malformed, an
    /// environment override does not parse, or the result is invalid.
    pub fn load(file: Option<&Path>) -> Result<Self, SettingsError> {
        let _ = dotenvy::dotenv();
        let mut settings = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        debug!(?settings, "settings loaded");
        Ok(settings)
    }

    /// Read a JSON settings file; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Io`] or [`SettingsError::Parse`].
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let raw = std::fs::read(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `COINPRESS_*` overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Env`] for a value that does not parse.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = var("QUEUE_TYPE") {
            self.queue_type = value.parse().map_err(|reason| SettingsError::Env {
                key,
                value: value.clone(),
                reason,
            })?;
        }
        if let Some(kv) = var("MAX_WORKERS") {
            self.max_workers = parse_env(kv)?;
        }
        if let Some((_, value)) = var("ARTIFACT_DIR") {
            self.artifact_dir = PathBuf::from(value);
        }
        if let Some(kv) = var("ARTIFACT_TTL_SECS") {
            self.artifact_ttl_secs = parse_env(kv)?;
        }
        if let Some(kv) = var("SWEEP_INTERVAL_SECS") {
            self.sweep_interval_secs = parse_env(kv)?;
        }
        if let Some(kv) = var("DELETE_ON_FETCH") {
            self.delete_on_fetch = parse_env(kv)?;
        }
        if let Some((_, value)) = var("SPOOL_DIR") {
            self.spool_dir = PathBuf::from(value);
        }
        if let Some(kv) = var("TASK_TIMEOUT_SECS") {
            self.task_timeout_secs = parse_env(kv)?;
        }
        if let Some(kv) = var("REAPER_INTERVAL_SECS") {
            self.reaper_interval_secs = parse_env(kv)?;
        }
        if let Some(kv) = var("WORKER_POLL_MILLIS") {
            self.worker_poll_millis = parse_env(kv)?;
        }
        if let Some(kv) = var("MAX_HEIGHTMAP_RESOLUTION") {
            self.max_heightmap_resolution = parse_env(kv)?;
        }
        if let Some(kv) = var("MESH_SECTORS") {
            self.mesh.sectors = parse_env(kv)?;
        }
        if let Some(kv) = var("MESH_RINGS") {
            self.mesh.rings = parse_env(kv)?;
        }
        Ok(())
    }

    /// Reject settings no scheduler can run with.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let positive = [
            ("max_workers", self.max_workers as u64),
            ("artifact_ttl_secs", self.artifact_ttl_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("task_timeout_secs", self.task_timeout_secs),
            ("reaper_interval_secs", self.reaper_interval_secs),
            ("worker_poll_millis", self.worker_poll_millis),
            ("max_heightmap_resolution", u64::from(self.max_heightmap_resolution)),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SettingsError::Invalid(format!("{name} must be positive")));
            }
        }
        let bounded = [
            ("artifact_ttl_secs", self.artifact_ttl_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("task_timeout_secs", self.task_timeout_secs),
            ("reaper_interval_secs", self.reaper_interval_secs),
            ("worker_poll_millis", self.worker_poll_millis / 1000),
        ];
        for (name, secs) in bounded {
            if secs > MAX_PERIOD_SECS {
                return Err(SettingsError::Invalid(format!(
                    "{name} exceeds one year ({MAX_PERIOD_SECS}s)"
                )));
            }
        }
        if self.mesh.sectors < 3 {
            return Err(SettingsError::Invalid(format!(
                "mesh.sectors must be at least 3, got {}",
                self.mesh.sectors
            )));
        }
        if self.mesh.rings == 0 {
            return Err(SettingsError::Invalid("mesh.rings must be positive".to_string()));
        }
        Ok(())
    }

    /// Artifact lifetime as a calendar duration, capped at one year.
    #[must_use]
    pub fn artifact_ttl(&self) -> chrono::Duration {
        capped_delta(self.artifact_ttl_secs)
    }

    /// Reaper threshold as a calendar duration, capped at one year.
    #[must_use]
    pub fn task_timeout(&self) -> chrono::Duration {
        capped_delta(self.task_timeout_secs)
    }

    /// Sweep period.
    #[must_use]
    pub const fn sweep_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.sweep_interval_secs)
    }

    /// Reaper period.
    #[must_use]
    pub const fn reaper_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.reaper_interval_secs)
    }

    /// Idle poll period of distributed workers.
    #[must_use]
    pub const fn worker_poll(&self) -> StdDuration {
        StdDuration::from_millis(self.worker_poll_millis)
    }

    /// The default mesh builder at the configured resolution.
    #[must_use]
    pub const fn mesh_builder(&self) -> ReliefMeshBuilder {
        ReliefMeshBuilder::new(self.mesh.sectors, self.mesh.rings)
    }
}

/// `secs` as a `TimeDelta`, saturating at [`MAX_PERIOD_SECS`] so that
/// adding it to the current time cannot overflow.
fn capped_delta(secs: u64) -> chrono::Duration {
    let max = chrono::Duration::days(365);
    i64::try_from(secs.min(MAX_PERIOD_SECS))
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .map_or(max, |delta| delta.min(max))
}

fn parse_env<T>((key, value): (String, String)) -> Result<T, SettingsError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| SettingsError::Env {
        reason: e.to_string(),
        key,
        value,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.queue_type, QueueType::Local);
        assert_eq!(settings.artifact_ttl(), chrono::Duration::minutes(30));
        assert_eq!(settings.sweep_interval(), StdDuration::from_secs(300));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut settings = Settings::default();
        settings
            .apply_env(env(&[
                ("COINPRESS_QUEUE_TYPE", "distributed"),
                ("COINPRESS_MAX_WORKERS", " 8 "),
                ("COINPRESS_DELETE_ON_FETCH", "true"),
                ("COINPRESS_MESH_RINGS", "12"),
                ("UNRELATED", "x"),
            ]))
            .unwrap();
        assert_eq!(settings.queue_type, QueueType::Distributed);
        assert_eq!(settings.max_workers, 8);
        assert!(settings.delete_on_fetch);
        assert_eq!(settings.mesh.rings, 12);
        assert_eq!(settings.mesh.sectors, 256);
    }

    #[test]
    fn bad_env_value_names_the_variable() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(env(&[("COINPRESS_ARTIFACT_TTL_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().starts_with("COINPRESS_ARTIFACT_TTL_SECS"), "{err}");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("coinpress.json");
        std::fs::write(&path, br#"{ "max_workers": 2, "mesh": { "sectors": 64 } }"#).unwrap();
        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.max_workers, 2);
        assert_eq!(settings.mesh.sectors, 64);
        assert_eq!(settings.mesh.rings, 96);
        assert_eq!(settings.artifact_ttl_secs, 1800);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, b"{ max_workers: ").unwrap();
        assert!(matches!(
            Settings::from_file(&path),
            Err(SettingsError::Parse { .. })
        ));
    }

    #[test]
    fn zero_workers_and_zero_ttl_are_rejected() {
        let settings = Settings {
            max_workers: 0,
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid(_))));
        let settings = Settings {
            artifact_ttl_secs: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn periods_longer_than_a_year_are_rejected() {
        let settings = Settings {
            artifact_ttl_secs: u64::MAX,
            ..Settings::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("artifact_ttl_secs"), "{err}");
        let settings = Settings {
            task_timeout_secs: MAX_PERIOD_SECS + 1,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
        let settings = Settings {
            artifact_ttl_secs: MAX_PERIOD_SECS,
            ..Settings::default()
        };
        settings.validate().unwrap();
    }

    #[test]
    fn oversized_durations_saturate_instead_of_overflowing() {
        let settings = Settings {
            artifact_ttl_secs: u64::MAX,
            task_timeout_secs: u64::MAX / 2,
            ..Settings::default()
        };
        assert_eq!(settings.artifact_ttl(), chrono::Duration::days(365));
        assert_eq!(settings.task_timeout(), chrono::Duration::days(365));
        let now = chrono::Utc::now();
        assert!(now.checked_add_signed(settings.artifact_ttl()).is_some());
    }
}
