//! Crash-safe PID registry.
//!
//! One JSON document per configuration path, stored in the OS temp
//! directory under a name derived from a hash of the absolute config
//! path so multiple supervisors on the same host never collide. Writes
//! go through a sibling `.tmp` file and an atomic rename so a reader
//! never observes a half-written document.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PidFileError;

const CURRENT_VERSION: u32 = 1;
const FALLBACK_NAME: &str = "toolyard-default.json";

/// One entry in the persisted registry, describing a process this
/// supervisor believes (or believed) was running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PidFileEntry {
    pub tool_index: usize,
    pub tool_name: String,
    pub pid: i32,
    pub start_time: i64,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
}

/// The full persisted document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PidFileData {
    pub version: u32,
    pub processes: Vec<PidFileEntry>,
}

impl Default for PidFileData {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            processes: Vec::new(),
        }
    }
}

/// Handle to the registry file for one configuration path.
#[derive(Debug, Clone)]
pub struct PidRegistry {
    path: PathBuf,
}

impl PidRegistry {
    /// Builds the registry handle for a given configuration path.
    ///
    /// `config_path` should be absolute; passing `None` uses a single
    /// shared fallback name for backward compatibility with callers that
    /// have no configuration file at all.
    pub fn new(config_path: Option<&Path>) -> Self {
        Self {
            path: Self::file_path(config_path),
        }
    }

    /// The on-disk path this registry reads and writes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_path(config_path: Option<&Path>) -> PathBuf {
        let Some(config_path) = config_path else {
            return std::env::temp_dir().join(FALLBACK_NAME);
        };
        let absolute = if config_path.is_absolute() {
            config_path.to_path_buf()
        } else {
            std::env::current_dir()
                .unwrap_or_default()
                .join(config_path)
        };
        let digest = Sha256::digest(absolute.to_string_lossy().as_bytes());
        let hash_prefix: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
        std::env::temp_dir().join(format!("toolyard-{hash_prefix}.json"))
    }

    /// Loads the registry, returning `None` on any error — missing file,
    /// malformed JSON, or unexpected shape. Absence of a registry is not
    /// an error condition to callers; it just means "no prior session".
    pub async fn load(&self) -> Option<PidFileData> {
        let bytes = tokio::fs::read(&self.path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Atomically writes the registry: serialize to a sibling `.tmp` file,
    /// then rename over the target so readers never see a partial write.
    pub async fn save(&self, data: &PidFileData) -> Result<(), PidFileError> {
        let serialized = serde_json::to_vec_pretty(data).map_err(|source| PidFileError::Parse {
            path: self.path.display().to_string(),
            source,
        })?;
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &serialized)
            .await
            .map_err(|source| PidFileError::Write {
                path: tmp_path.display().to_string(),
                source,
            })?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|source| PidFileError::Write {
                path: self.path.display().to_string(),
                source,
            })
    }

    /// Deletes the registry file. A missing file is not an error.
    pub async fn delete(&self) -> Result<(), PidFileError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PidFileError::Write {
                path: self.path.display().to_string(),
                source,
            }),
        }
    }

    /// Loads the current document (or a fresh default), drops any
    /// existing entry for `entry.tool_index`, appends `entry`, and saves.
    ///
    /// I/O errors here are swallowed: PID-file persistence is best-effort
    /// and must never block a tool from starting.
    pub async fn update(&self, entry: PidFileEntry) {
        let mut data = self.load().await.unwrap_or_default();
        data.processes.retain(|e| e.tool_index != entry.tool_index);
        data.processes.push(entry);
        let _ = self.save(&data).await;
    }

    /// Removes the entry for `tool_index`, saving the remainder, or
    /// deleting the file entirely if nothing is left. Also best-effort.
    pub async fn remove(&self, tool_index: usize) {
        let Some(mut data) = self.load().await else {
            return;
        };
        data.processes.retain(|e| e.tool_index != tool_index);
        if data.processes.is_empty() {
            let _ = self.delete().await;
        } else {
            let _ = self.save(&data).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_entry(tool_index: usize) -> PidFileEntry {
        PidFileEntry {
            tool_index,
            tool_name: format!("tool-{tool_index}"),
            pid: 1000 + tool_index as i32,
            start_time: 1_700_000_000_000,
            command: "echo".into(),
            args: vec!["hi".into()],
            cwd: None,
        }
    }

    #[test]
    fn stable_path_for_same_config_path() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("toolyard.toml");
        let a = PidRegistry::new(Some(&config));
        let b = PidRegistry::new(Some(&config));
        assert_eq!(a.path(), b.path());
    }

    #[test]
    fn distinct_paths_for_distinct_configs() {
        let dir = TempDir::new().unwrap();
        let a = PidRegistry::new(Some(&dir.path().join("a.toml")));
        let b = PidRegistry::new(Some(&dir.path().join("b.toml")));
        assert_ne!(a.path(), b.path());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let registry = PidRegistry::new(Some(&dir.path().join("cfg.toml")));
        let data = PidFileData {
            version: 1,
            processes: vec![sample_entry(0), sample_entry(1)],
        };
        registry.save(&data).await.unwrap();
        let loaded = registry.load().await.unwrap();
        assert_eq!(loaded, data);
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let registry = PidRegistry::new(Some(&dir.path().join("nope.toml")));
        assert!(registry.load().await.is_none());
    }

    #[tokio::test]
    async fn update_replaces_entry_with_same_index() {
        let dir = TempDir::new().unwrap();
        let registry = PidRegistry::new(Some(&dir.path().join("cfg.toml")));
        registry.update(sample_entry(0)).await;
        let mut replacement = sample_entry(0);
        replacement.pid = 9999;
        registry.update(replacement.clone()).await;
        let loaded = registry.load().await.unwrap();
        assert_eq!(loaded.processes, vec![replacement]);
    }

    #[tokio::test]
    async fn update_then_remove_leaves_no_entry() {
        let dir = TempDir::new().unwrap();
        let registry = PidRegistry::new(Some(&dir.path().join("cfg.toml")));
        registry.update(sample_entry(0)).await;
        registry.remove(0).await;
        let loaded = registry.load().await;
        assert!(loaded.is_none_or_empty());
    }

    trait OptionExt {
        fn is_none_or_empty(&self) -> bool;
    }

    impl OptionExt for Option<PidFileData> {
        fn is_none_or_empty(&self) -> bool {
            match self {
                None => true,
                Some(data) => data.processes.is_empty(),
            }
        }
    }

    #[tokio::test]
    async fn remove_keeps_other_entries() {
        let dir = TempDir::new().unwrap();
        let registry = PidRegistry::new(Some(&dir.path().join("cfg.toml")));
        registry.update(sample_entry(0)).await;
        registry.update(sample_entry(1)).await;
        registry.remove(0).await;
        let loaded = registry.load().await.unwrap();
        assert_eq!(loaded.processes, vec![sample_entry(1)]);
    }

    #[test]
    fn fallback_path_used_when_no_config_given() {
        let registry = PidRegistry::new(None);
        assert_eq!(registry.path(), std::env::temp_dir().join(FALLBACK_NAME));
    }
}
