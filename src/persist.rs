//! Writes harvested configs to a directory.
//!
//! Each device gets `<name>.conf`. Files are written to a temporary file in
//! the same directory and renamed into place, so readers never see a
//! partial config. Files whose contents did not change are left alone.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::HarvestStats;

pub const SUMMARY_FILE: &str = "harvest-summary.json";

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("could not create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not serialize summary: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Summary<'a> {
    /// Unix timestamp (seconds)
    finished_at: u64,
    #[serde(flatten)]
    stats: &'a HarvestStats,
    missing: &'a [String],
}

/// Writes one `<name>.conf` per entry and returns the names whose file was
/// created or changed. Names that are not usable as file names are skipped.
pub fn write_configs(
    dir: &Path,
    configs: &BTreeMap<String, Vec<u8>>,
) -> Result<Vec<String>, PersistError> {
    create_dir(dir)?;
    let mut changed = Vec::new();
    for (name, bytes) in configs {
        if !is_file_name(name) {
            warn!(device = %name, "Device name cannot be used as a file name, skipping");
            continue;
        }
        let path = dir.join(format!("{name}.conf"));
        if fs::read(&path).is_ok_and(|current| current == *bytes) {
            debug!(device = %name, "Config unchanged");
            continue;
        }
        write_atomic(&path, bytes)?;
        debug!(device = %name, size = bytes.len(), "Config written");
        changed.push(name.clone());
    }
    Ok(changed)
}

/// Writes the cycle summary as JSON and returns its path.
pub fn write_summary(
    dir: &Path,
    stats: &HarvestStats,
    missing: &[String],
) -> Result<PathBuf, PersistError> {
    create_dir(dir)?;
    let summary = Summary {
        finished_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        stats,
        missing,
    };
    let path = dir.join(SUMMARY_FILE);
    write_atomic(&path, &serde_json::to_vec_pretty(&summary)?)?;
    Ok(path)
}

fn create_dir(dir: &Path) -> Result<(), PersistError> {
    fs::create_dir_all(dir).map_err(|source| PersistError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })
}

/// Hostnames and IP literals are fine; anything that could leave the
/// output directory is not.
pub fn is_file_name(name: &str) -> bool {
    !(name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let write_err = |source| PersistError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.as_file_mut().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs(entries: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
        entries
            .iter()
            .map(|(name, body)| (name.to_string(), body.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn writes_and_skips_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let first = configs(&[("core-sw1", "hostname core-sw1\n"), ("10.0.0.2", "ver 8\n")]);

        let changed = write_configs(dir.path(), &first).unwrap();
        assert_eq!(changed, vec!["10.0.0.2", "core-sw1"]);
        assert_eq!(
            fs::read_to_string(dir.path().join("core-sw1.conf")).unwrap(),
            "hostname core-sw1\n"
        );

        let second = configs(&[("core-sw1", "hostname core-sw1\n"), ("10.0.0.2", "ver 9\n")]);
        let changed = write_configs(dir.path(), &second).unwrap();
        assert_eq!(changed, vec!["10.0.0.2"]);
        assert_eq!(
            fs::read_to_string(dir.path().join("10.0.0.2.conf")).unwrap(),
            "ver 9\n"
        );

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        write_configs(&nested, &configs(&[("sw", "x")])).unwrap();
        assert!(nested.join("sw.conf").exists());
    }

    #[test]
    fn path_like_names() {
        for name in ["../escape", "a/b", "a\\b", "..", ".", ""] {
            assert!(!is_file_name(name), "{name}");
        }
        for name in ["core-sw1", "10.0.0.2", "fe80::1", "sw.example.net"] {
            assert!(is_file_name(name), "{name}");
        }
    }

    #[test]
    fn bad_name_does_not_stop_other_devices() {
        let dir = tempfile::tempdir().unwrap();
        let entries = configs(&[("a", "x"), ("b/c", "y"), ("d", "z")]);

        let changed = write_configs(dir.path(), &entries).unwrap();
        assert_eq!(changed, vec!["a", "d"]);
        assert!(dir.path().join("a.conf").exists());
        assert!(dir.path().join("d.conf").exists());
        assert!(!dir.path().join("b").exists());
    }

    #[test]
    fn summary_is_json() {
        let dir = tempfile::tempdir().unwrap();
        let stats = HarvestStats {
            devices: 3,
            succeeded: 2,
            failed: 1,
            files_received: 2,
            duration_ms: 1234,
        };
        let path = write_summary(dir.path(), &stats, &["c".to_string()]).unwrap();
        assert_eq!(path, dir.path().join(SUMMARY_FILE));

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["devices"], 3);
        assert_eq!(value["failed"], 1);
        assert_eq!(value["missing"], serde_json::json!(["c"]));
        assert!(value["finished_at"].as_u64().unwrap() > 0);
    }
}
