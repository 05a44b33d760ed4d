//! Compressed append-only cut journal.
//!
//! Each cut is one gzip-compressed JSON file named `<id>.json.gz` in a flat
//! directory, with ids of the form `cut_<unix-seconds>_<node>`. One file per
//! record keeps crash safety trivial (no shared journal to corrupt), makes
//! retention a plain unlink, and gives natural id-to-filename addressing.
//! Scans are O(files); rate limits bound growth.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration as StdDuration, SystemTime};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::policy::Strategy;

const RECORD_SUFFIX: &str = ".json.gz";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("journal I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode record: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Snapshot of the strategy that produced a cut, embedded in the record so
/// the journal stays meaningful across policy edits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyInfo {
    pub threshold: f64,
    pub action: String,
    pub critical: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snapshot_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
}

impl From<&Strategy> for StrategyInfo {
    fn from(s: &Strategy) -> Self {
        Self {
            threshold: s.threshold,
            action: s.action.clone(),
            critical: s.critical,
            snapshot_name: s.snapshot_name.clone(),
            command: s.command.clone(),
        }
    }
}

/// The persistent cut record: the shared data contract between the engine,
/// the journal, the trend analyser, and the correlator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CutRecord {
    pub id: String,
    pub node: String,
    pub entropy: f64,
    pub action: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub latency_ms: i64,
    pub timestamp: DateTime<Utc>,
    pub policy_version: String,
    pub strategy: StrategyInfo,
}

/// Per-node breakdown inside [`HistoryStats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStats {
    pub node: String,
    pub total_cuts: usize,
    pub success: usize,
    pub failed: usize,
}

/// Single-pass aggregate over the whole journal.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistoryStats {
    pub total_cuts: usize,
    pub success_cuts: usize,
    pub failed_cuts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_cut: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cut: Option<DateTime<Utc>>,
    pub total_duration_seconds: i64,
    pub by_node: HashMap<String, usize>,
    pub by_action: HashMap<String, usize>,
    pub nodes: HashMap<String, NodeStats>,
}

/// File-backed journal manager. The lock orders writers and guards list
/// snapshots against a concurrent purge; external readers of the directory
/// are unaffected.
pub struct HistoryManager {
    dir: PathBuf,
    lock: RwLock<()>,
}

impl HistoryManager {
    /// Open (and create if needed) the journal directory.
    pub fn new(dir: &Path) -> Result<Self, HistoryError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            lock: RwLock::new(()),
        })
    }

    /// Persist a record, assigning an id when absent. The file is written to
    /// a temp name and renamed into place so a crash mid-write cannot leave a
    /// truncated record behind.
    pub fn save_cut(&self, record: &mut CutRecord) -> Result<(), HistoryError> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());

        if record.id.is_empty() {
            // Two cuts for one node inside the same second would collide;
            // bump the seconds component until the id is free.
            let mut ts = Utc::now().timestamp();
            loop {
                let id = format!("cut_{ts}_{}", record.node);
                if !self.dir.join(format!("{id}{RECORD_SUFFIX}")).exists() {
                    record.id = id;
                    break;
                }
                ts += 1;
            }
        }

        let path = self.dir.join(format!("{}{RECORD_SUFFIX}", record.id));
        let tmp = self.dir.join(format!(".{}.tmp", record.id));

        let file = File::create(&tmp)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        serde_json::to_writer_pretty(&mut encoder, record)?;
        encoder.finish()?.flush()?;
        fs::rename(&tmp, &path)?;

        Ok(())
    }

    /// Load a record by id; the `.json.gz` suffix is tolerated.
    pub fn load_cut(&self, id: &str) -> Result<CutRecord, HistoryError> {
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        let id = id.strip_suffix(RECORD_SUFFIX).unwrap_or(id);
        read_record(&self.dir.join(format!("{id}{RECORD_SUFFIX}")))
    }

    /// All records, newest first. A positive `limit` truncates; 0 returns
    /// everything. Unreadable or truncated files are skipped.
    pub fn list_cuts(&self, limit: usize) -> Result<Vec<CutRecord>, HistoryError> {
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());

        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(RECORD_SUFFIX) {
                continue;
            }
            match read_record(&path) {
                Ok(record) => records.push(record),
                Err(_) => continue,
            }
        }

        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if limit > 0 && records.len() > limit {
            records.truncate(limit);
        }

        Ok(records)
    }

    /// Records for one node, newest first.
    pub fn list_cuts_by_node(&self, node: &str, limit: usize) -> Result<Vec<CutRecord>, HistoryError> {
        let mut records: Vec<CutRecord> = self
            .list_cuts(0)?
            .into_iter()
            .filter(|r| r.node == node)
            .collect();
        if limit > 0 && records.len() > limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Most recent record for a node, if any.
    pub fn latest_cut_by_node(&self, node: &str) -> Result<Option<CutRecord>, HistoryError> {
        Ok(self.list_cuts_by_node(node, 1)?.into_iter().next())
    }

    /// Remove record files whose mtime is older than `retention_days`.
    /// Returns the number of files removed; individual removal failures are
    /// logged at warn level and do not stop the pass.
    pub fn purge_old_cuts(&self, retention_days: u64) -> Result<usize, HistoryError> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());

        let cutoff = SystemTime::now() - StdDuration::from_secs(retention_days * 24 * 60 * 60);
        let mut purged = 0;

        for entry in fs::read_dir(&self.dir)? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(RECORD_SUFFIX) {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            if modified < cutoff {
                match fs::remove_file(&path) {
                    Ok(()) => purged += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "purge failed"),
                }
            }
        }

        Ok(purged)
    }

    /// Aggregate the whole journal in one pass.
    pub fn stats(&self) -> Result<HistoryStats, HistoryError> {
        let cuts = self.list_cuts(0)?;

        let mut stats = HistoryStats {
            total_cuts: cuts.len(),
            ..Default::default()
        };

        for cut in &cuts {
            if cut.success {
                stats.success_cuts += 1;
            } else {
                stats.failed_cuts += 1;
            }

            *stats.by_node.entry(cut.node.clone()).or_default() += 1;
            *stats.by_action.entry(cut.action.clone()).or_default() += 1;

            let node = stats
                .nodes
                .entry(cut.node.clone())
                .or_insert_with(|| NodeStats {
                    node: cut.node.clone(),
                    ..Default::default()
                });
            node.total_cuts += 1;
            if cut.success {
                node.success += 1;
            } else {
                node.failed += 1;
            }

            if stats.first_cut.is_none_or(|t| cut.timestamp < t) {
                stats.first_cut = Some(cut.timestamp);
            }
            if stats.last_cut.is_none_or(|t| cut.timestamp > t) {
                stats.last_cut = Some(cut.timestamp);
            }
        }

        if let (Some(first), Some(last)) = (stats.first_cut, stats.last_cut) {
            stats.total_duration_seconds = (last - first).num_seconds();
        }

        Ok(stats)
    }
}

fn read_record(path: &Path) -> Result<CutRecord, HistoryError> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(file);
    Ok(serde_json::from_reader(decoder)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn record(node: &str, action: &str, success: bool, ts: DateTime<Utc>) -> CutRecord {
        CutRecord {
            id: String::new(),
            node: node.to_string(),
            entropy: 0.9,
            action: action.to_string(),
            success,
            error: if success { String::new() } else { "boom".to_string() },
            latency_ms: 120,
            timestamp: ts,
            policy_version: "1.0.0".to_string(),
            strategy: StrategyInfo {
                threshold: 0.85,
                action: action.to_string(),
                critical: false,
                snapshot_name: String::new(),
                command: String::new(),
            },
        }
    }

    #[test]
    fn save_assigns_id_and_roundtrips() {
        let dir = TempDir::new().unwrap();
        let manager = HistoryManager::new(dir.path()).unwrap();

        let mut r = record("athena", "docker_stop_all", true, Utc::now());
        manager.save_cut(&mut r).unwrap();
        assert!(r.id.starts_with("cut_"));
        assert!(r.id.ends_with("_athena"));

        let loaded = manager.load_cut(&r.id).unwrap();
        assert_eq!(loaded.node, "athena");
        assert_eq!(loaded.action, "docker_stop_all");
        assert!(loaded.success);
        assert_eq!(loaded.strategy.threshold, 0.85);
    }

    #[test]
    fn same_second_saves_get_distinct_ids() {
        let dir = TempDir::new().unwrap();
        let manager = HistoryManager::new(dir.path()).unwrap();

        let mut first = record("athena", "docker_stop_all", true, Utc::now());
        let mut second = record("athena", "docker_pause_all", false, Utc::now());
        manager.save_cut(&mut first).unwrap();
        manager.save_cut(&mut second).unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(manager.list_cuts(0).unwrap().len(), 2);
    }

    #[test]
    fn load_tolerates_suffixed_id() {
        let dir = TempDir::new().unwrap();
        let manager = HistoryManager::new(dir.path()).unwrap();

        let mut r = record("athena", "docker_stop_all", true, Utc::now());
        manager.save_cut(&mut r).unwrap();

        let loaded = manager.load_cut(&format!("{}.json.gz", r.id)).unwrap();
        assert_eq!(loaded.id, r.id);
    }

    #[test]
    fn saved_file_is_gzip() {
        let dir = TempDir::new().unwrap();
        let manager = HistoryManager::new(dir.path()).unwrap();

        let mut r = record("athena", "docker_stop_all", true, Utc::now());
        manager.save_cut(&mut r).unwrap();

        let raw = fs::read(dir.path().join(format!("{}.json.gz", r.id))).unwrap();
        assert_eq!(&raw[..2], &[0x1f, 0x8b], "gzip magic expected");
    }

    #[test]
    fn list_sorts_newest_first_and_truncates() {
        let dir = TempDir::new().unwrap();
        let manager = HistoryManager::new(dir.path()).unwrap();

        let base = Utc::now();
        for i in 0..5 {
            let mut r = record("athena", "docker_stop_all", true, base - Duration::minutes(i));
            r.id = format!("cut_{i}_athena");
            manager.save_cut(&mut r).unwrap();
        }

        let all = manager.list_cuts(0).unwrap();
        assert_eq!(all.len(), 5);
        for pair in all.windows(2) {
            assert!(pair[0].timestamp > pair[1].timestamp);
        }

        let limited = manager.list_cuts(2).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, "cut_0_athena");
    }

    #[test]
    fn list_by_node_filters() {
        let dir = TempDir::new().unwrap();
        let manager = HistoryManager::new(dir.path()).unwrap();

        let now = Utc::now();
        let mut a = record("athena", "docker_stop_all", true, now);
        a.id = "cut_1_athena".to_string();
        manager.save_cut(&mut a).unwrap();
        let mut b = record("hermes", "ssh_isolate_network", false, now);
        b.id = "cut_1_hermes".to_string();
        manager.save_cut(&mut b).unwrap();

        let athena = manager.list_cuts_by_node("athena", 0).unwrap();
        assert_eq!(athena.len(), 1);
        assert_eq!(athena[0].node, "athena");

        let latest = manager.latest_cut_by_node("hermes").unwrap().unwrap();
        assert_eq!(latest.id, "cut_1_hermes");
        assert!(manager.latest_cut_by_node("unknown").unwrap().is_none());
    }

    #[test]
    fn list_skips_truncated_records() {
        let dir = TempDir::new().unwrap();
        let manager = HistoryManager::new(dir.path()).unwrap();

        let mut good = record("athena", "docker_stop_all", true, Utc::now());
        manager.save_cut(&mut good).unwrap();

        // A crash mid-write in some other process lifetime.
        fs::write(dir.path().join("cut_0_broken.json.gz"), b"\x1f\x8b\x08trunc").unwrap();
        fs::write(dir.path().join("notes.txt"), b"not a record").unwrap();

        let all = manager.list_cuts(0).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, good.id);
    }

    #[test]
    fn purge_removes_old_files_and_counts() {
        let dir = TempDir::new().unwrap();
        let manager = HistoryManager::new(dir.path()).unwrap();

        let mut old = record("athena", "docker_stop_all", true, Utc::now());
        old.id = "cut_old_athena".to_string();
        manager.save_cut(&mut old).unwrap();
        let mut fresh = record("athena", "docker_stop_all", true, Utc::now());
        fresh.id = "cut_new_athena".to_string();
        manager.save_cut(&mut fresh).unwrap();

        // Age the old file's mtime past the retention horizon.
        let old_path = dir.path().join("cut_old_athena.json.gz");
        let stale = SystemTime::now() - StdDuration::from_secs(10 * 24 * 60 * 60);
        let file = File::options().append(true).open(&old_path).unwrap();
        file.set_modified(stale).unwrap();
        drop(file);

        let purged = manager.purge_old_cuts(7).unwrap();
        assert_eq!(purged, 1);
        assert!(!old_path.exists());
        assert!(dir.path().join("cut_new_athena.json.gz").exists());
    }

    #[test]
    fn stats_aggregates_all_dimensions() {
        let dir = TempDir::new().unwrap();
        let manager = HistoryManager::new(dir.path()).unwrap();

        let base = Utc::now();
        let mut r1 = record("athena", "docker_stop_all", true, base - Duration::minutes(10));
        r1.id = "cut_1_athena".to_string();
        manager.save_cut(&mut r1).unwrap();
        let mut r2 = record("athena", "docker_pause_all", false, base - Duration::minutes(5));
        r2.id = "cut_2_athena".to_string();
        manager.save_cut(&mut r2).unwrap();
        let mut r3 = record("hermes", "ssh_isolate_network", true, base);
        r3.id = "cut_1_hermes".to_string();
        manager.save_cut(&mut r3).unwrap();

        let stats = manager.stats().unwrap();
        assert_eq!(stats.total_cuts, 3);
        assert_eq!(stats.success_cuts, 2);
        assert_eq!(stats.failed_cuts, 1);
        assert_eq!(stats.by_node["athena"], 2);
        assert_eq!(stats.by_node["hermes"], 1);
        assert_eq!(stats.by_action["docker_stop_all"], 1);
        assert_eq!(stats.nodes["athena"].failed, 1);
        assert_eq!(stats.total_duration_seconds, 600);
        assert_eq!(stats.first_cut.unwrap(), r1.timestamp);
        assert_eq!(stats.last_cut.unwrap(), r3.timestamp);
    }

    #[test]
    fn stats_on_empty_journal() {
        let dir = TempDir::new().unwrap();
        let manager = HistoryManager::new(dir.path()).unwrap();

        let stats = manager.stats().unwrap();
        assert_eq!(stats.total_cuts, 0);
        assert!(stats.first_cut.is_none());
        assert_eq!(stats.total_duration_seconds, 0);
    }
}
