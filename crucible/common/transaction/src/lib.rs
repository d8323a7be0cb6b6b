// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Transactional state management around the package database: snapshots,
//! the append-only rollback log, rollback, orphan collection,
//! reverse-dependency repair and the upgrade path.

mod events;
mod revdep;
mod rollback;
mod upgrade;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::Config;
use pkgdb::PackageDb;
use recipe::Repository;
use serde::{Deserialize, Serialize};
use tracing::info;

pub use events::RollbackEvent;
pub use revdep::{BrokenBinary, OrphanReport, RevdepFixReport, RevdepReport};
pub use rollback::{RollbackReport, SingleRollbackReport};
pub use upgrade::{UpgradeOptions, UpgradeReport};

#[derive(thiserror::Error, Debug)]
pub enum TransactionError {
    #[error("no rollback point available: {0}")]
    RollbackUnavailable(String),
    #[error("commit failed for {failed:?}")]
    CommitFailed { failed: Vec<(String, String)> },
}

/// Header written into every snapshot directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub id: String,
    pub timestamp: String,
    pub operation: String,
    pub packages: Vec<String>,
    #[serde(default)]
    pub extras: serde_json::Value,
}

pub struct TransactionManager<'a> {
    config: &'a Config,
    db: PackageDb,
    repo: Repository,
}

impl<'a> TransactionManager<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            db: PackageDb::new(&config.pkg_db),
            repo: Repository::new(&config.repo_dir),
        }
    }

    pub fn db(&self) -> &PackageDb {
        &self.db
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub(crate) fn config(&self) -> &Config {
        self.config
    }

    pub(crate) fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.config.snapshots_dir().join(id)
    }

    /// Allocates a fresh timestamp-based snapshot id. Sub-second snapshots
    /// get a disambiguating suffix so ids stay unique and ordered.
    fn allocate_snapshot_id(&self) -> Result<String> {
        let base = now_ts();
        let mut id = base.clone();
        let mut n = 0;
        while self.snapshot_dir(&id).exists() {
            n += 1;
            id = format!("{base}.{n}");
        }
        std::fs::create_dir_all(self.snapshot_dir(&id))?;
        Ok(id)
    }

    /// Copies each package's installed record and manifest into a new
    /// snapshot directory and logs the operation. Packages that are not
    /// installed are simply absent from the snapshot.
    pub fn snapshot_before(
        &self,
        packages: &[String],
        operation: &str,
        extras: serde_json::Value,
    ) -> Result<String> {
        let id = self.allocate_snapshot_id()?;
        let dir = self.snapshot_dir(&id);

        for package in packages {
            for source in [
                self.db.record_path(package),
                self.db.manifest_path(package),
            ] {
                if source.is_file() {
                    let dest = dir.join(source.file_name().unwrap());
                    std::fs::copy(&source, &dest)
                        .with_context(|| format!("snapshot {}", source.display()))?;
                }
            }
        }

        let header = SnapshotHeader {
            id: id.clone(),
            timestamp: id.clone(),
            operation: operation.to_string(),
            packages: packages.to_vec(),
            extras,
        };
        std::fs::write(
            dir.join("snapshot.json"),
            serde_json::to_string_pretty(&header)?,
        )?;

        self.append_event(&RollbackEvent::Snapshot {
            ts: id.clone(),
            op: operation.to_string(),
            packages: packages.to_vec(),
        })?;
        info!("Snapshot {id} created for {}", packages.join(", "));
        Ok(id)
    }

    pub fn list_snapshots(&self) -> Result<Vec<String>> {
        let dir = self.config.snapshots_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn show_snapshot(&self, id: &str) -> Result<Option<SnapshotHeader>> {
        let path = self.snapshot_dir(id).join("snapshot.json");
        if !path.is_file() {
            return Ok(None);
        }
        let header = serde_json::from_str(&std::fs::read_to_string(&path)?)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(header))
    }

    /// Deletes all but the newest `retention` snapshots. Returns the ids
    /// removed.
    pub fn prune_snapshots(&self, retention: usize) -> Result<Vec<String>> {
        let snapshots = self.list_snapshots()?;
        if snapshots.len() <= retention {
            return Ok(Vec::new());
        }
        let cutoff = snapshots.len() - retention;
        let mut removed = Vec::new();
        for id in &snapshots[..cutoff] {
            std::fs::remove_dir_all(self.snapshot_dir(id))
                .with_context(|| format!("prune snapshot {id}"))?;
            removed.push(id.clone());
        }
        info!("Pruned {} snapshots", removed.len());
        Ok(removed)
    }

    /// The last `n` rollback-log events (all of them when `n` is None),
    /// oldest first.
    pub fn history(&self, n: Option<usize>) -> Result<Vec<RollbackEvent>> {
        let events = self.read_log()?;
        match n {
            Some(n) if events.len() > n => Ok(events[events.len() - n..].to_vec()),
            _ => Ok(events),
        }
    }

    pub(crate) fn append_event(&self, event: &RollbackEvent) -> Result<()> {
        events::append(&self.config.rollback_log(), event)
    }

    pub(crate) fn read_log(&self) -> Result<Vec<RollbackEvent>> {
        events::read(&self.config.rollback_log())
    }

    /// Restores a package's record and manifest bytes from a snapshot into
    /// the package database. Returns false if the snapshot holds neither.
    pub(crate) fn restore_package_meta(&self, snapshot_id: &str, package: &str) -> Result<bool> {
        let dir = self.snapshot_dir(snapshot_id);
        let mut restored = false;
        for (source, dest) in [
            (
                dir.join(format!("{package}.installed.meta")),
                self.db.record_path(package),
            ),
            (
                dir.join(format!("{package}.manifest.txt")),
                self.db.manifest_path(package),
            ),
        ] {
            if source.is_file() {
                std::fs::copy(&source, &dest)?;
                restored = true;
            }
        }
        Ok(restored)
    }

    /// Reads the installed record copy stored inside a snapshot.
    pub(crate) fn snapshot_record(
        &self,
        snapshot_id: &str,
        package: &str,
    ) -> Result<Option<pkgdb::InstalledRecord>> {
        let path = self
            .snapshot_dir(snapshot_id)
            .join(format!("{package}.installed.meta"));
        if !path.is_file() {
            return Ok(None);
        }
        let record = serde_json::from_str(&std::fs::read_to_string(&path)?)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(record))
    }
}

pub(crate) fn now_ts() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
}

pub(crate) fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
