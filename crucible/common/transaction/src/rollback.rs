// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use anyhow::Result;
use pkgdb::{InstallOptions, PackageDb};
use sandbox::Sandbox;
use tracing::{info, warn};

use crate::{
    events::RollbackEvent, file_name_string, now_ts, TransactionError, TransactionManager,
};

/// Outcome of [`TransactionManager::rollback_last`].
#[derive(Debug, Default)]
pub struct RollbackReport {
    pub snapshot: String,
    pub packages: Vec<String>,
    pub restored: Vec<String>,
    pub errors: Vec<(String, String)>,
    pub committed: bool,
}

/// Outcome of [`TransactionManager::rollback_pkg_to_version`].
#[derive(Debug)]
pub struct SingleRollbackReport {
    pub package: String,
    pub target_version: String,
    pub artifact: PathBuf,
    pub validated: bool,
    pub committed: bool,
}

impl TransactionManager<'_> {
    /// Rolls back to the most recent snapshot.
    ///
    /// Every artifact recorded in the snapshot is first installed into a
    /// fresh sandbox to validate it. Without `commit` the call stops there
    /// and reports; with `commit` the artifacts are re-installed into the
    /// real root and the snapshot's records and manifests are restored
    /// byte-for-byte into the package database.
    pub fn rollback_last(&self, commit: bool, keep_sandbox: bool) -> Result<RollbackReport> {
        let snapshot_id = self
            .read_log()?
            .into_iter()
            .rev()
            .find_map(|event| match event {
                RollbackEvent::Snapshot { ts, .. } => Some(ts),
                _ => None,
            })
            .ok_or_else(|| {
                TransactionError::RollbackUnavailable("no snapshot recorded".to_string())
            })?;
        let header = self.show_snapshot(&snapshot_id)?.ok_or_else(|| {
            TransactionError::RollbackUnavailable(format!(
                "snapshot {snapshot_id} is missing on disk"
            ))
        })?;

        let mut report = RollbackReport {
            snapshot: snapshot_id.clone(),
            packages: header.packages.clone(),
            ..Default::default()
        };

        let sandbox = Sandbox::create(
            self.config(),
            &format!("rollback-{snapshot_id}"),
            &[],
            keep_sandbox,
        )?;
        let scratch_db = PackageDb::new(&sandbox.tmp_dir().join("db"));

        let mut artifacts = Vec::new();
        for package in &header.packages {
            let Some(record) = self.snapshot_record(&snapshot_id, package)? else {
                warn!("Snapshot {snapshot_id} holds no record for {package}");
                continue;
            };
            if !record.artifact.is_file() {
                report.errors.push((
                    package.clone(),
                    format!("missing artifact {}", record.artifact.display()),
                ));
                continue;
            }
            let mut options = InstallOptions::new(&sandbox.install_dir());
            options.overwrite = true;
            options.upgrade = true;
            match scratch_db.install(&record.artifact, &options) {
                Ok(_) => artifacts.push((package.clone(), record)),
                Err(e) => report.errors.push((package.clone(), format!("{e:#}"))),
            }
        }

        if !report.errors.is_empty() && !commit {
            return Ok(report);
        }

        if commit {
            for (package, record) in &artifacts {
                let mut options = InstallOptions::new(&record.install_root);
                options.overwrite = true;
                options.upgrade = true;
                if let Err(e) = self.db().install(&record.artifact, &options) {
                    report.errors.push((package.clone(), format!("{e:#}")));
                    continue;
                }
                // Restore the snapshot's metadata verbatim so the database
                // ends up byte-identical to the snapshotted state.
                self.restore_package_meta(&snapshot_id, package)?;
                report.restored.push(package.clone());
            }
            report.committed = report.errors.is_empty();
        } else {
            report.restored = artifacts.iter().map(|(p, _)| p.clone()).collect();
        }

        self.append_event(&RollbackEvent::Rollback {
            ts: now_ts(),
            snapshot: snapshot_id,
            packages: header.packages,
            commit,
        })?;
        info!(
            "Rollback {} ({} packages, commit={commit})",
            report.snapshot,
            report.restored.len()
        );
        Ok(report)
    }

    /// Rolls one package back to a specific version.
    ///
    /// The artifact is looked up in the artifact cache first, then in the
    /// stored records of old snapshots.
    pub fn rollback_pkg_to_version(
        &self,
        package: &str,
        target_version: &str,
        commit: bool,
    ) -> Result<SingleRollbackReport> {
        let cached = self
            .config()
            .packages_dir()
            .join(format!("{package}-{target_version}.tar.gz"));
        let artifact = if cached.is_file() {
            cached
        } else {
            self.find_artifact_in_snapshots(package, target_version)?
                .ok_or_else(|| {
                    TransactionError::RollbackUnavailable(format!(
                        "no artifact for {package} {target_version} in cache or snapshots"
                    ))
                })?
        };

        // Validate in a scratch sandbox before touching the real root.
        let sandbox = Sandbox::create(
            self.config(),
            &format!("rollback-{package}-{}", now_ts()),
            &[],
            false,
        )?;
        let scratch_db = PackageDb::new(&sandbox.tmp_dir().join("db"));
        let mut options = InstallOptions::new(&sandbox.install_dir());
        options.overwrite = true;
        scratch_db.install(&artifact, &options)?;

        let mut report = SingleRollbackReport {
            package: package.to_string(),
            target_version: target_version.to_string(),
            artifact: artifact.clone(),
            validated: true,
            committed: false,
        };

        if commit {
            self.snapshot_before(
                &[package.to_string()],
                &format!("rollback_to_{target_version}"),
                serde_json::json!({ "artifact": file_name_string(&artifact) }),
            )?;
            let mut options = InstallOptions::new(&self.config().install_root);
            options.overwrite = true;
            options.upgrade = true;
            self.db().install(&artifact, &options)?;
            self.append_event(&RollbackEvent::RollbackPkg {
                ts: now_ts(),
                pkg: package.to_string(),
                target_version: target_version.to_string(),
            })?;
            report.committed = true;
        }
        Ok(report)
    }

    fn find_artifact_in_snapshots(
        &self,
        package: &str,
        target_version: &str,
    ) -> Result<Option<PathBuf>> {
        for snapshot_id in self.list_snapshots()?.into_iter().rev() {
            if let Some(record) = self.snapshot_record(&snapshot_id, package)? {
                if record.version == target_version && record.artifact.is_file() {
                    return Ok(Some(record.artifact));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use fileutil::ScratchDir;
    use pretty_assertions::assert_eq;

    use crate::testutil::*;
    use crate::TransactionManager;

    use super::*;
    use config::Config;

    #[test]
    fn rollback_last_restores_snapshot_state() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let config = Config::rooted_at(dir.path());
        config.ensure_dirs()?;
        let manager = TransactionManager::new(&config);

        let v1 = make_artifact(&config, "app", "1.0", &[("usr/bin/app", "v1")]);
        install(&config, manager.db(), &v1, true);
        let record_before = std::fs::read(manager.db().record_path("app"))?;
        let manifest_before = std::fs::read(manager.db().manifest_path("app"))?;

        manager.snapshot_before(&["app".to_string()], "pre_upgrade", serde_json::Value::Null)?;

        // Mutate: upgrade to 2.0.
        let v2 = make_artifact(&config, "app", "2.0", &[("usr/bin/app", "v2")]);
        install(&config, manager.db(), &v2, true);
        assert_eq!(manager.db().query("app")?.unwrap().version, "2.0");

        let report = manager.rollback_last(true, false)?;
        assert!(report.committed, "{:?}", report.errors);
        assert_eq!(report.restored, ["app"]);

        // The installed record and manifest are byte-identical to the
        // snapshot, and the file contents are back to v1.
        assert_eq!(std::fs::read(manager.db().record_path("app"))?, record_before);
        assert_eq!(
            std::fs::read(manager.db().manifest_path("app"))?,
            manifest_before
        );
        assert_eq!(
            std::fs::read_to_string(config.install_root.join("usr/bin/app"))?,
            "v1"
        );
        Ok(())
    }

    #[test]
    fn rollback_without_commit_only_validates() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let config = Config::rooted_at(dir.path());
        config.ensure_dirs()?;
        let manager = TransactionManager::new(&config);

        let v1 = make_artifact(&config, "app", "1.0", &[("usr/bin/app", "v1")]);
        install(&config, manager.db(), &v1, true);
        manager.snapshot_before(&["app".to_string()], "pre_upgrade", serde_json::Value::Null)?;

        let v2 = make_artifact(&config, "app", "2.0", &[("usr/bin/app", "v2")]);
        install(&config, manager.db(), &v2, true);

        let report = manager.rollback_last(false, false)?;
        assert!(!report.committed);
        assert_eq!(report.restored, ["app"]);
        // The real system is untouched.
        assert_eq!(manager.db().query("app")?.unwrap().version, "2.0");
        assert_eq!(
            std::fs::read_to_string(config.install_root.join("usr/bin/app"))?,
            "v2"
        );
        Ok(())
    }

    #[test]
    fn rollback_without_snapshot_is_unavailable() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let config = Config::rooted_at(dir.path());
        config.ensure_dirs()?;
        let manager = TransactionManager::new(&config);

        let err = manager.rollback_last(true, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransactionError>(),
            Some(TransactionError::RollbackUnavailable(_))
        ));
        Ok(())
    }

    #[test]
    fn missing_artifact_aborts_uncommitted_rollback() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let config = Config::rooted_at(dir.path());
        config.ensure_dirs()?;
        let manager = TransactionManager::new(&config);

        let v1 = make_artifact(&config, "app", "1.0", &[("usr/bin/app", "v1")]);
        install(&config, manager.db(), &v1, true);
        manager.snapshot_before(&["app".to_string()], "pre_upgrade", serde_json::Value::Null)?;

        std::fs::remove_file(&v1)?;
        let report = manager.rollback_last(false, false)?;
        assert_eq!(report.errors.len(), 1);
        assert!(report.restored.is_empty());
        Ok(())
    }

    #[test]
    fn rollback_pkg_to_version_uses_the_cache() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let config = Config::rooted_at(dir.path());
        config.ensure_dirs()?;
        let manager = TransactionManager::new(&config);

        let v1 = make_artifact(&config, "app", "1.0", &[("usr/bin/app", "v1")]);
        let v2 = make_artifact(&config, "app", "2.0", &[("usr/bin/app", "v2")]);
        install(&config, manager.db(), &v1, true);
        install(&config, manager.db(), &v2, true);
        assert_eq!(manager.db().query("app")?.unwrap().version, "2.0");

        let report = manager.rollback_pkg_to_version("app", "1.0", true)?;
        assert!(report.validated && report.committed);
        assert_eq!(manager.db().query("app")?.unwrap().version, "1.0");
        assert_eq!(
            std::fs::read_to_string(config.install_root.join("usr/bin/app"))?,
            "v1"
        );
        Ok(())
    }

    #[test]
    fn rollback_pkg_to_unknown_version_fails() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let config = Config::rooted_at(dir.path());
        config.ensure_dirs()?;
        let manager = TransactionManager::new(&config);

        let err = manager
            .rollback_pkg_to_version("ghost", "9.9", false)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransactionError>(),
            Some(TransactionError::RollbackUnavailable(_))
        ));
        Ok(())
    }
}
