// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use builder::{BuildOptions, Builder};
use pkgdb::{InstallOptions, PackageDb};
use recipe::Requirement;
use resolver::{DependencyResolver, RepoIndex, ResolveOptions};
use sandbox::Sandbox;
use tracing::info;

use crate::{events::RollbackEvent, now_ts, TransactionError, TransactionManager};

#[derive(Clone, Debug)]
pub struct UpgradeOptions {
    pub category: Option<String>,
    /// Apply the new artifacts to the real root. Without it the flow stops
    /// after sandbox validation.
    pub commit: bool,
    pub resolve_deps: bool,
    pub include_optional: bool,
    pub jobs: Option<u32>,
    pub keep_sandbox: bool,
    /// Plan only: no builds, no snapshot, no commit.
    pub dry_run: bool,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            category: None,
            commit: false,
            resolve_deps: true,
            include_optional: false,
            jobs: None,
            keep_sandbox: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct UpgradeReport {
    /// Package names, dependencies first.
    pub order: Vec<String>,
    pub artifacts: BTreeMap<String, PathBuf>,
    pub snapshot: Option<String>,
    pub validated: Vec<String>,
    pub committed: Vec<String>,
}

impl TransactionManager<'_> {
    /// The upgrade path: resolve, build each package in dependency order,
    /// validate all artifacts in a sandbox, then (with `commit`) install
    /// them into the real root.
    ///
    /// A snapshot is taken before any mutation so [`Self::rollback_last`]
    /// can restore the previous state. If the commit loop fails midway, the
    /// packages it already applied are removed again (best effort) before
    /// the error surfaces.
    pub fn upgrade(&self, package: &str, options: &UpgradeOptions) -> Result<UpgradeReport> {
        info!(
            "Upgrade {} (commit={}, resolve_deps={})",
            package, options.commit, options.resolve_deps
        );
        let order = self.upgrade_order(package, options)?;
        let mut report = UpgradeReport {
            order: order.clone(),
            ..Default::default()
        };

        if !options.dry_run {
            report.snapshot = Some(self.snapshot_before(
                &order,
                "pre_upgrade",
                serde_json::json!({ "target": package }),
            )?);
        }

        let build = Builder::new(self.config());
        for name in &order {
            if options.dry_run {
                let recipe = self.repo().load(name, None)?;
                report
                    .artifacts
                    .insert(name.clone(), build.artifact_path(&recipe.id()));
                continue;
            }
            let build_options = BuildOptions {
                resolve_deps: false,
                jobs: options.jobs,
                ..Default::default()
            };
            let product = build.build(name, &build_options)?;
            let artifact = product
                .artifact
                .with_context(|| format!("no artifact produced for {name}"))?;
            report.artifacts.insert(name.clone(), artifact);
        }

        if options.dry_run {
            return Ok(report);
        }

        // Validate every artifact by installing into a scratch root first.
        let sandbox = Sandbox::create(
            self.config(),
            &format!("upgrade-{package}-{}", now_ts()),
            &[],
            options.keep_sandbox,
        )?;
        let scratch_db = PackageDb::new(&sandbox.tmp_dir().join("db"));
        for name in &order {
            let artifact = &report.artifacts[name];
            let mut install = InstallOptions::new(&sandbox.install_dir());
            install.overwrite = true;
            install.upgrade = true;
            scratch_db
                .install(artifact, &install)
                .with_context(|| format!("sandbox validation of {name}"))?;
            report.validated.push(name.clone());
        }

        if !options.commit {
            return Ok(report);
        }

        let mut failed: Vec<(String, String)> = Vec::new();
        for name in &order {
            let artifact = &report.artifacts[name];
            let mut install = InstallOptions::new(&self.config().install_root);
            install.overwrite = true;
            install.upgrade = true;
            install.explicit = name == package;
            match self.db().install(artifact, &install) {
                Ok(_) => report.committed.push(name.clone()),
                Err(e) => {
                    failed.push((name.clone(), format!("{e:#}")));
                    break;
                }
            }
        }

        if !failed.is_empty() {
            // Best-effort rollback of the partially applied commit loop.
            for name in report.committed.iter().rev() {
                let _ = self.db().remove(name, false);
            }
            self.append_event(&RollbackEvent::UpgradeOp {
                ts: now_ts(),
                pkgs: order,
                result: "failed".to_string(),
            })?;
            return Err(TransactionError::CommitFailed { failed }.into());
        }

        self.append_event(&RollbackEvent::UpgradeOp {
            ts: now_ts(),
            pkgs: order,
            result: "success".to_string(),
        })?;
        Ok(report)
    }

    fn upgrade_order(&self, package: &str, options: &UpgradeOptions) -> Result<Vec<String>> {
        if !options.resolve_deps {
            let recipe = self.repo().load(package, options.category.as_deref())?;
            return Ok(vec![recipe.name]);
        }
        let index =
            RepoIndex::load_or_build(self.repo(), &self.config().index_file(), false)?;
        let mut resolver = DependencyResolver::new(&index, &self.config().lockfile());
        let resolve_options = ResolveOptions {
            allow_optional: options.include_optional,
            max_steps: self.config().resolver_max_steps,
            timeout: Some(Duration::from_secs(self.config().resolver_timeout_secs)),
            ..Default::default()
        };
        let roots = vec![Requirement::parse(package)?];
        let result = resolver.resolve(&roots, &resolve_options)?.into_result()?;
        Ok(result.names_in_order())
    }
}
