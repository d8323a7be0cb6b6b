// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The bootstrap manager: drives the toolchain rebuild, builds the base
//! package set with a worker pool, and populates a validated rootfs.

mod manifest;
mod repair;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Command,
    sync::Mutex,
};

use anyhow::{Context, Result};
use builder::{BuildOptions, Builder};
use config::Config;
use pkgdb::{InstallOptions, PackageDb};
use recipe::Repository;
use resolver::{DependencyResolver, RepoIndex, ResolveOptions};
use serde::Serialize;
use toolchain::ToolchainManager;
use tracing::{info, warn};

pub use manifest::{FileEntry, RootfsManifest};

/// Top-level directories every rootfs gets.
const ROOTFS_DIRS: &[&str] = &[
    "bin", "dev", "etc", "lib", "proc", "sys", "tmp", "usr", "var",
];

/// Smoke tests run against a populated rootfs.
const SMOKE_TESTS: &[(&str, &[&str])] = &[
    ("bin/sh", &["-c", "echo ok"]),
    ("bin/ls", &["--version"]),
];

pub type ProgressCallback = Box<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum BuildStatus {
    Built,
    /// A checkpoint from an earlier run says this package is done.
    Skipped,
    Failed(String),
}

#[derive(Debug, Default)]
pub struct BootstrapReport {
    pub rootfs: PathBuf,
    pub manifest_path: PathBuf,
    pub snapshot: Option<PathBuf>,
    pub build_results: BTreeMap<String, BuildStatus>,
    pub repair_actions: BTreeMap<String, String>,
}

pub struct BootstrapManager<'a> {
    config: &'a Config,
    callbacks: Mutex<Vec<ProgressCallback>>,
}

impl<'a> BootstrapManager<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn config(&self) -> &Config {
        self.config
    }

    /// Registers a progress callback receiving `(event, payload)` pairs.
    pub fn add_progress_callback(&self, callback: ProgressCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    pub(crate) fn emit(&self, event: &str, payload: serde_json::Value) {
        for callback in self.callbacks.lock().unwrap().iter() {
            callback(event, &payload);
        }
    }

    fn repo(&self) -> Repository {
        Repository::new(&self.config.repo_dir)
    }

    /// Resolves a package set into build order, falling back to the
    /// declared order when resolution fails.
    fn resolve_order(&self, packages: &[String]) -> Vec<String> {
        let resolved = (|| -> Result<Vec<String>> {
            let repo = self.repo();
            let index = RepoIndex::load_or_build(&repo, &self.config.index_file(), false)?;
            let mut solver = DependencyResolver::new(&index, &self.config.lockfile());
            let options = ResolveOptions {
                allow_optional: true,
                max_steps: self.config.resolver_max_steps,
                timeout: Some(std::time::Duration::from_secs(
                    self.config.resolver_timeout_secs,
                )),
                ..Default::default()
            };
            let result = solver.resolve_names(packages, &options)?.into_result()?;
            Ok(result.names_in_order())
        })();
        match resolved {
            Ok(order) => order,
            Err(e) => {
                warn!("Resolver could not order {packages:?}, using declared order: {e:#}");
                packages.to_vec()
            }
        }
    }

    fn checkpoint_path(&self, package: &str) -> PathBuf {
        self.config.checkpoint_dir().join(format!("{package}.chk"))
    }

    fn save_checkpoint(&self, package: &str) -> Result<()> {
        std::fs::create_dir_all(self.config.checkpoint_dir())?;
        std::fs::write(
            self.checkpoint_path(package),
            serde_json::to_string(&serde_json::json!({
                "step": package,
                "ts": chrono::Local::now().format("%Y%m%d%H%M%S").to_string(),
            }))?,
        )?;
        Ok(())
    }

    pub fn list_checkpoints(&self) -> Result<Vec<String>> {
        let dir = self.config.checkpoint_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(step) = name.strip_suffix(".chk") {
                out.push(step.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Discards the checkpoint of a completed step so the next bootstrap
    /// run redoes it. Best effort; emits `rollback.*` events.
    pub fn rollback_to_checkpoint(&self, step: &str) -> Result<bool> {
        self.emit("rollback.start", serde_json::json!({ "step": step }));
        let path = self.checkpoint_path(step);
        if !path.is_file() {
            self.emit("rollback.partial", serde_json::json!({ "step": step }));
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        self.emit("rollback.done", serde_json::json!({ "step": step }));
        Ok(true)
    }

    /// Warms the download cache for a package set, emitting `download.*`
    /// progress events. Fetch failures are reported but left for the build
    /// stage to surface properly.
    pub fn prefetch_sources(&self, packages: &[String]) {
        let repo = self.repo();
        let fetcher = fetch::Fetcher::new(self.config);
        for package in packages {
            let Ok(recipe) = repo.load(package, None) else {
                continue;
            };
            self.emit(
                "download.start",
                serde_json::json!({ "pkg": package }),
            );
            let work_dir = self.config.sources_dir().join(package);
            match fetcher.fetch(&recipe.source, &work_dir, false) {
                Ok(paths) => self.emit(
                    "download.ok",
                    serde_json::json!({
                        "pkg": package,
                        "paths": paths
                            .iter()
                            .map(|p| p.display().to_string())
                            .collect::<Vec<_>>(),
                    }),
                ),
                Err(e) => {
                    warn!("Prefetch of {package} failed: {e:#}");
                    self.emit(
                        "download.error",
                        serde_json::json!({ "pkg": package, "err": format!("{e:#}") }),
                    );
                }
            }
        }
    }

    /// Builds and registers a package set with a bounded worker pool.
    ///
    /// Completed packages are checkpointed so a restarted bootstrap skips
    /// them. Independent builds run in parallel; each package builds at
    /// most once.
    pub fn build_packages_parallel(
        &self,
        packages: &[String],
        jobs: Option<u32>,
    ) -> Result<BTreeMap<String, BuildStatus>> {
        self.emit(
            "build.queue",
            serde_json::json!({ "total": packages.len() }),
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parallel_workers.max(1))
            .build()
            .context("building the worker pool")?;

        let done = Mutex::new(0usize);
        let total = packages.len();
        let statuses: Vec<(String, BuildStatus)> = pool.install(|| {
            use rayon::prelude::*;
            packages
                .par_iter()
                .map(|package| {
                    let status = self.build_worker(package, jobs);
                    let completed = {
                        let mut done = done.lock().unwrap();
                        *done += 1;
                        *done
                    };
                    self.emit(
                        "build.progress",
                        serde_json::json!({
                            "pkg": package,
                            "ok": !matches!(status, BuildStatus::Failed(_)),
                            "completed": completed,
                            "total": total,
                        }),
                    );
                    (package.clone(), status)
                })
                .collect()
        });
        Ok(statuses.into_iter().collect())
    }

    /// One worker: build the package and register it in the package
    /// database.
    fn build_worker(&self, package: &str, jobs: Option<u32>) -> BuildStatus {
        if self.checkpoint_path(package).is_file() {
            info!("Checkpoint found for {package}, skipping");
            return BuildStatus::Skipped;
        }
        self.emit("build.start", serde_json::json!({ "pkg": package }));

        let result = (|| -> Result<()> {
            let build = Builder::new(self.config);
            let options = BuildOptions {
                resolve_deps: false,
                jobs,
                ..Default::default()
            };
            let product = build.build(package, &options)?;
            let artifact = product
                .artifact
                .with_context(|| format!("no artifact produced for {package}"))?;

            let db = PackageDb::new(&self.config.pkg_db);
            let mut install = InstallOptions::new(&self.config.install_root);
            install.overwrite = true;
            install.upgrade = true;
            db.install(&artifact, &install)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                if let Err(e) = self.save_checkpoint(package) {
                    warn!("Failed to checkpoint {package}: {e:#}");
                }
                self.emit("build.done", serde_json::json!({ "pkg": package }));
                BuildStatus::Built
            }
            Err(e) => {
                let reason = format!("{e:#}");
                self.emit(
                    "build.error",
                    serde_json::json!({ "pkg": package, "err": reason }),
                );
                BuildStatus::Failed(reason)
            }
        }
    }

    /// Creates a rootfs directory and installs the given packages into it.
    ///
    /// The rootfs carries its own package database under
    /// `var/lib/crucible/packages` so its manifests stay inside the tree.
    pub fn create_rootfs(&self, dest: &Path, packages: &[String]) -> Result<PathBuf> {
        self.emit(
            "rootfs.create.start",
            serde_json::json!({ "path": dest.display().to_string(), "packages": packages }),
        );
        for sub in ROOTFS_DIRS {
            std::fs::create_dir_all(dest.join(sub))?;
        }

        let order = self.resolve_order(packages);
        info!("Rootfs install order: {}", order.join(", "));
        let rootfs_db = PackageDb::new(&dest.join("var/lib/crucible/packages"));
        let build = Builder::new(self.config);
        for package in &order {
            let recipe = self.repo().load(package, None)?;
            let mut artifact = build.artifact_path(&recipe.id());
            if !artifact.is_file() {
                let options = BuildOptions {
                    resolve_deps: false,
                    ..Default::default()
                };
                let product = build.build(package, &options)?;
                artifact = product
                    .artifact
                    .with_context(|| format!("no artifact produced for {package}"))?;
            }
            let mut install = InstallOptions::new(dest);
            install.overwrite = true;
            install.upgrade = true;
            rootfs_db.install(&artifact, &install)?;
        }

        self.emit(
            "rootfs.create.done",
            serde_json::json!({ "path": dest.display().to_string() }),
        );
        Ok(dest.to_path_buf())
    }

    /// Runs the fixed smoke-test set against a rootfs.
    pub fn validate_rootfs(&self, rootfs: &Path) -> Result<bool> {
        let mut valid = true;
        for (rel, args) in SMOKE_TESTS {
            let binary = rootfs.join(rel);
            if !binary.is_file() {
                warn!("Rootfs validation: {} is missing", binary.display());
                valid = false;
                continue;
            }
            match processes::run_captured(
                Command::new(&binary).args(*args),
                Some(std::time::Duration::from_secs(30)),
            ) {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    warn!(
                        "Rootfs validation: {} exited {:?}",
                        binary.display(),
                        output.status.code()
                    );
                    valid = false;
                }
                Err(e) => {
                    warn!("Rootfs validation: {} failed to run: {e:#}", binary.display());
                    valid = false;
                }
            }
        }
        Ok(valid)
    }

    /// Archives the rootfs plus its manifest into the snapshot area.
    pub fn snapshot_rootfs(&self, rootfs: &Path) -> Result<PathBuf> {
        let outdir = self.config.manifest_dir();
        std::fs::create_dir_all(&outdir)?;
        let base = rootfs
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rootfs".to_string());
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        let tar_path = outdir.join(format!("{base}-{stamp}.tar.gz"));
        tarball::create_tarball(rootfs, &tar_path)?;

        let manifest = manifest::generate(rootfs, true)?;
        let manifest_path = outdir.join(format!("{base}-{stamp}.manifest.json"));
        std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;

        self.emit(
            "rootfs.snapshot",
            serde_json::json!({
                "tar": tar_path.display().to_string(),
                "manifest": manifest_path.display().to_string(),
            }),
        );
        Ok(tar_path)
    }

    /// The full bootstrap flow: toolchain, base packages, rootfs, manifest,
    /// validation with shared-library repair, snapshot.
    pub fn bootstrap_system(
        &self,
        rootfs_dest: Option<&Path>,
        jobs: Option<u32>,
    ) -> Result<BootstrapReport> {
        // 1. Toolchain first; a broken toolchain fails the whole flow.
        let toolchain = ToolchainManager::new(self.config);
        toolchain
            .rebuild_toolchain(jobs)
            .context("toolchain bootstrap failed")?;

        // 2-3. Base package set, resolver-ordered, sources warmed, built by
        // the pool.
        let order = self.resolve_order(&self.config.base_packages);
        self.prefetch_sources(&order);
        let build_results = self.build_packages_parallel(&order, jobs)?;
        let failed: Vec<&String> = build_results
            .iter()
            .filter(|(_, s)| matches!(s, BuildStatus::Failed(_)))
            .map(|(name, _)| name)
            .collect();
        if !failed.is_empty() {
            anyhow::bail!("base package builds failed: {failed:?}");
        }

        // 4. Rootfs.
        let default_dest = self.config.rootfs_dir.join(format!(
            "rootfs-{}",
            chrono::Local::now().format("%Y%m%d%H%M%S")
        ));
        let dest = rootfs_dest.unwrap_or(&default_dest);
        let rootfs = self.create_rootfs(dest, &self.config.base_packages)?;

        // 5. Manifest.
        let manifest = manifest::generate(&rootfs, true)?;
        std::fs::create_dir_all(self.config.manifest_dir())?;
        let manifest_path = self.config.manifest_dir().join(format!(
            "manifest-{}.json",
            chrono::Local::now().format("%Y%m%d%H%M%S")
        ));
        std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;

        // 6. Validate; on failure try to repair missing shared libraries
        // and only fail if libraries stay unresolved.
        let mut report = BootstrapReport {
            rootfs: rootfs.clone(),
            manifest_path,
            snapshot: None,
            build_results,
            repair_actions: BTreeMap::new(),
        };
        if !self.validate_rootfs(&rootfs)? {
            warn!("Rootfs validation failed, attempting shared-library repair");
            report.repair_actions = self.repair_missing_libs(&rootfs)?;
            let still_missing = self.detect_missing_libs(&rootfs)?;
            if !still_missing.is_empty() {
                anyhow::bail!("rootfs still has missing libraries: {still_missing:?}");
            }
        }

        // 7. Snapshot.
        report.snapshot = Some(self.snapshot_rootfs(&rootfs)?);
        info!("Bootstrap complete: {}", rootfs.display());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fileutil::ScratchDir;
    use pretty_assertions::assert_eq;

    use super::*;

    fn buildable_recipe(config: &Config, name: &str, version: &str) {
        let stage = config.cache_dir.join(format!("src-{name}-{version}"));
        std::fs::create_dir_all(stage.join(format!("{name}-{version}"))).unwrap();
        std::fs::write(
            stage.join(format!("{name}-{version}/payload.txt")),
            format!("{name} {version}"),
        )
        .unwrap();
        let archive = config
            .cache_dir
            .join(format!("upstream-{name}-{version}.tar.gz"));
        tarball::create_tarball(&stage, &archive).unwrap();
        std::fs::remove_dir_all(&stage).unwrap();

        let pkg_dir = config.repo_dir.join("core").join(name);
        std::fs::create_dir_all(&pkg_dir).unwrap();
        std::fs::write(
            pkg_dir.join(format!("{name}.meta")),
            format!(
                r#"name: {name}
version: "{version}"
source: file://{archive}
install:
  - mkdir -p "$DESTDIR/usr/share/{name}"
  - cp payload.txt "$DESTDIR/usr/share/{name}/payload.txt"
"#,
                archive = archive.display(),
            ),
        )
        .unwrap();
    }

    fn fixture() -> Result<(ScratchDir, Config)> {
        let dir = ScratchDir::new("fixture")?;
        let mut config = Config::rooted_at(dir.path());
        config.base_packages = vec!["alpha".to_string(), "beta".to_string()];
        config.toolchain_packages = Vec::new();
        config.ensure_dirs()?;
        buildable_recipe(&config, "alpha", "1.0");
        buildable_recipe(&config, "beta", "1.0");
        Ok((dir, config))
    }

    #[test]
    fn parallel_builds_register_and_checkpoint() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = BootstrapManager::new(&config);

        let packages = config.base_packages.clone();
        let results = manager.build_packages_parallel(&packages, None)?;
        assert_eq!(results["alpha"], BuildStatus::Built);
        assert_eq!(results["beta"], BuildStatus::Built);
        assert_eq!(manager.list_checkpoints()?, ["alpha", "beta"]);

        let db = PackageDb::new(&config.pkg_db);
        assert!(db.query("alpha")?.is_some());

        // A restart skips completed packages.
        let results = manager.build_packages_parallel(&packages, None)?;
        assert_eq!(results["alpha"], BuildStatus::Skipped);

        // Dropping a checkpoint makes the next run redo the package.
        assert!(manager.rollback_to_checkpoint("alpha")?);
        assert!(!manager.rollback_to_checkpoint("alpha")?);
        let results = manager.build_packages_parallel(&packages, None)?;
        assert_eq!(results["alpha"], BuildStatus::Built);
        Ok(())
    }

    #[test]
    fn failed_builds_are_reported_not_panicked() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = BootstrapManager::new(&config);

        let packages = vec!["alpha".to_string(), "nonexistent".to_string()];
        let results = manager.build_packages_parallel(&packages, None)?;
        assert_eq!(results["alpha"], BuildStatus::Built);
        assert!(matches!(results["nonexistent"], BuildStatus::Failed(_)));
        Ok(())
    }

    #[test]
    fn create_rootfs_installs_with_canonical_layout() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = BootstrapManager::new(&config);

        let dest = config.rootfs_dir.join("test-rootfs");
        let packages = config.base_packages.clone();
        let rootfs = manager.create_rootfs(&dest, &packages)?;

        for sub in ROOTFS_DIRS {
            assert!(rootfs.join(sub).is_dir(), "{sub} missing");
        }
        assert_eq!(
            std::fs::read_to_string(rootfs.join("usr/share/alpha/payload.txt"))?,
            "alpha 1.0"
        );
        // The rootfs carries its own package database.
        let rootfs_db = PackageDb::new(&rootfs.join("var/lib/crucible/packages"));
        assert!(rootfs_db.query("alpha")?.is_some());
        assert!(rootfs_db.query("beta")?.is_some());
        Ok(())
    }

    #[test]
    fn progress_events_flow_through_callbacks() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = BootstrapManager::new(&config);

        let events: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&events);
        manager.add_progress_callback(Box::new(move |event, _payload| {
            sink.lock().unwrap().push(event.to_string());
        }));

        let packages = vec!["alpha".to_string()];
        manager.prefetch_sources(&packages);
        manager.build_packages_parallel(&packages, None)?;
        let seen = events.lock().unwrap().clone();
        assert!(seen.contains(&"download.start".to_string()), "{seen:?}");
        assert!(seen.contains(&"download.ok".to_string()), "{seen:?}");
        assert!(seen.contains(&"build.queue".to_string()), "{seen:?}");
        assert!(seen.contains(&"build.start".to_string()), "{seen:?}");
        assert!(seen.contains(&"build.done".to_string()), "{seen:?}");
        assert!(seen.contains(&"build.progress".to_string()), "{seen:?}");
        Ok(())
    }

    #[test]
    fn bootstrap_system_end_to_end() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = BootstrapManager::new(&config);

        let dest = config.rootfs_dir.join("full-rootfs");
        let report = manager.bootstrap_system(Some(&dest), None)?;

        assert_eq!(report.rootfs, dest);
        assert!(report.manifest_path.is_file());
        let snapshot = report.snapshot.expect("snapshot must exist");
        assert!(snapshot.is_file());
        assert!(snapshot.extension().unwrap() == "gz");

        // The manifest records the installed payloads with their hashes.
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&report.manifest_path)?)?;
        let files = manifest["files"].as_object().unwrap();
        assert!(files.contains_key("usr/share/alpha/payload.txt"));
        Ok(())
    }
}
