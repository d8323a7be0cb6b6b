// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The build orchestrator: runs the staged pipeline
//! fetch → extract → patch → build → check → install → package inside a
//! sandbox and emits a content-addressed artifact.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use config::Config;
use fetch::Fetcher;
use recipe::{HookPhase, Recipe, Repository, Requirement};
use resolver::{DependencyResolver, RepoIndex, ResolveOptions};
use sandbox::Sandbox;
use serde::Serialize;
use tracing::{info, warn};

/// Pipeline stages in execution order.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Fetch,
    Extract,
    Patch,
    Build,
    Check,
    Install,
    Package,
}

impl Stage {
    pub fn all() -> BTreeSet<Stage> {
        [
            Stage::Fetch,
            Stage::Extract,
            Stage::Patch,
            Stage::Build,
            Stage::Check,
            Stage::Install,
            Stage::Package,
        ]
        .into()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("fetch failed for {package}: {reason}")]
    Fetch { package: String, reason: String },
    #[error("patch {patch} failed for {package}: {reason}")]
    Patch {
        package: String,
        patch: String,
        reason: String,
    },
    #[error("build failed for {package}: {reason}")]
    Build { package: String, reason: String },
    #[error("check failed for {package}: {reason}")]
    Check { package: String, reason: String },
    #[error("install failed for {package}: {reason}")]
    Install { package: String, reason: String },
    #[error("packaging failed for {package}: {reason}")]
    Package { package: String, reason: String },
}

#[derive(Clone, Debug)]
pub struct BuildOptions {
    pub category: Option<String>,
    /// Compute (and log) the dependency order before building. The order is
    /// informative only; dependency artifacts are built by the caller.
    pub resolve_deps: bool,
    pub include_optional: bool,
    pub jobs: Option<u32>,
    pub keep_sandbox: bool,
    /// Subset of stages to run; None runs the whole pipeline.
    pub stages: Option<BTreeSet<Stage>>,
    pub force_fetch: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            category: None,
            resolve_deps: true,
            include_optional: false,
            jobs: None,
            keep_sandbox: false,
            stages: None,
            force_fetch: false,
        }
    }
}

/// What a pipeline run produced. `artifact` is None when the package stage
/// was skipped.
#[derive(Debug)]
pub struct BuildProduct {
    pub artifact: Option<PathBuf>,
    pub recipe: Recipe,
}

/// Record dropped into the package database area after a successful package
/// stage. This is not an installed record; building does not install.
#[derive(Debug, Serialize)]
struct BuiltRecord<'a> {
    name: &'a str,
    version: &'a str,
    artifact: &'a Path,
    sha256: &'a str,
    built_at: String,
    meta_source: &'a Path,
}

pub struct Builder<'a> {
    config: &'a Config,
    repo: Repository,
}

impl<'a> Builder<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            repo: Repository::new(&config.repo_dir),
        }
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    /// The artifact path a package id maps to.
    pub fn artifact_path(&self, id: &str) -> PathBuf {
        self.config.packages_dir().join(format!("{id}.tar.gz"))
    }

    /// Runs the pipeline for one package and returns the artifact path and
    /// the loaded recipe.
    pub fn build(&self, name: &str, options: &BuildOptions) -> Result<BuildProduct> {
        let recipe = self.repo.load(name, options.category.as_deref())?;
        let stages = options.stages.clone().unwrap_or_else(Stage::all);

        if options.resolve_deps {
            self.log_dependency_order(&recipe, options);
        }

        let sandbox = Sandbox::create(
            self.config,
            &recipe.id(),
            &[self.config.repo_dir.clone()],
            options.keep_sandbox,
        )?;

        let artifact = self
            .run_pipeline(&sandbox, &recipe, &stages, options)
            .with_context(|| format!("building {}", recipe.id()))?;

        // The sandbox is torn down on drop unless the caller asked to keep
        // it; that covers the failure path above as well.
        Ok(BuildProduct { artifact, recipe })
    }

    fn log_dependency_order(&self, recipe: &Recipe, options: &BuildOptions) {
        let result = (|| -> Result<Vec<String>> {
            let index =
                RepoIndex::load_or_build(&self.repo, &self.config.index_file(), false)?;
            let mut resolver = DependencyResolver::new(&index, &self.config.lockfile());
            let resolve_options = ResolveOptions {
                allow_optional: options.include_optional,
                max_steps: self.config.resolver_max_steps,
                timeout: Some(std::time::Duration::from_secs(
                    self.config.resolver_timeout_secs,
                )),
                ..Default::default()
            };
            let roots = vec![Requirement::parse(&recipe.name)?];
            let result = resolver.resolve(&roots, &resolve_options)?;
            result.into_result().map(|r| r.order).map_err(Into::into)
        })();
        match result {
            Ok(order) => info!("Dependency order for {}: {}", recipe.name, order.join(", ")),
            Err(e) => warn!(
                "Could not resolve dependencies of {} (building anyway): {:#}",
                recipe.name, e
            ),
        }
    }

    fn run_pipeline(
        &self,
        sandbox: &Sandbox,
        recipe: &Recipe,
        stages: &BTreeSet<Stage>,
        options: &BuildOptions,
    ) -> Result<Option<PathBuf>> {
        let jobs = options.jobs.unwrap_or(self.config.build_jobs);
        let jobs_env = vec![
            ("MAKEFLAGS".to_string(), format!("-j{jobs}")),
            ("JOBS".to_string(), jobs.to_string()),
        ];
        let no_env: Vec<(String, String)> = Vec::new();

        let mut src_artifact: Option<PathBuf> = None;
        let mut src_tree: Option<PathBuf> = None;

        if stages.contains(&Stage::Fetch) {
            self.run_hooks(sandbox, recipe, HookPhase::PreFetch, None, &no_env)?;
            let work_dir = self.config.sources_dir().join(&recipe.name);
            let fetcher = Fetcher::new(self.config);
            let fetched = fetcher
                .fetch(&recipe.source, &work_dir, options.force_fetch)
                .map_err(|e| BuildError::Fetch {
                    package: recipe.id(),
                    reason: format!("{e:#}"),
                })?;
            src_artifact = fetched.into_iter().next();
            self.run_hooks(sandbox, recipe, HookPhase::PostFetch, None, &no_env)?;
        }

        if stages.contains(&Stage::Extract) {
            self.run_hooks(sandbox, recipe, HookPhase::PreExtract, None, &no_env)?;
            let fetched = src_artifact
                .as_deref()
                .context("extract stage needs the fetch stage")?;
            let tree = fetch::materialize_source(fetched, &sandbox.build_dir())?;
            info!("Source tree for {} at {}", recipe.id(), tree.display());
            src_tree = Some(tree.clone());
            self.run_hooks(sandbox, recipe, HookPhase::PostExtract, Some(&tree), &no_env)?;
        }

        if stages.contains(&Stage::Patch) {
            let tree = src_tree
                .as_deref()
                .context("patch stage needs the extract stage")?;
            self.run_hooks(sandbox, recipe, HookPhase::PrePatch, Some(tree), &no_env)?;
            for patch in &recipe.patches {
                let command = format!("patch -p1 -i {}", patch.display());
                sandbox
                    .run_checked(&command, Some(tree), &no_env, "patch")
                    .map_err(|e| BuildError::Patch {
                        package: recipe.id(),
                        patch: patch.display().to_string(),
                        reason: format!("{e:#}"),
                    })?;
            }
            self.run_hooks(sandbox, recipe, HookPhase::PostPatch, Some(tree), &no_env)?;
        }

        if stages.contains(&Stage::Build) {
            let tree = src_tree
                .as_deref()
                .context("build stage needs the extract stage")?;
            self.run_hooks(sandbox, recipe, HookPhase::PreBuild, Some(tree), &jobs_env)?;
            for step in &recipe.build {
                sandbox
                    .run_checked(step, Some(tree), &jobs_env, "build")
                    .map_err(|e| BuildError::Build {
                        package: recipe.id(),
                        reason: format!("{e:#}"),
                    })?;
            }
            self.run_hooks(sandbox, recipe, HookPhase::PostBuild, Some(tree), &jobs_env)?;
        }

        if stages.contains(&Stage::Check) {
            let tree = src_tree
                .as_deref()
                .context("check stage needs the extract stage")?;
            self.run_hooks(sandbox, recipe, HookPhase::PreCheck, Some(tree), &no_env)?;
            for step in &recipe.check {
                sandbox
                    .run_checked(step, Some(tree), &no_env, "check")
                    .map_err(|e| BuildError::Check {
                        package: recipe.id(),
                        reason: format!("{e:#}"),
                    })?;
            }
            self.run_hooks(sandbox, recipe, HookPhase::PostCheck, Some(tree), &no_env)?;
        }

        if stages.contains(&Stage::Install) {
            let tree = src_tree
                .as_deref()
                .context("install stage needs the extract stage")?;
            self.run_hooks(sandbox, recipe, HookPhase::PreInstall, Some(tree), &no_env)?;
            for step in &recipe.install {
                sandbox
                    .run_checked(step, Some(tree), &no_env, "install")
                    .map_err(|e| BuildError::Install {
                        package: recipe.id(),
                        reason: format!("{e:#}"),
                    })?;
            }
            self.run_hooks(sandbox, recipe, HookPhase::PostInstall, Some(tree), &no_env)?;
        }

        if !stages.contains(&Stage::Package) {
            return Ok(None);
        }

        self.run_hooks(
            sandbox,
            recipe,
            HookPhase::PrePackage,
            Some(sandbox.root()),
            &no_env,
        )?;
        let artifact = self
            .package_artifact(sandbox, recipe)
            .map_err(|e| BuildError::Package {
                package: recipe.id(),
                reason: format!("{e:#}"),
            })?;
        self.run_hooks(
            sandbox,
            recipe,
            HookPhase::PostPackage,
            Some(sandbox.root()),
            &no_env,
        )?;
        Ok(Some(artifact))
    }

    /// Archives `install/` into the artifact cache. The archive is written
    /// to a temporary path and renamed so a failed run never leaves a
    /// partial artifact behind.
    fn package_artifact(&self, sandbox: &Sandbox, recipe: &Recipe) -> Result<PathBuf> {
        let artifact = self.artifact_path(&recipe.id());
        std::fs::create_dir_all(self.config.packages_dir())?;
        let tmp = artifact.with_extension("gz.tmp");

        let result = tarball::create_tarball(&sandbox.install_dir(), &tmp);
        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        std::fs::rename(&tmp, &artifact)?;

        let sha256 = tarball::sha256_file(&artifact)?;
        let record = BuiltRecord {
            name: &recipe.name,
            version: &recipe.version,
            artifact: &artifact,
            sha256: &sha256,
            built_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            meta_source: &recipe.meta_path,
        };
        std::fs::create_dir_all(&self.config.pkg_db)?;
        std::fs::write(
            self.config.pkg_db.join(format!("{}.built.meta", recipe.name)),
            serde_json::to_string_pretty(&record)?,
        )?;
        info!("Packaged {} ({})", artifact.display(), sha256);
        Ok(artifact)
    }

    fn run_hooks(
        &self,
        sandbox: &Sandbox,
        recipe: &Recipe,
        phase: HookPhase,
        cwd: Option<&Path>,
        env: &[(String, String)],
    ) -> Result<()> {
        let steps = recipe.hook_steps(phase);
        if steps.is_empty() {
            return Ok(());
        }
        info!("Running {} {} hooks for {}", steps.len(), phase, recipe.id());
        for step in steps {
            sandbox.run_checked(step, cwd, env, &phase.to_string())?;
        }
        Ok(())
    }
}
