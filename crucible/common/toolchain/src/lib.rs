// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The toolchain manager: registers installed compiler and kernel versions,
//! switches between them with atomic symlink replacement, and validates the
//! result by compiling and executing real programs.

mod probes;
mod state;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::Config;
use tracing::{info, warn};
use transaction::{TransactionManager, UpgradeOptions};

pub use probes::ValidationReport;
pub use state::{Profile, ToolchainState};

#[derive(thiserror::Error, Debug)]
pub enum ToolchainError {
    #[error("{component} version {version} is not installed")]
    UnknownVersion { component: String, version: String },
    #[error("profile {0} does not exist")]
    UnknownProfile(String),
    #[error("toolchain validation failed after {action}: {failed:?}")]
    ValidationFailed {
        action: String,
        failed: Vec<String>,
    },
}

/// Version-switched components.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Component {
    Compiler,
    Kernel,
}

/// Outcome of a toolchain rebuild.
#[derive(Debug, Default)]
pub struct RebuildReport {
    pub updated: Vec<String>,
    pub validation: Option<ValidationReport>,
    pub rolled_back: bool,
}

pub struct ToolchainManager<'a> {
    config: &'a Config,
}

impl<'a> ToolchainManager<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn state(&self) -> Result<ToolchainState> {
        ToolchainState::load(&self.config.toolchain_state_file)
    }

    fn save_state(&self, state: &ToolchainState) -> Result<()> {
        state.save(&self.config.toolchain_state_file)
    }

    /// Installed versions of a component, scanned from disk.
    pub fn list_versions(&self, component: Component) -> Result<Vec<String>> {
        let (dir, prefix) = match component {
            Component::Compiler => (&self.config.toolchain_bin_dir, "gcc-"),
            Component::Kernel => (&self.config.kernel_src_dir, "linux-"),
        };
        let mut versions = Vec::new();
        if !dir.is_dir() {
            return Ok(versions);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(version) = name.strip_prefix(prefix) {
                versions.push(version.to_string());
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Points `cc`, `c++` and `cpp` at the requested compiler version.
    ///
    /// Each symlink is created at a temporary path and renamed over the
    /// target, so a reader never observes a missing link.
    pub fn switch_compiler(&self, version: &str) -> Result<()> {
        let bin_dir = &self.config.toolchain_bin_dir;
        let gcc = bin_dir.join(format!("gcc-{version}"));
        if !gcc.exists() {
            return Err(ToolchainError::UnknownVersion {
                component: "gcc".to_string(),
                version: version.to_string(),
            }
            .into());
        }

        for (link, target) in [
            ("cc", format!("gcc-{version}")),
            ("c++", format!("g++-{version}")),
            ("cpp", format!("cpp-{version}")),
        ] {
            let target_path = bin_dir.join(&target);
            if !target_path.exists() {
                warn!("{} not installed, leaving {link} alone", target_path.display());
                continue;
            }
            atomic_symlink(Path::new(&target), &bin_dir.join(link))?;
        }

        let mut state = self.state()?;
        state.active_profile_mut().gcc_active = Some(version.to_string());
        state.gcc_versions = self.list_versions(Component::Compiler)?;
        state.record(&format!("switch_compiler {version}"));
        self.save_state(&state)?;
        info!("Compiler switched to gcc-{version}");
        Ok(())
    }

    /// Atomically repoints the kernel source/boot symlink.
    pub fn switch_kernel(&self, version: &str) -> Result<()> {
        let src_dir = &self.config.kernel_src_dir;
        let tree = src_dir.join(format!("linux-{version}"));
        if !tree.is_dir() {
            return Err(ToolchainError::UnknownVersion {
                component: "kernel".to_string(),
                version: version.to_string(),
            }
            .into());
        }
        atomic_symlink(Path::new(&format!("linux-{version}")), &src_dir.join("linux"))?;

        let mut state = self.state()?;
        state.active_profile_mut().kernel_active = Some(version.to_string());
        state.kernel_versions = self.list_versions(Component::Kernel)?;
        state.record(&format!("switch_kernel {version}"));
        self.save_state(&state)?;
        info!("Kernel switched to linux-{version}");
        Ok(())
    }

    /// Switches a component and validates the result with a quick
    /// compile-and-execute probe; on failure the previous state (including
    /// symlink targets) is restored before the error surfaces.
    pub fn set_active(&self, component: Component, version: &str) -> Result<()> {
        let saved_state = self.state()?;
        let saved_links = self.current_links()?;
        let transactions = TransactionManager::new(self.config);
        transactions.snapshot_before(
            &[],
            &format!("toolchain_switch_{component}"),
            serde_json::json!({
                "links": saved_links
                    .iter()
                    .map(|(link, target)| {
                        (
                            link.display().to_string(),
                            target.as_ref().map(|t| t.display().to_string()),
                        )
                    })
                    .collect::<Vec<_>>(),
            }),
        )?;

        match component {
            Component::Compiler => self.switch_compiler(version)?,
            Component::Kernel => self.switch_kernel(version)?,
        }

        if component == Component::Compiler {
            if let Err(e) = probes::quick_compile_check(self.config) {
                warn!("Validation failed after switch, restoring: {e:#}");
                self.restore_links(&saved_links)?;
                self.save_state(&saved_state)?;
                return Err(ToolchainError::ValidationFailed {
                    action: format!("set_active {component} {version}"),
                    failed: vec![format!("{e:#}")],
                }
                .into());
            }
        }
        Ok(())
    }

    /// Runs the full validation suite and writes the verification report
    /// next to the toolchain state file.
    pub fn validate(&self) -> Result<ValidationReport> {
        let report = probes::run_suite(self.config)?;
        let path = self.verification_report_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&report)?)?;
        info!(
            "Toolchain validation {}: {:?}",
            if report.ok { "passed" } else { "FAILED" },
            report.results
        );
        Ok(report)
    }

    pub fn verification_report_path(&self) -> PathBuf {
        self.config
            .toolchain_state_file
            .with_file_name("toolchain_verification.json")
    }

    /// Rebuilds outdated toolchain packages in the canonical self-hosting
    /// order (headers, linker, bootstrap compiler, libc, final compiler,
    /// libtool), then runs the validation suite. Any failure restores the
    /// snapshot taken before the rebuild.
    pub fn rebuild_toolchain(&self, jobs: Option<u32>) -> Result<RebuildReport> {
        let transactions = TransactionManager::new(self.config);
        let updates = self.detect_updates(&transactions)?;
        if updates.is_empty() {
            info!("Toolchain is up to date");
            return Ok(RebuildReport::default());
        }

        transactions.snapshot_before(
            &self.config.toolchain_packages,
            "toolchain_rebuild",
            serde_json::json!({ "updates": updates }),
        )?;

        let order = self.rebuild_order(&transactions);
        let mut report = RebuildReport::default();
        for package in order.iter().filter(|p| updates.contains(*p)) {
            let options = UpgradeOptions {
                commit: true,
                resolve_deps: false,
                jobs,
                ..Default::default()
            };
            if let Err(e) = transactions.upgrade(package, &options) {
                warn!("Toolchain rebuild of {package} failed, rolling back: {e:#}");
                transactions.rollback_last(true, false)?;
                report.rolled_back = true;
                return Err(e.context(format!("toolchain rebuild of {package}")));
            }
            report.updated.push(package.clone());
        }

        let mut state = self.state()?;
        state.gcc_versions = self.list_versions(Component::Compiler)?;
        state.kernel_versions = self.list_versions(Component::Kernel)?;
        state.record(&format!("rebuild {}", report.updated.join(",")));
        self.save_state(&state)?;

        let validation = self.validate()?;
        if !validation.ok {
            let failed = validation.failed_probes();
            warn!("Validation failed after rebuild, rolling back: {failed:?}");
            transactions.rollback_last(true, false)?;
            report.rolled_back = true;
            report.validation = Some(validation);
            return Err(ToolchainError::ValidationFailed {
                action: "rebuild_toolchain".to_string(),
                failed,
            }
            .into());
        }
        report.validation = Some(validation);
        Ok(report)
    }

    /// Applies a named profile: active compiler and kernel versions are
    /// switched atomically, with rollback to the previous state if any
    /// switch or validation fails.
    pub fn use_profile(&self, name: &str) -> Result<()> {
        let state = self.state()?;
        let profile = state
            .profiles
            .get(name)
            .ok_or_else(|| ToolchainError::UnknownProfile(name.to_string()))?
            .clone();
        let saved_state = state.clone();
        let saved_links = self.current_links()?;

        let apply = || -> Result<()> {
            if let Some(gcc) = &profile.gcc_active {
                self.set_active(Component::Compiler, gcc)?;
            }
            if let Some(kernel) = &profile.kernel_active {
                self.set_active(Component::Kernel, kernel)?;
            }
            let mut state = self.state()?;
            state.active_profile = name.to_string();
            state.record(&format!("use_profile {name}"));
            self.save_state(&state)?;
            Ok(())
        };

        if let Err(e) = apply() {
            self.restore_links(&saved_links)?;
            self.save_state(&saved_state)?;
            return Err(e.context(format!("applying profile {name}")));
        }
        info!("Profile {name} active");
        Ok(())
    }

    /// Registers (or replaces) a named profile.
    pub fn save_profile(&self, name: &str, profile: Profile) -> Result<()> {
        let mut state = self.state()?;
        state.profiles.insert(name.to_string(), profile);
        self.save_state(&state)
    }

    fn detect_updates(&self, transactions: &TransactionManager) -> Result<Vec<String>> {
        let mut updates = Vec::new();
        for package in &self.config.toolchain_packages {
            let Ok(recipe) = transactions.repo().load(package, None) else {
                warn!("No recipe for toolchain package {package}");
                continue;
            };
            match transactions.db().query(package)? {
                Some(record) if record.version == recipe.version => {}
                _ => updates.push(package.clone()),
            }
        }
        Ok(updates)
    }

    /// The canonical order, unless the resolver can compute a better one
    /// over the toolchain set.
    fn rebuild_order(&self, transactions: &TransactionManager) -> Vec<String> {
        let resolved = (|| -> Result<Vec<String>> {
            let index = resolver::RepoIndex::load_or_build(
                transactions.repo(),
                &self.config.index_file(),
                false,
            )?;
            let mut solver = resolver::DependencyResolver::new(&index, &self.config.lockfile());
            let result = solver
                .resolve_names(&self.config.toolchain_packages, &Default::default())?
                .into_result()?;
            Ok(result.names_in_order())
        })();
        match resolved {
            Ok(order) if !order.is_empty() => {
                // Keep only the declared toolchain set, in resolver order.
                let declared: Vec<String> = order
                    .into_iter()
                    .filter(|name| self.config.toolchain_packages.contains(name))
                    .collect();
                if declared.len() == self.config.toolchain_packages.len() {
                    return declared;
                }
                self.config.toolchain_packages.clone()
            }
            _ => self.config.toolchain_packages.clone(),
        }
    }

    /// The switchable symlinks and their current targets.
    fn current_links(&self) -> Result<Vec<(PathBuf, Option<PathBuf>)>> {
        let mut links = Vec::new();
        for name in ["cc", "c++", "cpp"] {
            let link = self.config.toolchain_bin_dir.join(name);
            links.push((link.clone(), std::fs::read_link(&link).ok()));
        }
        let kernel = self.config.kernel_src_dir.join("linux");
        links.push((kernel.clone(), std::fs::read_link(&kernel).ok()));
        Ok(links)
    }

    fn restore_links(&self, links: &[(PathBuf, Option<PathBuf>)]) -> Result<()> {
        for (link, target) in links {
            match target {
                Some(target) => atomic_symlink(target, link)?,
                None => {
                    let _ = std::fs::remove_file(link);
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn now_ts() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// Replaces `link` with a symlink to `target` using single-step rename
/// semantics.
fn atomic_symlink(target: &Path, link: &Path) -> Result<()> {
    let tmp = link.with_extension("new");
    let _ = std::fs::remove_file(&tmp);
    std::os::unix::fs::symlink(target, &tmp)
        .with_context(|| format!("symlink {} -> {}", tmp.display(), target.display()))?;
    std::fs::rename(&tmp, link)
        .with_context(|| format!("rename over {}", link.display()))?;
    Ok(())
}
