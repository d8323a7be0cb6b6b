// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The resolved configuration record consumed by the core.
//!
//! Loading merges an optional YAML file over the defaults; afterwards the
//! core only ever sees the resolved [`Config`] passed around as an injected
//! handle, so tests can root a whole instance at a temporary directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root of the recipe repository (read-only to the core).
    pub repo_dir: PathBuf,
    /// Cache root holding `sources/`, `packages/` and `sandbox/`.
    pub cache_dir: PathBuf,
    /// The package database directory.
    pub pkg_db: PathBuf,
    pub log_dir: PathBuf,
    /// Prefix packages are committed to.
    pub install_root: PathBuf,
    /// Where bootstrap writes rootfs trees.
    pub rootfs_dir: PathBuf,
    /// Persisted toolchain registry.
    pub toolchain_state_file: PathBuf,
    /// Directory scanned for versioned compiler binaries (`gcc-<v>`).
    pub toolchain_bin_dir: PathBuf,
    /// Directory scanned for kernel source trees (`linux-<v>`).
    pub kernel_src_dir: PathBuf,

    /// Parallel build workers for bootstrap.
    pub parallel_workers: usize,
    /// `-j` passed to package builds when the caller does not override it.
    pub build_jobs: u32,
    /// Snapshots kept by the pruning policy.
    pub snapshot_retention: usize,
    pub resolver_max_steps: u64,
    pub resolver_timeout_secs: u64,
    /// Per-step wall clock limit inside the sandbox. None disables it.
    pub step_timeout_secs: Option<u64>,
    /// Virtual memory cap handed to prlimit, e.g. "4G". None disables it.
    pub memory_limit: Option<String>,
    /// CPU seconds cap handed to prlimit. None disables it.
    pub cpu_limit_secs: Option<u64>,

    /// Toolchain package set, in the canonical self-hosting build order.
    pub toolchain_packages: Vec<String>,
    /// Base package set installed into a bootstrapped rootfs.
    pub base_packages: Vec<String>,
    /// Languages whose runtimes are managed (versioned trees + `current`
    /// symlink).
    pub runtimes: Vec<String>,
    /// Where per-user runtime binary symlinks go.
    pub user_bin_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo_dir: "/usr/crucible".into(),
            cache_dir: "/var/cache/crucible".into(),
            pkg_db: "/var/lib/crucible/packages".into(),
            log_dir: "/var/log/crucible".into(),
            install_root: "/usr/local".into(),
            rootfs_dir: "/var/lib/crucible/rootfs".into(),
            toolchain_state_file: "/var/lib/crucible/toolchain.json".into(),
            toolchain_bin_dir: "/usr/bin".into(),
            kernel_src_dir: "/usr/src".into(),
            parallel_workers: 2,
            build_jobs: 4,
            snapshot_retention: 5,
            resolver_max_steps: 20000,
            resolver_timeout_secs: 600,
            step_timeout_secs: None,
            memory_limit: None,
            cpu_limit_secs: None,
            toolchain_packages: [
                "linux-headers",
                "binutils",
                "gcc-pass1",
                "glibc",
                "gcc",
                "libtool",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            base_packages: ["coreutils", "bash", "make", "tar", "xz", "sed", "grep"]
                .into_iter()
                .map(String::from)
                .collect(),
            runtimes: ["python", "ruby", "java", "node", "go", "php", "perl"]
                .into_iter()
                .map(String::from)
                .collect(),
            user_bin_dir: std::env::var_os("HOME")
                .map(|home| Path::new(&home).join(".local/bin"))
                .unwrap_or_else(|| "/usr/local/bin".into()),
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file merged over the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Returns a configuration with every path rooted under `root`.
    ///
    /// This is how tests (and the bootstrap flow) get fully isolated state.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            repo_dir: root.join("repo"),
            cache_dir: root.join("cache"),
            pkg_db: root.join("db/packages"),
            log_dir: root.join("log"),
            install_root: root.join("install"),
            rootfs_dir: root.join("rootfs"),
            toolchain_state_file: root.join("db/toolchain.json"),
            toolchain_bin_dir: root.join("toolchain/bin"),
            kernel_src_dir: root.join("toolchain/src"),
            user_bin_dir: root.join("user/bin"),
            ..Default::default()
        }
    }

    /// Creates the writable directories the core relies on.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.cache_dir,
            &self.pkg_db,
            &self.log_dir,
            &self.packages_dir(),
            &self.sources_dir(),
            &self.sandbox_dir(),
            &self.snapshots_dir(),
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("mkdir {}", dir.display()))?;
        }
        Ok(())
    }

    /// Built artifacts, `<name>-<version>.tar.gz`.
    pub fn packages_dir(&self) -> PathBuf {
        self.cache_dir.join("packages")
    }

    /// Content-addressed download cache.
    pub fn sources_dir(&self) -> PathBuf {
        self.cache_dir.join("sources")
    }

    /// Per-build sandbox roots.
    pub fn sandbox_dir(&self) -> PathBuf {
        self.cache_dir.join("sandbox")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.pkg_db.join("snapshots")
    }

    pub fn rollback_log(&self) -> PathBuf {
        self.pkg_db.join("rollback.log")
    }

    pub fn lockfile(&self) -> PathBuf {
        self.pkg_db.join("dependency.lock.json")
    }

    /// Persisted resolver repository index.
    pub fn index_file(&self) -> PathBuf {
        self.pkg_db.join("dependency_index.json")
    }

    /// Persisted library/virtual -> providers index.
    pub fn lib_index_file(&self) -> PathBuf {
        self.pkg_db.join("lib_index.json")
    }

    /// Bootstrap checkpoints, one marker per completed package.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.pkg_db.join("checkpoints")
    }

    /// Rootfs snapshots and manifests.
    pub fn manifest_dir(&self) -> PathBuf {
        self.pkg_db.join("manifests")
    }

    /// Managed language runtimes, one subtree per language.
    pub fn runtimes_dir(&self) -> PathBuf {
        self.pkg_db.join("runtimes")
    }
}

#[cfg(test)]
mod tests {
    use fileutil::ScratchDir;

    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.parallel_workers, 2);
        assert_eq!(config.snapshot_retention, 5);
        assert_eq!(config.packages_dir(), Path::new("/var/cache/crucible/packages"));
    }

    #[test]
    fn load_merges_over_defaults() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "repo_dir: /srv/recipes\nparallel_workers: 8\n",
        )?;

        let config = Config::load(&path)?;
        assert_eq!(config.repo_dir, Path::new("/srv/recipes"));
        assert_eq!(config.parallel_workers, 8);
        // Untouched fields keep their defaults.
        assert_eq!(config.pkg_db, Path::new("/var/lib/crucible/packages"));
        Ok(())
    }

    #[test]
    fn load_rejects_unknown_fields() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "no_such_option: true\n")?;
        assert!(Config::load(&path).is_err());
        Ok(())
    }

    #[test]
    fn rooted_at_keeps_everything_under_root() {
        let config = Config::rooted_at(Path::new("/tmp/x"));
        for path in [
            &config.repo_dir,
            &config.cache_dir,
            &config.pkg_db,
            &config.rootfs_dir,
            &config.toolchain_state_file,
        ] {
            assert!(path.starts_with("/tmp/x"), "{}", path.display());
        }
    }
}
