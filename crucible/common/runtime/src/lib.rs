// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Managed language runtimes (Python, Ruby, Node, ...): versioned
//! installation trees under the package database, a `current` symlink per
//! language switched atomically, optional per-user binary links, and
//! execute-the-interpreter validation.
//!
//! Layout per language: `<pkg_db>/runtimes/<language>/<version>/bin/...`
//! with `<pkg_db>/runtimes/<language>/current` pointing at the active
//! version.

use std::{
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use builder::{BuildOptions, Builder};
use config::Config;
use fileutil::remove_dir_all_with_chmod;
use serde::Serialize;
use tracing::{info, warn};

const CURRENT_LINK: &str = "current";
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("language {0} is not managed; add it to the runtimes config")]
    UnknownLanguage(String),
    #[error("{language} {version} is not installed")]
    UnknownVersion { language: String, version: String },
}

/// One installed runtime version with its health and default flag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RuntimeStatus {
    pub version: String,
    pub ok: bool,
    pub default: bool,
}

/// Full per-language diagnosis.
#[derive(Debug, Serialize)]
pub struct RuntimeDiagnosis {
    pub language: String,
    pub default: Option<String>,
    pub versions: Vec<RuntimeStatus>,
}

pub struct RuntimeManager<'a> {
    config: &'a Config,
}

impl<'a> RuntimeManager<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// The languages this instance manages.
    pub fn languages(&self) -> &[String] {
        &self.config.runtimes
    }

    fn base_dir(&self, language: &str) -> Result<PathBuf> {
        if !self.config.runtimes.iter().any(|l| l == language) {
            return Err(RuntimeError::UnknownLanguage(language.to_string()).into());
        }
        Ok(self.config.runtimes_dir().join(language))
    }

    fn version_dir(&self, language: &str, version: &str) -> Result<PathBuf> {
        Ok(self.base_dir(language)?.join(version))
    }

    /// Interpreter names worth probing for a language, most specific first.
    fn binary_candidates(language: &str) -> Vec<String> {
        match language {
            "python" => vec!["python3".to_string(), "python".to_string()],
            other => vec![other.to_string()],
        }
    }

    /// Installed versions of a language, sorted.
    pub fn list_runtimes(&self, language: &str) -> Result<Vec<String>> {
        let base = self.base_dir(language)?;
        let mut versions = Vec::new();
        if !base.is_dir() {
            return Ok(versions);
        }
        for entry in std::fs::read_dir(&base)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == CURRENT_LINK || !entry.path().is_dir() {
                continue;
            }
            // `current` resolves to a version dir; only count real dirs.
            if entry.path().symlink_metadata()?.is_symlink() {
                continue;
            }
            versions.push(name);
        }
        versions.sort();
        Ok(versions)
    }

    /// Installed versions with health and default status.
    pub fn list_runtimes_detailed(&self, language: &str) -> Result<Vec<RuntimeStatus>> {
        let default = self.default_version(language)?;
        let mut out = Vec::new();
        for version in self.list_runtimes(language)? {
            let ok = self.validate_runtime(language, &version)?;
            out.push(RuntimeStatus {
                default: default.as_deref() == Some(version.as_str()),
                version,
                ok,
            });
        }
        Ok(out)
    }

    /// Builds the language's recipe and unpacks the artifact as a new
    /// version tree. The repository must offer exactly the requested
    /// version.
    pub fn install_runtime(&self, language: &str, version: &str) -> Result<()> {
        let target = self.version_dir(language, version)?;
        let build = Builder::new(self.config);
        let recipe = build.repo().load(language, None)?;
        if recipe.version != version {
            bail!(
                "repository offers {language} {}, not {version}",
                recipe.version
            );
        }

        let options = BuildOptions {
            resolve_deps: false,
            ..Default::default()
        };
        let product = build.build(language, &options)?;
        let artifact = product
            .artifact
            .with_context(|| format!("no artifact produced for {language}"))?;

        if target.exists() {
            remove_dir_all_with_chmod(&target)?;
        }
        std::fs::create_dir_all(&target)?;
        tarball::extract_tarball(&artifact, &target)
            .with_context(|| format!("unpack {language} {version}"))?;
        info!("Installed runtime {language} {version}");
        Ok(())
    }

    /// Points the language's `current` symlink at a version. With `user`,
    /// also links every binary of the version into the user bin dir.
    ///
    /// A stale `current` (broken link, or a directory left by older tools)
    /// is repaired in passing.
    pub fn set_default(&self, language: &str, version: &str, user: bool) -> Result<()> {
        let base = self.base_dir(language)?;
        if !self.list_runtimes(language)?.iter().any(|v| v == version) {
            return Err(RuntimeError::UnknownVersion {
                language: language.to_string(),
                version: version.to_string(),
            }
            .into());
        }

        let current = base.join(CURRENT_LINK);
        if current.symlink_metadata().is_ok() && !current.symlink_metadata()?.is_symlink() {
            // Conflict: something square sits where the link belongs.
            warn!("Replacing non-symlink {} with a link", current.display());
            remove_dir_all_with_chmod(&current)?;
        }
        switch_link(Path::new(version), &current)?;

        if user {
            let bin_dir = base.join(version).join("bin");
            std::fs::create_dir_all(&self.config.user_bin_dir)?;
            if bin_dir.is_dir() {
                for entry in std::fs::read_dir(&bin_dir)? {
                    let entry = entry?;
                    let link = self.config.user_bin_dir.join(entry.file_name());
                    switch_link(&entry.path(), &link)?;
                }
            }
        }

        info!(
            "{language} {version} is now the {} default",
            if user { "user" } else { "global" }
        );
        Ok(())
    }

    /// Deletes a version tree. If it was the default, the `current` link is
    /// dropped too. Returns false if the version was not installed.
    pub fn remove_runtime(&self, language: &str, version: &str) -> Result<bool> {
        let target = self.version_dir(language, version)?;
        if !target.is_dir() {
            warn!("{language} {version} is not installed");
            return Ok(false);
        }
        let was_default = self.default_version(language)?.as_deref() == Some(version);
        remove_dir_all_with_chmod(&target)?;
        if was_default {
            let _ = std::fs::remove_file(self.base_dir(language)?.join(CURRENT_LINK));
        }
        info!("Removed runtime {language} {version}");
        Ok(true)
    }

    /// The version `current` points at, if any.
    pub fn default_version(&self, language: &str) -> Result<Option<String>> {
        let current = self.base_dir(language)?.join(CURRENT_LINK);
        match std::fs::read_link(&current) {
            Ok(target) => Ok(target
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())),
            Err(_) => Ok(None),
        }
    }

    /// Executes the runtime's interpreter with `--version`; a runtime only
    /// counts as healthy if the binary actually runs.
    pub fn validate_runtime(&self, language: &str, version: &str) -> Result<bool> {
        let bin_dir = self.version_dir(language, version)?.join("bin");
        if !bin_dir.is_dir() {
            return Ok(false);
        }
        for candidate in Self::binary_candidates(language) {
            let binary = bin_dir.join(&candidate);
            if !binary.is_file() {
                continue;
            }
            match processes::run_captured(
                Command::new(&binary).arg("--version"),
                Some(VALIDATE_TIMEOUT),
            ) {
                Ok(output) if output.success() => {
                    info!(
                        "{language} {version} OK: {}",
                        output.stdout.trim().lines().next().unwrap_or_default()
                    );
                    return Ok(true);
                }
                Ok(_) => {}
                Err(e) => warn!("Validating {language} {version}: {e:#}"),
            }
        }
        Ok(false)
    }

    /// Revalidates every installed version, reinstalling broken ones from
    /// their recipes and dropping a dangling `current` link. Returns the
    /// action taken per version.
    pub fn repair_runtime(&self, language: &str) -> Result<Vec<(String, String)>> {
        let mut actions = Vec::new();

        // A default pointing at a version that no longer exists is itself a
        // breakage worth fixing.
        if let Some(default) = self.default_version(language)? {
            if !self.version_dir(language, &default)?.is_dir() {
                let _ = std::fs::remove_file(self.base_dir(language)?.join(CURRENT_LINK));
                actions.push((default, "dropped_dangling_default".to_string()));
            }
        }

        for version in self.list_runtimes(language)? {
            if self.validate_runtime(language, &version)? {
                actions.push((version, "ok".to_string()));
                continue;
            }
            warn!("{language} {version} is broken, reinstalling");
            match self.install_runtime(language, &version) {
                Ok(()) => actions.push((version, "reinstalled".to_string())),
                Err(e) => actions.push((version, format!("failed:{e:#}"))),
            }
        }
        Ok(actions)
    }

    /// Full diagnosis of one language.
    pub fn diagnose(&self, language: &str) -> Result<RuntimeDiagnosis> {
        Ok(RuntimeDiagnosis {
            language: language.to_string(),
            default: self.default_version(language)?,
            versions: self.list_runtimes_detailed(language)?,
        })
    }
}

/// Replaces `link` with a symlink to `target` via a temporary name and
/// rename, so readers never observe a missing link.
fn switch_link(target: &Path, link: &Path) -> Result<()> {
    let tmp = link.with_extension("new");
    let _ = std::fs::remove_file(&tmp);
    std::os::unix::fs::symlink(target, &tmp)
        .with_context(|| format!("symlink {} -> {}", tmp.display(), target.display()))?;
    std::fs::rename(&tmp, link).with_context(|| format!("rename over {}", link.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use fileutil::ScratchDir;
    use pretty_assertions::assert_eq;

    use super::*;

    fn fixture() -> Result<(ScratchDir, Config)> {
        let dir = ScratchDir::new("fixture")?;
        let mut config = Config::rooted_at(dir.path());
        config.runtimes = vec!["duck".to_string(), "python".to_string()];
        config.ensure_dirs()?;
        Ok((dir, config))
    }

    /// Drops a fake runtime version on disk: `<base>/<version>/bin/<name>`
    /// is a shell script whose `--version` succeeds (or fails).
    fn stub_runtime(config: &Config, language: &str, version: &str, healthy: bool) {
        let bin_dir = config
            .runtimes_dir()
            .join(language)
            .join(version)
            .join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let body = if healthy {
            format!("#!/bin/sh\necho {language} {version}\n")
        } else {
            "#!/bin/sh\nexit 1\n".to_string()
        };
        let binary = bin_dir.join(language);
        std::fs::write(&binary, body).unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn unmanaged_languages_are_rejected() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = RuntimeManager::new(&config);
        let err = manager.list_runtimes("fortran").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::UnknownLanguage(_))
        ));
        Ok(())
    }

    #[test]
    fn lists_installed_versions() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = RuntimeManager::new(&config);

        assert!(manager.list_runtimes("duck")?.is_empty());
        stub_runtime(&config, "duck", "1.0", true);
        stub_runtime(&config, "duck", "2.0", true);
        assert_eq!(manager.list_runtimes("duck")?, ["1.0", "2.0"]);
        Ok(())
    }

    #[test]
    fn set_default_switches_the_current_link() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = RuntimeManager::new(&config);
        stub_runtime(&config, "duck", "1.0", true);
        stub_runtime(&config, "duck", "2.0", true);

        manager.set_default("duck", "1.0", false)?;
        assert_eq!(manager.default_version("duck")?.as_deref(), Some("1.0"));

        // Switching replaces the link in place; `current` never counts as a
        // version.
        manager.set_default("duck", "2.0", false)?;
        assert_eq!(manager.default_version("duck")?.as_deref(), Some("2.0"));
        assert_eq!(manager.list_runtimes("duck")?, ["1.0", "2.0"]);

        let err = manager.set_default("duck", "9.9", false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::UnknownVersion { .. })
        ));
        Ok(())
    }

    #[test]
    fn user_default_links_the_binaries() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = RuntimeManager::new(&config);
        stub_runtime(&config, "duck", "1.0", true);

        manager.set_default("duck", "1.0", true)?;
        let link = config.user_bin_dir.join("duck");
        assert_eq!(
            std::fs::read_link(&link)?,
            config.runtimes_dir().join("duck/1.0/bin/duck")
        );

        // Re-pointing the user default replaces the existing link.
        stub_runtime(&config, "duck", "2.0", true);
        manager.set_default("duck", "2.0", true)?;
        assert_eq!(
            std::fs::read_link(&link)?,
            config.runtimes_dir().join("duck/2.0/bin/duck")
        );
        Ok(())
    }

    #[test]
    fn validation_executes_the_interpreter() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = RuntimeManager::new(&config);
        stub_runtime(&config, "duck", "1.0", true);
        stub_runtime(&config, "duck", "2.0", false);

        assert!(manager.validate_runtime("duck", "1.0")?);
        assert!(!manager.validate_runtime("duck", "2.0")?);
        assert!(!manager.validate_runtime("duck", "9.9")?);
        Ok(())
    }

    #[test]
    fn python_probes_fall_back_across_candidates() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = RuntimeManager::new(&config);

        // Only `python3` exists, not `python`; validation still passes.
        let bin_dir = config.runtimes_dir().join("python/3.11/bin");
        std::fs::create_dir_all(&bin_dir)?;
        let binary = bin_dir.join("python3");
        std::fs::write(&binary, "#!/bin/sh\necho Python 3.11\n")?;
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755))?;

        assert!(manager.validate_runtime("python", "3.11")?);
        Ok(())
    }

    #[test]
    fn diagnose_reports_health_and_default() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = RuntimeManager::new(&config);
        stub_runtime(&config, "duck", "1.0", true);
        stub_runtime(&config, "duck", "2.0", false);
        manager.set_default("duck", "1.0", false)?;

        let diagnosis = manager.diagnose("duck")?;
        assert_eq!(diagnosis.default.as_deref(), Some("1.0"));
        assert_eq!(
            diagnosis.versions,
            vec![
                RuntimeStatus {
                    version: "1.0".to_string(),
                    ok: true,
                    default: true,
                },
                RuntimeStatus {
                    version: "2.0".to_string(),
                    ok: false,
                    default: false,
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn remove_drops_the_tree_and_a_default_pointing_at_it() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = RuntimeManager::new(&config);
        stub_runtime(&config, "duck", "1.0", true);
        manager.set_default("duck", "1.0", false)?;

        assert!(manager.remove_runtime("duck", "1.0")?);
        assert!(manager.list_runtimes("duck")?.is_empty());
        assert_eq!(manager.default_version("duck")?, None);

        assert!(!manager.remove_runtime("duck", "1.0")?);
        Ok(())
    }

    #[test]
    fn install_builds_from_the_recipe() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = RuntimeManager::new(&config);

        // A buildable recipe whose install step lays out a prefix-shaped
        // runtime tree.
        let stage = config.cache_dir.join("src-duck");
        std::fs::create_dir_all(stage.join("duck-1.1"))?;
        std::fs::write(
            stage.join("duck-1.1/duck.sh"),
            "#!/bin/sh\necho duck 1.1\n",
        )?;
        let archive = config.cache_dir.join("upstream-duck-1.1.tar.gz");
        tarball::create_tarball(&stage, &archive)?;

        let pkg_dir = config.repo_dir.join("lang/duck");
        std::fs::create_dir_all(&pkg_dir)?;
        std::fs::write(
            pkg_dir.join("duck.meta"),
            format!(
                r#"name: duck
version: "1.1"
source: file://{archive}
install:
  - mkdir -p "$DESTDIR/bin"
  - cp duck.sh "$DESTDIR/bin/duck"
  - chmod 755 "$DESTDIR/bin/duck"
"#,
                archive = archive.display(),
            ),
        )?;

        manager.install_runtime("duck", "1.1")?;
        assert!(config
            .runtimes_dir()
            .join("duck/1.1/bin/duck")
            .is_file());
        assert!(manager.validate_runtime("duck", "1.1")?);

        // The repository only offers 1.1.
        assert!(manager.install_runtime("duck", "0.9").is_err());
        Ok(())
    }

    #[test]
    fn repair_reports_broken_versions_and_dangling_defaults() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = RuntimeManager::new(&config);
        stub_runtime(&config, "duck", "1.0", true);
        stub_runtime(&config, "duck", "2.0", false);

        // A default left pointing at a version that was deleted by hand.
        std::os::unix::fs::symlink(
            "9.9",
            config.runtimes_dir().join("duck").join(CURRENT_LINK),
        )?;

        let actions = manager.repair_runtime("duck")?;
        assert!(actions.contains(&("9.9".to_string(), "dropped_dangling_default".to_string())));
        assert!(actions.contains(&("1.0".to_string(), "ok".to_string())));
        // 2.0 has no recipe to rebuild from, so the repair is reported as
        // failed rather than silently dropped.
        assert!(
            actions
                .iter()
                .any(|(v, a)| v == "2.0" && a.starts_with("failed:")),
            "{actions:?}"
        );
        assert_eq!(manager.default_version("duck")?, None);
        Ok(())
    }
}
