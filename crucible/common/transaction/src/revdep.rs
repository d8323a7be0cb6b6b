// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    collections::{BTreeMap, BTreeSet},
    os::unix::fs::PermissionsExt,
    path::Path,
    process::Command,
};

use anyhow::Result;
use recipe::Recipe;
use serde::Serialize;
use tracing::{info, warn};

use crate::{events::RollbackEvent, now_ts, TransactionManager, UpgradeOptions};

/// An executable with unresolvable shared libraries.
#[derive(Clone, Debug, Serialize)]
pub struct BrokenBinary {
    pub file: String,
    pub missing_libs: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct RevdepReport {
    /// Per package: declared dependency names with no installed provider.
    pub missing_deps: BTreeMap<String, Vec<String>>,
    /// Per package: manifest executables with `not found` libraries.
    pub broken_bins: BTreeMap<String, Vec<BrokenBinary>>,
}

impl RevdepReport {
    pub fn affected(&self) -> BTreeSet<String> {
        self.missing_deps
            .keys()
            .chain(self.broken_bins.keys())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default, Serialize)]
pub struct OrphanReport {
    pub candidates: Vec<String>,
    pub removed: Vec<String>,
    pub errors: Vec<(String, String)>,
}

#[derive(Debug, Default, Serialize)]
pub struct RevdepFixReport {
    pub affected: Vec<String>,
    pub fixed: Vec<String>,
    pub errors: Vec<(String, String)>,
}

impl TransactionManager<'_> {
    /// Loads the recipes of all installed packages, skipping ones whose
    /// recipe has left the repository.
    fn installed_recipes(&self) -> Result<BTreeMap<String, Recipe>> {
        let mut out = BTreeMap::new();
        for record in self.db().list_installed()? {
            match self.repo().load(&record.name, None) {
                Ok(recipe) => {
                    out.insert(record.name, recipe);
                }
                Err(_) => {
                    warn!("No recipe for installed package {}", record.name);
                }
            }
        }
        Ok(out)
    }

    /// Packages installed as dependencies that nothing installed requires
    /// anymore. Explicitly installed packages are never orphans.
    pub fn orphan_dry_run(&self) -> Result<Vec<String>> {
        let recipes = self.installed_recipes()?;

        // Which installed package satisfies each dependency name?
        let satisfies = |dep: &str| -> Vec<String> {
            recipes
                .iter()
                .filter(|(name, recipe)| {
                    name.as_str() == dep || recipe.provides.iter().any(|p| p == dep)
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, recipe) in &recipes {
            let mut requirements = recipe.requirements()?;
            requirements.extend(recipe.optional_requirements()?);
            for requirement in requirements {
                for choice in requirement.choices() {
                    for provider in satisfies(&choice.name) {
                        dependents.entry(provider).or_default().insert(name.clone());
                    }
                }
            }
        }

        let mut orphans = Vec::new();
        for record in self.db().list_installed()? {
            if record.explicit {
                continue;
            }
            let has_dependents = dependents
                .get(&record.name)
                .map(|d| !d.is_empty())
                .unwrap_or(false);
            if !has_dependents {
                orphans.push(record.name);
            }
        }
        Ok(orphans)
    }

    /// Removes the orphan set. Individual failures are collected and the
    /// sweep continues past them.
    pub fn remove_orphans(&self, dry_run: bool) -> Result<OrphanReport> {
        let candidates = self.orphan_dry_run()?;
        let mut report = OrphanReport {
            candidates: candidates.clone(),
            ..Default::default()
        };
        if dry_run {
            info!("Orphan dry-run: {}", candidates.join(", "));
            return Ok(report);
        }
        for package in candidates {
            match self.db().remove(&package, false) {
                Ok(true) => {
                    self.append_event(&RollbackEvent::OrphanRemoved {
                        ts: now_ts(),
                        pkg: package.clone(),
                    })?;
                    report.removed.push(package);
                }
                Ok(false) => {
                    report
                        .errors
                        .push((package, "not in the package database".to_string()));
                }
                Err(e) => {
                    report.errors.push((package, format!("{e:#}")));
                }
            }
        }
        Ok(report)
    }

    /// Reports missing declared dependencies and, with `check_ldd`, binaries
    /// whose shared libraries no longer resolve.
    pub fn revdep_check(&self, check_ldd: bool) -> Result<RevdepReport> {
        let recipes = self.installed_recipes()?;
        let mut report = RevdepReport::default();

        for (name, recipe) in &recipes {
            let mut missing = Vec::new();
            let mut requirements = recipe.requirements()?;
            requirements.extend(recipe.optional_requirements()?);
            for requirement in requirements {
                if requirement.optional() {
                    continue;
                }
                let satisfied = requirement.choices().iter().any(|choice| {
                    recipes.iter().any(|(other, r)| {
                        other.as_str() == choice.name
                            || r.provides.iter().any(|p| p == &choice.name)
                    })
                });
                if !satisfied {
                    missing.push(requirement.name().to_string());
                }
            }
            if !missing.is_empty() {
                report.missing_deps.insert(name.clone(), missing);
            }

            if check_ldd {
                let mut broken = Vec::new();
                for path in self.db().manifest_files(name)? {
                    if let Some(missing_libs) = missing_shared_libraries(&path)? {
                        if !missing_libs.is_empty() {
                            broken.push(BrokenBinary {
                                file: path.display().to_string(),
                                missing_libs,
                            });
                        }
                    }
                }
                if !broken.is_empty() {
                    report.broken_bins.insert(name.clone(), broken);
                }
            }
        }
        Ok(report)
    }

    /// Rebuilds and reinstalls every package the revdep check flags, via the
    /// upgrade path.
    pub fn revdep_fix(&self, dry_run: bool, jobs: Option<u32>) -> Result<RevdepFixReport> {
        let check = self.revdep_check(true)?;
        let affected: Vec<String> = check.affected().into_iter().collect();
        let mut report = RevdepFixReport {
            affected: affected.clone(),
            ..Default::default()
        };
        if dry_run {
            return Ok(report);
        }

        for package in affected {
            let options = UpgradeOptions {
                commit: true,
                jobs,
                ..Default::default()
            };
            let result = match self.upgrade(&package, &options) {
                Ok(_) => {
                    report.fixed.push(package.clone());
                    "ok".to_string()
                }
                Err(e) => {
                    report.errors.push((package.clone(), format!("{e:#}")));
                    "failed".to_string()
                }
            };
            self.append_event(&RollbackEvent::RevdepFix {
                ts: now_ts(),
                pkg: package,
                result,
            })?;
        }
        Ok(report)
    }
}

/// Runs the shared-library resolver over `path` if it is an executable ELF
/// dynamic object. Returns None for files ldd has no business with.
fn missing_shared_libraries(path: &Path) -> Result<Option<Vec<String>>> {
    let Ok(metadata) = path.metadata() else {
        return Ok(None);
    };
    if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
        return Ok(None);
    }
    let Ok(data) = std::fs::read(path) else {
        return Ok(None);
    };
    if elf::ElfBytes::<elf::endian::AnyEndian>::minimal_parse(&data).is_err() {
        return Ok(None);
    }

    let output = match processes::run_captured(Command::new("ldd").arg(path), None) {
        Ok(output) => output,
        Err(e) => {
            warn!("ldd unavailable, skipping {}: {e:#}", path.display());
            return Ok(None);
        }
    };
    let missing = output
        .stdout
        .lines()
        .chain(output.stderr.lines())
        .filter(|line| line.contains("not found"))
        .filter_map(|line| line.split_whitespace().next())
        .map(String::from)
        .collect();
    Ok(Some(missing))
}

#[cfg(test)]
mod tests {
    use fileutil::ScratchDir;
    use pretty_assertions::assert_eq;

    use crate::testutil::*;
    use crate::TransactionManager;

    use super::*;
    use config::Config;

    fn fixture() -> Result<(ScratchDir, Config)> {
        let dir = ScratchDir::new("fixture")?;
        let config = Config::rooted_at(dir.path());
        config.ensure_dirs()?;
        Ok((dir, config))
    }

    #[test]
    fn orphans_appear_when_the_dependent_leaves() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = TransactionManager::new(&config);

        write_recipe(
            &config,
            "app",
            "name: app\nversion: '1.0'\nsource: http://x/app.tar.gz\ndependencies: [libaux]\n",
        );
        write_recipe(
            &config,
            "libaux",
            "name: libaux\nversion: '1.0'\nsource: http://x/libaux.tar.gz\n",
        );

        let app = make_artifact(&config, "app", "1.0", &[("usr/bin/app", "x")]);
        let libaux = make_artifact(&config, "libaux", "1.0", &[("usr/lib/libaux.so", "x")]);
        install(&config, manager.db(), &app, true);
        install(&config, manager.db(), &libaux, false);

        assert_eq!(manager.orphan_dry_run()?, Vec::<String>::new());

        manager.db().remove("app", false)?;
        assert_eq!(manager.orphan_dry_run()?, ["libaux"]);

        // Dry-run reports without removing.
        let report = manager.remove_orphans(true)?;
        assert_eq!(report.candidates, ["libaux"]);
        assert!(manager.db().query("libaux")?.is_some());

        let report = manager.remove_orphans(false)?;
        assert_eq!(report.removed, ["libaux"]);
        assert!(manager.db().query("libaux")?.is_none());
        assert!(report.errors.is_empty());
        Ok(())
    }

    #[test]
    fn provides_count_as_dependents() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = TransactionManager::new(&config);

        write_recipe(
            &config,
            "app",
            "name: app\nversion: '1.0'\nsource: http://x/a.tar.gz\ndependencies: [libssl.so.3]\n",
        );
        write_recipe(
            &config,
            "openssl",
            "name: openssl\nversion: '3.0'\nsource: http://x/o.tar.gz\nprovides: [libssl.so.3]\n",
        );

        let app = make_artifact(&config, "app", "1.0", &[("usr/bin/app", "x")]);
        let openssl = make_artifact(&config, "openssl", "3.0", &[("usr/lib/libssl.so.3", "x")]);
        install(&config, manager.db(), &app, true);
        install(&config, manager.db(), &openssl, false);

        // openssl is held by app through the virtual.
        assert_eq!(manager.orphan_dry_run()?, Vec::<String>::new());
        Ok(())
    }

    #[test]
    fn explicit_packages_are_never_orphans() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = TransactionManager::new(&config);

        write_recipe(
            &config,
            "standalone",
            "name: standalone\nversion: '1.0'\nsource: http://x/s.tar.gz\n",
        );
        let artifact = make_artifact(&config, "standalone", "1.0", &[("usr/bin/s", "x")]);
        install(&config, manager.db(), &artifact, true);

        assert_eq!(manager.orphan_dry_run()?, Vec::<String>::new());
        Ok(())
    }

    #[test]
    fn revdep_check_reports_missing_dependencies() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = TransactionManager::new(&config);

        write_recipe(
            &config,
            "app",
            "name: app\nversion: '1.0'\nsource: http://x/a.tar.gz\ndependencies: [libgone]\n",
        );
        let app = make_artifact(&config, "app", "1.0", &[("usr/bin/app", "x")]);
        install(&config, manager.db(), &app, true);

        let report = manager.revdep_check(false)?;
        assert_eq!(report.missing_deps["app"], ["libgone"]);
        assert!(report.broken_bins.is_empty());
        assert_eq!(
            report.affected().into_iter().collect::<Vec<_>>(),
            ["app"]
        );
        Ok(())
    }

    #[test]
    fn revdep_ldd_skips_non_elf_files() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = TransactionManager::new(&config);

        write_recipe(
            &config,
            "scripts",
            "name: scripts\nversion: '1.0'\nsource: http://x/s.tar.gz\n",
        );
        let artifact = make_artifact(
            &config,
            "scripts",
            "1.0",
            &[("usr/bin/tool.sh", "#!/bin/sh\necho ok\n")],
        );
        install(&config, manager.db(), &artifact, true);
        // Mark it executable so only the ELF gate can skip it.
        let tool = config.install_root.join("usr/bin/tool.sh");
        let mut perms = tool.metadata()?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&tool, perms)?;

        let report = manager.revdep_check(true)?;
        assert!(report.broken_bins.is_empty());
        Ok(())
    }

    #[test]
    fn revdep_fix_dry_run_only_plans() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = TransactionManager::new(&config);

        write_recipe(
            &config,
            "app",
            "name: app\nversion: '1.0'\nsource: http://x/a.tar.gz\ndependencies: [libgone]\n",
        );
        let app = make_artifact(&config, "app", "1.0", &[("usr/bin/app", "x")]);
        install(&config, manager.db(), &app, true);

        let report = manager.revdep_fix(true, None)?;
        assert_eq!(report.affected, ["app"]);
        assert!(report.fixed.is_empty());
        Ok(())
    }
}
