// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Missing-shared-library detection and repair for bootstrapped rootfs
//! trees, backed by the persisted library -> providers index.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    process::Command,
};

use anyhow::{Context, Result};
use builder::{BuildOptions, Builder};
use pkgdb::{InstallOptions, PackageDb};
use recipe::Requirement;
use resolver::{DependencyResolver, RepoIndex, ResolveOptions};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::BootstrapManager;

impl BootstrapManager<'_> {
    /// Rebuilds the library/virtual -> providers index by scanning recipe
    /// provides, and persists it.
    pub fn rebuild_lib_index(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let repo = recipe::Repository::new(&self.config().repo_dir);
        let mut index: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for recipe in repo.scan()? {
            for provided in &recipe.provides {
                let providers = index.entry(provided.clone()).or_default();
                if !providers.contains(&recipe.name) {
                    providers.push(recipe.name.clone());
                }
            }
            index
                .entry(recipe.name.clone())
                .or_default()
                .push(recipe.name.clone());
        }

        let path = self.config().lib_index_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&index)?)?;
        std::fs::rename(&tmp, &path)?;
        info!("Library index rebuilt ({} entries)", index.len());
        Ok(index)
    }

    fn load_lib_index(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let path = self.config().lib_index_file();
        if path.is_file() {
            if let Ok(index) = serde_json::from_str(&std::fs::read_to_string(&path)?) {
                return Ok(index);
            }
            warn!("Library index unreadable, rebuilding");
        }
        self.rebuild_lib_index()
    }

    /// Packages that can provide `lib`, from the persisted index. Falls
    /// back to a substring match for sonames recorded without versions.
    pub fn find_providers(&self, lib: &str) -> Result<Vec<String>> {
        let index = self.load_lib_index()?;
        if let Some(providers) = index.get(lib) {
            return Ok(providers.clone());
        }
        if let Some(providers) = index.get(&format!("{lib}.so")) {
            return Ok(providers.clone());
        }
        let mut out = Vec::new();
        for (name, providers) in &index {
            if name.contains(lib) {
                for provider in providers {
                    if !out.contains(provider) {
                        out.push(provider.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    /// Scans a rootfs for dynamic ELF binaries whose shared libraries do
    /// not resolve. Keys are rootfs-relative paths.
    pub fn detect_missing_libs(&self, rootfs: &Path) -> Result<BTreeMap<String, Vec<String>>> {
        let mut missing = BTreeMap::new();
        for entry in WalkDir::new(rootfs).min_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(rootfs)?.to_path_buf();
            if matches!(
                rel.components().next().map(|c| c.as_os_str().to_string_lossy().into_owned()),
                Some(first) if ["proc", "sys", "dev", "run", "tmp"].contains(&first.as_str())
            ) {
                continue;
            }
            let Ok(data) = std::fs::read(entry.path()) else {
                continue;
            };
            if elf::ElfBytes::<elf::endian::AnyEndian>::minimal_parse(&data).is_err() {
                continue;
            }
            let output = match processes::run_captured(
                Command::new("ldd").arg(entry.path()),
                None,
            ) {
                Ok(output) => output,
                Err(e) => {
                    warn!("ldd unavailable: {e:#}");
                    return Ok(missing);
                }
            };
            let libs: Vec<String> = output
                .stdout
                .lines()
                .chain(output.stderr.lines())
                .filter(|line| line.contains("not found"))
                .filter_map(|line| line.split_whitespace().next())
                .map(String::from)
                .collect();
            if !libs.is_empty() {
                missing.insert(rel.to_string_lossy().into_owned(), libs);
            }
        }
        Ok(missing)
    }

    /// Detects missing shared libraries and schedules their providers
    /// through the resolver, building and installing them into the rootfs.
    pub fn repair_missing_libs(&self, rootfs: &Path) -> Result<BTreeMap<String, String>> {
        let missing = self.detect_missing_libs(rootfs)?;
        let libs: BTreeSet<String> = missing.into_values().flatten().collect();
        self.install_providers_for(rootfs, &libs)
    }

    /// Installs a provider package (plus its dependency closure) into the
    /// rootfs for every library in `libs`. Returns per-library actions.
    pub(crate) fn install_providers_for(
        &self,
        rootfs: &Path,
        libs: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, String>> {
        let mut actions = BTreeMap::new();
        if libs.is_empty() {
            return Ok(actions);
        }

        let repo = recipe::Repository::new(&self.config().repo_dir);
        let index = RepoIndex::load_or_build(&repo, &self.config().index_file(), false)?;
        let rootfs_db = PackageDb::new(&rootfs.join("var/lib/crucible/packages"));
        let build = Builder::new(self.config());

        for lib in libs {
            let providers = self.find_providers(lib)?;
            let Some(provider) = providers.first() else {
                actions.insert(lib.clone(), "provider_not_found".to_string());
                continue;
            };

            let result = (|| -> Result<String> {
                let mut solver = DependencyResolver::new(&index, &self.config().lockfile());
                let roots = vec![Requirement::parse(provider)?];
                let resolved = solver
                    .resolve(&roots, &ResolveOptions::default())?
                    .into_result()?;
                for name in resolved.names_in_order() {
                    let recipe = repo.load(&name, None)?;
                    let mut artifact = build.artifact_path(&recipe.id());
                    if !artifact.is_file() {
                        let options = BuildOptions {
                            resolve_deps: false,
                            ..Default::default()
                        };
                        artifact = build
                            .build(&name, &options)?
                            .artifact
                            .with_context(|| format!("no artifact for {name}"))?;
                    }
                    let mut install = InstallOptions::new(rootfs);
                    install.overwrite = true;
                    install.upgrade = true;
                    rootfs_db.install(&artifact, &install)?;
                }
                Ok(format!("installed:{provider}"))
            })();

            match result {
                Ok(action) => {
                    actions.insert(lib.clone(), action);
                }
                Err(e) => {
                    warn!("Failed to repair {lib}: {e:#}");
                    actions.insert(lib.clone(), format!("failed:{e:#}"));
                }
            }
        }
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use fileutil::ScratchDir;
    use pretty_assertions::assert_eq;

    use crate::BootstrapManager;

    use super::*;
    use config::Config;

    fn fixture() -> Result<(ScratchDir, Config)> {
        let dir = ScratchDir::new("fixture")?;
        let config = Config::rooted_at(dir.path());
        config.ensure_dirs()?;
        Ok((dir, config))
    }

    fn write_recipe(config: &Config, name: &str, body: &str) {
        let pkg_dir = config.repo_dir.join("core").join(name);
        std::fs::create_dir_all(&pkg_dir).unwrap();
        std::fs::write(pkg_dir.join(format!("{name}.meta")), body).unwrap();
    }

    #[test]
    fn lib_index_maps_provides_to_providers() -> Result<()> {
        let (_dir, config) = fixture()?;
        write_recipe(
            &config,
            "openssl",
            "name: openssl\nversion: '3.0'\nsource: http://x/o.tar.gz\nprovides: [libssl.so.3, libcrypto.so.3]\n",
        );
        write_recipe(
            &config,
            "zlib",
            "name: zlib\nversion: '1.3'\nsource: http://x/z.tar.gz\nprovides: [libz.so.1]\n",
        );

        let manager = BootstrapManager::new(&config);
        let index = manager.rebuild_lib_index()?;
        assert_eq!(index["libssl.so.3"], ["openssl"]);
        assert_eq!(index["zlib"], ["zlib"]);
        assert!(config.lib_index_file().is_file());

        assert_eq!(manager.find_providers("libz.so.1")?, ["zlib"]);
        // Fuzzy fallback catches unversioned queries.
        assert_eq!(manager.find_providers("libcrypto")?, ["openssl"]);
        assert!(manager.find_providers("libnothere.so")?.is_empty());
        Ok(())
    }

    #[test]
    fn non_elf_trees_have_no_missing_libs() -> Result<()> {
        let (_dir, config) = fixture()?;
        let manager = BootstrapManager::new(&config);

        let rootfs = config.rootfs_dir.join("r");
        std::fs::create_dir_all(rootfs.join("usr/bin"))?;
        std::fs::write(rootfs.join("usr/bin/script"), "#!/bin/sh\necho hi\n")?;

        assert!(manager.detect_missing_libs(&rootfs)?.is_empty());
        Ok(())
    }

    #[test]
    fn providers_are_installed_into_the_rootfs() -> Result<()> {
        let (_dir, config) = fixture()?;

        // A buildable provider for the missing soname.
        let stage = config.cache_dir.join("src-libfoo");
        std::fs::create_dir_all(stage.join("libfoo-1.0"))?;
        std::fs::write(stage.join("libfoo-1.0/libfoo.so.1"), "not a real so")?;
        let archive = config.cache_dir.join("upstream-libfoo-1.0.tar.gz");
        tarball::create_tarball(&stage, &archive)?;
        write_recipe(
            &config,
            "libfoo",
            &format!(
                r#"name: libfoo
version: "1.0"
source: file://{archive}
provides: [libfoo.so.1]
install:
  - mkdir -p "$DESTDIR/usr/lib"
  - cp libfoo.so.1 "$DESTDIR/usr/lib/libfoo.so.1"
"#,
                archive = archive.display(),
            ),
        );

        let manager = BootstrapManager::new(&config);
        let rootfs = config.rootfs_dir.join("r");
        std::fs::create_dir_all(&rootfs)?;

        let libs = std::collections::BTreeSet::from(["libfoo.so.1".to_string()]);
        let actions = manager.install_providers_for(&rootfs, &libs)?;
        assert_eq!(actions["libfoo.so.1"], "installed:libfoo");
        assert!(rootfs.join("usr/lib/libfoo.so.1").is_file());

        let missing = std::collections::BTreeSet::from(["libghost.so.9".to_string()]);
        let actions = manager.install_providers_for(&rootfs, &missing)?;
        assert_eq!(actions["libghost.so.9"], "provider_not_found");
        Ok(())
    }
}
