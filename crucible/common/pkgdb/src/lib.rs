// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The installed-package database.
//!
//! Each installed package is represented by `<name>.installed.meta` (a JSON
//! record) and `<name>.manifest.txt` (one absolute path per line, in
//! extraction order). The manifest is the sole authoritative record of file
//! ownership.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use version::Version;

pub const ARTIFACT_SUFFIX: &str = ".tar.gz";

#[derive(thiserror::Error, Debug)]
pub enum PkgDbError {
    #[error("package {0} is already installed")]
    AlreadyInstalled(String),
    #[error("package {0} is not installed")]
    NotInstalled(String),
    #[error("integrity failure for {name}: {reason}")]
    IntegrityFailed { name: String, reason: String },
    #[error("another operation on {0} is in progress")]
    Busy(String),
}

/// Per-package writer lock. Mutations of the same package name are
/// serialized; a concurrent attempt is rejected, not queued.
struct NameLock {
    path: PathBuf,
}

impl NameLock {
    fn acquire(db_dir: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(db_dir)?;
        let path = db_dir.join(format!("{name}.lock"));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(PkgDbError::Busy(name.to_string()).into())
            }
            Err(e) => Err(e).with_context(|| format!("lock {}", path.display())),
        }
    }
}

impl Drop for NameLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// The persisted record of one installed package.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledRecord {
    pub name: String,
    pub version: String,
    pub artifact: PathBuf,
    pub sha256: String,
    pub install_root: PathBuf,
    pub manifest: PathBuf,
    #[serde(default)]
    pub explicit: bool,
}

#[derive(Clone, Debug)]
pub struct InstallOptions {
    pub dest_root: PathBuf,
    pub overwrite: bool,
    pub upgrade: bool,
    /// Marks the package as explicitly requested (not an auto-dependency),
    /// which exempts it from orphan collection.
    pub explicit: bool,
}

impl InstallOptions {
    pub fn new(dest_root: &Path) -> Self {
        Self {
            dest_root: dest_root.to_path_buf(),
            overwrite: false,
            upgrade: false,
            explicit: false,
        }
    }
}

/// Splits `<name>-<version>.tar.gz` into its parts.
pub fn parse_artifact_name(artifact: &Path) -> Result<(String, Version)> {
    let file_name = artifact
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("bad artifact path {}", artifact.display()))?;
    let stem = file_name
        .strip_suffix(ARTIFACT_SUFFIX)
        .with_context(|| format!("artifact {file_name} is not a {ARTIFACT_SUFFIX}"))?;
    let (name, version) = Version::from_str_suffix(stem)?;
    Ok((name.to_string(), version))
}

/// Handle to a package database directory.
#[derive(Clone, Debug)]
pub struct PackageDb {
    db_dir: PathBuf,
}

impl PackageDb {
    pub fn new(db_dir: &Path) -> Self {
        Self {
            db_dir: db_dir.to_path_buf(),
        }
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.db_dir.join(format!("{name}.installed.meta"))
    }

    pub fn manifest_path(&self, name: &str) -> PathBuf {
        self.db_dir.join(format!("{name}.manifest.txt"))
    }

    fn ownership_path(&self, name: &str) -> PathBuf {
        self.db_dir.join(format!("{name}.ownership.json"))
    }

    /// Extracts an artifact into `dest_root` and registers the package.
    ///
    /// Extraction is recoverable: the manifest is written only after the
    /// archive extracted completely, and a mid-stream failure unlinks
    /// everything the call created before the error propagates.
    pub fn install(&self, artifact: &Path, options: &InstallOptions) -> Result<InstalledRecord> {
        let (name, version) = parse_artifact_name(artifact)?;
        let _lock = NameLock::acquire(&self.db_dir, &name)?;

        if let Some(existing) = self.query(&name)? {
            if options.upgrade {
                info!(
                    "Upgrading {} {} -> {}",
                    name, existing.version, version
                );
                self.remove_locked(&name, false)?;
            } else if !options.overwrite {
                return Err(PkgDbError::AlreadyInstalled(name).into());
            }
        }

        let sha256 = tarball::sha256_file(artifact)?;
        std::fs::create_dir_all(&options.dest_root)?;
        let extraction = tarball::extract_tarball(artifact, &options.dest_root)
            .with_context(|| format!("install {name}"))?;

        std::fs::create_dir_all(&self.db_dir)?;
        let manifest_path = self.manifest_path(&name);
        let mut manifest = String::new();
        for path in &extraction.files {
            manifest.push_str(&path.to_string_lossy());
            manifest.push('\n');
        }
        std::fs::write(&manifest_path, manifest)?;

        if extraction.ownership.is_empty() {
            let _ = std::fs::remove_file(self.ownership_path(&name));
        } else {
            // Unprivileged install: record the ownership the artifact wanted
            // so a privileged post-step can apply it.
            std::fs::write(
                self.ownership_path(&name),
                serde_json::to_string_pretty(&extraction.ownership)?,
            )?;
        }

        let record = InstalledRecord {
            name: name.clone(),
            version: version.to_string(),
            artifact: artifact.to_path_buf(),
            sha256,
            install_root: options.dest_root.clone(),
            manifest: manifest_path,
            explicit: options.explicit,
        };
        self.write_record(&record)?;
        info!("Installed {} {}", record.name, record.version);
        Ok(record)
    }

    /// Writes (or replaces) an installed record with a full-file rename.
    pub fn write_record(&self, record: &InstalledRecord) -> Result<()> {
        std::fs::create_dir_all(&self.db_dir)?;
        let path = self.record_path(&record.name);
        let tmp = path.with_extension("meta.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(record)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Unlinks every manifest path and deletes the package's records.
    /// Returns false if the package was not installed.
    pub fn remove(&self, name: &str, purge: bool) -> Result<bool> {
        let _lock = NameLock::acquire(&self.db_dir, name)?;
        self.remove_locked(name, purge)
    }

    fn remove_locked(&self, name: &str, purge: bool) -> Result<bool> {
        let Some(record) = self.query(name)? else {
            warn!("Package {name} not found in the package database");
            return Ok(false);
        };

        for path in self.manifest_files(name)? {
            match path.symlink_metadata() {
                Err(_) => continue,
                Ok(meta) if meta.is_dir() => {
                    if purge {
                        remove_tree(&path)?;
                    }
                }
                Ok(_) => {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("unlink {}", path.display()))?;
                }
            }
        }

        let _ = std::fs::remove_file(&record.manifest);
        let _ = std::fs::remove_file(self.ownership_path(name));
        std::fs::remove_file(self.record_path(name))?;
        info!("Removed {name} from the package database");
        Ok(true)
    }

    /// Reads the ordered manifest of a package.
    pub fn manifest_files(&self, name: &str) -> Result<Vec<PathBuf>> {
        let path = self.manifest_path(name);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        Ok(content
            .lines()
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    pub fn query(&self, name: &str) -> Result<Option<InstalledRecord>> {
        let path = self.record_path(name);
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        let record = serde_json::from_str(&content)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(record))
    }

    /// All installed records, ordered by name.
    pub fn list_installed(&self) -> Result<Vec<InstalledRecord>> {
        let mut out = Vec::new();
        if !self.db_dir.is_dir() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(&self.db_dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(name) = file_name.strip_suffix(".installed.meta") {
                if let Some(record) = self.query(name)? {
                    out.push(record);
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Substring search over installed package names.
    pub fn search_installed(&self, pattern: &str) -> Result<Vec<InstalledRecord>> {
        Ok(self
            .list_installed()?
            .into_iter()
            .filter(|r| r.name.contains(pattern))
            .collect())
    }

    /// Checks artifact existence and hash; with `deep`, also that every
    /// manifest entry exists. Returns the list of problems found.
    pub fn verify(&self, name: &str, deep: bool) -> Result<Vec<String>> {
        let record = self
            .query(name)?
            .ok_or_else(|| PkgDbError::NotInstalled(name.to_string()))?;

        let mut issues = Vec::new();
        if !record.artifact.is_file() {
            issues.push(format!("missing_artifact:{}", record.artifact.display()));
        } else {
            let actual = tarball::sha256_file(&record.artifact)?;
            if actual != record.sha256 {
                issues.push(format!(
                    "sha256_mismatch:expected={},got={}",
                    record.sha256, actual
                ));
            }
        }

        if deep {
            for path in self.manifest_files(name)? {
                match path.symlink_metadata() {
                    Err(_) => issues.push(format!("missing_file:{}", path.display())),
                    Ok(meta) if meta.is_symlink() && !path.exists() => {
                        issues.push(format!("broken_symlink:{}", path.display()));
                    }
                    Ok(_) => {}
                }
            }
        }
        Ok(issues)
    }

    /// Re-extracts any missing manifest entries from the artifact.
    ///
    /// Fails with [`PkgDbError::IntegrityFailed`] if the artifact is gone or
    /// no longer matches its recorded hash; nothing is mutated in that case.
    pub fn repair(&self, name: &str) -> Result<Vec<PathBuf>> {
        let record = self
            .query(name)?
            .ok_or_else(|| PkgDbError::NotInstalled(name.to_string()))?;

        if !record.artifact.is_file() {
            return Err(PkgDbError::IntegrityFailed {
                name: name.to_string(),
                reason: format!("artifact {} is missing", record.artifact.display()),
            }
            .into());
        }
        let actual = tarball::sha256_file(&record.artifact)?;
        if actual != record.sha256 {
            return Err(PkgDbError::IntegrityFailed {
                name: name.to_string(),
                reason: format!("artifact hash {actual} != recorded {}", record.sha256),
            }
            .into());
        }

        let mut want = HashSet::new();
        for path in self.manifest_files(name)? {
            if path.symlink_metadata().is_err() {
                if let Ok(rel) = path.strip_prefix(&record.install_root) {
                    want.insert(rel.to_path_buf());
                }
            }
        }
        if want.is_empty() {
            return Ok(Vec::new());
        }

        let extraction = tarball::extract_entries(&record.artifact, &record.install_root, &want)?;
        info!("Repaired {} files of {name}", extraction.files.len());
        Ok(extraction.files)
    }

    /// Installed packages whose recipes depend on `name` (by any dependency
    /// choice, mandatory or optional).
    pub fn who_requires(&self, name: &str, repo: &recipe::Repository) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for record in self.list_installed()? {
            let Ok(r) = repo.load(&record.name, None) else {
                continue;
            };
            let mut requirements = r.requirements()?;
            requirements.extend(r.optional_requirements()?);
            if requirements
                .iter()
                .flat_map(|req| req.choices())
                .any(|choice| choice.name == name)
            {
                out.push(record.name);
            }
        }
        Ok(out)
    }

    /// Installed packages whose recipes provide `virtual_name`.
    pub fn what_provides(&self, virtual_name: &str, repo: &recipe::Repository) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for record in self.list_installed()? {
            let Ok(r) = repo.load(&record.name, None) else {
                continue;
            };
            if r.provides.iter().any(|p| p == virtual_name) {
                out.push(record.name);
            }
        }
        Ok(out)
    }
}

fn remove_tree(path: &Path) -> Result<()> {
    std::fs::remove_dir_all(path).with_context(|| format!("rm -rf {}", path.display()))
}

#[cfg(test)]
mod tests {
    use fileutil::ScratchDir;
    use pretty_assertions::assert_eq;

    use super::*;

    /// Builds a `<name>-<version>.tar.gz` artifact whose tree contains the
    /// given relative files.
    fn make_artifact(dir: &Path, name: &str, version: &str, files: &[(&str, &str)]) -> PathBuf {
        let stage = dir.join(format!("stage-{name}-{version}"));
        for (rel, content) in files {
            let path = stage.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        let artifact = dir.join(format!("{name}-{version}.tar.gz"));
        tarball::create_tarball(&stage, &artifact).unwrap();
        artifact
    }

    #[test]
    fn parses_artifact_names() -> Result<()> {
        let (name, version) = parse_artifact_name(Path::new("/x/linux-headers-6.1.8.tar.gz"))?;
        assert_eq!(name, "linux-headers");
        assert_eq!(version.to_string(), "6.1.8");
        assert!(parse_artifact_name(Path::new("/x/hello.zip")).is_err());
        Ok(())
    }

    #[test]
    fn install_then_remove_round_trips() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let db = PackageDb::new(&dir.path().join("db"));
        let dest = dir.path().join("root");
        let artifact = make_artifact(
            dir.path(),
            "hello",
            "1.0",
            &[("usr/bin/hello", "bin"), ("etc/hello.conf", "conf")],
        );

        let record = db.install(&artifact, &InstallOptions::new(&dest))?;
        assert_eq!(record.name, "hello");
        assert_eq!(record.version, "1.0");
        assert!(dest.join("usr/bin/hello").is_file());
        assert!(db.record_path("hello").is_file());

        let files = db.manifest_files("hello")?;
        assert_eq!(files.len(), 2);
        assert!(files.contains(&dest.join("usr/bin/hello")));

        assert!(db.remove("hello", false)?);
        assert!(db.query("hello")?.is_none());
        for path in files {
            assert!(!path.try_exists()?, "{} survived removal", path.display());
        }
        assert!(!db.manifest_path("hello").try_exists()?);

        // Removing again is a no-op.
        assert!(!db.remove("hello", false)?);
        Ok(())
    }

    #[test]
    fn double_install_requires_a_flag() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let db = PackageDb::new(&dir.path().join("db"));
        let dest = dir.path().join("root");
        let artifact = make_artifact(dir.path(), "hello", "1.0", &[("usr/bin/hello", "bin")]);

        db.install(&artifact, &InstallOptions::new(&dest))?;
        let err = db.install(&artifact, &InstallOptions::new(&dest)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PkgDbError>(),
            Some(PkgDbError::AlreadyInstalled(_))
        ));

        let mut options = InstallOptions::new(&dest);
        options.overwrite = true;
        db.install(&artifact, &options)?;
        Ok(())
    }

    #[test]
    fn upgrade_replaces_the_old_file_set() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let db = PackageDb::new(&dir.path().join("db"));
        let dest = dir.path().join("root");

        let v1 = make_artifact(
            dir.path(),
            "app",
            "1.0",
            &[("usr/bin/app", "v1"), ("usr/share/app/old.dat", "old")],
        );
        db.install(&v1, &InstallOptions::new(&dest))?;

        let v2 = make_artifact(
            dir.path(),
            "app",
            "2.0",
            &[("usr/bin/app", "v2"), ("usr/share/app/new.dat", "new")],
        );
        let mut options = InstallOptions::new(&dest);
        options.upgrade = true;
        let record = db.install(&v2, &options)?;

        assert_eq!(record.version, "2.0");
        assert_eq!(std::fs::read_to_string(dest.join("usr/bin/app"))?, "v2");
        // No orphan file from v1 remains.
        assert!(!dest.join("usr/share/app/old.dat").try_exists()?);
        assert!(dest.join("usr/share/app/new.dat").is_file());

        let files = db.manifest_files("app")?;
        assert!(!files.contains(&dest.join("usr/share/app/old.dat")));
        Ok(())
    }

    #[test]
    fn manifests_of_two_packages_are_disjoint() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let db = PackageDb::new(&dir.path().join("db"));
        let dest = dir.path().join("root");

        let a = make_artifact(dir.path(), "aa", "1.0", &[("usr/bin/aa", "a")]);
        let b = make_artifact(dir.path(), "bb", "1.0", &[("usr/bin/bb", "b")]);
        db.install(&a, &InstallOptions::new(&dest))?;
        db.install(&b, &InstallOptions::new(&dest))?;

        let set_a: HashSet<PathBuf> = db.manifest_files("aa")?.into_iter().collect();
        let set_b: HashSet<PathBuf> = db.manifest_files("bb")?.into_iter().collect();
        assert!(set_a.is_disjoint(&set_b));
        Ok(())
    }

    #[test]
    fn verify_detects_tampering() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let db = PackageDb::new(&dir.path().join("db"));
        let dest = dir.path().join("root");
        let artifact = make_artifact(dir.path(), "hello", "1.0", &[("usr/bin/hello", "bin")]);
        db.install(&artifact, &InstallOptions::new(&dest))?;

        assert!(db.verify("hello", true)?.is_empty());

        std::fs::remove_file(dest.join("usr/bin/hello"))?;
        let issues = db.verify("hello", true)?;
        assert_eq!(issues.len(), 1);
        assert!(issues[0].starts_with("missing_file:"), "{issues:?}");

        // Shallow verification does not look at manifest entries.
        assert!(db.verify("hello", false)?.is_empty());

        std::fs::write(&artifact, "tampered")?;
        let issues = db.verify("hello", false)?;
        assert!(issues[0].starts_with("sha256_mismatch:"), "{issues:?}");
        Ok(())
    }

    #[test]
    fn repair_restores_missing_files() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let db = PackageDb::new(&dir.path().join("db"));
        let dest = dir.path().join("root");
        let artifact = make_artifact(
            dir.path(),
            "hello",
            "1.0",
            &[("usr/bin/hello", "bin"), ("etc/hello.conf", "conf")],
        );
        db.install(&artifact, &InstallOptions::new(&dest))?;

        std::fs::remove_file(dest.join("etc/hello.conf"))?;
        let restored = db.repair("hello")?;
        assert_eq!(restored, vec![dest.join("etc/hello.conf")]);
        assert_eq!(std::fs::read_to_string(dest.join("etc/hello.conf"))?, "conf");

        // Nothing missing, nothing to do.
        assert!(db.repair("hello")?.is_empty());
        Ok(())
    }

    #[test]
    fn repair_refuses_a_corrupt_artifact() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let db = PackageDb::new(&dir.path().join("db"));
        let dest = dir.path().join("root");
        let artifact = make_artifact(dir.path(), "hello", "1.0", &[("usr/bin/hello", "bin")]);
        db.install(&artifact, &InstallOptions::new(&dest))?;

        std::fs::remove_file(dest.join("usr/bin/hello"))?;
        std::fs::write(&artifact, "corrupted")?;
        let err = db.repair("hello").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PkgDbError>(),
            Some(PkgDbError::IntegrityFailed { .. })
        ));
        // No mutation happened.
        assert!(!dest.join("usr/bin/hello").try_exists()?);
        Ok(())
    }

    #[test]
    fn concurrent_mutations_of_one_name_are_rejected() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let db = PackageDb::new(&dir.path().join("db"));
        let dest = dir.path().join("root");
        let artifact = make_artifact(dir.path(), "hello", "1.0", &[("usr/bin/hello", "bin")]);

        let _lock = NameLock::acquire(db.db_dir(), "hello")?;
        let err = db.install(&artifact, &InstallOptions::new(&dest)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PkgDbError>(),
            Some(PkgDbError::Busy(_))
        ));
        drop(_lock);

        // With the lock released the install proceeds.
        db.install(&artifact, &InstallOptions::new(&dest))?;
        Ok(())
    }

    #[test]
    fn listing_and_search() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let db = PackageDb::new(&dir.path().join("db"));
        let dest = dir.path().join("root");
        for name in ["zlib", "zstd", "bash"] {
            let artifact = make_artifact(
                dir.path(),
                name,
                "1.0",
                &[(&format!("usr/bin/{name}"), "x")],
            );
            db.install(&artifact, &InstallOptions::new(&dest))?;
        }

        let names: Vec<String> = db.list_installed()?.into_iter().map(|r| r.name).collect();
        assert_eq!(names, ["bash", "zlib", "zstd"]);

        let hits: Vec<String> = db
            .search_installed("zl")?
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(hits, ["zlib"]);
        Ok(())
    }

    #[test]
    fn reverse_queries_consult_recipes() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let db = PackageDb::new(&dir.path().join("db"));
        let dest = dir.path().join("root");
        let repo_dir = dir.path().join("repo");

        let write_recipe = |name: &str, body: &str| {
            let pkg_dir = repo_dir.join("core").join(name);
            std::fs::create_dir_all(&pkg_dir).unwrap();
            std::fs::write(pkg_dir.join(format!("{name}.meta")), body).unwrap();
        };
        write_recipe(
            "app",
            "name: app\nversion: '1.0'\nsource: http://x/app.tar.gz\ndependencies: [libaux]\n",
        );
        write_recipe(
            "libaux",
            "name: libaux\nversion: '1.0'\nsource: http://x/libaux.tar.gz\nprovides: [libaux.so.1]\n",
        );

        for name in ["app", "libaux"] {
            let artifact = make_artifact(
                dir.path(),
                name,
                "1.0",
                &[(&format!("usr/lib/{name}"), "x")],
            );
            db.install(&artifact, &InstallOptions::new(&dest))?;
        }

        let repo = recipe::Repository::new(&repo_dir);
        assert_eq!(db.who_requires("libaux", &repo)?, ["app"]);
        assert!(db.who_requires("app", &repo)?.is_empty());
        assert_eq!(db.what_provides("libaux.so.1", &repo)?, ["libaux"]);
        Ok(())
    }
}
