// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use recipe::Requirement;
use serde::{Deserialize, Serialize};

use crate::Candidate;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedPackage {
    pub name: String,
    pub version: String,
}

/// The reproducibility record of past resolutions: a map from a sorted
/// root-requirement key to the chosen `{name, version}` pairs.
#[derive(Debug)]
pub struct Lockfile {
    path: PathBuf,
    entries: BTreeMap<String, BTreeMap<String, LockedPackage>>,
}

impl Lockfile {
    /// Loads the lockfile if it exists; a missing or unreadable file yields
    /// an empty lock.
    pub fn load(path: &Path) -> Self {
        let entries = std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    /// The key for a root set: comma-joined sorted primary names.
    pub fn key(roots: &[Requirement]) -> String {
        let mut names: Vec<&str> = roots.iter().map(|r| r.name()).collect();
        names.sort_unstable();
        names.join(",")
    }

    pub fn lookup(&self, roots: &[Requirement]) -> Option<&BTreeMap<String, LockedPackage>> {
        self.entries.get(&Self::key(roots))
    }

    /// Records a successful resolution and rewrites the file with a
    /// write-then-rename.
    pub fn store(
        &mut self,
        roots: &[Requirement],
        chosen: &BTreeMap<String, Candidate>,
    ) -> Result<()> {
        let entry = chosen
            .iter()
            .map(|(name, candidate)| {
                (
                    name.clone(),
                    LockedPackage {
                        name: candidate.name.clone(),
                        version: candidate.version.to_string(),
                    },
                )
            })
            .collect();
        self.entries.insert(Self::key(roots), entry);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&self.entries)?)
            .with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use version::Version;

    use super::*;

    fn req(text: &str) -> Requirement {
        Requirement::parse(text).unwrap()
    }

    #[test]
    fn key_is_sorted_and_ignores_constraints() {
        let roots = vec![req("zlib>=1.2"), req("bash")];
        assert_eq!(Lockfile::key(&roots), "bash,zlib");
    }

    #[test]
    fn store_and_reload() -> Result<()> {
        let dir = fileutil::ScratchDir::new("fixture")?;
        let path = dir.path().join("dependency.lock.json");
        let roots = vec![req("app")];

        let mut chosen = BTreeMap::new();
        chosen.insert(
            "app".to_string(),
            Candidate {
                name: "app".to_string(),
                version: Version::try_new("1.0").unwrap(),
                provides: Vec::new(),
                depends: Vec::new(),
                optional_depends: Vec::new(),
                conflicts: Vec::new(),
            },
        );

        let mut lockfile = Lockfile::load(&path);
        assert!(lockfile.lookup(&roots).is_none());
        lockfile.store(&roots, &chosen)?;

        let reloaded = Lockfile::load(&path);
        let entry = reloaded.lookup(&roots).unwrap();
        assert_eq!(
            entry.get("app"),
            Some(&LockedPackage {
                name: "app".to_string(),
                version: "1.0".to_string(),
            })
        );
        Ok(())
    }
}
