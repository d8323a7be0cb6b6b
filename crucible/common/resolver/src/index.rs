// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, HashSet},
    path::Path,
};

use anyhow::{Context, Result};
use recipe::{DependencyExpr, NameSpec, Recipe, Repository, Requirement};
use serde::{Deserialize, Serialize};
use tracing::info;
use version::Version;

/// A concrete recipe version considered by the solver. Identity is
/// `name-version`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub depends: Vec<DependencyExpr>,
    #[serde(default)]
    pub optional_depends: Vec<DependencyExpr>,
    #[serde(default)]
    pub conflicts: Vec<String>,
}

impl Candidate {
    pub fn id(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    pub fn from_recipe(recipe: &Recipe) -> Result<Self> {
        Ok(Self {
            name: recipe.name.clone(),
            version: Version::try_new(&recipe.version)?,
            provides: recipe.provides.clone(),
            depends: recipe.dependencies.clone(),
            optional_depends: recipe.optional_dependencies.clone(),
            conflicts: recipe.conflicts.clone(),
        })
    }

    /// Lowers the candidate's dependency edges. Optional edges are included
    /// only when `include_optional` is set, and stay marked optional.
    pub fn requirements(&self, include_optional: bool) -> Result<Vec<Requirement>> {
        let mut out = Vec::new();
        for expr in &self.depends {
            out.push(expr.to_requirement(false)?);
        }
        if include_optional {
            for expr in &self.optional_depends {
                out.push(expr.to_requirement(true)?);
            }
        }
        Ok(out)
    }

    /// Checks whether this candidate can stand in for `choice`: it must
    /// match the name (directly or through provides) and the version
    /// constraint.
    pub fn satisfies_choice(&self, choice: &NameSpec) -> bool {
        if self.name != choice.name && !self.provides.iter().any(|p| p == &choice.name) {
            return false;
        }
        choice.accepts(&self.version)
    }

    /// Checks whether this candidate satisfies any choice of `requirement`.
    pub fn satisfies(&self, requirement: &Requirement) -> bool {
        requirement
            .choices()
            .iter()
            .any(|choice| self.satisfies_choice(choice))
    }

    /// Symmetric conflict test: either package names (or provides) the other
    /// in its conflicts set.
    pub fn conflicts_with(&self, other: &Candidate) -> bool {
        let hits = |conflicts: &[String], target: &Candidate| {
            conflicts
                .iter()
                .any(|c| c == &target.name || target.provides.iter().any(|p| p == c))
        };
        hits(&self.conflicts, other) || hits(&other.conflicts, self)
    }
}

/// The scanned repository: candidates grouped by name plus the virtual
/// provides index. Persisted as a single JSON file and rebuilt when missing
/// or explicitly refreshed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RepoIndex {
    pub candidates_by_name: BTreeMap<String, Vec<Candidate>>,
    pub provides_index: BTreeMap<String, BTreeSet<String>>,
}

impl RepoIndex {
    /// Builds the index by scanning every recipe in the repository.
    pub fn build(repo: &Repository) -> Result<Self> {
        let recipes = repo.scan()?;
        let candidates = recipes
            .iter()
            .map(Candidate::from_recipe)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_candidates(candidates))
    }

    pub fn from_candidates(candidates: Vec<Candidate>) -> Self {
        let mut index = Self::default();
        for candidate in candidates {
            for provided in &candidate.provides {
                index
                    .provides_index
                    .entry(provided.clone())
                    .or_default()
                    .insert(candidate.name.clone());
            }
            // A package always provides its own name.
            index
                .provides_index
                .entry(candidate.name.clone())
                .or_default()
                .insert(candidate.name.clone());
            index
                .candidates_by_name
                .entry(candidate.name.clone())
                .or_default()
                .push(candidate);
        }
        index
    }

    /// Loads the persisted index, rebuilding it from the repository when the
    /// file is missing or `refresh` is requested.
    pub fn load_or_build(repo: &Repository, index_file: &Path, refresh: bool) -> Result<Self> {
        if !refresh && index_file.is_file() {
            let content = std::fs::read_to_string(index_file)
                .with_context(|| format!("read {}", index_file.display()))?;
            if let Ok(index) = serde_json::from_str(&content) {
                return Ok(index);
            }
            info!("Index {} is unreadable, rebuilding", index_file.display());
        }
        let index = Self::build(repo)?;
        index.save(index_file)?;
        Ok(index)
    }

    /// Persists the index with a full-file write-then-rename.
    pub fn save(&self, index_file: &Path) -> Result<()> {
        if let Some(parent) = index_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = index_file.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, index_file)?;
        Ok(())
    }

    /// Names of packages that provide `name`.
    pub fn providers(&self, name: &str) -> BTreeSet<String> {
        self.provides_index.get(name).cloned().unwrap_or_default()
    }

    /// Enumerates candidates satisfying `requirement` in the deterministic
    /// preference order: direct name matches before virtual providers,
    /// higher versions before lower, ties broken by name.
    pub fn find_candidates(&self, requirement: &Requirement) -> Vec<&Candidate> {
        let mut seen = HashSet::new();
        let mut out: Vec<&Candidate> = Vec::new();
        for choice in requirement.choices() {
            for provider in self.providers(&choice.name) {
                for candidate in self.candidates_by_name.get(&provider).into_iter().flatten() {
                    if candidate.satisfies_choice(choice) && seen.insert(candidate.id()) {
                        out.push(candidate);
                    }
                }
            }
        }
        let direct: HashSet<&str> = requirement
            .choices()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        out.sort_by(|a, b| {
            let a_direct = direct.contains(a.name.as_str());
            let b_direct = direct.contains(b.name.as_str());
            match b_direct.cmp(&a_direct) {
                Ordering::Equal => {}
                other => return other,
            }
            match b.version.cmp(&a.version) {
                Ordering::Equal => {}
                other => return other,
            }
            a.name.cmp(&b.name)
        });
        out
    }

    /// The single best candidate for a requirement, if any.
    pub fn find_best(&self, requirement: &Requirement) -> Option<&Candidate> {
        self.find_candidates(requirement).into_iter().next()
    }

    /// Looks up the exact candidate `name-version`, used for lockfile
    /// replay.
    pub fn find_exact(&self, name: &str, version: &str) -> Option<&Candidate> {
        let wanted = Version::try_new(version).ok()?;
        self.candidates_by_name
            .get(name)?
            .iter()
            .find(|c| c.version == wanted)
    }
}
