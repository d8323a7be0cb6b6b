// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Loads and validates per-package recipes from the recipe repository.
//!
//! The repository root contains category directories, each holding package
//! directories with a `<name>.meta` YAML file and an optional sibling
//! `patches/` directory.

mod requirement;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use requirement::{NameSpec, Requirement};

pub const RECIPE_EXT: &str = "meta";

#[derive(thiserror::Error, Debug)]
pub enum RecipeError {
    #[error("package {0} not found in any category")]
    NotFound(String),
    #[error("invalid recipe {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// The hook phases of the build pipeline, in pipeline order.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HookPhase {
    PreFetch,
    PostFetch,
    PreExtract,
    PostExtract,
    PrePatch,
    PostPatch,
    PreBuild,
    PostBuild,
    PreCheck,
    PostCheck,
    PreInstall,
    PostInstall,
    PrePackage,
    PostPackage,
}

/// Where a package's sources come from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceSpec {
    /// A bare URL string.
    Url(String),
    /// A URL with an optional content hash to verify.
    Archive {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
    },
    /// A version-control checkout of a specific ref.
    Vcs {
        vcs_url: String,
        #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
    },
    /// An ordered list of the above.
    List(Vec<SourceSpec>),
}

/// A dependency edge as written in a recipe. All encodings lower to
/// [`Requirement`] before resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyExpr {
    /// `zlib` or `zlib>=1.2,<2.0`.
    Spec(String),
    /// `{name: zlib, version: ">=1.2", optional: false}`.
    Record {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(default)]
        optional: bool,
    },
    /// Any element satisfies the edge.
    Alternatives(Vec<DependencyExpr>),
}

impl DependencyExpr {
    /// Lowers this expression to a [`Requirement`].
    ///
    /// `optional` marks requirements coming from `optional_dependencies`.
    pub fn to_requirement(&self, optional: bool) -> Result<Requirement> {
        Requirement::from_expr(self, optional)
    }
}

/// A per-package recipe, as loaded from `<name>.meta`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    pub source: SourceSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyExpr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_dependencies: Vec<DependencyExpr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub check: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub install: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: BTreeMap<HookPhase, Vec<String>>,

    // Populated by the loader, not part of the file.
    #[serde(skip)]
    pub pkg_dir: PathBuf,
    #[serde(skip)]
    pub meta_path: PathBuf,
    #[serde(skip)]
    pub patches: Vec<PathBuf>,
}

impl Recipe {
    /// Returns the `name-version` identity used for artifacts and sandboxes.
    pub fn id(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    /// Lowers all mandatory dependency edges.
    pub fn requirements(&self) -> Result<Vec<Requirement>> {
        self.dependencies
            .iter()
            .map(|d| d.to_requirement(false))
            .collect()
    }

    /// Lowers all optional dependency edges.
    pub fn optional_requirements(&self) -> Result<Vec<Requirement>> {
        self.optional_dependencies
            .iter()
            .map(|d| d.to_requirement(true))
            .collect()
    }

    pub fn hook_steps(&self, phase: HookPhase) -> &[String] {
        self.hooks.get(&phase).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// Read-only handle to the recipe repository.
#[derive(Clone, Debug)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Locates the package directory for `name`, searching every category
    /// unless one is given.
    pub fn package_dir(&self, name: &str, category: Option<&str>) -> Result<PathBuf> {
        if let Some(category) = category {
            let dir = self.root.join(category).join(name);
            if dir.is_dir() {
                return Ok(dir);
            }
            return Err(RecipeError::NotFound(format!("{category}/{name}")).into());
        }
        for category in self.list_categories()? {
            let dir = self.root.join(&category).join(name);
            if dir.is_dir() {
                return Ok(dir);
            }
        }
        Err(RecipeError::NotFound(name.to_string()).into())
    }

    /// Loads and validates the recipe for `name`.
    pub fn load(&self, name: &str, category: Option<&str>) -> Result<Recipe> {
        let pkg_dir = self.package_dir(name, category)?;
        let meta_path = pkg_dir.join(format!("{name}.{RECIPE_EXT}"));
        self.load_from(&meta_path)
    }

    /// Loads and validates a recipe from an explicit file path.
    pub fn load_from(&self, meta_path: &Path) -> Result<Recipe> {
        let content = std::fs::read_to_string(meta_path)
            .with_context(|| format!("Failed to read {}", meta_path.display()))?;
        let mut recipe: Recipe =
            serde_yaml::from_str(&content).map_err(|e| RecipeError::Invalid {
                path: meta_path.to_path_buf(),
                reason: e.to_string(),
            })?;
        recipe.meta_path = meta_path.to_path_buf();
        recipe.pkg_dir = meta_path
            .parent()
            .context("recipe path must have a parent")?
            .to_path_buf();
        recipe.patches = find_patches(&recipe.pkg_dir)?;
        validate(&recipe)?;
        Ok(recipe)
    }

    pub fn list_categories(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read {}", self.root.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn list_packages(&self, category: &str) -> Result<Vec<String>> {
        let dir = self.root.join(category);
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Loads every valid recipe in the repository. Recipes that fail to
    /// parse or validate are skipped with a warning, matching the behavior
    /// of index rebuilds over a partially broken repository.
    pub fn scan(&self) -> Result<Vec<Recipe>> {
        let mut out = Vec::new();
        for category in self.list_categories()? {
            for name in self.list_packages(&category)? {
                let meta_path = self
                    .root
                    .join(&category)
                    .join(&name)
                    .join(format!("{name}.{RECIPE_EXT}"));
                if !meta_path.is_file() {
                    continue;
                }
                match self.load_from(&meta_path) {
                    Ok(recipe) => out.push(recipe),
                    Err(e) => {
                        warn!("Skipping {}: {:#}", meta_path.display(), e);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Creates a template recipe and `patches/` directory for a new package.
    /// Returns the package directory.
    pub fn create(
        &self,
        name: &str,
        category: &str,
        version: &str,
        maintainer: &str,
        description: &str,
    ) -> Result<PathBuf> {
        let pkg_dir = self.root.join(category).join(name);
        if pkg_dir.exists() {
            return Err(RecipeError::Invalid {
                path: pkg_dir,
                reason: format!("package {name} already exists in {category}"),
            }
            .into());
        }
        std::fs::create_dir_all(pkg_dir.join("patches"))?;

        let template = Recipe {
            name: name.to_string(),
            version: version.to_string(),
            category: Some(category.to_string()),
            description: Some(description.to_string()),
            maintainer: Some(maintainer.to_string()),
            license: None,
            source: SourceSpec::Archive {
                url: "http://example.com/source.tar.gz".to_string(),
                sha256: None,
            },
            dependencies: Vec::new(),
            optional_dependencies: Vec::new(),
            provides: Vec::new(),
            conflicts: Vec::new(),
            build: vec![
                "./configure --prefix=/usr".to_string(),
                "make -j${JOBS}".to_string(),
            ],
            check: Vec::new(),
            install: vec!["make install".to_string()],
            hooks: BTreeMap::new(),
            pkg_dir: PathBuf::new(),
            meta_path: PathBuf::new(),
            patches: Vec::new(),
        };
        let meta_path = pkg_dir.join(format!("{name}.{RECIPE_EXT}"));
        std::fs::write(&meta_path, serde_yaml::to_string(&template)?)
            .with_context(|| format!("write {}", meta_path.display()))?;
        Ok(pkg_dir)
    }
}

/// Finds `patches/*.patch` next to a recipe, sorted so they apply in a
/// stable order.
fn find_patches(pkg_dir: &Path) -> Result<Vec<PathBuf>> {
    let patch_dir = pkg_dir.join("patches");
    if !patch_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut patches = Vec::new();
    for entry in std::fs::read_dir(&patch_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("patch") {
            patches.push(path);
        }
    }
    patches.sort();
    Ok(patches)
}

fn validate(recipe: &Recipe) -> Result<()> {
    let invalid = |reason: String| RecipeError::Invalid {
        path: recipe.meta_path.clone(),
        reason,
    };
    if recipe.name.is_empty() {
        return Err(invalid("name must not be empty".to_string()).into());
    }
    if recipe.version.is_empty() {
        return Err(invalid("version must not be empty".to_string()).into());
    }
    version::Version::try_new(&recipe.version)
        .map_err(|e| invalid(format!("bad version: {e}")))?;
    validate_source(&recipe.source, false).map_err(|reason| invalid(reason))?;
    // Surface malformed dependency expressions at load time, not inside the
    // resolver.
    recipe
        .requirements()
        .and_then(|_| recipe.optional_requirements())
        .map_err(|e| invalid(format!("bad dependency: {e}")))?;
    Ok(())
}

fn validate_source(source: &SourceSpec, nested: bool) -> Result<(), String> {
    match source {
        SourceSpec::Url(url) | SourceSpec::Archive { url, .. } => {
            if url.is_empty() {
                return Err("source url must not be empty".to_string());
            }
        }
        SourceSpec::Vcs { vcs_url, .. } => {
            if vcs_url.is_empty() {
                return Err("source vcs_url must not be empty".to_string());
            }
        }
        SourceSpec::List(items) => {
            if nested {
                return Err("source lists must not nest".to_string());
            }
            if items.is_empty() {
                return Err("source list must not be empty".to_string());
            }
            for item in items {
                validate_source(item, true)?;
            }
        }
    }
    Ok(())
}
