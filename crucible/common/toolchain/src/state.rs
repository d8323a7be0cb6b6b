// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PROFILE: &str = "default";

/// Versions a profile pins for each toolchain component.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub gcc_active: Option<String>,
    #[serde(default)]
    pub kernel_active: Option<String>,
    #[serde(default)]
    pub binutils: Option<String>,
    #[serde(default)]
    pub glibc: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub ts: String,
    pub action: String,
}

/// The persisted toolchain registry. `active_profile` always names an entry
/// of `profiles`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolchainState {
    pub active_profile: String,
    pub profiles: BTreeMap<String, Profile>,
    #[serde(default)]
    pub gcc_versions: Vec<String>,
    #[serde(default)]
    pub kernel_versions: Vec<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Default for ToolchainState {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(DEFAULT_PROFILE.to_string(), Profile::default());
        Self {
            active_profile: DEFAULT_PROFILE.to_string(),
            profiles,
            gcc_versions: Vec::new(),
            kernel_versions: Vec::new(),
            history: Vec::new(),
        }
    }
}

impl ToolchainState {
    /// Loads the state file, falling back to the default state when it does
    /// not exist yet. The active-profile invariant is repaired on load.
    pub fn load(path: &Path) -> Result<Self> {
        let mut state = if path.is_file() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parse {}", path.display()))?
        } else {
            Self::default()
        };
        state
            .profiles
            .entry(state.active_profile.clone())
            .or_default();
        Ok(state)
    }

    /// Persists the state with a full-file write-then-rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// The profile currently in effect.
    pub fn active_profile_mut(&mut self) -> &mut Profile {
        self.profiles
            .entry(self.active_profile.clone())
            .or_default()
    }

    pub fn record(&mut self, action: &str) {
        self.history.push(HistoryEntry {
            ts: crate::now_ts(),
            action: action.to_string(),
        });
    }
}
