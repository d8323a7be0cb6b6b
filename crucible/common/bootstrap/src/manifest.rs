// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Rootfs content manifests: type and SHA-256 per regular file, target per
//! symlink, pseudo-filesystems excluded.

use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// Top-level trees that hold no package content.
const EXCLUDED: &[&str] = &["proc", "sys", "dev", "run", "tmp"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileEntry {
    File { sha256: String },
    Symlink { target: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RootfsManifest {
    pub root: String,
    pub generated_at: String,
    /// Set when the caller wants timestamps treated as all-zero for
    /// reproducible comparison.
    #[serde(default)]
    pub normalized_ts: bool,
    pub files: BTreeMap<String, FileEntry>,
}

fn excluded(rel: &Path) -> bool {
    match rel.components().next() {
        Some(first) => EXCLUDED
            .iter()
            .any(|e| first.as_os_str().to_string_lossy() == *e),
        None => false,
    }
}

/// Walks a rootfs and produces its manifest. File hashing is fanned out
/// over the rayon pool; no mutable state is shared between workers.
pub fn generate(rootfs: &Path, normalize_ts: bool) -> Result<RootfsManifest> {
    let mut files = BTreeMap::new();
    let mut to_hash: Vec<(String, std::path::PathBuf)> = Vec::new();

    for entry in WalkDir::new(rootfs).min_depth(1) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(rootfs)?.to_path_buf();
        if excluded(&rel) {
            continue;
        }
        let rel_name = rel.to_string_lossy().into_owned();
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            files.insert(
                rel_name,
                FileEntry::Symlink {
                    target: target.to_string_lossy().into_owned(),
                },
            );
        } else if file_type.is_file() {
            to_hash.push((rel_name, entry.path().to_path_buf()));
        }
    }

    let hashed = to_hash
        .par_iter()
        .map(|(rel, path)| {
            let sha256 = tarball::sha256_file(path)
                .with_context(|| format!("hash {}", path.display()))?;
            Ok((rel.clone(), FileEntry::File { sha256 }))
        })
        .collect::<Result<Vec<_>>>()?;
    files.extend(hashed);

    Ok(RootfsManifest {
        root: rootfs.display().to_string(),
        generated_at: chrono::Local::now().format("%Y%m%d%H%M%S").to_string(),
        normalized_ts: normalize_ts,
        files,
    })
}
