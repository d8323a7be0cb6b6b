// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Creates and extracts `.tar.gz` package artifacts, tracking the files they
//! touch so that installs can be rolled back and audited.

use std::{
    collections::HashSet,
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tar::EntryType;

/// Ownership a package wanted for a path but could not apply because the
/// process is unprivileged. A privileged post-step may replay these.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipEntry {
    pub path: PathBuf,
    pub uid: u64,
    pub gid: u64,
    pub mode: u32,
}

/// Result of extracting an archive.
#[derive(Debug, Default)]
pub struct Extraction {
    /// Regular files and symlinks created, in archive order. This is the
    /// material for the package manifest.
    pub files: Vec<PathBuf>,
    /// Ownership that could not be applied (unprivileged extraction).
    pub ownership: Vec<OwnershipEntry>,
}

/// Archives the contents of `src_dir` into a gzip-compressed tarball.
///
/// Entries are stored relative to `src_dir` (prefixed with `./`), symlinks
/// are archived as symlinks.
pub fn create_tarball(src_dir: &Path, out: &Path) -> Result<()> {
    let file = File::create(out).with_context(|| format!("create {}", out.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", src_dir)
        .with_context(|| format!("archive {}", src_dir.display()))?;
    let encoder = builder.into_inner()?;
    let mut file = encoder.finish()?;
    file.flush()?;
    Ok(())
}

/// Extracts `archive` into `dest`, recording every file created.
///
/// Extraction is rollback-safe: if any entry fails mid-stream, all files
/// already created by this call are unlinked before the error propagates.
pub fn extract_tarball(archive: &Path, dest: &Path) -> Result<Extraction> {
    let file = File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let mut ar = tar::Archive::new(GzDecoder::new(file));
    extract_archive(&mut ar, dest, |_| true)
        .with_context(|| format!("extract {}", archive.display()))
}

/// Extracts only the entries whose archive-relative path is in `want`.
/// Used to repair packages with missing files.
pub fn extract_entries(
    archive: &Path,
    dest: &Path,
    want: &HashSet<PathBuf>,
) -> Result<Extraction> {
    let file = File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let mut ar = tar::Archive::new(GzDecoder::new(file));
    extract_archive(&mut ar, dest, |path| want.contains(path))
        .with_context(|| format!("extract {}", archive.display()))
}

/// Lists the archive-relative paths of the non-directory entries.
pub fn list_tarball(archive: &Path) -> Result<Vec<PathBuf>> {
    let file = File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let mut ar = tar::Archive::new(GzDecoder::new(file));
    let mut paths = Vec::new();
    for entry in ar.entries()? {
        let entry = entry?;
        if entry.header().entry_type() == EntryType::Directory {
            continue;
        }
        paths.push(normalize_entry_path(&entry.path()?));
    }
    Ok(paths)
}

fn normalize_entry_path(path: &Path) -> PathBuf {
    path.strip_prefix(".").unwrap_or(path).to_path_buf()
}

fn extract_archive(
    ar: &mut tar::Archive<impl Sized + Read>,
    dest: &Path,
    want: impl Fn(&Path) -> bool,
) -> Result<Extraction> {
    let apply_ownership = nix::unistd::Uid::effective().is_root();
    ar.set_preserve_permissions(true);
    ar.set_preserve_ownerships(apply_ownership);

    let mut extraction = Extraction::default();
    let result = (|| -> Result<()> {
        for entry in ar.entries()? {
            let mut entry = entry?;
            let rel = normalize_entry_path(&entry.path()?);
            if rel.as_os_str().is_empty() || !want(&rel) {
                continue;
            }
            let entry_type = entry.header().entry_type();
            let out_path = dest.join(&rel);
            if entry_type == EntryType::Directory {
                std::fs::create_dir_all(&out_path)
                    .with_context(|| format!("mkdir {}", out_path.display()))?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("mkdir {}", parent.display()))?;
            }
            // A previous version of the file must not survive underneath the
            // new one (symlinks especially).
            if out_path.symlink_metadata().is_ok() {
                let _ = std::fs::remove_file(&out_path);
            }
            if let Err(e) = entry.unpack(&out_path) {
                // unpack may leave a partially written file behind.
                let _ = std::fs::remove_file(&out_path);
                return Err(e).with_context(|| format!("unpack {}", out_path.display()));
            }
            extraction.files.push(out_path.clone());

            if !apply_ownership {
                let header = entry.header();
                let (uid, gid) = (header.uid()?, header.gid()?);
                if uid != 0 || gid != 0 {
                    extraction.ownership.push(OwnershipEntry {
                        path: out_path,
                        uid,
                        gid,
                        mode: header.mode()?,
                    });
                }
            }
        }
        Ok(())
    })();

    if let Err(e) = result {
        for path in extraction.files.iter().rev() {
            let _ = std::fs::remove_file(path);
        }
        return Err(e);
    }

    Ok(extraction)
}

/// Computes the SHA-256 hash of a file in hexadecimal format.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
