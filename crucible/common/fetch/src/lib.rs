// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Acquires package sources: downloads into a content-addressed cache with
//! hash verification, and shallow version-control checkouts.

use std::{
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use config::Config;
use recipe::SourceSpec;
use tracing::info;
use url::Url;

/// Connect timeout handed to the download tool.
const CONNECT_TIMEOUT_SECS: u32 = 30;

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("download failed for {url}: {reason}")]
    Download { url: String, reason: String },
    #[error("sha256 mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("checkout failed for {url}: {reason}")]
    Checkout { url: String, reason: String },
}

/// Fetches sources described by a recipe's [`SourceSpec`].
pub struct Fetcher<'a> {
    config: &'a Config,
}

impl<'a> Fetcher<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Produces local paths for every source record, in declaration order.
    /// Archive sources land in the download cache; VCS sources are checked
    /// out under `work_dir`.
    pub fn fetch(
        &self,
        source: &SourceSpec,
        work_dir: &Path,
        force: bool,
    ) -> Result<Vec<PathBuf>> {
        match source {
            SourceSpec::Url(url) => Ok(vec![self.download(url, None, force)?]),
            SourceSpec::Archive { url, sha256 } => {
                Ok(vec![self.download(url, sha256.as_deref(), force)?])
            }
            SourceSpec::Vcs { vcs_url, reference } => {
                Ok(vec![self.checkout(vcs_url, reference.as_deref(), work_dir)?])
            }
            SourceSpec::List(items) => {
                let mut out = Vec::new();
                for item in items {
                    out.extend(self.fetch(item, work_dir, force)?);
                }
                Ok(out)
            }
        }
    }

    /// Downloads `url` into the cache, keyed by the URL's base filename.
    ///
    /// A cached file is reused only if its declared hash still matches;
    /// without a declared hash any cached file is reused unless `force`.
    pub fn download(&self, url: &str, sha256: Option<&str>, force: bool) -> Result<PathBuf> {
        let parsed = Url::parse(url).map_err(|e| FetchError::Download {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let file_name = parsed
            .path_segments()
            .and_then(|segments| segments.last())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| FetchError::Download {
                url: url.to_string(),
                reason: "URL has no file name".to_string(),
            })?;
        let cache_dir = self.config.sources_dir();
        std::fs::create_dir_all(&cache_dir)?;
        let dest = cache_dir.join(file_name);

        if !force && dest.is_file() {
            match sha256 {
                None => return Ok(dest),
                Some(expected) => {
                    if tarball::sha256_file(&dest)? == expected {
                        return Ok(dest);
                    }
                    info!("Cached {} is stale, re-downloading", dest.display());
                }
            }
        }

        let tmp = cache_dir.join(format!("{file_name}.part"));
        let result = if parsed.scheme() == "file" {
            let src = parsed.to_file_path().map_err(|_| FetchError::Download {
                url: url.to_string(),
                reason: "bad file URL".to_string(),
            })?;
            std::fs::copy(&src, &tmp)
                .map(|_| ())
                .with_context(|| format!("copy {}", src.display()))
        } else {
            self.download_remote(url, &tmp)
        };

        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("download {url}"));
        }

        if let Some(expected) = sha256 {
            let actual = tarball::sha256_file(&tmp)?;
            if actual != expected {
                let _ = std::fs::remove_file(&tmp);
                return Err(FetchError::HashMismatch {
                    path: dest,
                    expected: expected.to_string(),
                    actual,
                }
                .into());
            }
        }

        std::fs::rename(&tmp, &dest)?;
        info!("Fetched {} -> {}", url, dest.display());
        Ok(dest)
    }

    fn download_remote(&self, url: &str, dest: &Path) -> Result<()> {
        let timeout = self
            .config
            .step_timeout_secs
            .map(Duration::from_secs);
        let curl = processes::run_captured(
            Command::new("curl")
                .arg("--fail")
                .arg("--location")
                .arg("--connect-timeout")
                .arg(CONNECT_TIMEOUT_SECS.to_string())
                .arg("--output")
                .arg(dest)
                .arg(url),
            timeout,
        );
        let output = match curl {
            Ok(output) => output,
            // curl itself is missing; fall back to wget.
            Err(_) => processes::run_captured(
                Command::new("wget")
                    .arg("--timeout")
                    .arg(CONNECT_TIMEOUT_SECS.to_string())
                    .arg("--output-document")
                    .arg(dest)
                    .arg(url),
                timeout,
            )?,
        };
        if !output.success() {
            bail!(FetchError::Download {
                url: url.to_string(),
                reason: output.stderr_tail(5),
            });
        }
        Ok(())
    }

    /// Shallow-clones `url` at `reference` into `<work_dir>/source_git`.
    /// Any previous checkout is discarded.
    pub fn checkout(
        &self,
        url: &str,
        reference: Option<&str>,
        work_dir: &Path,
    ) -> Result<PathBuf> {
        let dest = work_dir.join("source_git");
        if dest.is_dir() {
            std::fs::remove_dir_all(&dest)?;
        }
        std::fs::create_dir_all(work_dir)?;

        let mut cmd = Command::new("git");
        cmd.arg("clone").arg("--depth").arg("1");
        if let Some(reference) = reference {
            cmd.arg("--branch").arg(reference);
        }
        cmd.arg(url).arg(&dest);

        let timeout = self.config.step_timeout_secs.map(Duration::from_secs);
        let output = processes::run_captured(&mut cmd, timeout)
            .map_err(|e| FetchError::Checkout {
                url: url.to_string(),
                reason: format!("{e:#}"),
            })?;
        if !output.success() {
            let _ = std::fs::remove_dir_all(&dest);
            return Err(FetchError::Checkout {
                url: url.to_string(),
                reason: output.stderr_tail(5),
            }
            .into());
        }
        Ok(dest)
    }
}

/// Turns a fetched source (archive file or checked-out tree) into a source
/// tree under `dest`.
///
/// Archives are extracted; if the extraction yields a single top-level
/// directory that directory is the tree, otherwise `dest` itself is.
/// Directory sources are copied verbatim.
pub fn materialize_source(fetched: &Path, dest: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dest)?;
    if fetched.is_dir() {
        copy_tree(fetched, dest)?;
        return Ok(dest.to_path_buf());
    }

    tarball::extract_tarball(fetched, dest)?;
    let entries: Vec<PathBuf> = std::fs::read_dir(dest)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| !n.to_string_lossy().starts_with('.'))
                .unwrap_or(false)
        })
        .collect();
    match entries.as_slice() {
        [single] if single.is_dir() => Ok(single.clone()),
        _ => Ok(dest.to_path_buf()),
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                std::fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}
