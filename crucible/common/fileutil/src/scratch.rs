// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use tracing::warn;

use crate::remove_dir_all_with_chmod;

/// A self-cleaning directory for short-lived work, named after its purpose.
///
/// Build tooling allocates scratch space constantly: compile probes,
/// validation installs, test fixtures. Each scratch dir carries a purpose
/// label (`crucible-probe.X7f2`), so anything that survives a crash can be
/// traced back to the operation that created it. Cleanup goes through
/// [`remove_dir_all_with_chmod`] because extracted source trees and failed
/// builds routinely leave write-protected directories behind.
pub struct ScratchDir {
    dir: Option<PathBuf>,
}

impl ScratchDir {
    /// Allocates a labeled scratch directory under the system temp dir.
    pub fn new(label: &str) -> Result<Self> {
        Self::under(&std::env::temp_dir(), label)
    }

    /// Allocates a labeled scratch directory under `base`, e.g. a sandbox's
    /// `tmp/`.
    pub fn under(base: &Path, label: &str) -> Result<Self> {
        ensure!(
            !label.is_empty()
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-'),
            "bad scratch label {label:?}"
        );
        let dir = tempfile::Builder::new()
            .prefix(&format!("crucible-{label}."))
            .tempdir_in(base)
            .with_context(|| format!("scratch dir under {}", base.display()))?
            .into_path();
        Ok(Self { dir: Some(dir) })
    }

    pub fn path(&self) -> &Path {
        self.dir.as_deref().expect("scratch dir was released")
    }

    /// Releases ownership so the directory survives drop, e.g. to leave a
    /// failed probe on disk for inspection. Returns its path.
    pub fn keep(mut self) -> PathBuf {
        self.dir.take().expect("scratch dir was released")
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            // A leaked directory is recoverable (it is labeled); panicking
            // in drop would abort a build over scratch space.
            if let Err(e) = remove_dir_all_with_chmod(&dir) {
                warn!("Leaking scratch dir {}: {e:#}", dir.display());
            }
        }
    }
}
