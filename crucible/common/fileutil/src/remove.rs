// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// Removes a directory tree, tolerating entries whose permissions would make
/// [`std::fs::remove_dir_all`] fail.
///
/// Build systems sometimes leave write-protected directories behind (e.g.
/// extracted source trees with 0555 directories). This first attempts a plain
/// removal and, only if that fails, walks the tree restoring owner write/exec
/// bits before retrying.
pub fn remove_dir_all_with_chmod(dir: &Path) -> Result<()> {
    if !dir.symlink_metadata().is_ok() {
        return Ok(());
    }

    if std::fs::remove_dir_all(dir).is_ok() {
        return Ok(());
    }

    for entry in WalkDir::new(dir) {
        let entry = match entry {
            Ok(entry) => entry,
            // Unreadable subtrees are exactly what the chmod pass fixes up;
            // keep going and let the final removal report real failures.
            Err(_) => continue,
        };
        if entry.file_type().is_dir() {
            let _ = std::fs::set_permissions(entry.path(), PermissionsExt::from_mode(0o755));
        }
    }

    std::fs::remove_dir_all(dir).with_context(|| format!("rm -rf {}", dir.display()))
}
