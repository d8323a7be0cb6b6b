// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    fs::OpenOptions,
    io::Write,
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One line of the append-only rollback log.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RollbackEvent {
    Snapshot {
        ts: String,
        op: String,
        packages: Vec<String>,
    },
    Rollback {
        ts: String,
        snapshot: String,
        packages: Vec<String>,
        commit: bool,
    },
    RollbackPkg {
        ts: String,
        pkg: String,
        target_version: String,
    },
    OrphanRemoved {
        ts: String,
        pkg: String,
    },
    UpgradeOp {
        ts: String,
        pkgs: Vec<String>,
        result: String,
    },
    RevdepFix {
        ts: String,
        pkg: String,
        result: String,
    },
}

impl RollbackEvent {
    pub fn ts(&self) -> &str {
        match self {
            RollbackEvent::Snapshot { ts, .. }
            | RollbackEvent::Rollback { ts, .. }
            | RollbackEvent::RollbackPkg { ts, .. }
            | RollbackEvent::OrphanRemoved { ts, .. }
            | RollbackEvent::UpgradeOp { ts, .. }
            | RollbackEvent::RevdepFix { ts, .. } => ts,
        }
    }
}

/// Appends one event as a JSON line. The log is append-only; nothing ever
/// rewrites it.
pub(crate) fn append(log_path: &Path, event: &RollbackEvent) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(log_path)
        .with_context(|| format!("open {}", log_path.display()))?;
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Reads the whole log, oldest first. Unparsable lines are skipped so a
/// damaged line never bricks history.
pub(crate) fn read(log_path: &Path) -> Result<Vec<RollbackEvent>> {
    if !log_path.is_file() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(log_path)
        .with_context(|| format!("read {}", log_path.display()))?;
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(event) => out.push(event),
            Err(e) => warn!("Skipping bad rollback log line: {e}"),
        }
    }
    Ok(out)
}
