// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Isolated filesystem roots for package builds.
//!
//! Each sandbox owns `build/` (the source tree), `install/` (the build's
//! `DESTDIR`), `tmp/` and `logs/`. Commands run with a minimal environment
//! and optional resource limits, and their output is captured to the
//! per-sandbox transcript.

use std::{
    fmt::Write as _,
    io::Write as _,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use anyhow::{Context, Result};
use config::Config;
use fileutil::remove_dir_all_with_chmod;
use processes::CommandOutput;
use tracing::{info, warn};

const SANDBOX_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";
const SANDBOX_CFLAGS: &str = "-O2 -pipe";
const SANDBOX_LDFLAGS: &str = "-Wl,-O1 -Wl,--as-needed";

#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("sandbox {0} does not exist")]
    Missing(String),
    #[error("command failed in sandbox {name} phase {phase} (rc={code}): {stderr_tail}")]
    CommandFailed {
        name: String,
        phase: String,
        code: i32,
        stderr_tail: String,
    },
}

/// Resource limits applied to every command in a sandbox.
#[derive(Clone, Debug, Default)]
struct Limits {
    memory: Option<String>,
    cpu_secs: Option<u64>,
    step_timeout: Option<Duration>,
}

/// An isolated working root for a single build, addressable by name.
pub struct Sandbox {
    name: String,
    root: PathBuf,
    keep: bool,
    limits: Limits,
}

impl Sandbox {
    /// Allocates a fresh sandbox root. A stale root left behind by a
    /// crashed process is discarded first.
    pub fn create(config: &Config, name: &str, binds: &[PathBuf], keep: bool) -> Result<Self> {
        let root = config.sandbox_dir().join(name);
        if root.exists() {
            warn!("Sandbox {} already exists, removing", name);
            remove_dir_all_with_chmod(&root)?;
        }
        for sub in ["build", "install", "tmp", "logs"] {
            std::fs::create_dir_all(root.join(sub))?;
        }
        std::fs::write(
            root.join("logs/sandbox.log"),
            format!("sandbox {name} created\n"),
        )?;
        if !binds.is_empty() {
            // Bind mounts need privileges we may not have; the descriptors
            // are recorded so a privileged wrapper can apply them.
            let lines = binds
                .iter()
                .map(|b| b.display().to_string())
                .collect::<Vec<_>>()
                .join("\n");
            std::fs::write(root.join("binds.txt"), lines)?;
        }
        info!("Sandbox created at {}", root.display());
        Ok(Self {
            name: name.to_string(),
            root,
            keep,
            limits: Limits {
                memory: config.memory_limit.clone(),
                cpu_secs: config.cpu_limit_secs,
                step_timeout: config.step_timeout_secs.map(Duration::from_secs),
            },
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    pub fn install_dir(&self) -> PathBuf {
        self.root.join("install")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("logs/sandbox.log")
    }

    /// Runs a shell command line inside the sandbox.
    ///
    /// The command sees `DESTDIR` pointing at `install/` and a minimal
    /// `PATH`. Output is captured and appended to the sandbox transcript.
    /// A non-zero exit is reported in the returned output, not as an error.
    pub fn run(
        &self,
        command_line: &str,
        cwd: Option<&Path>,
        env: &[(String, String)],
        phase: &str,
    ) -> Result<CommandOutput> {
        if !self.root.is_dir() {
            return Err(SandboxError::Missing(self.name.clone()).into());
        }

        let mut cmd = self.limited_command();
        cmd.arg("sh").arg("-c").arg(command_line);
        cmd.env_clear()
            .env("DESTDIR", self.install_dir())
            .env("PATH", SANDBOX_PATH)
            .env("HOME", self.tmp_dir())
            .env("TMPDIR", self.tmp_dir())
            .env("CFLAGS", SANDBOX_CFLAGS)
            .env("LDFLAGS", SANDBOX_LDFLAGS);
        for (key, value) in env {
            cmd.env(key, value);
        }
        let cwd = cwd.map(Path::to_path_buf).unwrap_or_else(|| self.build_dir());
        cmd.current_dir(&cwd);

        info!("[{}:{}] {}", self.name, phase, command_line);
        let output = processes::run_captured(&mut cmd, self.limits.step_timeout)?;
        self.append_transcript(phase, command_line, &output)?;
        Ok(output)
    }

    /// Like [`Sandbox::run`], but a non-zero exit becomes
    /// [`SandboxError::CommandFailed`] carrying the stderr tail.
    pub fn run_checked(
        &self,
        command_line: &str,
        cwd: Option<&Path>,
        env: &[(String, String)],
        phase: &str,
    ) -> Result<CommandOutput> {
        let output = self.run(command_line, cwd, env, phase)?;
        if !output.success() {
            return Err(SandboxError::CommandFailed {
                name: self.name.clone(),
                phase: phase.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr_tail: output.stderr_tail(10),
            }
            .into());
        }
        Ok(output)
    }

    /// Wraps commands in prlimit when resource caps are configured and the
    /// tool is present.
    fn limited_command(&self) -> Command {
        if self.limits.memory.is_some() || self.limits.cpu_secs.is_some() {
            if let Ok(prlimit) = processes::locate_system_binary("prlimit") {
                let mut cmd = Command::new(prlimit);
                if let Some(memory) = &self.limits.memory {
                    cmd.arg(format!("--as={memory}"));
                }
                if let Some(cpu) = self.limits.cpu_secs {
                    cmd.arg(format!("--cpu={cpu}"));
                }
                cmd.arg("--");
                return cmd;
            }
            warn!("prlimit not available, resource limits are not enforced");
        }
        // The shell is appended by the caller as the first argument.
        let mut cmd = Command::new("env");
        cmd.arg("--");
        cmd
    }

    fn append_transcript(
        &self,
        phase: &str,
        command_line: &str,
        output: &CommandOutput,
    ) -> Result<()> {
        let mut entry = String::new();
        let tag = format!("[{}:{}]", self.name, phase);
        writeln!(entry, "{tag} CMD: {command_line}")?;
        writeln!(entry, "{tag} RC={}", output.status.code().unwrap_or(-1))?;
        if !output.stdout.is_empty() {
            writeln!(entry, "{tag} STDOUT:\n{}", output.stdout)?;
        }
        if !output.stderr.is_empty() {
            writeln!(entry, "{tag} STDERR:\n{}", output.stderr)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.log_path())?;
        file.write_all(entry.as_bytes())?;
        Ok(())
    }

    /// Archives the sandbox into a snapshot. With `incremental`, syncs into
    /// a shadow directory instead of writing a tarball.
    pub fn snapshot(&self, name: Option<&str>, incremental: bool) -> Result<PathBuf> {
        let name = name.unwrap_or("snapshot");
        let base = self
            .root
            .parent()
            .context("sandbox root must have a parent")?
            .to_path_buf();
        if incremental {
            let shadow = base.join(format!("{}.{name}.shadow", self.name));
            if shadow.exists() {
                remove_dir_all_with_chmod(&shadow)?;
            }
            std::fs::create_dir_all(&shadow)?;
            copy_tree(&self.root, &shadow)?;
            Ok(shadow)
        } else {
            let archive = base.join(format!("{}.{name}.tar.gz", self.name));
            tarball::create_tarball(&self.root, &archive)?;
            Ok(archive)
        }
    }

    /// Clears the sandbox root and reinstates it from a snapshot taken with
    /// [`Sandbox::snapshot`].
    pub fn restore(&self, name: &str) -> Result<()> {
        let base = self
            .root
            .parent()
            .context("sandbox root must have a parent")?
            .to_path_buf();
        let shadow = base.join(format!("{}.{name}.shadow", self.name));
        let archive = base.join(format!("{}.{name}.tar.gz", self.name));

        remove_dir_all_with_chmod(&self.root)?;
        std::fs::create_dir_all(&self.root)?;
        if shadow.is_dir() {
            copy_tree(&shadow, &self.root)?;
        } else if archive.is_file() {
            tarball::extract_tarball(&archive, &self.root)?;
        } else {
            return Err(SandboxError::Missing(format!("{} snapshot {name}", self.name)).into());
        }
        Ok(())
    }

    /// Removes the sandbox root. With `force`, a missing root is not an
    /// error (e.g. cleanup after a crashed build).
    pub fn destroy(mut self, force: bool) -> Result<()> {
        self.keep = true; // Drop must not run the cleanup twice.
        if self.root.is_dir() {
            remove_dir_all_with_chmod(&self.root)?;
            info!("Sandbox {} removed", self.name);
        } else if !force {
            return Err(SandboxError::Missing(self.name.clone()).into());
        }
        Ok(())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !self.keep && self.root.is_dir() {
            if let Err(e) = remove_dir_all_with_chmod(&self.root) {
                warn!("Failed to remove sandbox {}: {:#}", self.name, e);
            }
        }
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
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use fileutil::ScratchDir;

    use super::*;

    fn test_config(root: &Path) -> Config {
        Config::rooted_at(root)
    }

    #[test]
    fn creates_the_standard_layout() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let config = test_config(dir.path());
        let sb = Sandbox::create(&config, "demo-1.0", &[], false)?;
        for sub in ["build", "install", "tmp", "logs"] {
            assert!(sb.root().join(sub).is_dir(), "{sub} missing");
        }
        assert!(sb.log_path().is_file());
        Ok(())
    }

    #[test]
    fn run_exposes_destdir_and_captures_output() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let config = test_config(dir.path());
        let sb = Sandbox::create(&config, "demo-1.0", &[], false)?;

        let output = sb.run("echo \"DESTDIR=$DESTDIR\"", None, &[], "build")?;
        assert!(output.success());
        assert_eq!(
            output.stdout.trim(),
            format!("DESTDIR={}", sb.install_dir().display())
        );

        let transcript = std::fs::read_to_string(sb.log_path())?;
        assert!(transcript.contains("[demo-1.0:build] CMD:"), "{transcript}");
        Ok(())
    }

    #[test]
    fn run_applies_extra_env() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let config = test_config(dir.path());
        let sb = Sandbox::create(&config, "demo-1.0", &[], false)?;

        let env = [("JOBS".to_string(), "7".to_string())];
        let output = sb.run("echo \"jobs=$JOBS\"", None, &env, "build")?;
        assert_eq!(output.stdout.trim(), "jobs=7");
        Ok(())
    }

    #[test]
    fn run_checked_reports_failures() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let config = test_config(dir.path());
        let sb = Sandbox::create(&config, "demo-1.0", &[], false)?;

        let output = sb.run("echo oops >&2; exit 4", None, &[], "check")?;
        assert_eq!(output.status.code(), Some(4));

        let err = sb
            .run_checked("echo oops >&2; exit 4", None, &[], "check")
            .unwrap_err();
        let sandbox_err = err.downcast_ref::<SandboxError>().unwrap();
        match sandbox_err {
            SandboxError::CommandFailed { phase, code, stderr_tail, .. } => {
                assert_eq!(phase, "check");
                assert_eq!(*code, 4);
                assert!(stderr_tail.contains("oops"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn snapshot_and_restore_round_trip() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let config = test_config(dir.path());
        let sb = Sandbox::create(&config, "demo-1.0", &[], false)?;

        std::fs::write(sb.build_dir().join("state.txt"), "before")?;
        sb.snapshot(Some("pristine"), false)?;
        std::fs::write(sb.build_dir().join("state.txt"), "after")?;
        std::fs::write(sb.build_dir().join("junk.txt"), "junk")?;

        sb.restore("pristine")?;
        assert_eq!(
            std::fs::read_to_string(sb.build_dir().join("state.txt"))?,
            "before"
        );
        assert!(!sb.build_dir().join("junk.txt").try_exists()?);
        Ok(())
    }

    #[test]
    fn incremental_snapshot_uses_a_shadow_dir() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let config = test_config(dir.path());
        let sb = Sandbox::create(&config, "demo-1.0", &[], false)?;

        std::fs::write(sb.build_dir().join("state.txt"), "shadowed")?;
        let shadow = sb.snapshot(Some("work"), true)?;
        assert!(shadow.is_dir());
        std::fs::remove_file(sb.build_dir().join("state.txt"))?;

        sb.restore("work")?;
        assert_eq!(
            std::fs::read_to_string(sb.build_dir().join("state.txt"))?,
            "shadowed"
        );
        Ok(())
    }

    #[test]
    fn destroy_removes_the_root() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let config = test_config(dir.path());
        let sb = Sandbox::create(&config, "demo-1.0", &[], false)?;
        let root = sb.root().to_path_buf();
        sb.destroy(false)?;
        assert!(!root.try_exists()?);
        Ok(())
    }

    #[test]
    fn sandboxes_do_not_share_state() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let config = test_config(dir.path());
        let a = Sandbox::create(&config, "a-1.0", &[], false)?;
        let b = Sandbox::create(&config, "b-1.0", &[], false)?;
        std::fs::write(a.build_dir().join("only-in-a"), "x")?;
        assert!(!b.build_dir().join("only-in-a").try_exists()?);
        Ok(())
    }

    #[test]
    fn dropping_an_unkept_sandbox_cleans_up() -> Result<()> {
        let dir = ScratchDir::new("fixture")?;
        let config = test_config(dir.path());
        let root = {
            let sb = Sandbox::create(&config, "demo-1.0", &[], false)?;
            sb.root().to_path_buf()
        };
        assert!(!root.try_exists()?);

        let kept_root = {
            let sb = Sandbox::create(&config, "kept-1.0", &[], true)?;
            sb.root().to_path_buf()
        };
        assert!(kept_root.try_exists()?);
        Ok(())
    }
}
