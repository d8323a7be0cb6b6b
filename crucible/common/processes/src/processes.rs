// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    io::Read,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{Command, ExitCode, ExitStatus, Stdio},
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use nix::sys::signal::Signal;
use tracing::instrument;

/// Grace period between SIGTERM and SIGKILL when a command exceeds its
/// timeout.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Returns the last `lines` lines of stderr, for error diagnostics.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stderr.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run(cmd: &mut Command) -> Result<ExitStatus> {
    let status = cmd
        .status()
        .with_context(|| format!("Failed to spawn {:?}", cmd.get_program()))?;
    Ok(status)
}

#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run_and_check(cmd: &mut Command) -> Result<()> {
    let status = run(cmd)?;
    if !status.success() {
        bail!("Command {cmd:?} failed with {status}");
    }

    Ok(())
}

/// Runs a command with stdout/stderr captured, optionally bounded by a
/// wall-clock timeout.
///
/// On timeout the child is sent SIGTERM, then SIGKILL after a short grace
/// period, and an error is returned. A non-zero exit is not an error here;
/// callers inspect [`CommandOutput::status`].
#[instrument(skip_all, fields(command = %cmd.get_program().to_string_lossy()))]
pub fn run_captured(cmd: &mut Command, timeout: Option<Duration>) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {:?}", cmd.get_program()))?;

    let mut stdout_pipe = child.stdout.take().expect("stdout must be piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr must be piped");
    let stdout_reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf);
        buf
    });
    let stderr_reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf);
        buf
    });

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                timed_out = true;
                kill_gracefully(&mut child)?;
                break child.wait()?;
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    };

    let stdout = String::from_utf8_lossy(&stdout_reader.join().expect("stdout reader panicked"))
        .into_owned();
    let stderr = String::from_utf8_lossy(&stderr_reader.join().expect("stderr reader panicked"))
        .into_owned();

    if timed_out {
        bail!(
            "Command {:?} timed out after {:?}",
            cmd.get_program(),
            timeout.unwrap()
        );
    }

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
    })
}

fn kill_gracefully(child: &mut std::process::Child) -> Result<()> {
    let pid = nix::unistd::Pid::from_raw(child.id().try_into()?);
    // The child may have exited between try_wait and here; ESRCH is fine.
    let _ = nix::sys::signal::kill(pid, Signal::SIGTERM);
    let deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < deadline {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
    Ok(())
}

/// Converts [`ExitStatus`] to [`ExitCode`] following the POSIX shell
/// convention.
///
/// It panics if [`ExitStatus`] does not represent a status of an exiting
/// process (e.g. process being stopped or continued). This won't happen as
/// long as you get [`ExitStatus`] from [`std::process`] methods, such as
/// [`Command::status`], [`Command::output`],
/// [`Child::wait`](std::process::Child::wait).
pub fn status_to_exit_code(status: &ExitStatus) -> ExitCode {
    if let Some(code) = status.code() {
        ExitCode::from(code as u8)
    } else if let Some(signal) = status.signal() {
        ExitCode::from(128 + signal as u8)
    } else {
        panic!("ExitStatus does not represent process exit: {:?}", status);
    }
}

/// Locates a binary from the standard system directories, ignoring $PATH.
pub fn locate_system_binary(name: &str) -> Result<PathBuf> {
    for dir in ["/usr/bin", "/bin", "/usr/sbin", "/sbin"] {
        let path = PathBuf::from(dir).join(name);
        if path.is_file() {
            return Ok(path);
        }
    }
    bail!("{name} not found in system binary directories");
}
