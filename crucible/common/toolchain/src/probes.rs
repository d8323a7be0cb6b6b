// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Real compile-and-execute probes. A toolchain only counts as valid when
//! it can produce programs that run.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    process::Command,
    time::Duration,
};

use anyhow::{bail, Result};
use config::Config;
use fileutil::ScratchDir;
use serde::Serialize;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(120);
const PROBE_MARKER: &str = "toolchain probe ok";

const C_PROBE: &str = r#"#include <stdio.h>
int main(void) {
    printf("toolchain probe ok\n");
    return 0;
}
"#;

const CXX_PROBE: &str = r#"#include <iostream>
int main() {
    std::cout << "toolchain probe ok" << std::endl;
    return 0;
}
"#;

const FORTRAN_PROBE: &str = r#"program probe
    print *, "toolchain probe ok"
end program probe
"#;

const PTHREAD_PROBE: &str = r#"#include <pthread.h>
#include <stdio.h>
static void *worker(void *arg) { return arg; }
int main(void) {
    pthread_t thread;
    if (pthread_create(&thread, 0, worker, 0) != 0)
        return 1;
    pthread_join(thread, 0);
    printf("toolchain probe ok\n");
    return 0;
}
"#;

const KERNEL_HEADERS_PROBE: &str = r#"#include <linux/version.h>
int main(void) {
    return LINUX_VERSION_CODE > 0 ? 0 : 1;
}
"#;

#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub results: BTreeMap<String, bool>,
    pub ok: bool,
}

impl ValidationReport {
    pub fn failed_probes(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Resolves a tool: the managed toolchain bin directory wins over $PATH.
fn tool(config: &Config, name: &str) -> PathBuf {
    let managed = config.toolchain_bin_dir.join(name);
    if managed.exists() {
        managed
    } else {
        PathBuf::from(name)
    }
}

fn compile(
    config: &Config,
    compiler: &str,
    source_name: &str,
    source: &str,
    extra_args: &[&str],
) -> Result<(ScratchDir, PathBuf)> {
    let dir = ScratchDir::new("probe")?;
    let src = dir.path().join(source_name);
    std::fs::write(&src, source)?;
    let out = dir.path().join("probe.bin");

    let output = processes::run_captured(
        Command::new(tool(config, compiler))
            .arg(&src)
            .arg("-o")
            .arg(&out)
            .args(extra_args),
        Some(PROBE_TIMEOUT),
    )?;
    if !output.success() {
        bail!(
            "{compiler} failed to compile {source_name}: {}",
            output.stderr_tail(5)
        );
    }
    Ok((dir, out))
}

fn compile_and_run(
    config: &Config,
    compiler: &str,
    source_name: &str,
    source: &str,
    extra_args: &[&str],
) -> Result<()> {
    let (_dir, binary) = compile(config, compiler, source_name, source, extra_args)?;
    let output = processes::run_captured(&mut Command::new(&binary), Some(PROBE_TIMEOUT))?;
    if !output.success() {
        bail!("compiled {source_name} exited with {:?}", output.status.code());
    }
    if !output.stdout.contains(PROBE_MARKER) {
        bail!("compiled {source_name} printed {:?}", output.stdout.trim());
    }
    Ok(())
}

fn version_check(config: &Config, name: &str) -> Result<()> {
    let output = processes::run_captured(
        Command::new(tool(config, name)).arg("--version"),
        Some(PROBE_TIMEOUT),
    )?;
    if !output.success() {
        bail!("{name} --version failed");
    }
    Ok(())
}

/// The post-switch sanity probe: compile and execute a trivial C program.
pub(crate) fn quick_compile_check(config: &Config) -> Result<()> {
    compile_and_run(config, "cc", "probe.c", C_PROBE, &[])
}

/// Runs the full validation suite.
pub(crate) fn run_suite(config: &Config) -> Result<ValidationReport> {
    let mut results = BTreeMap::new();
    let mut record = |name: &str, result: Result<()>| {
        if let Err(e) = &result {
            debug!("probe {name} failed: {e:#}");
        }
        results.insert(name.to_string(), result.is_ok());
    };

    record("c", compile_and_run(config, "cc", "probe.c", C_PROBE, &[]));
    record(
        "cxx",
        compile_and_run(config, "c++", "probe.cpp", CXX_PROBE, &[]),
    );
    // Fortran support is optional; probe it only when the managed toolchain
    // carries a gfortran.
    if config.toolchain_bin_dir.join("gfortran").exists() {
        record(
            "fortran",
            compile_and_run(config, "gfortran", "probe.f90", FORTRAN_PROBE, &[]),
        );
    }
    record("ld", version_check(config, "ld"));
    record("as", version_check(config, "as"));
    record("ar", version_check(config, "ar"));
    record(
        "pthread",
        compile_and_run(config, "cc", "probe_pthread.c", PTHREAD_PROBE, &["-lpthread"]),
    );
    record(
        "kernel_headers",
        compile(config, "cc", "probe_kernel.c", KERNEL_HEADERS_PROBE, &[]).map(|_| ()),
    );
    record("libtool", version_check(config, "libtoolize"));
    drop(record);

    let ok = results.values().all(|ok| *ok);
    Ok(ValidationReport { results, ok })
}
