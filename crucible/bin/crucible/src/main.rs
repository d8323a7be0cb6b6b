// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Thin CLI over the crucible core. Parses arguments, wires the public
//! operations together and prints results; all real work happens in the
//! library crates.

use std::{
    collections::BTreeSet,
    path::PathBuf,
    process::ExitCode,
    str::FromStr,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cliutil::LoggingConfig;
use config::Config;
use tracing::info;

/// Exit code for benign failures (nothing to do, problems detected).
const EXIT_PROBLEMS: u8 = 1;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Source-based package manager", long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the build pipeline for a package.
    Build {
        package: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        jobs: Option<u32>,
        #[arg(long)]
        keep_sandbox: bool,
        /// Skip dependency resolution before the build.
        #[arg(long)]
        no_deps: bool,
        #[arg(long)]
        include_optional: bool,
        #[arg(long)]
        force_fetch: bool,
        /// Comma-separated subset of stages to run.
        #[arg(long)]
        stages: Option<String>,
    },
    /// Install an artifact into the configured root.
    Install {
        artifact: PathBuf,
        #[arg(long)]
        dest: Option<PathBuf>,
        #[arg(long)]
        overwrite: bool,
        #[arg(long)]
        upgrade: bool,
    },
    /// Remove an installed package.
    Remove {
        package: String,
        #[arg(long)]
        purge: bool,
    },
    /// List installed packages.
    List,
    /// Search installed packages by substring.
    Search { pattern: String },
    /// Show the installed record of a package.
    Info { package: String },
    /// Check artifact integrity, and file presence with --deep.
    Verify {
        package: String,
        #[arg(long)]
        deep: bool,
    },
    /// Re-extract missing files of a package from its artifact.
    Repair { package: String },
    /// Resolve a set of requirements into an install order.
    Resolve {
        requirements: Vec<String>,
        #[arg(long)]
        include_optional: bool,
        #[arg(long)]
        refresh_index: bool,
    },
    /// Explain what the resolver sees for a set of requirements.
    Explain { requirements: Vec<String> },
    /// Build and install a package (and its dependencies) transactionally.
    Upgrade {
        package: String,
        #[arg(long)]
        commit: bool,
        #[arg(long)]
        no_deps: bool,
        #[arg(long)]
        include_optional: bool,
        #[arg(long)]
        jobs: Option<u32>,
        #[arg(long)]
        keep_sandbox: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Roll back to a snapshot.
    #[command(subcommand)]
    Rollback(RollbackCommand),
    /// List snapshots.
    Snapshots,
    /// Delete old snapshots beyond the retention policy.
    PruneSnapshots {
        #[arg(long)]
        retention: Option<usize>,
    },
    /// Detect (and optionally remove) orphaned packages.
    Orphan {
        #[arg(long)]
        remove: bool,
    },
    /// Check reverse dependencies and shared libraries.
    Revdep {
        #[arg(long)]
        fix: bool,
        #[arg(long)]
        no_ldd: bool,
        #[arg(long)]
        jobs: Option<u32>,
    },
    /// Show the rollback log.
    History {
        #[arg(long)]
        count: Option<usize>,
    },
    /// Toolchain management.
    #[command(subcommand)]
    Toolchain(ToolchainCommand),
    /// Managed language runtimes.
    #[command(subcommand)]
    Runtime(RuntimeCommand),
    /// Bootstrap a rootfs from the configured package sets.
    Bootstrap {
        #[arg(long)]
        rootfs: Option<PathBuf>,
        #[arg(long)]
        jobs: Option<u32>,
    },
    /// Create a template recipe.
    MetaCreate {
        name: String,
        category: String,
        #[arg(long, default_value = "0.1.0")]
        version: String,
        #[arg(long, default_value = "unknown")]
        maintainer: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Print the resolved configuration.
    Config,
}

#[derive(Subcommand, Debug)]
enum RollbackCommand {
    /// Roll back the most recent snapshot.
    Last {
        #[arg(long)]
        commit: bool,
        #[arg(long)]
        keep_sandbox: bool,
    },
    /// Roll one package back to a specific version.
    Package {
        package: String,
        version: String,
        #[arg(long)]
        commit: bool,
    },
}

#[derive(Subcommand, Debug)]
enum RuntimeCommand {
    /// List installed versions of a language.
    List {
        language: String,
        #[arg(long)]
        detailed: bool,
    },
    /// Build and install a language version from its recipe.
    Install { language: String, version: String },
    /// Make a version the default (global, or per-user with --user).
    SetDefault {
        language: String,
        version: String,
        #[arg(long)]
        user: bool,
    },
    /// Remove an installed version.
    Remove { language: String, version: String },
    /// Execute-and-check a version's interpreter.
    Validate { language: String, version: String },
    /// Revalidate and reinstall broken versions of a language.
    Repair { language: String },
    /// Report default and health of every installed version.
    Diagnose { language: String },
}

#[derive(Subcommand, Debug)]
enum ToolchainCommand {
    /// Show the toolchain state.
    Status,
    /// List installed versions of a component (compiler, kernel).
    Versions { component: String },
    /// Switch a component version with validation and rollback.
    SetActive { component: String, version: String },
    /// Apply a named profile.
    UseProfile { name: String },
    /// Run the full validation suite.
    Validate,
    /// Rebuild outdated toolchain packages.
    Rebuild {
        #[arg(long)]
        jobs: Option<u32>,
    },
}

fn main() -> ExitCode {
    let args = Cli::parse();
    let logging = match LoggingConfig::from_env() {
        Ok(logging) => logging,
        Err(e) => {
            eprintln!("FATAL: {e:#}");
            return ExitCode::from(2);
        }
    };
    cliutil::cli_main(move || run(args), logging)
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    }
}

fn run(args: Cli) -> Result<ExitCode> {
    let config = load_config(&args.config)?;
    config.ensure_dirs()?;

    match args.command {
        Command::Build {
            package,
            category,
            jobs,
            keep_sandbox,
            no_deps,
            include_optional,
            force_fetch,
            stages,
        } => {
            let stages = match stages {
                Some(list) => {
                    let mut set = BTreeSet::new();
                    for name in list.split(',') {
                        set.insert(
                            builder::Stage::from_str(name.trim())
                                .map_err(|_| anyhow::anyhow!("unknown stage {name:?}"))?,
                        );
                    }
                    Some(set)
                }
                None => None,
            };
            let options = builder::BuildOptions {
                category,
                resolve_deps: !no_deps,
                include_optional,
                jobs,
                keep_sandbox,
                stages,
                force_fetch,
            };
            let product = builder::Builder::new(&config).build(&package, &options)?;
            match product.artifact {
                Some(artifact) => println!("{}", artifact.display()),
                None => println!("(no artifact; package stage skipped)"),
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Install {
            artifact,
            dest,
            overwrite,
            upgrade,
        } => {
            let db = pkgdb::PackageDb::new(&config.pkg_db);
            let mut options =
                pkgdb::InstallOptions::new(dest.as_deref().unwrap_or(&config.install_root));
            options.overwrite = overwrite;
            options.upgrade = upgrade;
            options.explicit = true;
            let record = db.install(&artifact, &options)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(ExitCode::SUCCESS)
        }

        Command::Remove { package, purge } => {
            let db = pkgdb::PackageDb::new(&config.pkg_db);
            if db.remove(&package, purge)? {
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("{package} is not installed");
                Ok(ExitCode::from(EXIT_PROBLEMS))
            }
        }

        Command::List => {
            let db = pkgdb::PackageDb::new(&config.pkg_db);
            for record in db.list_installed()? {
                println!("{} {}", record.name, record.version);
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Search { pattern } => {
            let db = pkgdb::PackageDb::new(&config.pkg_db);
            for record in db.search_installed(&pattern)? {
                println!("{} {}", record.name, record.version);
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Info { package } => {
            let db = pkgdb::PackageDb::new(&config.pkg_db);
            match db.query(&package)? {
                Some(record) => {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("{package} is not installed");
                    Ok(ExitCode::from(EXIT_PROBLEMS))
                }
            }
        }

        Command::Verify { package, deep } => {
            let db = pkgdb::PackageDb::new(&config.pkg_db);
            let issues = db.verify(&package, deep)?;
            if issues.is_empty() {
                println!("{package} OK");
                Ok(ExitCode::SUCCESS)
            } else {
                for issue in issues {
                    println!("{issue}");
                }
                Ok(ExitCode::from(EXIT_PROBLEMS))
            }
        }

        Command::Repair { package } => {
            let db = pkgdb::PackageDb::new(&config.pkg_db);
            let restored = db.repair(&package)?;
            println!("restored {} files", restored.len());
            Ok(ExitCode::SUCCESS)
        }

        Command::Resolve {
            requirements,
            include_optional,
            refresh_index,
        } => {
            if requirements.is_empty() {
                bail!("no requirements given");
            }
            let repo = recipe::Repository::new(&config.repo_dir);
            let index =
                resolver::RepoIndex::load_or_build(&repo, &config.index_file(), refresh_index)?;
            let mut solver = resolver::DependencyResolver::new(&index, &config.lockfile());
            let options = resolver::ResolveOptions {
                allow_optional: include_optional,
                max_steps: config.resolver_max_steps,
                timeout: Some(std::time::Duration::from_secs(config.resolver_timeout_secs)),
                ..Default::default()
            };
            let result = solver.resolve_names(&requirements, &options)?;
            if result.ok {
                for id in &result.order {
                    println!("{id}");
                }
                for issue in &result.issues {
                    eprintln!("warning: {issue}");
                }
                Ok(ExitCode::SUCCESS)
            } else {
                for issue in &result.issues {
                    eprintln!("{issue}");
                }
                let roots = requirements
                    .iter()
                    .map(|r| recipe::Requirement::parse(r))
                    .collect::<Result<Vec<_>>>()?;
                eprintln!("{}", serde_json::to_string_pretty(&solver.explain(&roots))?);
                Ok(ExitCode::from(EXIT_PROBLEMS))
            }
        }

        Command::Explain { requirements } => {
            let repo = recipe::Repository::new(&config.repo_dir);
            let index = resolver::RepoIndex::load_or_build(&repo, &config.index_file(), false)?;
            let solver = resolver::DependencyResolver::new(&index, &config.lockfile());
            let roots = requirements
                .iter()
                .map(|r| recipe::Requirement::parse(r))
                .collect::<Result<Vec<_>>>()?;
            println!("{}", serde_json::to_string_pretty(&solver.explain(&roots))?);
            Ok(ExitCode::SUCCESS)
        }

        Command::Upgrade {
            package,
            commit,
            no_deps,
            include_optional,
            jobs,
            keep_sandbox,
            dry_run,
        } => {
            let manager = transaction::TransactionManager::new(&config);
            let options = transaction::UpgradeOptions {
                category: None,
                commit,
                resolve_deps: !no_deps,
                include_optional,
                jobs,
                keep_sandbox,
                dry_run,
            };
            let report = manager.upgrade(&package, &options)?;
            info!("upgrade order: {}", report.order.join(", "));
            for (name, artifact) in &report.artifacts {
                println!("{name} {}", artifact.display());
            }
            if commit {
                println!("committed: {}", report.committed.join(", "));
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Rollback(rollback) => {
            let manager = transaction::TransactionManager::new(&config);
            match rollback {
                RollbackCommand::Last {
                    commit,
                    keep_sandbox,
                } => {
                    let report = manager.rollback_last(commit, keep_sandbox)?;
                    println!(
                        "snapshot {} restored {} packages",
                        report.snapshot,
                        report.restored.len()
                    );
                    if report.errors.is_empty() {
                        Ok(ExitCode::SUCCESS)
                    } else {
                        for (package, reason) in &report.errors {
                            eprintln!("{package}: {reason}");
                        }
                        Ok(ExitCode::from(EXIT_PROBLEMS))
                    }
                }
                RollbackCommand::Package {
                    package,
                    version,
                    commit,
                } => {
                    let report = manager.rollback_pkg_to_version(&package, &version, commit)?;
                    println!(
                        "{} -> {} (validated={}, committed={})",
                        report.package, report.target_version, report.validated, report.committed
                    );
                    Ok(ExitCode::SUCCESS)
                }
            }
        }

        Command::Snapshots => {
            let manager = transaction::TransactionManager::new(&config);
            for id in manager.list_snapshots()? {
                match manager.show_snapshot(&id)? {
                    Some(header) => println!(
                        "{id} {} [{}]",
                        header.operation,
                        header.packages.join(", ")
                    ),
                    None => println!("{id}"),
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::PruneSnapshots { retention } => {
            let manager = transaction::TransactionManager::new(&config);
            let removed =
                manager.prune_snapshots(retention.unwrap_or(config.snapshot_retention))?;
            println!("pruned {} snapshots", removed.len());
            Ok(ExitCode::SUCCESS)
        }

        Command::Orphan { remove } => {
            let manager = transaction::TransactionManager::new(&config);
            let report = manager.remove_orphans(!remove)?;
            for candidate in &report.candidates {
                println!("{candidate}");
            }
            for (package, reason) in &report.errors {
                eprintln!("{package}: {reason}");
            }
            if !remove && !report.candidates.is_empty() {
                return Ok(ExitCode::from(EXIT_PROBLEMS));
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Revdep { fix, no_ldd, jobs } => {
            let manager = transaction::TransactionManager::new(&config);
            if fix {
                let report = manager.revdep_fix(false, jobs)?;
                println!("fixed: {}", report.fixed.join(", "));
                for (package, reason) in &report.errors {
                    eprintln!("{package}: {reason}");
                }
                return Ok(if report.errors.is_empty() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::from(EXIT_PROBLEMS)
                });
            }
            let report = manager.revdep_check(!no_ldd)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.affected().is_empty() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_PROBLEMS))
            }
        }

        Command::History { count } => {
            let manager = transaction::TransactionManager::new(&config);
            for event in manager.history(count)? {
                println!("{}", serde_json::to_string(&event)?);
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Toolchain(toolchain_command) => {
            let manager = toolchain::ToolchainManager::new(&config);
            match toolchain_command {
                ToolchainCommand::Status => {
                    println!("{}", serde_json::to_string_pretty(&manager.state()?)?);
                }
                ToolchainCommand::Versions { component } => {
                    let component = parse_component(&component)?;
                    for version in manager.list_versions(component)? {
                        println!("{version}");
                    }
                }
                ToolchainCommand::SetActive { component, version } => {
                    let component = parse_component(&component)?;
                    manager.set_active(component, &version)?;
                    println!("{component} -> {version}");
                }
                ToolchainCommand::UseProfile { name } => {
                    manager.use_profile(&name)?;
                    println!("profile {name} active");
                }
                ToolchainCommand::Validate => {
                    let report = manager.validate()?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    if !report.ok {
                        return Ok(ExitCode::from(EXIT_PROBLEMS));
                    }
                }
                ToolchainCommand::Rebuild { jobs } => {
                    let report = manager.rebuild_toolchain(jobs)?;
                    println!("updated: {}", report.updated.join(", "));
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Runtime(runtime_command) => {
            let manager = runtime::RuntimeManager::new(&config);
            match runtime_command {
                RuntimeCommand::List { language, detailed } => {
                    if detailed {
                        for status in manager.list_runtimes_detailed(&language)? {
                            println!(
                                "{} {}{}",
                                status.version,
                                if status.ok { "OK" } else { "BROKEN" },
                                if status.default { " (default)" } else { "" }
                            );
                        }
                    } else {
                        for version in manager.list_runtimes(&language)? {
                            println!("{version}");
                        }
                    }
                }
                RuntimeCommand::Install { language, version } => {
                    manager.install_runtime(&language, &version)?;
                    println!("{language} {version} installed");
                }
                RuntimeCommand::SetDefault {
                    language,
                    version,
                    user,
                } => {
                    manager.set_default(&language, &version, user)?;
                    println!("{language} {version} is now the default");
                }
                RuntimeCommand::Remove { language, version } => {
                    if !manager.remove_runtime(&language, &version)? {
                        eprintln!("{language} {version} is not installed");
                        return Ok(ExitCode::from(EXIT_PROBLEMS));
                    }
                }
                RuntimeCommand::Validate { language, version } => {
                    if !manager.validate_runtime(&language, &version)? {
                        eprintln!("{language} {version} is broken");
                        return Ok(ExitCode::from(EXIT_PROBLEMS));
                    }
                    println!("{language} {version} OK");
                }
                RuntimeCommand::Repair { language } => {
                    for (version, action) in manager.repair_runtime(&language)? {
                        println!("{version}: {action}");
                    }
                }
                RuntimeCommand::Diagnose { language } => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&manager.diagnose(&language)?)?
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Bootstrap { rootfs, jobs } => {
            let manager = bootstrap::BootstrapManager::new(&config);
            manager.add_progress_callback(Box::new(|event, payload| {
                tracing::info!("{event}: {payload}");
            }));
            let report = manager.bootstrap_system(rootfs.as_deref(), jobs)?;
            println!("rootfs: {}", report.rootfs.display());
            if let Some(snapshot) = &report.snapshot {
                println!("snapshot: {}", snapshot.display());
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::MetaCreate {
            name,
            category,
            version,
            maintainer,
            description,
        } => {
            let repo = recipe::Repository::new(&config.repo_dir);
            let pkg_dir = repo.create(&name, &category, &version, &maintainer, &description)?;
            println!("{}", pkg_dir.display());
            Ok(ExitCode::SUCCESS)
        }

        Command::Config => {
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn parse_component(name: &str) -> Result<toolchain::Component> {
    toolchain::Component::from_str(name)
        .with_context(|| format!("unknown component {name:?} (compiler, kernel)"))
}
