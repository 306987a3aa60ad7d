// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use anchorage::{
    activate::ActivationRunner,
    config::{ConfigModel, DEFAULT_CONFIG_PATH},
    mount::{Fstab, SysMounter},
    path::unit_name,
    plan::MountPlanner,
    validate::Validator,
};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::{path::PathBuf, process::exit};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "anchorage [options] <anchorage-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to persistence configuration file.
    #[arg(short, long, global = true, value_name = "path", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log debug output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let config = ConfigModel::load(&self.config)?;
        match self.command {
            Command::Check => run_check(&config),
            Command::Plan(opts) => run_plan(&config, opts),
            Command::Activate(opts) => run_activate(&config, opts),
            Command::Units => run_units(&config),
            Command::ShowConfig => run_show_config(&config),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Validate persistence configuration.
    #[command(override_usage = "anchorage check [options]")]
    Check,

    /// Show bind mounts and links that activation would perform.
    #[command(override_usage = "anchorage plan [options]")]
    Plan(PlanOptions),

    /// Bind mount and link persisted paths onto the ephemeral root.
    #[command(override_usage = "anchorage activate [options] [--unit <unit_name>]...")]
    Activate(ActivateOptions),

    /// List execution units along with their persistent roots.
    #[command(override_usage = "anchorage units [options]")]
    Units,

    /// Print normalized persistence configuration.
    #[command(override_usage = "anchorage show-config [options]")]
    ShowConfig,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct PlanOptions {
    /// Render planned bind mounts as fstab entries.
    #[arg(short, long)]
    pub fstab: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ActivateOptions {
    /// Only activate given execution units.
    #[arg(short, long = "unit", value_name = "unit_name")]
    pub units: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(if cli.verbose { "debug" } else { "info" }))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = cli.run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run_check(config: &ConfigModel) -> Result<()> {
    let fstab = Fstab::load(&config.fstab)?;
    Validator::new(config).validate(&fstab)?;
    info!("configuration is valid");

    Ok(())
}

fn run_plan(config: &ConfigModel, opts: PlanOptions) -> Result<()> {
    let plan = MountPlanner::new(config).plan()?;
    if opts.fstab {
        print!("{}", plan.to_fstab());
    } else {
        print!("{plan}");
    }

    Ok(())
}

fn run_activate(config: &ConfigModel, opts: ActivateOptions) -> Result<()> {
    let fstab = Fstab::load(&config.fstab)?;
    let runner = ActivationRunner::new(config, SysMounter::new());
    let report = runner.activate_units(&fstab, opts.units.as_slice())?;
    print!("{report}");

    let failures = report.failures().count();
    if failures > 0 {
        bail!("{failures} persisted path(s) could not be activated");
    }

    if report.mutations() == 0 {
        info!("nothing to do, every persisted path is already in place");
    }

    Ok(())
}

fn run_units(config: &ConfigModel) -> Result<()> {
    for root in config.roots() {
        if root.directories.is_empty() && root.files.is_empty() {
            warn!("{} persists nothing", root.path.display());
        }
        println!("{} {}", unit_name(&root.path), root.path.display());
    }

    Ok(())
}

fn run_show_config(config: &ConfigModel) -> Result<()> {
    print!("{config}");

    Ok(())
}
