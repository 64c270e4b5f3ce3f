//! # icp-sweep CLI
//!
//! ## Usage
//!
//! ```bash
//! icp-sweep --config ./config/icp-sweep.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `icp-sweep init` | Create the SQLite cache and its schema |
//! | `icp-sweep sweep` | Discover assets for one or more targets |
//! | `icp-sweep status` | Cache self-check report |
//! | `icp-sweep show <target>` | Print cached data for one target, offline |
//!
//! ## Examples
//!
//! ```bash
//! # Sweep every keyword in a file, skipping the reverse lookup
//! icp-sweep sweep --input targets.txt --no-reverse
//!
//! # One-off target, no scanner runs
//! icp-sweep sweep --target "Acme" --no-runners
//!
//! # Cached entities for a target as JSON
//! icp-sweep show "Acme" --json
//! ```

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use icp_sweep::config;
use icp_sweep::logging;
use icp_sweep::migrate;
use icp_sweep::pipeline::{self, SweepOptions};
use icp_sweep::show;
use icp_sweep::status;

/// icp-sweep: ICP-keyword asset discovery with a persistent expiry cache.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/icp-sweep.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "icp-sweep",
    about = "ICP-keyword asset discovery with a persistent expiry cache",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/icp-sweep.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite file and all tables. Safe to run repeatedly.
    Init,

    /// Discover assets for the given targets.
    ///
    /// Each target is served from cache when fresh, otherwise fetched from
    /// the scroll API. Independent IPs are then reverse-looked-up, results
    /// are grouped by entity, exported, and handed to configured runners.
    Sweep {
        /// File with one target keyword per line.
        #[arg(long)]
        input: Option<PathBuf>,

        /// Target keyword (repeatable). Combined with `--input`.
        #[arg(long = "target")]
        targets: Vec<String>,

        /// Skip the reverse lookup.
        #[arg(long)]
        no_reverse: bool,

        /// Do not write per-entity files.
        #[arg(long)]
        no_export: bool,

        /// Do not invoke external runners.
        #[arg(long)]
        no_runners: bool,

        /// Override `[output].dir`.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Report cache state for every known target.
    Status,

    /// Print cached data for one target without network access.
    Show {
        target: String,

        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sweep {
            input,
            targets,
            no_reverse,
            no_export,
            no_runners,
            output,
        } => {
            let mut all = Vec::new();
            if let Some(path) = &input {
                all.extend(pipeline::load_targets(path)?);
            }
            all.extend(targets);
            let all = pipeline::dedup_targets(all);
            if all.is_empty() {
                bail!("no targets given (use --input FILE or --target NAME)");
            }

            let mut opts = SweepOptions::from_config(&cfg);
            opts.reverse &= !no_reverse;
            opts.export = !no_export;
            opts.runners = !no_runners;
            if let Some(dir) = output {
                opts.output_dir = dir;
            }

            pipeline::run_sweep(&cfg, &all, &opts).await?;
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
        Commands::Show { target, json } => {
            show::run_show(&cfg, &target, json).await?;
        }
    }

    Ok(())
}
