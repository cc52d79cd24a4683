mod output;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use strata_core::commands::validate;
use strata_core::config::{CliOverrides, StrataConfig};
use strata_core::error::StrataError;
use strata_core::hooks::HookRegistry;
use strata_core::{MigrateOptions, Strata};

#[derive(Parser)]
#[command(
    name = "strata",
    about = "Versioned changelog migrations for PostgreSQL modules",
    version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("GIT_HASH"), " ", env!("BUILD_TIME"), ")"
    ),
    propagate_version = true
)]
struct Cli {
    /// Config file path (default: strata.toml)
    #[arg(short, long = "config-file", alias = "config_file", value_name = "PATH")]
    config: Option<String>,

    /// Database URL (overrides config)
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// Module name recorded in the ledger (overrides config)
    #[arg(long, value_name = "NAME")]
    module: Option<String>,

    /// Ledger schema (overrides config)
    #[arg(long, value_name = "SCHEMA")]
    schema: Option<String>,

    /// Ledger table name (overrides config)
    #[arg(long, value_name = "TABLE")]
    table: Option<String>,

    /// Changelogs directory (overrides config)
    #[arg(long, value_name = "PATH")]
    changelogs: Option<PathBuf>,

    /// Number of retries when connecting to the database
    #[arg(long, value_name = "N")]
    connect_retries: Option<u32>,

    /// SSL/TLS mode: disable, prefer, require
    #[arg(long, value_name = "MODE")]
    ssl_mode: Option<String>,

    /// Connection timeout in seconds (default: 30, 0 = no timeout)
    #[arg(long, value_name = "SECS")]
    connect_timeout: Option<u32>,

    /// Statement timeout in seconds (default: 0 = no limit)
    #[arg(long, value_name = "SECS")]
    statement_timeout: Option<u32>,

    /// Skip validating changelogs and hooks before running
    #[arg(long)]
    no_validate: bool,

    /// Output results as JSON
    #[arg(long)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Enable verbose/debug output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Default)]
struct ParameterArgs {
    /// Parameter value, e.g. `-p field_length 80` (repeatable)
    #[arg(
        short = 'p',
        long = "parameter",
        num_args = 2,
        value_names = ["NAME", "VALUE"],
        action = clap::ArgAction::Append
    )]
    parameters: Vec<String>,
}

impl ParameterArgs {
    fn to_map(&self) -> HashMap<String, String> {
        self.parameters
            .chunks(2)
            .filter_map(|pair| match pair {
                [name, value] => Some((name.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }
}

#[derive(Args)]
struct MigrateArgs {
    /// Apply changelogs up to this version only
    #[arg(long, value_name = "VERSION")]
    max_version: Option<String>,

    #[command(flatten)]
    params: ParameterArgs,

    /// Mark the installation as beta testing; later upgrades require --force
    #[arg(long)]
    beta_testing: bool,

    /// Do not run the drop-app hooks
    #[arg(long)]
    skip_drop_app: bool,

    /// Do not run the create-app hooks
    #[arg(long)]
    skip_create_app: bool,
}

impl MigrateArgs {
    fn options(&self) -> MigrateOptions {
        MigrateOptions {
            max_version: self.max_version.clone(),
            parameters: self.params.to_map(),
            beta_testing: self.beta_testing,
            skip_drop_app: self.skip_drop_app,
            skip_create_app: self.skip_create_app,
            ..MigrateOptions::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show changelog and ledger status
    Info,

    /// Check changelogs and hooks without connecting to the database
    Validate {
        #[command(flatten)]
        params: ParameterArgs,
    },

    /// Install the module into a database that has no ledger
    Install {
        #[command(flatten)]
        args: MigrateArgs,

        /// Load the named demo data set after installing
        #[arg(long, value_name = "NAME")]
        demo_data: Option<String>,
    },

    /// Apply changelogs newer than the installed baseline
    Upgrade {
        #[command(flatten)]
        args: MigrateArgs,

        /// Upgrade even if the installation is in beta testing mode
        #[arg(long)]
        force: bool,
    },

    /// Run the uninstall hooks
    Uninstall {
        #[command(flatten)]
        params: ParameterArgs,
    },

    /// Record a baseline version for an existing database
    Baseline {
        /// Version to baseline at
        #[arg(short, long, value_name = "VERSION")]
        baseline: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging (suppress when JSON output is requested)
    let filter = if cli.json || cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .without_time()
        .init();

    if let Err(e) = run(cli).await {
        print_error(&e);
        process::exit(exit_code(&e));
    }
}

/// Map error types to differentiated exit codes.
fn exit_code(error: &StrataError) -> i32 {
    match error {
        StrataError::ConfigError(_) | StrataError::PlaceholderNotFound { .. } => 2,
        StrataError::InvalidChangelog(_)
        | StrataError::InvalidSql { .. }
        | StrataError::ValidationFailed(_) => 3,
        StrataError::DatabaseError(_) => 4,
        StrataError::SqlExecution { .. } | StrataError::HookFailed { .. } => 5,
        StrataError::LockError(_) => 6,
        StrataError::MigrationState(_) => 7,
        StrataError::Cancelled(_) => 8,
        _ => 1,
    }
}

fn emit_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("{} {}", "ERROR:".red().bold(), e),
    }
}

async fn run(cli: Cli) -> Result<(), StrataError> {
    let json_output = cli.json;

    let overrides = CliOverrides {
        url: cli.url,
        module: cli.module,
        schema: cli.schema,
        table: cli.table,
        changelogs: cli.changelogs,
        validate_on_run: cli.no_validate.then_some(false),
        connect_retries: cli.connect_retries,
        ssl_mode: cli.ssl_mode,
        connect_timeout: cli.connect_timeout,
        statement_timeout: cli.statement_timeout,
    };

    let config = StrataConfig::load(cli.config.as_deref(), &overrides)?;

    // Validation never needs a connection
    if let Commands::Validate { params } = &cli.command {
        let report = validate::execute(&config, &HookRegistry::new(), &params.to_map())?;
        if json_output {
            emit_json(&report);
        } else {
            output::print_validate_result(&report);
        }
        return Ok(());
    }

    let strata = Strata::new(config).await?;

    // First Ctrl-C requests cancellation; the engine stops at the next step
    // unless it is already committing.
    let feedback = strata.feedback();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            feedback.cancel();
        }
    });

    match cli.command {
        Commands::Info => {
            let report = strata.info().await?;
            if json_output {
                emit_json(&report);
            } else {
                output::print_info(&report);
            }
        }
        Commands::Install { args, demo_data } => {
            let options = MigrateOptions {
                demo_data,
                ..args.options()
            };
            let report = strata.install(&options).await?;
            if json_output {
                emit_json(&report);
            } else {
                output::print_install_summary(&report);
            }
        }
        Commands::Upgrade { args, force } => {
            let options = MigrateOptions {
                force,
                ..args.options()
            };
            let report = strata.upgrade(&options).await?;
            if json_output {
                emit_json(&report);
            } else {
                output::print_upgrade_summary(&report);
            }
        }
        Commands::Uninstall { params } => {
            let report = strata.uninstall(&params.to_map(), true).await?;
            if json_output {
                emit_json(&report);
            } else {
                output::print_uninstall_summary(&report);
            }
        }
        Commands::Baseline { baseline } => {
            let report = strata.baseline(&baseline).await?;
            if json_output {
                emit_json(&report);
            } else {
                output::print_baseline_summary(&report);
            }
        }
        Commands::Validate { .. } => {}
    }

    Ok(())
}

fn print_error(error: &StrataError) {
    eprintln!("{} {}", "ERROR:".red().bold(), error);

    // Provide actionable guidance
    let hint = match error {
        StrataError::ConfigError(_) => {
            Some("Hint: Check your strata.toml or set STRATA_DATABASE_URL environment variable.")
        }
        StrataError::DatabaseError(_) => {
            Some("Hint: Verify database is running and connection details are correct.")
        }
        StrataError::PlaceholderNotFound { .. } => {
            Some("Hint: Declare the parameter in [[parameters]] or pass it with -p NAME VALUE.")
        }
        StrataError::MigrationState(msg) if msg.contains("beta") => {
            Some("Hint: Pass --force to upgrade a beta testing installation.")
        }
        StrataError::MigrationState(msg) if msg.contains("already exists") => {
            Some("Hint: Use 'strata upgrade' for an installed module.")
        }
        StrataError::Cancelled(_) => Some("Nothing was committed."),
        _ => None,
    };

    if let Some(hint) = hint {
        eprintln!("{}", hint.dimmed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_pairs() {
        let cli = Cli::try_parse_from([
            "strata",
            "install",
            "-p",
            "field_length",
            "80",
            "--parameter",
            "owner",
            "app",
        ])
        .unwrap();
        match cli.command {
            Commands::Install { args, .. } => {
                let params = args.params.to_map();
                assert_eq!(params.get("field_length").map(String::as_str), Some("80"));
                assert_eq!(params.get("owner").map(String::as_str), Some("app"));
            }
            _ => panic!("expected install"),
        }
    }

    #[test]
    fn test_upgrade_force_flag() {
        let cli = Cli::try_parse_from(["strata", "upgrade", "--force", "--max-version", "1.1"])
            .unwrap();
        match cli.command {
            Commands::Upgrade { args, force } => {
                assert!(force);
                assert_eq!(args.options().max_version.as_deref(), Some("1.1"));
            }
            _ => panic!("expected upgrade"),
        }
    }

    #[test]
    fn test_config_file_underscore_alias() {
        let cli = Cli::try_parse_from(["strata", "--config_file", "module.toml", "info"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("module.toml"));

        let cli = Cli::try_parse_from(["strata", "--config-file", "module.toml", "info"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("module.toml"));
    }

    #[test]
    fn test_baseline_requires_version() {
        assert!(Cli::try_parse_from(["strata", "baseline"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&StrataError::ConfigError("x".into())), 2);
        assert_eq!(exit_code(&StrataError::Cancelled("x".into())), 8);
        assert_eq!(exit_code(&StrataError::MigrationState("x".into())), 7);
    }
}
