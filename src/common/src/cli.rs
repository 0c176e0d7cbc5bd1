use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared by every subcommand
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, env = "PARTKEEPER_CONFIG", help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Subcommands that inspect the configuration and exit
#[derive(Subcommand, Debug, Clone)]
pub enum CommonCommands {
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::{Configuration, LoggingConfig};
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Pick the default filter directive. `--quiet` and `--verbose` win over
    /// the configured level; `RUST_LOG` wins over both.
    pub fn log_directive(args: &CommonArgs, logging: &LoggingConfig) -> String {
        if args.quiet {
            "warn".to_string()
        } else if args.verbose {
            "debug".to_string()
        } else {
            logging.level.clone()
        }
    }

    /// Install the global tracing subscriber
    pub fn init_logging(args: &CommonArgs, logging: &LoggingConfig) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_directive(args, logging)));

        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        let result = if logging.format == "json" {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        if let Err(e) = result {
            eprintln!("Logging already initialized: {e}");
        }
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("partkeeper configuration:");
            println!("=========================");
            for db in &config.databases {
                println!(
                    "Database {}: {} replica(s), {} max connections",
                    db.name,
                    db.replica_dsns.len(),
                    db.max_connections
                );
            }

            let partitioning = &config.partitioning;
            println!("Partitioning enabled: {}", partitioning.enabled);
            println!("Sync interval: {:?}", partitioning.sync_interval);
            println!("Drop interval: {:?}", partitioning.drop_interval);
            println!("Retain detached for: {:?}", partitioning.retain_detached_for);
            println!(
                "Lock retries: {} ({} iterations)",
                if partitioning.lock_retries.enabled {
                    "enabled"
                } else {
                    "disabled"
                },
                partitioning.lock_retries.timing.len()
            );
            for table in &partitioning.tables {
                println!("Table {} on {}: {:?}", table.name, table.database, table.strategy);
            }
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        tracing::info!("Validating configuration...");

        for db in &config.databases {
            if db.dsn.is_empty() {
                anyhow::bail!("DSN of database {} cannot be empty", db.name);
            }
        }
        config.validate().context("Invalid configuration")?;

        tracing::info!("✅ Configuration validation passed");
        Ok(())
    }

    /// Handle the configuration-only subcommands
    pub fn handle_common_command(command: &CommonCommands, config: &Configuration) -> Result<()> {
        match command {
            CommonCommands::Config { json } => display_config(config, *json),
            CommonCommands::Validate => validate_config(config),
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(())
            }
        }
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "partkeeper {} ({})",
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, LoggingConfig};

    fn args(verbose: bool, quiet: bool) -> CommonArgs {
        CommonArgs {
            config: None,
            verbose,
            quiet,
        }
    }

    #[test]
    fn test_log_directive() {
        let logging = LoggingConfig::default();
        assert_eq!(utils::log_directive(&args(false, false), &logging), "info");
        assert_eq!(utils::log_directive(&args(true, false), &logging), "debug");
        assert_eq!(utils::log_directive(&args(true, true), &logging), "warn");
    }

    #[test]
    fn test_validate_rejects_empty_dsn() {
        let mut config = Configuration::default();
        config.databases[0].dsn.clear();
        assert!(utils::validate_config(&config).is_err());
    }

    #[test]
    fn test_version_info() {
        let version = utils::version_info();
        assert!(version.contains(env!("CARGO_PKG_VERSION")));
    }
}
