//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the taskhost executor.

use clap::{Parser, Subcommand};

/// taskhost - Worker-side task executor
///
/// Registers with a coordinator, runs the task attempts it launches,
/// and reports their status, results and heartbeats back.
#[derive(Parser, Debug)]
#[command(name = "taskhost")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the executor
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the executor (connects to the coordinator and runs tasks)
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "TASKHOST_CONFIG")]
        config: Option<String>,

        /// Override the configured executor id
        #[arg(long)]
        executor_id: Option<String>,

        /// Override the coordinator URL
        #[arg(long)]
        coordinator: Option<String>,
    },

    /// List the task kinds this executor can run
    Tasks,

    /// Display version information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::parse_from(["taskhost", "run"]);
        match cli.command {
            Commands::Run { config, executor_id, coordinator } => {
                assert!(config.is_none());
                assert!(executor_id.is_none());
                assert!(coordinator.is_none());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_with_overrides() {
        let cli = Cli::parse_from([
            "taskhost",
            "run",
            "--config",
            "/path/to/config.toml",
            "--executor-id",
            "exec-7",
            "--coordinator",
            "ws://coordinator:7077",
        ]);
        match cli.command {
            Commands::Run { config, executor_id, coordinator } => {
                assert_eq!(config, Some("/path/to/config.toml".to_string()));
                assert_eq!(executor_id, Some("exec-7".to_string()));
                assert_eq!(coordinator, Some("ws://coordinator:7077".to_string()));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_verbose_flags() {
        let cli = Cli::parse_from(["taskhost", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_quiet_flag() {
        let cli = Cli::parse_from(["taskhost", "--quiet", "tasks"]);
        assert!(cli.quiet);
        assert!(matches!(cli.command, Commands::Tasks));
    }

    #[test]
    fn test_config_init_force() {
        let cli = Cli::parse_from(["taskhost", "config", "init", "--path", "x.toml", "--force"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Init { path, force },
            } => {
                assert_eq!(path, Some("x.toml".to_string()));
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }

    #[test]
    fn test_config_validate() {
        let cli = Cli::parse_from(["taskhost", "config", "validate", "-c", "x.toml"]);
        assert!(matches!(
            cli.command,
            Commands::Config {
                subcommand: ConfigSubcommand::Validate { config: Some(_) }
            }
        ));
    }
}
