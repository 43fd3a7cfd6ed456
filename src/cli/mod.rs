//! Command-line interface for ldapguard.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// LDAP directory backup and restore service
#[derive(Parser, Debug)]
#[command(name = "ldapguard")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the API server, worker pool, scheduler and notifier
    #[command(alias = "-d", alias = "--daemon")]
    Daemon,

    /// Create default config file
    #[command(alias = "--init")]
    Init,

    /// Print the next fire times of a cron expression (UTC)
    Cron {
        /// Five or six field expression, quote it in the shell
        expression: String,
        /// Number of fire times to print
        #[arg(long, short = 'n', default_value = "5")]
        count: usize,
    },

    /// Check an artifact's header, manifest and payload checksum
    Verify {
        /// Path to the artifact file
        path: PathBuf,
    },
}

pub use commands::{cmd_cron, cmd_verify};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cron_command() {
        let cli = Cli::try_parse_from(["ldapguard", "cron", "0 2 * * *", "--count", "3"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::Cron {
                expression: "0 2 * * *".to_string(),
                count: 3,
            })
        );
    }

    #[test]
    fn test_no_subcommand_defaults_to_none() {
        let cli = Cli::try_parse_from(["ldapguard"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_verify_requires_path() {
        assert!(Cli::try_parse_from(["ldapguard", "verify"]).is_err());
    }
}
