//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Authentication core: pluggable authenticators behind one HTTP boundary
#[derive(Parser, Debug)]
#[command(name = "authn-core")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "AUTHN_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "AUTHN_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "AUTHN_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "AUTHN_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "AUTHN_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP server (default)
    Serve,

    /// Print installed, configured and enabled authenticators as JSON
    Authenticators {
        /// Account (defaults to the configured account)
        #[arg(long)]
        account: Option<String>,
    },

    /// Run the configuration-only status check of one authenticator
    Status {
        /// Authenticator type (`authn-jwt`, `authn-oidc`, ...)
        #[arg(required = true)]
        authenticator: String,

        /// Service id of the webservice
        #[arg(short, long)]
        service_id: Option<String>,

        /// Account (defaults to the configured account)
        #[arg(long)]
        account: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::parse_from(["authn-core", "--port", "9090"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9090));
    }

    #[test]
    fn status_takes_service_id() {
        let cli = Cli::parse_from(["authn-core", "status", "authn-jwt", "--service-id", "gitlab"]);
        match cli.command {
            Some(Command::Status {
                authenticator,
                service_id,
                account,
            }) => {
                assert_eq!(authenticator, "authn-jwt");
                assert_eq!(service_id.as_deref(), Some("gitlab"));
                assert!(account.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
