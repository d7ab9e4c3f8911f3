//! Command-line argument parsing for warehouse-mcp
//!
//! Provides clap-based CLI with subcommands and verbosity control. Flags
//! override values from the config file.

use crate::cli::config::{Config, SslModeSetting};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// warehouse-mcp - Expose a Redshift-compatible warehouse to agents over MCP
#[derive(Parser, Debug)]
#[command(name = "warehouse-mcp")]
#[command(version)]
#[command(about = "Serve warehouse schema and SQL tools over MCP (stdio)", long_about = None)]
pub struct Args {
    /// Configuration file path (default: ~/.warehouse-mcp/config.toml)
    #[arg(short, long, env = "WAREHOUSE_MCP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Warehouse host
    #[arg(long, env = "WAREHOUSE_HOST")]
    pub host: Option<String>,

    /// Warehouse port
    #[arg(long, env = "WAREHOUSE_PORT")]
    pub port: Option<u16>,

    /// Database name
    #[arg(long, env = "WAREHOUSE_DATABASE")]
    pub database: Option<String>,

    /// Database user
    #[arg(long, env = "WAREHOUSE_USER")]
    pub user: Option<String>,

    /// Database password
    #[arg(long, env = "WAREHOUSE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// TLS mode
    #[arg(long, value_enum)]
    pub sslmode: Option<SslModeSetting>,

    /// Maximum concurrent warehouse connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Statement timeout in seconds (0 disables)
    #[arg(long)]
    pub statement_timeout: Option<u64>,

    /// Maximum rows returned by one query
    #[arg(long)]
    pub max_rows: Option<usize>,

    /// Only allow SELECT/WITH/SHOW/EXPLAIN/VALUES statements
    #[arg(long)]
    pub read_only: bool,

    /// Verbosity level: -q (quiet), default (normal), -v (verbose), -vv (very verbose)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Subcommand (default: serve)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the MCP server on stdin/stdout
    Serve,

    /// Open one connection and run SELECT 1
    Check,

    /// Print the effective configuration (password redacted)
    Config,
}

/// Verbosity level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
    VeryVerbose,
}

impl Args {
    /// Get verbosity level based on flags
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            match self.verbose {
                0 => Verbosity::Normal,
                1 => Verbosity::Verbose,
                _ => Verbosity::VeryVerbose,
            }
        }
    }

    /// Subcommand to run
    pub fn command(&self) -> Commands {
        self.command.unwrap_or(Commands::Serve)
    }

    /// Overlay flag values on top of `config`
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.warehouse.host = host.clone();
        }
        if let Some(port) = self.port {
            config.warehouse.port = port;
        }
        if let Some(database) = &self.database {
            config.warehouse.database = database.clone();
        }
        if let Some(user) = &self.user {
            config.warehouse.user = user.clone();
        }
        if let Some(password) = &self.password {
            config.warehouse.password = Some(password.clone());
        }
        if let Some(sslmode) = self.sslmode {
            config.warehouse.sslmode = sslmode;
        }
        if let Some(max) = self.max_connections {
            config.pool.max_connections = max;
        }
        if let Some(timeout) = self.statement_timeout {
            config.query.statement_timeout_sec = timeout;
        }
        if let Some(max_rows) = self.max_rows {
            config.query.max_rows = max_rows;
        }
        if self.read_only {
            config.query.read_only = true;
        }
    }
}

impl Verbosity {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Quiet => "quiet",
            Verbosity::Normal => "normal",
            Verbosity::Verbose => "verbose",
            Verbosity::VeryVerbose => "very_verbose",
        }
    }

    /// Default `EnvFilter` directive when RUST_LOG is unset
    pub fn filter_directive(&self) -> &'static str {
        match self {
            Verbosity::Quiet => "warehouse_mcp=error",
            Verbosity::Normal => "warehouse_mcp=info",
            Verbosity::Verbose => "warehouse_mcp=debug",
            Verbosity::VeryVerbose => "warehouse_mcp=trace,tokio_postgres=debug",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(parse(&["warehouse-mcp"]).verbosity(), Verbosity::Normal);
        assert_eq!(parse(&["warehouse-mcp", "-q"]).verbosity(), Verbosity::Quiet);
        assert_eq!(parse(&["warehouse-mcp", "-v"]).verbosity(), Verbosity::Verbose);
        assert_eq!(parse(&["warehouse-mcp", "-vv"]).verbosity(), Verbosity::VeryVerbose);
    }

    #[test]
    fn test_default_command_is_serve() {
        assert_eq!(parse(&["warehouse-mcp"]).command(), Commands::Serve);
        assert_eq!(parse(&["warehouse-mcp", "check"]).command(), Commands::Check);
        assert_eq!(parse(&["warehouse-mcp", "config"]).command(), Commands::Config);
    }

    #[test]
    fn test_flags_override_config() {
        let args = parse(&[
            "warehouse-mcp",
            "--host",
            "cluster.example.com",
            "--port",
            "5440",
            "--sslmode",
            "disable",
            "--max-connections",
            "3",
            "--max-rows",
            "100",
            "--read-only",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.warehouse.host, "cluster.example.com");
        assert_eq!(config.warehouse.port, 5440);
        assert_eq!(config.warehouse.sslmode, SslModeSetting::Disable);
        assert_eq!(config.pool.max_connections, 3);
        assert_eq!(config.query.max_rows, 100);
        assert!(config.query.read_only);
        assert_eq!(config.warehouse.database, "dev");
    }

    #[test]
    fn test_invalid_sslmode_rejected() {
        assert!(Args::try_parse_from(["warehouse-mcp", "--sslmode", "maybe"]).is_err());
    }
}
