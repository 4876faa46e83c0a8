//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;

/// Price comparison platform CLI
#[derive(Parser)]
#[command(name = "pricecmp-cli")]
#[command(about = "Fans product searches out to several stores and merges the results")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind to (defaults to server.host:server.port)
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Run one search against the configured sources and print the result
    Search {
        query: String,
        /// Requester the result is recorded for
        #[arg(long, default_value = "cli")]
        requester: String,
    },
    /// Run a single coupon refresh cycle
    RefreshOnce,
    /// Print the effective configuration as TOML
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search() {
        let cli = Cli::try_parse_from(["pricecmp-cli", "search", "running shoes"]).unwrap();
        match cli.command {
            Commands::Search { query, requester } => {
                assert_eq!(query, "running shoes");
                assert_eq!(requester, "cli");
            }
            _ => panic!("expected search"),
        }
    }

    #[test]
    fn test_parse_serve_addr() {
        let cli = Cli::try_parse_from(["pricecmp-cli", "serve", "--addr", "0.0.0.0:9000"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Serve { addr: Some(addr) } if addr.port() == 9000
        ));
    }

    #[test]
    fn test_parse_refresh_once() {
        let cli = Cli::try_parse_from(["pricecmp-cli", "refresh-once"]).unwrap();
        assert!(matches!(cli.command, Commands::RefreshOnce));
    }
}
