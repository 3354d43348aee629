// CLI definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_URL: &str = "http://127.0.0.1:7380";

#[derive(Parser)]
#[command(name = "chargied")]
#[command(author, version, about = "Chargie charge-management daemon for Linux")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon (default when no subcommand is given)
    Daemon {
        /// Path to config.toml
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the HTTP port
        #[arg(short, long)]
        port: Option<u16>,

        /// Log level (error, warn, info, debug, trace)
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Show daemon status
    #[command(visible_alias = "s")]
    Status {
        /// Daemon URL
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },

    /// Set the charge ceiling
    SetMax {
        /// Max percentage (20-100)
        #[arg(value_parser = clap::value_parser!(u8).range(20..=100))]
        value: u8,

        /// Daemon URL
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },

    /// Set the charge floor
    SetMin {
        /// Min percentage (20-100)
        #[arg(value_parser = clap::value_parser!(u8).range(20..=100))]
        value: u8,

        /// Daemon URL
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },

    /// Start a BLE scan
    Scan {
        /// Daemon URL
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },

    /// Disconnect from the device
    Disconnect {
        /// Daemon URL
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },

    /// Stop the daemon
    Stop {
        /// Daemon URL
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },
}
