//! Command-line interface for ifdhandler.
//!
//! Provides commands for preparing the status file, running reader and
//! master daemons, and inspecting or stopping them.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// OpenCT reader daemon - serves one smart-card reader over a Unix socket
#[derive(Debug, Parser)]
#[command(name = "ifdhandler")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "OPENCT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, env = "OPENCT_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Override the socket directory
    #[arg(short, long, global = true, env = "OPENCT_SOCKETDIR")]
    pub socket_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create an empty status file for every configured reader
    Init,

    /// Serve one configured reader
    Start {
        /// Reader index in the configuration
        #[arg(short, long)]
        reader: usize,

        /// Stay attached to the terminal
        #[arg(short, long)]
        foreground: bool,
    },

    /// Serve the master socket
    Master,

    /// List readers and slot states
    List,

    /// Stop every running reader daemon
    Shutdown,
}
