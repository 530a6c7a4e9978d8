//! Shared CLI helpers and small reusable Clap fragments

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// File-manager agent options (dashfmd)
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "dashfmd - serve a directory to dashfm clients over WebSocket")]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long, default_value = "127.0.0.1:8008")]
    pub bind: String,

    /// Root directory to serve
    #[arg(long, default_value = ".")]
    pub root: PathBuf,
}

/// File-manager client options (dashfm)
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "dashfm - remote file manager client for the monitoring dashboard")]
pub struct ClientOpts {
    /// Full WebSocket URL of the session (ws://... or wss://...)
    #[arg(long, conflicts_with = "dashboard")]
    pub url: Option<String>,

    /// Dashboard base URL; combined with --session (overrides the config file)
    #[arg(long)]
    pub dashboard: Option<String>,

    /// Session id issued by the dashboard's file-manager endpoint
    #[arg(long, required_unless_present = "url")]
    pub session: Option<String>,

    /// Config file (default: ~/.config/dashfm/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Append session events to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// List a remote directory (default: the agent's root)
    Ls {
        path: Option<String>,

        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Download a remote file
    Get {
        /// Remote path, e.g. /var/log/syslog
        remote: String,

        /// Local directory to save into (overrides download_dir)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Upload a local file
    Put {
        local: PathBuf,

        /// Remote directory to upload into (default: the agent's root)
        #[arg(long, default_value = "")]
        to: String,
    },
}
