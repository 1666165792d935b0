//! # Command Line Interface Module
//!
//! The core needs only three things injected at init (the local runtime
//! id, where to listen for peer runtimes, and where the controller lives)
//! plus a few operational knobs. Everything else about the process comes
//! from the controller (or a DFG file) after boot.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::net::SocketAddr;
use std::path::PathBuf;

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Cyan.on_default())
}

/// Per-runtime execution engine for a controller-driven dataflow graph
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// This process's runtime id as it appears in the DFG
    #[arg(short = 'r', long, help_heading = "Core Options")]
    pub runtime_id: u32,

    /// Controller address (host:port); the runtime exits if unreachable
    #[arg(short = 'c', long, help_heading = "Core Options")]
    pub controller: SocketAddr,

    /// Listen address for inbound peer-runtime connections
    #[arg(
        short = 'l',
        long,
        default_value_t = default_listen(),
        help_heading = "Core Options"
    )]
    pub listen: SocketAddr,

    /// Apply a local DFG file at boot instead of waiting for the
    /// controller to drive creation
    #[arg(long, help_heading = "Core Options")]
    pub dfg: Option<PathBuf>,

    /// Capacity of each worker's data queue
    #[arg(long, default_value_t = crate::defaults::QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Document root for the bundled webserver MSUs
    #[arg(long, default_value = crate::defaults::WWW_DIR)]
    pub www_dir: PathBuf,

    /// Write the statistics sample log to this file
    #[arg(long, help_heading = "Output and Logging")]
    pub stat_log: Option<PathBuf>,

    /// Suppress console output below warnings
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Detailed log destination: a file path, or "stderr"
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], crate::defaults::LISTEN_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_invocation_parses() {
        let args =
            Args::try_parse_from(["dataflow-runtime", "-r", "1", "-c", "127.0.0.1:8090"]).unwrap();
        assert_eq!(args.runtime_id, 1);
        assert_eq!(args.listen.port(), crate::defaults::LISTEN_PORT);
        assert_eq!(args.queue_capacity, crate::defaults::QUEUE_CAPACITY);
        assert!(args.dfg.is_none());
    }

    #[test]
    fn controller_is_required() {
        assert!(Args::try_parse_from(["dataflow-runtime", "-r", "1"]).is_err());
    }
}
