//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Resumable HTTP downloads that survive restarts.
///
/// URLs are kept in a persistent registry. `run` streams every pending
/// download to a temp file, resuming interrupted transfers with a range
/// request when the server supports it.
#[derive(Parser, Debug)]
#[command(name = "downloader")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Directory holding the registry and temp files (overrides config file)
    #[arg(long, global = true, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Engine commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add URLs (optional) and download everything pending
    Run {
        /// URLs to add before starting
        urls: Vec<String>,
    },
    /// Register URLs without downloading
    Add {
        /// URLs to register
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Show the registry
    List {
        /// Print the records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Exclude a download from scheduling
    Pause {
        /// Registered URL
        url: String,
    },
    /// Make a paused download eligible again
    Resume {
        /// Registered URL
        url: String,
    },
    /// Remove a download and its temp file
    Delete {
        /// Registered URL
        url: String,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Move a completed download to DEST and forget it
    SaveAs {
        /// Registered URL
        url: String,
        /// Destination file or directory
        dest: PathBuf,
    },
}
