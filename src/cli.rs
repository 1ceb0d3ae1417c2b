use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::plan::SyncDirection;

#[derive(Parser, Debug)]
#[command(name = "mirrorsync")]
#[command(about = "Edit and sync remote resource sets against a local mirror")]
pub struct Args {
    /// Path to a JSON config file; defaults apply when omitted
    #[arg(long, env = "MIRRORSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory backing the remote store (one manifest per resource set)
    #[arg(long, env = "MIRRORSYNC_REMOTE", default_value = "./remote")]
    pub remote: PathBuf,

    /// Root of the local mirror
    #[arg(long, env = "MIRRORSYNC_MIRROR", default_value = "./mirror")]
    pub mirror: PathBuf,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the blob hash of a local file
    Hash { path: PathBuf },

    /// Print a remote file and its hash
    Read { set: String, file: String },

    /// Replace one span of a remote file
    Edit {
        set: String,
        file: String,
        #[arg(long)]
        search: String,
        #[arg(long)]
        replace: String,
        /// Minimum similarity for approximate matches
        #[arg(long)]
        threshold: Option<f64>,
        /// Zero-based occurrence when the search text matches several times
        #[arg(long)]
        occurrence: Option<usize>,
        /// Refuse the edit unless the file still has this hash
        #[arg(long)]
        expect: Option<String>,
        #[arg(long)]
        force: bool,
    },

    /// Plan a sync and run it
    Sync {
        set: String,
        #[arg(long, value_enum, default_value_t = Direction::Pull)]
        direction: Direction,
        /// Run plans that delete files without asking
        #[arg(long)]
        yes: bool,
    },

    /// Show who holds the lock on a resource set
    LockStatus { set: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Direction {
    Pull,
    Push,
}

impl From<Direction> for SyncDirection {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Pull => SyncDirection::Pull,
            Direction::Push => SyncDirection::Push,
        }
    }
}
