//! Synchronize a Google Photos takeout tree with its JSON sidecars.
//!
//! Each exported media file is matched to the sidecar describing it, the
//! sidecar's taken-at instant and GPS fix are compared to the file's current
//! metadata and filesystem timestamps, and the minimal set of writes is
//! applied to bring the file in sync.

#![deny(warnings)]

use {
    std::{cmp::min, path::PathBuf, thread},
    structopt::StructOpt,
};

pub mod media;
pub mod plan;
pub mod sidecar;
pub mod sync;

pub use sync::{run, Failure, RunReport, Stage};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "takeout-sync",
    about = "Synchronize takeout media metadata and timestamps with their JSON sidecars"
)]
pub struct Options {
    /// Root of the takeout directory tree to synchronize
    #[structopt(parse(from_os_str))]
    pub path: PathBuf,

    /// Report what would change without modifying any file
    #[structopt(long)]
    pub dry_run: bool,

    /// Log at debug level
    #[structopt(long, short = "v")]
    pub verbose: bool,

    /// Also write a debug-level log (including per-file failure detail) to this file
    #[structopt(long, parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Number of parallel workers (default: twice the available cores, capped at 32)
    #[structopt(long)]
    pub threads: Option<usize>,
}

/// Default worker count: twice the available cores, capped at 32.
pub fn default_workers() -> usize {
    min(
        32,
        2 * thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
    )
}
