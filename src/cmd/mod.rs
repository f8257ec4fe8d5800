//! CLI subcommands

pub mod diagnostics;
pub mod root;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Check daemon prerequisites: socket resolution, Docker reachability
    Diagnostics,
}
