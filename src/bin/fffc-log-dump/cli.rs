//! The command line interface of the log inspector

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(about = "fffc replay-log inspector")]
pub struct Cli {
    #[arg(help = "The replay log to inspect.", required = true)]
    pub log: PathBuf,

    #[arg(
        help = "Only validate the structure, do not print records.",
        short = 'q',
        long = "quiet"
    )]
    pub quiet: bool,
}
