use clap::Parser;
use std::path::PathBuf;

/// Download light novels with their illustrations and build EPUB files
#[derive(Parser, Debug)]
#[command(name = "novolume", version, about)]
pub struct Cli {
    /// Titles to process. Defaults to the `novels` list of the config file.
    pub titles: Vec<String>,

    /// Path to the JSON config file (defaults to ./novolume.json when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Regenerate the illustration ledger of every collection under the download
    /// root from the files on disk, then exit
    #[arg(long, default_value_t = false)]
    pub rebuild_ledgers: bool,
}
