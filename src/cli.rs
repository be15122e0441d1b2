use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};

use crate::{catalog::ItemId, search::Mode};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register photos found in a directory and queue them for processing.
    Scan {
        /// Directory to scan, defaults to library.photos_dir
        dir: Option<PathBuf>,

        /// Only register photos, don't process them
        #[clap(long, default_value = "false")]
        no_process: bool,
    },

    /// Run the enrichment pipeline for photos.
    Process {
        /// Photo ids
        ids: Vec<ItemId>,

        /// Process every photo that is pending or failed
        #[clap(long, default_value = "false", conflicts_with = "ids")]
        pending: bool,
    },

    /// Search processed photos.
    Search(SearchArgs),

    /// Start the API server and the processing queue.
    Serve {
        /// Listen address, defaults to server.addr
        #[clap(long)]
        addr: Option<String>,
    },

    /// Show processing statistics.
    Stats {},

    /// Show everything known about a photo.
    Show { id: ItemId },

    /// Manage label categories.
    Categories {
        #[command(subcommand)]
        command: CategoriesCommand,
    },

    /// Delete stored perceptual hashes that are not 64 hex chars.
    PurgeHashes {
        /// Don't ask for confirmation
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum CategoriesCommand {
    /// Insert missing built-in and configured mappings.
    Sync {},

    /// List known mappings.
    List {},
}

#[derive(ClapArgs, Debug, Clone)]
pub struct SearchArgs {
    pub query: String,

    /// hybrid, keyword or semantic
    #[clap(short, long, default_value = "hybrid")]
    pub mode: Mode,

    /// Restrict to photos with detections in this category, repeatable
    #[clap(short, long = "category")]
    pub categories: Vec<String>,

    /// Only photos taken on or after this day (YYYY-MM-DD)
    #[clap(long, value_parser = parse_day_start)]
    pub from: Option<DateTime<Utc>>,

    /// Only photos taken on or before this day (YYYY-MM-DD)
    #[clap(long, value_parser = parse_day_end)]
    pub to: Option<DateTime<Utc>>,

    #[clap(short, long, default_value = "1")]
    pub page: usize,

    #[clap(long)]
    pub page_size: Option<usize>,
}

fn parse_day(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| format!("expected YYYY-MM-DD, got '{value}': {e}"))
}

fn parse_day_start(value: &str) -> Result<DateTime<Utc>, String> {
    parse_day(value)?
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("invalid date '{value}'"))
}

fn parse_day_end(value: &str) -> Result<DateTime<Utc>, String> {
    parse_day(value)?
        .and_hms_opt(23, 59, 59)
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("invalid date '{value}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_args() {
        let args = Args::try_parse_from([
            "phototag", "search", "red car", "-m", "keyword", "-c", "vehicles", "--from",
            "2024-01-31",
        ])
        .unwrap();

        let Command::Search(search) = args.command else {
            panic!("expected search command");
        };
        assert_eq!(search.query, "red car");
        assert_eq!(search.mode, Mode::Keyword);
        assert_eq!(search.categories, vec!["vehicles"]);
        assert_eq!(search.from.unwrap().to_rfc3339(), "2024-01-31T00:00:00+00:00");
        assert!(search.to.is_none());
        assert_eq!(search.page, 1);
    }

    #[test]
    fn test_day_end_is_inclusive() {
        let end = parse_day_end("2024-02-29").unwrap();
        assert_eq!(end.to_rfc3339(), "2024-02-29T23:59:59+00:00");
        assert!(parse_day_start("2024-13-01").is_err());
    }

    #[test]
    fn test_process_pending_conflicts_with_ids() {
        assert!(Args::try_parse_from(["phototag", "process", "--pending", "3"]).is_err());
        assert!(Args::try_parse_from(["phototag", "process", "--pending"]).is_ok());
    }
}
