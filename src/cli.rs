//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use mangabook_core::download::constants::DEFAULT_RATE_LIMIT_MS;
use mangabook_core::{
    DEFAULT_GLOBAL_CONCURRENCY, DEFAULT_MAX_RETRIES, DEFAULT_PER_GROUP_CONCURRENCY,
    DEFAULT_RETENTION_DAYS,
};

/// Download manga volumes from MangaDex into a resumable local library.
///
/// Pages already on disk and recorded in the library manifest are kept;
/// only missing, damaged or replaced pages are fetched again.
#[derive(Parser, Debug)]
#[command(name = "mangabook")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored log output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download or update a manga's volumes
    Download(DownloadArgs),
    /// Show what the library manifest records for a manga
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    /// MangaDex manga id (UUID)
    #[arg(value_name = "MANGA_ID")]
    pub manga_id: String,

    /// Volumes to download, e.g. "1,3-5,7"; repeatable (default: all, "none" for unassigned chapters)
    #[arg(
        short = 'V',
        long = "volume",
        visible_alias = "volumes",
        value_name = "N|A-B",
        value_delimiter = ',',
        value_parser = parse_volume_selector
    )]
    pub volumes: Vec<VolumeSelector>,

    /// Refresh the chapters not yet assigned to a volume, overwriting existing pages (same as -V none --force)
    #[arg(long, conflicts_with = "volumes")]
    pub updates: bool,

    /// Translated language of the chapters
    #[arg(long, default_value = "en")]
    pub language: String,

    /// Library directory (default: current directory)
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Maximum concurrent page downloads (1-100)
    #[arg(short = 'c', long, default_value_t = DEFAULT_GLOBAL_CONCURRENCY as u8, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: u8,

    /// Maximum concurrent page downloads within one volume (1-100)
    #[arg(long, default_value_t = DEFAULT_PER_GROUP_CONCURRENCY as u8, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub per_group: u8,

    /// Maximum attempts for transient failures (1-10)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRIES as u8, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub max_retries: u8,

    /// Minimum delay between requests to the same image host in milliseconds (0 to disable, max 60000)
    #[arg(short = 'l', long, default_value_t = DEFAULT_RATE_LIMIT_MS, value_parser = clap::value_parser!(u64).range(0..=60000))]
    pub rate_limit: u64,

    /// Re-download every page even if a valid copy exists
    #[arg(long)]
    pub force: bool,

    /// Do not trust local files; fetch every page the manifest does not vouch for
    #[arg(long)]
    pub no_check_local: bool,

    /// Prune manifest entries older than this many days (0 keeps everything)
    #[arg(long, default_value_t = DEFAULT_RETENTION_DAYS)]
    pub retention_days: u32,

    /// Fetch the compressed data-saver images
    #[arg(long)]
    pub data_saver: bool,

    /// Override the API endpoint
    #[arg(long, value_name = "URL")]
    pub api_base_url: Option<String>,

    /// Print what would be downloaded without fetching anything
    #[arg(long)]
    pub dry_run: bool,
}

impl DownloadArgs {
    /// Expands `--updates` into the selection and policy it stands for.
    #[must_use]
    pub fn with_updates_expanded(mut self) -> Self {
        if self.updates {
            self.volumes = vec![VolumeSelector::Volume("none".to_string())];
            self.force = true;
        }
        self
    }
}

/// One `-V` selector.
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeSelector {
    /// Every listed volume.
    All,
    /// A single volume as typed (`3`, `2.5`, `none`).
    Volume(String),
    /// Every numbered volume in `start..=end`.
    Range { start: f64, end: f64 },
}

fn parse_volume_selector(raw: &str) -> Result<VolumeSelector, String> {
    let value = raw.trim();
    if value.is_empty() {
        return Err("volume must not be empty".to_string());
    }
    if value.eq_ignore_ascii_case("all") {
        return Ok(VolumeSelector::All);
    }
    let Some((start, end)) = value.split_once('-') else {
        return Ok(VolumeSelector::Volume(value.to_string()));
    };
    let bound = |text: &str| {
        text.trim()
            .parse::<f64>()
            .ok()
            .filter(|number| number.is_finite() && *number >= 0.0)
    };
    match (bound(start), bound(end)) {
        (Some(start), Some(end)) if start <= end => Ok(VolumeSelector::Range { start, end }),
        (Some(_), Some(_)) => Err(format!("volume range '{value}' is reversed")),
        _ => Err(format!("invalid volume range '{value}' (expected e.g. 3-5)")),
    }
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// MangaDex manga id (UUID); omit to list every manga in the library
    #[arg(value_name = "MANGA_ID")]
    pub manga_id: Option<String>,

    /// Library directory (default: current directory)
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,
}
