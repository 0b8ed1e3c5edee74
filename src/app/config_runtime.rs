//! Merges CLI flags, the config file and built-in defaults.
//!
//! Precedence: flags given on the command line, then config file values,
//! then the clap defaults.

use std::time::Duration;

use anyhow::{Result, bail};
use clap::{ArgMatches, CommandFactory, FromArgMatches, parser::ValueSource};
use mangabook_core::download::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};

use crate::app_config::FileConfig;
use crate::cli::{Cli, DownloadArgs};

/// Which download flags were given explicitly on the command line.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CliValueSources {
    pub(crate) output_dir: bool,
    pub(crate) language: bool,
    pub(crate) concurrency: bool,
    pub(crate) per_group: bool,
    pub(crate) max_retries: bool,
    pub(crate) rate_limit: bool,
    pub(crate) retention_days: bool,
    pub(crate) no_check_local: bool,
    pub(crate) data_saver: bool,
    pub(crate) api_base_url: bool,
    pub(crate) verbose: bool,
    pub(crate) quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HttpTimeoutSettings {
    pub(crate) connect: Duration,
    pub(crate) read: Duration,
}

impl Default for HttpTimeoutSettings {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read: Duration::from_secs(READ_TIMEOUT_SECS),
        }
    }
}

pub(crate) fn parse_cli_with_sources() -> (Cli, CliValueSources) {
    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|err| err.exit());
    let sources = cli_sources_from_matches(&matches);
    (cli, sources)
}

fn cli_sources_from_matches(matches: &ArgMatches) -> CliValueSources {
    let mut sources = CliValueSources {
        verbose: is_commandline_value(matches, "verbose"),
        quiet: is_commandline_value(matches, "quiet"),
        ..CliValueSources::default()
    };
    if let Some(download) = matches.subcommand_matches("download") {
        sources.output_dir = is_commandline_value(download, "output_dir");
        sources.language = is_commandline_value(download, "language");
        sources.concurrency = is_commandline_value(download, "concurrency");
        sources.per_group = is_commandline_value(download, "per_group");
        sources.max_retries = is_commandline_value(download, "max_retries");
        sources.rate_limit = is_commandline_value(download, "rate_limit");
        sources.retention_days = is_commandline_value(download, "retention_days");
        sources.no_check_local = is_commandline_value(download, "no_check_local");
        sources.data_saver = is_commandline_value(download, "data_saver");
        sources.api_base_url = is_commandline_value(download, "api_base_url");
        // global flags may be given after the subcommand
        sources.verbose |= is_commandline_value(download, "verbose");
        sources.quiet |= is_commandline_value(download, "quiet");
    }
    sources
}

fn is_commandline_value(matches: &ArgMatches, id: &str) -> bool {
    matches.value_source(id) == Some(ValueSource::CommandLine)
}

pub(crate) fn apply_config_defaults(
    mut args: DownloadArgs,
    cli_sources: &CliValueSources,
    file_config: Option<&FileConfig>,
) -> Result<DownloadArgs> {
    if let Some(file_config) = file_config {
        if !cli_sources.output_dir
            && args.output_dir.is_none()
            && let Some(output_dir) = &file_config.output_dir
        {
            args.output_dir = Some(output_dir.clone());
        }

        if !cli_sources.language
            && let Some(language) = &file_config.language
        {
            args.language.clone_from(language);
        }

        if !cli_sources.concurrency
            && let Some(concurrency) = file_config.concurrency
        {
            args.concurrency = concurrency;
        }

        if !cli_sources.per_group
            && let Some(per_group) = file_config.per_group_concurrency
        {
            args.per_group = per_group;
        }

        if !cli_sources.max_retries
            && let Some(max_retries) = file_config.max_retries
        {
            args.max_retries = max_retries;
        }

        if !cli_sources.rate_limit
            && let Some(rate_limit) = file_config.rate_limit
        {
            args.rate_limit = rate_limit;
        }

        if !cli_sources.retention_days
            && let Some(retention_days) = file_config.retention_days
        {
            args.retention_days = retention_days;
        }

        if !cli_sources.no_check_local
            && let Some(check_local) = file_config.check_local
        {
            args.no_check_local = !check_local;
        }

        if !cli_sources.data_saver
            && let Some(data_saver) = file_config.data_saver
        {
            args.data_saver = data_saver;
        }

        if !cli_sources.api_base_url
            && args.api_base_url.is_none()
            && let Some(api_base_url) = &file_config.api_base_url
        {
            args.api_base_url = Some(api_base_url.clone());
        }
    }

    if !(1..=100).contains(&args.concurrency) {
        bail!(
            "Invalid effective concurrency value: {}. Expected range: 1..=100",
            args.concurrency
        );
    }
    if args.per_group > args.concurrency && !cli_sources.per_group {
        args.per_group = args.concurrency;
    } else if args.per_group > args.concurrency {
        bail!(
            "Invalid effective per-volume concurrency: {} exceeds global concurrency {}",
            args.per_group,
            args.concurrency
        );
    }
    if args.rate_limit > 60_000 {
        bail!(
            "Invalid effective rate_limit value: {}. Expected range: 0..=60000",
            args.rate_limit
        );
    }

    Ok(args)
}

pub(crate) fn resolve_http_timeouts(file_config: Option<&FileConfig>) -> HttpTimeoutSettings {
    let mut settings = HttpTimeoutSettings::default();
    let Some(file_config) = file_config else {
        return settings;
    };

    if let Some(secs) = file_config.connect_timeout_secs {
        settings.connect = Duration::from_secs(secs);
    }
    if let Some(secs) = file_config.read_timeout_secs {
        settings.read = Duration::from_secs(secs);
    }
    settings
}

pub(crate) fn resolve_default_log_level(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

pub(crate) fn should_force_cli_log_level(cli_sources: &CliValueSources) -> bool {
    cli_sources.verbose || cli_sources.quiet
}
