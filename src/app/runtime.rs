use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use mangabook_core::paths::{series_dir, state_dir};
use mangabook_core::source::normalize_group_id;
use mangabook_core::{
    ApiSession, EngineConfig, GroupRef, MangaDexSource, ManifestStore, Orchestrator,
    RateLimiter, RemoteSource, RetryPolicy, SessionConfig,
};
use tracing::{debug, info, warn};

use crate::ProcessExit;
use crate::app::config_runtime::{self, HttpTimeoutSettings};
use crate::app::{exit_handler, progress_manager, terminal};
use crate::app_config::{self, FileConfig};
use crate::cli::{Command, DownloadArgs, StatusArgs, VolumeSelector};
use crate::output;

pub(crate) async fn run_mangabook() -> Result<ProcessExit> {
    let (cli, cli_sources) = config_runtime::parse_cli_with_sources();

    let default_level = config_runtime::resolve_default_log_level(cli.verbose, cli.quiet);
    let force_cli_log_level = config_runtime::should_force_cli_log_level(&cli_sources);
    let no_color = terminal::is_no_color_requested(cli.no_color);
    terminal::init_tracing(default_level, force_cli_log_level, no_color);

    debug!(?cli, "CLI arguments parsed");

    let loaded = app_config::load_default_file_config()?;
    if let Some(path) = loaded.path.as_deref().filter(|_| loaded.config.is_some()) {
        debug!(path = %path.display(), "loaded config file");
    }
    let file_config = loaded.config.as_ref();

    match cli.command {
        Command::Status(args) => run_status(&args, file_config).await,
        Command::Download(args) => {
            let args = config_runtime::apply_config_defaults(args, &cli_sources, file_config)?
                .with_updates_expanded();
            let timeouts = config_runtime::resolve_http_timeouts(file_config);
            run_download(args, timeouts, cli.quiet).await
        }
    }
}

fn resolve_output_dir(flag: Option<&Path>, file_config: Option<&FileConfig>) -> PathBuf {
    flag.map(Path::to_path_buf)
        .or_else(|| file_config.and_then(|config| config.output_dir.clone()))
        .unwrap_or_else(|| PathBuf::from("."))
}

async fn run_status(args: &StatusArgs, file_config: Option<&FileConfig>) -> Result<ProcessExit> {
    let output_dir = resolve_output_dir(args.output_dir.as_deref(), file_config);
    let store = ManifestStore::new(&state_dir(&output_dir));
    match &args.manga_id {
        Some(manga_id) => {
            let manifest = store.load(manga_id).await;
            output::print_status(&manifest, &store.path_for(manga_id));
        }
        None => {
            let manifests = store.load_all().await;
            output::print_library(&manifests, &output_dir);
        }
    }
    Ok(ProcessExit::Success)
}

/// Numeric value of a volume id; `None` for non-numeric ids.
fn volume_number(id: &str) -> Option<f64> {
    id.parse::<f64>().ok().filter(|number| number.is_finite())
}

fn push_unique(selected: &mut Vec<GroupRef>, group: &GroupRef) {
    if !selected.iter().any(|chosen| chosen.id == group.id) {
        selected.push(group.clone());
    }
}

/// Resolves `-V` selectors against the remote volumes.
///
/// Single volumes match exactly or numerically (`2` selects `2.0`). Single
/// volumes the remote does not list are kept so the run reports them as
/// unavailable; ranges only ever select listed volumes.
fn select_groups(available: Vec<GroupRef>, requested: &[VolumeSelector]) -> Vec<GroupRef> {
    if requested.is_empty() {
        return available;
    }
    let mut selected: Vec<GroupRef> = Vec::new();
    for selector in requested {
        match selector {
            VolumeSelector::All => {
                for group in &available {
                    push_unique(&mut selected, group);
                }
            }
            VolumeSelector::Range { start, end } => {
                let mut matched = false;
                for group in &available {
                    if volume_number(&group.id).is_some_and(|n| (*start..=*end).contains(&n)) {
                        matched = true;
                        push_unique(&mut selected, group);
                    }
                }
                if !matched {
                    warn!(start = *start, end = *end, "no listed volume in range");
                }
            }
            VolumeSelector::Volume(raw) => {
                let id = normalize_group_id(raw);
                let listed = available.iter().find(|group| {
                    group.id == id
                        || volume_number(&id)
                            .is_some_and(|n| volume_number(&group.id) == Some(n))
                });
                match listed {
                    Some(group) => push_unique(&mut selected, group),
                    None => {
                        warn!(volume = %raw, "volume not listed for this manga");
                        push_unique(
                            &mut selected,
                            &GroupRef {
                                label: format!("Volume {raw}"),
                                id,
                            },
                        );
                    }
                }
            }
        }
    }
    selected
}

fn build_engine_config(args: &DownloadArgs) -> EngineConfig {
    EngineConfig {
        max_global_concurrency: usize::from(args.concurrency),
        max_per_group_concurrency: usize::from(args.per_group),
        force_overwrite: args.force,
        check_local: !args.no_check_local,
        retention_days: args.retention_days,
        retry_policy: RetryPolicy::with_max_attempts(u32::from(args.max_retries)),
        ..EngineConfig::default()
    }
}

async fn run_download(
    args: DownloadArgs,
    timeouts: HttpTimeoutSettings,
    quiet: bool,
) -> Result<ProcessExit> {
    let output_dir = args.output_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    if !output_dir.exists() {
        fs::create_dir_all(&output_dir).with_context(|| {
            format!("Failed to create output directory '{}'", output_dir.display())
        })?;
        info!(dir = %output_dir.display(), "Created output directory");
    }

    let mut session_config = SessionConfig {
        connect_timeout: timeouts.connect,
        read_timeout: timeouts.read,
        ..SessionConfig::default()
    }
    .with_env_token();
    if let Some(api_base_url) = &args.api_base_url {
        session_config.api_base_url.clone_from(api_base_url);
    }
    let session = Arc::new(ApiSession::new(session_config).context("Failed to create API session")?);
    let source: Arc<dyn RemoteSource> = Arc::new(
        MangaDexSource::new(session)
            .with_language(args.language.clone())
            .with_data_saver(args.data_saver),
    );

    let root = source
        .describe_root(&args.manga_id)
        .await
        .with_context(|| format!("Failed to look up manga {}", args.manga_id))?;
    let available = source
        .list_groups(&args.manga_id)
        .await
        .with_context(|| format!("Failed to list volumes for {}", root.title))?;
    let groups = select_groups(available, &args.volumes);
    if groups.is_empty() && !args.volumes.is_empty() {
        anyhow::bail!("No volume of {} matches the requested selection", root.title);
    }
    info!(title = %root.title, volumes = groups.len(), "Resolved manga");

    let rate_limiter = if args.rate_limit == 0 {
        debug!("rate limiting disabled");
        Arc::new(RateLimiter::disabled())
    } else {
        debug!(rate_limit_ms = args.rate_limit, "rate limiting enabled");
        Arc::new(RateLimiter::new(Duration::from_millis(args.rate_limit)))
    };

    let library_dir = series_dir(&output_dir, &root.title);
    let orchestrator = Orchestrator::new(
        build_engine_config(&args),
        Arc::clone(&source),
        ManifestStore::new(&state_dir(&output_dir)),
        library_dir.clone(),
        rate_limiter,
    )?;

    if args.dry_run {
        let plans = orchestrator.plan_groups(&args.manga_id, &groups).await?;
        output::print_plan(&root.title, &plans);
        return Ok(ProcessExit::Success);
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_signal = Arc::clone(&interrupted);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupted_signal.store(true, Ordering::SeqCst);
        }
    });

    let use_spinner = terminal::should_use_spinner(
        io::stderr().is_terminal(),
        quiet,
        terminal::is_dumb_terminal(),
    );
    let (progress_handle, progress_stop) =
        progress_manager::spawn_progress_ui(use_spinner, orchestrator.progress());

    let result = orchestrator
        .run(&args.manga_id, &groups, &interrupted)
        .await;

    progress_stop.store(true, Ordering::SeqCst);
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }

    let summary = result.context("Download run aborted")?;
    output::print_completion_summary(&root.title, &library_dir, &summary);

    if summary.interrupted {
        warn!(
            downloaded = summary.downloaded(),
            cancelled = summary.cancelled(),
            "Interrupted. Run again to resume."
        );
    }

    Ok(exit_handler::determine_exit_outcome(&summary))
}
