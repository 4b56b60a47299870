use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use celshift_core::collaborators::{
    FfmpegTranscoder, FrameTransform, HttpTransform, PassthroughTransform, YtDlpFetcher,
};
use celshift_core::config::{
    config_path, data_dir, initialize_data_dir, AppConfig, StylizeBackend,
};
use celshift_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use celshift_core::server::{router, AppState};
use celshift_core::stages::{run_sweeper, Pipeline};
use celshift_core::workspace::WorkspaceManager;

#[derive(Parser)]
#[command(name = "celshift", about = "Cel-shaded video stylization server")]
struct Cli {
    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    run_server(cli.port, cli.host, resolved_data_dir).await
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::redacting_make_writer(ready.appender))
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            eprintln!(
                "Warning: persistent file logging unavailable (path: {attempted_log_dir}; reason: {reason}). Continuing with console-only logging."
            );
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn build_transform(config: &AppConfig) -> Result<Arc<dyn FrameTransform>> {
    match config.stylize.backend {
        StylizeBackend::Passthrough => Ok(Arc::new(PassthroughTransform::new())),
        StylizeBackend::Http => {
            if config.stylize.endpoint.trim().is_empty() {
                bail!("[stylize] backend is \"http\" but no endpoint is configured");
            }
            let endpoint = url::Url::parse(&config.stylize.endpoint).with_context(|| {
                format!("invalid [stylize] endpoint: {}", config.stylize.endpoint)
            })?;
            Ok(Arc::new(HttpTransform::new(endpoint)?))
        }
    }
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(&data_dir);
    let config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let work_dir = config.resolved_work_dir(&data_dir);
    std::fs::create_dir_all(&work_dir)
        .with_context(|| format!("failed to create work directory: {}", work_dir.display()))?;

    let transform = build_transform(&config)?;
    let pipeline = Arc::new(Pipeline::new(
        WorkspaceManager::new(work_dir),
        Arc::new(YtDlpFetcher::new()),
        Arc::new(FfmpegTranscoder::new()),
        transform,
        &config,
    ));

    let sweep_interval = config.cleanup.effective_sweep_interval();
    let max_age = config.cleanup.effective_max_age();
    tokio::spawn(run_sweeper(pipeline.clone(), sweep_interval, max_age));
    info!(
        interval_minutes = config.cleanup.sweep_interval_minutes,
        max_age_hours = config.cleanup.max_age_hours,
        "Workspace sweeper started"
    );

    let app = router(AppState::new(pipeline));

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting celshift server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod transform_wiring_tests {
    use super::*;

    #[test]
    fn passthrough_backend_needs_no_endpoint() {
        let config = AppConfig::default();
        assert!(build_transform(&config).is_ok());
    }

    #[test]
    fn http_backend_without_endpoint_is_rejected() {
        let mut config = AppConfig::default();
        config.stylize.backend = StylizeBackend::Http;

        let err = match build_transform(&config) {
            Ok(_) => panic!("http backend without an endpoint must be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("no endpoint"));
    }

    #[test]
    fn http_backend_rejects_unparseable_endpoint() {
        let mut config = AppConfig::default();
        config.stylize.backend = StylizeBackend::Http;
        config.stylize.endpoint = "not a url".to_string();

        assert!(build_transform(&config).is_err());
    }

    #[test]
    fn http_backend_accepts_valid_endpoint() {
        let mut config = AppConfig::default();
        config.stylize.backend = StylizeBackend::Http;
        config.stylize.endpoint = "http://transform.local/v1/stylize".to_string();

        assert!(build_transform(&config).is_ok());
    }
}
