mod cli;
mod service;

use crate::cli::{Cli, Command};
use crate::service::Service;
use clap::Parser;
use listenlog_core::{CoreError, ListenlogConfig};
use listenlog_spotify::{
    SPOTIFY_CONFIG_TEMPLATE, SpotifyProviderConfig, SpotifySession, SpotifySource,
};
use std::fs::File;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let cli = Cli::parse();

    // Check config for logging.enabled before full config load
    init_tracing(check_file_logging_enabled());

    let provider_templates: &[&str] = &[SPOTIFY_CONFIG_TEMPLATE];
    let config = match ListenlogConfig::load_or_create(Some(provider_templates)) {
        Ok(config) => config,
        Err(CoreError::ConfigNotFound { path }) => {
            info!(
                "Created a configuration file at {}. Add your Spotify client_id and \
                client_secret from https://developer.spotify.com/dashboard, then run again.",
                path.display()
            );
            std::process::exit(0);
        }
        Err(CoreError::ConfigParseError(parse_error)) => {
            error!(
                "Configuration file {} has a syntax error: {parse_error}",
                ListenlogConfig::config_path().display()
            );
            std::process::exit(1);
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let spotify_config = match spotify_config(&config) {
        Ok(spotify_config) => spotify_config,
        Err(e) => {
            error!(
                "{e}. Edit {} and run again.",
                ListenlogConfig::config_path().display()
            );
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    let session = Arc::new(SpotifySession::new(&spotify_config));
    let outcome = runtime.block_on(async {
        match cli.subcommand() {
            Command::Auth => authenticate(&session).await,
            Command::Run => run(config, session).await,
            Command::Trigger { job } => {
                let service = open_service(config, session).await?;
                let status = service.trigger(*job).await;
                println!("{}", serde_json::to_string_pretty(&status)?);
                Ok::<(), CoreError>(())
            }
        }
    });

    if let Err(e) = outcome {
        error!("{e}");
        std::process::exit(1);
    }
}

/// Spotify section of the config, with required fields present.
fn spotify_config(config: &ListenlogConfig) -> Result<SpotifyProviderConfig, CoreError> {
    let spotify_config = SpotifyProviderConfig::from_providers(&config.providers)?.ok_or_else(
        || CoreError::ConfigMissingField {
            field: "providers.spotify".into(),
        },
    )?;
    spotify_config.validate()?;
    Ok(spotify_config)
}

async fn authenticate(session: &SpotifySession) -> Result<(), CoreError> {
    session.ensure_authenticated().await?;
    info!("Spotify authenticated; `listenlog run` will use the cached token");
    Ok(())
}

async fn open_service(
    config: ListenlogConfig,
    session: Arc<SpotifySession>,
) -> Result<Service, CoreError> {
    if !session.load_cached_token().await? {
        warn!("Not signed in to Spotify; run `listenlog auth`. Jobs will be skipped until then");
    }
    Service::open(config, Arc::new(SpotifySource::new(session))).await
}

async fn run(config: ListenlogConfig, session: Arc<SpotifySession>) -> Result<(), CoreError> {
    let service = open_service(config, session).await?;

    // Create shared cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();
    let ctrlc_token = cancel_token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down gracefully...");
        ctrlc_token.cancel();
    }) {
        error!("Failed to set Ctrl+C handler: {}", e);
    }

    service.run_until(cancel_token).await
}

/// Check if file logging is enabled by reading the config file.
/// This is done before full config loading to set up tracing first.
/// Returns `false` if config doesn't exist or can't be parsed.
fn check_file_logging_enabled() -> bool {
    // Minimal structs to parse just the logging.enabled field
    #[derive(serde::Deserialize)]
    struct PartialConfig {
        #[serde(default)]
        logging: PartialLoggingConfig,
    }
    #[derive(serde::Deserialize, Default)]
    struct PartialLoggingConfig {
        #[serde(default)]
        enabled: bool,
    }

    let Ok(content) = std::fs::read_to_string(ListenlogConfig::config_path()) else {
        return false;
    };

    toml::from_str::<PartialConfig>(&content)
        .map(|c| c.logging.enabled)
        .unwrap_or(false)
}

/// Initialize tracing with console output and optional file logging
fn init_tracing(file_logging_enabled: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rspotify_http=warn"));

    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if file_logging_enabled {
        let log_path = listenlog_core::paths::log_file_path();

        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        match File::options().create(true).append(true).open(&log_path) {
            Ok(file) => {
                let file_layer = tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(file_layer)
                    .init();

                return;
            }
            Err(e) => {
                eprintln!("Failed to open log file at {}: {e}", log_path.display());
            }
        }
    }

    // Fallback: console only
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
