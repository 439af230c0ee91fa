mod api;
mod config;
mod external;
mod favorites;
mod scan;
mod state;

use std::sync::Arc;
use std::time::Duration;

use api::api_router;
use config::{config_path_from_env, load_or_create_config, resolve_path};
use external::{MetadataCache, RateLimiter};
use library::scanner::ScanProgress;
use library::Library;
use parking_lot::RwLock;
use reqwest::Client;
use state::AppState;
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// MusicBrainz usage policy: at most one request per second.
const MUSICBRAINZ_MIN_GAP: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }

    let index_path = resolve_path(&config_path, &config.index_path);
    let data_dir = resolve_path(&config_path, &config.data_path);
    std::fs::create_dir_all(&data_dir)?;

    let library = Library::open(&index_path, data_dir, config.separator_chars())?;
    match library.stats() {
        Ok(stats) => info!(
            "Library opened: {} artists, {} albums, {} tracks",
            stats.artists, stats.albums, stats.tracks
        ),
        Err(err) => warn!("Failed to read library stats: {}", err),
    }

    let external_client = Client::builder().user_agent("cadenza/0.1").build()?;
    let cache_ttl = Duration::from_secs(config.external_cache_ttl_secs.max(60));
    let port = config.port;
    let scan_on_start = config.scan_on_start;

    let state = AppState {
        library,
        config_path,
        config: Arc::new(RwLock::new(config)),
        progress: Arc::new(ScanProgress::new()),
        metadata_cache: Arc::new(MetadataCache::new(cache_ttl)),
        mb_limiter: Arc::new(RateLimiter::new(MUSICBRAINZ_MIN_GAP)),
        external_client,
    };

    if scan_on_start {
        if scan::music_roots(&state).is_empty() {
            info!("No music roots configured; edit the config to add some.");
        } else {
            scan::try_start_scan(&state, false);
        }
    }

    // Periodic prune of expired metadata cache entries.
    let sweep_cache = Arc::clone(&state.metadata_cache);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60 * 60));
        loop {
            interval.tick().await;
            sweep_cache.sweep();
        }
    });

    let app = api_router(state)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http());

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
}
