use std::path::PathBuf;
use std::sync::Arc;

use library::scanner::ScanProgress;
use library::Library;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Serialize;

use crate::config::ServerConfig;
use crate::external::{MetadataCache, RateLimiter};

/// Process-wide state. Every shared object lives here explicitly and is
/// handed into components by reference, so tests can build isolated
/// instances.
#[derive(Clone)]
pub struct AppState {
    pub library: Library,
    pub config_path: PathBuf,
    pub config: Arc<RwLock<ServerConfig>>,
    pub progress: Arc<ScanProgress>,
    pub metadata_cache: Arc<MetadataCache>,
    pub mb_limiter: Arc<RateLimiter>,
    pub external_client: Client,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
