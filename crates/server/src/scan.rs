use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::CoverSource;
use library::covers::RemoteCover;
use library::scanner::ScanStatus;
use library::store::StoreError;
use library::Library;
use reqwest::Client;
use tracing::{info, warn};

use crate::config::{resolve_music_roots, ServerConfig, UserSyncConfig};
use crate::external::{self, ExternalContext};
use crate::favorites;
use crate::state::AppState;

/// Triggers a scan unless one is already running. The second caller gets
/// the live status back and causes no side effects.
pub fn try_start_scan(state: &AppState, force_refresh: bool) -> ScanStatus {
    if !state.progress.try_begin() {
        info!("Scan already in progress; ignoring trigger");
        return state.progress.snapshot();
    }
    let task_state = state.clone();
    tokio::spawn(async move {
        run_scan(task_state, force_refresh, false).await;
    });
    state.progress.snapshot()
}

/// Clears all derived entities and rescans from scratch. Used for schema
/// migrations and corruption recovery; distinct from cancelling a scan.
pub fn try_hard_reset(state: &AppState) -> ScanStatus {
    if !state.progress.try_begin() {
        info!("Scan already in progress; ignoring reset");
        return state.progress.snapshot();
    }
    let task_state = state.clone();
    tokio::spawn(async move {
        run_scan(task_state, true, true).await;
    });
    state.progress.snapshot()
}

async fn run_scan(state: AppState, force_refresh: bool, reset: bool) {
    let config = state.config.read().clone();
    let roots = resolve_music_roots(&state.config_path, &config);
    if roots.is_empty() {
        warn!("No music roots configured; nothing to scan");
        state.progress.finish();
        return;
    }

    info!("Library scan started over {} roots", roots.len());
    let library = state.library.clone();
    let progress = Arc::clone(&state.progress);
    let result = tokio::task::spawn_blocking(move || {
        if reset {
            library.reset()?;
        }
        let outcome = library.scan(&roots, &progress)?;
        let report = library.cleanup(&outcome)?;
        Ok::<_, StoreError>((outcome, report))
    })
    .await;

    match result {
        Ok(Ok((outcome, _report))) => {
            match state.library.stats() {
                Ok(stats) => info!(
                    "Library scan finished: {} files processed ({} new); {} artists, {} albums, {} tracks",
                    outcome.files_processed,
                    outcome.files_new,
                    stats.artists,
                    stats.albums,
                    stats.tracks
                ),
                Err(err) => warn!("Failed to read library stats: {}", err),
            }

            if config.enrich_on_scan {
                run_enrichment_sweep(&state, &config, force_refresh).await;
            }
            run_favorites_sync(&state, &config).await;
        }
        Ok(Err(err)) => warn!("Library scan failed: {}", err),
        Err(err) => warn!("Library scan join error: {}", err),
    }

    state.metadata_cache.sweep();
    state.progress.finish();
}

/// Enriches every album and artist missing external info (or all of them
/// when forced), then attaches remote covers where local sources came up
/// empty.
async fn run_enrichment_sweep(state: &AppState, config: &ServerConfig, force: bool) {
    let ctx = match ExternalContext::from_config(
        config,
        state.external_client.clone(),
        Arc::clone(&state.metadata_cache),
        Arc::clone(&state.mb_limiter),
    ) {
        Some(ctx) => ctx,
        None => {
            info!("External metadata sweep skipped (no providers configured)");
            return;
        }
    };

    let library = &state.library;
    let mut album_updates = 0usize;
    let mut artist_updates = 0usize;
    let mut covers_fetched = 0usize;

    let albums = match library.list_albums() {
        Ok(albums) => albums,
        Err(err) => {
            warn!("Album listing failed for enrichment: {}", err);
            return;
        }
    };
    for album in albums {
        if album.external.fetched && !force {
            continue;
        }
        let artist_name = album_artist_name(library, &album);
        let metadata = external::fetch_album_metadata(
            &ctx,
            &artist_name,
            &album.name,
            album.external.mbid.as_deref(),
        )
        .await;
        let Some(metadata) = metadata else {
            continue;
        };

        let external_info = common::AlbumExternalInfo {
            fetched: true,
            notes: metadata.notes.clone(),
            lastfm_url: metadata.lastfm_url.clone(),
            mbid: metadata.mbid.clone(),
        };
        match library.update_album_external(
            &album.id,
            external_info,
            metadata.release_date.clone(),
            &metadata.genres,
        ) {
            Ok(true) => album_updates += 1,
            Ok(false) => {}
            Err(err) => warn!("Album enrichment write failed for {}: {}", album.id, err),
        }

        let needs_cover = force || !library.covers().has_usable_cover(&album.id);
        if needs_cover {
            if let Some((url, source)) = metadata.cover {
                if attach_remote_cover(state, &album.id, &url, source, force).await {
                    covers_fetched += 1;
                }
            }
        }
    }

    let artists = match library.list_artists() {
        Ok(artists) => artists,
        Err(err) => {
            warn!("Artist listing failed for enrichment: {}", err);
            return;
        }
    };
    for artist in artists {
        if artist.external.fetched && !force {
            continue;
        }
        let metadata =
            external::fetch_artist_metadata(&ctx, &artist.name, artist.mbid.as_deref()).await;
        let Some(metadata) = metadata else {
            continue;
        };

        let external_info = common::ArtistExternalInfo {
            fetched: true,
            biography: metadata.biography.clone(),
            similar: metadata.similar.clone(),
            image_url: metadata.image.as_ref().map(|(url, _)| url.clone()),
            lastfm_url: metadata.lastfm_url.clone(),
        };
        match library.update_artist_external(&artist.id, external_info, metadata.mbid.clone()) {
            Ok(true) => artist_updates += 1,
            Ok(false) => {}
            Err(err) => warn!("Artist enrichment write failed for {}: {}", artist.id, err),
        }

        let needs_cover = force || !library.covers().has_usable_cover(&artist.id);
        if needs_cover {
            if let Some((url, source)) = metadata.image {
                if attach_remote_cover(state, &artist.id, &url, source, force).await {
                    covers_fetched += 1;
                }
            }
        }
    }

    info!(
        "External metadata sweep finished: {} albums, {} artists updated, {} covers fetched",
        album_updates, artist_updates, covers_fetched
    );
}

fn album_artist_name(library: &Library, album: &common::Album) -> String {
    if !album.display_artist.trim().is_empty() {
        return album.display_artist.clone();
    }
    album
        .artists
        .first()
        .and_then(|artist_ref| {
            library
                .get_artist(&artist_ref.id)
                .ok()
                .flatten()
                .map(|artist| artist.name)
        })
        .unwrap_or_else(|| "Unknown Artist".to_string())
}

async fn attach_remote_cover(
    state: &AppState,
    entity_id: &str,
    url: &str,
    source: CoverSource,
    force: bool,
) -> bool {
    let timeout = Duration::from_secs(state.config.read().external_timeout_secs.max(1));
    let Some(bytes) = download_image(&state.external_client, timeout, url).await else {
        return false;
    };
    state
        .library
        .covers()
        .acquire(entity_id, &[], None, Some(RemoteCover { bytes, source }), force)
        .is_some()
}

async fn download_image(client: &Client, timeout: Duration, url: &str) -> Option<Vec<u8>> {
    let response = client.get(url).timeout(timeout).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    let bytes = response.bytes().await.ok()?;
    if bytes.is_empty() {
        None
    } else {
        Some(bytes.to_vec())
    }
}

/// Runs the favorites synchronizer for every user with a configured
/// scrobbling identity.
async fn run_favorites_sync(state: &AppState, config: &ServerConfig) {
    let creds = match crate::external::lastfm::LastFmCreds::new(
        &config.lastfm.api_key,
        &config.lastfm.api_secret,
    ) {
        Some(creds) if config.lastfm.enabled => creds,
        _ => {
            info!("Favorites sync skipped (Last.fm not configured)");
            return;
        }
    };
    let timeout = Duration::from_secs(config.external_timeout_secs.max(1));

    let users: Vec<UserSyncConfig> = config
        .users
        .iter()
        .filter(|user| !user.lastfm_user.trim().is_empty())
        .cloned()
        .collect();
    for user in users {
        favorites::sync_user(
            &state.library,
            &state.external_client,
            &creds,
            timeout,
            &user,
        )
        .await;
    }
}

pub fn music_roots(state: &AppState) -> Vec<PathBuf> {
    let config = state.config.read().clone();
    resolve_music_roots(&state.config_path, &config)
}
