pub mod lastfm;
pub mod musicbrainz;
pub mod spotify;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::CoverSource;
use parking_lot::Mutex;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::{RetryConfig, ServerConfig};
use lastfm::LastFmCreds;
use musicbrainz::MusicBrainzCreds;
use spotify::SpotifyClient;

/// Tags below this vote count are considered noise and left out of the
/// genre union.
const MIN_TAG_VOTES: u32 = 3;

#[derive(Debug)]
pub enum ProviderError {
    Http(reqwest::Error),
    Status(u16),
    Decode(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Http(err) => write!(f, "http error: {}", err),
            ProviderError::Status(code) => write!(f, "http {}", code),
            ProviderError::Decode(msg) => write!(f, "decode error: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Http(err)
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            multiplier: if config.multiplier < 1.0 {
                2.0
            } else {
                config.multiplier
            },
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.initial_delay_ms)),
        }
    }
}

/// Exponential-backoff retry that swallows transient failures. Degrades
/// to None instead of propagating; enrichment is best-effort.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut delay = policy.initial_delay;
    for attempt in 1..=policy.max_attempts {
        match op().await {
            Ok(value) => return Some(value),
            Err(err) => {
                if attempt == policy.max_attempts {
                    warn!("{} failed after {} attempts: {}", label, attempt, err);
                    return None;
                }
                debug!("{} attempt {} failed: {}; retrying", label, attempt, err);
                tokio::time::sleep(delay).await;
                let scaled = delay.as_millis() as f64 * policy.multiplier;
                delay = Duration::from_millis(scaled as u64).min(policy.max_delay);
            }
        }
    }
    None
}

/// Global serialization point for MusicBrainz: a monotonic last-request
/// guard that sleeps the remaining gap before each call.
pub struct RateLimiter {
    min_gap: Duration,
    last: tokio::sync::Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn acquire(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_gap {
                tokio::time::sleep(self.min_gap - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AlbumMetadata {
    pub notes: Option<String>,
    pub mbid: Option<String>,
    pub lastfm_url: Option<String>,
    pub release_date: Option<String>,
    pub genres: Vec<String>,
    pub cover: Option<(String, CoverSource)>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArtistMetadata {
    pub biography: Option<String>,
    pub mbid: Option<String>,
    pub similar: Vec<String>,
    pub image: Option<(String, CoverSource)>,
    pub lastfm_url: Option<String>,
    pub genres: Vec<String>,
}

#[derive(Clone)]
enum CachedValue {
    Album(Option<AlbumMetadata>),
    Artist(Option<ArtistMetadata>),
}

struct CacheEntry {
    stored: Instant,
    value: CachedValue,
}

/// In-process memoization of provider results, keyed by a normalized
/// `type:artist:album` string. Expired entries are pruned lazily on get
/// and wholesale via `sweep`.
pub struct MetadataCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MetadataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<CachedValue> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.stored.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: String, value: CachedValue) {
        self.entries.lock().insert(
            key,
            CacheEntry {
                stored: Instant::now(),
                value,
            },
        );
    }

    pub fn sweep(&self) {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.stored.elapsed() < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn cache_key(kind: &str, artist: &str, album: &str) -> String {
    format!(
        "{}:{}:{}",
        kind,
        artist.trim().to_lowercase(),
        album.trim().to_lowercase()
    )
}

/// Ordered provider fallback: the first non-empty value wins.
pub fn first_non_empty<T>(candidates: impl IntoIterator<Item = Option<T>>) -> Option<T> {
    candidates.into_iter().flatten().next()
}

/// Union of official genres and voted tags, deduplicated by name. Tags
/// need `MIN_TAG_VOTES` to count.
pub fn fuse_genres(official: &[String], tags: &[(String, u32)]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |value: &str| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return;
        }
        if !out
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(trimmed))
        {
            out.push(trimmed.to_string());
        }
    };
    for genre in official {
        push(genre);
    }
    for (tag, votes) in tags {
        if *votes >= MIN_TAG_VOTES {
            push(tag);
        }
    }
    out
}

/// Everything one enrichment pass needs: shared client, cache, the
/// MusicBrainz limiter, and whichever providers are configured. Providers
/// with missing credentials are absent here and short-circuit to "no
/// data".
pub struct ExternalContext {
    pub client: Client,
    pub cache: Arc<MetadataCache>,
    pub limiter: Arc<RateLimiter>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub lastfm: Option<LastFmCreds>,
    pub spotify: Option<SpotifyClient>,
    pub musicbrainz: Option<MusicBrainzCreds>,
}

impl ExternalContext {
    /// Returns None when no provider is usable, so callers can skip the
    /// whole enrichment step and log once.
    pub fn from_config(
        config: &ServerConfig,
        client: Client,
        cache: Arc<MetadataCache>,
        limiter: Arc<RateLimiter>,
    ) -> Option<Self> {
        let lastfm = config
            .lastfm
            .enabled
            .then(|| LastFmCreds::new(&config.lastfm.api_key, &config.lastfm.api_secret))
            .flatten();
        let spotify = config
            .spotify
            .enabled
            .then(|| SpotifyClient::new(&config.spotify.client_id, &config.spotify.client_secret))
            .flatten();
        let musicbrainz = config
            .musicbrainz
            .enabled
            .then(|| MusicBrainzCreds::new(&config.musicbrainz.user_agent))
            .flatten();

        if lastfm.is_none() && spotify.is_none() && musicbrainz.is_none() {
            return None;
        }
        Some(Self {
            client,
            cache,
            limiter,
            retry: RetryPolicy::from(&config.retry),
            timeout: Duration::from_secs(config.external_timeout_secs.max(1)),
            lastfm,
            spotify,
            musicbrainz,
        })
    }
}

pub async fn fetch_album_metadata(
    ctx: &ExternalContext,
    artist: &str,
    album: &str,
    known_mbid: Option<&str>,
) -> Option<AlbumMetadata> {
    let key = cache_key("album", artist, album);
    if let Some(CachedValue::Album(cached)) = ctx.cache.get(&key) {
        return cached;
    }

    let mut result = AlbumMetadata::default();
    let mut found = false;

    let mbid = match known_mbid {
        Some(mbid) => Some(mbid.to_string()),
        None => match &ctx.musicbrainz {
            Some(creds) => {
                with_retry(&ctx.retry, "musicbrainz release search", || {
                    musicbrainz::search_release(
                        &ctx.client,
                        creds,
                        &ctx.limiter,
                        ctx.timeout,
                        artist,
                        album,
                    )
                })
                .await
                .flatten()
            }
            None => None,
        },
    };

    result.mbid = mbid.clone();

    let mut mb_cover = None;
    if let (Some(mbid), Some(creds)) = (&mbid, &ctx.musicbrainz) {
        let release = with_retry(&ctx.retry, "musicbrainz release lookup", || {
            musicbrainz::release_info(&ctx.client, creds, &ctx.limiter, ctx.timeout, mbid)
        })
        .await
        .flatten();
        if let Some(release) = release {
            found = true;
            result.release_date = release.date;
            result.genres = fuse_genres(&release.genres, &release.tags);
            mb_cover = Some((musicbrainz::cover_art_url(mbid), CoverSource::MusicBrainz));
        }
    }

    let mut lastfm_cover = None;
    if let Some(creds) = &ctx.lastfm {
        let info = with_retry(&ctx.retry, "lastfm album info", || {
            lastfm::album_info(&ctx.client, creds, ctx.timeout, artist, album)
        })
        .await
        .flatten();
        if let Some(info) = info {
            found = true;
            result.notes = info.wiki_content();
            result.lastfm_url = info.url.clone();
            if result.mbid.is_none() {
                result.mbid = info.mbid.clone();
            }
            lastfm_cover = lastfm::largest_image(&info.image)
                .map(|url| (url, CoverSource::LastFm));
            let tags = info.tag_names();
            fuse_into(&mut result.genres, &tags);
        }
    }

    result.cover = first_non_empty([mb_cover, lastfm_cover]);

    let outcome = if found { Some(result) } else { None };
    ctx.cache.put(key, CachedValue::Album(outcome.clone()));
    outcome
}

pub async fn fetch_artist_metadata(
    ctx: &ExternalContext,
    artist: &str,
    known_mbid: Option<&str>,
) -> Option<ArtistMetadata> {
    let key = cache_key("artist", artist, "");
    if let Some(CachedValue::Artist(cached)) = ctx.cache.get(&key) {
        return cached;
    }

    let mut result = ArtistMetadata::default();
    let mut found = false;

    if let Some(creds) = &ctx.musicbrainz {
        let hit = match known_mbid {
            Some(mbid) => {
                with_retry(&ctx.retry, "musicbrainz artist lookup", || {
                    musicbrainz::artist_info(&ctx.client, creds, &ctx.limiter, ctx.timeout, mbid)
                })
                .await
                .flatten()
            }
            None => {
                with_retry(&ctx.retry, "musicbrainz artist search", || {
                    musicbrainz::search_artist(
                        &ctx.client,
                        creds,
                        &ctx.limiter,
                        ctx.timeout,
                        artist,
                    )
                })
                .await
                .flatten()
            }
        };
        if let Some(hit) = hit {
            found = true;
            result.mbid = Some(hit.id);
            result.genres = fuse_genres(&hit.genres, &hit.tags);
        }
    }

    let mut lastfm_image = None;
    if let Some(creds) = &ctx.lastfm {
        let info = with_retry(&ctx.retry, "lastfm artist info", || {
            lastfm::artist_info(&ctx.client, creds, ctx.timeout, artist)
        })
        .await
        .flatten();
        if let Some(info) = info {
            found = true;
            result.biography = info.bio_content();
            result.lastfm_url = info.url.clone();
            result.similar = info.similar_names();
            if result.mbid.is_none() {
                result.mbid = info.mbid.clone();
            }
            lastfm_image = lastfm::largest_image(&info.image)
                .map(|url| (url, CoverSource::LastFm));
            let tags = info.tag_names();
            fuse_into(&mut result.genres, &tags);
        }
    }

    let mut spotify_image = None;
    if let Some(spotify) = &ctx.spotify {
        let image = with_retry(&ctx.retry, "spotify artist image", || {
            spotify.artist_image(&ctx.client, ctx.timeout, artist)
        })
        .await
        .flatten();
        if let Some(url) = image {
            found = true;
            spotify_image = Some((url, CoverSource::Spotify));
        }
    }

    // Artist images: Spotify first, then Last.fm.
    result.image = first_non_empty([spotify_image, lastfm_image]);

    let outcome = if found { Some(result) } else { None };
    ctx.cache.put(key, CachedValue::Artist(outcome.clone()));
    outcome
}

/// Cover URL preference order: MusicBrainz Cover Art Archive, then the
/// largest Last.fm image.
pub async fn best_cover_art_url(
    ctx: &ExternalContext,
    artist: &str,
    album: &str,
    mbid: Option<&str>,
) -> Option<(String, CoverSource)> {
    fetch_album_metadata(ctx, artist, album, mbid)
        .await
        .and_then(|metadata| metadata.cover)
}

fn fuse_into(target: &mut Vec<String>, incoming: &[String]) {
    for value in incoming {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !target
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(trimmed))
        {
            target.push(trimmed.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_keys_normalize_case_and_whitespace() {
        assert_eq!(
            cache_key("album", " Radiohead ", "OK Computer"),
            cache_key("album", "radiohead", "ok computer")
        );
        assert_ne!(
            cache_key("album", "radiohead", "ok computer"),
            cache_key("artist", "radiohead", "ok computer")
        );
    }

    #[test]
    fn cache_expires_entries() {
        let cache = MetadataCache::new(Duration::from_secs(0));
        cache.put(
            "k".to_string(),
            CachedValue::Album(Some(AlbumMetadata::default())),
        );
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());

        let cache = MetadataCache::new(Duration::from_secs(60));
        cache.put("k".to_string(), CachedValue::Album(None));
        assert!(matches!(cache.get("k"), Some(CachedValue::Album(None))));
        cache.sweep();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn first_non_empty_keeps_provider_order() {
        assert_eq!(first_non_empty([None, Some("b"), Some("c")]), Some("b"));
        assert_eq!(first_non_empty::<&str>([None, None]), None);
        assert_eq!(first_non_empty([Some("a"), Some("b")]), Some("a"));
    }

    #[test]
    fn genre_fusion_applies_vote_threshold() {
        let official = vec!["Electronic".to_string()];
        let tags = vec![
            ("electronic".to_string(), 10),
            ("idm".to_string(), 5),
            ("seen live".to_string(), 1),
        ];
        assert_eq!(fuse_genres(&official, &tags), vec!["Electronic", "idm"]);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
        };
        let mut calls = 0u32;
        let result: Option<()> = with_retry(&policy, "test", || {
            calls += 1;
            async { Err(ProviderError::Status(500)) }
        })
        .await;
        assert!(result.is_none());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
        };
        let mut calls = 0u32;
        let result = with_retry(&policy, "test", || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 3 {
                    Err(ProviderError::Status(503))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Some(3));
    }

    #[tokio::test]
    async fn rate_limiter_enforces_minimum_gap() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
