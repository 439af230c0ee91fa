use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use super::{ProviderError, RateLimiter};

const API_ROOT: &str = "https://musicbrainz.org/ws/2";
const COVER_ART_ROOT: &str = "https://coverartarchive.org";

/// MusicBrainz requires a meaningful User-Agent; every call goes through
/// the shared limiter to honor the 1 req/s policy.
#[derive(Clone, Debug)]
pub struct MusicBrainzCreds {
    pub user_agent: String,
}

impl MusicBrainzCreds {
    pub fn new(user_agent: &str) -> Option<Self> {
        let user_agent = user_agent.trim();
        if user_agent.is_empty() {
            return None;
        }
        Some(Self {
            user_agent: user_agent.to_string(),
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct ReleaseInfo {
    pub date: Option<String>,
    pub genres: Vec<String>,
    pub tags: Vec<(String, u32)>,
}

#[derive(Clone, Debug)]
pub struct ArtistHit {
    pub id: String,
    pub genres: Vec<String>,
    pub tags: Vec<(String, u32)>,
}

#[derive(Deserialize)]
struct MbNamed {
    name: String,
    #[serde(default)]
    count: Option<u32>,
}

#[derive(Deserialize)]
struct ReleaseSearchResponse {
    #[serde(default)]
    releases: Vec<ReleaseSearchHit>,
}

#[derive(Deserialize)]
struct ReleaseSearchHit {
    id: String,
}

#[derive(Deserialize)]
struct ReleaseLookupResponse {
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    genres: Vec<MbNamed>,
    #[serde(default)]
    tags: Vec<MbNamed>,
}

#[derive(Deserialize)]
struct ArtistSearchResponse {
    #[serde(default)]
    artists: Vec<ArtistPayload>,
}

#[derive(Deserialize)]
struct ArtistPayload {
    id: String,
    #[serde(default)]
    genres: Vec<MbNamed>,
    #[serde(default)]
    tags: Vec<MbNamed>,
}

/// Finds the release ID by artist and title, for albums tagged without
/// an MBID.
pub async fn search_release(
    client: &Client,
    creds: &MusicBrainzCreds,
    limiter: &RateLimiter,
    timeout: Duration,
    artist: &str,
    album: &str,
) -> Result<Option<String>, ProviderError> {
    let query = format!("artist:{} AND release:{}", quote(artist), quote(album));
    let url = format!(
        "{}/release/?query={}&fmt=json&limit=1",
        API_ROOT,
        url_escape(&query)
    );
    let payload: ReleaseSearchResponse = get_json(client, creds, limiter, timeout, &url).await?;
    Ok(payload.releases.into_iter().next().map(|hit| hit.id))
}

pub async fn release_info(
    client: &Client,
    creds: &MusicBrainzCreds,
    limiter: &RateLimiter,
    timeout: Duration,
    mbid: &str,
) -> Result<Option<ReleaseInfo>, ProviderError> {
    let url = format!(
        "{}/release/{}?fmt=json&inc=genres+tags",
        API_ROOT,
        url_escape(mbid)
    );
    match get_json::<ReleaseLookupResponse>(client, creds, limiter, timeout, &url).await {
        Ok(payload) => Ok(Some(ReleaseInfo {
            date: payload.date.filter(|date| !date.trim().is_empty()),
            genres: named_list(payload.genres),
            tags: counted_list(payload.tags),
        })),
        Err(ProviderError::Status(404)) => Ok(None),
        Err(err) => Err(err),
    }
}

pub async fn search_artist(
    client: &Client,
    creds: &MusicBrainzCreds,
    limiter: &RateLimiter,
    timeout: Duration,
    artist: &str,
) -> Result<Option<ArtistHit>, ProviderError> {
    let query = format!("artist:{}", quote(artist));
    let url = format!(
        "{}/artist/?query={}&fmt=json&limit=1",
        API_ROOT,
        url_escape(&query)
    );
    let payload: ArtistSearchResponse = get_json(client, creds, limiter, timeout, &url).await?;
    Ok(payload.artists.into_iter().next().map(artist_hit))
}

pub async fn artist_info(
    client: &Client,
    creds: &MusicBrainzCreds,
    limiter: &RateLimiter,
    timeout: Duration,
    mbid: &str,
) -> Result<Option<ArtistHit>, ProviderError> {
    let url = format!(
        "{}/artist/{}?fmt=json&inc=genres+tags",
        API_ROOT,
        url_escape(mbid)
    );
    match get_json::<ArtistPayload>(client, creds, limiter, timeout, &url).await {
        Ok(payload) => Ok(Some(artist_hit(payload))),
        Err(ProviderError::Status(404)) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Front-cover URL on the Cover Art Archive for a release MBID. The
/// archive redirects to the image; downloading resolves it.
pub fn cover_art_url(mbid: &str) -> String {
    format!("{}/release/{}/front", COVER_ART_ROOT, url_escape(mbid))
}

async fn get_json<T: for<'de> serde::Deserialize<'de>>(
    client: &Client,
    creds: &MusicBrainzCreds,
    limiter: &RateLimiter,
    timeout: Duration,
    url: &str,
) -> Result<T, ProviderError> {
    limiter.acquire().await;
    let response = client
        .get(url)
        .timeout(timeout)
        .header("User-Agent", &creds.user_agent)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(ProviderError::Status(response.status().as_u16()));
    }
    response
        .json::<T>()
        .await
        .map_err(|err| ProviderError::Decode(err.to_string()))
}

fn artist_hit(payload: ArtistPayload) -> ArtistHit {
    ArtistHit {
        id: payload.id,
        genres: named_list(payload.genres),
        tags: counted_list(payload.tags),
    }
}

fn named_list(values: Vec<MbNamed>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

fn counted_list(values: Vec<MbNamed>) -> Vec<(String, u32)> {
    values
        .into_iter()
        .map(|value| (value.name.trim().to_string(), value.count.unwrap_or(0)))
        .filter(|(name, _)| !name.is_empty())
        .collect()
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', " "))
}

fn url_escape(input: &str) -> String {
    let mut out = String::new();
    for byte in input.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(*byte as char)
            }
            b' ' => out.push_str("%20"),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_neutralizes_embedded_quotes() {
        assert_eq!(quote("OK Computer"), "\"OK Computer\"");
        assert_eq!(quote("say \"hi\""), "\"say  hi \"");
    }

    #[test]
    fn url_escape_covers_reserved_bytes() {
        assert_eq!(url_escape("a b"), "a%20b");
        assert_eq!(url_escape("a&b=c"), "a%26b%3Dc");
        assert_eq!(url_escape("safe-chars_.~"), "safe-chars_.~");
    }

    #[test]
    fn cover_art_urls_point_at_front_image() {
        assert_eq!(
            cover_art_url("abc-123"),
            "https://coverartarchive.org/release/abc-123/front"
        );
    }
}
