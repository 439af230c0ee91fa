use std::collections::HashMap;
use std::time::Duration;

use md5::{Digest, Md5};
use reqwest::Client;
use serde::Deserialize;

use super::ProviderError;

const API_ROOT: &str = "https://ws.audioscrobbler.com/2.0/";
const LOVED_PAGE_LIMIT: u32 = 200;

#[derive(Clone, Debug)]
pub struct LastFmCreds {
    pub api_key: String,
    pub api_secret: String,
}

impl LastFmCreds {
    /// None when the API key is missing; the provider then short-circuits.
    pub fn new(api_key: &str, api_secret: &str) -> Option<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return None;
        }
        Some(Self {
            api_key: api_key.to_string(),
            api_secret: api_secret.trim().to_string(),
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LfmImage {
    #[serde(rename = "#text", default)]
    pub url: String,
    #[serde(default)]
    pub size: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LfmWiki {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LfmTag {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LfmTags {
    #[serde(default)]
    pub tag: Vec<LfmTag>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LfmAlbum {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub mbid: Option<String>,
    #[serde(default)]
    pub image: Vec<LfmImage>,
    #[serde(default)]
    pub wiki: Option<LfmWiki>,
    #[serde(default)]
    pub tags: Option<LfmTags>,
}

impl LfmAlbum {
    pub fn wiki_content(&self) -> Option<String> {
        clean_text(self.wiki.as_ref().and_then(|wiki| wiki.content.clone()))
    }

    pub fn tag_names(&self) -> Vec<String> {
        tag_names(&self.tags)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LfmSimilarArtist {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LfmSimilar {
    #[serde(default)]
    pub artist: Vec<LfmSimilarArtist>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LfmArtist {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub mbid: Option<String>,
    #[serde(default)]
    pub image: Vec<LfmImage>,
    #[serde(default)]
    pub bio: Option<LfmWiki>,
    #[serde(default)]
    pub similar: Option<LfmSimilar>,
    #[serde(default)]
    pub tags: Option<LfmTags>,
}

impl LfmArtist {
    pub fn bio_content(&self) -> Option<String> {
        clean_text(self.bio.as_ref().and_then(|bio| bio.content.clone()))
    }

    pub fn similar_names(&self) -> Vec<String> {
        self.similar
            .as_ref()
            .map(|similar| similar.artist.iter().map(|a| a.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn tag_names(&self) -> Vec<String> {
        tag_names(&self.tags)
    }
}

#[derive(Deserialize)]
struct AlbumInfoResponse {
    album: Option<LfmAlbum>,
}

#[derive(Deserialize)]
struct ArtistInfoResponse {
    artist: Option<LfmArtist>,
}

#[derive(Deserialize)]
struct LovedTracksResponse {
    lovedtracks: Option<LfmLovedTracks>,
}

#[derive(Deserialize)]
struct LfmLovedTracks {
    #[serde(default)]
    track: Vec<LfmLovedTrack>,
    #[serde(rename = "@attr")]
    attr: Option<LfmPageAttr>,
}

#[derive(Deserialize)]
struct LfmLovedTrack {
    name: String,
    artist: LfmLovedArtist,
    #[serde(default)]
    date: Option<LfmDate>,
}

#[derive(Deserialize)]
struct LfmLovedArtist {
    name: String,
}

#[derive(Deserialize)]
struct LfmDate {
    uts: String,
}

#[derive(Deserialize)]
struct LfmPageAttr {
    #[serde(rename = "totalPages", default)]
    total_pages: Option<String>,
}

pub async fn album_info(
    client: &Client,
    creds: &LastFmCreds,
    timeout: Duration,
    artist: &str,
    album: &str,
) -> Result<Option<LfmAlbum>, ProviderError> {
    let response = client
        .get(API_ROOT)
        .timeout(timeout)
        .query(&[
            ("method", "album.getInfo"),
            ("api_key", creds.api_key.as_str()),
            ("artist", artist),
            ("album", album),
            ("autocorrect", "1"),
            ("format", "json"),
        ])
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(ProviderError::Status(response.status().as_u16()));
    }
    let payload = response
        .json::<AlbumInfoResponse>()
        .await
        .map_err(|err| ProviderError::Decode(err.to_string()))?;
    Ok(payload.album)
}

pub async fn artist_info(
    client: &Client,
    creds: &LastFmCreds,
    timeout: Duration,
    artist: &str,
) -> Result<Option<LfmArtist>, ProviderError> {
    let response = client
        .get(API_ROOT)
        .timeout(timeout)
        .query(&[
            ("method", "artist.getInfo"),
            ("api_key", creds.api_key.as_str()),
            ("artist", artist),
            ("autocorrect", "1"),
            ("format", "json"),
        ])
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(ProviderError::Status(response.status().as_u16()));
    }
    let payload = response
        .json::<ArtistInfoResponse>()
        .await
        .map_err(|err| ProviderError::Decode(err.to_string()))?;
    Ok(payload.artist)
}

/// The user's loved tracks as `(artist, title)` (lowercased) to love
/// timestamp, following pagination to the end.
pub async fn user_loved_tracks(
    client: &Client,
    creds: &LastFmCreds,
    timeout: Duration,
    user: &str,
) -> Result<HashMap<(String, String), u64>, ProviderError> {
    let mut out = HashMap::new();
    let mut page = 1u32;
    loop {
        let page_str = page.to_string();
        let limit_str = LOVED_PAGE_LIMIT.to_string();
        let response = client
            .get(API_ROOT)
            .timeout(timeout)
            .query(&[
                ("method", "user.getLovedTracks"),
                ("api_key", creds.api_key.as_str()),
                ("user", user),
                ("limit", limit_str.as_str()),
                ("page", page_str.as_str()),
                ("format", "json"),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }
        let payload = response
            .json::<LovedTracksResponse>()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;
        let loved = match payload.lovedtracks {
            Some(loved) => loved,
            None => break,
        };

        for track in &loved.track {
            let uts = track
                .date
                .as_ref()
                .and_then(|date| date.uts.parse::<u64>().ok())
                .unwrap_or(0);
            out.insert(
                (
                    track.artist.name.trim().to_lowercase(),
                    track.name.trim().to_lowercase(),
                ),
                uts,
            );
        }

        let total_pages = loved
            .attr
            .as_ref()
            .and_then(|attr| attr.total_pages.as_ref())
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(1);
        if page >= total_pages || loved.track.is_empty() {
            break;
        }
        page += 1;
    }
    Ok(out)
}

/// Pushes a love/unlove. Requires a session key; signed calls carry an
/// `api_sig` over the sorted parameters.
pub async fn set_track_love_status(
    client: &Client,
    creds: &LastFmCreds,
    timeout: Duration,
    session_key: &str,
    artist: &str,
    track: &str,
    love: bool,
) -> Result<(), ProviderError> {
    let method = if love { "track.love" } else { "track.unlove" };
    let params = [
        ("method", method),
        ("api_key", creds.api_key.as_str()),
        ("artist", artist),
        ("track", track),
        ("sk", session_key),
    ];
    let api_sig = api_signature(&params, &creds.api_secret);

    let mut form: Vec<(&str, &str)> = params.to_vec();
    form.push(("api_sig", api_sig.as_str()));
    form.push(("format", "json"));

    let response = client
        .post(API_ROOT)
        .timeout(timeout)
        .form(&form)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(ProviderError::Status(response.status().as_u16()));
    }
    Ok(())
}

/// md5 over parameters sorted by name, concatenated as `namevalue`, with
/// the shared secret appended.
pub fn api_signature(params: &[(&str, &str)], secret: &str) -> String {
    let mut sorted: Vec<(&str, &str)> = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let mut input = String::new();
    for (name, value) in sorted {
        input.push_str(name);
        input.push_str(value);
    }
    input.push_str(secret);

    let digest = Md5::digest(input.as_bytes());
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Largest available image by declared size, ignoring empty URLs.
pub fn largest_image(images: &[LfmImage]) -> Option<String> {
    const SIZE_ORDER: &[&str] = &["mega", "extralarge", "large", "medium", "small"];
    let mut best: Option<(usize, &LfmImage)> = None;
    for image in images {
        if image.url.trim().is_empty() {
            continue;
        }
        let rank = image
            .size
            .as_deref()
            .and_then(|size| SIZE_ORDER.iter().position(|s| *s == size))
            .unwrap_or(SIZE_ORDER.len());
        match best {
            Some((best_rank, _)) if best_rank <= rank => {}
            _ => best = Some((rank, image)),
        }
    }
    best.map(|(_, image)| image.url.clone())
}

fn tag_names(tags: &Option<LfmTags>) -> Vec<String> {
    tags.as_ref()
        .map(|tags| {
            tags.tag
                .iter()
                .map(|tag| tag.name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn clean_text(value: Option<String>) -> Option<String> {
    let value = value?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_order_independent_and_secret_bound() {
        let forward = api_signature(&[("artist", "a"), ("method", "track.love")], "secret");
        let reversed = api_signature(&[("method", "track.love"), ("artist", "a")], "secret");
        assert_eq!(forward, reversed);
        assert_eq!(forward.len(), 32);
        assert_ne!(
            forward,
            api_signature(&[("artist", "a"), ("method", "track.love")], "other")
        );
    }

    #[test]
    fn largest_image_prefers_bigger_sizes() {
        let images = vec![
            LfmImage {
                url: "small.jpg".to_string(),
                size: Some("small".to_string()),
            },
            LfmImage {
                url: "xl.jpg".to_string(),
                size: Some("extralarge".to_string()),
            },
            LfmImage {
                url: String::new(),
                size: Some("mega".to_string()),
            },
        ];
        assert_eq!(largest_image(&images), Some("xl.jpg".to_string()));
        assert_eq!(largest_image(&[]), None);
    }

    #[test]
    fn missing_api_key_short_circuits() {
        assert!(LastFmCreds::new("  ", "secret").is_none());
        assert!(LastFmCreds::new("key", "").is_some());
    }
}
