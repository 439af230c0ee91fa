use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::ProviderError;

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const SEARCH_URL: &str = "https://api.spotify.com/v1/search";

/// Refresh the cached token this long before it actually expires.
const TOKEN_SLACK: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct Token {
    value: String,
    expires_at: Instant,
}

/// Client-credentials Spotify access, used for artist image search only.
/// The OAuth token is cached with its expiry.
pub struct SpotifyClient {
    client_id: String,
    client_secret: String,
    token: Mutex<Option<Token>>,
}

impl SpotifyClient {
    pub fn new(client_id: &str, client_secret: &str) -> Option<Self> {
        let client_id = client_id.trim();
        let client_secret = client_secret.trim();
        if client_id.is_empty() || client_secret.is_empty() {
            return None;
        }
        Some(Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            token: Mutex::new(None),
        })
    }

    async fn token(&self, client: &Client, timeout: Duration) -> Result<String, ProviderError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_SLACK {
                return Ok(token.value.clone());
            }
        }

        let response = client
            .post(TOKEN_URL)
            .timeout(timeout)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }
        let payload = response
            .json::<TokenResponse>()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;

        let token = Token {
            value: payload.access_token,
            expires_at: Instant::now() + Duration::from_secs(payload.expires_in),
        };
        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    /// The largest image of the best artist match, if any. Spotify sorts
    /// images largest-first.
    pub async fn artist_image(
        &self,
        client: &Client,
        timeout: Duration,
        artist: &str,
    ) -> Result<Option<String>, ProviderError> {
        let token = self.token(client, timeout).await?;
        let response = client
            .get(SEARCH_URL)
            .timeout(timeout)
            .bearer_auth(token)
            .query(&[("type", "artist"), ("limit", "1"), ("q", artist)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }
        let payload = response
            .json::<SearchResponse>()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;

        let url = payload
            .artists
            .and_then(|artists| artists.items.into_iter().next())
            .and_then(|artist| artist.images.into_iter().next())
            .map(|image| image.url)
            .filter(|url| !url.trim().is_empty());
        Ok(url)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct SearchResponse {
    artists: Option<SearchArtists>,
}

#[derive(Deserialize)]
struct SearchArtists {
    #[serde(default)]
    items: Vec<SearchArtist>,
}

#[derive(Deserialize)]
struct SearchArtist {
    #[serde(default)]
    images: Vec<SearchImage>,
}

#[derive(Deserialize)]
struct SearchImage {
    url: String,
}

#[cfg(test)]
mod tests {
    use super::SpotifyClient;

    #[test]
    fn missing_credentials_disable_the_provider() {
        assert!(SpotifyClient::new("", "secret").is_none());
        assert!(SpotifyClient::new("id", " ").is_none());
        assert!(SpotifyClient::new("id", "secret").is_some());
    }
}
