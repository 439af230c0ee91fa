use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// An ordered artist reference as stored on tracks and albums.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistRef {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayGain {
    #[serde(default)]
    pub track_gain: Option<f32>,
    #[serde(default)]
    pub track_peak: Option<f32>,
    #[serde(default)]
    pub album_gain: Option<f32>,
    #[serde(default)]
    pub album_peak: Option<f32>,
}

impl ReplayGain {
    pub fn is_empty(&self) -> bool {
        self.track_gain.is_none()
            && self.track_peak.is_none()
            && self.album_gain.is_none()
            && self.album_peak.is_none()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    /// Slash-normalized absolute path; unique per track.
    pub path: String,
    pub album_id: String,
    pub artists: Vec<ArtistRef>,
    pub title: String,
    pub album: String,
    pub track_no: Option<u16>,
    pub disc_no: Option<u16>,
    pub year: Option<i32>,
    #[serde(default)]
    pub genres: Vec<String>,
    pub duration_ms: u32,
    pub bitrate: Option<u32>,
    pub channels: Option<u8>,
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub bit_depth: Option<u8>,
    pub file_size: u64,
    /// Unix mtime seconds; the change-detection fingerprint.
    pub last_modified: u64,
    #[serde(default)]
    pub lyrics: Option<String>,
    #[serde(default)]
    pub replay_gain: Option<ReplayGain>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscTitle {
    pub disc_no: u16,
    pub title: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlbumExternalInfo {
    pub fetched: bool,
    pub notes: Option<String>,
    pub lastfm_url: Option<String>,
    pub mbid: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub name: String,
    /// Display string, e.g. the album-artist tag as written.
    pub display_artist: String,
    pub artists: Vec<ArtistRef>,
    pub year: Option<i32>,
    #[serde(default)]
    pub release_date: Option<String>,
    /// An album's cover key equals its album ID.
    pub cover_art: String,
    /// Ordered track IDs.
    pub tracks: Vec<String>,
    pub duration_ms: u64,
    pub track_count: usize,
    #[serde(default)]
    pub disc_titles: Vec<DiscTitle>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub external: AlbumExternalInfo,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtistExternalInfo {
    pub fetched: bool,
    pub biography: Option<String>,
    pub similar: Vec<String>,
    pub image_url: Option<String>,
    pub lastfm_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
    pub albums: Vec<String>,
    pub album_count: usize,
    /// An artist's cover key equals its artist ID.
    pub cover_art: String,
    #[serde(default)]
    pub mbid: Option<String>,
    #[serde(default)]
    pub external: ArtistExternalInfo,
}

/// Where a stored cover image came from, ordered by trust for upgrades.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverSource {
    Embedded,
    Local,
    MusicBrainz,
    LastFm,
    Spotify,
    Unknown,
}

impl CoverSource {
    pub fn priority_weight(self) -> u64 {
        match self {
            CoverSource::MusicBrainz => 5,
            CoverSource::Local => 4,
            CoverSource::Embedded => 3,
            CoverSource::LastFm => 2,
            CoverSource::Spotify => 1,
            CoverSource::Unknown => 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoverArt {
    /// Shared with the album/artist/playlist the cover belongs to.
    pub id: String,
    pub relpath: String,
    pub mime: String,
    pub source: CoverSource,
    pub width: u32,
    pub height: u32,
    pub file_size: u64,
}

impl CoverArt {
    pub fn quality_score(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) + self.source.priority_weight()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Track,
    Album,
    Artist,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Track => "track",
            EntityKind::Album => "album",
            EntityKind::Artist => "artist",
        }
    }
}

/// A resolved entity reference, decided once at the boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserEntityData {
    pub starred: Option<u64>,
    pub unstarred: Option<u64>,
    pub play_count: u32,
    pub last_played: Option<u64>,
    pub rating: Option<u8>,
}

impl UserEntityData {
    /// Whichever of starred/unstarred is more recent wins.
    pub fn is_starred(&self) -> bool {
        match (self.starred, self.unstarred) {
            (Some(starred), Some(unstarred)) => starred > unstarred,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.starred.is_none()
            && self.unstarred.is_none()
            && self.play_count == 0
            && self.last_played.is_none()
            && self.rating.is_none()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub track_ids: Vec<String>,
    pub duration_ms: u64,
    pub track_count: usize,
    #[serde(default)]
    pub cover_art: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Share {
    pub id: String,
    pub entity: EntityRef,
    #[serde(default)]
    pub cover_art: Option<String>,
    pub created: u64,
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

pub fn path_to_slash_string(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    parts.join("/")
}

pub fn relpath_from(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(path_to_slash_string(rel))
}

pub fn join_relpath(root: &Path, relpath: &str) -> PathBuf {
    let mut out = PathBuf::from(root);
    for part in relpath.split('/') {
        if part.is_empty() {
            continue;
        }
        out.push(part);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{stable_id, CoverArt, CoverSource, UserEntityData};

    #[test]
    fn stable_id_is_deterministic() {
        let first = stable_id("Artist/Album/Track.mp3");
        let second = stable_id("Artist/Album/Track.mp3");
        assert_eq!(first, second);
        assert_ne!(first, stable_id("Artist/Album/Track2.mp3"));
    }

    #[test]
    fn cover_score_orders_sources_at_equal_size() {
        let cover = |source| CoverArt {
            id: "a".into(),
            relpath: "covers/a.jpg".into(),
            mime: "image/jpeg".into(),
            source,
            width: 500,
            height: 500,
            file_size: 1,
        };
        assert!(
            cover(CoverSource::MusicBrainz).quality_score()
                > cover(CoverSource::Local).quality_score()
        );
        assert!(
            cover(CoverSource::Local).quality_score()
                > cover(CoverSource::Embedded).quality_score()
        );
        assert!(
            cover(CoverSource::Embedded).quality_score()
                > cover(CoverSource::LastFm).quality_score()
        );
        assert!(
            cover(CoverSource::LastFm).quality_score()
                > cover(CoverSource::Spotify).quality_score()
        );
    }

    #[test]
    fn starred_state_uses_latest_timestamp() {
        let mut data = UserEntityData::default();
        assert!(!data.is_starred());
        data.starred = Some(100);
        assert!(data.is_starred());
        data.unstarred = Some(200);
        assert!(!data.is_starred());
        data.starred = Some(300);
        assert!(data.is_starred());
    }
}
