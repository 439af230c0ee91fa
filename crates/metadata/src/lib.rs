use std::path::Path;

use lofty::error::LoftyError;
use lofty::picture::{Picture, PictureType};
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};

/// Normalized tag record for one audio file. Raw artist strings are kept
/// as written; splitting on separators happens in the identity resolver.
#[derive(Debug, Default, Clone)]
pub struct TagInfo {
    pub title: Option<String>,
    pub album: Option<String>,
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub track_no: Option<u16>,
    pub disc_no: Option<u16>,
    pub year: Option<i32>,
    pub genres: Vec<String>,
    pub lyrics: Option<String>,
    pub duration_ms: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub bitrate: Option<u32>,
    pub bit_depth: Option<u8>,
    pub replay_track_gain: Option<f32>,
    pub replay_track_peak: Option<f32>,
    pub replay_album_gain: Option<f32>,
    pub replay_album_peak: Option<f32>,
    pub pictures: Vec<EmbeddedPicture>,
}

#[derive(Debug, Clone)]
pub struct EmbeddedPicture {
    pub data: Vec<u8>,
    pub mime: Option<String>,
    pub is_front: bool,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

pub fn read_tags(path: &Path) -> Result<TagInfo, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let properties = tagged_file.properties();

    let mut info = TagInfo::default();

    let duration_ms = properties.duration().as_millis();
    if duration_ms > 0 {
        let clamped = duration_ms.min(u128::from(u32::MAX)) as u32;
        info.duration_ms = Some(clamped);
    }

    info.sample_rate = properties.sample_rate();
    info.channels = properties.channels();
    info.bitrate = properties.audio_bitrate().or(properties.overall_bitrate());
    info.bit_depth = properties.bit_depth();

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        info.title = tag.get_string(&ItemKey::TrackTitle).map(|v| v.to_string());
        info.album = tag.get_string(&ItemKey::AlbumTitle).map(|v| v.to_string());
        info.artist = tag.get_string(&ItemKey::TrackArtist).map(|v| v.to_string());
        info.album_artist = tag.get_string(&ItemKey::AlbumArtist).map(|v| v.to_string());
        info.track_no = tag.get_string(&ItemKey::TrackNumber).and_then(parse_u16);
        info.disc_no = tag.get_string(&ItemKey::DiscNumber).and_then(parse_u16);
        info.year = tag.get_string(&ItemKey::Year).and_then(parse_year);
        if let Some(value) = tag.get_string(&ItemKey::Genre) {
            info.genres = parse_genres(value);
        }
        info.lyrics = tag
            .get_string(&ItemKey::Lyrics)
            .map(|v| v.to_string())
            .filter(|v| !v.trim().is_empty());
        info.replay_track_gain = tag
            .get_string(&ItemKey::ReplayGainTrackGain)
            .and_then(parse_gain);
        info.replay_track_peak = tag
            .get_string(&ItemKey::ReplayGainTrackPeak)
            .and_then(parse_gain);
        info.replay_album_gain = tag
            .get_string(&ItemKey::ReplayGainAlbumGain)
            .and_then(parse_gain);
        info.replay_album_peak = tag
            .get_string(&ItemKey::ReplayGainAlbumPeak)
            .and_then(parse_gain);
        info.pictures = collect_pictures(tag.pictures());
    }

    Ok(info)
}

fn collect_pictures(pictures: &[Picture]) -> Vec<EmbeddedPicture> {
    pictures
        .iter()
        .map(|picture| {
            let data = picture.data().to_vec();
            let mime = guess_mime(&data);
            EmbeddedPicture {
                data,
                mime,
                is_front: picture.pic_type() == PictureType::CoverFront,
            }
        })
        .collect()
}

fn parse_u16(text: &str) -> Option<u16> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok()
}

fn parse_year(text: &str) -> Option<i32> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 4 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn parse_gain(text: &str) -> Option<f32> {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_suffix("dB")
        .or_else(|| trimmed.strip_suffix("db"))
        .unwrap_or(trimmed)
        .trim();
    trimmed.parse().ok()
}

fn parse_genres(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for part in text.split(&[';', ',', '/', '|', '\0'][..]) {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        out.push(trimmed.to_string());
    }
    if out.is_empty() {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
    }
    out
}

pub fn guess_mime(bytes: &[u8]) -> Option<String> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg".to_string())
    } else if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        Some("image/png".to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_gain, parse_genres, parse_u16, parse_year};

    #[test]
    fn track_numbers_ignore_totals() {
        assert_eq!(parse_u16("3/12"), Some(3));
        assert_eq!(parse_u16(" 7 "), Some(7));
        assert_eq!(parse_u16("x"), None);
    }

    #[test]
    fn years_take_the_first_four_digits() {
        assert_eq!(parse_year("1994-05-01"), Some(1994));
        assert_eq!(parse_year("released 2003"), Some(2003));
        assert_eq!(parse_year("n/a"), None);
    }

    #[test]
    fn gain_values_strip_db_suffix() {
        assert_eq!(parse_gain("-6.41 dB"), Some(-6.41));
        assert_eq!(parse_gain("0.988"), Some(0.988));
        assert_eq!(parse_gain("loud"), None);
    }

    #[test]
    fn genres_split_on_common_separators() {
        assert_eq!(
            parse_genres("Rock; Indie / Shoegaze"),
            vec!["Rock", "Indie", "Shoegaze"]
        );
        assert_eq!(parse_genres("  "), Vec::<String>::new());
    }
}
