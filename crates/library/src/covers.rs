use std::fs;
use std::path::{Path, PathBuf};

use common::{CoverArt, CoverSource};
use metadata::EmbeddedPicture;
use tracing::warn;

use crate::store::{Store, StoreError, COVERS_TABLE};

/// Well-known sibling filenames checked for a local cover, in order.
const LOCAL_COVER_NAMES: &[&str] = &["cover", "folder", "front", "album"];
const LOCAL_COVER_EXTS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// A remote image candidate, already downloaded by the caller.
pub struct RemoteCover {
    pub bytes: Vec<u8>,
    pub source: CoverSource,
}

/// Acquires, scores and upgrades cover images per entity. Every failure
/// degrades to "no cover" with a warning; this component never fails a
/// scan.
pub struct CoverManager<'a> {
    store: &'a Store,
    data_dir: &'a Path,
}

impl<'a> CoverManager<'a> {
    pub fn new(store: &'a Store, data_dir: &'a Path) -> Self {
        Self { store, data_dir }
    }

    /// Tries candidates in priority order: embedded front cover, then a
    /// local sibling file, then the remote candidate. Returns the stored
    /// relpath when a cover ends up on disk (pre-existing or new).
    pub fn acquire(
        &self,
        entity_id: &str,
        embedded: &[EmbeddedPicture],
        local_dir: Option<&Path>,
        remote: Option<RemoteCover>,
        force_upgrade: bool,
    ) -> Option<String> {
        let mut stored = None;

        if let Some(picture) = pick_embedded(embedded) {
            stored = self
                .consider(entity_id, &picture.data, CoverSource::Embedded, force_upgrade)
                .or(stored);
        }

        if let Some(dir) = local_dir {
            if let Some(path) = find_local_cover(dir) {
                match fs::read(&path) {
                    Ok(bytes) => {
                        stored = self
                            .consider(entity_id, &bytes, CoverSource::Local, force_upgrade)
                            .or(stored);
                    }
                    Err(err) => {
                        warn!("Failed to read local cover {:?}: {}", path, err);
                    }
                }
            }
        }

        if let Some(remote) = remote {
            stored = self
                .consider(entity_id, &remote.bytes, remote.source, force_upgrade)
                .or(stored);
        }

        stored.or_else(|| self.existing_relpath(entity_id))
    }

    pub fn get(&self, entity_id: &str) -> Option<CoverArt> {
        match self.store.get::<CoverArt>(COVERS_TABLE, entity_id) {
            Ok(cover) => cover,
            Err(err) => {
                warn!("Failed to load cover record {}: {}", entity_id, err);
                None
            }
        }
    }

    /// True when the entity has a cover row whose file is still on disk.
    /// A missing file counts as "no cover" and re-arms acquisition.
    pub fn has_usable_cover(&self, entity_id: &str) -> bool {
        match self.get(entity_id) {
            Some(cover) => common::join_relpath(self.data_dir, &cover.relpath).is_file(),
            None => false,
        }
    }

    fn existing_relpath(&self, entity_id: &str) -> Option<String> {
        let cover = self.get(entity_id)?;
        if common::join_relpath(self.data_dir, &cover.relpath).is_file() {
            Some(cover.relpath)
        } else {
            None
        }
    }

    /// Scores the candidate against the stored cover and replaces it only
    /// on a strictly higher score (or `force_upgrade`).
    fn consider(
        &self,
        entity_id: &str,
        bytes: &[u8],
        source: CoverSource,
        force_upgrade: bool,
    ) -> Option<String> {
        if bytes.is_empty() {
            return None;
        }
        let (width, height) = probe_dimensions(bytes).unwrap_or((0, 0));
        let candidate_score = u64::from(width) * u64::from(height) + source.priority_weight();

        if !force_upgrade {
            if let Some(existing) = self.get(entity_id) {
                let file_present =
                    common::join_relpath(self.data_dir, &existing.relpath).is_file();
                if file_present && candidate_score <= existing.quality_score() {
                    return None;
                }
            }
        }

        match self.persist(entity_id, bytes, source, width, height) {
            Ok(relpath) => Some(relpath),
            Err(err) => {
                warn!("Failed to store cover for {}: {}", entity_id, err);
                None
            }
        }
    }

    fn persist(
        &self,
        entity_id: &str,
        bytes: &[u8],
        source: CoverSource,
        width: u32,
        height: u32,
    ) -> Result<String, StoreError> {
        let mime = metadata::guess_mime(bytes).unwrap_or_else(|| "image/jpeg".to_string());
        let ext = match mime.as_str() {
            "image/png" => "png",
            _ => "jpg",
        };

        let covers_dir = self.data_dir.join("covers");
        fs::create_dir_all(&covers_dir)?;

        // Drop a stale file with the other extension before writing.
        if let Some(previous) = self.get(entity_id) {
            let old = common::join_relpath(self.data_dir, &previous.relpath);
            if old.file_name() != Some(format!("{}.{}", entity_id, ext).as_ref()) {
                let _ = fs::remove_file(old);
            }
        }

        let relpath = format!("covers/{}.{}", entity_id, ext);
        fs::write(covers_dir.join(format!("{}.{}", entity_id, ext)), bytes)?;

        let record = CoverArt {
            id: entity_id.to_string(),
            relpath: relpath.clone(),
            mime,
            source,
            width,
            height,
            file_size: bytes.len() as u64,
        };
        self.store.put(COVERS_TABLE, entity_id, &record)?;
        Ok(relpath)
    }
}

fn pick_embedded(pictures: &[EmbeddedPicture]) -> Option<&EmbeddedPicture> {
    pictures
        .iter()
        .find(|picture| picture.is_front)
        .or_else(|| pictures.first())
}

pub fn find_local_cover(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    let mut found: Vec<(usize, PathBuf)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = match path.file_stem().and_then(|s| s.to_str()) {
            Some(name) => name.to_ascii_lowercase(),
            None => continue,
        };
        let ext = match path.extension().and_then(|s| s.to_str()) {
            Some(ext) => ext.to_ascii_lowercase(),
            None => continue,
        };
        if !LOCAL_COVER_EXTS.contains(&ext.as_str()) {
            continue;
        }
        if let Some(rank) = LOCAL_COVER_NAMES.iter().position(|n| *n == name) {
            found.push((rank, path));
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    found.into_iter().next().map(|(_, path)| path)
}

/// Minimal PNG/JPEG header parsing; no full image decode.
pub fn probe_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    png_dimensions(bytes).or_else(|| jpeg_dimensions(bytes))
}

fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    const SIGNATURE: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    if bytes.len() < 24 || !bytes.starts_with(SIGNATURE) {
        return None;
    }
    if &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

fn jpeg_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return None;
    }
    let mut offset = 2usize;
    while offset + 9 <= bytes.len() {
        if bytes[offset] != 0xFF {
            return None;
        }
        let mut marker_at = offset + 1;
        // Fill bytes before a marker are legal.
        while marker_at < bytes.len() && bytes[marker_at] == 0xFF {
            marker_at += 1;
        }
        if marker_at >= bytes.len() {
            return None;
        }
        let marker = bytes[marker_at];
        if is_sof_marker(marker) {
            let data = marker_at + 1;
            if data + 7 > bytes.len() {
                return None;
            }
            let height = u32::from(u16::from_be_bytes([bytes[data + 3], bytes[data + 4]]));
            let width = u32::from(u16::from_be_bytes([bytes[data + 5], bytes[data + 6]]));
            if width == 0 || height == 0 {
                return None;
            }
            return Some((width, height));
        }
        if marker == 0xD8 || (0xD0..=0xD7).contains(&marker) {
            offset = marker_at + 1;
            continue;
        }
        let data = marker_at + 1;
        if data + 2 > bytes.len() {
            return None;
        }
        let length = usize::from(u16::from_be_bytes([bytes[data], bytes[data + 1]]));
        if length < 2 {
            return None;
        }
        offset = data + length;
    }
    None
}

fn is_sof_marker(marker: u8) -> bool {
    matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut out = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        out.extend_from_slice(&13u32.to_be_bytes());
        out.extend_from_slice(b"IHDR");
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&height.to_be_bytes());
        out.extend_from_slice(&[8, 6, 0, 0, 0]);
        out
    }

    fn jpeg_bytes(width: u16, height: u16) -> Vec<u8> {
        let mut out = vec![0xFF, 0xD8];
        // APP0 segment, then SOF0.
        out.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00]);
        out.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        out.extend_from_slice(&height.to_be_bytes());
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&[0x03]);
        out
    }

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("test.redb")).expect("open store");
        (dir, store)
    }

    #[test]
    fn probes_png_and_jpeg_headers() {
        assert_eq!(probe_dimensions(&png_bytes(640, 480)), Some((640, 480)));
        assert_eq!(probe_dimensions(&jpeg_bytes(1200, 800)), Some((1200, 800)));
        assert_eq!(probe_dimensions(b"not an image"), None);
    }

    #[test]
    fn lower_scored_candidate_never_replaces() {
        let (dir, store) = open_temp();
        let manager = CoverManager::new(&store, dir.path());

        let big = RemoteCover {
            bytes: png_bytes(1000, 1000),
            source: CoverSource::Local,
        };
        let relpath = manager
            .acquire("album1", &[], None, Some(big), false)
            .expect("stored");
        let stored = manager.get("album1").expect("record");
        assert_eq!(stored.width, 1000);
        assert_eq!(stored.source, CoverSource::Local);

        // A small remote thumbnail must not downgrade the local cover.
        let small = RemoteCover {
            bytes: png_bytes(200, 200),
            source: CoverSource::LastFm,
        };
        let unchanged = manager.acquire("album1", &[], None, Some(small), false);
        assert_eq!(unchanged, Some(relpath));
        let stored = manager.get("album1").expect("record");
        assert_eq!(stored.width, 1000);
        assert_eq!(stored.source, CoverSource::Local);
    }

    #[test]
    fn higher_scored_candidate_replaces() {
        let (dir, store) = open_temp();
        let manager = CoverManager::new(&store, dir.path());

        let small = RemoteCover {
            bytes: png_bytes(200, 200),
            source: CoverSource::LastFm,
        };
        manager.acquire("album1", &[], None, Some(small), false);

        let big = RemoteCover {
            bytes: png_bytes(1400, 1400),
            source: CoverSource::MusicBrainz,
        };
        manager.acquire("album1", &[], None, Some(big), false);
        let stored = manager.get("album1").expect("record");
        assert_eq!(stored.width, 1400);
        assert_eq!(stored.source, CoverSource::MusicBrainz);
    }

    #[test]
    fn force_upgrade_overrides_scoring() {
        let (dir, store) = open_temp();
        let manager = CoverManager::new(&store, dir.path());

        let big = RemoteCover {
            bytes: png_bytes(1000, 1000),
            source: CoverSource::MusicBrainz,
        };
        manager.acquire("album1", &[], None, Some(big), false);

        let small = RemoteCover {
            bytes: png_bytes(100, 100),
            source: CoverSource::Spotify,
        };
        manager.acquire("album1", &[], None, Some(small), true);
        let stored = manager.get("album1").expect("record");
        assert_eq!(stored.width, 100);
        assert_eq!(stored.source, CoverSource::Spotify);
    }

    #[test]
    fn missing_file_rearms_acquisition() {
        let (dir, store) = open_temp();
        let manager = CoverManager::new(&store, dir.path());

        let big = RemoteCover {
            bytes: png_bytes(1000, 1000),
            source: CoverSource::MusicBrainz,
        };
        let relpath = manager
            .acquire("album1", &[], None, Some(big), false)
            .expect("stored");
        std::fs::remove_file(common::join_relpath(dir.path(), &relpath)).unwrap();
        assert!(!manager.has_usable_cover("album1"));

        let small = RemoteCover {
            bytes: png_bytes(100, 100),
            source: CoverSource::LastFm,
        };
        let reacquired = manager.acquire("album1", &[], None, Some(small), false);
        assert!(reacquired.is_some());
        let stored = manager.get("album1").expect("record");
        assert_eq!(stored.width, 100);
    }
}
