use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use common::{path_to_slash_string, stable_id, ArtistRef, ReplayGain, Track};
use metadata::read_tags;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::covers::CoverManager;
use crate::identity::IdentityResolver;
use crate::store::{Store, StoreError, PATHS_TABLE, TRACKS_TABLE};

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "opus", "m4a", "aac", "wav"];

/// Process-wide scan state. Created once, reset when a scan begins, read
/// by status queries. The `scanning` flag is the single mutual-exclusion
/// point: `try_begin` wins for exactly one caller at a time.
#[derive(Default)]
pub struct ScanProgress {
    scanning: AtomicBool,
    files_processed: AtomicUsize,
    files_new: AtomicUsize,
    total_files: AtomicUsize,
    last_scan_time: RwLock<Option<u64>>,
}

impl ScanProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the scan slot. Returns false when a scan is already running,
    /// in which case the caller reports current status and does nothing.
    pub fn try_begin(&self) -> bool {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.files_processed.store(0, Ordering::SeqCst);
        self.files_new.store(0, Ordering::SeqCst);
        self.total_files.store(0, Ordering::SeqCst);
        true
    }

    pub fn finish(&self) {
        *self.last_scan_time.write() = Some(now_secs());
        self.scanning.store(false, Ordering::SeqCst);
    }

    pub fn add_total(&self, count: usize) {
        self.total_files.fetch_add(count, Ordering::SeqCst);
    }

    pub fn file_processed(&self, new: bool) {
        self.files_processed.fetch_add(1, Ordering::SeqCst);
        if new {
            self.files_new.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn snapshot(&self) -> ScanStatus {
        ScanStatus {
            scanning: self.scanning.load(Ordering::SeqCst),
            files_processed: self.files_processed.load(Ordering::SeqCst),
            files_new: self.files_new.load(Ordering::SeqCst),
            total_files: self.total_files.load(Ordering::SeqCst),
            last_scan_time: *self.last_scan_time.read(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ScanStatus {
    pub scanning: bool,
    pub files_processed: usize,
    pub files_new: usize,
    pub total_files: usize,
    pub last_scan_time: Option<u64>,
}

/// The complete set of paths seen by one finished scan, handed to the
/// consistency sweeper.
pub struct ScanOutcome {
    pub seen_paths: HashSet<String>,
    pub files_processed: usize,
    pub files_new: usize,
}

/// Walks every root twice: a counting pass for progress totals, then the
/// processing pass. Unchanged files (by mtime fingerprint) are never
/// re-parsed or re-written.
pub fn scan_roots(
    store: &Store,
    data_dir: &Path,
    separators: &[char],
    roots: &[PathBuf],
    progress: &ScanProgress,
) -> Result<ScanOutcome, StoreError> {
    let mut resolver = IdentityResolver::new(store, separators);
    let covers = CoverManager::new(store, data_dir);
    let mut seen_paths = HashSet::new();
    let mut files_new = 0usize;
    let mut files_processed = 0usize;

    for root in roots {
        let files = audio_files(root);
        progress.add_total(files.len());
        info!("Scanning {:?}: {} audio files", root, files.len());

        for file in files {
            match process_file(store, &mut resolver, &covers, &file, &mut seen_paths) {
                Ok(new) => {
                    files_processed += 1;
                    if new {
                        files_new += 1;
                    }
                    progress.file_processed(new);
                }
                Err(err) => {
                    warn!("Failed to process {:?}: {}", file, err);
                    progress.file_processed(false);
                }
            }
        }
    }

    Ok(ScanOutcome {
        seen_paths,
        files_processed,
        files_new,
    })
}

fn process_file(
    store: &Store,
    resolver: &mut IdentityResolver<'_>,
    covers: &CoverManager<'_>,
    file: &Path,
    seen_paths: &mut HashSet<String>,
) -> Result<bool, StoreError> {
    let path_str = path_to_slash_string(file);
    let mtime = file_mtime_secs(file)?;
    seen_paths.insert(path_str.clone());

    let known_id: Option<String> = store.get(PATHS_TABLE, &path_str)?;
    let (track_id, is_new) = match known_id {
        Some(id) => (id, false),
        None => (stable_id(&path_str), true),
    };

    let existing: Option<Track> = store.get(TRACKS_TABLE, &track_id)?;
    if let Some(existing) = &existing {
        if existing.last_modified == mtime {
            return Ok(false);
        }
    }

    let tags = match read_tags(file) {
        Ok(tags) => tags,
        Err(err) => {
            // Malformed tags skip the file; an already-indexed track
            // survives untouched.
            warn!("Failed to read tags for {:?}: {}", file, err);
            return Ok(false);
        }
    };

    let title = tags
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| file_stem(file));
    let raw_artist = tags
        .artist
        .clone()
        .or_else(|| tags.album_artist.clone())
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| "Unknown Artist".to_string());
    let album_name = tags
        .album
        .clone()
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| "Unknown Album".to_string());

    let artists = resolver.resolve_artists(&raw_artist)?;
    let (display_artist, album_artists): (String, Vec<ArtistRef>) = match &tags.album_artist {
        Some(raw) if !raw.trim().is_empty() => {
            (raw.trim().to_string(), resolver.resolve_artists(raw)?)
        }
        _ => (raw_artist.clone(), artists.clone()),
    };

    let album = resolver.resolve_album(&album_name, &display_artist, &album_artists)?;

    let replay_gain = ReplayGain {
        track_gain: tags.replay_track_gain,
        track_peak: tags.replay_track_peak,
        album_gain: tags.replay_album_gain,
        album_peak: tags.replay_album_peak,
    };
    let file_size = std::fs::metadata(file)?.len();

    let track = Track {
        id: track_id.clone(),
        path: path_str.clone(),
        album_id: album.id.clone(),
        artists,
        title,
        album: album.name.clone(),
        track_no: tags.track_no,
        disc_no: tags.disc_no,
        year: tags.year,
        genres: tags.genres.clone(),
        duration_ms: tags.duration_ms.unwrap_or(0),
        bitrate: tags.bitrate,
        channels: tags.channels,
        sample_rate: tags.sample_rate,
        bit_depth: tags.bit_depth,
        file_size,
        last_modified: mtime,
        lyrics: tags.lyrics.clone(),
        replay_gain: if replay_gain.is_empty() {
            None
        } else {
            Some(replay_gain)
        },
    };

    store.put(PATHS_TABLE, &path_str, &track_id)?;
    store.put(TRACKS_TABLE, &track_id, &track)?;
    resolver.attach_track(&album.id, &track, existing.as_ref())?;

    if !covers.has_usable_cover(&album.id) {
        covers.acquire(&album.id, &tags.pictures, file.parent(), None, false);
    }

    Ok(is_new)
}

pub fn count_audio_files(root: &Path) -> usize {
    audio_files(root).len()
}

fn audio_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if is_audio_file(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();
    files
}

fn is_audio_file(path: &Path) -> bool {
    match path.extension() {
        Some(ext) => {
            let ext = ext.to_string_lossy().to_ascii_lowercase();
            AUDIO_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown Track".to_string())
}

fn file_mtime_secs(path: &Path) -> Result<u64, StoreError> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs())
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ALBUMS_TABLE, ARTISTS_TABLE};
    use common::{Album, Artist};

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("test.redb")).expect("open store");
        (dir, store)
    }

    /// Minimal mono 16-bit PCM WAV, enough for lofty to read properties.
    fn wav_bytes() -> Vec<u8> {
        let samples: &[u8] = &[0, 0, 0, 0];
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + samples.len() as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&44100u32.to_le_bytes());
        out.extend_from_slice(&88200u32.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(samples.len() as u32).to_le_bytes());
        out.extend_from_slice(samples);
        out
    }

    #[test]
    fn scan_builds_track_album_artist_graph() {
        let (dir, store) = open_temp();
        let music = dir.path().join("music");
        std::fs::create_dir_all(&music).unwrap();
        std::fs::write(music.join("song.wav"), wav_bytes()).unwrap();

        let progress = ScanProgress::new();
        let outcome = scan_roots(
            &store,
            dir.path(),
            &[';'],
            &[music.clone()],
            &progress,
        )
        .unwrap();
        assert_eq!(outcome.files_new, 1);
        assert_eq!(outcome.seen_paths.len(), 1);
        assert_eq!(progress.snapshot().total_files, 1);

        let tracks: Vec<(String, Track)> = store.list(TRACKS_TABLE).unwrap();
        assert_eq!(tracks.len(), 1);
        let track = &tracks[0].1;
        assert_eq!(track.title, "song");
        assert_eq!(track.artists[0].name, "Unknown Artist");

        // Bidirectional references hold after the scan.
        let album: Album = store.get(ALBUMS_TABLE, &track.album_id).unwrap().unwrap();
        assert!(album.tracks.contains(&track.id));
        assert_eq!(album.track_count, 1);
        let artist: Artist = store
            .get(ARTISTS_TABLE, &track.artists[0].id)
            .unwrap()
            .unwrap();
        assert!(artist.albums.contains(&album.id));
    }

    #[test]
    fn unchanged_files_are_not_rewritten() {
        let (dir, store) = open_temp();
        let music = dir.path().join("music");
        std::fs::create_dir_all(&music).unwrap();
        std::fs::write(music.join("song.wav"), wav_bytes()).unwrap();

        let progress = ScanProgress::new();
        scan_roots(&store, dir.path(), &[';'], &[music.clone()], &progress).unwrap();

        // Mutate the stored record; an unchanged fingerprint must leave it
        // alone on the next scan.
        let (id, mut track): (String, Track) =
            store.list(TRACKS_TABLE).unwrap().into_iter().next().unwrap();
        track.title = "edited".to_string();
        store.put(TRACKS_TABLE, &id, &track).unwrap();

        let outcome =
            scan_roots(&store, dir.path(), &[';'], &[music], &progress).unwrap();
        assert_eq!(outcome.files_new, 0);
        let (_, track): (String, Track) =
            store.list(TRACKS_TABLE).unwrap().into_iter().next().unwrap();
        assert_eq!(track.title, "edited");
    }

    #[test]
    fn scan_slot_is_exclusive() {
        let progress = ScanProgress::new();
        assert!(progress.try_begin());
        assert!(!progress.try_begin());
        assert!(progress.snapshot().scanning);
        progress.finish();
        assert!(!progress.snapshot().scanning);
        assert!(progress.snapshot().last_scan_time.is_some());
        assert!(progress.try_begin());
        progress.finish();
    }

    #[test]
    fn audio_extension_filter() {
        assert!(is_audio_file(Path::new("a/b/song.MP3")));
        assert!(is_audio_file(Path::new("x.flac")));
        assert!(!is_audio_file(Path::new("cover.jpg")));
        assert!(!is_audio_file(Path::new("noext")));
    }
}
