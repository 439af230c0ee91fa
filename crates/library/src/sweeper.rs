use std::collections::{HashMap, HashSet};
use std::path::Path;

use common::{Album, Artist, CoverArt, EntityKind, Playlist, Share, Track};
use tracing::{info, warn};

use crate::store::{
    split_key, Store, StoreError, ALBUMS_TABLE, ARTISTS_TABLE, COVERS_TABLE, PATHS_TABLE,
    PLAYLISTS_TABLE, SHARES_TABLE, TRACKS_TABLE, USER_DATA_TABLE,
};

#[derive(Clone, Copy, Debug, Default)]
pub struct CleanupReport {
    pub tracks_removed: usize,
    pub albums_removed: usize,
    pub artists_removed: usize,
    pub covers_removed: usize,
    pub shares_removed: usize,
    pub user_rows_removed: usize,
    pub playlist_entries_removed: usize,
}

/// Multi-pass garbage collection over the whole store. Runs after a scan;
/// `seen_paths` must reflect one complete, just-finished scan. Each pass
/// depends on the survivor sets of the previous one.
pub fn cleanup(
    store: &Store,
    data_dir: &Path,
    seen_paths: &HashSet<String>,
) -> Result<CleanupReport, StoreError> {
    let mut report = CleanupReport::default();

    // Pass 1: tracks whose backing file disappeared.
    for (id, track) in store.list::<Track>(TRACKS_TABLE)? {
        if !seen_paths.contains(&track.path) {
            store.delete(TRACKS_TABLE, &id)?;
            store.delete(PATHS_TABLE, &track.path)?;
            report.tracks_removed += 1;
        }
    }
    // Corrupt track records are orphans too.
    for key in store.list_corrupt_keys::<Track>(TRACKS_TABLE)? {
        store.delete(TRACKS_TABLE, &key)?;
        report.tracks_removed += 1;
    }

    // Pass 2: tracks desynced from the path index; collect survivors.
    let mut surviving_tracks: HashSet<String> = HashSet::new();
    let mut track_album: HashMap<String, String> = HashMap::new();
    let mut track_duration: HashMap<String, u32> = HashMap::new();
    let mut track_artists: HashSet<String> = HashSet::new();
    let mut referenced_albums: HashSet<String> = HashSet::new();
    for (id, track) in store.list::<Track>(TRACKS_TABLE)? {
        let indexed: Option<String> = store.get(PATHS_TABLE, &track.path)?;
        if indexed.as_deref() != Some(id.as_str()) {
            warn!("Dropping track {} with missing path index entry", id);
            store.delete(TRACKS_TABLE, &id)?;
            report.tracks_removed += 1;
            continue;
        }
        surviving_tracks.insert(id.clone());
        track_album.insert(id.clone(), track.album_id.clone());
        track_duration.insert(id, track.duration_ms);
        referenced_albums.insert(track.album_id);
        for artist in &track.artists {
            track_artists.insert(artist.id.clone());
        }
    }

    // Pass 3: unreferenced albums go; survivors get their track lists
    // filtered and aggregates recomputed.
    let mut surviving_albums: HashSet<String> = HashSet::new();
    let mut album_artists: HashSet<String> = HashSet::new();
    for (id, mut album) in store.list::<Album>(ALBUMS_TABLE)? {
        if !referenced_albums.contains(&id) {
            store.delete(ALBUMS_TABLE, &id)?;
            report.albums_removed += 1;
            continue;
        }
        let before = album.tracks.len();
        album
            .tracks
            .retain(|track_id| track_album.get(track_id).map(String::as_str) == Some(id.as_str()));
        if album.tracks.len() != before {
            album.track_count = album.tracks.len();
            album.duration_ms = album
                .tracks
                .iter()
                .map(|track_id| u64::from(*track_duration.get(track_id).unwrap_or(&0)))
                .sum();
            store.put(ALBUMS_TABLE, &id, &album)?;
        }
        surviving_albums.insert(id);
        for artist in &album.artists {
            album_artists.insert(artist.id.clone());
        }
    }

    // Pass 4: artists with no surviving track or album reference.
    let mut surviving_artists: HashSet<String> = HashSet::new();
    for (id, mut artist) in store.list::<Artist>(ARTISTS_TABLE)? {
        if !track_artists.contains(&id) && !album_artists.contains(&id) {
            store.delete(ARTISTS_TABLE, &id)?;
            report.artists_removed += 1;
            continue;
        }
        let before = artist.albums.len();
        artist
            .albums
            .retain(|album_id| surviving_albums.contains(album_id));
        if artist.albums.len() != before {
            artist.album_count = artist.albums.len();
            store.put(ARTISTS_TABLE, &id, &artist)?;
        }
        surviving_artists.insert(id);
    }

    // Pass 5: covers, shares, per-user rows, playlist entries.
    let playlists = store.list::<Playlist>(PLAYLISTS_TABLE)?;
    let playlist_ids: HashSet<&str> = playlists.iter().map(|(id, _)| id.as_str()).collect();

    let mut surviving_covers: HashSet<String> = HashSet::new();
    for (id, cover) in store.list::<CoverArt>(COVERS_TABLE)? {
        let alive = surviving_albums.contains(&id)
            || surviving_artists.contains(&id)
            || playlist_ids.contains(id.as_str());
        if alive {
            surviving_covers.insert(id);
            continue;
        }
        let _ = std::fs::remove_file(common::join_relpath(data_dir, &cover.relpath));
        store.delete(COVERS_TABLE, &id)?;
        report.covers_removed += 1;
    }

    for (id, share) in store.list::<Share>(SHARES_TABLE)? {
        let entity_alive = match share.entity.kind {
            EntityKind::Track => surviving_tracks.contains(&share.entity.id),
            EntityKind::Album => surviving_albums.contains(&share.entity.id),
            EntityKind::Artist => surviving_artists.contains(&share.entity.id),
        };
        let cover_alive = match &share.cover_art {
            Some(cover_id) => surviving_covers.contains(cover_id),
            None => true,
        };
        if !entity_alive || !cover_alive {
            store.delete(SHARES_TABLE, &id)?;
            report.shares_removed += 1;
        }
    }

    for (key, _) in store.list::<common::UserEntityData>(USER_DATA_TABLE)? {
        let parts = split_key(&key);
        let alive = match parts.as_slice() {
            [_, "track", entity_id] => surviving_tracks.contains(*entity_id),
            [_, "album", entity_id] => surviving_albums.contains(*entity_id),
            [_, "artist", entity_id] => surviving_artists.contains(*entity_id),
            _ => false,
        };
        if !alive {
            store.delete(USER_DATA_TABLE, &key)?;
            report.user_rows_removed += 1;
        }
    }

    for (id, mut playlist) in playlists {
        let before = playlist.track_ids.len();
        playlist
            .track_ids
            .retain(|track_id| surviving_tracks.contains(track_id));
        if playlist.track_ids.len() != before {
            report.playlist_entries_removed += before - playlist.track_ids.len();
            playlist.track_count = playlist.track_ids.len();
            playlist.duration_ms = playlist
                .track_ids
                .iter()
                .map(|track_id| u64::from(*track_duration.get(track_id).unwrap_or(&0)))
                .sum();
            store.put(PLAYLISTS_TABLE, &id, &playlist)?;
        }
    }

    info!(
        "Cleanup: removed {} tracks, {} albums, {} artists, {} covers, {} shares, {} user rows, {} playlist entries",
        report.tracks_removed,
        report.albums_removed,
        report.artists_removed,
        report.covers_removed,
        report.shares_removed,
        report.user_rows_removed,
        report.playlist_entries_removed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{stable_id, ArtistRef, EntityRef, UserEntityData};
    use std::collections::HashSet;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("test.redb")).expect("open store");
        (dir, store)
    }

    fn seed_track(store: &Store, path: &str, album_id: &str, artist_id: &str) -> String {
        let id = stable_id(path);
        let track = Track {
            id: id.clone(),
            path: path.to_string(),
            album_id: album_id.to_string(),
            artists: vec![ArtistRef {
                id: artist_id.to_string(),
                name: "Artist".to_string(),
            }],
            title: "Song".to_string(),
            album: "Album".to_string(),
            track_no: Some(1),
            disc_no: None,
            year: None,
            genres: Vec::new(),
            duration_ms: 1000,
            bitrate: None,
            channels: None,
            sample_rate: None,
            bit_depth: None,
            file_size: 10,
            last_modified: 1,
            lyrics: None,
            replay_gain: None,
        };
        store.put(TRACKS_TABLE, &id, &track).unwrap();
        store.put(PATHS_TABLE, path, &id).unwrap();
        id
    }

    fn seed_album(store: &Store, id: &str, artist_id: &str, tracks: Vec<String>) {
        let album = Album {
            id: id.to_string(),
            name: "Album".to_string(),
            display_artist: "Artist".to_string(),
            artists: vec![ArtistRef {
                id: artist_id.to_string(),
                name: "Artist".to_string(),
            }],
            year: None,
            release_date: None,
            cover_art: id.to_string(),
            track_count: tracks.len(),
            duration_ms: 1000 * tracks.len() as u64,
            tracks,
            disc_titles: Vec::new(),
            genres: Vec::new(),
            external: Default::default(),
        };
        store.put(ALBUMS_TABLE, id, &album).unwrap();
    }

    fn seed_artist(store: &Store, id: &str, albums: Vec<String>) {
        let artist = Artist {
            id: id.to_string(),
            name: "Artist".to_string(),
            album_count: albums.len(),
            albums,
            cover_art: id.to_string(),
            mbid: None,
            external: Default::default(),
        };
        store.put(ARTISTS_TABLE, id, &artist).unwrap();
    }

    #[test]
    fn removing_last_track_cascades_to_album_artist_cover() {
        let (dir, store) = open_temp();
        let track_id = seed_track(&store, "/music/a/1.mp3", "alb1", "art1");
        seed_album(&store, "alb1", "art1", vec![track_id.clone()]);
        seed_artist(&store, "art1", vec!["alb1".to_string()]);
        let cover = CoverArt {
            id: "alb1".to_string(),
            relpath: "covers/alb1.jpg".to_string(),
            mime: "image/jpeg".to_string(),
            source: common::CoverSource::Local,
            width: 10,
            height: 10,
            file_size: 1,
        };
        store.put(COVERS_TABLE, "alb1", &cover).unwrap();
        let share = Share {
            id: "s1".to_string(),
            entity: EntityRef {
                kind: EntityKind::Album,
                id: "alb1".to_string(),
            },
            cover_art: Some("alb1".to_string()),
            created: 1,
        };
        store.put(SHARES_TABLE, "s1", &share).unwrap();
        let user_key = crate::store::composite_key(&["u1", "track", track_id.as_str()]);
        store
            .put(USER_DATA_TABLE, &user_key, &UserEntityData::default())
            .unwrap();

        // No file survives the scan.
        let report = cleanup(&store, dir.path(), &HashSet::new()).unwrap();
        assert_eq!(report.tracks_removed, 1);
        assert_eq!(report.albums_removed, 1);
        assert_eq!(report.artists_removed, 1);
        assert_eq!(report.covers_removed, 1);
        assert_eq!(report.shares_removed, 1);
        assert_eq!(report.user_rows_removed, 1);
        assert_eq!(store.count(TRACKS_TABLE).unwrap(), 0);
        assert_eq!(store.count(ALBUMS_TABLE).unwrap(), 0);
        assert_eq!(store.count(ARTISTS_TABLE).unwrap(), 0);
    }

    #[test]
    fn surviving_album_filters_dead_track_entries() {
        let (dir, store) = open_temp();
        let keep = seed_track(&store, "/music/a/1.mp3", "alb1", "art1");
        let gone = seed_track(&store, "/music/a/2.mp3", "alb1", "art1");
        seed_album(&store, "alb1", "art1", vec![keep.clone(), gone.clone()]);
        seed_artist(&store, "art1", vec!["alb1".to_string()]);

        let mut seen = HashSet::new();
        seen.insert("/music/a/1.mp3".to_string());
        let report = cleanup(&store, dir.path(), &seen).unwrap();
        assert_eq!(report.tracks_removed, 1);
        assert_eq!(report.albums_removed, 0);

        let album: Album = store.get(ALBUMS_TABLE, "alb1").unwrap().unwrap();
        assert_eq!(album.tracks, vec![keep]);
        assert_eq!(album.track_count, 1);
        assert_eq!(album.duration_ms, 1000);
    }

    #[test]
    fn desynced_path_index_drops_track() {
        let (dir, store) = open_temp();
        let track_id = seed_track(&store, "/music/a/1.mp3", "alb1", "art1");
        seed_album(&store, "alb1", "art1", vec![track_id.clone()]);
        seed_artist(&store, "art1", vec!["alb1".to_string()]);
        store.delete(PATHS_TABLE, "/music/a/1.mp3").unwrap();

        let mut seen = HashSet::new();
        seen.insert("/music/a/1.mp3".to_string());
        let report = cleanup(&store, dir.path(), &seen).unwrap();
        assert_eq!(report.tracks_removed, 1);
        assert_eq!(report.albums_removed, 1);
    }

    #[test]
    fn playlists_prune_missing_tracks_but_survive() {
        let (dir, store) = open_temp();
        let keep = seed_track(&store, "/music/a/1.mp3", "alb1", "art1");
        seed_album(&store, "alb1", "art1", vec![keep.clone()]);
        seed_artist(&store, "art1", vec!["alb1".to_string()]);
        let playlist = Playlist {
            id: "pl1".to_string(),
            name: "Mix".to_string(),
            owner: "u1".to_string(),
            track_ids: vec![keep.clone(), "missing".to_string()],
            duration_ms: 2000,
            track_count: 2,
            cover_art: None,
        };
        store.put(PLAYLISTS_TABLE, "pl1", &playlist).unwrap();

        let mut seen = HashSet::new();
        seen.insert("/music/a/1.mp3".to_string());
        let report = cleanup(&store, dir.path(), &seen).unwrap();
        assert_eq!(report.playlist_entries_removed, 1);

        let playlist: Playlist = store.get(PLAYLISTS_TABLE, "pl1").unwrap().unwrap();
        assert_eq!(playlist.track_ids, vec![keep]);
        assert_eq!(playlist.track_count, 1);
        assert_eq!(playlist.duration_ms, 1000);
    }
}
