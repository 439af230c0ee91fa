pub mod covers;
pub mod identity;
pub mod playlists;
pub mod scanner;
pub mod store;
pub mod sweeper;
pub mod user_data;

use std::path::{Path, PathBuf};

use common::{Album, AlbumExternalInfo, Artist, ArtistExternalInfo, Track};
use serde::{Deserialize, Serialize};
use tracing::info;

use covers::CoverManager;
use identity::merge_genres;
use scanner::{ScanOutcome, ScanProgress};
use store::{
    Store, StoreError, ALBUMS_TABLE, ARTISTS_TABLE, COVERS_TABLE, PATHS_TABLE, SHARES_TABLE,
    TRACKS_TABLE,
};
use sweeper::CleanupReport;
use user_data::UserDataStore;

/// Handle over the library store and its maintenance components.
#[derive(Clone)]
pub struct Library {
    store: Store,
    data_dir: PathBuf,
    separators: Vec<char>,
}

impl Library {
    pub fn open(
        db_path: &Path,
        data_dir: PathBuf,
        separators: Vec<char>,
    ) -> Result<Self, StoreError> {
        let store = Store::open(db_path)?;
        Ok(Self {
            store,
            data_dir,
            separators,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn covers(&self) -> CoverManager<'_> {
        CoverManager::new(&self.store, &self.data_dir)
    }

    pub fn user_data(&self) -> UserDataStore<'_> {
        UserDataStore::new(&self.store)
    }

    pub fn playlists(&self) -> playlists::PlaylistStore<'_> {
        playlists::PlaylistStore::new(&self.store)
    }

    /// One full pass over the configured roots. Blocking; run it on a
    /// blocking thread from async contexts.
    pub fn scan(
        &self,
        roots: &[PathBuf],
        progress: &ScanProgress,
    ) -> Result<ScanOutcome, StoreError> {
        scanner::scan_roots(
            &self.store,
            &self.data_dir,
            &self.separators,
            roots,
            progress,
        )
    }

    pub fn cleanup(&self, outcome: &ScanOutcome) -> Result<CleanupReport, StoreError> {
        sweeper::cleanup(&self.store, &self.data_dir, &outcome.seen_paths)
    }

    /// Clears every derived entity for a scan from scratch. Per-user
    /// overlay rows and playlists stay; the next sweep reconciles them
    /// against the rebuilt entity graph.
    pub fn reset(&self) -> Result<(), StoreError> {
        info!("Hard reset: clearing derived library entities");
        self.store.clear(TRACKS_TABLE)?;
        self.store.clear(ALBUMS_TABLE)?;
        self.store.clear(ARTISTS_TABLE)?;
        self.store.clear(COVERS_TABLE)?;
        self.store.clear(PATHS_TABLE)?;
        self.store.clear(SHARES_TABLE)?;
        Ok(())
    }

    pub fn get_track(&self, track_id: &str) -> Result<Option<Track>, StoreError> {
        self.store.get(TRACKS_TABLE, track_id)
    }

    pub fn get_album(&self, album_id: &str) -> Result<Option<Album>, StoreError> {
        self.store.get(ALBUMS_TABLE, album_id)
    }

    pub fn get_artist(&self, artist_id: &str) -> Result<Option<Artist>, StoreError> {
        self.store.get(ARTISTS_TABLE, artist_id)
    }

    pub fn list_tracks(&self) -> Result<Vec<Track>, StoreError> {
        Ok(self
            .store
            .list::<Track>(TRACKS_TABLE)?
            .into_iter()
            .map(|(_, track)| track)
            .collect())
    }

    pub fn list_albums(&self) -> Result<Vec<Album>, StoreError> {
        Ok(self
            .store
            .list::<Album>(ALBUMS_TABLE)?
            .into_iter()
            .map(|(_, album)| album)
            .collect())
    }

    pub fn list_artists(&self) -> Result<Vec<Artist>, StoreError> {
        Ok(self
            .store
            .list::<Artist>(ARTISTS_TABLE)?
            .into_iter()
            .map(|(_, artist)| artist)
            .collect())
    }

    pub fn stats(&self) -> Result<LibraryStats, StoreError> {
        Ok(LibraryStats {
            artists: self.store.count(ARTISTS_TABLE)?,
            albums: self.store.count(ALBUMS_TABLE)?,
            tracks: self.store.count(TRACKS_TABLE)?,
        })
    }

    /// Applies fetched album metadata. Provider fields only fill gaps;
    /// genres are unioned. The `fetched` flag is set either way so the
    /// sweep does not retry the same album every run.
    pub fn update_album_external(
        &self,
        album_id: &str,
        external: AlbumExternalInfo,
        release_date: Option<String>,
        genres: &[String],
    ) -> Result<bool, StoreError> {
        let mut album = match self.get_album(album_id)? {
            Some(album) => album,
            None => return Ok(false),
        };
        if album.external.notes.is_none() {
            album.external.notes = external.notes;
        }
        if album.external.lastfm_url.is_none() {
            album.external.lastfm_url = external.lastfm_url;
        }
        if album.external.mbid.is_none() {
            album.external.mbid = external.mbid;
        }
        if album.release_date.is_none() {
            album.release_date = release_date;
        }
        album.external.fetched = true;
        merge_genres(&mut album.genres, genres);
        self.store.put(ALBUMS_TABLE, album_id, &album)?;
        Ok(true)
    }

    pub fn update_artist_external(
        &self,
        artist_id: &str,
        external: ArtistExternalInfo,
        mbid: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut artist = match self.get_artist(artist_id)? {
            Some(artist) => artist,
            None => return Ok(false),
        };
        if artist.external.biography.is_none() {
            artist.external.biography = external.biography;
        }
        if artist.external.similar.is_empty() {
            artist.external.similar = external.similar;
        }
        if artist.external.image_url.is_none() {
            artist.external.image_url = external.image_url;
        }
        if artist.external.lastfm_url.is_none() {
            artist.external.lastfm_url = external.lastfm_url;
        }
        if artist.mbid.is_none() {
            artist.mbid = mbid;
        }
        artist.external.fetched = true;
        self.store.put(ARTISTS_TABLE, artist_id, &artist)?;
        Ok(true)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LibraryStats {
    pub artists: usize,
    pub albums: usize,
    pub tracks: usize,
}
