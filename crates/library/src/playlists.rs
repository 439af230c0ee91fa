use common::{Playlist, Track};
use uuid::Uuid;

use crate::store::{Store, StoreError, PLAYLISTS_TABLE, TRACKS_TABLE};

/// Playlist rows with their aggregates kept in step with the track list.
pub struct PlaylistStore<'a> {
    store: &'a Store,
}

impl<'a> PlaylistStore<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn list(&self) -> Result<Vec<Playlist>, StoreError> {
        Ok(self
            .store
            .list::<Playlist>(PLAYLISTS_TABLE)?
            .into_iter()
            .map(|(_, playlist)| playlist)
            .collect())
    }

    pub fn get(&self, playlist_id: &str) -> Result<Option<Playlist>, StoreError> {
        self.store.get(PLAYLISTS_TABLE, playlist_id)
    }

    pub fn create(
        &self,
        name: String,
        owner: String,
        track_ids: Vec<String>,
    ) -> Result<Playlist, StoreError> {
        let mut playlist = Playlist {
            id: Uuid::new_v4().to_string(),
            name,
            owner,
            track_ids,
            duration_ms: 0,
            track_count: 0,
            cover_art: None,
        };
        self.recompute_aggregates(&mut playlist)?;
        self.store.put(PLAYLISTS_TABLE, &playlist.id, &playlist)?;
        Ok(playlist)
    }

    pub fn set_tracks(
        &self,
        playlist_id: &str,
        track_ids: Vec<String>,
    ) -> Result<Option<Playlist>, StoreError> {
        let mut playlist = match self.get(playlist_id)? {
            Some(playlist) => playlist,
            None => return Ok(None),
        };
        playlist.track_ids = track_ids;
        self.recompute_aggregates(&mut playlist)?;
        self.store.put(PLAYLISTS_TABLE, playlist_id, &playlist)?;
        Ok(Some(playlist))
    }

    pub fn delete(&self, playlist_id: &str) -> Result<bool, StoreError> {
        self.store.delete(PLAYLISTS_TABLE, playlist_id)
    }

    fn recompute_aggregates(&self, playlist: &mut Playlist) -> Result<(), StoreError> {
        let mut duration = 0u64;
        for track_id in &playlist.track_ids {
            if let Some(track) = self.store.get::<Track>(TRACKS_TABLE, track_id)? {
                duration = duration.saturating_add(u64::from(track.duration_ms));
            }
        }
        playlist.duration_ms = duration;
        playlist.track_count = playlist.track_ids.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("test.redb")).expect("open store");
        (dir, store)
    }

    #[test]
    fn create_and_update_recompute_aggregates() {
        let (_dir, store) = open_temp();
        let playlists = PlaylistStore::new(&store);

        let playlist = playlists
            .create("Mix".to_string(), "u1".to_string(), vec!["ghost".to_string()])
            .unwrap();
        // Unknown tracks contribute nothing to the duration.
        assert_eq!(playlist.track_count, 1);
        assert_eq!(playlist.duration_ms, 0);

        let updated = playlists
            .set_tracks(&playlist.id, Vec::new())
            .unwrap()
            .unwrap();
        assert_eq!(updated.track_count, 0);
        assert!(playlists.delete(&playlist.id).unwrap());
        assert!(playlists.get(&playlist.id).unwrap().is_none());
    }
}
