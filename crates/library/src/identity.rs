use std::collections::HashMap;

use common::{stable_id, Album, Artist, ArtistRef, DiscTitle, Track};

use crate::store::{Store, StoreError, ALBUMS_TABLE, ARTISTS_TABLE};

/// Find-or-create resolution of artist and album identities.
///
/// Lookups are case-insensitive full scans of the store, memoized per
/// resolver instance so each distinct name is scanned at most once per
/// scan run.
pub struct IdentityResolver<'a> {
    store: &'a Store,
    separators: &'a [char],
    artist_cache: HashMap<String, ArtistRef>,
    album_cache: HashMap<String, String>,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(store: &'a Store, separators: &'a [char]) -> Self {
        Self {
            store,
            separators,
            artist_cache: HashMap::new(),
            album_cache: HashMap::new(),
        }
    }

    /// Splits a raw multi-artist tag string and resolves each name to an
    /// artist, creating missing ones. Order is preserved; duplicates
    /// (after normalization) collapse to the first occurrence.
    pub fn resolve_artists(&mut self, raw: &str) -> Result<Vec<ArtistRef>, StoreError> {
        let mut out: Vec<ArtistRef> = Vec::new();
        for name in split_artist_names(raw, self.separators) {
            let artist = self.find_or_create_artist(&name)?;
            if !out.iter().any(|existing| existing.id == artist.id) {
                out.push(artist);
            }
        }
        Ok(out)
    }

    fn find_or_create_artist(&mut self, name: &str) -> Result<ArtistRef, StoreError> {
        let needle = normalize_name(name);
        if let Some(cached) = self.artist_cache.get(&needle) {
            return Ok(cached.clone());
        }

        for (_, artist) in self.store.list::<Artist>(ARTISTS_TABLE)? {
            if normalize_name(&artist.name) == needle {
                let found = ArtistRef {
                    id: artist.id,
                    name: artist.name,
                };
                self.artist_cache.insert(needle, found.clone());
                return Ok(found);
            }
        }

        let id = stable_id(&format!("artist{}{}", crate::store::KEY_SEP, needle));
        let artist = Artist {
            id: id.clone(),
            name: name.trim().to_string(),
            albums: Vec::new(),
            album_count: 0,
            cover_art: id.clone(),
            mbid: None,
            external: Default::default(),
        };
        self.store.put(ARTISTS_TABLE, &id, &artist)?;
        let created = ArtistRef {
            id,
            name: artist.name,
        };
        self.artist_cache.insert(needle, created.clone());
        Ok(created)
    }

    /// Album matching needs both a name match and, when an artist set is
    /// supplied, at least one overlapping artist name. Two albums sharing
    /// a title across different artists stay separate.
    pub fn resolve_album(
        &mut self,
        name: &str,
        display_artist: &str,
        album_artists: &[ArtistRef],
    ) -> Result<Album, StoreError> {
        let needle = normalize_name(name);
        let cache_key = album_cache_key(&needle, album_artists);
        if let Some(album_id) = self.album_cache.get(&cache_key) {
            if let Some(album) = self.store.get::<Album>(ALBUMS_TABLE, album_id)? {
                return Ok(album);
            }
        }

        for (_, album) in self.store.list::<Album>(ALBUMS_TABLE)? {
            if normalize_name(&album.name) != needle {
                continue;
            }
            if !album_artists.is_empty() && !artists_overlap(&album.artists, album_artists) {
                continue;
            }
            self.album_cache.insert(cache_key, album.id.clone());
            return Ok(album);
        }

        let primary = album_artists.first().map(|a| a.id.as_str()).unwrap_or("");
        let id = stable_id(&format!(
            "album{sep}{needle}{sep}{primary}",
            sep = crate::store::KEY_SEP
        ));
        let album = Album {
            id: id.clone(),
            name: name.trim().to_string(),
            display_artist: display_artist.trim().to_string(),
            artists: album_artists.to_vec(),
            year: None,
            release_date: None,
            cover_art: id.clone(),
            tracks: Vec::new(),
            duration_ms: 0,
            track_count: 0,
            disc_titles: Vec::new(),
            genres: Vec::new(),
            external: Default::default(),
        };
        self.store.put(ALBUMS_TABLE, &id, &album)?;

        for artist_ref in album_artists {
            if let Some(mut artist) = self.store.get::<Artist>(ARTISTS_TABLE, &artist_ref.id)? {
                if !artist.albums.contains(&id) {
                    artist.albums.push(id.clone());
                    artist.album_count = artist.albums.len();
                    self.store.put(ARTISTS_TABLE, &artist.id, &artist)?;
                }
            }
        }

        self.album_cache.insert(cache_key, id);
        Ok(album)
    }

    /// Links a track into its album, updating aggregates incrementally.
    /// `previous` is the stored track before re-extraction, if any.
    pub fn attach_track(
        &mut self,
        album_id: &str,
        track: &Track,
        previous: Option<&Track>,
    ) -> Result<(), StoreError> {
        let mut album = match self.store.get::<Album>(ALBUMS_TABLE, album_id)? {
            Some(album) => album,
            None => return Ok(()),
        };

        let mut changed = false;
        if album.tracks.iter().any(|id| id == &track.id) {
            if let Some(previous) = previous {
                if previous.duration_ms != track.duration_ms {
                    album.duration_ms = album
                        .duration_ms
                        .saturating_sub(u64::from(previous.duration_ms))
                        .saturating_add(u64::from(track.duration_ms));
                    changed = true;
                }
            }
        } else {
            album.tracks.push(track.id.clone());
            album.track_count = album.tracks.len();
            album.duration_ms = album.duration_ms.saturating_add(u64::from(track.duration_ms));
            changed = true;
        }

        if album.year.is_none() && track.year.is_some() {
            album.year = track.year;
            changed = true;
        }
        if let Some(disc_no) = track.disc_no {
            if !album.disc_titles.iter().any(|d| d.disc_no == disc_no) {
                album.disc_titles.push(DiscTitle {
                    disc_no,
                    title: format!("Disc {}", disc_no),
                });
                album.disc_titles.sort_by_key(|d| d.disc_no);
                changed = true;
            }
        }
        let before = album.genres.len();
        merge_genres(&mut album.genres, &track.genres);
        if album.genres.len() != before {
            changed = true;
        }

        if changed {
            self.store.put(ALBUMS_TABLE, &album.id, &album)?;
        }
        Ok(())
    }
}

pub fn split_artist_names(raw: &str, separators: &[char]) -> Vec<String> {
    let mut out = Vec::new();
    for part in raw.split(separators) {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        out.push(trimmed.to_string());
    }
    if out.is_empty() {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
    }
    out
}

pub fn normalize_name(value: &str) -> String {
    value.trim().to_lowercase()
}

fn artists_overlap(left: &[ArtistRef], right: &[ArtistRef]) -> bool {
    left.iter().any(|a| {
        right
            .iter()
            .any(|b| normalize_name(&a.name) == normalize_name(&b.name))
    })
}

fn album_cache_key(normalized_name: &str, artists: &[ArtistRef]) -> String {
    let mut out = String::from(normalized_name);
    for artist in artists {
        out.push(crate::store::KEY_SEP);
        out.push_str(&artist.id);
    }
    out
}

/// Dedups by normalized key while keeping first-seen labels and order.
pub fn merge_genres(target: &mut Vec<String>, incoming: &[String]) {
    if incoming.is_empty() {
        return;
    }
    let mut seen: std::collections::HashSet<String> =
        target.iter().map(|genre| normalize_name(genre)).collect();
    for genre in incoming {
        let trimmed = genre.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(normalize_name(trimmed)) {
            target.push(trimmed.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("test.redb")).expect("open store");
        (dir, store)
    }

    const SEPS: &[char] = &[';', '/'];

    #[test]
    fn splits_in_order_and_trims() {
        assert_eq!(
            split_artist_names("Artist A; Artist B", SEPS),
            vec!["Artist A", "Artist B"]
        );
        assert_eq!(split_artist_names("  Solo  ", SEPS), vec!["Solo"]);
        assert!(split_artist_names(" ; ", SEPS).is_empty());
    }

    #[test]
    fn resolve_reuses_artists_across_casing() {
        let (_dir, store) = open_temp();
        let mut resolver = IdentityResolver::new(&store, SEPS);

        let first = resolver.resolve_artists("Artist A; Artist B").unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].name, "Artist A");

        let mut resolver = IdentityResolver::new(&store, SEPS);
        let second = resolver.resolve_artists("artist a ;artist b").unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[1].id, first[1].id);
        assert_eq!(store.count(ARTISTS_TABLE).unwrap(), 2);
    }

    #[test]
    fn same_title_different_artists_stay_separate() {
        let (_dir, store) = open_temp();
        let mut resolver = IdentityResolver::new(&store, SEPS);

        let a = resolver.resolve_artists("Artist A").unwrap();
        let b = resolver.resolve_artists("Artist B").unwrap();

        let first = resolver.resolve_album("Greatest Hits", "Artist A", &a).unwrap();
        let second = resolver.resolve_album("Greatest Hits", "Artist B", &b).unwrap();
        assert_ne!(first.id, second.id);

        // Same artist with different tag casing reuses the album row.
        let again = resolver
            .resolve_album("greatest hits ", "Artist A", &a)
            .unwrap();
        assert_eq!(again.id, first.id);
    }

    #[test]
    fn album_creation_links_back_to_artists() {
        let (_dir, store) = open_temp();
        let mut resolver = IdentityResolver::new(&store, SEPS);
        let artists = resolver.resolve_artists("Artist A").unwrap();
        let album = resolver.resolve_album("Debut", "Artist A", &artists).unwrap();

        let artist: common::Artist = store
            .get(ARTISTS_TABLE, &artists[0].id)
            .unwrap()
            .expect("artist row");
        assert_eq!(artist.albums, vec![album.id.clone()]);
        assert_eq!(artist.album_count, 1);
    }

    #[test]
    fn merge_genres_dedups_case_insensitively() {
        let mut genres = vec!["Rock".to_string()];
        merge_genres(
            &mut genres,
            &["rock".to_string(), "Indie".to_string(), " ".to_string()],
        );
        assert_eq!(genres, vec!["Rock", "Indie"]);
    }
}
