use common::{EntityRef, UserEntityData};

use crate::store::{composite_key, Store, StoreError, USER_DATA_TABLE};

/// Per-user overlay rows keyed `(userId, entityKind, entityId)`, kept
/// out of the entity records so library data stays user-independent.
/// The user identifier is the opaque user ID everywhere.
pub struct UserDataStore<'a> {
    store: &'a Store,
}

impl<'a> UserDataStore<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    fn key(user_id: &str, entity: &EntityRef) -> String {
        composite_key(&[user_id, entity.kind.as_str(), &entity.id])
    }

    pub fn get(
        &self,
        user_id: &str,
        entity: &EntityRef,
    ) -> Result<Option<UserEntityData>, StoreError> {
        self.store.get(USER_DATA_TABLE, &Self::key(user_id, entity))
    }

    pub fn set(
        &self,
        user_id: &str,
        entity: &EntityRef,
        data: &UserEntityData,
    ) -> Result<(), StoreError> {
        let key = Self::key(user_id, entity);
        if data.is_empty() {
            self.store.delete(USER_DATA_TABLE, &key)?;
            Ok(())
        } else {
            self.store.put(USER_DATA_TABLE, &key, data)
        }
    }

    pub fn star(&self, user_id: &str, entity: &EntityRef, timestamp: u64) -> Result<(), StoreError> {
        let mut data = self.get(user_id, entity)?.unwrap_or_default();
        data.starred = Some(timestamp);
        data.unstarred = None;
        self.set(user_id, entity, &data)
    }

    pub fn unstar(
        &self,
        user_id: &str,
        entity: &EntityRef,
        timestamp: u64,
    ) -> Result<(), StoreError> {
        let mut data = self.get(user_id, entity)?.unwrap_or_default();
        data.unstarred = Some(timestamp);
        self.set(user_id, entity, &data)
    }

    pub fn record_play(
        &self,
        user_id: &str,
        entity: &EntityRef,
        timestamp: u64,
    ) -> Result<(), StoreError> {
        let mut data = self.get(user_id, entity)?.unwrap_or_default();
        data.play_count = data.play_count.saturating_add(1);
        data.last_played = Some(timestamp);
        self.set(user_id, entity, &data)
    }

    pub fn set_rating(
        &self,
        user_id: &str,
        entity: &EntityRef,
        rating: Option<u8>,
    ) -> Result<(), StoreError> {
        let mut data = self.get(user_id, entity)?.unwrap_or_default();
        data.rating = rating;
        self.set(user_id, entity, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::EntityKind;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("test.redb")).expect("open store");
        (dir, store)
    }

    fn track_ref(id: &str) -> EntityRef {
        EntityRef {
            kind: EntityKind::Track,
            id: id.to_string(),
        }
    }

    #[test]
    fn star_clears_unstar() {
        let (_dir, store) = open_temp();
        let user_data = UserDataStore::new(&store);
        let entity = track_ref("t1");

        user_data.star("u1", &entity, 100).unwrap();
        user_data.unstar("u1", &entity, 200).unwrap();
        let data = user_data.get("u1", &entity).unwrap().unwrap();
        assert!(!data.is_starred());

        user_data.star("u1", &entity, 300).unwrap();
        let data = user_data.get("u1", &entity).unwrap().unwrap();
        assert!(data.is_starred());
        assert_eq!(data.starred, Some(300));
        assert_eq!(data.unstarred, None);
    }

    #[test]
    fn play_counts_are_independent_per_entity_kind() {
        let (_dir, store) = open_temp();
        let user_data = UserDataStore::new(&store);
        let track = track_ref("x");
        let album = EntityRef {
            kind: EntityKind::Album,
            id: "x".to_string(),
        };

        user_data.record_play("u1", &track, 10).unwrap();
        user_data.record_play("u1", &track, 20).unwrap();
        user_data.record_play("u1", &album, 30).unwrap();

        let track_data = user_data.get("u1", &track).unwrap().unwrap();
        let album_data = user_data.get("u1", &album).unwrap().unwrap();
        assert_eq!(track_data.play_count, 2);
        assert_eq!(album_data.play_count, 1);
        assert_eq!(album_data.last_played, Some(30));
    }

    #[test]
    fn empty_rows_are_deleted() {
        let (_dir, store) = open_temp();
        let user_data = UserDataStore::new(&store);
        let entity = track_ref("t1");
        user_data.set_rating("u1", &entity, Some(5)).unwrap();
        assert!(user_data.get("u1", &entity).unwrap().is_some());
        user_data.set_rating("u1", &entity, None).unwrap();
        assert!(user_data.get("u1", &entity).unwrap().is_none());
    }
}
