use std::time::Duration;

use common::{EntityKind, EntityRef, Track, UserEntityData};
use library::Library;
use reqwest::Client;
use tracing::{info, warn};

use crate::config::UserSyncConfig;
use crate::external::lastfm::{self, LastFmCreds};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncCounters {
    pub loved_pushed: usize,
    pub unloved_pushed: usize,
    pub stars_pulled: usize,
    pub date_updates: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// What the three-way merge decided for one track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncAction {
    PushLove,
    PushUnlove,
    /// Pull the remote timestamp into `starred`, clearing `unstarred`.
    PullStar(u64),
    /// Already starred locally; only the timestamp moves forward.
    UpdateDate(u64),
    Skip,
}

/// Pure resolution of local star/unstar state against a remote love
/// timestamp. The newest signal wins.
pub fn resolve(local: &UserEntityData, remote_love: Option<u64>) -> SyncAction {
    let locally_starred = local.is_starred();
    match (locally_starred, remote_love) {
        (true, None) => SyncAction::PushLove,
        (true, Some(remote_ts)) => {
            let local_ts = local.starred.unwrap_or(0);
            if remote_ts > local_ts {
                SyncAction::UpdateDate(remote_ts)
            } else {
                SyncAction::Skip
            }
        }
        (false, Some(remote_ts)) => {
            // A local unstar newer than the remote love pushes an unlove;
            // otherwise the remote love wins and is pulled in.
            match local.unstarred {
                Some(unstarred_ts) if unstarred_ts > remote_ts => SyncAction::PushUnlove,
                _ => SyncAction::PullStar(remote_ts),
            }
        }
        (false, None) => SyncAction::Skip,
    }
}

/// One bidirectional sync run for a single user. Per-track failures are
/// counted, never propagated.
pub async fn sync_user(
    library: &Library,
    client: &Client,
    creds: &LastFmCreds,
    timeout: Duration,
    user: &UserSyncConfig,
) -> SyncCounters {
    let mut counters = SyncCounters::default();

    let mut remote =
        match lastfm::user_loved_tracks(client, creds, timeout, &user.lastfm_user).await {
            Ok(remote) => remote,
            Err(err) => {
                warn!(
                    "Loved-tracks fetch failed for {}: {}",
                    user.lastfm_user, err
                );
                counters.errors += 1;
                return counters;
            }
        };

    let tracks = match library.list_tracks() {
        Ok(tracks) => tracks,
        Err(err) => {
            warn!("Track listing failed during favorites sync: {}", err);
            counters.errors += 1;
            return counters;
        }
    };

    let can_push = !user.lastfm_session_key.trim().is_empty();
    if !can_push {
        info!(
            "No Last.fm session key for user {}; pushing loves is disabled",
            user.user_id
        );
    }

    let user_data = library.user_data();
    for track in &tracks {
        let remote_ts = remote.remove(&remote_key(track));
        let entity = EntityRef {
            kind: EntityKind::Track,
            id: track.id.clone(),
        };
        let local = match user_data.get(&user.user_id, &entity) {
            Ok(local) => local.unwrap_or_default(),
            Err(err) => {
                warn!("User data read failed for {}: {}", track.id, err);
                counters.errors += 1;
                continue;
            }
        };
        if local.is_empty() && remote_ts.is_none() {
            continue;
        }

        match resolve(&local, remote_ts) {
            SyncAction::PushLove => {
                if !can_push {
                    counters.skipped += 1;
                    continue;
                }
                match push_love(client, creds, timeout, user, track, true).await {
                    Ok(()) => counters.loved_pushed += 1,
                    Err(err) => {
                        warn!("Love push failed for '{}': {}", track.title, err);
                        counters.errors += 1;
                    }
                }
            }
            SyncAction::PushUnlove => {
                if !can_push {
                    counters.skipped += 1;
                    continue;
                }
                match push_love(client, creds, timeout, user, track, false).await {
                    Ok(()) => counters.unloved_pushed += 1,
                    Err(err) => {
                        warn!("Unlove push failed for '{}': {}", track.title, err);
                        counters.errors += 1;
                    }
                }
            }
            SyncAction::PullStar(remote_ts) => {
                match user_data.star(&user.user_id, &entity, remote_ts) {
                    Ok(()) => counters.stars_pulled += 1,
                    Err(err) => {
                        warn!("Star pull failed for '{}': {}", track.title, err);
                        counters.errors += 1;
                    }
                }
            }
            SyncAction::UpdateDate(remote_ts) => {
                match user_data.star(&user.user_id, &entity, remote_ts) {
                    Ok(()) => counters.date_updates += 1,
                    Err(err) => {
                        warn!("Star update failed for '{}': {}", track.title, err);
                        counters.errors += 1;
                    }
                }
            }
            SyncAction::Skip => counters.skipped += 1,
        }
    }

    // Remote loves with no matching local track are left alone.
    counters.skipped += remote.len();

    info!(
        "Favorites sync for {}: {} loves pushed, {} unloves pushed, {} stars pulled, {} date updates, {} skipped, {} errors",
        user.user_id,
        counters.loved_pushed,
        counters.unloved_pushed,
        counters.stars_pulled,
        counters.date_updates,
        counters.skipped,
        counters.errors
    );
    counters
}

fn remote_key(track: &Track) -> (String, String) {
    let artist = track
        .artists
        .first()
        .map(|artist| artist.name.trim().to_lowercase())
        .unwrap_or_default();
    (artist, track.title.trim().to_lowercase())
}

async fn push_love(
    client: &Client,
    creds: &LastFmCreds,
    timeout: Duration,
    user: &UserSyncConfig,
    track: &Track,
    love: bool,
) -> Result<(), crate::external::ProviderError> {
    let artist = track
        .artists
        .first()
        .map(|artist| artist.name.as_str())
        .unwrap_or("");
    lastfm::set_track_love_status(
        client,
        creds,
        timeout,
        &user.lastfm_session_key,
        artist,
        &track.title,
        love,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(starred: Option<u64>, unstarred: Option<u64>) -> UserEntityData {
        UserEntityData {
            starred,
            unstarred,
            ..Default::default()
        }
    }

    #[test]
    fn local_star_without_remote_pushes_love() {
        assert_eq!(resolve(&local(Some(100), None), None), SyncAction::PushLove);
    }

    #[test]
    fn newer_remote_love_updates_local_date() {
        assert_eq!(
            resolve(&local(Some(100), None), Some(200)),
            SyncAction::UpdateDate(200)
        );
    }

    #[test]
    fn older_or_equal_remote_love_is_a_noop() {
        assert_eq!(resolve(&local(Some(200), None), Some(200)), SyncAction::Skip);
        assert_eq!(resolve(&local(Some(300), None), Some(200)), SyncAction::Skip);
    }

    #[test]
    fn unstar_after_remote_love_pushes_unlove() {
        assert_eq!(
            resolve(&local(Some(100), Some(250)), Some(200)),
            SyncAction::PushUnlove
        );
    }

    #[test]
    fn remote_love_after_unstar_pulls_star() {
        assert_eq!(
            resolve(&local(Some(100), Some(150)), Some(200)),
            SyncAction::PullStar(200)
        );
        assert_eq!(resolve(&local(None, None), Some(50)), SyncAction::PullStar(50));
    }

    #[test]
    fn no_state_is_skipped() {
        assert_eq!(resolve(&local(None, None), None), SyncAction::Skip);
        assert_eq!(resolve(&local(None, Some(10)), None), SyncAction::Skip);
    }
}
