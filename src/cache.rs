use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast::error::RecvError;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::Reservation;

/// One cache slot. `min_version` is the newest version announced for the
/// reservation; a snapshot below it is never stored.
#[derive(Debug, Default)]
struct Slot {
    snapshot: Option<Reservation>,
    min_version: u64,
}

/// Read-through cache of reservation snapshots, kept honest by the
/// engine's transition notices.
pub struct ReservationCache {
    engine: Arc<Engine>,
    entries: DashMap<Ulid, Slot>,
}

impl ReservationCache {
    /// Create the cache and spawn its invalidator. The task stops once the
    /// cache is dropped.
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        let rx = engine.notify.subscribe_all();
        let cache = Arc::new(Self {
            engine,
            entries: DashMap::new(),
        });
        tokio::spawn(run_invalidator(Arc::downgrade(&cache), rx));
        cache
    }

    pub async fn get(&self, id: Ulid) -> Result<Reservation, EngineError> {
        if let Some(hit) = self.entries.get(&id)
            && let Some(r) = &hit.snapshot
        {
            return Ok(r.clone());
        }
        let fresh = self.engine.get_reservation(id).await?;
        self.store(fresh.clone());
        Ok(fresh)
    }

    /// Cache `r` unless a newer version was already announced or cached.
    /// Returns whether the snapshot was kept.
    fn store(&self, r: Reservation) -> bool {
        match self.entries.entry(r.id) {
            Entry::Vacant(e) => {
                e.insert(Slot {
                    min_version: r.version,
                    snapshot: Some(r),
                });
                true
            }
            Entry::Occupied(mut e) => {
                let slot = e.get_mut();
                let cached = slot.snapshot.as_ref().map_or(0, |c| c.version);
                if r.version < slot.min_version || r.version <= cached {
                    return false;
                }
                slot.min_version = r.version;
                slot.snapshot = Some(r);
                true
            }
        }
    }

    /// Drop any snapshot of `id` older than `version`, and refuse to cache
    /// older ones from now on.
    pub fn invalidate(&self, id: &Ulid, version: u64) {
        let mut slot = self.entries.entry(*id).or_default();
        slot.min_version = slot.min_version.max(version);
        if slot.snapshot.as_ref().is_some_and(|r| r.version < slot.min_version) {
            slot.snapshot = None;
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of cached snapshots.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.snapshot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn run_invalidator(
    cache: Weak<ReservationCache>,
    mut rx: tokio::sync::broadcast::Receiver<crate::notify::TransitionNotice>,
) {
    loop {
        let msg = rx.recv().await;
        let Some(cache) = cache.upgrade() else { return };
        match msg {
            Ok(notice) => cache.invalidate(&notice.reservation_id, notice.version),
            Err(RecvError::Lagged(missed)) => {
                tracing::debug!("cache invalidator lagged by {missed} notices, clearing");
                cache.clear();
            }
            Err(RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Policy;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomwise_test_cache");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    const H: Ms = 3_600_000;

    async fn setup(name: &str) -> (Arc<Engine>, Ulid, Actor) {
        let engine = Arc::new(Engine::new(test_wal_path(name), Arc::new(NotifyHub::new()), Policy::default()).unwrap());
        let room = Room {
            id: Ulid::new(),
            floor: "1F".into(),
            name: "A".into(),
            active: true,
        };
        engine.upsert_room(room.clone()).await.unwrap();
        let owner = Actor::new(Ulid::new(), ActorRole::Member);
        let now = crate::engine::now_ms();
        let id = Ulid::new();
        engine
            .create_reservation(
                NewReservation {
                    id,
                    room_id: room.id,
                    span: Span::new(now + H, now + 2 * H),
                    timezone: None,
                    participants: vec![Participant {
                        id_number: "1".into(),
                        name: "Ana".into(),
                        course: Some("BSCS".into()),
                        year_level: Some("1".into()),
                        department: None,
                        role: ParticipantRole::Student,
                        is_main_reserver: true,
                    }],
                    purpose: None,
                },
                &owner,
                now,
            )
            .await
            .unwrap();
        (engine, id, owner)
    }

    #[tokio::test]
    async fn miss_loads_then_hits() {
        let (engine, id, _) = setup("miss_then_hit.wal").await;
        let cache = ReservationCache::new(engine);
        assert!(cache.is_empty());
        let r = cache.get(id).await.unwrap();
        assert_eq!(r.status, ReservationStatus::Pending);
        assert_eq!(cache.len(), 1);
        assert!(matches!(cache.get(Ulid::new()).await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn transition_notice_invalidates() {
        let (engine, id, owner) = setup("notice_invalidates.wal").await;
        let cache = ReservationCache::new(engine.clone());
        cache.get(id).await.unwrap();

        engine.cancel(id, &owner, crate::engine::now_ms()).await.unwrap();

        // The invalidator runs on its own task.
        let mut status = ReservationStatus::Pending;
        for _ in 0..50 {
            status = cache.get(id).await.unwrap().status;
            if status == ReservationStatus::Cancelled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, ReservationStatus::Cancelled);
    }

    #[tokio::test]
    async fn older_snapshot_after_newer_notice_is_not_cached() {
        let (engine, id, owner) = setup("older_after_notice.wal").await;
        let cache = ReservationCache::new(engine.clone());
        let before = engine.get_reservation(id).await.unwrap();

        let after = engine
            .cancel(id, &owner, crate::engine::now_ms())
            .await
            .unwrap()
            .reservation;
        cache.invalidate(&id, after.version);

        // A read that started before the cancel lands late.
        assert!(!cache.store(before));
        assert!(cache.is_empty());
        assert_eq!(cache.get(id).await.unwrap().status, ReservationStatus::Cancelled);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn newer_snapshot_replaces_older() {
        let (engine, id, owner) = setup("newer_replaces.wal").await;
        let cache = ReservationCache::new(engine.clone());
        let before = cache.get(id).await.unwrap();

        let after = engine
            .cancel(id, &owner, crate::engine::now_ms())
            .await
            .unwrap()
            .reservation;
        assert!(cache.store(after.clone()));
        assert!(!cache.store(before));
        assert_eq!(cache.get(id).await.unwrap(), after);
    }
}
