use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{ActorRole, ExtensionStatus, Ms, ReservationStatus};

const CHANNEL_CAPACITY: usize = 256;

/// What listeners hear about every committed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionNotice {
    pub reservation_id: Ulid,
    pub room_id: Ulid,
    pub operation: &'static str,
    /// None for creation.
    pub old_status: Option<ReservationStatus>,
    pub new_status: ReservationStatus,
    pub extension_status: ExtensionStatus,
    pub actor_role: ActorRole,
    pub version: u64,
    pub at: Ms,
}

impl TransitionNotice {
    /// JSON payload for NOTIFY.
    pub fn payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Broadcast hub: one channel per room plus one tenant-wide channel.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<TransitionNotice>>,
    all: broadcast::Sender<TransitionNotice>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to notices for one room. Creates the channel if needed.
    pub fn subscribe_room(&self, room_id: Ulid) -> broadcast::Receiver<TransitionNotice> {
        let sender = self
            .channels
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to every notice of the tenant.
    pub fn subscribe_all(&self) -> broadcast::Receiver<TransitionNotice> {
        self.all.subscribe()
    }

    /// Send a notice. No-op for channels nobody listens on.
    pub fn send(&self, notice: &TransitionNotice) {
        if let Some(sender) = self.channels.get(&notice.room_id) {
            let _ = sender.send(notice.clone());
        }
        let _ = self.all.send(notice.clone());
    }
}
