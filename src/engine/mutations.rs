use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::TransitionNotice;
use crate::observability;

use super::conflict::{check_no_overlap, compute_extension_ceiling, validate_span};
use super::lifecycle::{self, ExtensionDecision, Operation, TransitionContext};
use super::validate::{resolve_timezone, validate_participants, validate_purpose};
use super::{Engine, EngineError, WalCommand};

/// The committed result of a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub reservation: Reservation,
    /// None for creation.
    pub previous_status: Option<ReservationStatus>,
    /// The extension ceiling handed back to extension requests.
    pub conflict_time: Option<Ms>,
}

/// A reservation the sweeper should move, and the version it saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepCandidate {
    pub reservation_id: Ulid,
    pub version: u64,
    pub operation: Operation,
}

impl Engine {
    /// Create or update a room. Existing reservations keep their snapshots.
    pub async fn upsert_room(&self, room: Room) -> Result<Room, EngineError> {
        let floor = room.floor.trim().to_string();
        let name = room.name.trim().to_string();
        if floor.is_empty() || name.is_empty() {
            return Err(EngineError::Validation("room floor and name are required".into()));
        }
        if floor.len() > MAX_NAME_LEN || name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("room name too long"));
        }
        let room = Room { floor, name, ..room };

        let rs = match self.get_room_state(&room.id) {
            Some(rs) => rs,
            None => {
                if self.state.len() >= MAX_ROOMS_PER_TENANT {
                    return Err(EngineError::LimitExceeded("too many rooms"));
                }
                self.state
                    .entry(room.id)
                    .or_insert_with(|| Arc::new(RwLock::new(RoomState::new(room.clone()))))
                    .value()
                    .clone()
            }
        };

        let mut guard = rs.write().await;
        let event = Event::RoomUpserted { room: room.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(room)
    }

    /// Create a Pending reservation owned by `actor`.
    pub async fn create_reservation(
        &self,
        request: NewReservation,
        actor: &Actor,
        now: Ms,
    ) -> Result<TransitionOutcome, EngineError> {
        if actor.role == ActorRole::System {
            return Err(EngineError::Forbidden("the sweeper does not create reservations"));
        }
        validate_span(&request.span)?;
        if request.span.start < now {
            return Err(EngineError::Validation("start must not be in the past".into()));
        }
        let tz = resolve_timezone(request.timezone.as_deref(), self.policy.timezone)?;
        let purpose = validate_purpose(request.purpose)?;
        let mut participants = request.participants;
        validate_participants(&mut participants)?;

        let rs = self
            .get_room_state(&request.room_id)
            .ok_or(EngineError::NotFound(request.room_id))?;
        let mut guard = rs.write().await;

        if !guard.room.active {
            return Err(EngineError::RoomInactive(request.room_id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations on room"));
        }
        if self.reservation_to_room.contains_key(&request.id) {
            return Err(EngineError::AlreadyExists(request.id));
        }
        check_no_overlap(&guard, &request.span, None)?;

        let reservation = Reservation {
            id: request.id,
            room_id: guard.room.id,
            floor: guard.room.floor.clone(),
            room_name: guard.room.name.clone(),
            user_id: actor.user_id,
            span: request.span,
            extended_end: None,
            timezone: tz.name().to_string(),
            participants,
            purpose,
            status: ReservationStatus::Pending,
            extension_requested: false,
            extension_status: ExtensionStatus::None,
            extension_reason: None,
            max_extended_end: None,
            actual_start: None,
            actual_end: None,
            created_at: now,
            updated_at: now,
            version: 1,
            archived: false,
        };

        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        self.announce(&reservation, "create", None, actor.role);
        Ok(TransitionOutcome {
            reservation,
            previous_status: None,
            conflict_time: None,
        })
    }

    /// Run one lifecycle operation under the room's write lock.
    ///
    /// With `expected_version` set, the operation only applies to that exact
    /// version; a mismatch fails with `Conflict`.
    pub async fn apply_operation(
        &self,
        reservation_id: Ulid,
        op: Operation,
        actor: &Actor,
        expected_version: Option<u64>,
        now: Ms,
    ) -> Result<TransitionOutcome, EngineError> {
        let mut guard = self.resolve_reservation_write(&reservation_id).await?;

        let current = guard
            .get(&reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        if let Some(expected) = expected_version
            && expected != current.version
        {
            return Err(EngineError::Conflict {
                id: reservation_id,
                expected,
                actual: current.version,
            });
        }

        let previous_status = current.status;
        let mut next = current.clone();
        let ceiling = op
            .needs_ceiling()
            .then(|| compute_extension_ceiling(&guard, current, now, &self.policy));
        let ctx = TransitionContext {
            actor,
            now,
            policy: &self.policy,
            room_active: guard.room.active,
            ceiling,
        };
        let conflict_time = lifecycle::apply(&mut next, &op, &ctx)?;

        if next.effective_end() != current.effective_end() {
            // A stored ceiling can be stale once revalidation is off.
            check_no_overlap(&guard, &next.occupied(), Some(reservation_id))?;
        }
        next.check_invariants().map_err(EngineError::Validation)?;

        let event = Event::ReservationChanged {
            reservation: next.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        self.announce(&next, op.name(), Some(previous_status), actor.role);
        Ok(TransitionOutcome {
            reservation: next,
            previous_status: Some(previous_status),
            conflict_time,
        })
    }

    fn announce(&self, r: &Reservation, operation: &'static str, old: Option<ReservationStatus>, role: ActorRole) {
        metrics::counter!(observability::TRANSITIONS_TOTAL, "operation" => operation).increment(1);
        self.notify.send(&TransitionNotice {
            reservation_id: r.id,
            room_id: r.room_id,
            operation,
            old_status: old,
            new_status: r.status,
            extension_status: r.extension_status,
            actor_role: role,
            version: r.version,
            at: r.updated_at,
        });
    }

    pub async fn approve(&self, id: Ulid, actor: &Actor, now: Ms) -> Result<TransitionOutcome, EngineError> {
        self.apply_operation(id, Operation::Approve, actor, None, now).await
    }

    pub async fn reject(&self, id: Ulid, actor: &Actor, now: Ms) -> Result<TransitionOutcome, EngineError> {
        self.apply_operation(id, Operation::Reject, actor, None, now).await
    }

    pub async fn start(&self, id: Ulid, actor: &Actor, now: Ms) -> Result<TransitionOutcome, EngineError> {
        self.apply_operation(id, Operation::Start, actor, None, now).await
    }

    pub async fn cancel(&self, id: Ulid, actor: &Actor, now: Ms) -> Result<TransitionOutcome, EngineError> {
        self.apply_operation(id, Operation::Cancel, actor, None, now).await
    }

    pub async fn end_early(&self, id: Ulid, actor: &Actor, now: Ms) -> Result<TransitionOutcome, EngineError> {
        self.apply_operation(id, Operation::EndEarly, actor, None, now).await
    }

    pub async fn request_extension(
        &self,
        id: Ulid,
        actor: &Actor,
        reason: String,
        now: Ms,
    ) -> Result<TransitionOutcome, EngineError> {
        self.apply_operation(id, Operation::RequestExtension { reason }, actor, None, now)
            .await
    }

    pub async fn handle_extension(
        &self,
        id: Ulid,
        actor: &Actor,
        decision: ExtensionDecision,
        now: Ms,
    ) -> Result<TransitionOutcome, EngineError> {
        self.apply_operation(id, Operation::HandleExtension(decision), actor, None, now)
            .await
    }

    pub async fn replace_participants(
        &self,
        id: Ulid,
        actor: &Actor,
        participants: Vec<Participant>,
        now: Ms,
    ) -> Result<TransitionOutcome, EngineError> {
        self.apply_operation(id, Operation::ReplaceParticipants(participants), actor, None, now)
            .await
    }

    pub async fn archive(&self, id: Ulid, actor: &Actor, now: Ms) -> Result<TransitionOutcome, EngineError> {
        self.apply_operation(id, Operation::Archive, actor, None, now).await
    }

    /// Reservations due for a time-based transition. Rooms locked by a writer
    /// are skipped; the next tick picks them up.
    pub fn collect_sweep_candidates(&self, now: Ms) -> Vec<SweepCandidate> {
        let grace = self.policy.expiry_grace_ms;
        let mut due = Vec::new();
        for entry in self.state.iter() {
            let rs = entry.value().clone();
            let Ok(guard) = rs.try_read() else { continue };
            for r in &guard.reservations {
                let operation = match r.status {
                    ReservationStatus::Pending | ReservationStatus::Approved if now > r.span.start + grace => {
                        Operation::Expire
                    }
                    ReservationStatus::Ongoing if now >= r.effective_end() => Operation::Overdue,
                    _ => continue,
                };
                due.push(SweepCandidate {
                    reservation_id: r.id,
                    version: r.version,
                    operation,
                });
            }
        }
        due
    }

    /// Rewrite the WAL with one snapshot per room and reservation.
    ///
    /// Read guards are held until the writer swapped the file, so no append for
    /// a snapshotted room can land in the old log after its snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let rooms: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        let mut guards = Vec::with_capacity(rooms.len());
        for rs in rooms {
            let guard = rs.read_owned().await;
            events.push(Event::RoomUpserted {
                room: guard.room.clone(),
            });
            events.extend(guard.reservations.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
            guards.push(guard);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
