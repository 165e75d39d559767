//! The reservation state machine.
//!
//! Every operation checks, in order, the actor, the current status and then
//! timing. Operations mutate a working copy; the caller commits it only when
//! `apply` returns `Ok`, which makes each transition all-or-nothing.

use crate::config::Policy;
use crate::limits::*;
use crate::model::*;

use super::conflict::{validate_span, ExtensionCeiling};
use super::validate::validate_participants;
use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionDecision {
    /// Approve up to the ceiling, or to an earlier staff-chosen end.
    Approve { end: Option<Ms> },
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Approve,
    Reject,
    Start,
    Cancel,
    EndEarly,
    RequestExtension { reason: String },
    HandleExtension(ExtensionDecision),
    ReplaceParticipants(Vec<Participant>),
    Archive,
    /// Sweeper: an unstarted reservation missed its start.
    Expire,
    /// Sweeper: an Ongoing reservation ran past its effective end.
    Overdue,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Approve => "approve",
            Operation::Reject => "reject",
            Operation::Start => "start",
            Operation::Cancel => "cancel",
            Operation::EndEarly => "end_early",
            Operation::RequestExtension { .. } => "request_extension",
            Operation::HandleExtension(ExtensionDecision::Approve { .. }) => "approve_extension",
            Operation::HandleExtension(ExtensionDecision::Reject) => "reject_extension",
            Operation::ReplaceParticipants(_) => "replace_participants",
            Operation::Archive => "archive",
            Operation::Expire => "expire",
            Operation::Overdue => "complete_overdue",
        }
    }

    /// Operations that read the room to bound an extension.
    pub fn needs_ceiling(&self) -> bool {
        matches!(
            self,
            Operation::RequestExtension { .. }
                | Operation::HandleExtension(ExtensionDecision::Approve { .. })
        )
    }
}

pub struct TransitionContext<'a> {
    pub actor: &'a Actor,
    pub now: Ms,
    pub policy: &'a Policy,
    pub room_active: bool,
    /// Present for operations where `needs_ceiling` holds.
    pub ceiling: Option<ExtensionCeiling>,
}

/// Apply `op` to `r`. Returns the extension ceiling for extension requests.
pub fn apply(
    r: &mut Reservation,
    op: &Operation,
    ctx: &TransitionContext<'_>,
) -> Result<Option<Ms>, EngineError> {
    let mut conflict_time = None;

    match op {
        Operation::Approve => {
            require_staff(ctx.actor, "only staff can approve reservations")?;
            require_status(r, op, &[ReservationStatus::Pending])?;
            require_room_active(r, ctx)?;
            r.status = ReservationStatus::Approved;
        }
        Operation::Reject => {
            require_staff(ctx.actor, "only staff can reject reservations")?;
            require_status(r, op, &[ReservationStatus::Pending])?;
            r.status = ReservationStatus::Rejected;
        }
        Operation::Start => {
            require_staff(ctx.actor, "only staff can start reservations")?;
            require_status(r, op, &[ReservationStatus::Approved])?;
            require_room_active(r, ctx)?;
            let opens_at = r.span.start - ctx.policy.start_grace_ms;
            let closes_at = (r.span.start + ctx.policy.expiry_grace_ms).min(r.effective_end());
            if ctx.now < opens_at || ctx.now >= closes_at {
                return Err(EngineError::OutsideWindow {
                    opens_at,
                    closes_at,
                    now: ctx.now,
                });
            }
            r.status = ReservationStatus::Ongoing;
            r.actual_start = Some(ctx.now);
        }
        Operation::Cancel => {
            require_main_reserver(r, ctx.actor, "only the main reserver can cancel")?;
            require_status(r, op, &[ReservationStatus::Pending, ReservationStatus::Approved])?;
            r.status = ReservationStatus::Cancelled;
        }
        Operation::EndEarly => {
            if !ctx.actor.role.is_staff() {
                require_main_reserver(r, ctx.actor, "only staff or the main reserver can end a reservation")?;
            }
            require_status(r, op, &[ReservationStatus::Ongoing])?;
            r.status = ReservationStatus::Completed;
            r.actual_end = Some(ctx.now);
            clear_pending_extension(r);
        }
        Operation::RequestExtension { reason } => {
            require_main_reserver(r, ctx.actor, "only the main reserver can request an extension")?;
            require_status(r, op, &[ReservationStatus::Ongoing])?;
            if r.extension_requested {
                return Err(invalid(r, op));
            }
            require_room_active(r, ctx)?;
            let reason = reason.trim();
            if reason.is_empty() {
                return Err(EngineError::Validation("an extension reason is required".into()));
            }
            if reason.len() > MAX_REASON_LEN {
                return Err(EngineError::LimitExceeded("extension reason too long"));
            }
            let ceiling = match ctx.ceiling {
                Some(ExtensionCeiling::NoRoom) | None => {
                    return Err(EngineError::NoExtensionAvailable(r.id));
                }
                Some(c) => c,
            };
            r.extension_requested = true;
            r.extension_status = ExtensionStatus::Pending;
            r.extension_reason = Some(reason.to_string());
            r.max_extended_end = ceiling.instant();
            conflict_time = ceiling.instant();
        }
        Operation::HandleExtension(decision) => {
            require_staff(ctx.actor, "only staff can decide on extensions")?;
            if r.status != ReservationStatus::Ongoing || r.extension_status != ExtensionStatus::Pending {
                return Err(invalid(r, op));
            }
            match decision {
                ExtensionDecision::Approve { end } => {
                    require_room_active(r, ctx)?;
                    let end = approved_end(r, *end, ctx)?;
                    validate_span(&Span::new(r.span.start, end))?;
                    r.extended_end = Some(end);
                    r.max_extended_end = Some(r.max_extended_end.map_or(end, |m| m.max(end)));
                    r.extension_status = ExtensionStatus::Approved;
                }
                ExtensionDecision::Reject => {
                    r.extension_status = ExtensionStatus::Rejected;
                }
            }
            r.extension_requested = false;
        }
        Operation::ReplaceParticipants(participants) => {
            require_main_reserver(r, ctx.actor, "only the main reserver can edit participants")?;
            require_status(r, op, &[ReservationStatus::Pending])?;
            let mut participants = participants.clone();
            validate_participants(&mut participants)?;
            let same_main = r
                .participants
                .first()
                .zip(participants.first())
                .is_some_and(|(old, new)| same_id_number(&old.id_number, &new.id_number));
            if !same_main {
                return Err(EngineError::Validation("the main reserver cannot be changed".into()));
            }
            r.participants = participants;
        }
        Operation::Archive => {
            if !ctx.actor.role.is_staff() {
                require_main_reserver(r, ctx.actor, "only staff or the main reserver can archive")?;
            }
            if !r.status.is_terminal() || r.archived {
                return Err(invalid(r, op));
            }
            r.archived = true;
        }
        Operation::Expire => {
            require_system(ctx.actor)?;
            require_status(r, op, &[ReservationStatus::Pending, ReservationStatus::Approved])?;
            if ctx.now <= r.span.start + ctx.policy.expiry_grace_ms {
                return Err(invalid(r, op));
            }
            r.status = ReservationStatus::Expired;
        }
        Operation::Overdue => {
            require_system(ctx.actor)?;
            require_status(r, op, &[ReservationStatus::Ongoing])?;
            if ctx.now < r.effective_end() {
                return Err(invalid(r, op));
            }
            r.status = ctx.policy.overdue_ongoing;
            clear_pending_extension(r);
        }
    }

    r.updated_at = ctx.now;
    r.version += 1;
    Ok(conflict_time)
}

/// The extended end staff approve: the stored ceiling, optionally re-validated
/// against the room, optionally lowered by staff.
fn approved_end(r: &Reservation, chosen: Option<Ms>, ctx: &TransitionContext<'_>) -> Result<Ms, EngineError> {
    let mut cap = r.max_extended_end;
    if ctx.policy.revalidate_extensions {
        match ctx.ceiling {
            Some(ExtensionCeiling::NoRoom) => return Err(EngineError::NoExtensionAvailable(r.id)),
            Some(ExtensionCeiling::At(t)) => cap = Some(cap.map_or(t, |c| c.min(t))),
            Some(ExtensionCeiling::Unbounded) | None => {}
        }
    }

    let from = r.effective_end();
    if let Some(c) = cap
        && c <= from
    {
        return Err(EngineError::NoExtensionAvailable(r.id));
    }

    match (chosen, cap) {
        (Some(end), _) if end <= from => Err(EngineError::Validation(
            "extended end must be after the current end".into(),
        )),
        (Some(end), Some(c)) if end > c => Err(EngineError::Validation(format!(
            "extended end {end} is past the ceiling {c}"
        ))),
        (Some(end), _) => Ok(end),
        (None, Some(c)) => Ok(c),
        (None, None) => Err(EngineError::Validation(
            "nothing caps this extension; an end time is required".into(),
        )),
    }
}

fn clear_pending_extension(r: &mut Reservation) {
    if r.extension_status == ExtensionStatus::Pending {
        r.extension_status = ExtensionStatus::None;
    }
    r.extension_requested = false;
}

pub(crate) fn same_id_number(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn invalid(r: &Reservation, op: &Operation) -> EngineError {
    EngineError::InvalidStateTransition {
        id: r.id,
        operation: op.name(),
        status: r.status,
        extension: r.extension_status,
    }
}

fn require_status(r: &Reservation, op: &Operation, allowed: &[ReservationStatus]) -> Result<(), EngineError> {
    if allowed.contains(&r.status) {
        Ok(())
    } else {
        Err(invalid(r, op))
    }
}

fn require_staff(actor: &Actor, msg: &'static str) -> Result<(), EngineError> {
    if actor.role.is_staff() {
        Ok(())
    } else {
        Err(EngineError::Forbidden(msg))
    }
}

fn require_main_reserver(r: &Reservation, actor: &Actor, msg: &'static str) -> Result<(), EngineError> {
    if actor.role != ActorRole::System && r.is_main_reserver(actor.user_id) {
        Ok(())
    } else {
        Err(EngineError::Forbidden(msg))
    }
}

fn require_system(actor: &Actor) -> Result<(), EngineError> {
    if actor.role == ActorRole::System {
        Ok(())
    } else {
        Err(EngineError::Forbidden("only the sweeper applies time-based transitions"))
    }
}

fn require_room_active(r: &Reservation, ctx: &TransitionContext<'_>) -> Result<(), EngineError> {
    if ctx.room_active {
        Ok(())
    } else {
        Err(EngineError::RoomInactive(r.room_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;
    /// 2026-10-18T00:00:00Z
    const DAY: Ms = 1_792_281_600_000;

    fn reservation(owner: Ulid, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            room_id: Ulid::new(),
            floor: "Ground Floor".into(),
            room_name: "Room 101".into(),
            user_id: owner,
            span: Span::new(DAY + 9 * H, DAY + 10 * H),
            extended_end: None,
            timezone: "UTC".into(),
            participants: vec![Participant {
                id_number: "2021-0001".into(),
                name: "Ana Cruz".into(),
                course: Some("BSCS".into()),
                year_level: Some("3".into()),
                department: None,
                role: ParticipantRole::Student,
                is_main_reserver: true,
            }],
            purpose: None,
            status,
            extension_requested: false,
            extension_status: ExtensionStatus::None,
            extension_reason: None,
            max_extended_end: None,
            actual_start: None,
            actual_end: None,
            created_at: DAY,
            updated_at: DAY,
            version: 1,
            archived: false,
        }
    }

    struct Fixture {
        policy: Policy,
        owner: Actor,
        staff: Actor,
        stranger: Actor,
        system: Actor,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                policy: Policy::default(),
                owner: Actor::new(Ulid::new(), ActorRole::Member),
                staff: Actor::new(Ulid::new(), ActorRole::Staff),
                stranger: Actor::new(Ulid::new(), ActorRole::Member),
                system: Actor::system(),
            }
        }

        fn ctx<'a>(&'a self, actor: &'a Actor, now: Ms) -> TransitionContext<'a> {
            TransitionContext {
                actor,
                now,
                policy: &self.policy,
                room_active: true,
                ceiling: None,
            }
        }
    }

    #[test]
    fn approve_then_approve_again_fails() {
        let f = Fixture::new();
        let mut r = reservation(f.owner.user_id, ReservationStatus::Pending);
        apply(&mut r, &Operation::Approve, &f.ctx(&f.staff, DAY)).unwrap();
        assert_eq!(r.status, ReservationStatus::Approved);
        assert_eq!(r.version, 2);

        let err = apply(&mut r, &Operation::Approve, &f.ctx(&f.staff, DAY)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidStateTransition { status: ReservationStatus::Approved, .. }
        ));
        assert_eq!(r.version, 2);
    }

    #[test]
    fn members_cannot_approve_or_reject() {
        let f = Fixture::new();
        let mut r = reservation(f.owner.user_id, ReservationStatus::Pending);
        assert!(matches!(
            apply(&mut r, &Operation::Approve, &f.ctx(&f.owner, DAY)),
            Err(EngineError::Forbidden(_))
        ));
        assert!(matches!(
            apply(&mut r, &Operation::Reject, &f.ctx(&f.owner, DAY)),
            Err(EngineError::Forbidden(_))
        ));
        assert_eq!(r.status, ReservationStatus::Pending);
    }

    #[test]
    fn approve_rechecks_room_active() {
        let f = Fixture::new();
        let mut r = reservation(f.owner.user_id, ReservationStatus::Pending);
        let mut ctx = f.ctx(&f.staff, DAY);
        ctx.room_active = false;
        assert!(matches!(
            apply(&mut r, &Operation::Approve, &ctx),
            Err(EngineError::RoomInactive(_))
        ));
        // Rejecting a reservation on an inactive room is still allowed.
        apply(&mut r, &Operation::Reject, &ctx).unwrap();
        assert_eq!(r.status, ReservationStatus::Rejected);
    }

    #[test]
    fn start_respects_grace_window() {
        let f = Fixture::new();
        let mut r = reservation(f.owner.user_id, ReservationStatus::Approved);

        let too_early = DAY + 9 * H - 16 * M;
        assert!(matches!(
            apply(&mut r, &Operation::Start, &f.ctx(&f.staff, too_early)),
            Err(EngineError::OutsideWindow { .. })
        ));

        let too_late = DAY + 9 * H + 15 * M;
        assert!(matches!(
            apply(&mut r, &Operation::Start, &f.ctx(&f.staff, too_late)),
            Err(EngineError::OutsideWindow { .. })
        ));

        let now = DAY + 9 * H - 10 * M;
        apply(&mut r, &Operation::Start, &f.ctx(&f.staff, now)).unwrap();
        assert_eq!(r.status, ReservationStatus::Ongoing);
        assert_eq!(r.actual_start, Some(now));
    }

    #[test]
    fn only_main_reserver_cancels() {
        let f = Fixture::new();
        let mut r = reservation(f.owner.user_id, ReservationStatus::Approved);
        assert!(matches!(
            apply(&mut r, &Operation::Cancel, &f.ctx(&f.staff, DAY)),
            Err(EngineError::Forbidden(_))
        ));
        assert!(matches!(
            apply(&mut r, &Operation::Cancel, &f.ctx(&f.stranger, DAY)),
            Err(EngineError::Forbidden(_))
        ));
        apply(&mut r, &Operation::Cancel, &f.ctx(&f.owner, DAY)).unwrap();
        assert_eq!(r.status, ReservationStatus::Cancelled);

        assert!(matches!(
            apply(&mut r, &Operation::Cancel, &f.ctx(&f.owner, DAY)),
            Err(EngineError::InvalidStateTransition { status: ReservationStatus::Cancelled, .. })
        ));
    }

    #[test]
    fn cancel_refused_once_ongoing() {
        let f = Fixture::new();
        let mut r = reservation(f.owner.user_id, ReservationStatus::Ongoing);
        assert!(matches!(
            apply(&mut r, &Operation::Cancel, &f.ctx(&f.owner, DAY)),
            Err(EngineError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn end_early_clears_pending_extension() {
        let f = Fixture::new();
        let mut r = reservation(f.owner.user_id, ReservationStatus::Ongoing);
        r.extension_requested = true;
        r.extension_status = ExtensionStatus::Pending;
        r.max_extended_end = Some(DAY + 11 * H);

        let now = DAY + 9 * H + 40 * M;
        apply(&mut r, &Operation::EndEarly, &f.ctx(&f.owner, now)).unwrap();
        assert_eq!(r.status, ReservationStatus::Completed);
        assert_eq!(r.actual_end, Some(now));
        assert!(!r.extension_requested);
        assert_eq!(r.extension_status, ExtensionStatus::None);
        assert!(r.check_invariants().is_ok());
    }

    #[test]
    fn strangers_cannot_end_early() {
        let f = Fixture::new();
        let mut r = reservation(f.owner.user_id, ReservationStatus::Ongoing);
        assert!(matches!(
            apply(&mut r, &Operation::EndEarly, &f.ctx(&f.stranger, DAY + 9 * H)),
            Err(EngineError::Forbidden(_))
        ));
        apply(&mut r, &Operation::EndEarly, &f.ctx(&f.staff, DAY + 9 * H)).unwrap();
    }

    #[test]
    fn request_extension_stores_ceiling() {
        let f = Fixture::new();
        let mut r = reservation(f.owner.user_id, ReservationStatus::Ongoing);
        let mut ctx = f.ctx(&f.owner, DAY + 9 * H + 50 * M);
        ctx.ceiling = Some(ExtensionCeiling::At(DAY + 10 * H + 30 * M));

        let op = Operation::RequestExtension { reason: "  thesis defense  ".into() };
        let conflict = apply(&mut r, &op, &ctx).unwrap();
        assert_eq!(conflict, Some(DAY + 10 * H + 30 * M));
        assert!(r.extension_requested);
        assert_eq!(r.extension_status, ExtensionStatus::Pending);
        assert_eq!(r.extension_reason.as_deref(), Some("thesis defense"));
        assert_eq!(r.max_extended_end, Some(DAY + 10 * H + 30 * M));

        // A second request while one is pending is refused.
        assert!(matches!(
            apply(&mut r, &op, &ctx),
            Err(EngineError::InvalidStateTransition { extension: ExtensionStatus::Pending, .. })
        ));
    }

    #[test]
    fn request_extension_without_room_fails() {
        let f = Fixture::new();
        let mut r = reservation(f.owner.user_id, ReservationStatus::Ongoing);
        let mut ctx = f.ctx(&f.owner, DAY + 9 * H + 50 * M);
        ctx.ceiling = Some(ExtensionCeiling::NoRoom);

        let op = Operation::RequestExtension { reason: "more time".into() };
        assert_eq!(apply(&mut r, &op, &ctx), Err(EngineError::NoExtensionAvailable(r.id)));
        assert!(!r.extension_requested);
        assert_eq!(r.extension_status, ExtensionStatus::None);
    }

    #[test]
    fn request_extension_needs_reason_and_owner() {
        let f = Fixture::new();
        let mut r = reservation(f.owner.user_id, ReservationStatus::Ongoing);
        let mut ctx = f.ctx(&f.owner, DAY + 9 * H);
        ctx.ceiling = Some(ExtensionCeiling::Unbounded);
        assert!(matches!(
            apply(&mut r, &Operation::RequestExtension { reason: "   ".into() }, &ctx),
            Err(EngineError::Validation(_))
        ));

        let mut ctx = f.ctx(&f.staff, DAY + 9 * H);
        ctx.ceiling = Some(ExtensionCeiling::Unbounded);
        assert!(matches!(
            apply(&mut r, &Operation::RequestExtension { reason: "x".into() }, &ctx),
            Err(EngineError::Forbidden(_))
        ));
    }

    fn pending_extension(f: &Fixture, ceiling: Option<Ms>) -> Reservation {
        let mut r = reservation(f.owner.user_id, ReservationStatus::Ongoing);
        r.extension_requested = true;
        r.extension_status = ExtensionStatus::Pending;
        r.extension_reason = Some("more time".into());
        r.max_extended_end = ceiling;
        r
    }

    #[test]
    fn approve_extension_uses_ceiling() {
        let f = Fixture::new();
        let mut r = pending_extension(&f, Some(DAY + 10 * H + 30 * M));
        let mut ctx = f.ctx(&f.staff, DAY + 9 * H + 55 * M);
        ctx.ceiling = Some(ExtensionCeiling::At(DAY + 10 * H + 30 * M));

        apply(&mut r, &Operation::HandleExtension(ExtensionDecision::Approve { end: None }), &ctx).unwrap();
        assert_eq!(r.status, ReservationStatus::Ongoing);
        assert_eq!(r.extended_end, Some(DAY + 10 * H + 30 * M));
        assert_eq!(r.extension_status, ExtensionStatus::Approved);
        assert!(!r.extension_requested);
        assert!(r.check_invariants().is_ok());
    }

    #[test]
    fn approve_extension_accepts_smaller_end_only() {
        let f = Fixture::new();
        let ceiling = DAY + 11 * H;
        let mut ctx = f.ctx(&f.staff, DAY + 9 * H + 55 * M);
        ctx.ceiling = Some(ExtensionCeiling::At(ceiling));

        let mut r = pending_extension(&f, Some(ceiling));
        let too_far = Operation::HandleExtension(ExtensionDecision::Approve { end: Some(ceiling + M) });
        assert!(matches!(apply(&mut r, &too_far, &ctx), Err(EngineError::Validation(_))));

        let not_after_end = Operation::HandleExtension(ExtensionDecision::Approve { end: Some(DAY + 10 * H) });
        assert!(matches!(apply(&mut r, &not_after_end, &ctx), Err(EngineError::Validation(_))));

        let shorter = Operation::HandleExtension(ExtensionDecision::Approve { end: Some(DAY + 10 * H + 30 * M) });
        apply(&mut r, &shorter, &ctx).unwrap();
        assert_eq!(r.extended_end, Some(DAY + 10 * H + 30 * M));
    }

    #[test]
    fn approve_extension_revalidates_against_new_conflict() {
        let f = Fixture::new();
        let mut r = pending_extension(&f, Some(DAY + 12 * H));
        let mut ctx = f.ctx(&f.staff, DAY + 9 * H + 55 * M);
        // A reservation created after the request now starts at 10:15.
        ctx.ceiling = Some(ExtensionCeiling::At(DAY + 10 * H + 15 * M));

        apply(&mut r, &Operation::HandleExtension(ExtensionDecision::Approve { end: None }), &ctx).unwrap();
        assert_eq!(r.extended_end, Some(DAY + 10 * H + 15 * M));
    }

    #[test]
    fn snapshot_ceiling_kept_when_revalidation_disabled() {
        let mut f = Fixture::new();
        f.policy.revalidate_extensions = false;
        let mut r = pending_extension(&f, Some(DAY + 12 * H));
        let mut ctx = f.ctx(&f.staff, DAY + 9 * H + 55 * M);
        ctx.ceiling = Some(ExtensionCeiling::At(DAY + 10 * H + 15 * M));

        apply(&mut r, &Operation::HandleExtension(ExtensionDecision::Approve { end: None }), &ctx).unwrap();
        assert_eq!(r.extended_end, Some(DAY + 12 * H));
    }

    #[test]
    fn unbounded_extension_requires_explicit_end() {
        let f = Fixture::new();
        let mut r = pending_extension(&f, None);
        let mut ctx = f.ctx(&f.staff, DAY + 9 * H + 55 * M);
        ctx.ceiling = Some(ExtensionCeiling::Unbounded);

        assert!(matches!(
            apply(&mut r, &Operation::HandleExtension(ExtensionDecision::Approve { end: None }), &ctx),
            Err(EngineError::Validation(_))
        ));
        apply(
            &mut r,
            &Operation::HandleExtension(ExtensionDecision::Approve { end: Some(DAY + 13 * H) }),
            &ctx,
        )
        .unwrap();
        assert_eq!(r.extended_end, Some(DAY + 13 * H));
        assert_eq!(r.max_extended_end, Some(DAY + 13 * H));
    }

    #[test]
    fn reject_extension_leaves_end_untouched() {
        let f = Fixture::new();
        let mut r = pending_extension(&f, Some(DAY + 11 * H));
        apply(
            &mut r,
            &Operation::HandleExtension(ExtensionDecision::Reject),
            &f.ctx(&f.staff, DAY + 9 * H + 55 * M),
        )
        .unwrap();
        assert_eq!(r.extension_status, ExtensionStatus::Rejected);
        assert!(!r.extension_requested);
        assert_eq!(r.extended_end, None);
        assert!(r.check_invariants().is_ok());

        // Deciding twice fails.
        assert!(matches!(
            apply(
                &mut r,
                &Operation::HandleExtension(ExtensionDecision::Reject),
                &f.ctx(&f.staff, DAY + 9 * H + 56 * M)
            ),
            Err(EngineError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn extension_can_be_requested_again_after_decision() {
        let f = Fixture::new();
        let mut r = pending_extension(&f, Some(DAY + 10 * H + 30 * M));
        let mut ctx = f.ctx(&f.staff, DAY + 9 * H + 55 * M);
        ctx.ceiling = Some(ExtensionCeiling::At(DAY + 10 * H + 30 * M));
        apply(&mut r, &Operation::HandleExtension(ExtensionDecision::Approve { end: None }), &ctx).unwrap();

        let mut ctx = f.ctx(&f.owner, DAY + 10 * H + 20 * M);
        ctx.ceiling = Some(ExtensionCeiling::At(DAY + 12 * H));
        let conflict = apply(&mut r, &Operation::RequestExtension { reason: "again".into() }, &ctx).unwrap();
        assert_eq!(conflict, Some(DAY + 12 * H));
        assert_eq!(r.extension_status, ExtensionStatus::Pending);
        // The first approval still holds until the next one lands.
        assert_eq!(r.extended_end, Some(DAY + 10 * H + 30 * M));
    }

    #[test]
    fn sweep_operations_only_for_system() {
        let f = Fixture::new();
        let mut r = reservation(f.owner.user_id, ReservationStatus::Pending);
        assert!(matches!(
            apply(&mut r, &Operation::Expire, &f.ctx(&f.staff, DAY + 12 * H)),
            Err(EngineError::Forbidden(_))
        ));
        apply(&mut r, &Operation::Expire, &f.ctx(&f.system, DAY + 12 * H)).unwrap();
        assert_eq!(r.status, ReservationStatus::Expired);
    }

    #[test]
    fn expire_waits_for_grace() {
        let f = Fixture::new();
        let mut r = reservation(f.owner.user_id, ReservationStatus::Approved);
        assert!(apply(&mut r, &Operation::Expire, &f.ctx(&f.system, DAY + 9 * H + 15 * M)).is_err());
        apply(&mut r, &Operation::Expire, &f.ctx(&f.system, DAY + 9 * H + 15 * M + 1)).unwrap();
        assert_eq!(r.status, ReservationStatus::Expired);
    }

    #[test]
    fn overdue_follows_extended_end_and_policy() {
        let mut f = Fixture::new();
        let mut r = reservation(f.owner.user_id, ReservationStatus::Ongoing);
        r.extended_end = Some(DAY + 11 * H);

        assert!(apply(&mut r, &Operation::Overdue, &f.ctx(&f.system, DAY + 10 * H + 30 * M)).is_err());

        f.policy.overdue_ongoing = ReservationStatus::Expired;
        apply(&mut r, &Operation::Overdue, &f.ctx(&f.system, DAY + 11 * H)).unwrap();
        assert_eq!(r.status, ReservationStatus::Expired);
        assert_eq!(r.actual_end, None);
    }

    #[test]
    fn archive_only_terminal() {
        let f = Fixture::new();
        let mut r = reservation(f.owner.user_id, ReservationStatus::Approved);
        assert!(matches!(
            apply(&mut r, &Operation::Archive, &f.ctx(&f.owner, DAY)),
            Err(EngineError::InvalidStateTransition { .. })
        ));
        r.status = ReservationStatus::Cancelled;
        apply(&mut r, &Operation::Archive, &f.ctx(&f.owner, DAY)).unwrap();
        assert!(r.archived);
        assert_eq!(r.status, ReservationStatus::Cancelled);
        assert!(apply(&mut r, &Operation::Archive, &f.ctx(&f.staff, DAY)).is_err());
    }

    #[test]
    fn replace_participants_keeps_main_reserver() {
        let f = Fixture::new();
        let mut r = reservation(f.owner.user_id, ReservationStatus::Pending);
        let mut main = r.participants[0].clone();
        main.is_main_reserver = false;
        let guest = Participant {
            id_number: "F-77".into(),
            name: "Prof. Reyes".into(),
            course: None,
            year_level: None,
            department: Some("CS".into()),
            role: ParticipantRole::Faculty,
            is_main_reserver: false,
        };

        let op = Operation::ReplaceParticipants(vec![main.clone(), guest.clone()]);
        apply(&mut r, &op, &f.ctx(&f.owner, DAY)).unwrap();
        assert_eq!(r.participants.len(), 2);
        assert!(r.participants[0].is_main_reserver);
        assert!(r.check_invariants().is_ok());

        let swapped = Operation::ReplaceParticipants(vec![guest, main]);
        assert!(matches!(
            apply(&mut r, &swapped, &f.ctx(&f.owner, DAY)),
            Err(EngineError::Validation(_))
        ));
    }
}
