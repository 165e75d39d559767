use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

// ── Day view ──────────────────────────────────────────────────────

/// Per-room occupied intervals for one calendar date.
///
/// `rooms` must already be in display order (floor, then name); the output has
/// exactly one entry per input room in the same order, inactive rooms included
/// and flagged non-bookable.
///
/// A reservation lands on a room when its snapshotted `(floor, room_name)`
/// matches exactly, its status is Pending or Approved (Ongoing too when
/// `include_ongoing`), it isn't archived, and its start falls on `date` in the
/// reservation's own timezone.
pub fn compute_availability<'a>(
    rooms: &[Room],
    reservations: impl IntoIterator<Item = &'a Reservation>,
    date: NaiveDate,
    viewer: Option<Ulid>,
    include_ongoing: bool,
) -> Vec<RoomAvailability> {
    let mut by_room: HashMap<(&str, &str), Vec<OccupiedSlot>> = HashMap::new();

    for r in reservations {
        if r.archived || !shows_in_day_view(r.status, include_ongoing) {
            continue;
        }
        if r.local_date() != Some(date) {
            continue;
        }
        by_room
            .entry((r.floor.as_str(), r.room_name.as_str()))
            .or_default()
            .push(OccupiedSlot {
                start: r.span.start,
                end: r.effective_end(),
                is_owned_by_viewer: viewer.is_some_and(|v| v == r.user_id),
                status: r.status,
            });
    }

    rooms
        .iter()
        .map(|room| {
            let mut occupied = by_room
                .remove(&(room.floor.as_str(), room.name.as_str()))
                .unwrap_or_default();
            occupied.sort_by_key(|s| (s.start, s.end));
            RoomAvailability {
                room_id: room.id,
                floor: room.floor.clone(),
                name: room.name.clone(),
                bookable: room.active,
                occupied,
            }
        })
        .collect()
}

fn shows_in_day_view(status: ReservationStatus, include_ongoing: bool) -> bool {
    match status {
        ReservationStatus::Pending | ReservationStatus::Approved => true,
        ReservationStatus::Ongoing => include_ongoing,
        _ => false,
    }
}

/// Display order for rooms: floor, then name.
pub fn sort_rooms(rooms: &mut [Room]) {
    rooms.sort_by(|a, b| a.floor.cmp(&b.floor).then_with(|| a.name.cmp(&b.name)));
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    /// 2026-10-18T00:00:00Z
    const DAY: Ms = 1_792_281_600_000;

    fn room(floor: &str, name: &str, active: bool) -> Room {
        Room {
            id: Ulid::new(),
            floor: floor.into(),
            name: name.into(),
            active,
        }
    }

    fn reservation(room: &Room, start: Ms, end: Ms, status: ReservationStatus, owner: Ulid) -> Reservation {
        Reservation {
            id: Ulid::new(),
            room_id: room.id,
            floor: room.floor.clone(),
            room_name: room.name.clone(),
            user_id: owner,
            span: Span::new(start, end),
            extended_end: None,
            timezone: "UTC".into(),
            participants: Vec::new(),
            purpose: None,
            status,
            extension_requested: false,
            extension_status: ExtensionStatus::None,
            extension_reason: None,
            max_extended_end: None,
            actual_start: None,
            actual_end: None,
            created_at: 0,
            updated_at: 0,
            version: 1,
            archived: false,
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
    }

    #[test]
    fn every_room_kept_in_input_order() {
        let mut rooms = vec![
            room("2F", "B", true),
            room("1F", "Z", false),
            room("2F", "A", true),
            room("1F", "A", true),
        ];
        sort_rooms(&mut rooms);
        let out = compute_availability(&rooms, [], date(), None, false);
        assert_eq!(out.len(), rooms.len());
        let order: Vec<_> = out.iter().map(|a| (a.floor.as_str(), a.name.as_str())).collect();
        assert_eq!(order, vec![("1F", "A"), ("1F", "Z"), ("2F", "A"), ("2F", "B")]);
        assert!(!out[1].bookable);
        assert!(out.iter().all(|a| a.occupied.is_empty()));
    }

    #[test]
    fn status_filter_and_ordering() {
        let rooms = vec![room("1F", "A", true)];
        let me = Ulid::new();
        let other = Ulid::new();
        let rs = vec![
            reservation(&rooms[0], DAY + 13 * H, DAY + 14 * H, ReservationStatus::Pending, other),
            reservation(&rooms[0], DAY + 9 * H, DAY + 10 * H, ReservationStatus::Approved, me),
            reservation(&rooms[0], DAY + 11 * H, DAY + 12 * H, ReservationStatus::Ongoing, other),
            reservation(&rooms[0], DAY + 15 * H, DAY + 16 * H, ReservationStatus::Cancelled, me),
        ];

        let out = compute_availability(&rooms, &rs, date(), Some(me), false);
        let slots = &out[0].occupied;
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].start, DAY + 9 * H);
        assert!(slots[0].is_owned_by_viewer);
        assert_eq!(slots[1].status, ReservationStatus::Pending);
        assert!(!slots[1].is_owned_by_viewer);

        let out = compute_availability(&rooms, &rs, date(), Some(me), true);
        assert_eq!(out[0].occupied.len(), 3);
        assert_eq!(out[0].occupied[1].status, ReservationStatus::Ongoing);
    }

    #[test]
    fn slot_end_is_effective_end() {
        let rooms = vec![room("1F", "A", true)];
        let mut r = reservation(&rooms[0], DAY + 9 * H, DAY + 10 * H, ReservationStatus::Ongoing, Ulid::new());
        r.extended_end = Some(DAY + 11 * H);
        let out = compute_availability(&rooms, [&r], date(), None, true);
        assert_eq!(out[0].occupied[0].end, DAY + 11 * H);
    }

    #[test]
    fn grouping_uses_snapshotted_floor_and_name() {
        let rooms = vec![room("1F", "A", true), room("1F", "B", true)];
        // Booked under the old name "A" but with B's id: matched by name.
        let mut r = reservation(&rooms[0], DAY + 9 * H, DAY + 10 * H, ReservationStatus::Approved, Ulid::new());
        r.room_id = rooms[1].id;
        let out = compute_availability(&rooms, [&r], date(), None, false);
        assert_eq!(out[0].occupied.len(), 1);
        assert!(out[1].occupied.is_empty());

        // Floor must match too.
        r.floor = "2F".into();
        let out = compute_availability(&rooms, [&r], date(), None, false);
        assert!(out.iter().all(|a| a.occupied.is_empty()));
    }

    #[test]
    fn date_matches_in_reservation_timezone() {
        let rooms = vec![room("1F", "A", true)];
        // 20:00Z on the 18th is 04:00 on the 19th in Manila.
        let mut r = reservation(&rooms[0], DAY + 20 * H, DAY + 21 * H, ReservationStatus::Approved, Ulid::new());
        let out = compute_availability(&rooms, [&r], date(), None, false);
        assert_eq!(out[0].occupied.len(), 1);

        r.timezone = "Asia/Manila".into();
        let out = compute_availability(&rooms, [&r], date(), None, false);
        assert!(out[0].occupied.is_empty());
        let next = date().succ_opt().unwrap();
        let out = compute_availability(&rooms, [&r], next, None, false);
        assert_eq!(out[0].occupied.len(), 1);
    }

    #[test]
    fn archived_reservations_hidden() {
        let rooms = vec![room("1F", "A", true)];
        let mut r = reservation(&rooms[0], DAY + 9 * H, DAY + 10 * H, ReservationStatus::Approved, Ulid::new());
        r.archived = true;
        let out = compute_availability(&rooms, [&r], date(), None, false);
        assert!(out[0].occupied.is_empty());
    }
}
