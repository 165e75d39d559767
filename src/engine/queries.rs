use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::{compute_availability, sort_rooms};
use super::{Engine, EngineError, SharedRoomState};

impl Engine {
    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let room_id = self.get_room_for_reservation(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self.get_room_state(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Non-archived reservations matching `filter`, ordered by start.
    pub async fn list_reservations(&self, filter: &ReservationFilter) -> Vec<Reservation> {
        let rooms: Vec<SharedRoomState> = match filter.room_id {
            Some(id) => self.get_room_state(&id).into_iter().collect(),
            None => self.room_handles(),
        };
        let mut out = Vec::new();
        for rs in rooms {
            let guard = rs.read().await;
            out.extend(guard.reservations.iter().filter(|r| filter.matches(r)).cloned());
        }
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    /// Every room, inactive included, ordered by floor then name.
    pub async fn list_rooms(&self) -> Vec<Room> {
        let mut rooms = Vec::with_capacity(self.state.len());
        for rs in self.room_handles() {
            rooms.push(rs.read().await.room.clone());
        }
        sort_rooms(&mut rooms);
        rooms
    }

    /// The day view for `date`: one entry per room, ordered by floor then name.
    pub async fn compute_availability(
        &self,
        date: NaiveDate,
        viewer: Option<Ulid>,
    ) -> Result<Vec<RoomAvailability>, EngineError> {
        let mut rooms = Vec::with_capacity(self.state.len());
        let mut reservations = Vec::new();
        for rs in self.room_handles() {
            let guard = rs.read().await;
            rooms.push(guard.room.clone());
            reservations.extend(guard.reservations.iter().filter(|r| r.is_blocking()).cloned());
        }
        sort_rooms(&mut rooms);
        Ok(compute_availability(
            &rooms,
            &reservations,
            date,
            viewer,
            self.policy.availability_includes_ongoing,
        ))
    }

    /// Clone the room handles out so no map shard stays locked across an await.
    fn room_handles(&self) -> Vec<SharedRoomState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }
}
