//! Connector reservations.
//!
//! A reservation pins a connector for one idTag until its expiry date. While
//! active it forces the Reserved status and blocks other tags from starting
//! a session; the matching tag (or a member of the same parent group)
//! consumes it when its transaction begins. Reservations are volatile: they
//! do not survive a reboot.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct Reservation {
    pub reservation_id: i32,
    pub connector_id: u32,
    pub id_tag: String,
    pub parent_id_tag: Option<String>,
    pub expiry_date: DateTime<Utc>,
}

impl Reservation {
    /// Whether `id_tag` (with optional parent) may claim this reservation.
    pub fn matches(&self, id_tag: &str, parent_id_tag: Option<&str>) -> bool {
        if self.id_tag == id_tag {
            return true;
        }
        match (&self.parent_id_tag, parent_id_tag) {
            (Some(own), Some(presented)) => own == presented,
            _ => false,
        }
    }
}

/// All reservations currently placed on this charge point.
#[derive(Default)]
pub(crate) struct ReservationBook {
    entries: Vec<Reservation>,
}

impl ReservationBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place or update a reservation. A reservation with the same id
    /// replaces the old one (OCPP allows the Central System to amend it).
    pub fn place(&mut self, reservation: Reservation) {
        info!(
            reservation_id = reservation.reservation_id,
            connector_id = reservation.connector_id,
            id_tag = reservation.id_tag.as_str(),
            "Reservation placed"
        );
        self.entries
            .retain(|r| r.reservation_id != reservation.reservation_id);
        self.entries.push(reservation);
    }

    pub fn cancel(&mut self, reservation_id: i32) -> bool {
        let before = self.entries.len();
        self.entries.retain(|r| r.reservation_id != reservation_id);
        let removed = self.entries.len() < before;
        if removed {
            info!(reservation_id, "Reservation cancelled");
        }
        removed
    }

    /// The unexpired reservation pinned to `connector_id`, if any.
    pub fn active_for(&self, connector_id: u32, now: DateTime<Utc>) -> Option<&Reservation> {
        self.entries
            .iter()
            .find(|r| r.connector_id == connector_id && now < r.expiry_date)
    }

    /// Remove the reservation on `connector_id` claimed by `id_tag`.
    /// Returns the reservation id for the StartTransaction payload.
    pub fn consume(
        &mut self,
        connector_id: u32,
        id_tag: &str,
        parent_id_tag: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<i32> {
        let reservation_id = self
            .active_for(connector_id, now)
            .filter(|r| r.matches(id_tag, parent_id_tag))
            .map(|r| r.reservation_id)?;
        self.entries.retain(|r| r.reservation_id != reservation_id);
        debug!(reservation_id, connector_id, id_tag, "Reservation consumed");
        Some(reservation_id)
    }

    /// Drop reservations past their expiry date.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.entries.retain(|r| now < r.expiry_date);
    }
}
