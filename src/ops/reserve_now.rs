//! ReserveNow handler

use chrono::{DateTime, Utc};
use rust_ocpp::v1_6::messages::reserve_now::{ReserveNowRequest, ReserveNowResponse};
use rust_ocpp::v1_6::types::{ChargePointStatus, ReservationStatus};
use serde_json::Value;
use tracing::info;

use super::OpOutcome;
use crate::model::{ChargePoint, Reservation};

pub(crate) fn handle(cp: &mut ChargePoint, now: DateTime<Utc>, payload: &Value) -> OpOutcome {
    let request: ReserveNowRequest = match serde_json::from_value(payload.clone()) {
        Ok(r) => r,
        Err(e) => return OpOutcome::formation_violation(e),
    };

    info!(
        reservation_id = request.reservation_id,
        connector_id = request.connector_id,
        id_tag = request.id_tag.as_str(),
        "ReserveNow"
    );

    // Station-wide reservations (connector 0) are not supported.
    if request.connector_id == 0 {
        return OpOutcome::reply(&ReserveNowResponse {
            status: ReservationStatus::Rejected,
        });
    }
    let Some(connector) = cp.connector(request.connector_id) else {
        return OpOutcome::reply(&ReserveNowResponse {
            status: ReservationStatus::Rejected,
        });
    };

    let occupied = connector.has_active_transaction()
        || matches!(
            connector.reported_status(),
            Some(
                ChargePointStatus::Preparing
                    | ChargePointStatus::Charging
                    | ChargePointStatus::SuspendedEV
                    | ChargePointStatus::SuspendedEVSE
                    | ChargePointStatus::Finishing
            )
        );
    let faulted = matches!(connector.reported_status(), Some(ChargePointStatus::Faulted));
    let operative = connector.is_operative(&cp.cfg);
    // A different reservation already pins this connector; the same id may
    // be amended.
    let reserved_by_other = cp
        .reservations
        .active_for(request.connector_id, now)
        .is_some_and(|r| r.reservation_id != request.reservation_id);

    let status = if faulted {
        ReservationStatus::Faulted
    } else if !operative {
        ReservationStatus::Unavailable
    } else if occupied || reserved_by_other {
        ReservationStatus::Occupied
    } else {
        cp.reservations.place(Reservation {
            reservation_id: request.reservation_id,
            connector_id: request.connector_id,
            id_tag: request.id_tag.clone(),
            parent_id_tag: request.parent_id_tag.clone(),
            expiry_date: request.expiry_date,
        });
        ReservationStatus::Accepted
    };

    OpOutcome::reply(&ReserveNowResponse { status })
}
