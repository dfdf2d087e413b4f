//! CancelReservation handler

use rust_ocpp::v1_6::messages::cancel_reservation::{
    CancelReservationRequest, CancelReservationResponse,
};
use rust_ocpp::v1_6::types::CancelReservationStatus;
use serde_json::Value;
use tracing::info;

use super::OpOutcome;
use crate::model::ChargePoint;

pub(crate) fn handle(cp: &mut ChargePoint, payload: &Value) -> OpOutcome {
    let request: CancelReservationRequest = match serde_json::from_value(payload.clone()) {
        Ok(r) => r,
        Err(e) => return OpOutcome::formation_violation(e),
    };

    info!(reservation_id = request.reservation_id, "CancelReservation");

    let status = if cp.reservations.cancel(request.reservation_id) {
        CancelReservationStatus::Accepted
    } else {
        CancelReservationStatus::Rejected
    };
    OpOutcome::reply(&CancelReservationResponse { status })
}
