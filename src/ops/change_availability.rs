//! ChangeAvailability handler

use rust_ocpp::v1_6::messages::change_availability::{
    ChangeAvailabilityRequest, ChangeAvailabilityResponse,
};
use rust_ocpp::v1_6::types::{AvailabilityStatus, AvailabilityType};
use serde_json::Value;
use tracing::info;

use super::OpOutcome;
use crate::connector::AvailabilityChange;
use crate::model::ChargePoint;

pub(crate) fn handle(cp: &mut ChargePoint, payload: &Value) -> OpOutcome {
    let request: ChangeAvailabilityRequest = match serde_json::from_value(payload.clone()) {
        Ok(r) => r,
        Err(e) => return OpOutcome::formation_violation(e),
    };

    info!(
        connector_id = request.connector_id,
        kind = ?request.kind,
        "ChangeAvailability"
    );
    let available = request.kind == AvailabilityType::Operative;

    // Connector 0 addresses the whole charge point.
    let connectors = &mut cp.connectors;
    let cfg = &mut cp.cfg;
    let mut matched = false;
    let mut scheduled = false;
    for connector in connectors.iter_mut() {
        if request.connector_id != 0 && connector.id() != request.connector_id {
            continue;
        }
        matched = true;
        if connector.set_availability(cfg, available) == AvailabilityChange::Scheduled {
            scheduled = true;
        }
    }

    let status = if !matched {
        AvailabilityStatus::Rejected
    } else if scheduled {
        AvailabilityStatus::Scheduled
    } else {
        AvailabilityStatus::Accepted
    };
    OpOutcome::reply(&ChangeAvailabilityResponse { status })
}
