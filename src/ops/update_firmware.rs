//! UpdateFirmware handler

use rust_ocpp::v1_6::messages::update_firmware::UpdateFirmwareRequest;
use serde_json::Value;
use tracing::{info, warn};

use super::OpOutcome;
use crate::model::ChargePoint;

pub(crate) fn handle(cp: &mut ChargePoint, payload: &Value) -> OpOutcome {
    let request: UpdateFirmwareRequest = match serde_json::from_value(payload.clone()) {
        Ok(r) => r,
        Err(e) => return OpOutcome::formation_violation(e),
    };

    info!(
        location = request.location.as_str(),
        retrieve_date = %request.retrieve_date,
        retries = ?request.retries,
        retry_interval = ?request.retry_interval,
        "UpdateFirmware"
    );

    let retries = request.retries.unwrap_or(1).max(1) as u32;
    let retry_interval_s = request.retry_interval.unwrap_or(0).max(0) as u64;
    if let Err(e) = cp.firmware.schedule_firmware_update(
        &request.location,
        request.retrieve_date,
        retries,
        retry_interval_s,
    ) {
        warn!(error = %e, "UpdateFirmware not scheduled");
    }

    // The v1.6 UpdateFirmware response carries no status.
    OpOutcome::Reply(serde_json::json!({}))
}
