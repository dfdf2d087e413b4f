//! DataTransfer handler (inbound)

use rust_ocpp::v1_6::messages::data_transfer::DataTransferRequest;
use serde_json::Value;
use tracing::info;

use super::OpOutcome;
use crate::model::ChargePoint;

pub(crate) fn handle(cp: &mut ChargePoint, payload: &Value) -> OpOutcome {
    let request: DataTransferRequest = match serde_json::from_value(payload.clone()) {
        Ok(r) => r,
        Err(e) => return OpOutcome::formation_violation(e),
    };

    info!(
        vendor_id = request.vendor_string.as_str(),
        message_id = ?request.message_id,
        "DataTransfer"
    );

    let response = cp.answer_data_transfer(&request);
    OpOutcome::reply(&response)
}
