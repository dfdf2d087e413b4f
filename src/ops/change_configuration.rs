//! ChangeConfiguration handler

use rust_ocpp::v1_6::messages::change_configuration::{
    ChangeConfigurationRequest, ChangeConfigurationResponse,
};
use rust_ocpp::v1_6::types::ConfigurationStatus;
use serde_json::Value;
use tracing::info;

use super::OpOutcome;
use crate::config::ConfigWriteOutcome;
use crate::model::ChargePoint;

pub(crate) fn handle(cp: &mut ChargePoint, payload: &Value) -> OpOutcome {
    let request: ChangeConfigurationRequest = match serde_json::from_value(payload.clone()) {
        Ok(r) => r,
        Err(e) => return OpOutcome::formation_violation(e),
    };

    let outcome = cp.cfg.set_from_string(&request.key, &request.value);
    info!(
        key = request.key.as_str(),
        value = request.value.as_str(),
        ?outcome,
        "ChangeConfiguration"
    );

    let status = match outcome {
        ConfigWriteOutcome::Accepted => ConfigurationStatus::Accepted,
        ConfigWriteOutcome::Rejected => ConfigurationStatus::Rejected,
        ConfigWriteOutcome::NotSupported => ConfigurationStatus::NotSupported,
    };
    OpOutcome::reply(&ChangeConfigurationResponse { status })
}
