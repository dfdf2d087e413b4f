//! TriggerMessage handler

use rust_ocpp::v1_6::messages::trigger_message::{TriggerMessageRequest, TriggerMessageResponse};
use rust_ocpp::v1_6::types::{MessageTrigger, TriggerMessageStatus};
use serde_json::Value;
use tracing::info;

use super::OpOutcome;
use crate::model::ChargePoint;

pub(crate) fn handle(cp: &mut ChargePoint, now_ms: u64, payload: &Value) -> OpOutcome {
    let request: TriggerMessageRequest = match serde_json::from_value(payload.clone()) {
        Ok(r) => r,
        Err(e) => return OpOutcome::formation_violation(e),
    };

    info!(
        requested = ?request.requested_message,
        connector_id = ?request.connector_id,
        "TriggerMessage"
    );

    if let Some(connector_id) = request.connector_id {
        if cp.connector(connector_id).is_none() {
            return OpOutcome::reply(&TriggerMessageResponse {
                status: TriggerMessageStatus::Rejected,
            });
        }
    }

    let status = match request.requested_message {
        MessageTrigger::BootNotification => {
            cp.submit_boot_notification(now_ms);
            TriggerMessageStatus::Accepted
        }
        MessageTrigger::Heartbeat => {
            cp.trigger_heartbeat = true;
            TriggerMessageStatus::Accepted
        }
        MessageTrigger::StatusNotification => {
            for connector in cp.connectors.iter_mut() {
                if request.connector_id.is_none() || request.connector_id == Some(connector.id())
                {
                    connector.trigger_status_notification();
                }
            }
            TriggerMessageStatus::Accepted
        }
        MessageTrigger::MeterValues => {
            let mut any = false;
            for connector in cp.connectors.iter_mut() {
                if (request.connector_id.is_none()
                    || request.connector_id == Some(connector.id()))
                    && connector.has_energy_meter()
                {
                    connector.trigger_meter_values();
                    any = true;
                }
            }
            if any {
                TriggerMessageStatus::Accepted
            } else {
                TriggerMessageStatus::NotImplemented
            }
        }
        MessageTrigger::FirmwareStatusNotification => {
            cp.firmware.trigger_status_notification();
            TriggerMessageStatus::Accepted
        }
        MessageTrigger::DiagnosticsStatusNotification => TriggerMessageStatus::NotImplemented,
    };

    OpOutcome::reply(&TriggerMessageResponse { status })
}
