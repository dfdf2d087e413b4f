//! Inbound operation handlers.
//!
//! One module per OCPP action, each parsing the payload into the
//! `rust_ocpp` request type, acting on the model and answering with the
//! typed response. The dispatch table below is the operation registry:
//! unknown actions answer with a `NotImplemented` CallError.

mod cancel_reservation;
mod change_availability;
mod change_configuration;
mod data_transfer;
mod get_configuration;
mod remote_start_transaction;
mod remote_stop_transaction;
mod reserve_now;
mod reset;
mod trigger_message;
mod unlock_connector;
mod update_firmware;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::model::ChargePoint;

/// What to answer an inbound Call with.
pub(crate) enum OpOutcome {
    /// CallResult with this payload.
    Reply(Value),
    /// CallError.
    Error {
        code: &'static str,
        description: String,
    },
    /// Answer deferred: the unlock callback is re-polled on later ticks.
    UnlockPending { connector_id: u32 },
}

impl OpOutcome {
    fn reply<T: serde::Serialize>(response: &T) -> Self {
        Self::Reply(serde_json::to_value(response).unwrap_or_default())
    }

    fn formation_violation(e: serde_json::Error) -> Self {
        Self::Error {
            code: "FormationViolation",
            description: e.to_string(),
        }
    }
}

/// Route an inbound Call to its handler.
pub(crate) fn dispatch(
    cp: &mut ChargePoint,
    now: DateTime<Utc>,
    now_ms: u64,
    action: &str,
    payload: &Value,
) -> OpOutcome {
    match action {
        "RemoteStartTransaction" => remote_start_transaction::handle(cp, now, now_ms, payload),
        "RemoteStopTransaction" => remote_stop_transaction::handle(cp, now, now_ms, payload),
        "ChangeAvailability" => change_availability::handle(cp, payload),
        "ChangeConfiguration" => change_configuration::handle(cp, payload),
        "GetConfiguration" => get_configuration::handle(cp, payload),
        "Reset" => reset::handle(cp, now, now_ms, payload),
        "UnlockConnector" => unlock_connector::handle(cp, now, now_ms, payload),
        "UpdateFirmware" => update_firmware::handle(cp, payload),
        "TriggerMessage" => trigger_message::handle(cp, now_ms, payload),
        "ReserveNow" => reserve_now::handle(cp, now, payload),
        "CancelReservation" => cancel_reservation::handle(cp, payload),
        "DataTransfer" => data_transfer::handle(cp, payload),
        other => {
            warn!(action = other, "Unsupported inbound action");
            OpOutcome::Error {
                code: "NotImplemented",
                description: format!("Action {other} is not supported"),
            }
        }
    }
}
