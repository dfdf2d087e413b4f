//! UnlockConnector handler

use chrono::{DateTime, Utc};
use rust_ocpp::v1_6::messages::unlock_connector::{
    UnlockConnectorRequest, UnlockConnectorResponse,
};
use rust_ocpp::v1_6::types::{Reason, UnlockStatus};
use serde_json::Value;
use tracing::info;

use super::OpOutcome;
use crate::connector::{Connector, PollResult};
use crate::model::ChargePoint;

pub(crate) fn handle(
    cp: &mut ChargePoint,
    now: DateTime<Utc>,
    now_ms: u64,
    payload: &Value,
) -> OpOutcome {
    let request: UnlockConnectorRequest = match serde_json::from_value(payload.clone()) {
        Ok(r) => r,
        Err(e) => return OpOutcome::formation_violation(e),
    };
    let connector_id = request.connector_id;

    let has_unlock = match cp.connector(connector_id) {
        Some(connector) => connector.has_unlock_capability(),
        None => {
            return OpOutcome::Error {
                code: "PropertyConstraintViolation",
                description: format!("No connector {connector_id}"),
            }
        }
    };
    if !has_unlock {
        return OpOutcome::reply(&UnlockConnectorResponse {
            status: UnlockStatus::NotSupported,
        });
    }

    info!(connector_id, "UnlockConnector");

    // An unlock ends any running session first.
    cp.with_connector_ctx(connector_id, now, now_ms, |connector, ctx| {
        connector.end_transaction(ctx, Some(Reason::UnlockCommand));
    });

    match cp.connector_mut(connector_id).and_then(Connector::poll_unlock) {
        Some(PollResult::Ready(true)) => OpOutcome::reply(&UnlockConnectorResponse {
            status: UnlockStatus::Unlocked,
        }),
        Some(PollResult::Ready(false)) => OpOutcome::reply(&UnlockConnectorResponse {
            status: UnlockStatus::UnlockFailed,
        }),
        Some(PollResult::Pending) => OpOutcome::UnlockPending { connector_id },
        None => OpOutcome::reply(&UnlockConnectorResponse {
            status: UnlockStatus::NotSupported,
        }),
    }
}
