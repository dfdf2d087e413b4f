//! RemoteStopTransaction handler

use chrono::{DateTime, Utc};
use rust_ocpp::v1_6::messages::remote_stop_transaction::{
    RemoteStopTransactionRequest, RemoteStopTransactionResponse,
};
use rust_ocpp::v1_6::types::{Reason, RemoteStartStopStatus};
use serde_json::Value;
use tracing::info;

use super::OpOutcome;
use crate::model::ChargePoint;

pub(crate) fn handle(
    cp: &mut ChargePoint,
    now: DateTime<Utc>,
    now_ms: u64,
    payload: &Value,
) -> OpOutcome {
    let request: RemoteStopTransactionRequest = match serde_json::from_value(payload.clone()) {
        Ok(r) => r,
        Err(e) => return OpOutcome::formation_violation(e),
    };

    info!(transaction_id = request.transaction_id, "RemoteStopTransaction");

    let connector_id = cp
        .connectors
        .iter()
        .find(|c| c.has_active_transaction() && c.transaction_id() == Some(request.transaction_id))
        .map(|c| c.id());

    let accepted = match connector_id {
        Some(connector_id) => cp
            .with_connector_ctx(connector_id, now, now_ms, |connector, ctx| {
                connector.end_transaction(ctx, Some(Reason::Remote))
            })
            .unwrap_or(false),
        None => false,
    };

    let status = if accepted {
        RemoteStartStopStatus::Accepted
    } else {
        RemoteStartStopStatus::Rejected
    };
    OpOutcome::reply(&RemoteStopTransactionResponse { status })
}
