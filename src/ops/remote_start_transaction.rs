//! RemoteStartTransaction handler

use chrono::{DateTime, Utc};
use rust_ocpp::v1_6::messages::remote_start_transaction::{
    RemoteStartTransactionRequest, RemoteStartTransactionResponse,
};
use rust_ocpp::v1_6::types::RemoteStartStopStatus;
use serde_json::Value;
use tracing::{info, warn};

use super::OpOutcome;
use crate::config::keys;
use crate::model::ChargePoint;

pub(crate) fn handle(
    cp: &mut ChargePoint,
    now: DateTime<Utc>,
    now_ms: u64,
    payload: &Value,
) -> OpOutcome {
    let request: RemoteStartTransactionRequest = match serde_json::from_value(payload.clone()) {
        Ok(r) => r,
        Err(e) => return OpOutcome::formation_violation(e),
    };

    info!(
        connector_id = ?request.connector_id,
        id_tag = request.id_tag.as_str(),
        "RemoteStartTransaction"
    );

    // Without an explicit target, take the first connector not already
    // carrying a session.
    let connector_id = request.connector_id.or_else(|| {
        cp.connectors
            .iter()
            .find(|c| !c.has_active_transaction())
            .map(|c| c.id())
    });

    let authorize_first = cp.cfg.bool_of(keys::AUTHORIZE_REMOTE_TX_REQUESTS);
    let accepted = match connector_id {
        Some(connector_id) => cp
            .with_connector_ctx(connector_id, now, now_ms, |connector, ctx| {
                let result = if authorize_first {
                    connector.begin_transaction(ctx, &request.id_tag)
                } else {
                    connector.begin_transaction_authorized(ctx, &request.id_tag, None)
                };
                match result {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(connector_id, error = %e, "Remote start refused");
                        false
                    }
                }
            })
            .unwrap_or(false),
        None => false,
    };

    let status = if accepted {
        RemoteStartStopStatus::Accepted
    } else {
        RemoteStartStopStatus::Rejected
    };
    OpOutcome::reply(&RemoteStartTransactionResponse { status })
}
