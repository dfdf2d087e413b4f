//! Reset handler

use chrono::{DateTime, Utc};
use rust_ocpp::v1_6::messages::reset::{ResetRequest, ResetResponse};
use rust_ocpp::v1_6::types::{Reason, ResetRequestStatus, ResetResponseStatus};
use serde_json::Value;
use tracing::{info, warn};

use super::OpOutcome;
use crate::model::{ChargePoint, ResetKind};

pub(crate) fn handle(
    cp: &mut ChargePoint,
    now: DateTime<Utc>,
    now_ms: u64,
    payload: &Value,
) -> OpOutcome {
    let request: ResetRequest = match serde_json::from_value(payload.clone()) {
        Ok(r) => r,
        Err(e) => return OpOutcome::formation_violation(e),
    };

    if cp.on_reset.is_none() {
        warn!(kind = ?request.kind, "Reset rejected: no reset handler installed");
        return OpOutcome::reply(&ResetResponse {
            status: ResetResponseStatus::Rejected,
        });
    }

    let (kind, reason) = match request.kind {
        ResetRequestStatus::Soft => (ResetKind::Soft, Reason::SoftReset),
        ResetRequestStatus::Hard => (ResetKind::Hard, Reason::HardReset),
    };
    info!(?kind, "Reset accepted; stopping transactions");

    cp.reset_requested = Some(kind);
    let connector_ids: Vec<u32> = cp.connectors.iter().map(|c| c.id()).collect();
    for connector_id in connector_ids {
        cp.with_connector_ctx(connector_id, now, now_ms, |connector, ctx| {
            connector.end_transaction(ctx, Some(reason.clone()));
        });
    }

    OpOutcome::reply(&ResetResponse {
        status: ResetResponseStatus::Accepted,
    })
}
