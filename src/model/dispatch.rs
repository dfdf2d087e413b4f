//! Message-dispatch substrate.
//!
//! Every outbound Call is registered here before it goes to the transport:
//! the pending map ties the unique message id to its originator so the
//! CallResult, CallError or timeout can be routed back. Unique ids come from
//! a plain counter, which keeps replay deterministic under test.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::config::ConfigurationStore;
use crate::model::auth_cache::AuthorizationCache;
use crate::model::reservations::ReservationBook;
use crate::store::TransactionStore;
use crate::transaction::Transaction;
use crate::transport::{OutboundCall, Transport};

/// Originator of an in-flight Call, for routing the outcome back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingOp {
    BootNotification,
    Heartbeat,
    Authorize { connector_id: u32 },
    StartTransaction { connector_id: u32, tx_nr: u32 },
    StopTransaction { connector_id: u32, tx_nr: u32 },
    MeterValues { connector_id: u32 },
    StatusNotification { connector_id: u32 },
    FirmwareStatusNotification,
    DataTransfer,
}

#[derive(Debug)]
struct PendingCall {
    op: PendingOp,
    deadline_ms: u64,
}

/// Pending-call registry plus unique id generation.
pub(crate) struct Dispatcher {
    pending: HashMap<String, PendingCall>,
    next_id: u64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            next_id: 1,
        }
    }

    /// Register and submit a Call; returns its unique id.
    pub fn submit(
        &mut self,
        transport: &mut dyn Transport,
        now_ms: u64,
        op: PendingOp,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> String {
        let unique_id = format!("vg-{}", self.next_id);
        self.next_id += 1;
        self.pending.insert(
            unique_id.clone(),
            PendingCall {
                op,
                deadline_ms: now_ms + timeout.as_millis() as u64,
            },
        );
        debug!(unique_id = unique_id.as_str(), action, "Submitting request");
        transport.submit(OutboundCall {
            unique_id: unique_id.clone(),
            action: action.to_string(),
            payload,
            timeout,
        });
        unique_id
    }

    /// Resolve a reply: removes and returns the originator.
    pub fn take(&mut self, unique_id: &str) -> Option<PendingOp> {
        self.pending.remove(unique_id).map(|p| p.op)
    }

    /// Drain every call whose timeout has expired.
    pub fn take_expired(&mut self, now_ms: u64) -> Vec<PendingOp> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now_ms >= p.deadline_ms)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|p| p.op))
            .collect()
    }

    pub fn has_in_flight(&self, op: PendingOp) -> bool {
        self.pending.values().any(|p| p.op == op)
    }
}

/// Borrowed view of the shared services, handed into every `loop_tick` call.
///
/// No component stores a back-pointer; whatever a state machine needs for one
/// tick arrives here and is gone when the tick ends.
pub(crate) struct TickCtx<'a> {
    pub now: DateTime<Utc>,
    pub now_ms: u64,
    pub boot_accepted: bool,
    pub cfg: &'a mut ConfigurationStore,
    pub transport: &'a mut dyn Transport,
    pub store: &'a mut dyn TransactionStore,
    pub dispatcher: &'a mut Dispatcher,
    pub auth_cache: &'a mut AuthorizationCache,
    pub reservations: &'a mut ReservationBook,
}

impl TickCtx<'_> {
    pub fn online(&self) -> bool {
        self.transport.is_online()
    }

    pub fn submit(
        &mut self,
        op: PendingOp,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> String {
        self.dispatcher
            .submit(self.transport, self.now_ms, op, action, payload, timeout)
    }

    /// Persist a transaction if it changed since the last commit.
    pub fn commit(&mut self, tx: &mut Transaction) {
        if tx.is_dirty() && self.store.save(tx) {
            tx.mark_committed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    #[test]
    fn submit_take_roundtrip() {
        let mut transport = MemoryTransport::new();
        let mut dispatcher = Dispatcher::new();

        let id = dispatcher.submit(
            &mut transport,
            0,
            PendingOp::Heartbeat,
            "Heartbeat",
            json!({}),
            Duration::from_secs(30),
        );
        assert_eq!(transport.sent_actions(), vec!["Heartbeat"]);
        assert!(dispatcher.has_in_flight(PendingOp::Heartbeat));

        assert_eq!(dispatcher.take(&id), Some(PendingOp::Heartbeat));
        assert_eq!(dispatcher.take(&id), None);
    }

    #[test]
    fn expiry_drains_only_overdue_calls() {
        let mut transport = MemoryTransport::new();
        let mut dispatcher = Dispatcher::new();

        dispatcher.submit(
            &mut transport,
            0,
            PendingOp::Heartbeat,
            "Heartbeat",
            json!({}),
            Duration::from_secs(10),
        );
        dispatcher.submit(
            &mut transport,
            0,
            PendingOp::MeterValues { connector_id: 1 },
            "MeterValues",
            json!({}),
            Duration::from_secs(120),
        );

        let expired = dispatcher.take_expired(30_000);
        assert_eq!(expired, vec![PendingOp::Heartbeat]);
        assert!(dispatcher.take_expired(30_000).is_empty());
        assert!(!dispatcher.has_in_flight(PendingOp::Heartbeat));
    }

    #[test]
    fn unique_ids_are_sequential() {
        let mut transport = MemoryTransport::new();
        let mut dispatcher = Dispatcher::new();
        let a = dispatcher.submit(
            &mut transport,
            0,
            PendingOp::Heartbeat,
            "Heartbeat",
            json!({}),
            Duration::from_secs(30),
        );
        let b = dispatcher.submit(
            &mut transport,
            0,
            PendingOp::Heartbeat,
            "Heartbeat",
            json!({}),
            Duration::from_secs(30),
        );
        assert_eq!(a, "vg-1");
        assert_eq!(b, "vg-2");
    }
}
