//! Transaction lifecycle.
//!
//! A [`Transaction`] is the durable record of one charging session, from the
//! moment an idTag or plug initiates it until StartTransaction and
//! StopTransaction are confirmed by the Central System. The record is written
//! to the [`TransactionStore`](crate::store::TransactionStore) before any
//! network action, survives reboots, and re-drives its outstanding messages
//! after a crash: delivery is at-least-once, keyed by `tx_nr` so the server
//! can suppress duplicates.

use chrono::{DateTime, Utc};
use rust_ocpp::v1_6::messages::start_transaction::StartTransactionRequest;
use rust_ocpp::v1_6::messages::stop_transaction::StopTransactionRequest;
use rust_ocpp::v1_6::types::Reason;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::support::backoff::RetryPolicy;

/// Delivery state of StartTransaction / StopTransaction for one record.
///
/// Ordered as a lattice: `NotSent < Pending < Confirmed`. The stop message
/// can never be further along than the start message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SyncState {
    NotSent,
    Pending,
    Confirmed,
}

/// Authorization outcome attached to a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxAuthorization {
    /// Authorize issued (or about to be), no decision yet.
    Pending,
    /// Central System accepted the idTag.
    Accepted,
    /// Central System rejected the idTag.
    Rejected,
    /// No answer in time; local policy permits the session.
    OfflineAllowed,
    /// No answer in time; local policy forbids the session.
    OfflineBlocked,
}

impl TxAuthorization {
    /// Whether this state permits starting energy delivery.
    pub fn permits_start(self) -> bool {
        matches!(self, Self::Accepted | Self::OfflineAllowed)
    }

    pub fn is_decided(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Outcome of a failed Start/StopTransaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncFailure {
    /// Another attempt is scheduled.
    RetryScheduled,
    /// Retry budget exhausted; the record turns silent and stays local.
    Exhausted,
}

/// Message the transaction wants dispatched this tick.
#[derive(Debug)]
pub enum TxMessage {
    Start(StartTransactionRequest),
    Stop(StopTransactionRequest),
}

/// Gates evaluated by the connector before a transaction may emit messages.
#[derive(Debug, Clone, Copy)]
pub struct TxGates {
    pub now: DateTime<Utc>,
    pub now_ms: u64,
    pub boot_accepted: bool,
    pub start_tx_ready: bool,
    pub stop_tx_ready: bool,
    pub policy: RetryPolicy,
}

/// One charging session, durably recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    connector_id: u32,
    tx_nr: u32,
    id_tag: String,
    parent_id_tag: Option<String>,
    authorization: TxAuthorization,
    active: bool,
    silent: bool,
    reservation_id: Option<i32>,
    begin_timestamp: DateTime<Utc>,
    start_timestamp: Option<DateTime<Utc>>,
    stop_timestamp: Option<DateTime<Utc>>,
    start_meter: Option<i32>,
    stop_meter: Option<i32>,
    start_sync: SyncState,
    start_attempts: u32,
    stop_sync: SyncState,
    stop_attempts: u32,
    transaction_id: Option<i32>,
    stop_reason: Option<Reason>,
    write_count: u32,

    // Volatile driving state; reset on reload so outstanding messages are
    // re-dispatched after a reboot.
    #[serde(skip)]
    dirty: bool,
    #[serde(skip)]
    start_in_flight: bool,
    #[serde(skip)]
    stop_in_flight: bool,
    #[serde(skip)]
    next_start_attempt_ms: u64,
    #[serde(skip)]
    next_stop_attempt_ms: u64,
    #[serde(skip)]
    auth_issued: bool,
}

impl Transaction {
    pub(crate) fn new(
        connector_id: u32,
        tx_nr: u32,
        id_tag: impl Into<String>,
        begin_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            connector_id,
            tx_nr,
            id_tag: id_tag.into(),
            parent_id_tag: None,
            authorization: TxAuthorization::Pending,
            active: true,
            silent: false,
            reservation_id: None,
            begin_timestamp,
            start_timestamp: None,
            stop_timestamp: None,
            start_meter: None,
            stop_meter: None,
            start_sync: SyncState::NotSent,
            start_attempts: 0,
            stop_sync: SyncState::NotSent,
            stop_attempts: 0,
            transaction_id: None,
            stop_reason: None,
            write_count: 0,
            dirty: true,
            start_in_flight: false,
            stop_in_flight: false,
            next_start_attempt_ms: 0,
            next_stop_attempt_ms: 0,
            auth_issued: false,
        }
    }

    fn touch(&mut self) {
        self.write_count = self.write_count.wrapping_add(1);
        self.dirty = true;
    }

    // ── Accessors ──────────────────────────────────────────

    pub fn connector_id(&self) -> u32 {
        self.connector_id
    }

    pub fn tx_nr(&self) -> u32 {
        self.tx_nr
    }

    pub fn id_tag(&self) -> &str {
        &self.id_tag
    }

    pub fn parent_id_tag(&self) -> Option<&str> {
        self.parent_id_tag.as_deref()
    }

    pub fn authorization(&self) -> TxAuthorization {
        self.authorization
    }

    /// Server-assigned id, available once StartTransaction is confirmed.
    pub fn transaction_id(&self) -> Option<i32> {
        self.transaction_id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }

    pub fn begin_timestamp(&self) -> DateTime<Utc> {
        self.begin_timestamp
    }

    pub fn start_recorded(&self) -> bool {
        self.start_timestamp.is_some()
    }

    pub fn stop_recorded(&self) -> bool {
        self.stop_timestamp.is_some()
    }

    /// Energy delivery phase: started, not yet stopped, still active.
    pub fn is_running(&self) -> bool {
        self.active && self.start_recorded() && !self.stop_recorded()
    }

    pub fn start_sync(&self) -> SyncState {
        self.start_sync
    }

    pub fn stop_sync(&self) -> SyncState {
        self.stop_sync
    }

    pub fn stop_reason(&self) -> Option<Reason> {
        self.stop_reason.clone()
    }

    pub fn start_meter(&self) -> Option<i32> {
        self.start_meter
    }

    pub fn stop_meter(&self) -> Option<i32> {
        self.stop_meter
    }

    pub fn write_count(&self) -> u32 {
        self.write_count
    }

    /// Never reached the energy delivery phase and never will: no server
    /// message is owed, the record can be dropped.
    pub fn is_aborted(&self) -> bool {
        !self.active && !self.start_recorded()
    }

    /// Both messages confirmed; the record has served its purpose.
    pub fn is_completed(&self) -> bool {
        self.stop_recorded()
            && self.start_sync == SyncState::Confirmed
            && self.stop_sync == SyncState::Confirmed
    }

    /// Fully conducted without server notification; kept as a local record.
    pub fn is_silent_closed(&self) -> bool {
        self.silent && !self.active
    }

    // ── Mutations ──────────────────────────────────────────

    pub(crate) fn set_parent_id_tag(&mut self, parent: Option<String>) {
        if self.parent_id_tag != parent {
            self.parent_id_tag = parent;
            self.touch();
        }
    }

    pub(crate) fn set_reservation_id(&mut self, reservation_id: i32) {
        self.reservation_id = Some(reservation_id);
        self.touch();
    }

    pub(crate) fn set_authorization(&mut self, authorization: TxAuthorization) {
        if self.authorization != authorization {
            debug!(
                connector_id = self.connector_id,
                tx_nr = self.tx_nr,
                ?authorization,
                "Transaction authorization updated"
            );
            self.authorization = authorization;
            self.touch();
        }
    }

    /// Suppress all server messages for this transaction.
    pub(crate) fn set_silent(&mut self) {
        if !self.silent {
            self.silent = true;
            self.touch();
        }
    }

    /// Record the start event. Rejected (returns `false`) when already
    /// recorded or the session is no longer active.
    pub(crate) fn set_start(&mut self, timestamp: DateTime<Utc>, meter_wh: i32) -> bool {
        if self.start_timestamp.is_some() || !self.active {
            return false;
        }
        self.start_timestamp = Some(timestamp);
        self.start_meter = Some(meter_wh);
        self.touch();
        info!(
            connector_id = self.connector_id,
            tx_nr = self.tx_nr,
            meter_start = meter_wh,
            "Transaction started"
        );
        true
    }

    /// Record the stop event and close the session. Idempotent: a second
    /// call is rejected.
    pub(crate) fn set_stop(
        &mut self,
        timestamp: DateTime<Utc>,
        meter_wh: i32,
        reason: Reason,
    ) -> bool {
        if self.stop_timestamp.is_some() || !self.active {
            return false;
        }
        self.stop_timestamp = Some(timestamp);
        self.stop_meter = Some(meter_wh);
        self.stop_reason = Some(reason);
        self.active = false;
        self.touch();
        info!(
            connector_id = self.connector_id,
            tx_nr = self.tx_nr,
            meter_stop = meter_wh,
            reason = ?self.stop_reason,
            "Transaction stopped"
        );
        true
    }

    /// Close a session that never reached the energy delivery phase. No
    /// server messages result from an aborted transaction.
    pub(crate) fn abort(&mut self) -> bool {
        if !self.active || self.start_recorded() {
            return false;
        }
        self.active = false;
        self.touch();
        debug!(
            connector_id = self.connector_id,
            tx_nr = self.tx_nr,
            "Transaction aborted before start"
        );
        true
    }

    // ── Authorize bookkeeping ──────────────────────────────

    pub(crate) fn auth_issued(&self) -> bool {
        self.auth_issued
    }

    pub(crate) fn mark_auth_issued(&mut self) {
        self.auth_issued = true;
    }

    // ── Message driving ────────────────────────────────────

    /// Produce the next outbound message this record owes the server, if its
    /// preconditions hold. At most one message per call; the caller submits
    /// it and reports the outcome back via `confirm_*` / `fail_*`.
    pub(crate) fn next_message(&mut self, gates: &TxGates) -> Option<TxMessage> {
        if self.silent || !gates.boot_accepted {
            return None;
        }

        // StartTransaction first; stop never overtakes start.
        if self.start_recorded()
            && self.start_sync != SyncState::Confirmed
            && !self.start_in_flight
            && self.authorization.permits_start()
            && gates.start_tx_ready
            && gates.now_ms >= self.next_start_attempt_ms
        {
            if !gates.policy.allows(self.start_attempts) {
                return None;
            }
            self.start_attempts += 1;
            self.start_sync = SyncState::Pending;
            self.start_in_flight = true;
            self.touch();
            return Some(TxMessage::Start(StartTransactionRequest {
                connector_id: self.connector_id,
                id_tag: self.id_tag.clone(),
                meter_start: self.start_meter.unwrap_or(0),
                reservation_id: self.reservation_id,
                timestamp: self.start_timestamp.unwrap_or(gates.now),
            }));
        }

        if self.stop_recorded()
            && self.stop_sync != SyncState::Confirmed
            && !self.stop_in_flight
            && self.start_sync == SyncState::Confirmed
            && gates.stop_tx_ready
            && gates.now_ms >= self.next_stop_attempt_ms
        {
            let Some(transaction_id) = self.transaction_id else {
                return None;
            };
            if !gates.policy.allows(self.stop_attempts) {
                return None;
            }
            self.stop_attempts += 1;
            self.stop_sync = SyncState::Pending;
            self.stop_in_flight = true;
            self.touch();
            return Some(TxMessage::Stop(StopTransactionRequest {
                id_tag: Some(self.id_tag.clone()),
                meter_stop: self.stop_meter.unwrap_or(0),
                reason: self.stop_reason.clone(),
                timestamp: self.stop_timestamp.unwrap_or(gates.now),
                transaction_data: None,
                transaction_id,
            }));
        }

        None
    }

    /// StartTransaction confirmed: adopt the server-assigned id. The id is
    /// assigned exactly once and never changes.
    pub(crate) fn confirm_start(&mut self, transaction_id: i32) {
        self.start_in_flight = false;
        if self.transaction_id.is_some() {
            warn!(
                connector_id = self.connector_id,
                tx_nr = self.tx_nr,
                "Duplicate StartTransaction confirmation ignored"
            );
            return;
        }
        self.transaction_id = Some(transaction_id);
        self.start_sync = SyncState::Confirmed;
        self.touch();
        info!(
            connector_id = self.connector_id,
            tx_nr = self.tx_nr,
            transaction_id,
            "StartTransaction confirmed"
        );
    }

    /// StartTransaction attempt failed (CallError or timeout).
    pub(crate) fn fail_start(&mut self, gates: &TxGates) -> SyncFailure {
        self.start_in_flight = false;
        match gates.policy.delay_after_ms(self.start_attempts) {
            Some(delay) => {
                self.next_start_attempt_ms = gates.now_ms + delay;
                SyncFailure::RetryScheduled
            }
            None => {
                warn!(
                    connector_id = self.connector_id,
                    tx_nr = self.tx_nr,
                    attempts = self.start_attempts,
                    "StartTransaction retries exhausted; keeping record local only"
                );
                self.set_silent();
                SyncFailure::Exhausted
            }
        }
    }

    pub(crate) fn confirm_stop(&mut self) {
        self.stop_in_flight = false;
        if self.stop_sync == SyncState::Confirmed {
            return;
        }
        self.stop_sync = SyncState::Confirmed;
        self.touch();
        info!(
            connector_id = self.connector_id,
            tx_nr = self.tx_nr,
            transaction_id = self.transaction_id,
            "StopTransaction confirmed"
        );
    }

    pub(crate) fn fail_stop(&mut self, gates: &TxGates) -> SyncFailure {
        self.stop_in_flight = false;
        match gates.policy.delay_after_ms(self.stop_attempts) {
            Some(delay) => {
                self.next_stop_attempt_ms = gates.now_ms + delay;
                SyncFailure::RetryScheduled
            }
            None => {
                warn!(
                    connector_id = self.connector_id,
                    tx_nr = self.tx_nr,
                    attempts = self.stop_attempts,
                    "StopTransaction retries exhausted; keeping record local only"
                );
                self.set_silent();
                SyncFailure::Exhausted
            }
        }
    }

    // ── Persistence ────────────────────────────────────────

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_committed(&mut self) {
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn gates(now_ms: u64) -> TxGates {
        TxGates {
            now: base_time(),
            now_ms,
            boot_accepted: true,
            start_tx_ready: true,
            stop_tx_ready: true,
            policy: RetryPolicy::new(3, 10),
        }
    }

    fn tx() -> Transaction {
        Transaction::new(1, 1, "TAG01", base_time())
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let mut t = tx();
        assert!(t.set_start(base_time(), 1000));
        assert!(!t.set_start(base_time(), 2000));
        assert_eq!(t.start_meter(), Some(1000));

        assert!(t.set_stop(base_time(), 5500, Reason::EVDisconnected));
        assert!(!t.set_stop(base_time(), 9999, Reason::Local));
        assert_eq!(t.stop_meter(), Some(5500));
        assert!(!t.is_active());
    }

    #[test]
    fn no_messages_before_authorization() {
        let mut t = tx();
        t.set_start(base_time(), 1000);
        assert!(t.next_message(&gates(0)).is_none());

        t.set_authorization(TxAuthorization::Accepted);
        assert!(matches!(
            t.next_message(&gates(0)),
            Some(TxMessage::Start(_))
        ));
    }

    #[test]
    fn stop_never_overtakes_start() {
        let mut t = tx();
        t.set_authorization(TxAuthorization::Accepted);
        t.set_start(base_time(), 1000);
        t.set_stop(base_time(), 2000, Reason::Local);

        // First message out is the start.
        let Some(TxMessage::Start(start)) = t.next_message(&gates(0)) else {
            panic!("expected StartTransaction first");
        };
        assert_eq!(start.meter_start, 1000);

        // Start still pending: no stop yet.
        assert!(t.next_message(&gates(0)).is_none());

        t.confirm_start(42);
        let Some(TxMessage::Stop(stop)) = t.next_message(&gates(0)) else {
            panic!("expected StopTransaction after confirmation");
        };
        assert_eq!(stop.transaction_id, 42);
        assert_eq!(stop.meter_stop, 2000);

        t.confirm_stop();
        assert!(t.is_completed());
    }

    #[test]
    fn aborted_transaction_emits_nothing() {
        let mut t = tx();
        assert!(t.abort());
        assert!(t.is_aborted());
        assert!(t.next_message(&gates(0)).is_none());
    }

    #[test]
    fn silent_transaction_emits_nothing() {
        let mut t = tx();
        t.set_authorization(TxAuthorization::OfflineAllowed);
        t.set_silent();
        t.set_start(base_time(), 100);
        t.set_stop(base_time(), 200, Reason::EVDisconnected);
        assert!(t.next_message(&gates(0)).is_none());
        assert!(t.is_silent_closed());
        assert_eq!(t.stop_reason(), Some(Reason::EVDisconnected));
    }

    #[test]
    fn start_failure_schedules_linear_retries_then_goes_silent() {
        let mut t = tx();
        t.set_authorization(TxAuthorization::Accepted);
        t.set_start(base_time(), 0);

        // Attempt 1.
        assert!(t.next_message(&gates(0)).is_some());
        assert_eq!(t.fail_start(&gates(0)), SyncFailure::RetryScheduled);

        // Retry gated until the scheduled delay (1 * 10 s) has elapsed.
        assert!(t.next_message(&gates(5_000)).is_none());
        assert!(t.next_message(&gates(10_000)).is_some());
        assert_eq!(t.fail_start(&gates(10_000)), SyncFailure::RetryScheduled);

        // Attempt 3 is the last allowed by the policy.
        assert!(t.next_message(&gates(40_000)).is_some());
        assert_eq!(t.fail_start(&gates(40_000)), SyncFailure::Exhausted);
        assert!(t.is_silent());
        assert!(t.next_message(&gates(100_000)).is_none());
    }

    #[test]
    fn transaction_id_is_assigned_exactly_once() {
        let mut t = tx();
        t.set_authorization(TxAuthorization::Accepted);
        t.set_start(base_time(), 0);
        let _ = t.next_message(&gates(0));
        t.confirm_start(7);
        t.confirm_start(9);
        assert_eq!(t.transaction_id(), Some(7));
    }

    #[test]
    fn record_roundtrips_through_serde() {
        let mut t = tx();
        t.set_authorization(TxAuthorization::Accepted);
        t.set_start(base_time(), 1000);
        let _ = t.next_message(&gates(0));
        t.confirm_start(42);

        let json = serde_json::to_string(&t).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tx_nr(), t.tx_nr());
        assert_eq!(back.transaction_id(), Some(42));
        assert_eq!(back.start_sync(), SyncState::Confirmed);
        // Volatile flags reset: an outstanding stop would be re-driven.
        assert!(!back.start_in_flight);
    }

    proptest! {
        /// write_count never decreases and the sync lattice is respected
        /// under arbitrary interleavings of lifecycle calls.
        #[test]
        fn invariants_hold_under_random_ops(ops in proptest::collection::vec(0u8..6, 0..40)) {
            let mut t = tx();
            let mut last_write_count = t.write_count();
            for op in ops {
                match op {
                    0 => { t.set_authorization(TxAuthorization::Accepted); }
                    1 => { let _ = t.set_start(base_time(), 100); }
                    2 => { let _ = t.set_stop(base_time(), 200, Reason::Local); }
                    3 => { let _ = t.next_message(&gates(0)); }
                    4 => { if t.start_sync() == SyncState::Pending { t.confirm_start(1); } }
                    5 => { if t.stop_sync() == SyncState::Pending { t.confirm_stop(); } }
                    _ => unreachable!(),
                }
                prop_assert!(t.write_count() >= last_write_count);
                last_write_count = t.write_count();
                prop_assert!(t.stop_sync() <= t.start_sync());
            }
        }
    }
}
