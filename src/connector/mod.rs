//! Per-outlet state machine.
//!
//! Each tick a connector samples its hardware inputs, drives the session it
//! may be carrying (authorization, start/stop messages, meter values), infers
//! its OCPP status and reports it to the Central System once the debounce
//! window has passed. All work per tick is bounded; anything that has to
//! wait is picked up again on a later tick.

pub mod io;

pub use io::{ConnectorIo, ConnectorIoBuilder, PollResult};

use rust_ocpp::v1_6::messages::meter_values::MeterValuesRequest;
use rust_ocpp::v1_6::messages::status_notification::StatusNotificationRequest;
use rust_ocpp::v1_6::types::{
    ChargePointErrorCode, ChargePointStatus, IdTagInfo, Location, Measurand, MeterValue, Reason,
    ReadingContext, SampledValue, UnitOfMeasure, ValueFormat,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{keys, ConfigValue, ConfigurationStore};
use crate::model::dispatch::{PendingOp, TickCtx};
use crate::support::backoff::RetryPolicy;
use crate::support::errors::{CoreError, CoreResult};
use crate::transaction::{SyncFailure, Transaction, TxAuthorization, TxGates, TxMessage};
use crate::transport::{DEFAULT_REQUEST_TIMEOUT, METER_VALUES_TIMEOUT};

/// Administrative availability of a connector. Persisted across reboots;
/// the volatile overlay (see [`Connector::set_availability_volatile`]) is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Inoperative,
    /// Inoperative requested while a transaction runs; takes effect once the
    /// connector is transaction-free.
    InoperativeScheduled,
    Operative,
}

impl Availability {
    fn from_persisted(raw: i64) -> Self {
        match raw {
            0 => Self::Inoperative,
            1 => Self::InoperativeScheduled,
            _ => Self::Operative,
        }
    }

    fn persisted(self) -> i64 {
        match self {
            Self::Inoperative => 0,
            Self::InoperativeScheduled => 1,
            Self::Operative => 2,
        }
    }
}

/// Outcome of a `ChangeAvailability` request against one connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityChange {
    Accepted,
    Scheduled,
}

/// Per-outlet session lifecycle and status reporting.
pub struct Connector {
    id: u32,
    io: ConnectorIo,
    /// Volatile inoperative overlay; cleared by a restart.
    volatile_inoperative: bool,
    /// Session currently owning the outlet.
    transaction: Option<Transaction>,
    /// Finished sessions still owing messages to the server, oldest first.
    draining: Vec<Transaction>,

    reported: Option<(ChargePointStatus, ChargePointErrorCode)>,
    candidate: Option<(ChargePointStatus, ChargePointErrorCode)>,
    candidate_since_ms: u64,
    trigger_status: bool,

    preparing_since_ms: Option<u64>,
    preparing_timed_out: bool,

    prev_plugged: bool,
    free_vend_track_plugged: bool,

    pending_meter_values: Vec<MeterValue>,
    last_meter_sample_ms: u64,
    trigger_meter: bool,

    /// Deadline for the offline authorization decision when no Authorize
    /// request could be submitted (silent transaction or boot not accepted).
    auth_deadline_ms: Option<u64>,
}

impl Connector {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            io: ConnectorIo::default(),
            volatile_inoperative: false,
            transaction: None,
            draining: Vec::new(),
            reported: None,
            candidate: None,
            candidate_since_ms: 0,
            trigger_status: false,
            preparing_since_ms: None,
            preparing_timed_out: false,
            prev_plugged: false,
            free_vend_track_plugged: false,
            pending_meter_values: Vec::new(),
            last_meter_sample_ms: 0,
            trigger_meter: false,
            auth_deadline_ms: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Install the whole capability bundle at once.
    pub fn set_io(&mut self, io: ConnectorIo) {
        self.io = io;
    }

    // Piecemeal capability setters; effective from the next tick.

    pub fn set_connector_plugged_sampler(&mut self, f: impl FnMut() -> bool + 'static) {
        self.io.connector_plugged = Box::new(f);
    }

    pub fn set_ev_requests_energy_sampler(&mut self, f: impl FnMut() -> bool + 'static) {
        self.io.ev_requests_energy = Box::new(f);
    }

    pub fn set_connector_energized_sampler(&mut self, f: impl FnMut() -> bool + 'static) {
        self.io.connector_energized = Box::new(f);
    }

    pub fn add_connector_error_code_sampler(&mut self, f: impl FnMut() -> String + 'static) {
        self.io.error_code_samplers.push(Box::new(f));
    }

    pub fn set_on_unlock_connector(&mut self, f: impl FnMut() -> PollResult<bool> + 'static) {
        self.io.on_unlock = Some(Box::new(f));
    }

    pub fn set_start_tx_ready_input(&mut self, f: impl FnMut() -> bool + 'static) {
        self.io.start_tx_ready = Box::new(f);
    }

    pub fn set_stop_tx_ready_input(&mut self, f: impl FnMut() -> bool + 'static) {
        self.io.stop_tx_ready = Box::new(f);
    }

    pub fn set_occupied_input(&mut self, f: impl FnMut() -> bool + 'static) {
        self.io.occupied = Box::new(f);
    }

    pub fn set_energy_meter_sampler(&mut self, f: impl FnMut() -> i32 + 'static) {
        self.io.energy_meter = Some(Box::new(f));
    }

    pub fn set_power_meter_sampler(&mut self, f: impl FnMut() -> f64 + 'static) {
        self.io.power_meter = Some(Box::new(f));
    }

    // ── Session queries ────────────────────────────────────

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub fn is_transaction_running(&self) -> bool {
        self.transaction.as_ref().is_some_and(Transaction::is_running)
    }

    pub(crate) fn has_active_transaction(&self) -> bool {
        self.transaction.as_ref().is_some_and(Transaction::is_active)
    }

    /// Server-assigned id of the current session, once known.
    pub fn transaction_id(&self) -> Option<i32> {
        self.transaction.as_ref().and_then(Transaction::transaction_id)
    }

    /// Last status reported to the Central System.
    pub fn reported_status(&self) -> Option<ChargePointStatus> {
        self.reported.as_ref().map(|(status, _)| status.clone())
    }

    /// Force a StatusNotification on the next tick, bypassing the debounce.
    pub(crate) fn trigger_status_notification(&mut self) {
        self.trigger_status = true;
    }

    /// Force a meter sample on the next tick (TriggerMessage).
    pub(crate) fn trigger_meter_values(&mut self) {
        self.trigger_meter = true;
    }

    pub(crate) fn has_energy_meter(&self) -> bool {
        self.io.energy_meter.is_some()
    }

    pub(crate) fn poll_unlock(&mut self) -> Option<PollResult<bool>> {
        self.io.on_unlock.as_mut().map(|f| f())
    }

    pub(crate) fn has_unlock_capability(&self) -> bool {
        self.io.on_unlock.is_some()
    }

    // ── Availability ───────────────────────────────────────

    fn persisted_availability(&self, cfg: &ConfigurationStore) -> Availability {
        Availability::from_persisted(cfg.int_of(&keys::availability_key(self.id)))
    }

    fn write_availability(&self, cfg: &mut ConfigurationStore, availability: Availability) {
        cfg.store_internal(
            &keys::availability_key(self.id),
            ConfigValue::Int(availability.persisted()),
        );
    }

    pub(crate) fn is_operative(&self, cfg: &ConfigurationStore) -> bool {
        !self.volatile_inoperative
            && self.persisted_availability(cfg) != Availability::Inoperative
    }

    /// Change the persisted availability. Returns `Scheduled` when the change
    /// has to wait for the running transaction to finish.
    pub(crate) fn set_availability(
        &mut self,
        cfg: &mut ConfigurationStore,
        available: bool,
    ) -> AvailabilityChange {
        if available {
            self.write_availability(cfg, Availability::Operative);
            AvailabilityChange::Accepted
        } else if self.has_active_transaction() {
            self.write_availability(cfg, Availability::InoperativeScheduled);
            AvailabilityChange::Scheduled
        } else {
            self.write_availability(cfg, Availability::Inoperative);
            AvailabilityChange::Accepted
        }
    }

    /// Inoperative overlay that does not survive a restart.
    pub fn set_availability_volatile(&mut self, available: bool) {
        self.volatile_inoperative = !available;
    }

    // ── Transaction entry points ───────────────────────────

    /// Begin the transaction process with an idTag that still needs
    /// authorization. Returns the durable `tx_nr` of the new record.
    pub(crate) fn begin_transaction(
        &mut self,
        ctx: &mut TickCtx,
        id_tag: &str,
    ) -> CoreResult<u32> {
        self.begin_internal(ctx, id_tag, None, false)
    }

    /// Begin with an idTag that is already authorized (remote start with
    /// pre-authorization, free-vend).
    pub(crate) fn begin_transaction_authorized(
        &mut self,
        ctx: &mut TickCtx,
        id_tag: &str,
        parent_id_tag: Option<&str>,
    ) -> CoreResult<u32> {
        self.begin_internal(ctx, id_tag, parent_id_tag, true)
    }

    fn begin_internal(
        &mut self,
        ctx: &mut TickCtx,
        id_tag: &str,
        parent_id_tag: Option<&str>,
        authorized: bool,
    ) -> CoreResult<u32> {
        if id_tag.is_empty() {
            return Err(CoreError::InvalidInput("idTag must not be empty"));
        }
        if id_tag.chars().count() > 20 {
            return Err(CoreError::IdTagTooLong(id_tag.to_string()));
        }
        if self.has_active_transaction() {
            return Err(CoreError::TransactionAlreadyActive(self.id));
        }
        if self.sample_error_code().is_some() {
            return Err(CoreError::InvalidInput("connector is faulted"));
        }
        if !self.is_operative(ctx.cfg) {
            return Err(CoreError::InvalidInput("connector is inoperative"));
        }

        let reservation_id = match ctx.reservations.active_for(self.id, ctx.now) {
            Some(reservation) if !reservation.matches(id_tag, parent_id_tag) => {
                return Err(CoreError::InvalidInput("connector is reserved"));
            }
            Some(_) => ctx.reservations.consume(self.id, id_tag, parent_id_tag, ctx.now),
            None => None,
        };

        // Park a finished predecessor that still owes messages.
        if let Some(prior) = self.transaction.take() {
            self.draining.push(prior);
        }
        self.pending_meter_values.clear();

        let tx_nr = ctx.store.next_tx_nr(self.id);
        let mut tx = Transaction::new(self.id, tx_nr, id_tag, ctx.now);
        if let Some(parent) = parent_id_tag {
            tx.set_parent_id_tag(Some(parent.to_string()));
        }
        if let Some(reservation_id) = reservation_id {
            tx.set_reservation_id(reservation_id);
        }
        if authorized {
            tx.set_authorization(TxAuthorization::Accepted);
        }
        if !ctx.online() && ctx.cfg.bool_of(keys::SILENT_OFFLINE_TRANSACTIONS) {
            tx.set_silent();
        }

        // Durably written before any network action.
        if !ctx.store.save(&tx) {
            return Err(CoreError::StoreRejected);
        }
        tx.mark_committed();

        info!(
            connector_id = self.id,
            tx_nr,
            id_tag,
            authorized,
            silent = tx.is_silent(),
            "Transaction process begins"
        );
        self.transaction = Some(tx);
        self.preparing_timed_out = false;
        self.auth_deadline_ms = None;
        Ok(tx_nr)
    }

    /// Produce a detached transaction that bypasses this connector's driver.
    /// Used for replay and testing; the record still consumes a durable
    /// ordinal so it never collides with live sessions.
    pub(crate) fn allocate_transaction(&mut self, ctx: &mut TickCtx) -> Transaction {
        let tx_nr = ctx.store.next_tx_nr(self.id);
        Transaction::new(self.id, tx_nr, "", ctx.now)
    }

    /// End the current transaction process, if one exists and has not ended
    /// yet. Safe to call at any time.
    pub(crate) fn end_transaction(
        &mut self,
        ctx: &mut TickCtx,
        reason: Option<Reason>,
    ) -> bool {
        let meter = self.io.energy_wh();
        let Some(tx) = self.transaction.as_mut().filter(|t| t.is_active()) else {
            return false;
        };
        let acted = if tx.start_recorded() {
            tx.set_stop(ctx.now, meter, reason.unwrap_or(Reason::Local))
        } else {
            tx.abort()
        };
        ctx.commit(tx);
        acted
    }

    /// Restore a persisted session on boot. The recovery decision (resume,
    /// or stop because the EV left during the outage) falls on the first
    /// tick, when samplers are trustworthy again.
    pub(crate) fn adopt_restored(&mut self, tx: Transaction) {
        if tx.is_active() {
            if self.transaction.is_some() {
                warn!(connector_id = self.id, tx_nr = tx.tx_nr(), "Dropping duplicate active record");
                return;
            }
            info!(connector_id = self.id, tx_nr = tx.tx_nr(), "Restored active transaction");
            self.transaction = Some(tx);
        } else {
            self.draining.push(tx);
        }
    }

    // ── Tick ───────────────────────────────────────────────

    pub(crate) fn loop_tick(&mut self, ctx: &mut TickCtx) {
        let plugged = self.io.plugged();
        let plug_released = self.prev_plugged && !plugged;
        self.prev_plugged = plugged;
        if !plugged {
            self.free_vend_track_plugged = false;
            if self.preparing_timed_out {
                self.preparing_timed_out = false;
            }
        }
        let meter_now = self.io.energy_wh();
        let error_code = self.sample_error_code();

        self.promote_scheduled_availability(ctx);
        self.handle_ev_disconnect(ctx, plugged, plug_released, meter_now);

        // Hardware fault ends a running session immediately.
        if error_code.is_some() {
            if let Some(tx) = self.transaction.as_mut().filter(|t| t.is_running()) {
                warn!(connector_id = self.id, "Fault during transaction; stopping");
                tx.set_stop(ctx.now, meter_now, Reason::Other);
                ctx.commit(tx);
            }
        }

        self.drive_free_vend(ctx, plugged, &error_code);
        self.drive_authorization(ctx);
        self.drive_session_start(ctx, plugged, meter_now);
        self.advance_messages(ctx);
        self.sample_meter_values(ctx);
        self.release_finished(ctx);

        let mut inferred = self.infer_status(ctx, plugged, &error_code);
        inferred = self.apply_connection_timeout(ctx, inferred, &error_code, plugged);
        self.drive_status_report(ctx, inferred);

        if let Some(tx) = self.transaction.as_mut() {
            ctx.commit(tx);
        }
    }

    fn promote_scheduled_availability(&mut self, ctx: &mut TickCtx) {
        if self.persisted_availability(ctx.cfg) == Availability::InoperativeScheduled
            && !self.has_active_transaction()
        {
            self.write_availability(ctx.cfg, Availability::Inoperative);
        }
    }

    /// Level-based: also catches a session restored after a reboot whose EV
    /// left during the outage (no edge to observe).
    fn handle_ev_disconnect(
        &mut self,
        ctx: &mut TickCtx,
        plugged: bool,
        plug_released: bool,
        meter_now: i32,
    ) {
        if plugged {
            return;
        }
        let stop_on_disconnect = ctx.cfg.bool_of(keys::STOP_TRANSACTION_ON_EV_SIDE_DISCONNECT);
        let unlock_on_disconnect = ctx.cfg.bool_of(keys::UNLOCK_CONNECTOR_ON_EV_SIDE_DISCONNECT);

        let Some(tx) = self.transaction.as_mut() else {
            return;
        };
        if tx.is_running() {
            if stop_on_disconnect {
                info!(connector_id = self.id, "EV-side disconnect; stopping transaction");
                tx.set_stop(ctx.now, meter_now, Reason::EVDisconnected);
                ctx.commit(tx);
            }
            if plug_released && unlock_on_disconnect {
                if let Some(unlock) = self.io.on_unlock.as_mut() {
                    match unlock() {
                        PollResult::Ready(false) => {
                            warn!(connector_id = self.id, "Unlock on disconnect failed")
                        }
                        _ => debug!(connector_id = self.id, "Unlock on disconnect issued"),
                    }
                }
            }
        } else if plug_released && tx.is_active() && !tx.start_recorded() {
            // Plug removed before the session ever started.
            tx.abort();
            ctx.commit(tx);
        }
    }

    fn drive_free_vend(
        &mut self,
        ctx: &mut TickCtx,
        plugged: bool,
        error_code: &Option<ChargePointErrorCode>,
    ) {
        if !plugged || self.free_vend_track_plugged {
            return;
        }
        // Arm once per plug-in edge, whether or not a session starts.
        self.free_vend_track_plugged = true;

        if !ctx.cfg.bool_of(keys::FREE_VEND_ACTIVE)
            || self.has_active_transaction()
            || error_code.is_some()
        {
            return;
        }
        let id_tag = ctx.cfg.string_of(keys::FREE_VEND_ID_TAG);
        if id_tag.is_empty() {
            warn!(connector_id = self.id, "FreeVendActive without FreeVendIdTag");
            return;
        }
        match self.begin_transaction_authorized(ctx, &id_tag, None) {
            Ok(tx_nr) => info!(connector_id = self.id, tx_nr, "Free-vend transaction"),
            Err(e) => warn!(connector_id = self.id, error = %e, "Free-vend start failed"),
        }
    }

    fn drive_authorization(&mut self, ctx: &mut TickCtx) {
        let Some(tx) = self.transaction.as_mut() else {
            return;
        };
        if !tx.is_active() || tx.authorization() != TxAuthorization::Pending {
            return;
        }

        if !tx.auth_issued() {
            // Local pre-authorization from the cache skips the round-trip.
            if ctx.cfg.bool_of(keys::LOCAL_PRE_AUTHORIZE) {
                if let Some(hit) = ctx.auth_cache.accepted(tx.id_tag(), ctx.now) {
                    info!(
                        connector_id = self.id,
                        id_tag = tx.id_tag(),
                        "Local pre-authorization"
                    );
                    let parent = hit.parent_id_tag.clone();
                    tx.set_parent_id_tag(parent);
                    tx.set_authorization(TxAuthorization::Accepted);
                    ctx.commit(tx);
                    return;
                }
            }

            tx.mark_auth_issued();
            let timeout_s = ctx.cfg.int_of(keys::AUTHORIZATION_TIMEOUT).max(1) as u64;
            if tx.is_silent() {
                // No Authorize will ever be sent; decide after the timeout.
                self.auth_deadline_ms = Some(ctx.now_ms + timeout_s * 1000);
            } else if ctx.boot_accepted {
                let payload = serde_json::json!({ "idTag": tx.id_tag() });
                ctx.submit(
                    PendingOp::Authorize {
                        connector_id: self.id,
                    },
                    "Authorize",
                    payload,
                    std::time::Duration::from_secs(timeout_s),
                );
            } else {
                // Cannot reach the server before boot acceptance; run the
                // offline decision timer locally.
                self.auth_deadline_ms = Some(ctx.now_ms + timeout_s * 1000);
            }
            return;
        }

        if let Some(deadline) = self.auth_deadline_ms {
            if ctx.now_ms >= deadline {
                self.auth_deadline_ms = None;
                self.on_authorize_timeout(ctx);
            }
        }
    }

    fn drive_session_start(&mut self, ctx: &mut TickCtx, plugged: bool, meter_now: i32) {
        let Some(tx) = self.transaction.as_mut() else {
            return;
        };
        if tx.is_active()
            && !tx.start_recorded()
            && plugged
            && tx.authorization().permits_start()
        {
            tx.set_start(ctx.now, meter_now);
            ctx.commit(tx);
            self.last_meter_sample_ms = ctx.now_ms;
        }
    }

    fn tx_gates(&mut self, ctx: &TickCtx) -> TxGates {
        TxGates {
            now: ctx.now,
            now_ms: ctx.now_ms,
            boot_accepted: ctx.boot_accepted,
            start_tx_ready: (self.io.start_tx_ready)(),
            stop_tx_ready: (self.io.stop_tx_ready)(),
            policy: RetryPolicy::new(
                ctx.cfg.int_of(keys::TRANSACTION_MESSAGE_ATTEMPTS).max(1) as u32,
                ctx.cfg.int_of(keys::TRANSACTION_MESSAGE_RETRY_INTERVAL).max(0) as u64,
            ),
        }
    }

    fn advance_messages(&mut self, ctx: &mut TickCtx) {
        let gates = self.tx_gates(ctx);

        // Oldest finished session first, then the live one; stop for n never
        // overtakes start for n, and older ordinals drain before newer ones.
        if let Some(front) = self.draining.first_mut() {
            if let Some(message) = front.next_message(&gates) {
                let (op, action, payload) = Self::describe(self.id, front, message);
                ctx.submit(op, action, payload, DEFAULT_REQUEST_TIMEOUT);
            }
            ctx.commit(front);
        }

        if let Some(tx) = self.transaction.as_mut() {
            if let Some(message) = tx.next_message(&gates) {
                let (op, action, payload) = Self::describe(self.id, tx, message);
                ctx.submit(op, action, payload, DEFAULT_REQUEST_TIMEOUT);
            }
            ctx.commit(tx);
        }
    }

    fn describe(
        connector_id: u32,
        tx: &Transaction,
        message: TxMessage,
    ) -> (PendingOp, &'static str, Value) {
        match message {
            TxMessage::Start(request) => (
                PendingOp::StartTransaction {
                    connector_id,
                    tx_nr: tx.tx_nr(),
                },
                "StartTransaction",
                serde_json::to_value(&request).unwrap_or_default(),
            ),
            TxMessage::Stop(request) => (
                PendingOp::StopTransaction {
                    connector_id,
                    tx_nr: tx.tx_nr(),
                },
                "StopTransaction",
                serde_json::to_value(&request).unwrap_or_default(),
            ),
        }
    }

    fn sample_meter_values(&mut self, ctx: &mut TickCtx) {
        let interval_s = ctx.cfg.int_of(keys::METER_VALUE_SAMPLE_INTERVAL);
        let Some(tx) = self.transaction.as_ref() else {
            return;
        };
        if !tx.is_running() || tx.is_silent() {
            return;
        }

        let forced = std::mem::take(&mut self.trigger_meter);
        let due = forced
            || (interval_s > 0
                && ctx.now_ms - self.last_meter_sample_ms >= interval_s as u64 * 1000);
        if due && self.io.energy_meter.is_some() {
            self.last_meter_sample_ms = ctx.now_ms;
            let mut sampled = Vec::new();
            if let Some(meter) = self.io.energy_meter.as_mut() {
                sampled.push(SampledValue {
                    context: Some(ReadingContext::SamplePeriodic),
                    format: Some(ValueFormat::Raw),
                    location: Some(Location::Outlet),
                    measurand: Some(Measurand::EnergyActiveImportRegister),
                    phase: None,
                    unit: Some(UnitOfMeasure::Wh),
                    value: meter().to_string(),
                });
            }
            if let Some(power) = self.io.power_meter.as_mut() {
                sampled.push(SampledValue {
                    context: Some(ReadingContext::SamplePeriodic),
                    format: Some(ValueFormat::Raw),
                    location: Some(Location::Outlet),
                    measurand: Some(Measurand::PowerActiveImport),
                    phase: None,
                    unit: Some(UnitOfMeasure::W),
                    value: power().to_string(),
                });
            }
            self.pending_meter_values.push(MeterValue {
                timestamp: ctx.now,
                sampled_value: sampled,
            });
        }

        // Samples are held back until the server has assigned the
        // transaction id, then flushed in order.
        if self.pending_meter_values.is_empty() || !ctx.boot_accepted {
            return;
        }
        let Some(transaction_id) = tx.transaction_id() else {
            return;
        };
        let request = MeterValuesRequest {
            connector_id: self.id,
            meter_value: std::mem::take(&mut self.pending_meter_values),
            transaction_id: Some(transaction_id),
        };
        ctx.submit(
            PendingOp::MeterValues {
                connector_id: self.id,
            },
            "MeterValues",
            serde_json::to_value(&request).unwrap_or_default(),
            METER_VALUES_TIMEOUT,
        );
    }

    fn release_finished(&mut self, ctx: &mut TickCtx) {
        while let Some(front) = self.draining.first() {
            if front.is_completed() || front.is_aborted() {
                ctx.store.remove(front.connector_id(), front.tx_nr());
                self.draining.remove(0);
            } else if front.is_silent_closed() {
                // Local record retained; nothing more to send.
                self.draining.remove(0);
            } else {
                break;
            }
        }

        let release = match self.transaction.as_ref() {
            Some(tx) if tx.is_completed() || tx.is_aborted() => {
                ctx.store.remove(tx.connector_id(), tx.tx_nr());
                true
            }
            Some(tx) if tx.is_silent_closed() => true,
            _ => false,
        };
        if release {
            self.transaction = None;
            self.pending_meter_values.clear();
            self.auth_deadline_ms = None;
        }
    }

    // ── Status inference and reporting ─────────────────────

    fn sample_error_code(&mut self) -> Option<ChargePointErrorCode> {
        for sampler in &mut self.io.error_code_samplers {
            let raw = sampler();
            if raw.is_empty() || raw == "NoError" {
                continue;
            }
            return Some(
                serde_json::from_value(Value::String(raw.clone()))
                    .unwrap_or(ChargePointErrorCode::OtherError),
            );
        }
        None
    }

    /// Compute the current status from inputs and transaction state.
    /// Priority order: fault, unavailability, reservation, transaction
    /// phases, occupation, idle.
    fn infer_status(
        &mut self,
        ctx: &TickCtx,
        plugged: bool,
        error_code: &Option<ChargePointErrorCode>,
    ) -> (ChargePointStatus, ChargePointErrorCode) {
        if let Some(code) = error_code {
            return (ChargePointStatus::Faulted, code.clone());
        }

        let running = self
            .transaction
            .as_ref()
            .is_some_and(Transaction::is_running);
        if !self.is_operative(ctx.cfg) && !running {
            return (ChargePointStatus::Unavailable, ChargePointErrorCode::NoError);
        }

        if self.transaction.is_none() && ctx.reservations.active_for(self.id, ctx.now).is_some()
        {
            return (ChargePointStatus::Reserved, ChargePointErrorCode::NoError);
        }

        let occupied = (self.io.occupied)();

        if let Some(tx) = self.transaction.as_ref() {
            if tx.is_running() {
                let ev_requests = (self.io.ev_requests_energy)();
                let energized = (self.io.connector_energized)();
                let status = if ev_requests && energized {
                    ChargePointStatus::Charging
                } else if !ev_requests && plugged {
                    ChargePointStatus::SuspendedEV
                } else if !energized {
                    ChargePointStatus::SuspendedEVSE
                } else {
                    ChargePointStatus::SuspendedEV
                };
                return (status, ChargePointErrorCode::NoError);
            }
            if tx.stop_recorded() && (plugged || occupied) {
                return (ChargePointStatus::Finishing, ChargePointErrorCode::NoError);
            }
        }

        let session_pending = self
            .transaction
            .as_ref()
            .is_some_and(|t| t.is_active() && !t.start_recorded());
        if (plugged || occupied || session_pending) && !self.preparing_timed_out {
            return (ChargePointStatus::Preparing, ChargePointErrorCode::NoError);
        }

        (ChargePointStatus::Available, ChargePointErrorCode::NoError)
    }

    /// Abort sessions idling in Preparing past `ConnectionTimeOut`. A zero
    /// timeout disables the mechanism.
    fn apply_connection_timeout(
        &mut self,
        ctx: &mut TickCtx,
        inferred: (ChargePointStatus, ChargePointErrorCode),
        error_code: &Option<ChargePointErrorCode>,
        plugged: bool,
    ) -> (ChargePointStatus, ChargePointErrorCode) {
        if inferred.0 != ChargePointStatus::Preparing {
            self.preparing_since_ms = None;
            return inferred;
        }

        let since = *self.preparing_since_ms.get_or_insert(ctx.now_ms);
        let timeout_s = ctx.cfg.int_of(keys::CONNECTION_TIME_OUT);
        if timeout_s <= 0 || ctx.now_ms - since < timeout_s as u64 * 1000 {
            return inferred;
        }

        info!(connector_id = self.id, "Connection timeout in Preparing");
        if let Some(tx) = self.transaction.as_mut() {
            if tx.is_active() && !tx.start_recorded() {
                tx.abort();
                ctx.commit(tx);
            }
        }
        self.preparing_timed_out = true;
        self.preparing_since_ms = None;
        self.infer_status(ctx, plugged, error_code)
    }

    fn drive_status_report(
        &mut self,
        ctx: &mut TickCtx,
        inferred: (ChargePointStatus, ChargePointErrorCode),
    ) {
        if self.candidate.as_ref() != Some(&inferred) {
            self.candidate = Some(inferred);
            self.candidate_since_ms = ctx.now_ms;
        }
        if !ctx.boot_accepted {
            return;
        }
        let Some(candidate) = self.candidate.clone() else {
            return;
        };

        let force = self.trigger_status;
        if self.reported.as_ref() == Some(&candidate) && !force {
            return;
        }

        let min_duration_s = ctx.cfg.int_of(keys::MINIMUM_STATUS_DURATION).max(0) as u64;
        let held_long_enough = ctx.now_ms - self.candidate_since_ms >= min_duration_s * 1000;
        // The first report after boot goes out immediately.
        if !(force || self.reported.is_none() || min_duration_s == 0 || held_long_enough) {
            return;
        }
        self.trigger_status = false;

        let request = StatusNotificationRequest {
            connector_id: self.id,
            error_code: candidate.1.clone(),
            info: None,
            status: candidate.0.clone(),
            timestamp: Some(ctx.now),
            vendor_error_code: None,
            vendor_id: None,
        };
        debug!(
            connector_id = self.id,
            status = ?request.status,
            error_code = ?request.error_code,
            "StatusNotification"
        );
        ctx.submit(
            PendingOp::StatusNotification {
                connector_id: self.id,
            },
            "StatusNotification",
            serde_json::to_value(&request).unwrap_or_default(),
            DEFAULT_REQUEST_TIMEOUT,
        );
        self.reported = Some(candidate);
    }

    // ── Response routing (called by the model) ─────────────

    pub(crate) fn on_authorize_result(&mut self, ctx: &mut TickCtx, info: &IdTagInfo) {
        self.auth_deadline_ms = None;
        let Some(tx) = self.transaction.as_mut().filter(|t| t.is_active()) else {
            return;
        };
        if tx.authorization() != TxAuthorization::Pending {
            return;
        }
        ctx.auth_cache.update(tx.id_tag(), info);
        if info.status == rust_ocpp::v1_6::types::AuthorizationStatus::Accepted {
            tx.set_parent_id_tag(info.parent_id_tag.clone());
            tx.set_authorization(TxAuthorization::Accepted);
        } else {
            info!(
                connector_id = self.id,
                status = ?info.status,
                "Authorization rejected"
            );
            tx.set_authorization(TxAuthorization::Rejected);
            tx.abort();
        }
        ctx.commit(tx);
    }

    /// No Authorize answer within `AuthorizationTimeout`: decide locally.
    pub(crate) fn on_authorize_timeout(&mut self, ctx: &mut TickCtx) {
        let allow_unknown = ctx.cfg.bool_of(keys::ALLOW_OFFLINE_TX_FOR_UNKNOWN_ID);
        let Some(tx) = self.transaction.as_mut().filter(|t| t.is_active()) else {
            return;
        };
        if tx.authorization() != TxAuthorization::Pending {
            return;
        }

        let decision = match ctx.auth_cache.lookup(tx.id_tag()) {
            Some(cached) if cached.is_accepted(ctx.now) => TxAuthorization::OfflineAllowed,
            Some(_) => TxAuthorization::OfflineBlocked,
            None if allow_unknown => TxAuthorization::OfflineAllowed,
            None => TxAuthorization::OfflineBlocked,
        };
        info!(
            connector_id = self.id,
            id_tag = tx.id_tag(),
            ?decision,
            "Authorize timed out; offline decision"
        );
        tx.set_authorization(decision);
        if decision == TxAuthorization::OfflineBlocked {
            tx.abort();
        }
        ctx.commit(tx);
    }

    pub(crate) fn on_start_tx_result(
        &mut self,
        ctx: &mut TickCtx,
        tx_nr: u32,
        transaction_id: i32,
        info: &IdTagInfo,
    ) {
        let stop_on_invalid = ctx.cfg.bool_of(keys::STOP_TRANSACTION_ON_INVALID_ID);
        let meter_now = self.io.energy_wh();
        let Some(tx) = self.tx_by_nr(tx_nr) else {
            return;
        };
        tx.confirm_start(transaction_id);
        ctx.auth_cache.update(tx.id_tag(), info);

        if info.status != rust_ocpp::v1_6::types::AuthorizationStatus::Accepted {
            warn!(
                connector_id = tx.connector_id(),
                tx_nr,
                status = ?info.status,
                "idTag rejected on StartTransaction"
            );
            tx.set_authorization(TxAuthorization::Rejected);
            if stop_on_invalid && tx.is_running() {
                tx.set_stop(ctx.now, meter_now, Reason::DeAuthorized);
            }
        }
        ctx.commit(tx);
    }

    /// StartTransaction failed. A definitive protocol rejection deauthorizes
    /// the session; a transient failure retries with backoff.
    pub(crate) fn on_start_tx_failure(&mut self, ctx: &mut TickCtx, tx_nr: u32, definitive: bool) {
        let gates = self.tx_gates(ctx);
        let meter_now = self.io.energy_wh();
        let Some(tx) = self.tx_by_nr(tx_nr) else {
            return;
        };
        if definitive {
            warn!(
                connector_id = tx.connector_id(),
                tx_nr, "StartTransaction definitively rejected; ending session"
            );
            tx.set_silent();
            if tx.is_running() {
                tx.set_stop(ctx.now, meter_now, Reason::DeAuthorized);
            } else if tx.is_active() {
                tx.abort();
            }
        } else if tx.fail_start(&gates) == SyncFailure::Exhausted && tx.is_running() {
            // Keep charging; the session is recorded locally only.
            debug!(connector_id = tx.connector_id(), tx_nr, "Session continues silently");
        }
        ctx.commit(tx);
    }

    pub(crate) fn on_stop_tx_result(&mut self, ctx: &mut TickCtx, tx_nr: u32) {
        let Some(tx) = self.tx_by_nr(tx_nr) else {
            return;
        };
        tx.confirm_stop();
        ctx.commit(tx);
    }

    pub(crate) fn on_stop_tx_failure(&mut self, ctx: &mut TickCtx, tx_nr: u32, definitive: bool) {
        let gates = self.tx_gates(ctx);
        let Some(tx) = self.tx_by_nr(tx_nr) else {
            return;
        };
        if definitive {
            warn!(
                connector_id = tx.connector_id(),
                tx_nr, "StopTransaction definitively rejected; record stays local"
            );
            tx.set_silent();
        } else {
            tx.fail_stop(&gates);
        }
        ctx.commit(tx);
    }

    fn tx_by_nr(&mut self, tx_nr: u32) -> Option<&mut Transaction> {
        if self
            .transaction
            .as_ref()
            .is_some_and(|t| t.tx_nr() == tx_nr)
        {
            return self.transaction.as_mut();
        }
        self.draining.iter_mut().find(|t| t.tx_nr() == tx_nr)
    }
}
