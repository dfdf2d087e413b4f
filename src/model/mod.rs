//! Charge point model.
//!
//! [`ChargePoint`] is the owning root: it holds the connectors, the firmware
//! service, the configuration, the reservation book and the transport, and
//! fans a host-driven `tick()` out to all of them. Components never store
//! back-references; each tick they receive a [`dispatch::TickCtx`] with
//! borrowed handles to the shared services.

pub(crate) mod auth_cache;
pub(crate) mod dispatch;
pub(crate) mod reservations;

pub use reservations::Reservation;

use std::rc::Rc;

use chrono::{DateTime, Utc};
use rust_ocpp::v1_6::messages::authorize::AuthorizeResponse;
use rust_ocpp::v1_6::messages::boot_notification::{
    BootNotificationRequest, BootNotificationResponse,
};
use rust_ocpp::v1_6::messages::data_transfer::{DataTransferRequest, DataTransferResponse};
use rust_ocpp::v1_6::messages::heart_beat::HeartbeatRequest;
use rust_ocpp::v1_6::messages::start_transaction::StartTransactionResponse;
use rust_ocpp::v1_6::types::{DataTransferStatus, Reason, RegistrationStatus, UnlockStatus};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{keys, ConfigWriteOutcome, ConfigurationStore, KeyValueStore, MemoryKeyValueStore};
use crate::connector::Connector;
use crate::firmware::FirmwareService;
use crate::model::auth_cache::AuthorizationCache;
use crate::model::dispatch::{Dispatcher, PendingOp, TickCtx};
use crate::model::reservations::ReservationBook;
use crate::ops;
use crate::store::{MemoryTransactionStore, TransactionStore};
use crate::support::clock::{Clock, SystemClock};
use crate::support::errors::{CoreError, CoreResult};
use crate::support::frame::OcppFrame;
use crate::transaction::Transaction;
use crate::transport::{MemoryTransport, Transport, DEFAULT_REQUEST_TIMEOUT};
use crate::connector::io::PollResult;

/// How long an UnlockConnector handler may stay Pending before the
/// operation is answered with UnlockFailed.
const UNLOCK_POLL_TIMEOUT_MS: u64 = 5_000;

/// Timeout and fallback retry interval for BootNotification.
const BOOT_TIMEOUT_S: u64 = 60;

/// Identity reported in BootNotification.
#[derive(Debug, Clone)]
pub struct BootInfo {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    pub charge_point_serial_number: Option<String>,
    pub charge_box_serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub iccid: Option<String>,
    pub imsi: Option<String>,
    pub meter_serial_number: Option<String>,
    pub meter_type: Option<String>,
}

impl BootInfo {
    pub fn new(vendor: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            charge_point_vendor: vendor.into(),
            charge_point_model: model.into(),
            charge_point_serial_number: None,
            charge_box_serial_number: None,
            firmware_version: None,
            iccid: None,
            imsi: None,
            meter_serial_number: None,
            meter_type: None,
        }
    }
}

/// Reset flavor requested by the Central System.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Soft,
    Hard,
}

#[derive(Debug)]
struct BootState {
    accepted: bool,
    in_flight: bool,
    next_attempt_ms: u64,
}

struct PendingUnlock {
    unique_id: String,
    connector_id: u32,
    deadline_ms: u64,
}

/// The owning root of the library. Drive it with [`ChargePoint::tick`] from
/// a host loop with a small period (≤ 100 ms recommended).
pub struct ChargePoint {
    pub(crate) clock: Rc<dyn Clock>,
    pub(crate) cfg: ConfigurationStore,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) store: Box<dyn TransactionStore>,
    pub(crate) connectors: Vec<Connector>,
    pub(crate) firmware: FirmwareService,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) auth_cache: AuthorizationCache,
    pub(crate) reservations: ReservationBook,
    boot_info: BootInfo,
    boot: BootState,
    heartbeat_last_ms: u64,
    pub(crate) trigger_heartbeat: bool,
    pending_unlock: Option<PendingUnlock>,
    pub(crate) reset_requested: Option<ResetKind>,
    pub(crate) on_reset: Option<Box<dyn FnMut(ResetKind)>>,
    pub(crate) on_data_transfer: Option<Box<dyn FnMut(&DataTransferRequest) -> DataTransferResponse>>,
}

/// Builder wiring the external collaborators. Everything not supplied falls
/// back to an in-memory implementation suitable for development and testing.
pub struct ChargePointBuilder {
    boot_info: BootInfo,
    connector_count: u32,
    clock: Option<Rc<dyn Clock>>,
    transport: Option<Box<dyn Transport>>,
    store: Option<Box<dyn TransactionStore>>,
    kv: Option<Box<dyn KeyValueStore>>,
    build_number: Option<String>,
}

impl ChargePointBuilder {
    pub fn new(boot_info: BootInfo, connector_count: u32) -> Self {
        Self {
            boot_info,
            connector_count,
            clock: None,
            transport: None,
            store: None,
            kv: None,
            build_number: None,
        }
    }

    pub fn clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn transaction_store(mut self, store: Box<dyn TransactionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn key_value_store(mut self, kv: Box<dyn KeyValueStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn build_number(mut self, build_number: impl Into<String>) -> Self {
        self.build_number = Some(build_number.into());
        self
    }

    pub fn build(self) -> ChargePoint {
        let connector_count = self.connector_count.max(1);
        let mut cfg = ConfigurationStore::new(
            self.kv.unwrap_or_else(|| Box::new(MemoryKeyValueStore::new())),
        );
        keys::register_defaults(&mut cfg, connector_count);

        let mut auth_cache = AuthorizationCache::new();
        auth_cache.set_enabled(cfg.bool_of(keys::AUTHORIZATION_CACHE_ENABLED));

        let mut firmware = FirmwareService::new();
        if let Some(build_number) = self.build_number {
            firmware.set_build_number(build_number);
        }

        let mut store = self
            .store
            .unwrap_or_else(|| Box::new(MemoryTransactionStore::new()));

        // Replay persisted sessions; incomplete ones resume their message
        // driving, finished ones are cleaned up or left as local records.
        let mut connectors: Vec<Connector> =
            (1..=connector_count).map(Connector::new).collect();
        for connector in connectors.iter_mut() {
            let connector_id = connector.id();
            for tx in store.load_all(connector_id) {
                if tx.is_completed() || tx.is_aborted() {
                    store.remove(connector_id, tx.tx_nr());
                } else if tx.is_silent_closed() {
                    // Retained local record; nothing left to drive.
                } else {
                    connector.adopt_restored(tx);
                }
            }
        }

        ChargePoint {
            clock: self.clock.unwrap_or_else(|| Rc::new(SystemClock::new())),
            cfg,
            transport: self
                .transport
                .unwrap_or_else(|| Box::new(MemoryTransport::new())),
            store,
            connectors,
            firmware,
            dispatcher: Dispatcher::new(),
            auth_cache,
            reservations: ReservationBook::new(),
            boot_info: self.boot_info,
            boot: BootState {
                accepted: false,
                in_flight: false,
                next_attempt_ms: 0,
            },
            heartbeat_last_ms: 0,
            trigger_heartbeat: false,
            pending_unlock: None,
            reset_requested: None,
            on_reset: None,
            on_data_transfer: None,
        }
    }
}

impl ChargePoint {
    pub fn builder(boot_info: BootInfo, connector_count: u32) -> ChargePointBuilder {
        ChargePointBuilder::new(boot_info, connector_count)
    }

    // ── Host API ───────────────────────────────────────────

    /// One scheduler round: pump inbound traffic, expire requests, then give
    /// every state machine a bounded slice of work.
    pub fn tick(&mut self) {
        let now_ms = self.clock.millis();
        let now = self.clock.now();

        self.auth_cache
            .set_enabled(self.cfg.bool_of(keys::AUTHORIZATION_CACHE_ENABLED));
        self.process_inbound(now, now_ms);
        self.process_timeouts(now, now_ms);
        self.drive_boot(now_ms);
        self.drive_heartbeat(now_ms);
        self.reservations.purge_expired(now);

        let boot_accepted = self.boot.accepted;
        {
            let Self {
                connectors,
                cfg,
                transport,
                store,
                dispatcher,
                auth_cache,
                reservations,
                firmware,
                ..
            } = self;
            let mut ctx = TickCtx {
                now,
                now_ms,
                boot_accepted,
                cfg,
                transport: transport.as_mut(),
                store: store.as_mut(),
                dispatcher,
                auth_cache,
                reservations,
            };
            for connector in connectors.iter_mut() {
                connector.loop_tick(&mut ctx);
            }
            let any_tx_active = connectors.iter().any(Connector::has_active_transaction);
            if boot_accepted {
                firmware.loop_tick(&mut ctx, any_tx_active);
            }
        }

        self.poll_pending_unlock(now_ms);
        self.wind_down_reset();
    }

    pub fn is_boot_accepted(&self) -> bool {
        self.boot.accepted
    }

    pub fn connector(&self, connector_id: u32) -> Option<&Connector> {
        self.connectors.iter().find(|c| c.id() == connector_id)
    }

    pub fn connector_mut(&mut self, connector_id: u32) -> Option<&mut Connector> {
        self.connectors.iter_mut().find(|c| c.id() == connector_id)
    }

    pub fn connector_count(&self) -> u32 {
        self.connectors.len() as u32
    }

    pub fn firmware(&self) -> &FirmwareService {
        &self.firmware
    }

    pub fn firmware_mut(&mut self) -> &mut FirmwareService {
        &mut self.firmware
    }

    pub fn configuration(&self) -> &ConfigurationStore {
        &self.cfg
    }

    /// Host-side configuration write; same validation as
    /// `ChangeConfiguration` from the Central System.
    pub fn configure(&mut self, key: &str, value: &str) -> ConfigWriteOutcome {
        self.cfg.set_from_string(key, value)
    }

    /// Install the reboot handler; `Reset` requests are rejected without one.
    pub fn set_on_reset(&mut self, f: impl FnMut(ResetKind) + 'static) {
        self.on_reset = Some(Box::new(f));
    }

    /// Answer inbound DataTransfer requests. Without a handler they are
    /// rejected with `UnknownVendorId`.
    pub fn set_on_data_transfer(
        &mut self,
        f: impl FnMut(&DataTransferRequest) -> DataTransferResponse + 'static,
    ) {
        self.on_data_transfer = Some(Box::new(f));
    }

    /// Queue an outbound DataTransfer request.
    pub fn data_transfer(
        &mut self,
        vendor_id: &str,
        message_id: Option<&str>,
        data: Option<&str>,
    ) {
        let request = DataTransferRequest {
            vendor_string: vendor_id.to_string(),
            message_id: message_id.map(str::to_string),
            data: data.map(str::to_string),
        };
        let now_ms = self.clock.millis();
        self.dispatcher.submit(
            self.transport.as_mut(),
            now_ms,
            PendingOp::DataTransfer,
            "DataTransfer",
            serde_json::to_value(&request).unwrap_or_default(),
            DEFAULT_REQUEST_TIMEOUT,
        );
    }

    /// Begin the transaction process on a connector; leads to a
    /// StartTransaction once plug and authorization are both present.
    pub fn begin_transaction(&mut self, connector_id: u32, id_tag: &str) -> CoreResult<u32> {
        let (now, now_ms) = self.now();
        self.with_connector_ctx(connector_id, now, now_ms, |c, ctx| {
            c.begin_transaction(ctx, id_tag)
        })
        .unwrap_or(Err(CoreError::ConnectorOutOfBounds(connector_id)))
    }

    /// Begin with an already-authorized idTag.
    pub fn begin_transaction_authorized(
        &mut self,
        connector_id: u32,
        id_tag: &str,
        parent_id_tag: Option<&str>,
    ) -> CoreResult<u32> {
        let (now, now_ms) = self.now();
        self.with_connector_ctx(connector_id, now, now_ms, |c, ctx| {
            c.begin_transaction_authorized(ctx, id_tag, parent_id_tag)
        })
        .unwrap_or(Err(CoreError::ConnectorOutOfBounds(connector_id)))
    }

    /// End the current transaction process on a connector, if any.
    pub fn end_transaction(&mut self, connector_id: u32, reason: Option<Reason>) -> bool {
        let (now, now_ms) = self.now();
        self.with_connector_ctx(connector_id, now, now_ms, |c, ctx| {
            c.end_transaction(ctx, reason)
        })
        .unwrap_or(false)
    }

    /// Detached transaction outside the connector driver, for replay and
    /// testing.
    pub fn allocate_transaction(&mut self, connector_id: u32) -> Option<Transaction> {
        let (now, now_ms) = self.now();
        self.with_connector_ctx(connector_id, now, now_ms, |c, ctx| {
            c.allocate_transaction(ctx)
        })
    }

    /// Persisted availability change, as if by `ChangeAvailability`.
    pub fn set_availability(&mut self, connector_id: u32, available: bool) -> bool {
        let Self { connectors, cfg, .. } = self;
        match connectors.iter_mut().find(|c| c.id() == connector_id) {
            Some(connector) => {
                connector.set_availability(cfg, available);
                true
            }
            None => false,
        }
    }

    fn now(&self) -> (DateTime<Utc>, u64) {
        (self.clock.now(), self.clock.millis())
    }

    // ── Shared-context plumbing ────────────────────────────

    pub(crate) fn with_connector_ctx<R>(
        &mut self,
        connector_id: u32,
        now: DateTime<Utc>,
        now_ms: u64,
        f: impl FnOnce(&mut Connector, &mut TickCtx) -> R,
    ) -> Option<R> {
        let boot_accepted = self.boot.accepted;
        let Self {
            connectors,
            cfg,
            transport,
            store,
            dispatcher,
            auth_cache,
            reservations,
            ..
        } = self;
        let connector = connectors.iter_mut().find(|c| c.id() == connector_id)?;
        let mut ctx = TickCtx {
            now,
            now_ms,
            boot_accepted,
            cfg,
            transport: transport.as_mut(),
            store: store.as_mut(),
            dispatcher,
            auth_cache,
            reservations,
        };
        Some(f(connector, &mut ctx))
    }

    // ── Inbound traffic ────────────────────────────────────

    fn process_inbound(&mut self, now: DateTime<Utc>, now_ms: u64) {
        loop {
            let Some(frame) = self.transport.poll() else {
                break;
            };
            match frame {
                OcppFrame::Call {
                    unique_id,
                    action,
                    payload,
                } => self.handle_inbound_call(now, now_ms, unique_id, action, payload),
                OcppFrame::CallResult { unique_id, payload } => {
                    self.handle_call_result(now, now_ms, &unique_id, payload)
                }
                OcppFrame::CallError {
                    unique_id,
                    error_code,
                    error_description,
                    ..
                } => {
                    self.handle_call_error(now, now_ms, &unique_id, &error_code, &error_description)
                }
            }
        }
    }

    fn handle_inbound_call(
        &mut self,
        now: DateTime<Utc>,
        now_ms: u64,
        unique_id: String,
        action: String,
        payload: Value,
    ) {
        debug!(unique_id = unique_id.as_str(), action = action.as_str(), "Inbound call");
        match ops::dispatch(self, now, now_ms, &action, &payload) {
            ops::OpOutcome::Reply(value) => {
                self.transport.respond(OcppFrame::result(unique_id, value));
            }
            ops::OpOutcome::Error { code, description } => {
                self.transport
                    .respond(OcppFrame::error(unique_id, code, description));
            }
            ops::OpOutcome::UnlockPending { connector_id } => {
                // Re-polled on subsequent ticks until terminal or timed out.
                self.pending_unlock = Some(PendingUnlock {
                    unique_id,
                    connector_id,
                    deadline_ms: now_ms + UNLOCK_POLL_TIMEOUT_MS,
                });
            }
        }
    }

    fn handle_call_result(
        &mut self,
        now: DateTime<Utc>,
        now_ms: u64,
        unique_id: &str,
        payload: Value,
    ) {
        let Some(op) = self.dispatcher.take(unique_id) else {
            warn!(unique_id, "CallResult for unknown message id");
            return;
        };
        match op {
            PendingOp::BootNotification => self.on_boot_result(now_ms, payload),
            PendingOp::Heartbeat => debug!("Heartbeat acknowledged"),
            PendingOp::Authorize { connector_id } => {
                match serde_json::from_value::<AuthorizeResponse>(payload) {
                    Ok(response) => {
                        self.with_connector_ctx(connector_id, now, now_ms, |c, ctx| {
                            c.on_authorize_result(ctx, &response.id_tag_info)
                        });
                    }
                    Err(e) => {
                        error!(connector_id, error = %e, "Unparseable Authorize response");
                        self.with_connector_ctx(connector_id, now, now_ms, |c, ctx| {
                            c.on_authorize_timeout(ctx)
                        });
                    }
                }
            }
            PendingOp::StartTransaction {
                connector_id,
                tx_nr,
            } => match serde_json::from_value::<StartTransactionResponse>(payload) {
                Ok(response) => {
                    self.with_connector_ctx(connector_id, now, now_ms, |c, ctx| {
                        c.on_start_tx_result(
                            ctx,
                            tx_nr,
                            response.transaction_id,
                            &response.id_tag_info,
                        )
                    });
                }
                Err(e) => {
                    error!(connector_id, tx_nr, error = %e, "Unparseable StartTransaction response");
                    self.with_connector_ctx(connector_id, now, now_ms, |c, ctx| {
                        c.on_start_tx_failure(ctx, tx_nr, false)
                    });
                }
            },
            PendingOp::StopTransaction {
                connector_id,
                tx_nr,
            } => {
                self.with_connector_ctx(connector_id, now, now_ms, |c, ctx| {
                    c.on_stop_tx_result(ctx, tx_nr)
                });
            }
            PendingOp::MeterValues { .. }
            | PendingOp::StatusNotification { .. }
            | PendingOp::FirmwareStatusNotification
            | PendingOp::DataTransfer => {}
        }
    }

    /// CallError classification per the failure model: formation/protocol
    /// violations are definitive, everything else is transient.
    fn handle_call_error(
        &mut self,
        now: DateTime<Utc>,
        now_ms: u64,
        unique_id: &str,
        error_code: &str,
        error_description: &str,
    ) {
        let Some(op) = self.dispatcher.take(unique_id) else {
            warn!(unique_id, "CallError for unknown message id");
            return;
        };
        warn!(unique_id, error_code, error_description, ?op, "CallError received");
        let definitive = matches!(
            error_code,
            "FormationViolation"
                | "ProtocolError"
                | "TypeConstraintViolation"
                | "PropertyConstraintViolation"
                | "OccurenceConstraintViolation"
                | "OccurrenceConstraintViolation"
                | "NotImplemented"
                | "NotSupported"
                | "SecurityError"
        );
        match op {
            PendingOp::StartTransaction {
                connector_id,
                tx_nr,
            } => {
                self.with_connector_ctx(connector_id, now, now_ms, |c, ctx| {
                    c.on_start_tx_failure(ctx, tx_nr, definitive)
                });
            }
            PendingOp::StopTransaction {
                connector_id,
                tx_nr,
            } => {
                self.with_connector_ctx(connector_id, now, now_ms, |c, ctx| {
                    c.on_stop_tx_failure(ctx, tx_nr, definitive)
                });
            }
            PendingOp::Authorize { connector_id } => {
                if definitive {
                    let rejected = rust_ocpp::v1_6::types::IdTagInfo {
                        status: rust_ocpp::v1_6::types::AuthorizationStatus::Invalid,
                        expiry_date: None,
                        parent_id_tag: None,
                    };
                    self.with_connector_ctx(connector_id, now, now_ms, |c, ctx| {
                        c.on_authorize_result(ctx, &rejected)
                    });
                } else {
                    self.with_connector_ctx(connector_id, now, now_ms, |c, ctx| {
                        c.on_authorize_timeout(ctx)
                    });
                }
            }
            PendingOp::BootNotification => {
                self.boot.in_flight = false;
                self.boot.next_attempt_ms = now_ms + BOOT_TIMEOUT_S * 1000;
            }
            PendingOp::Heartbeat
            | PendingOp::MeterValues { .. }
            | PendingOp::StatusNotification { .. }
            | PendingOp::FirmwareStatusNotification
            | PendingOp::DataTransfer => {}
        }
    }

    fn process_timeouts(&mut self, now: DateTime<Utc>, now_ms: u64) {
        for op in self.dispatcher.take_expired(now_ms) {
            match op {
                PendingOp::Authorize { connector_id } => {
                    self.with_connector_ctx(connector_id, now, now_ms, |c, ctx| {
                        c.on_authorize_timeout(ctx)
                    });
                }
                PendingOp::StartTransaction {
                    connector_id,
                    tx_nr,
                } => {
                    self.with_connector_ctx(connector_id, now, now_ms, |c, ctx| {
                        c.on_start_tx_failure(ctx, tx_nr, false)
                    });
                }
                PendingOp::StopTransaction {
                    connector_id,
                    tx_nr,
                } => {
                    self.with_connector_ctx(connector_id, now, now_ms, |c, ctx| {
                        c.on_stop_tx_failure(ctx, tx_nr, false)
                    });
                }
                PendingOp::BootNotification => {
                    debug!("BootNotification timed out; rescheduling");
                    self.boot.in_flight = false;
                    self.boot.next_attempt_ms = now_ms + BOOT_TIMEOUT_S * 1000;
                }
                PendingOp::Heartbeat => debug!("Heartbeat timed out"),
                PendingOp::MeterValues { connector_id } => {
                    warn!(connector_id, "MeterValues request expired; samples dropped")
                }
                PendingOp::StatusNotification { connector_id } => {
                    warn!(connector_id, "StatusNotification request expired")
                }
                PendingOp::FirmwareStatusNotification => {
                    warn!("FirmwareStatusNotification request expired")
                }
                PendingOp::DataTransfer => warn!("DataTransfer request expired"),
            }
        }
    }

    // ── Boot & heartbeat ───────────────────────────────────

    fn drive_boot(&mut self, now_ms: u64) {
        if self.boot.accepted || self.boot.in_flight || now_ms < self.boot.next_attempt_ms {
            return;
        }
        self.submit_boot_notification(now_ms);
    }

    pub(crate) fn submit_boot_notification(&mut self, now_ms: u64) {
        let info = &self.boot_info;
        let request = BootNotificationRequest {
            charge_box_serial_number: info.charge_box_serial_number.clone(),
            charge_point_model: info.charge_point_model.clone(),
            charge_point_serial_number: info.charge_point_serial_number.clone(),
            charge_point_vendor: info.charge_point_vendor.clone(),
            firmware_version: info.firmware_version.clone(),
            iccid: info.iccid.clone(),
            imsi: info.imsi.clone(),
            meter_serial_number: info.meter_serial_number.clone(),
            meter_type: info.meter_type.clone(),
        };
        self.boot.in_flight = true;
        self.dispatcher.submit(
            self.transport.as_mut(),
            now_ms,
            PendingOp::BootNotification,
            "BootNotification",
            serde_json::to_value(&request).unwrap_or_default(),
            std::time::Duration::from_secs(BOOT_TIMEOUT_S),
        );
    }

    fn on_boot_result(&mut self, now_ms: u64, payload: Value) {
        self.boot.in_flight = false;
        let response: BootNotificationResponse = match serde_json::from_value(payload) {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "Unparseable BootNotification response");
                self.boot.next_attempt_ms = now_ms + BOOT_TIMEOUT_S * 1000;
                return;
            }
        };
        let interval = response.interval as i64;
        match response.status {
            RegistrationStatus::Accepted => {
                info!(interval, "BootNotification accepted");
                if interval > 0 {
                    self.cfg.store_internal(
                        keys::HEARTBEAT_INTERVAL,
                        crate::config::ConfigValue::Int(interval),
                    );
                }
                self.boot.accepted = true;
                self.heartbeat_last_ms = now_ms;
            }
            status => {
                let retry_s = if interval > 0 {
                    interval as u64
                } else {
                    BOOT_TIMEOUT_S
                };
                info!(?status, retry_s, "BootNotification not accepted yet");
                self.boot.next_attempt_ms = now_ms + retry_s * 1000;
            }
        }
    }

    fn drive_heartbeat(&mut self, now_ms: u64) {
        if !self.boot.accepted {
            return;
        }
        let interval_s = self.cfg.int_of(keys::HEARTBEAT_INTERVAL);
        let periodic_due =
            interval_s > 0 && now_ms - self.heartbeat_last_ms >= interval_s as u64 * 1000;
        if !(self.trigger_heartbeat || periodic_due) {
            return;
        }
        if self.dispatcher.has_in_flight(PendingOp::Heartbeat) {
            return;
        }
        self.trigger_heartbeat = false;
        self.heartbeat_last_ms = now_ms;
        self.dispatcher.submit(
            self.transport.as_mut(),
            now_ms,
            PendingOp::Heartbeat,
            "Heartbeat",
            serde_json::to_value(&HeartbeatRequest {}).unwrap_or_default(),
            DEFAULT_REQUEST_TIMEOUT,
        );
    }

    // ── Deferred operations ────────────────────────────────

    fn poll_pending_unlock(&mut self, now_ms: u64) {
        let Some(pending) = self.pending_unlock.take() else {
            return;
        };
        let poll = self
            .connector_mut(pending.connector_id)
            .and_then(Connector::poll_unlock);
        let status = match poll {
            Some(PollResult::Ready(true)) => Some(UnlockStatus::Unlocked),
            Some(PollResult::Ready(false)) => Some(UnlockStatus::UnlockFailed),
            Some(PollResult::Pending) if now_ms >= pending.deadline_ms => {
                warn!(
                    connector_id = pending.connector_id,
                    "Unlock still pending at timeout"
                );
                Some(UnlockStatus::UnlockFailed)
            }
            Some(PollResult::Pending) => {
                self.pending_unlock = Some(pending);
                return;
            }
            None => Some(UnlockStatus::NotSupported),
        };
        if let Some(status) = status {
            let payload = serde_json::json!({ "status": status });
            self.transport
                .respond(OcppFrame::result(pending.unique_id, payload));
        }
    }

    /// A Reset is honored once every connector is transaction-free.
    fn wind_down_reset(&mut self) {
        let Some(kind) = self.reset_requested else {
            return;
        };
        if self.connectors.iter().any(Connector::has_active_transaction) {
            return;
        }
        self.reset_requested = None;
        info!(?kind, "Executing reset");
        if let Some(on_reset) = self.on_reset.as_mut() {
            on_reset(kind);
        }
    }

    /// Answer an inbound DataTransfer through the host handler.
    pub(crate) fn answer_data_transfer(
        &mut self,
        request: &DataTransferRequest,
    ) -> DataTransferResponse {
        match self.on_data_transfer.as_mut() {
            Some(handler) => handler(request),
            None => DataTransferResponse {
                status: DataTransferStatus::UnknownVendorId,
                data: None,
            },
        }
    }
}
