//! Shared test harness: a charge point wired to an in-memory transport and
//! a simulated clock, with the test driving the Central System side.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use voltgate_cp::{
    BootInfo, ChargePoint, ChargePointBuilder, KeyValueStore, MemoryTransport, OcppFrame,
    OutboundCall, SimClock, TransactionStore,
};

pub struct Harness {
    pub cp: ChargePoint,
    pub transport: Rc<RefCell<MemoryTransport>>,
    pub clock: Rc<SimClock>,
}

#[allow(dead_code)]
pub fn base_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

#[allow(dead_code)]
pub fn builder(connectors: u32) -> (ChargePointBuilder, Rc<RefCell<MemoryTransport>>, Rc<SimClock>)
{
    let transport = Rc::new(RefCell::new(MemoryTransport::new()));
    let clock = Rc::new(SimClock::new(base_time()));
    let b = ChargePoint::builder(BootInfo::new("Voltgate", "VG-One"), connectors)
        .transport(Box::new(transport.clone()))
        .clock(clock.clone());
    (b, transport, clock)
}

pub fn harness(connectors: u32) -> Harness {
    let (b, transport, clock) = builder(connectors);
    Harness {
        cp: b.build(),
        transport,
        clock,
    }
}

#[allow(dead_code)]
pub fn harness_with_stores(
    connectors: u32,
    store: Box<dyn TransactionStore>,
    kv: Box<dyn KeyValueStore>,
) -> Harness {
    let (b, transport, clock) = builder(connectors);
    Harness {
        cp: b.transaction_store(store).key_value_store(kv).build(),
        transport,
        clock,
    }
}

#[allow(dead_code)]
impl Harness {
    pub fn tick(&mut self) {
        self.cp.tick();
    }

    /// Advance the clock and run one tick.
    pub fn step(&mut self, ms: u64) {
        self.clock.advance(ms);
        self.cp.tick();
    }

    /// Advance in tick-sized slices, as the host loop would.
    pub fn run_for(&mut self, total_ms: u64, step_ms: u64) {
        let mut elapsed = 0;
        while elapsed < total_ms {
            self.step(step_ms.min(total_ms - elapsed));
            elapsed += step_ms;
        }
    }

    /// Calls delivered to the "server" since the last drain.
    pub fn drain(&mut self) -> Vec<OutboundCall> {
        self.transport.borrow_mut().drain_sent()
    }

    pub fn drain_actions(&mut self) -> Vec<String> {
        self.drain().into_iter().map(|c| c.action).collect()
    }

    /// Answer an outstanding call with a CallResult payload.
    pub fn respond(&mut self, unique_id: &str, payload: Value) {
        self.transport
            .borrow_mut()
            .push_inbound(OcppFrame::result(unique_id, payload));
    }

    /// Answer an outstanding call with a CallError.
    pub fn respond_error(&mut self, unique_id: &str, code: &str) {
        self.transport
            .borrow_mut()
            .push_inbound(OcppFrame::error(unique_id, code, "test"));
    }

    /// Inject an inbound operation from the Central System.
    pub fn push_call(&mut self, unique_id: &str, action: &str, payload: Value) {
        self.transport
            .borrow_mut()
            .push_inbound(OcppFrame::call(unique_id, action, payload));
    }

    /// Replies the charge point produced for inbound operations.
    pub fn responses(&mut self) -> Vec<OcppFrame> {
        self.transport.borrow_mut().take_responses()
    }

    /// The single reply payload for `unique_id`; panics when missing.
    pub fn response_payload(&mut self, unique_id: &str) -> Value {
        let frames = self.responses();
        for frame in frames {
            match frame {
                OcppFrame::CallResult {
                    unique_id: id,
                    payload,
                } if id == unique_id => return payload,
                _ => {}
            }
        }
        panic!("no CallResult for {unique_id}");
    }

    /// Run the BootNotification handshake.
    pub fn boot(&mut self) {
        self.cp.tick();
        let calls = self.drain();
        let boot = calls
            .iter()
            .find(|c| c.action == "BootNotification")
            .expect("BootNotification should be the first call");
        self.respond(
            &boot.unique_id,
            json!({
                "status": "Accepted",
                "currentTime": "2024-05-01T12:00:00Z",
                "interval": 300
            }),
        );
        self.cp.tick();
        assert!(self.cp.is_boot_accepted());
    }

    /// Confirm every outstanding Authorize / StartTransaction /
    /// StopTransaction in `calls` the way a permissive server would.
    /// Returns the actions confirmed, in order.
    pub fn accept_all(&mut self, calls: &[OutboundCall], transaction_id: i32) -> Vec<String> {
        let mut confirmed = Vec::new();
        for call in calls {
            match call.action.as_str() {
                "Authorize" => {
                    self.respond(
                        &call.unique_id,
                        json!({"idTagInfo": {"status": "Accepted"}}),
                    );
                }
                "StartTransaction" => {
                    self.respond(
                        &call.unique_id,
                        json!({
                            "transactionId": transaction_id,
                            "idTagInfo": {"status": "Accepted"}
                        }),
                    );
                }
                "StopTransaction" => {
                    self.respond(&call.unique_id, json!({}));
                }
                _ => continue,
            }
            confirmed.push(call.action.clone());
        }
        confirmed
    }
}

/// Statuses reported via StatusNotification for one connector, in order.
#[allow(dead_code)]
pub fn statuses_of(calls: &[OutboundCall], connector_id: u64) -> Vec<String> {
    calls
        .iter()
        .filter(|c| c.action == "StatusNotification")
        .filter(|c| c.payload["connectorId"].as_u64() == Some(connector_id))
        .filter_map(|c| c.payload["status"].as_str().map(str::to_string))
        .collect()
}

#[allow(dead_code)]
pub fn actions_of(calls: &[OutboundCall]) -> Vec<&str> {
    calls.iter().map(|c| c.action.as_str()).collect()
}

#[allow(dead_code)]
pub fn count_action(calls: &[OutboundCall], action: &str) -> usize {
    calls.iter().filter(|c| c.action == action).count()
}
