//! Transport contract towards the Central System.
//!
//! The WebSocket itself lives in the host; the library only sees a queue it
//! can submit Calls to and poll received frames from. Submission order is
//! preserved per queue, offline submissions are held back until the link
//! returns, and replies to inbound Calls go out through the same object.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;

use crate::support::frame::OcppFrame;

/// Default timeout for outbound requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for MeterValues requests, which tolerate a slow back-office.
pub const METER_VALUES_TIMEOUT: Duration = Duration::from_secs(120);

/// An outbound Call, queued towards the Central System.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    pub unique_id: String,
    pub action: String,
    pub payload: Value,
    pub timeout: Duration,
}

impl OutboundCall {
    /// The OCPP-J wire form of this call.
    pub fn to_frame(&self) -> OcppFrame {
        OcppFrame::call(self.unique_id.clone(), self.action.clone(), self.payload.clone())
    }
}

/// Host-provided message pipe to the Central System.
pub trait Transport {
    /// Whether the link is currently usable. Submissions while offline are
    /// queued, not dropped.
    fn is_online(&self) -> bool;

    /// Queue a Call for delivery. Order of submission is preserved.
    fn submit(&mut self, call: OutboundCall);

    /// Next frame received from the Central System, if any.
    fn poll(&mut self) -> Option<OcppFrame>;

    /// Send a CallResult/CallError answering an inbound Call.
    fn respond(&mut self, frame: OcppFrame);
}

/// Queue-backed transport for development and testing.
///
/// A test drives the server side: drain delivered calls with
/// [`MemoryTransport::drain_sent`], inject server traffic with
/// [`MemoryTransport::push_inbound`], and flip the link with
/// [`MemoryTransport::set_online`].
pub struct MemoryTransport {
    online: bool,
    held: VecDeque<OutboundCall>,
    sent: VecDeque<OutboundCall>,
    inbound: VecDeque<OcppFrame>,
    responses: Vec<OcppFrame>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            online: true,
            held: VecDeque::new(),
            sent: VecDeque::new(),
            inbound: VecDeque::new(),
            responses: Vec::new(),
        }
    }

    pub fn offline() -> Self {
        let mut t = Self::new();
        t.online = false;
        t
    }

    /// Flip the link state. Going online flushes calls held while offline,
    /// in submission order.
    pub fn set_online(&mut self, online: bool) {
        self.online = online;
        if online {
            while let Some(call) = self.held.pop_front() {
                self.sent.push_back(call);
            }
        }
    }

    /// Calls delivered to the server since the last drain.
    pub fn drain_sent(&mut self) -> Vec<OutboundCall> {
        self.sent.drain(..).collect()
    }

    /// Actions of delivered calls, without draining payloads context.
    pub fn sent_actions(&self) -> Vec<&str> {
        self.sent.iter().map(|c| c.action.as_str()).collect()
    }

    /// Inject a frame as if received from the Central System.
    pub fn push_inbound(&mut self, frame: OcppFrame) {
        self.inbound.push_back(frame);
    }

    /// Replies the library sent for inbound Calls.
    pub fn take_responses(&mut self) -> Vec<OcppFrame> {
        std::mem::take(&mut self.responses)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn is_online(&self) -> bool {
        self.online
    }

    fn submit(&mut self, call: OutboundCall) {
        if self.online {
            self.sent.push_back(call);
        } else {
            self.held.push_back(call);
        }
    }

    fn poll(&mut self) -> Option<OcppFrame> {
        self.inbound.pop_front()
    }

    fn respond(&mut self, frame: OcppFrame) {
        self.responses.push(frame);
    }
}

/// Shared handle so a test can keep driving the server side while the
/// charge point owns the transport.
impl Transport for std::rc::Rc<std::cell::RefCell<MemoryTransport>> {
    fn is_online(&self) -> bool {
        self.borrow().is_online()
    }

    fn submit(&mut self, call: OutboundCall) {
        self.borrow_mut().submit(call);
    }

    fn poll(&mut self) -> Option<OcppFrame> {
        self.borrow_mut().poll()
    }

    fn respond(&mut self, frame: OcppFrame) {
        self.borrow_mut().respond(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str, action: &str) -> OutboundCall {
        OutboundCall {
            unique_id: id.to_string(),
            action: action.to_string(),
            payload: json!({}),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[test]
    fn offline_submissions_flush_in_order() {
        let mut t = MemoryTransport::offline();
        t.submit(call("1", "StartTransaction"));
        t.submit(call("2", "MeterValues"));
        assert!(t.drain_sent().is_empty());

        t.set_online(true);
        let sent: Vec<_> = t.drain_sent().into_iter().map(|c| c.unique_id).collect();
        assert_eq!(sent, vec!["1", "2"]);
    }

    #[test]
    fn online_submissions_deliver_immediately() {
        let mut t = MemoryTransport::new();
        t.submit(call("1", "Heartbeat"));
        assert_eq!(t.sent_actions(), vec!["Heartbeat"]);
    }

    #[test]
    fn inbound_frames_come_back_in_order() {
        let mut t = MemoryTransport::new();
        t.push_inbound(OcppFrame::result("a", json!({})));
        t.push_inbound(OcppFrame::result("b", json!({})));
        assert_eq!(t.poll().unwrap().unique_id(), "a");
        assert_eq!(t.poll().unwrap().unique_id(), "b");
        assert!(t.poll().is_none());
    }
}
