//! End-to-end charging scenarios, driven tick by tick against a scripted
//! Central System.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::{count_action, harness, harness_with_stores, statuses_of};
use serde_json::json;
use voltgate_cp::{ConnectorIo, CoreError, FileKeyValueStore, FileTransactionStore, SyncState};

struct Plug {
    plugged: Rc<Cell<bool>>,
    energy: Rc<Cell<i32>>,
}

/// Wire connector 1 with a controllable plug and energy meter.
fn wire_plug(h: &mut common::Harness) -> Plug {
    let plugged = Rc::new(Cell::new(false));
    let energy = Rc::new(Cell::new(1000));
    let p = plugged.clone();
    let e = energy.clone();
    h.cp.connector_mut(1).unwrap().set_io(
        ConnectorIo::builder()
            .connector_plugged(move || p.get())
            .energy_meter(move || e.get())
            .build(),
    );
    Plug { plugged, energy }
}

#[test]
fn normal_charge_cycle() {
    let mut h = harness(1);
    let plug = wire_plug(&mut h);
    h.boot();

    // First-ever report after boot goes out immediately.
    let calls = h.drain();
    assert_eq!(statuses_of(&calls, 1), vec!["Available"]);

    // Plug in: Preparing.
    plug.plugged.set(true);
    h.step(100);
    assert_eq!(statuses_of(&h.drain(), 1), vec!["Preparing"]);

    // Swipe: Authorize goes out.
    h.cp.begin_transaction(1, "TAG01").unwrap();
    h.step(100);
    let calls = h.drain();
    let authorize = calls.iter().find(|c| c.action == "Authorize").unwrap();
    assert_eq!(authorize.payload["idTag"], "TAG01");
    h.respond(
        &authorize.unique_id,
        json!({"idTagInfo": {"status": "Accepted"}}),
    );

    // Accepted + plugged: StartTransaction with meterStart, status Charging.
    h.step(100);
    let calls = h.drain();
    let start = calls.iter().find(|c| c.action == "StartTransaction").unwrap();
    assert_eq!(start.payload["connectorId"], 1);
    assert_eq!(start.payload["meterStart"], 1000);
    assert_eq!(statuses_of(&calls, 1), vec!["Charging"]);
    h.respond(
        &start.unique_id,
        json!({"transactionId": 42, "idTagInfo": {"status": "Accepted"}}),
    );
    h.step(100);
    assert_eq!(h.cp.connector(1).unwrap().transaction_id(), Some(42));

    // Unplug: StopTransaction with reason EVDisconnected, back to Available.
    plug.energy.set(5500);
    plug.plugged.set(false);
    h.step(100);
    let calls = h.drain();
    let stop = calls.iter().find(|c| c.action == "StopTransaction").unwrap();
    assert_eq!(stop.payload["transactionId"], 42);
    assert_eq!(stop.payload["meterStop"], 5500);
    assert_eq!(stop.payload["reason"], "EVDisconnected");
    assert_eq!(statuses_of(&calls, 1), vec!["Available"]);

    // Confirmation frees the record.
    h.respond(&stop.unique_id, json!({}));
    h.step(100);
    assert!(h.cp.connector(1).unwrap().transaction().is_none());
}

#[test]
fn begin_then_end_without_ticks_sends_nothing() {
    let mut h = harness(1);
    wire_plug(&mut h);
    h.boot();
    h.drain();

    h.cp.begin_transaction(1, "TAG01").unwrap();
    assert!(h.cp.end_transaction(1, None));
    h.step(100);
    h.step(100);

    let calls = h.drain();
    assert_eq!(count_action(&calls, "StartTransaction"), 0);
    assert_eq!(count_action(&calls, "StopTransaction"), 0);
    assert!(h.cp.connector(1).unwrap().transaction().is_none());
}

#[test]
fn offline_silent_transaction_leaves_no_trace_on_the_wire() {
    let store_dir = tempfile::tempdir().unwrap();
    let kv_dir = tempfile::tempdir().unwrap();
    let mut h = harness_with_stores(
        1,
        Box::new(FileTransactionStore::new(store_dir.path())),
        Box::new(FileKeyValueStore::new(kv_dir.path().join("config.json"))),
    );
    let plug = wire_plug(&mut h);
    h.cp.configure("SilentOfflineTransactions", "true");
    h.cp.configure("AllowOfflineTxForUnknownId", "true");
    h.cp.configure("AuthorizationTimeout", "10");

    h.transport.borrow_mut().set_online(false);
    h.tick();

    // Swipe an unknown tag while offline, plug in, charge, plug out.
    h.cp.begin_transaction(1, "UNKNOWN").unwrap();
    plug.plugged.set(true);
    h.run_for(11_000, 1_000); // past AuthorizationTimeout: offline-allowed
    assert!(h.cp.connector(1).unwrap().is_transaction_running());

    plug.energy.set(2500);
    plug.plugged.set(false);
    h.step(1_000);

    // Reconnect; only boot traffic may appear, no transaction messages.
    h.transport.borrow_mut().set_online(true);
    h.boot();
    h.run_for(2_000, 500);
    let calls = h.drain();
    assert_eq!(count_action(&calls, "Authorize"), 0);
    assert_eq!(count_action(&calls, "StartTransaction"), 0);
    assert_eq!(count_action(&calls, "StopTransaction"), 0);

    // The record is retained locally.
    let mut store = FileTransactionStore::new(store_dir.path());
    let records = voltgate_cp::TransactionStore::load_all(&mut store, 1);
    assert_eq!(records.len(), 1);
    assert!(records[0].is_silent());
    assert_eq!(
        records[0].stop_reason(),
        Some(rust_ocpp::v1_6::types::Reason::EVDisconnected)
    );
}

#[test]
fn authorize_timeout_with_silent_server_goes_offline_allowed() {
    let mut h = harness(1);
    let plug = wire_plug(&mut h);
    h.boot();
    h.cp.configure("AuthorizationTimeout", "10");
    h.cp.configure("AllowOfflineTxForUnknownId", "true");
    h.drain();

    plug.plugged.set(true);
    h.cp.begin_transaction(1, "TAG02").unwrap();
    h.step(100);
    let calls = h.drain();
    assert_eq!(count_action(&calls, "Authorize"), 1);

    // The server never answers; after the timeout the session proceeds.
    h.run_for(10_500, 500);
    let calls = h.drain();
    assert_eq!(count_action(&calls, "StartTransaction"), 1);
    assert!(h.cp.connector(1).unwrap().is_transaction_running());
}

#[test]
fn connection_timeout_aborts_idle_preparing() {
    let mut h = harness(1);
    let plug = wire_plug(&mut h);
    h.boot();
    h.cp.configure("ConnectionTimeOut", "30");
    h.drain();

    // Plug in without presenting an idTag.
    plug.plugged.set(true);
    h.step(100);
    assert_eq!(statuses_of(&h.drain(), 1), vec!["Preparing"]);

    h.run_for(31_000, 1_000);
    let calls = h.drain();
    assert_eq!(statuses_of(&calls, 1), vec!["Available"]);
    assert_eq!(count_action(&calls, "StartTransaction"), 0);
}

#[test]
fn connection_timeout_zero_never_aborts() {
    let mut h = harness(1);
    let plug = wire_plug(&mut h);
    h.boot();
    h.cp.configure("ConnectionTimeOut", "0");
    h.drain();

    plug.plugged.set(true);
    h.step(100);
    h.run_for(120_000, 5_000);
    let calls = h.drain();
    // Still Preparing; the single report happened on the plug-in edge.
    assert!(statuses_of(&calls, 1).iter().all(|s| s == "Preparing"));
    assert_eq!(
        h.cp.connector(1).unwrap().reported_status(),
        Some(rust_ocpp::v1_6::types::ChargePointStatus::Preparing)
    );
}

#[test]
fn free_vend_cycle_yields_exactly_one_start_stop_pair() {
    let mut h = harness(1);
    let plug = wire_plug(&mut h);
    h.boot();
    h.cp.configure("FreeVendActive", "true");
    h.cp.configure("FreeVendIdTag", "FREE01");
    h.drain();

    // Plug in: one StartTransaction, auto-authorized.
    plug.plugged.set(true);
    h.step(100);
    let calls = h.drain();
    assert_eq!(count_action(&calls, "StartTransaction"), 1);
    assert_eq!(count_action(&calls, "Authorize"), 0);
    let start = calls.iter().find(|c| c.action == "StartTransaction").unwrap();
    assert_eq!(start.payload["idTag"], "FREE01");
    h.respond(
        &start.unique_id,
        json!({"transactionId": 7, "idTagInfo": {"status": "Accepted"}}),
    );

    // Idling plugged: no further starts.
    h.run_for(5_000, 500);
    assert_eq!(count_action(&h.drain(), "StartTransaction"), 0);

    // Unplug: exactly one StopTransaction.
    plug.plugged.set(false);
    h.step(100);
    let calls = h.drain();
    assert_eq!(count_action(&calls, "StopTransaction"), 1);

    // A new plug-in edge fires again.
    plug.plugged.set(true);
    h.step(100);
    assert_eq!(count_action(&h.drain(), "StartTransaction"), 1);
}

#[test]
fn id_tag_length_boundary() {
    let mut h = harness(1);
    wire_plug(&mut h);
    h.boot();

    let ok = "A".repeat(20);
    let too_long = "A".repeat(21);
    assert!(h.cp.begin_transaction(1, &ok).is_ok());
    assert!(h.cp.end_transaction(1, None));
    h.step(100);

    match h.cp.begin_transaction(1, &too_long) {
        Err(CoreError::IdTagTooLong(_)) => {}
        other => panic!("expected IdTagTooLong, got {other:?}"),
    }
}

#[test]
fn fault_during_charge_stops_with_reason_other() {
    let mut h = harness(1);
    let plug = wire_plug(&mut h);
    let error: Rc<Cell<&'static str>> = Rc::new(Cell::new("NoError"));
    let e = error.clone();
    h.cp.connector_mut(1)
        .unwrap()
        .add_connector_error_code_sampler(move || e.get().to_string());
    h.boot();
    h.drain();

    // Get a charge going.
    plug.plugged.set(true);
    h.cp.begin_transaction_authorized(1, "TAG01", None).unwrap();
    h.step(100);
    let calls = h.drain();
    let start = calls.iter().find(|c| c.action == "StartTransaction").unwrap();
    h.respond(
        &start.unique_id,
        json!({"transactionId": 9, "idTagInfo": {"status": "Accepted"}}),
    );
    h.step(100);
    h.drain();

    // Ground failure: Faulted is reported and the transaction stops.
    error.set("GroundFailure");
    h.step(100);
    let calls = h.drain();
    let stop = calls.iter().find(|c| c.action == "StopTransaction").unwrap();
    assert_eq!(stop.payload["reason"], "Other");
    let fault = calls
        .iter()
        .find(|c| c.action == "StatusNotification")
        .unwrap();
    assert_eq!(fault.payload["status"], "Faulted");
    assert_eq!(fault.payload["errorCode"], "GroundFailure");
    h.respond(&stop.unique_id, json!({}));

    // Recovery: code clears, plug removed, connector is Available again.
    error.set("NoError");
    plug.plugged.set(false);
    h.step(100);
    assert_eq!(statuses_of(&h.drain(), 1), vec!["Available"]);
}

#[test]
fn status_debounce_holds_and_suppresses_flaps() {
    let mut h = harness(1);
    let plug = wire_plug(&mut h);
    h.boot();
    h.cp.configure("MinimumStatusDuration", "5");
    h.drain();

    // A 2-second flap never reaches the server.
    plug.plugged.set(true);
    h.run_for(2_000, 500);
    plug.plugged.set(false);
    h.run_for(6_000, 500);
    assert_eq!(count_action(&h.drain(), "StatusNotification"), 0);

    // A held change is reported once the window passes.
    plug.plugged.set(true);
    h.run_for(4_000, 500);
    assert_eq!(count_action(&h.drain(), "StatusNotification"), 0);
    h.run_for(2_000, 500);
    assert_eq!(statuses_of(&h.drain(), 1), vec!["Preparing"]);
}

#[test]
fn meter_values_wait_for_transaction_id() {
    let mut h = harness(1);
    let plug = wire_plug(&mut h);
    h.boot();
    h.cp.configure("MeterValueSampleInterval", "2");
    h.drain();

    plug.plugged.set(true);
    h.cp.begin_transaction_authorized(1, "TAG01", None).unwrap();
    h.step(100);
    let calls = h.drain();
    let start = calls.iter().find(|c| c.action == "StartTransaction").unwrap();
    let start_id = start.unique_id.clone();

    // Samples accumulate but nothing is sent while the id is unknown.
    plug.energy.set(1500);
    h.run_for(5_000, 500);
    assert_eq!(count_action(&h.drain(), "MeterValues"), 0);

    // Confirmation flushes the buffer; the request carries the id.
    h.respond(&start_id, json!({"transactionId": 77, "idTagInfo": {"status": "Accepted"}}));
    h.step(100);
    let calls = h.drain();
    let mv = calls.iter().find(|c| c.action == "MeterValues").unwrap();
    assert_eq!(mv.payload["transactionId"], 77);
    assert_eq!(mv.payload["connectorId"], 1);
    assert!(mv.payload["meterValue"].as_array().is_some_and(|v| !v.is_empty()));

    // And keeps sampling periodically afterwards.
    h.run_for(4_000, 500);
    assert!(count_action(&h.drain(), "MeterValues") >= 1);
}

#[test]
fn reboot_mid_transaction_replays_the_stop() {
    let store_dir = tempfile::tempdir().unwrap();
    let kv_dir = tempfile::tempdir().unwrap();
    let kv_path = kv_dir.path().join("config.json");

    {
        let mut h = harness_with_stores(
            1,
            Box::new(FileTransactionStore::new(store_dir.path())),
            Box::new(FileKeyValueStore::new(kv_path.clone())),
        );
        let plug = wire_plug(&mut h);
        h.boot();
        h.drain();

        plug.plugged.set(true);
        h.cp.begin_transaction_authorized(1, "TAG01", None).unwrap();
        h.step(100);
        let calls = h.drain();
        let start = calls.iter().find(|c| c.action == "StartTransaction").unwrap();
        h.respond(
            &start.unique_id,
            json!({"transactionId": 42, "idTagInfo": {"status": "Accepted"}}),
        );
        h.step(100);

        // EV leaves; the stop goes out but the server never confirms it.
        plug.plugged.set(false);
        h.step(100);
        let calls = h.drain();
        assert_eq!(count_action(&calls, "StopTransaction"), 1);
        // Power loss here: the harness is dropped with the stop unconfirmed.
    }

    // Reboot from the same stores.
    let mut h = harness_with_stores(
        1,
        Box::new(FileTransactionStore::new(store_dir.path())),
        Box::new(FileKeyValueStore::new(kv_path)),
    );
    wire_plug(&mut h);
    h.boot();
    h.run_for(1_000, 500);

    let calls = h.drain();
    let stop = calls
        .iter()
        .find(|c| c.action == "StopTransaction")
        .expect("stop replayed after reboot");
    assert_eq!(stop.payload["transactionId"], 42);
    assert_eq!(stop.payload["reason"], "EVDisconnected");

    // Confirmation finally frees the record.
    h.respond(&stop.unique_id, json!({}));
    h.step(100);
    let mut store = FileTransactionStore::new(store_dir.path());
    assert!(voltgate_cp::TransactionStore::load_all(&mut store, 1).is_empty());
}

#[test]
fn start_sync_confirms_before_stop_sync() {
    let mut h = harness(1);
    let plug = wire_plug(&mut h);
    h.boot();
    h.drain();

    plug.plugged.set(true);
    h.cp.begin_transaction_authorized(1, "TAG01", None).unwrap();
    h.step(100);

    // Stop the session while the start is still unconfirmed.
    h.cp.end_transaction(1, None);
    h.step(100);
    let calls = h.drain();
    assert_eq!(count_action(&calls, "StopTransaction"), 0);

    let tx = h.cp.connector(1).unwrap().transaction().unwrap();
    assert_eq!(tx.start_sync(), SyncState::Pending);
    assert_eq!(tx.stop_sync(), SyncState::NotSent);
}
