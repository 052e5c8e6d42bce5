//! Integration tests for the JSON control plane.
//!
//! These tests verify that:
//! - Every event in the command table dispatches
//! - Validation failures report errors without side effects
//! - The worker type string table reaches all four disciplines
//! - getState echoes the full topology

use cascade::control::handle_event;
use cascade::pipeline::PipelineManager;
use serde_json::{json, Value};

fn manager() -> PipelineManager {
    PipelineManager::new(1, 2).unwrap()
}

fn event(m: &mut PipelineManager, name: &str, params: Value) -> Value {
    handle_event(m, name, &params)
}

#[test]
fn test_worker_type_table_covers_all_disciplines() {
    let mut m = manager();
    for (id, kind) in [
        (10, "bestEffortMaster"),
        (11, "bestEffortSlave"),
        (12, "constantFramerateMaster"),
        (13, "constantFramerateSlave"),
    ] {
        let resp = event(&mut m, "addWorker", json!({"id": id, "type": kind, "fps": 24}));
        assert!(resp["error"].is_null(), "{kind}: {}", resp["error"]);
    }

    let resp = event(&mut m, "addWorker", json!({"id": 14, "type": "cooperative", "fps": 24}));
    assert_eq!(resp["error"], "Error creating worker. Check type...");

    let state = event(&mut m, "getState", json!({}));
    // Four added plus the two implicit endpoint workers.
    assert_eq!(state["workers"].as_array().unwrap().len(), 6);
    m.stop_workers().unwrap();
}

#[test]
fn test_duplicate_worker_id_rejected() {
    let mut m = manager();
    event(&mut m, "addWorker", json!({"id": 10, "type": "bestEffortMaster"}));
    let resp = event(&mut m, "addWorker", json!({"id": 10, "type": "bestEffortMaster"}));
    assert_eq!(
        resp["error"],
        "Error adding worker. Specified ID already exists..."
    );
    m.stop_workers().unwrap();
}

#[test]
fn test_add_slaves_validates_master() {
    let mut m = manager();
    event(&mut m, "addWorker", json!({"id": 10, "type": "bestEffortSlave"}));
    event(&mut m, "addWorker", json!({"id": 11, "type": "bestEffortSlave"}));

    // A slave cannot take slaves.
    let resp = event(&mut m, "addSlavesToWorker", json!({"master": 10, "slaves": [11]}));
    assert_eq!(
        resp["error"],
        "Error adding slaves to worker. Invalid Master ID..."
    );

    // Unknown master ID.
    let resp = event(&mut m, "addSlavesToWorker", json!({"master": 99, "slaves": [11]}));
    assert_eq!(
        resp["error"],
        "Error adding slaves to worker. Invalid Master ID..."
    );
    m.stop_workers().unwrap();
}

#[test]
fn test_create_path_error_reporting() {
    let mut m = manager();

    // Unknown filter IDs.
    let resp = event(
        &mut m,
        "createPath",
        json!({
            "id": 100, "orgFilterId": 1, "dstFilterId": 2,
            "orgWriterId": -1, "dstReaderId": -1,
            "midFiltersIds": [77], "sharedQueue": false
        }),
    );
    assert_eq!(
        resp["error"],
        "Error creating path. Check introduced filter IDs..."
    );

    // Missing parameters.
    let resp = event(&mut m, "createPath", json!({"id": 100}));
    assert_eq!(resp["error"], "Error creating path. Invalid JSON format...");

    // Duplicate path ID.
    event(&mut m, "createFilter", json!({"id": 10, "type": "audioDecoder"}));
    let params = json!({
        "id": 100, "orgFilterId": 1, "dstFilterId": 10,
        "orgWriterId": -1, "dstReaderId": -1,
        "midFiltersIds": [], "sharedQueue": false
    });
    let resp = event(&mut m, "createPath", params.clone());
    assert!(resp["error"].is_null());
    let resp = event(&mut m, "createPath", params);
    assert_eq!(
        resp["error"],
        "Error registering path. Path ID already exists..."
    );
    m.stop_workers().unwrap();
}

#[test]
fn test_add_filters_to_worker_validates_ids() {
    let mut m = manager();
    event(&mut m, "createFilter", json!({"id": 10, "type": "audioMixer"}));

    let resp = event(&mut m, "addFiltersToWorker", json!({"worker": 99, "filters": [10]}));
    assert_eq!(
        resp["error"],
        "Error adding filters to worker. Check worker and filter IDs..."
    );

    event(&mut m, "addWorker", json!({"id": 5, "type": "bestEffortMaster"}));
    let resp = event(&mut m, "addFiltersToWorker", json!({"worker": 5, "filters": [10, 88]}));
    assert_eq!(
        resp["error"],
        "Error adding filters to worker. Check worker and filter IDs..."
    );
    m.stop_workers().unwrap();
}

#[test]
fn test_reconfig_error_strings() {
    let mut m = manager();

    let resp = event(&mut m, "reconfigAudioEncoder", json!({"encoderID": 11}));
    assert_eq!(
        resp["error"],
        "Error configure audio encoder. Encoder ID is not valid"
    );

    let resp = event(
        &mut m,
        "reconfigAudioEncoder",
        json!({"encoderID": 11, "codec": "vorbis", "sampleRate": 48000, "channels": 2}),
    );
    assert_eq!(
        resp["error"],
        "Error configure audio encoder. Codec is not valid..."
    );

    // Valid parameters, but no encoder-headed path exists.
    let resp = event(
        &mut m,
        "reconfigAudioEncoder",
        json!({"encoderID": 11, "codec": "opus", "sampleRate": 48000, "channels": 2}),
    );
    assert_eq!(resp["error"], "Error reconfiguring audio encoder");
    m.stop_workers().unwrap();
}

#[test]
fn test_get_state_filter_details() {
    let mut m = manager();
    event(&mut m, "createFilter", json!({"id": 10, "type": "audioEncoder"}));

    let state = event(&mut m, "getState", json!({}));
    let filters = state["filters"].as_array().unwrap();
    let encoder = filters
        .iter()
        .find(|f| f["id"] == 10)
        .expect("encoder in state");
    assert_eq!(encoder["state"]["type"], "audioEncoder");
    assert_eq!(encoder["state"]["codec"], "aac");
    assert_eq!(encoder["state"]["sampleRate"], 48000);
    assert_eq!(encoder["state"]["channels"], 2);
}
