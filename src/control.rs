//! JSON control plane.
//!
//! Each command is a named event with a parameter object; each response
//! carries an `error` field that is null on success and a
//! human-readable string on failure. The transport is someone else's
//! problem: [`handle_event`] dispatches one already-parsed command, and
//! [`run_session`] adapts any newline-delimited JSON byte stream.
//!
//! Events that mutate topology stop the workers, mutate, and restart
//! them, so worker threads never observe a half-wired graph.

use crate::error::Result;
use crate::filter::FilterType;
use crate::frame::AudioCodec;
use crate::pipeline::PipelineManager;
use crate::worker::{Discipline, Worker};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{BufRead, Write};

/// Dispatch one control event against the pipeline.
///
/// Unknown events and malformed parameters are reported in the
/// response's `error` field; this function only returns the response,
/// never an `Err`.
pub fn handle_event(manager: &mut PipelineManager, event: &str, params: &Value) -> Value {
    match event {
        "getState" => get_state(manager),
        "createFilter" => create_filter(manager, params),
        "createPath" => create_path(manager, params),
        "addWorker" => add_worker(manager, params),
        "addSlavesToWorker" => add_slaves_to_worker(manager, params),
        "addFiltersToWorker" => add_filters_to_worker(manager, params),
        "reconfigAudioEncoder" => reconfig_audio_encoder(manager, params),
        _ => error_response(format!("Unknown event: {event}")),
    }
}

/// Serve a newline-delimited JSON request/response session.
///
/// Each request line is `{"event": "...", "params": {...}}`; each
/// response line is the event's response object. Returns when the
/// reader is exhausted.
pub fn run_session(
    manager: &mut PipelineManager,
    reader: impl BufRead,
    mut writer: impl Write,
) -> Result<()> {
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Value>(&line) {
            Ok(request) => {
                let event = request["event"].as_str().unwrap_or_default().to_string();
                let params = request.get("params").cloned().unwrap_or(Value::Null);
                handle_event(manager, &event, &params)
            }
            Err(_) => error_response("Invalid JSON format...".to_string()),
        };
        serde_json::to_writer(&mut writer, &response).map_err(std::io::Error::from)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
    Ok(())
}

fn error_response(message: String) -> Value {
    json!({ "error": message })
}

fn ok_response() -> Value {
    json!({ "error": null })
}

// ============================================================================
// Event handlers
// ============================================================================

fn get_state(manager: &mut PipelineManager) -> Value {
    let mut state = manager.state();
    state["error"] = Value::Null;
    state
}

#[derive(Deserialize)]
struct CreateFilterParams {
    id: i32,
    #[serde(rename = "type")]
    kind: String,
}

fn create_filter(manager: &mut PipelineManager, params: &Value) -> Value {
    let Ok(params) = serde_json::from_value::<CreateFilterParams>(params.clone()) else {
        return error_response("Error creating filter. Invalid JSON format...".into());
    };
    let Some(kind) = FilterType::from_token(&params.kind) else {
        return error_response("Error creating filter. Specified type is not correct..".into());
    };
    match manager.create_filter(params.id, kind) {
        Ok(()) => ok_response(),
        Err(_) => {
            error_response("Error registering filter. Specified ID already exists..".into())
        }
    }
}

#[derive(Deserialize)]
struct CreatePathParams {
    id: i32,
    #[serde(rename = "orgFilterId")]
    org_filter: i32,
    #[serde(rename = "dstFilterId")]
    dst_filter: i32,
    #[serde(rename = "orgWriterId")]
    org_writer: i32,
    #[serde(rename = "dstReaderId")]
    dst_reader: i32,
    #[serde(rename = "midFiltersIds")]
    mid_filters: Vec<i32>,
    #[serde(rename = "sharedQueue")]
    shared_queue: bool,
}

fn create_path(manager: &mut PipelineManager, params: &Value) -> Value {
    let Ok(params) = serde_json::from_value::<CreatePathParams>(params.clone()) else {
        return error_response("Error creating path. Invalid JSON format...".into());
    };

    if let Err(e) = manager.stop_workers() {
        return error_response(format!("Error creating path. {e}"));
    }

    let result = (|| {
        let path = manager
            .create_path(
                params.org_filter,
                params.dst_filter,
                params.org_writer,
                params.dst_reader,
                params.mid_filters,
                params.shared_queue,
            )
            .map_err(|_| "Error creating path. Check introduced filter IDs...")?;
        manager
            .connect_path(&path)
            .map_err(|_| "Error connecting path. Check port availability...")?;
        if let Err(e) = manager.add_path(params.id, path.clone()) {
            // The queues are already wired; roll back before reporting.
            tracing::warn!("registering path {} failed: {e}", params.id);
            if let Err(undo) = manager.disconnect_path(&path) {
                tracing::warn!("rollback of path {} failed: {undo}", params.id);
            }
            return Err("Error registering path. Path ID already exists...");
        }
        Ok(())
    })();

    let restart = manager.start_workers();
    match (result, restart) {
        (Ok(()), Ok(())) => ok_response(),
        (Err(msg), _) => error_response(msg.into()),
        (_, Err(e)) => error_response(format!("Error starting workers. {e}")),
    }
}

#[derive(Deserialize)]
struct AddWorkerParams {
    id: i32,
    #[serde(rename = "type")]
    kind: String,
    fps: Option<u32>,
}

fn add_worker(manager: &mut PipelineManager, params: &Value) -> Value {
    let Ok(params) = serde_json::from_value::<AddWorkerParams>(params.clone()) else {
        return error_response("Error creating worker. Invalid JSON format...".into());
    };

    let discipline = match params.kind.as_str() {
        "bestEffortMaster" => Discipline::BestEffortMaster,
        "bestEffortSlave" => Discipline::BestEffortSlave,
        "constantFramerateMaster" => match params.fps {
            Some(fps) if fps > 0 => Discipline::constant_rate(fps),
            _ => {
                return error_response(
                    "Error creating worker. Framerate is not valid...".into(),
                )
            }
        },
        "constantFramerateSlave" => Discipline::ConstantRateSlave,
        _ => return error_response("Error creating worker. Check type...".into()),
    };

    let worker = match Worker::new(params.id, discipline) {
        Ok(worker) => worker,
        Err(e) => return error_response(format!("Error creating worker. {e}")),
    };
    if manager.add_worker(params.id, worker).is_err() {
        return error_response("Error adding worker. Specified ID already exists...".into());
    }
    if let Err(e) = manager.start_workers() {
        return error_response(format!("Error starting workers. {e}"));
    }
    ok_response()
}

#[derive(Deserialize)]
struct AddSlavesParams {
    master: i32,
    slaves: Vec<i32>,
}

fn add_slaves_to_worker(manager: &mut PipelineManager, params: &Value) -> Value {
    let Ok(params) = serde_json::from_value::<AddSlavesParams>(params.clone()) else {
        return error_response("Error adding slaves to worker. Invalid JSON format...".into());
    };

    if let Err(e) = manager.stop_workers() {
        return error_response(format!("Error adding slaves to worker. {e}"));
    }
    let result = manager.add_slaves_to_worker(params.master, &params.slaves);
    let restart = manager.start_workers();

    match (result, restart) {
        (Ok(()), Ok(())) => ok_response(),
        (Err(_), _) => {
            error_response("Error adding slaves to worker. Invalid Master ID...".into())
        }
        (_, Err(e)) => error_response(format!("Error starting workers. {e}")),
    }
}

#[derive(Deserialize)]
struct AddFiltersParams {
    worker: i32,
    filters: Vec<i32>,
}

fn add_filters_to_worker(manager: &mut PipelineManager, params: &Value) -> Value {
    let Ok(params) = serde_json::from_value::<AddFiltersParams>(params.clone()) else {
        return error_response("Error adding filters to worker. Invalid JSON format...".into());
    };

    if let Err(e) = manager.stop_workers() {
        return error_response(format!("Error adding filters to worker. {e}"));
    }
    let result = (|| {
        for &filter_id in &params.filters {
            manager.add_filter_to_worker(params.worker, filter_id)?;
        }
        Ok::<_, crate::error::Error>(())
    })();
    let restart = manager.start_workers();

    match (result, restart) {
        (Ok(()), Ok(())) => ok_response(),
        (Err(_), _) => {
            error_response("Error adding filters to worker. Check worker and filter IDs...".into())
        }
        (_, Err(e)) => error_response(format!("Error starting workers. {e}")),
    }
}

#[derive(Deserialize)]
struct ReconfigAudioEncoderParams {
    #[serde(rename = "encoderID")]
    encoder_id: i32,
    codec: String,
    #[serde(rename = "sampleRate")]
    sample_rate: u32,
    channels: u32,
}

fn reconfig_audio_encoder(manager: &mut PipelineManager, params: &Value) -> Value {
    let Ok(params) = serde_json::from_value::<ReconfigAudioEncoderParams>(params.clone()) else {
        return error_response(
            "Error configure audio encoder. Encoder ID is not valid".into(),
        );
    };
    let Some(codec) = AudioCodec::from_token(&params.codec) else {
        return error_response("Error configure audio encoder. Codec is not valid...".into());
    };

    if let Err(e) = manager.stop_workers() {
        return error_response(format!("Error reconfiguring audio encoder. {e}"));
    }
    let result = manager.reconfig_audio_encoder(
        params.encoder_id,
        codec,
        params.sample_rate,
        params.channels,
    );
    let restart = manager.start_workers();

    match (result, restart) {
        (Ok(_), Ok(())) => ok_response(),
        (Err(_), _) => error_response("Error reconfiguring audio encoder".into()),
        (_, Err(e)) => error_response(format!("Error starting workers. {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PipelineManager {
        PipelineManager::new(1, 2).unwrap()
    }

    fn event(m: &mut PipelineManager, name: &str, params: Value) -> Value {
        handle_event(m, name, &params)
    }

    #[test]
    fn test_create_filter_event() {
        let mut m = manager();
        let resp = event(&mut m, "createFilter", json!({"id": 10, "type": "audioDecoder"}));
        assert!(resp["error"].is_null());
        assert!(m.filter(10).is_some());
    }

    #[test]
    fn test_create_filter_duplicate_id_message() {
        let mut m = manager();
        event(&mut m, "createFilter", json!({"id": 10, "type": "audioDecoder"}));
        let resp = event(&mut m, "createFilter", json!({"id": 10, "type": "audioEncoder"}));
        assert_eq!(
            resp["error"],
            "Error registering filter. Specified ID already exists.."
        );
    }

    #[test]
    fn test_create_filter_bad_type() {
        let mut m = manager();
        let resp = event(&mut m, "createFilter", json!({"id": 10, "type": "kazooDecoder"}));
        assert_eq!(
            resp["error"],
            "Error creating filter. Specified type is not correct.."
        );
    }

    #[test]
    fn test_create_filter_malformed() {
        let mut m = manager();
        let resp = event(&mut m, "createFilter", json!({"id": "ten"}));
        assert_eq!(resp["error"], "Error creating filter. Invalid JSON format...");
    }

    #[test]
    fn test_unknown_event() {
        let mut m = manager();
        let resp = event(&mut m, "selfDestruct", json!({}));
        assert_eq!(resp["error"], "Unknown event: selfDestruct");
    }

    #[test]
    fn test_constant_framerate_slave_is_reachable() {
        let mut m = manager();
        let resp = event(
            &mut m,
            "addWorker",
            json!({"id": 7, "type": "constantFramerateSlave", "fps": 0}),
        );
        assert!(resp["error"].is_null());

        let resp = event(
            &mut m,
            "addWorker",
            json!({"id": 8, "type": "constantFramerateMaster", "fps": 30}),
        );
        assert!(resp["error"].is_null());

        let resp = event(
            &mut m,
            "addSlavesToWorker",
            json!({"master": 8, "slaves": [7]}),
        );
        assert!(resp["error"].is_null());
        m.stop_workers().unwrap();
    }

    #[test]
    fn test_constant_framerate_master_requires_fps() {
        let mut m = manager();
        let resp = event(
            &mut m,
            "addWorker",
            json!({"id": 7, "type": "constantFramerateMaster", "fps": 0}),
        );
        assert_eq!(resp["error"], "Error creating worker. Framerate is not valid...");
    }

    #[test]
    fn test_get_state_event_reports_topology() {
        let mut m = manager();
        event(&mut m, "createFilter", json!({"id": 10, "type": "audioDecoder"}));
        event(&mut m, "createFilter", json!({"id": 11, "type": "audioEncoder"}));
        let resp = event(
            &mut m,
            "createPath",
            json!({
                "id": 100, "orgFilterId": 1, "dstFilterId": 2,
                "orgWriterId": -1, "dstReaderId": -1,
                "midFiltersIds": [10, 11], "sharedQueue": false
            }),
        );
        assert!(resp["error"].is_null());

        let state = event(&mut m, "getState", json!({}));
        assert!(state["error"].is_null());
        assert_eq!(state["filters"].as_array().unwrap().len(), 4);
        let paths = state["paths"].as_array().unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0]["filters"], json!([10, 11]));
        m.stop_workers().unwrap();
    }

    #[test]
    fn test_run_session_round_trip() {
        let mut m = manager();
        let input = concat!(
            r#"{"event": "createFilter", "params": {"id": 10, "type": "audioMixer"}}"#,
            "\n",
            r#"not json"#,
            "\n",
            r#"{"event": "getState", "params": {}}"#,
            "\n",
        );
        let mut output = Vec::new();
        run_session(&mut m, input.as_bytes(), &mut output).unwrap();

        let lines: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0]["error"].is_null());
        assert_eq!(lines[1]["error"], "Invalid JSON format...");
        assert!(lines[2]["error"].is_null());
    }
}
