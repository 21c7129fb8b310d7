use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::broker::replay::ReplayBuffer;
use crate::broker::rpc::{self, method};
use crate::broker::slot::{HandshakeState, Slot, SlotPhase, SlotState, ToClient};
use crate::error::{rpc_code, BridgeError};

const SHELL_TIMEOUT: Duration = Duration::from_secs(30);

/// What the subprocess → client half of the pipeline decided to do with one
/// subprocess line. `Forward` carries every frame that should be delivered
/// to the attached client, in order (empty means fully intercepted).
/// `HandshakeFailed` tells the caller the slot just went DEAD and the
/// attached client (if any) must be closed with 1011 — there is nothing
/// left to forward.
pub enum SubprocessOutcome {
    Forward(Vec<Value>),
    HandshakeFailed,
}

/// The subprocess → client half of the Interception Pipeline (§4.8.2). Runs
/// with the slot's state locked.
pub fn handle_subprocess_frame(state: &mut SlotState, frame: Value) -> SubprocessOutcome {
    let Some(id) = rpc::frame_id(&frame).cloned() else {
        // Notification or malformed frame with no id.
        if rpc::is_notification(&frame) && rpc::frame_method(&frame) == Some(method::SESSION_UPDATE) {
            if let Some(session_id) = &state.active_agent_session {
                state
                    .buffers
                    .entry(session_id.clone())
                    .or_insert_with(ReplayBuffer::new)
                    .push(frame.clone());
            }
        }
        return SubprocessOutcome::Forward(vec![frame]);
    };

    let id_key = Slot::id_key(&id);

    if state.reply_table.resolve(&id_key, frame.clone()) {
        return SubprocessOutcome::Forward(vec![]);
    }

    if id.as_i64() == Some(rpc::HANDSHAKE_SENTINEL_ID) {
        return handle_handshake_response(state, frame);
    }

    if state.pending_handshake_ids.remove(&id_key) {
        if let Some(result) = frame.get("result") {
            state.handshake = HandshakeState::Cached(result.clone());
        }
        return SubprocessOutcome::Forward(vec![frame]);
    }

    if state.pending_creation_ids.remove(&id_key) {
        if let Some(session_id) = frame
            .get("result")
            .and_then(|r| r.get("sessionId"))
            .and_then(Value::as_str)
        {
            let mut buffer = ReplayBuffer::new();
            buffer.set_load_result(frame.clone());
            state.buffers.insert(session_id.to_string(), buffer);
            state.active_agent_session = Some(session_id.to_string());
        }
        return SubprocessOutcome::Forward(vec![frame]);
    }

    if let Some(session_id) = state.pending_load_ids.remove(&id_key) {
        if frame.get("result").is_some() {
            state
                .buffers
                .entry(session_id.clone())
                .or_insert_with(ReplayBuffer::new)
                .set_load_result(frame.clone());
            state.active_agent_session = Some(session_id);
            return SubprocessOutcome::Forward(vec![frame]);
        }
        if rpc::is_already_loaded_error(&frame) {
            // The subprocess refused the load only because the session is
            // already live — that's a success from the client's point of
            // view, so synthesize a coherent result rather than caching
            // (and handing back) the raw error frame.
            let synthesized = rpc::make_result_response(id, json!({ "sessionId": session_id }));
            state
                .buffers
                .entry(session_id.clone())
                .or_insert_with(ReplayBuffer::new)
                .set_load_result(synthesized.clone());
            state.active_agent_session = Some(session_id);
            return SubprocessOutcome::Forward(vec![synthesized]);
        }
        return SubprocessOutcome::Forward(vec![frame]);
    }

    if rpc::is_notification(&frame) && rpc::frame_method(&frame) == Some(method::SESSION_UPDATE) {
        if let Some(session_id) = &state.active_agent_session {
            state
                .buffers
                .entry(session_id.clone())
                .or_insert_with(ReplayBuffer::new)
                .push(frame.clone());
        }
    }

    SubprocessOutcome::Forward(vec![frame])
}

fn handle_handshake_response(state: &mut SlotState, frame: Value) -> SubprocessOutcome {
    let Some(result) = frame.get("result").cloned() else {
        // The eager handshake itself failed. §7 treats this as fatal for
        // the whole slot: mark it DEAD, drop the subprocess channel (its
        // `kill_on_drop` finishes the teardown), and reject anything
        // waiting on the reply table before the caller closes the socket.
        state.handshake = HandshakeState::NotStarted;
        state.phase = SlotPhase::Dead;
        state.channel = None;
        state.buffers.clear();
        state.active_agent_session = None;
        state
            .reply_table
            .reject_all(|| BridgeError::SlotNotFound("handshake failed".to_string()));
        return SubprocessOutcome::HandshakeFailed;
    };

    let waiters = match std::mem::replace(&mut state.handshake, HandshakeState::Cached(result.clone())) {
        HandshakeState::InFlight(waiters) => waiters,
        _ => Vec::new(),
    };

    SubprocessOutcome::Forward(
        waiters
            .into_iter()
            .map(|client_id| rpc::make_result_response(client_id, result.clone()))
            .collect(),
    )
}

/// The client → subprocess half of the pipeline (§4.8.1). Performs any
/// local handling (responding directly on the slot's broadcast channel)
/// and otherwise forwards to the subprocess, recording pending ids first.
pub async fn handle_client_frame(slot: &Arc<Slot>, frame: Value) {
    let method_name = rpc::frame_method(&frame).map(str::to_string);

    match method_name.as_deref() {
        Some(method::SHELL) => {
            handle_shell(slot, frame).await;
            return;
        }
        Some(method::RENAME_SESSION) => {
            handle_rename_session(slot, frame).await;
            return;
        }
        _ => {}
    }

    if method_name.as_deref() == Some(method::HANDSHAKE) {
        let client_id = rpc::frame_id(&frame).cloned();
        let immediate = {
            let mut state = slot.state.lock().await;
            match &mut state.handshake {
                HandshakeState::Cached(result) => {
                    client_id.map(|id| rpc::make_result_response(id, result.clone()))
                }
                HandshakeState::InFlight(waiters) => {
                    if let Some(id) = client_id {
                        waiters.push(id);
                    }
                    None
                }
                HandshakeState::NotStarted => {
                    if let Some(id) = &client_id {
                        state.pending_handshake_ids.insert(Slot::id_key(id));
                    }
                    forward(slot, &frame).await;
                    None
                }
            }
        };
        if let Some(response) = immediate {
            deliver(slot, response);
        }
        return;
    }

    if method_name.as_deref() == Some(method::SESSION_NEW) {
        if let Some(id) = rpc::frame_id(&frame) {
            let mut state = slot.state.lock().await;
            state.pending_creation_ids.insert(Slot::id_key(id));
        }
        forward(slot, &frame).await;
        return;
    }

    if method_name.as_deref() == Some(method::SESSION_LOAD) {
        let session_id = frame
            .get("params")
            .and_then(|p| p.get("sessionId"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let replay = {
            let mut state = slot.state.lock().await;
            match (&session_id, rpc::frame_id(&frame)) {
                (Some(sid), Some(id)) => {
                    if let Some(buffer) = state.buffers.get(sid) {
                        let snapshot = buffer.clone();
                        state.active_agent_session = Some(sid.clone());
                        // The buffer exists but hasn't been populated with a
                        // load result yet (e.g. a concurrent load is still
                        // in flight) — register so the eventual subprocess
                        // response still completes this request, same as
                        // the "no buffer at all" branch below.
                        if snapshot.load_result.is_none() {
                            state.pending_load_ids.insert(Slot::id_key(id), sid.clone());
                        }
                        Some((id.clone(), snapshot))
                    } else {
                        state.pending_load_ids.insert(Slot::id_key(id), sid.clone());
                        None
                    }
                }
                _ => None,
            }
        };

        match replay {
            Some((client_id, snapshot)) if snapshot.load_result.is_some() => {
                let mut sequence = snapshot.replay_sequence();
                if let Some(cached) = sequence.first_mut() {
                    cached["id"] = client_id;
                }
                for frame in sequence {
                    deliver(slot, frame);
                }
            }
            Some((client_id, _)) => {
                let mut forwarded = frame.clone();
                forwarded["id"] = client_id;
                forward(slot, &forwarded).await;
            }
            None => {
                forward(slot, &frame).await;
            }
        }
        return;
    }

    if method_name.as_deref() == Some(method::SESSION_PROMPT) {
        forward(slot, &frame).await;

        let parts = frame
            .get("params")
            .and_then(|p| p.get("prompt"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let session_id = frame
            .get("params")
            .and_then(|p| p.get("sessionId"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let text_parts: Vec<&Value> = parts
            .iter()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
            .collect();

        if !text_parts.is_empty() {
            let mut state = slot.state.lock().await;
            let target = session_id.or_else(|| state.active_agent_session.clone());
            if let Some(session_id) = target {
                let buffer = state.buffers.entry(session_id.clone()).or_insert_with(ReplayBuffer::new);
                for part in text_parts {
                    let text = part.get("text").and_then(Value::as_str).unwrap_or_default();
                    let notification = rpc::make_notification(
                        method::SESSION_UPDATE,
                        json!({ "sessionId": session_id, "update": { "type": "user_message", "text": text } }),
                    );
                    buffer.push(notification);
                }
            }
        }
        return;
    }

    forward(slot, &frame).await;
}

async fn forward(slot: &Arc<Slot>, frame: &Value) {
    slot.send_to_subprocess(&frame.to_string()).await;
}

fn deliver(slot: &Arc<Slot>, frame: Value) {
    let _ = slot.broadcast_to_client(ToClient::Frame(frame));
}

async fn handle_shell(slot: &Arc<Slot>, frame: Value) {
    let Some(id) = rpc::frame_id(&frame).cloned() else { return };
    let command = frame
        .get("params")
        .and_then(|p| p.get("command"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let Some(command) = command else {
        deliver(
            slot,
            rpc::make_error_response(id, rpc_code::INVALID_PARAMS, "missing 'command' parameter"),
        );
        return;
    };

    let cwd = slot.cwd.clone();
    let run = async move {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let status = child.wait().await?;

        let mut out = String::new();
        let mut err = String::new();
        if let Some(mut s) = stdout {
            use tokio::io::AsyncReadExt;
            let _ = s.read_to_string(&mut out).await;
        }
        if let Some(mut s) = stderr {
            use tokio::io::AsyncReadExt;
            let _ = s.read_to_string(&mut err).await;
        }

        std::io::Result::Ok((out, err, status.code().unwrap_or(-1)))
    };

    match tokio::time::timeout(SHELL_TIMEOUT, run).await {
        Ok(Ok((stdout, stderr, exit_code))) => {
            deliver(
                slot,
                rpc::make_result_response(
                    id,
                    json!({ "stdout": stdout, "stderr": stderr, "exitCode": exit_code }),
                ),
            );
        }
        Ok(Err(e)) => {
            deliver(
                slot,
                rpc::make_error_response(id, rpc_code::INTERNAL_ERROR, &e.to_string()),
            );
        }
        Err(_) => {
            deliver(
                slot,
                rpc::make_error_response(id, rpc_code::SHELL_TIMEOUT, "shell command timed out"),
            );
        }
    }
}

async fn handle_rename_session(slot: &Arc<Slot>, frame: Value) {
    let Some(id) = rpc::frame_id(&frame).cloned() else { return };
    let title = frame
        .get("params")
        .and_then(|p| p.get("title"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    // Best-effort, write-through only: the open question in the design
    // notes is whether the subprocess re-reads this file, so the broker
    // never inspects the result and always reports success.
    let path = std::path::Path::new(&slot.cwd).join(".copilot-session-title");
    let _ = tokio::fs::write(&path, format!("summary: {title}\n")).await;

    deliver(slot, rpc::make_result_response(id, json!({ "ok": true })));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::slot::Slot;

    fn new_state() -> SlotState {
        SlotState::empty()
    }

    fn forwarded(outcome: SubprocessOutcome) -> Vec<Value> {
        match outcome {
            SubprocessOutcome::Forward(frames) => frames,
            SubprocessOutcome::HandshakeFailed => panic!("expected Forward, got HandshakeFailed"),
        }
    }

    #[test]
    fn handshake_sentinel_response_releases_parked_waiters() {
        let mut state = new_state();
        state.handshake = HandshakeState::InFlight(vec![json!(1), json!(2)]);

        let frame = rpc::make_result_response(Value::from(rpc::HANDSHAKE_SENTINEL_ID), json!({ "ok": true }));
        let delivered = forwarded(handle_subprocess_frame(&mut state, frame));

        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0]["id"], json!(1));
        assert_eq!(delivered[1]["id"], json!(2));
        assert!(matches!(state.handshake, HandshakeState::Cached(_)));
    }

    #[test]
    fn handshake_sentinel_error_marks_the_slot_dead() {
        let mut state = new_state();
        state.phase = SlotPhase::Active;
        state.handshake = HandshakeState::InFlight(vec![json!(1)]);
        let _rx = state.reply_table.register("99".to_string());

        let frame = rpc::make_error_response(
            Value::from(rpc::HANDSHAKE_SENTINEL_ID),
            rpc_code::INTERNAL_ERROR,
            "boom",
        );
        let outcome = handle_subprocess_frame(&mut state, frame);

        assert!(matches!(outcome, SubprocessOutcome::HandshakeFailed));
        assert_eq!(state.phase, SlotPhase::Dead);
        assert!(matches!(state.handshake, HandshakeState::NotStarted));
        assert!(state.channel.is_none());
        assert!(!state.reply_table.contains("99"));
    }

    #[test]
    fn session_creation_response_opens_a_replay_buffer() {
        let mut state = new_state();
        state.pending_creation_ids.insert(Slot::id_key(&json!(7)));

        let frame = rpc::make_result_response(json!(7), json!({ "sessionId": "s1" }));
        let delivered = forwarded(handle_subprocess_frame(&mut state, frame.clone()));

        assert_eq!(delivered, vec![frame]);
        assert!(state.buffers.contains_key("s1"));
        assert_eq!(state.active_agent_session.as_deref(), Some("s1"));
    }

    #[test]
    fn session_update_notifications_buffer_under_the_active_session() {
        let mut state = new_state();
        state.active_agent_session = Some("s1".to_string());
        state.buffers.insert("s1".to_string(), ReplayBuffer::new());

        let notification = rpc::make_notification(method::SESSION_UPDATE, json!({ "sessionId": "s1" }));
        let delivered = forwarded(handle_subprocess_frame(&mut state, notification.clone()));

        assert_eq!(delivered, vec![notification]);
        assert_eq!(state.buffers["s1"].history.len(), 1);
    }

    #[test]
    fn a_resolved_reply_table_entry_is_fully_intercepted() {
        let mut state = new_state();
        let _rx = state.reply_table.register("9".to_string());

        let frame = rpc::make_result_response(json!(9), json!("done"));
        let delivered = forwarded(handle_subprocess_frame(&mut state, frame));

        assert!(delivered.is_empty());
    }

    #[test]
    fn already_loaded_error_synthesizes_a_success_result_for_caching() {
        let mut state = new_state();
        state.pending_load_ids.insert(Slot::id_key(&json!(5)), "s1".to_string());

        let error = rpc::make_error_response(json!(5), -32000, "session already loaded elsewhere");
        let delivered = forwarded(handle_subprocess_frame(&mut state, error));

        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0]["result"]["sessionId"], json!("s1"));
        assert!(delivered[0].get("error").is_none());

        let cached = state.buffers["s1"].load_result.clone().unwrap();
        assert!(cached.get("result").is_some(), "cached load_result must be a success frame, not the raw error");
        assert_eq!(state.active_agent_session.as_deref(), Some("s1"));
    }

    #[test]
    fn genuine_load_failure_is_forwarded_without_caching() {
        let mut state = new_state();
        state.pending_load_ids.insert(Slot::id_key(&json!(6)), "s1".to_string());

        let error = rpc::make_error_response(json!(6), rpc_code::INTERNAL_ERROR, "disk full");
        let delivered = forwarded(handle_subprocess_frame(&mut state, error.clone()));

        assert_eq!(delivered, vec![error]);
        assert!(!state.buffers.contains_key("s1"));
    }

    #[tokio::test]
    async fn handshake_forwarded_when_not_started_and_cached_from_the_response() {
        let dir = tempfile::tempdir().unwrap();
        let slot = Slot::new("slot1".to_string(), dir.path().to_string_lossy().into_owned());
        let mut rx = slot.subscribe();

        let request = rpc::make_request(json!(1), method::HANDSHAKE, json!({}));
        handle_client_frame(&slot, request).await;

        // NotStarted forwards (to a channel-less slot, so nothing is sent
        // downstream) and parks the client id.
        assert!(rx.try_recv().is_err());
        {
            let state = slot.state.lock().await;
            assert!(state.pending_handshake_ids.contains(&Slot::id_key(&json!(1))));
        }

        let response = rpc::make_result_response(json!(1), json!({ "ok": true }));
        let delivered = {
            let mut state = slot.state.lock().await;
            forwarded(handle_subprocess_frame(&mut state, response))
        };
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0]["id"], json!(1));

        let state = slot.state.lock().await;
        assert!(matches!(state.handshake, HandshakeState::Cached(_)));
    }

    #[tokio::test]
    async fn rename_session_writes_title_file_and_always_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let slot = Slot::new("slot1".to_string(), dir.path().to_string_lossy().into_owned());
        let mut rx = slot.subscribe();

        let frame = rpc::make_request(json!(1), method::RENAME_SESSION, json!({ "title": "hello" }));
        handle_client_frame(&slot, frame).await;

        match rx.try_recv().unwrap() {
            ToClient::Frame(f) => assert_eq!(f["result"]["ok"], json!(true)),
            other => panic!("expected a frame, got {other:?}"),
        }

        let content = tokio::fs::read_to_string(dir.path().join(".copilot-session-title"))
            .await
            .unwrap();
        assert_eq!(content, "summary: hello\n");
    }

    /// Scenario A (§8.4): handshake → session creation → prompt, driven
    /// end to end through both halves of the pipeline against a
    /// channel-less slot (the subprocess side is simulated by feeding the
    /// forwarded frame straight into `handle_subprocess_frame`).
    #[tokio::test]
    async fn scenario_a_cold_start_simple_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let slot = Slot::new("slot1".to_string(), dir.path().to_string_lossy().into_owned());
        let mut rx = slot.subscribe();

        // Eager handshake already resolved before any client attaches.
        {
            let mut state = slot.state.lock().await;
            state.phase = SlotPhase::Active;
            state.handshake = HandshakeState::InFlight(vec![]);
            let sentinel_response =
                rpc::make_result_response(Value::from(rpc::HANDSHAKE_SENTINEL_ID), json!({ "ok": true }));
            forwarded(handle_subprocess_frame(&mut state, sentinel_response));
        }

        // Client sends handshake with id 1: served from cache, one frame out.
        handle_client_frame(&slot, rpc::make_request(json!(1), method::HANDSHAKE, json!({}))).await;
        match rx.try_recv().unwrap() {
            ToClient::Frame(f) => assert_eq!(f["id"], json!(1)),
            other => panic!("unexpected {other:?}"),
        }

        // Agent-session creation with id 2.
        handle_client_frame(&slot, rpc::make_request(json!(2), method::SESSION_NEW, json!({}))).await;
        let created = rpc::make_result_response(json!(2), json!({ "sessionId": "s1" }));
        let delivered = {
            let mut state = slot.state.lock().await;
            forwarded(handle_subprocess_frame(&mut state, created))
        };
        for frame in delivered {
            let _ = slot.broadcast_to_client(ToClient::Frame(frame));
        }
        match rx.try_recv().unwrap() {
            ToClient::Frame(f) => assert_eq!(f["result"]["sessionId"], json!("s1")),
            other => panic!("unexpected {other:?}"),
        }

        // Prompt "hello" with id 3: zero text parts would buffer nothing
        // (§8.3); here there's exactly one, so exactly one user_message.
        let prompt = rpc::make_request(
            json!(3),
            method::SESSION_PROMPT,
            json!({ "sessionId": "s1", "prompt": [{ "type": "text", "text": "hello" }] }),
        );
        handle_client_frame(&slot, prompt).await;

        // Subprocess streams one session-update, then acks with id 3.
        let update = rpc::make_notification(method::SESSION_UPDATE, json!({ "sessionId": "s1", "update": {} }));
        let ack = rpc::make_result_response(json!(3), json!({}));
        {
            let mut state = slot.state.lock().await;
            forwarded(handle_subprocess_frame(&mut state, update));
            forwarded(handle_subprocess_frame(&mut state, ack));
        }

        let state = slot.state.lock().await;
        assert_eq!(state.phase, SlotPhase::Active, "slot survives client disconnect");
        let history = &state.buffers["s1"].history;
        assert_eq!(history.len(), 2, "user_message + the streamed session-update");
        assert_eq!(history[0]["params"]["update"]["type"], json!("user_message"));
        assert_eq!(history[0]["params"]["update"]["text"], json!("hello"));
    }

    /// Scenario B (§8.4): a reconnect's agent-session-load is served
    /// entirely from the Replay Buffer, with no subprocess round-trip.
    #[tokio::test]
    async fn scenario_b_reconnect_triggers_replay() {
        let dir = tempfile::tempdir().unwrap();
        let slot = Slot::new("slot1".to_string(), dir.path().to_string_lossy().into_owned());

        {
            let mut state = slot.state.lock().await;
            let mut buffer = ReplayBuffer::new();
            buffer.set_load_result(rpc::make_result_response(json!(2), json!({ "sessionId": "s1" })));
            buffer.push(rpc::make_notification(method::SESSION_UPDATE, json!({ "n": 1 })));
            buffer.push(rpc::make_notification(method::SESSION_UPDATE, json!({ "n": 2 })));
            state.buffers.insert("s1".to_string(), buffer);
        }

        let mut rx = slot.subscribe();
        let load = rpc::make_request(json!(11), method::SESSION_LOAD, json!({ "sessionId": "s1" }));
        handle_client_frame(&slot, load).await;

        let first = match rx.try_recv().unwrap() {
            ToClient::Frame(f) => f,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(first["id"], json!(11), "replayed load result carries the new client's id");
        let second = match rx.try_recv().unwrap() {
            ToClient::Frame(f) => f,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(second["params"]["n"], json!(1));
        let third = match rx.try_recv().unwrap() {
            ToClient::Frame(f) => f,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(third["params"]["n"], json!(2));
        assert!(rx.try_recv().is_err(), "exactly the cached sequence, nothing more");

        // No traffic reached the subprocess: the channel is None for this
        // test slot, so forwarding would have been a silent no-op either
        // way, but pending_load_ids must also stay empty (replay fully
        // satisfied the request rather than parking it).
        let state = slot.state.lock().await;
        assert!(state.pending_load_ids.is_empty());
    }

    /// §8.3: a prompt with zero text parts produces zero synthetic
    /// user-message notifications.
    #[tokio::test]
    async fn prompt_with_no_text_parts_buffers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let slot = Slot::new("slot1".to_string(), dir.path().to_string_lossy().into_owned());
        {
            let mut state = slot.state.lock().await;
            state.active_agent_session = Some("s1".to_string());
            state.buffers.insert("s1".to_string(), ReplayBuffer::new());
        }

        let prompt = rpc::make_request(
            json!(4),
            method::SESSION_PROMPT,
            json!({ "sessionId": "s1", "prompt": [{ "type": "image", "data": "..." }] }),
        );
        handle_client_frame(&slot, prompt).await;

        let state = slot.state.lock().await;
        assert!(state.buffers["s1"].history.is_empty());
    }
}
