use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::broker::pipeline;
use crate::broker::replay::ReplayBuffer;
use crate::broker::reply_table::ReplyTable;
use crate::broker::rpc;
use crate::channel::{SubprocessChannel, SubprocessEvent};
use crate::config::Config;
use crate::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Empty,
    Spawning,
    Active,
    Dead,
}

/// The eager-handshake state machine described in §4.3. `InFlight` carries
/// the client ids (in their original JSON form) parked waiting on the
/// cache to populate.
pub enum HandshakeState {
    NotStarted,
    InFlight(Vec<Value>),
    Cached(Value),
}

/// A frame the broker decided to deliver to whatever client is currently
/// attached. `Died` tells the attached forwarder to close with 4100.
/// `HandshakeFailed` tells it to close with 1011 — the eager handshake
/// itself came back an error, which §7 treats as fatal for the slot.
#[derive(Debug, Clone)]
pub enum ToClient {
    Frame(Value),
    Died,
    HandshakeFailed,
    Shutdown,
}

pub struct SlotState {
    pub phase: SlotPhase,
    pub channel: Option<SubprocessChannel>,
    pub handshake: HandshakeState,
    pub buffers: HashMap<String, ReplayBuffer>,
    pub active_agent_session: Option<String>,
    pub reply_table: ReplyTable,
    pub pending_handshake_ids: HashSet<String>,
    pub pending_creation_ids: HashSet<String>,
    pub pending_load_ids: HashMap<String, String>,
}

impl SlotState {
    pub(crate) fn empty() -> Self {
        SlotState {
            phase: SlotPhase::Empty,
            channel: None,
            handshake: HandshakeState::NotStarted,
            buffers: HashMap::new(),
            active_agent_session: None,
            reply_table: ReplyTable::new(),
            pending_handshake_ids: HashSet::new(),
            pending_creation_ids: HashSet::new(),
            pending_load_ids: HashMap::new(),
        }
    }
}

/// Handle returned to whichever forwarder currently owns the attachment.
/// Dropping it (or explicitly closing it) does not touch the subprocess.
pub struct Attachment {
    pub id: u64,
    pub close_rx: oneshot::Receiver<u16>,
}

pub struct Slot {
    pub id: String,
    pub cwd: String,
    pub state: Mutex<SlotState>,
    to_client: broadcast::Sender<ToClient>,
    attachment: Mutex<Option<(u64, oneshot::Sender<u16>)>>,
    next_attachment_id: AtomicU64,
}

const REAPER_INTERVAL: Duration = Duration::from_secs(1);

impl Slot {
    pub fn new(id: String, cwd: String) -> Arc<Self> {
        let (to_client, _) = broadcast::channel(256);
        let slot = Arc::new(Slot {
            id,
            cwd,
            state: Mutex::new(SlotState::empty()),
            to_client,
            attachment: Mutex::new(None),
            next_attachment_id: AtomicU64::new(1),
        });

        // One reaper per slot for its whole lifetime, independent of
        // respawns: each tick just reaps whatever reply table is current.
        let weak_self = Arc::downgrade(&slot);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAPER_INTERVAL);
            loop {
                interval.tick().await;
                let Some(slot) = weak_self.upgrade() else { break };
                let mut state = slot.state.lock().await;
                state.reply_table.reap_expired();
            }
        });

        slot
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ToClient> {
        self.to_client.subscribe()
    }

    pub fn broadcast_to_client(&self, msg: ToClient) -> Result<usize, broadcast::error::SendError<ToClient>> {
        self.to_client.send(msg)
    }

    /// Canonical string form of a JSON-RPC id, used as a HashMap key
    /// throughout the reply table and pending-id sets.
    pub fn id_key(id: &Value) -> String {
        serde_json::to_string(id).unwrap_or_default()
    }

    pub async fn snapshot(&self) -> (String, String, bool) {
        let attached = self.attachment.lock().await.is_some();
        (self.id.clone(), self.cwd.clone(), attached)
    }

    /// Registers a new attachment, closing any predecessor with a non-error
    /// close code first (invariant: single-attachment-per-slot).
    pub async fn attach(self: &Arc<Self>) -> Attachment {
        let (tx, rx) = oneshot::channel();
        let id = self.next_attachment_id.fetch_add(1, Ordering::Relaxed);
        let mut slot_attachment = self.attachment.lock().await;
        if let Some((_, prev)) = slot_attachment.take() {
            let _ = prev.send(crate::error::close_code::CLEAN);
        }
        *slot_attachment = Some((id, tx));
        Attachment { id, close_rx: rx }
    }

    /// Clears the slot's attachment only if `attachment_id` is still the
    /// current one — a later `attach()` call already replaced it and owns
    /// clearing the record itself.
    pub async fn detach_if_current(&self, attachment_id: u64) {
        let mut slot_attachment = self.attachment.lock().await;
        if matches!(slot_attachment.as_ref(), Some((id, _)) if *id == attachment_id) {
            *slot_attachment = None;
        }
    }

    /// Transitions EMPTY/DEAD → SPAWNING → ACTIVE, spawning the subprocess
    /// and the eager handshake. A no-op if already ACTIVE. DEAD → ACTIVE
    /// respawns are lazy: this is the only place that does so, called both
    /// from slot creation and from the first RPC/attachment that finds the
    /// slot dead.
    pub async fn ensure_active(self: &Arc<Self>, config: &Config) -> Result<(), BridgeError> {
        // The check and the EMPTY/DEAD → SPAWNING transition happen under one
        // lock acquisition so two concurrent callers can never both observe
        // "not active" and both spawn a subprocess. The guard stays held
        // across the spawn's `.await` (a `tokio::sync::Mutex` allows this) so
        // a second caller blocks on the lock and, once it acquires it, finds
        // the slot already ACTIVE (or DEAD, to retry) rather than racing.
        let mut state = self.state.lock().await;
        if state.phase == SlotPhase::Active {
            return Ok(());
        }
        state.phase = SlotPhase::Spawning;

        let mut env: Vec<(String, String)> = Vec::new();
        if let Some(dirs) = &config.skills_dirs {
            env.push(("COPILOT_SKILLS_DIRS".to_string(), dirs.clone()));
        }

        let spawned =
            SubprocessChannel::spawn(&config.agent_command, &config.agent_args, &self.cwd, &env).await;

        let mut events = match spawned {
            Ok((channel, events)) => {
                state.channel = Some(channel);
                state.phase = SlotPhase::Active;
                state.handshake = HandshakeState::InFlight(Vec::new());
                state.buffers.clear();
                state.active_agent_session = None;
                state.reply_table = ReplyTable::new();
                state.pending_handshake_ids.clear();
                state.pending_creation_ids.clear();
                state.pending_load_ids.clear();
                events
            }
            Err(e) => {
                state.phase = SlotPhase::Dead;
                return Err(e);
            }
        };
        drop(state);

        // Reader task: drains subprocess stdout for this slot's whole
        // lifetime, running the subprocess→client half of the pipeline.
        let weak_self = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(slot) = weak_self.upgrade() else { break };
                match event {
                    SubprocessEvent::Line(line) => {
                        let Ok(frame) = serde_json::from_str::<Value>(&line) else {
                            tracing::debug!(line = %line, "non-JSON line from subprocess, dropping");
                            continue;
                        };
                        let mut state = slot.state.lock().await;
                        let outcome = pipeline::handle_subprocess_frame(&mut state, frame);
                        drop(state);
                        match outcome {
                            pipeline::SubprocessOutcome::Forward(deliverables) => {
                                for deliverable in deliverables {
                                    let _ = slot.to_client.send(ToClient::Frame(deliverable));
                                }
                            }
                            pipeline::SubprocessOutcome::HandshakeFailed => {
                                let _ = slot.to_client.send(ToClient::HandshakeFailed);
                                break;
                            }
                        }
                    }
                    SubprocessEvent::StderrLine(_) => {}
                    SubprocessEvent::Closed(_) => {
                        let mut state = slot.state.lock().await;
                        state.phase = SlotPhase::Dead;
                        state.channel = None;
                        state.handshake = HandshakeState::NotStarted;
                        state.buffers.clear();
                        state.active_agent_session = None;
                        state
                            .reply_table
                            .reject_all(|| BridgeError::SlotNotFound("subprocess died".to_string()));
                        drop(state);
                        let _ = slot.to_client.send(ToClient::Died);
                        break;
                    }
                }
            }
        });

        // Eager handshake: fire immediately, before any client has arrived.
        let sentinel = Value::from(rpc::HANDSHAKE_SENTINEL_ID);
        let request = rpc::make_request(sentinel, rpc::method::HANDSHAKE, serde_json::json!({}));
        self.send_to_subprocess(&request.to_string()).await;

        Ok(())
    }

    pub async fn send_to_subprocess(&self, line: &str) {
        let mut state = self.state.lock().await;
        if let Some(channel) = state.channel.as_mut() {
            channel.send(line).await;
        }
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.phase == SlotPhase::Active
    }

    /// Tells any attached client to close with 1001 ahead of a process-wide
    /// shutdown. A no-op if nothing is currently subscribed.
    pub async fn close_for_shutdown(&self) {
        let _ = self.to_client.send(ToClient::Shutdown);
    }

    /// Kills the subprocess (if any) and marks the slot dead; used for
    /// explicit `destroySlot`.
    pub async fn kill(&self) {
        let channel = {
            let mut state = self.state.lock().await;
            state.phase = SlotPhase::Dead;
            state.reply_table.reject_all(|| BridgeError::ShuttingDown);
            state.buffers.clear();
            state.channel.take()
        };
        if let Some(channel) = channel {
            channel.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// §8.1 invariant 6: a new attachment closes exactly the previous one,
    /// with a clean (non-error) code.
    #[tokio::test]
    async fn second_attachment_closes_the_first_with_a_clean_code() {
        let slot = Slot::new("slot1".to_string(), "/tmp".to_string());

        let first = slot.attach().await;
        let second = slot.attach().await;

        let code = first.close_rx.await.unwrap();
        assert_eq!(code, crate::error::close_code::CLEAN);
        assert_ne!(first.id, second.id);

        // The second attachment is still current and unaffected.
        let attached = slot.attachment.lock().await;
        assert_eq!(attached.as_ref().map(|(id, _)| *id), Some(second.id));
    }

    #[tokio::test]
    async fn detach_if_current_is_a_no_op_for_a_superseded_attachment() {
        let slot = Slot::new("slot1".to_string(), "/tmp".to_string());
        let first = slot.attach().await;
        let _second = slot.attach().await;

        // The first attachment was already replaced; detaching it must not
        // clear the second one's record.
        slot.detach_if_current(first.id).await;
        assert!(slot.attachment.lock().await.is_some());
    }

    #[tokio::test]
    async fn ensure_active_is_a_no_op_once_active() {
        let slot = Slot::new("slot1".to_string(), "/tmp".to_string());
        {
            let mut state = slot.state.lock().await;
            state.phase = SlotPhase::Active;
        }
        let calls_before = Arc::strong_count(&slot);

        let config = Config::from_raw_values(0, false, false, None, false, Some("/tmp".into()), None, None);
        assert!(slot.ensure_active(&config).await.is_ok());

        // No respawn attempted: phase untouched, no extra task spun up off
        // the strong count beyond whatever `Slot::new`'s reaper already holds.
        assert_eq!(slot.state.lock().await.phase, SlotPhase::Active);
        assert_eq!(Arc::strong_count(&slot), calls_before);
    }

    #[tokio::test]
    async fn close_for_shutdown_broadcasts_shutdown() {
        let slot = Slot::new("slot1".to_string(), "/tmp".to_string());
        let mut rx = slot.subscribe();
        slot.close_for_shutdown().await;
        assert!(matches!(rx.try_recv().unwrap(), ToClient::Shutdown));
    }
}
