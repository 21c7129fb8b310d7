use serde_json::Value;

/// Per-agent-session history: the cached load/creation result plus every
/// notification observed since, in order. Entries are append-only within a
/// given agent session and the whole buffer is dropped with its slot's
/// subprocess.
#[derive(Debug, Default, Clone)]
pub struct ReplayBuffer {
    pub load_result: Option<Value>,
    pub history: Vec<Value>,
}

impl ReplayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_load_result(&mut self, frame: Value) {
        self.load_result = Some(frame);
    }

    pub fn push(&mut self, notification: Value) {
        self.history.push(notification);
    }

    /// The exact sequence a reconnecting client should receive: the cached
    /// load result followed by every notification, in original order.
    pub fn replay_sequence(&self) -> Vec<Value> {
        let mut out = Vec::with_capacity(1 + self.history.len());
        if let Some(result) = &self.load_result {
            out.push(result.clone());
        }
        out.extend(self.history.iter().cloned());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replay_sequence_preserves_order() {
        let mut buf = ReplayBuffer::new();
        buf.set_load_result(json!({"id": 11, "result": "loaded"}));
        buf.push(json!({"method": "session-update", "params": {"n": 1}}));
        buf.push(json!({"method": "session-update", "params": {"n": 2}}));

        let seq = buf.replay_sequence();
        assert_eq!(seq.len(), 3);
        assert_eq!(seq[0], json!({"id": 11, "result": "loaded"}));
        assert_eq!(seq[1]["params"]["n"], 1);
        assert_eq!(seq[2]["params"]["n"], 2);
    }

    #[test]
    fn empty_agent_session_replays_only_load_result() {
        let mut buf = ReplayBuffer::new();
        buf.set_load_result(json!({"id": 1, "result": {}}));
        assert_eq!(buf.replay_sequence().len(), 1);
    }
}
