use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::BridgeError;

/// §4.5/§9: a waiter the table hasn't heard back about within this long is
/// rejected and removed by the reaper.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

struct Waiter {
    tx: oneshot::Sender<Result<Value, BridgeError>>,
    deadline: Instant,
}

/// Per-slot map from request id to a pending continuation, for
/// broker-originated requests only. Client-originated requests never touch
/// this table — their responses are just forwarded.
#[derive(Default)]
pub struct ReplyTable {
    pending: HashMap<String, Waiter>,
}

impl ReplyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in the response for `id_key` (the canonical
    /// string form of a JSON-RPC id — see `Slot::id_key`), with the
    /// default 10 s deadline. Returns a receiver the caller awaits.
    pub fn register(&mut self, id_key: String) -> oneshot::Receiver<Result<Value, BridgeError>> {
        self.register_with_timeout(id_key, DEFAULT_TIMEOUT)
    }

    pub fn register_with_timeout(
        &mut self,
        id_key: String,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<Value, BridgeError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id_key,
            Waiter {
                tx,
                deadline: Instant::now() + timeout,
            },
        );
        rx
    }

    /// Resolves a pending waiter with a successful response frame. Returns
    /// true if there was a waiter (a "hit"); false means this id does not
    /// belong to the broker and should be treated as ordinary traffic.
    pub fn resolve(&mut self, id_key: &str, frame: Value) -> bool {
        match self.pending.remove(id_key) {
            Some(waiter) => {
                let _ = waiter.tx.send(Ok(frame));
                true
            }
            None => false,
        }
    }

    pub fn reject(&mut self, id_key: &str, err: BridgeError) {
        if let Some(waiter) = self.pending.remove(id_key) {
            let _ = waiter.tx.send(Err(err));
        }
    }

    pub fn remove(&mut self, id_key: &str) {
        self.pending.remove(id_key);
    }

    pub fn contains(&self, id_key: &str) -> bool {
        self.pending.contains_key(id_key)
    }

    /// Rejects every outstanding waiter, e.g. on subprocess death or
    /// broker shutdown.
    pub fn reject_all(&mut self, err_factory: impl Fn() -> BridgeError) {
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.tx.send(Err(err_factory()));
        }
    }

    /// Removes and rejects every waiter past its deadline with
    /// `BridgeError::Timeout`. Called on a tick by the slot's dedicated
    /// reaper task (see `Slot::new`). Returns how many were reaped.
    pub fn reap_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, w)| w.deadline <= now)
            .map(|(id_key, _)| id_key.clone())
            .collect();
        let count = expired.len();
        for id_key in expired {
            self.reject(&id_key, BridgeError::Timeout);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_reports_hit_or_miss() {
        let mut table = ReplyTable::new();
        let _rx = table.register("1".to_string());
        assert!(table.resolve("1", json!({"ok": true})));
        assert!(!table.resolve("1", json!({"ok": true})));
        assert!(!table.resolve("missing", json!(null)));
    }

    #[tokio::test]
    async fn registered_waiter_receives_resolved_value() {
        let mut table = ReplyTable::new();
        let rx = table.register("42".to_string());
        table.resolve("42", json!({"result": 7}));
        let got = rx.await.unwrap().unwrap();
        assert_eq!(got, json!({"result": 7}));
    }

    #[tokio::test]
    async fn reap_expired_rejects_and_removes_stale_waiters() {
        let mut table = ReplyTable::new();
        let rx = table.register_with_timeout("slow".to_string(), Duration::from_millis(1));
        let fresh_rx = table.register_with_timeout("fresh".to_string(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let reaped = table.reap_expired();

        assert_eq!(reaped, 1);
        assert!(!table.contains("slow"));
        assert!(table.contains("fresh"));
        assert!(matches!(rx.await.unwrap(), Err(BridgeError::Timeout)));
        drop(fresh_rx);
    }
}
