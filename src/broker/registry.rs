use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::broker::slot::Slot;
use crate::config::Config;
use crate::error::BridgeError;

/// Recommended upper bound on concurrent slots (§4.4).
const MAX_SLOTS: usize = 4;

/// Process-wide collection of Session Slots. Mutating operations
/// (create/destroy) take the write lock; `get`/`list_active` only read.
pub struct Registry {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Registry {
            slots: RwLock::new(HashMap::new()),
        })
    }

    pub async fn create_slot(&self, cwd: String, config: &Config) -> Result<Arc<Slot>, BridgeError> {
        let mut slots = self.slots.write().await;
        if slots.len() >= MAX_SLOTS {
            return Err(BridgeError::RegistryFull);
        }
        let id = Uuid::new_v4().to_string();
        let slot = Slot::new(id.clone(), cwd);
        slots.insert(id, slot.clone());
        drop(slots);

        slot.ensure_active(config).await?;
        Ok(slot)
    }

    pub async fn get(&self, slot_id: &str) -> Option<Arc<Slot>> {
        self.slots.read().await.get(slot_id).cloned()
    }

    /// Returns the slot, respawning its subprocess if it was DEAD. The
    /// Replay Buffer is untouched by a respawn — it was already cleared
    /// when the previous subprocess died.
    pub async fn get_or_respawn(&self, slot_id: &str, config: &Config) -> Result<Arc<Slot>, BridgeError> {
        let slot = self
            .get(slot_id)
            .await
            .ok_or_else(|| BridgeError::SlotNotFound(slot_id.to_string()))?;
        slot.ensure_active(config).await?;
        Ok(slot)
    }

    pub async fn destroy_slot(&self, slot_id: &str) -> Result<(), BridgeError> {
        let slot = {
            let mut slots = self.slots.write().await;
            slots.remove(slot_id)
        };
        match slot {
            Some(slot) => {
                slot.kill().await;
                Ok(())
            }
            None => Err(BridgeError::SlotNotFound(slot_id.to_string())),
        }
    }

    pub async fn list_active(&self) -> Vec<(String, String, bool)> {
        let slots = self.slots.read().await;
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots.values() {
            out.push(slot.snapshot().await);
        }
        out
    }

    pub async fn by_cwd(&self, cwd: &str) -> Vec<Arc<Slot>> {
        self.slots
            .read()
            .await
            .values()
            .filter(|s| s.cwd == cwd)
            .cloned()
            .collect()
    }

    /// Broadcasts a graceful close to every attached client and kills every
    /// subprocess, in parallel. Called once, from the shutdown signal handler.
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<Slot>> = self.slots.read().await.values().cloned().collect();
        let closes = slots.iter().map(|slot| slot.close_for_shutdown());
        futures_util::future::join_all(closes).await;
        let kills = slots.iter().map(|slot| slot.kill());
        futures_util::future::join_all(kills).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::from_raw_values(0, false, false, None, false, Some("/tmp".into()), Some("true"), None)
    }

    #[tokio::test]
    async fn create_slot_enforces_upper_bound() {
        let registry = Registry::new();
        let config = test_config();
        for _ in 0..MAX_SLOTS {
            registry.create_slot("/tmp".to_string(), &config).await.unwrap();
        }
        let result = registry.create_slot("/tmp".to_string(), &config).await;
        assert!(matches!(result, Err(BridgeError::RegistryFull)));
    }

    #[tokio::test]
    async fn destroy_unknown_slot_errors() {
        let registry = Registry::new();
        let result = registry.destroy_slot("nope").await;
        assert!(matches!(result, Err(BridgeError::SlotNotFound(_))));
    }
}
