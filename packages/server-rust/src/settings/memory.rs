//! In-process [`ConfigStore`] with long-poll semantics.
//!
//! Every write bumps a store-wide index, the way Consul's raft index does,
//! so modify-indices are strictly increasing across keys.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{ConfigStore, KvPair, ModifyIndex, StoreError};
use tokio::sync::watch;

#[derive(Debug, Default)]
struct Entries {
    values: HashMap<String, KvPair>,
    last_index: u64,
}

/// Key/value store held in memory. Used for tests and single-process runs.
#[derive(Debug)]
pub struct MemoryStore {
    state: watch::Sender<Entries>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(Entries::default());
        Self { state }
    }

    /// Removes `key`, waking pollers blocked on it.
    pub fn delete(&self, key: &str) {
        self.state.send_modify(|entries| {
            entries.last_index += 1;
            entries.values.remove(key);
        });
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(
        &self,
        key: &str,
        wait_index: ModifyIndex,
        wait: Duration,
    ) -> Result<Option<KvPair>, StoreError> {
        let mut changes = self.state.subscribe();
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);

        loop {
            let current = changes.borrow_and_update().values.get(key).cloned();
            let observed = current.as_ref().map(|pair| pair.modify_index);
            if wait_index == ModifyIndex::ZERO || observed != Some(wait_index) {
                return Ok(current);
            }

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Ok(current);
                    }
                }
                () = &mut deadline => return Ok(current),
            }
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.state.send_modify(|entries| {
            entries.last_index += 1;
            let pair = KvPair {
                key: key.to_string(),
                value,
                modify_index: ModifyIndex::new(entries.last_index),
            };
            entries.values.insert(key.to_string(), pair);
        });
        Ok(())
    }
}
