//! Per-credential adapter cache owned by the worker.
//!
//! Entries are keyed by the SHA-256 of the credential so the raw cookie never
//! becomes a map key or shows up in logs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use super::{spawn_destroy_context, ClientFactory, GenerationClient, GenerationContext, GenerationError};
use crate::types::ReferenceImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub capacity: usize,
    pub context_max_uses: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: 5,
            context_max_uses: 10,
        }
    }
}

pub fn credential_key(credential: &str) -> String {
    format!("{:x}", Sha256::digest(credential.as_bytes()))
}

struct ContextSlot {
    context: GenerationContext,
    job_id: String,
    uses: u32,
}

struct PoolEntry {
    client: Arc<dyn GenerationClient>,
    context: Option<ContextSlot>,
    last_used: Instant,
}

impl PoolEntry {
    fn release_context(&mut self) {
        if let Some(slot) = self.context.take() {
            spawn_destroy_context(Arc::clone(&self.client), slot.context);
        }
    }
}

/// Client plus the context it should generate in.
#[derive(Clone)]
pub struct Lease {
    pub client: Arc<dyn GenerationClient>,
    pub context: GenerationContext,
}

pub struct AdapterPool {
    factory: Arc<dyn ClientFactory>,
    settings: PoolSettings,
    entries: HashMap<String, PoolEntry>,
}

impl AdapterPool {
    pub fn new(factory: Arc<dyn ClientFactory>, settings: PoolSettings) -> Self {
        Self {
            factory,
            settings,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, credential: &str) -> bool {
        self.entries.contains_key(&credential_key(credential))
    }

    /// Get the pooled client for `credential` and a context scoped to
    /// `job_id`. The context is recreated when the job changes or after
    /// `context_max_uses` generations.
    pub async fn acquire(
        &mut self,
        credential: &str,
        job_id: &str,
        references: &[ReferenceImage],
    ) -> Result<Lease, GenerationError> {
        let key = credential_key(credential);

        if !self.entries.contains_key(&key) {
            self.evict_if_full();
            let client = self.factory.client_for(credential)?;
            self.entries.insert(
                key.clone(),
                PoolEntry {
                    client,
                    context: None,
                    last_used: Instant::now(),
                },
            );
            debug!(pool_size = self.entries.len(), "Pooled new generation client");
        }

        let max_uses = self.settings.context_max_uses;
        let client = {
            let Some(entry) = self.entries.get_mut(&key) else {
                return Err(GenerationError::Transport("adapter pool entry vanished".into()));
            };
            entry.last_used = Instant::now();
            let expired = entry
                .context
                .as_ref()
                .is_some_and(|slot| slot.job_id != job_id || slot.uses >= max_uses);
            if expired {
                entry.release_context();
            }
            if let Some(slot) = entry.context.as_mut() {
                slot.uses += 1;
                return Ok(Lease {
                    client: Arc::clone(&entry.client),
                    context: slot.context.clone(),
                });
            }
            Arc::clone(&entry.client)
        };

        let context = client
            .create_context(&format!("bulkgen-{job_id}"), references)
            .await?;
        debug!(job_id, context_id = %context.id, "Created generation context");

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.context = Some(ContextSlot {
                context: context.clone(),
                job_id: job_id.to_string(),
                uses: 1,
            });
        }
        Ok(Lease { client, context })
    }

    /// Drop the cached context for `credential` so the next acquire starts
    /// fresh.
    pub fn invalidate_context(&mut self, credential: &str) {
        if let Some(entry) = self.entries.get_mut(&credential_key(credential)) {
            entry.release_context();
        }
    }

    /// Remove entries unused for longer than `max_idle`.
    pub fn prune_idle(&mut self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_used) > max_idle)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            if let Some(mut entry) = self.entries.remove(key) {
                entry.release_context();
            }
        }
        stale.len()
    }

    pub fn reset(&mut self) {
        for (_, mut entry) in self.entries.drain() {
            entry.release_context();
        }
    }

    fn evict_if_full(&mut self) {
        if self.entries.len() < self.settings.capacity {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            if let Some(mut entry) = self.entries.remove(&key) {
                entry.release_context();
                debug!("Evicted least recently used generation client");
            }
        }
    }
}
