use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::JobEvent;

const CHANNEL_CAPACITY: usize = 64;

/// Per-job broadcast channels for progress events.
///
/// Channels are created lazily by whichever side shows up first, so a
/// subscriber that connects before the worker picks up the job still sees
/// every event. Closing a channel ends all of its receivers.
#[derive(Clone, Default)]
pub struct EventHub {
    senders: Arc<DashMap<String, broadcast::Sender<JobEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<JobEvent> {
        self.senders
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Returns the number of receivers the event reached.
    pub fn emit(&self, event: JobEvent) -> usize {
        let Some(sender) = self.senders.get(event.job_id()).map(|entry| entry.clone()) else {
            trace!(job_id = event.job_id(), "No subscribers for job event");
            return 0;
        };
        sender.send(event).unwrap_or(0)
    }

    pub fn close(&self, job_id: &str) {
        self.senders.remove(job_id);
    }

    pub fn channel_count(&self) -> usize {
        self.senders.len()
    }
}
