use std::collections::HashMap;

use tokio::sync::{broadcast, watch};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    Enumerating,
    Syncing,
    Done,
    Failed,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Enumerating => "enumerating",
            SyncPhase::Syncing => "syncing",
            SyncPhase::Done => "done",
            SyncPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncProgress {
    pub running: bool,
    pub phase: SyncPhase,
    pub current: u32,
    pub total: u32,
    pub message: String,
}

impl SyncProgress {
    pub fn enumerating() -> Self {
        Self {
            running: true,
            phase: SyncPhase::Enumerating,
            ..Self::default()
        }
    }

    pub fn syncing(current: u32, total: u32, message: impl Into<String>) -> Self {
        Self {
            running: true,
            phase: SyncPhase::Syncing,
            current,
            total,
            message: message.into(),
        }
    }

    pub fn finished(phase: SyncPhase, total: u32, message: impl Into<String>) -> Self {
        Self {
            running: false,
            phase,
            current: total,
            total,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Progress(SyncProgress),
    LibrarySyncComplete(HashMap<String, u32>),
}

/// Owns the process-wide progress value. The engine is the only writer;
/// observers read the latest snapshot or subscribe to the event stream.
pub struct ProgressHub {
    state: watch::Sender<SyncProgress>,
    events: broadcast::Sender<SyncEvent>,
}

impl ProgressHub {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SyncProgress::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { state, events }
    }

    pub fn snapshot(&self) -> SyncProgress {
        self.state.borrow().clone()
    }

    pub fn publish(&self, progress: SyncProgress) {
        self.state.send_replace(progress.clone());
        // No subscribers is not an error.
        let _ = self.events.send(SyncEvent::Progress(progress));
    }

    pub fn report_library_sync(&self, counts: HashMap<String, u32>) {
        let _ = self.events.send(SyncEvent::LibrarySyncComplete(counts));
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        ProgressSubscription {
            rx: self.events.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Dropping the subscription or calling [`ProgressSubscription::unsubscribe`]
/// stops delivery.
pub struct ProgressSubscription {
    rx: broadcast::Receiver<SyncEvent>,
}

impl ProgressSubscription {
    /// Next event, or `None` once the hub is gone. A slow reader skips the
    /// events it missed instead of holding the writer back.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}
