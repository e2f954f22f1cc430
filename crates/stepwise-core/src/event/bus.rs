//! Engine-owned event channel.
//!
//! The dispatcher publishes every `WorkflowEvent` here; presentation layers
//! (spinners, log shippers, tests) drain an [`EventSubscription`]. A slow
//! subscriber loses the oldest events instead of blocking the run.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use uuid::Uuid;

use stepwise_types::event::WorkflowEvent;

const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast channel of dispatcher events. Clones publish to the same
/// subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            run_id: None,
            missed: 0,
        }
    }

    /// Publish to current subscribers; returns how many received it.
    pub fn publish(&self, event: WorkflowEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Receiving end of the bus. Lag is absorbed and counted in
/// [`missed`](Self::missed) rather than surfaced as an error.
pub struct EventSubscription {
    receiver: broadcast::Receiver<WorkflowEvent>,
    run_id: Option<Uuid>,
    missed: u64,
}

impl EventSubscription {
    /// Only yield events of one run.
    pub fn for_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Next event, or `None` once every bus handle is gone.
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => self.note_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event without waiting.
    pub fn try_next(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => self.note_lag(n),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<WorkflowEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    /// Events dropped because this subscriber fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    fn accepts(&self, event: &WorkflowEvent) -> bool {
        self.run_id.is_none_or(|id| event.run_id() == id)
    }

    fn note_lag(&mut self, n: u64) {
        self.missed += n;
        tracing::debug!(missed = n, "event subscriber lagged");
    }
}
