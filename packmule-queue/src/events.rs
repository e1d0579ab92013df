//! Observable engine events.

use tokio::sync::broadcast;

use packmule_storage::JobRecord;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything the engine announces about itself and its jobs.
///
/// For a single job in a single process the ordering is `BeforeRun →
/// (HandlerError?) → AfterRun`; `Timeout` may precede `AfterRun` when the
/// lease expires mid-run.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// Storage connected.
    Connect,
    /// Storage disconnected.
    Disconnect,
    /// Polling started.
    Start,
    /// Polling paused; storage stays connected.
    Pause,
    /// Engine drained and disconnected.
    Stop,
    /// A handler was registered for a job type.
    Handle { job_type: String },
    /// A job was persisted as `waiting`.
    Push(JobRecord),
    /// A job was canceled through the api.
    Cancel(JobRecord),
    /// A claimed job is about to run.
    BeforeRun(JobRecord),
    /// A run finished, whatever the outcome.
    AfterRun(JobRecord),
    /// A running job's lease passed its timeout; cooperative cancel fired.
    Timeout(JobRecord),
    /// The handler for a job returned an error.
    HandlerError { job: JobRecord, message: String },
    /// A storage or internal error the run loop absorbed.
    Error { message: String },
}

/// Broadcast fan-out; emission never blocks and ignores the absence of
/// subscribers.
pub(crate) struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn emit(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(QueueEvent::Start);
        bus.emit(QueueEvent::Pause);

        assert!(matches!(rx.recv().await, Ok(QueueEvent::Start)));
        assert!(matches!(rx.recv().await, Ok(QueueEvent::Pause)));
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(QueueEvent::Stop);
    }
}
