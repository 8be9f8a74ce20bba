//! Event dispatch loop
//!
//! The concurrency boundary between MIDI event arrival and monitor command
//! execution. Monitor writes take tens to hundreds of milliseconds while a
//! spun encoder can deliver events far faster, so ingestion lands events in a
//! per-control coalescing slot (latest value wins) and a single worker
//! executes the mapper sequentially. Button presses are never coalesced:
//! every press must be individually observed. Serializing on one worker also
//! guarantees no two DDC commands are in flight at once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::mapper::ControlMapper;
use crate::midi::{ControlEvent, ControlId};

/// Bounded coalescing event queue between ingestion and the worker
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

#[derive(Default)]
struct QueueInner {
    /// Latest unprocessed continuous event per control
    slots: HashMap<ControlId, ControlEvent>,
    /// Arrival order of pending continuous controls
    slot_order: VecDeque<ControlId>,
    /// Button presses, FIFO, never coalesced
    buttons: VecDeque<ControlEvent>,
    closed: bool,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    /// Enqueue one event. A continuous event overwrites any unprocessed
    /// event for the same control. Returns false once draining has begun;
    /// events arriving after that are refused.
    pub fn push(&self, event: ControlEvent) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            match event.control {
                ControlId::Note(_) => inner.buttons.push_back(event),
                ControlId::Cc(_) => {
                    if inner.slots.insert(event.control, event).is_none() {
                        inner.slot_order.push_back(event.control);
                    }
                }
            }
        }
        self.notify.notify_one();
        true
    }

    /// Take the next pending event without waiting. Buttons drain first.
    pub fn try_pop(&self) -> Option<ControlEvent> {
        let mut inner = self.inner.lock();
        if let Some(event) = inner.buttons.pop_front() {
            return Some(event);
        }
        let control = inner.slot_order.pop_front()?;
        inner.slots.remove(&control)
    }

    /// Wait for the next event; `None` once the queue is closed and empty
    pub async fn pop(&self) -> Option<ControlEvent> {
        loop {
            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            if self.inner.lock().closed {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting new events; already-queued events remain poppable
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-worker dispatcher owning the mapper (and through it the monitor)
pub struct Engine {
    queue: Arc<EventQueue>,
    mapper: ControlMapper,
}

impl Engine {
    pub fn new(mapper: ControlMapper) -> Self {
        Self {
            queue: Arc::new(EventQueue::new()),
            mapper,
        }
    }

    /// Handle for producers (ingestion task, tests)
    pub fn queue(&self) -> Arc<EventQueue> {
        self.queue.clone()
    }

    /// Move events from the surface channel into the coalescing queue.
    /// Stops when the surface channel closes or the queue starts draining.
    pub fn spawn_ingestion(
        queue: Arc<EventQueue>,
        mut events: mpsc::Receiver<ControlEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !queue.push(event) {
                    break;
                }
            }
            debug!("Event ingestion stopped");
        })
    }

    /// Run the worker until `shutdown` resolves, then drain events accepted
    /// before the shutdown and stop. No command is issued for events arriving
    /// after drain begins.
    pub async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) {
        info!("Event dispatch loop running");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    self.queue.close();
                    break;
                }
                maybe = self.queue.pop() => {
                    match maybe {
                        Some(event) => {
                            self.mapper.route(event).await;
                        }
                        None => {
                            info!("Event dispatch loop stopped");
                            return;
                        }
                    }
                }
            }
        }

        let mut drained = 0usize;
        while let Some(event) = self.queue.try_pop() {
            self.mapper.route(event).await;
            drained += 1;
        }
        if drained > 0 {
            debug!("Drained {} queued events during shutdown", drained);
        }
        info!("Event dispatch loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::BindingTable;
    use crate::config::AppConfig;
    use crate::mapper::Feedback;
    use crate::monitor::mock::{commands, MockState};
    use std::time::Instant;

    fn event(control: ControlId, value: u8) -> ControlEvent {
        ControlEvent {
            control,
            value,
            at: Instant::now(),
        }
    }

    #[test]
    fn test_continuous_events_coalesce_latest_wins() {
        let queue = EventQueue::new();

        queue.push(event(ControlId::Cc(1), 10));
        queue.push(event(ControlId::Cc(1), 20));
        queue.push(event(ControlId::Cc(2), 5));

        let first = queue.try_pop().unwrap();
        assert_eq!(first.control, ControlId::Cc(1));
        assert_eq!(first.value, 20); // stale value 10 was overwritten

        let second = queue.try_pop().unwrap();
        assert_eq!(second.control, ControlId::Cc(2));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_button_events_never_coalesce() {
        let queue = EventQueue::new();

        queue.push(event(ControlId::Note(8), 127));
        queue.push(event(ControlId::Note(8), 127));
        queue.push(event(ControlId::Note(8), 127));

        let mut presses = 0;
        while queue.try_pop().is_some() {
            presses += 1;
        }
        assert_eq!(presses, 3);
    }

    #[test]
    fn test_buttons_drain_before_slots() {
        let queue = EventQueue::new();

        queue.push(event(ControlId::Cc(1), 10));
        queue.push(event(ControlId::Note(8), 127));

        assert_eq!(queue.try_pop().unwrap().control, ControlId::Note(8));
        assert_eq!(queue.try_pop().unwrap().control, ControlId::Cc(1));
    }

    #[test]
    fn test_closed_queue_refuses_new_events() {
        let queue = EventQueue::new();

        assert!(queue.push(event(ControlId::Cc(1), 10)));
        queue.close();
        assert!(!queue.push(event(ControlId::Cc(1), 20)));

        // Already-queued event survives the close for the drain
        assert_eq!(queue.try_pop().unwrap().value, 10);
    }

    #[tokio::test]
    async fn test_pop_returns_none_after_close_and_drain() {
        let queue = EventQueue::new();
        queue.push(event(ControlId::Cc(1), 10));
        queue.close();

        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    const YAML: &str = r#"
midi: { input_port: a, output_port: b }
engine: { encoder_step: 1 }
controls:
  - action: brightness
    control: { cc: 1 }
    kind: absolute
    code: 0x10
  - action: local_dimming
    control: { note: 8 }
    kind: button
    code: 0xF4
"#;

    fn test_engine() -> (Engine, std::sync::Arc<Mutex<MockState>>) {
        let config: AppConfig = serde_yaml::from_str(YAML).unwrap();
        let table = BindingTable::compile(&config).unwrap();
        let (monitor, state) = commands();
        let (feedback_tx, _feedback_rx) = mpsc::unbounded_channel::<Feedback>();
        let mapper = ControlMapper::new(table, monitor, &config.engine, feedback_tx);
        (Engine::new(mapper), state)
    }

    #[tokio::test]
    async fn test_worker_drains_queued_events_on_shutdown() {
        let (engine, state) = test_engine();
        let queue = engine.queue();

        queue.push(event(ControlId::Cc(1), 127));
        queue.push(event(ControlId::Note(8), 127));

        // Shutdown already resolved: the worker closes the queue, then
        // drains what was accepted before
        engine.run(std::future::ready(())).await;

        let calls = state.lock().set_calls.clone();
        assert!(calls.contains(&(0x10, 100)));
        assert!(calls.contains(&(0xF4, 1)));
    }

    #[tokio::test]
    async fn test_worker_processes_events_until_shutdown() {
        let (engine, state) = test_engine();
        let queue = engine.queue();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let worker = tokio::spawn(engine.run(async {
            let _ = shutdown_rx.await;
        }));

        queue.push(event(ControlId::Cc(1), 64));
        queue.push(event(ControlId::Note(8), 127));

        let _ = shutdown_tx.send(());
        worker.await.unwrap();

        let calls = state.lock().set_calls.clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], (0x10, 50));
    }

    #[tokio::test]
    async fn test_ingestion_moves_channel_events_into_queue() {
        let queue = Arc::new(EventQueue::new());
        let (tx, rx) = mpsc::channel(16);

        let handle = Engine::spawn_ingestion(queue.clone(), rx);
        tx.send(event(ControlId::Cc(1), 42)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(queue.try_pop().unwrap().value, 42);
    }
}
