//! The queue controller: lifecycle orchestration and the canonical send
//! pipeline, the seam between store, queue, and transport.

use std::{
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use herald_common::{Signal, internal, traits::fsm::FiniteStateMachine};
use herald_delivery::{
    Deliver, DeliveryError, Message, QueueConfig, QueueEvent, QueueStats, TaskQueue, Transport,
};
use herald_store::{BackingStore, EmailRecord, RecipientStore, StoreError, TriesFilter};
use thiserror::Error;
use tokio::sync::{RwLock, broadcast, mpsc};

use crate::{
    csv_source,
    events::Event,
    state::{ControllerState, StateInput},
};

/// Errors surfaced to the controller's caller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The store failed; fatal during initialization and mid-run alike.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// `start` was called before `set_message`.
    #[error("Message content must be set before starting")]
    MessageNotSet,
}

/// Campaign message metadata used by the send pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOptions {
    /// Sender, either a bare address or `"Display Name" <address>`.
    pub from: String,
    pub subject: String,
    /// HTML body, already read from disk.
    pub html: String,
}

/// Orchestrates the store, the worker queue, and the transport.
///
/// Observers consume the typed [`Event`] stream returned by
/// [`Self::new`]; the controller itself never prints.
pub struct Controller {
    store: Arc<RecipientStore>,
    queue: TaskQueue,
    transport: Arc<dyn Transport>,
    message: Arc<RwLock<Option<MessageOptions>>>,
    events: mpsc::UnboundedSender<Event>,
    state: Mutex<ControllerState>,
    max_tries: u32,
}

impl Controller {
    /// Create a controller over the given backing storage and transport.
    ///
    /// The returned receiver carries every [`Event`] the controller and
    /// its send pipeline emit.
    #[must_use]
    pub fn new(
        backing: Arc<dyn BackingStore>,
        transport: Arc<dyn Transport>,
        queue_config: QueueConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let max_tries = queue_config.max_tries;

        (
            Self {
                store: Arc::new(RecipientStore::new(backing)),
                queue: TaskQueue::new(queue_config),
                transport,
                message: Arc::new(RwLock::new(None)),
                events,
                state: Mutex::new(ControllerState::default()),
                max_tries,
            },
            receiver,
        )
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, input: StateInput) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = state.transition(input, &mut ());
    }

    fn emit_info(&self, message: impl Into<String>) {
        let _ = self.events.send(Event::Info(message.into()));
    }

    /// Load the store and purge records that already exceeded the attempt
    /// limit in a prior run; they are permanently abandoned and would
    /// otherwise skew recovery decisions.
    ///
    /// The queue stays paused. Idempotent: a second call reloads the same
    /// state and the purge removes nothing further.
    pub async fn initialize(&self) -> Result<(), ControllerError> {
        self.advance(StateInput::Initialize);
        self.emit_info("Waiting for the queue to initialize");

        self.store.open().await?;
        self.emit_info("Store loaded successfully");

        self.purge_exhausted().await?;

        self.advance(StateInput::Loaded);
        self.emit_info("The queue is ready");

        Ok(())
    }

    async fn purge_exhausted(&self) -> Result<(), StoreError> {
        let exhausted = self
            .store
            .query(false, TriesFilter::AtLeast(self.max_tries))
            .await;

        if !exhausted.is_empty() {
            self.emit_info(format!(
                "Cleaning {} recipient(s) that exceeded the attempt limit ({})",
                exhausted.len(),
                self.max_tries
            ));
        }

        for record in exhausted {
            self.store.remove(&record.address).await?;
        }

        Ok(())
    }

    async fn recoverable(&self) -> Vec<EmailRecord> {
        self.store
            .query(false, TriesFilter::Under(self.max_tries))
            .await
    }

    /// Whether a previous run left unfinished work behind.
    pub async fn is_recoverable(&self) -> bool {
        !self.recoverable().await.is_empty()
    }

    /// Re-enqueue every recoverable record, without touching the store.
    pub async fn recover_from_database(&self) {
        let records = self.recoverable().await;
        self.emit_info(format!(
            "Recovering {} recipient(s) from the last session",
            records.len()
        ));

        for record in records {
            self.queue.push(record.address);
        }
    }

    /// Remove every unsent record outright.
    ///
    /// Used when the message content changes, since resuming with stale
    /// content would be incorrect. This loses data and is never invoked
    /// automatically.
    pub async fn clean_non_sent(&self) -> Result<(), StoreError> {
        let unsent = self.store.query(false, TriesFilter::Under(u32::MAX)).await;

        if !unsent.is_empty() {
            self.emit_info(format!(
                "Removing {} unsent recipient(s) from the store",
                unsent.len()
            ));
        }

        for record in unsent {
            self.store.remove(&record.address).await?;
        }

        Ok(())
    }

    /// Track an address and enqueue it for delivery.
    ///
    /// A duplicate (same address in any casing, or one that already
    /// received the message) is reported on the info channel and not
    /// enqueued.
    pub async fn add_email(&self, address: &str) -> Result<(), StoreError> {
        if self.store.add(address).await? {
            self.queue.push(address.trim());
        } else {
            self.emit_info(format!(
                "Address {address} was already added or has already received this mail; skipping"
            ));
        }

        Ok(())
    }

    /// Load recipients from the campaign CSV and enqueue the new ones.
    pub async fn load_csv(&self, path: &Path) -> anyhow::Result<usize> {
        self.emit_info(format!("Loading recipients from {}", path.display()));

        let addresses = csv_source::read_addresses(path)?;
        self.emit_info(format!(
            "Loaded {} recipient(s) from the csv file",
            addresses.len()
        ));

        let count = addresses.len();
        for address in &addresses {
            self.add_email(address).await?;
        }

        Ok(count)
    }

    /// Set the message used by the send pipeline. Must be called before
    /// [`Self::start`].
    pub async fn set_message(&self, options: MessageOptions) {
        *self.message.write().await = Some(options);
        self.emit_info("Message options have been updated");
    }

    /// Emit a summary of the pending work and resume the worker.
    pub async fn start(&self) -> Result<(), ControllerError> {
        if self.message.read().await.is_none() {
            return Err(ControllerError::MessageNotSet);
        }

        let total = self.recoverable().await.len();
        if total > 0 {
            self.emit_info(format!("Sending {total} email(s)"));
        } else {
            self.emit_info("Nothing to send, the queue is empty");
        }

        self.advance(StateInput::Start);
        self.queue.resume();

        Ok(())
    }

    /// Stop admitting tasks; the attempt in flight runs to its end.
    pub fn pause(&self) {
        self.queue.pause();
        self.advance(StateInput::Pause);
    }

    /// Restart admission after a pause.
    pub fn resume(&self) {
        self.queue.resume();
        self.advance(StateInput::Resume);
    }

    /// Full reset of the store, for administrative resets between
    /// campaigns.
    pub async fn clear_database(&self) -> Result<(), StoreError> {
        self.store.clear().await
    }

    /// Force a final durable flush, for the shutdown path.
    pub async fn persist(&self) -> Result<(), StoreError> {
        self.store.persist().await
    }

    /// Live worker counters.
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Whether the worker is in the middle of a delivery attempt.
    pub fn has_task_in_flight(&self) -> bool {
        self.queue.has_task_in_flight()
    }

    /// The underlying store, for inspection.
    #[must_use]
    pub fn store(&self) -> &RecipientStore {
        &self.store
    }

    /// Drive the worker until shutdown, translating its signals into
    /// controller events.
    ///
    /// Runs the worker loop and the signal observer concurrently; both
    /// finish once `shutdown` fires and the in-flight work has settled.
    pub async fn serve(&self, shutdown: broadcast::Receiver<Signal>) {
        let (queue_events, mut queue_rx) = mpsc::unbounded_channel();

        let pipeline: Arc<dyn Deliver> = Arc::new(SendPipeline {
            store: self.store.clone(),
            transport: self.transport.clone(),
            message: self.message.clone(),
            events: self.events.clone(),
            max_tries: self.max_tries,
        });

        let worker = self.queue.run(pipeline, queue_events, shutdown);

        let observer = async {
            while let Some(event) = queue_rx.recv().await {
                match event {
                    QueueEvent::Attempt { stats, .. } => {
                        if stats.pending == 0 {
                            self.advance(StateInput::BacklogConsumed);
                        }
                        let total = self.recoverable().await.len();
                        let _ = self.events.send(Event::QueueMoved { total });
                    }
                    QueueEvent::Drained { .. } => {
                        self.advance(StateInput::Drained);
                        let total_items = self.recoverable().await.len();
                        let _ = self.events.send(Event::QueueDone { total_items });
                    }
                }
            }
        };

        tokio::join!(worker, observer);
        internal!("Controller serve loop finished");
    }
}

/// The canonical send pipeline registered with the worker.
///
/// Invokes the transport and records the outcome durably before
/// returning, so worker signals never run ahead of store state. Reports
/// exhaustion as a permanent error so the worker stops re-attempting a
/// recipient whose attempt budget is spent.
struct SendPipeline {
    store: Arc<RecipientStore>,
    transport: Arc<dyn Transport>,
    message: Arc<RwLock<Option<MessageOptions>>>,
    events: mpsc::UnboundedSender<Event>,
    max_tries: u32,
}

impl SendPipeline {
    async fn record_outcome(
        &self,
        address: &str,
        success: bool,
    ) -> Result<EmailRecord, DeliveryError> {
        match self.store.mark_outcome(address, success).await {
            Ok(record) => Ok(record),
            Err(e) => {
                // A missing record here is a broken invariant: the task
                // completed for an address the store does not know.
                let _ = self.events.send(Event::Error(format!(
                    "Failed to record outcome for {address}: {e}"
                )));
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl Deliver for SendPipeline {
    async fn deliver(&self, address: &str) -> Result<(), DeliveryError> {
        let options = self.message.read().await.clone();
        let Some(options) = options else {
            return Err(StoreError::Internal(
                "message content not set before delivery".to_string(),
            )
            .into());
        };

        let _ = self.events.send(Event::Info(format!("Sending to {address}")));

        let message = Message {
            from: options.from,
            to: address.to_string(),
            subject: options.subject,
            html: options.html,
        };

        match self.transport.send(&message).await {
            Ok(()) => {
                self.record_outcome(address, true).await?;
                let _ = self
                    .events
                    .send(Event::Info(format!("Email sent to {address}")));
                Ok(())
            }
            Err(transport_error) => {
                let record = self.record_outcome(address, false).await?;
                let _ = self.events.send(Event::Error(format!(
                    "Couldn't send to {address}, reason: {transport_error}"
                )));

                if record.tries >= self.max_tries {
                    Err(DeliveryError::Exhausted {
                        address: record.address,
                        tries: record.tries,
                    })
                } else {
                    Err(transport_error.into())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use herald_delivery::MockTransport;
    use herald_store::MemoryBackingStore;

    use super::*;

    fn new_controller() -> (Controller, mpsc::UnboundedReceiver<Event>) {
        Controller::new(
            Arc::new(MemoryBackingStore::new()),
            Arc::new(MockTransport::new()),
            QueueConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_duplicate_add_emits_info_and_does_not_enqueue() {
        let (controller, mut events) = new_controller();
        controller.initialize().await.expect("Failed to initialize");

        controller
            .add_email("a@test.com")
            .await
            .expect("Failed to add");
        controller
            .add_email("A@TEST.com")
            .await
            .expect("Failed to add duplicate");

        assert_eq!(controller.queue_stats().pending, 1);

        let mut saw_duplicate_notice = false;
        while let Ok(event) = events.try_recv() {
            if let Event::Info(message) = event
                && message.contains("already")
            {
                saw_duplicate_notice = true;
            }
        }
        assert!(saw_duplicate_notice);
    }

    #[tokio::test]
    async fn test_initialize_reaches_ready() {
        let (controller, _events) = new_controller();
        assert_eq!(controller.state(), ControllerState::Uninitialized);

        controller.initialize().await.expect("Failed to initialize");
        assert_eq!(controller.state(), ControllerState::Ready);
    }

    #[tokio::test]
    async fn test_start_requires_message() {
        let (controller, _events) = new_controller();
        controller.initialize().await.expect("Failed to initialize");

        assert!(matches!(
            controller.start().await,
            Err(ControllerError::MessageNotSet)
        ));

        controller
            .set_message(MessageOptions {
                from: "a@example.org".to_string(),
                subject: "s".to_string(),
                html: "<p>b</p>".to_string(),
            })
            .await;
        controller.start().await.expect("Failed to start");
        assert_eq!(controller.state(), ControllerState::Running);
    }
}
