//! Task queue abstraction.
//!
//! Publishing is durable and acknowledged by the broker; a failed publish is
//! returned to the caller. Consumers receive each delivery through a
//! `TaskHandler`: success acknowledges the delivery, failure negatively
//! acknowledges it so the broker redelivers (at-least-once). Handlers must
//! therefore be idempotent.
//!
//! Node tasks are published with their node-run ID as message ID. The broker
//! drops a republished task with an ID it has already seen, so a redelivered
//! parent may enqueue its children again without doubling their tasks.

use crate::error::QueueError;
use crate::task::{NODE_EXECUTION_ROUTING_KEY, TaskMessage};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Failure reported by a handler. The delivery is redelivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    /// Creates a handler error from any displayable value.
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Processes one delivered payload.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Handles a raw payload. `Ok` acknowledges, `Err` requeues.
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError>;
}

/// A topic-routed, durable task queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Publishes `payload` under `routing_key` and waits for the broker's
    /// acknowledgement.
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<(), QueueError>;

    /// Publishes `payload` unless a message with `message_id` was already
    /// accepted. A dropped duplicate counts as success.
    ///
    /// Backends without deduplication publish unconditionally.
    async fn publish_deduplicated(
        &self,
        routing_key: &str,
        _message_id: &str,
        payload: Vec<u8>,
    ) -> Result<(), QueueError> {
        self.publish(routing_key, payload).await
    }

    /// Consumes `queue`, bound to `routing_keys`, until `shutdown` is
    /// cancelled or the broker closes the channel.
    ///
    /// Returns once every in-flight handler invocation has finished.
    async fn subscribe(
        &self,
        queue: &str,
        routing_keys: &[String],
        handler: Arc<dyn TaskHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), QueueError>;

    /// Publishes a node-execution task.
    async fn publish_task(&self, task: &TaskMessage) -> Result<(), QueueError> {
        let payload = task.to_json_bytes().map_err(|e| QueueError::Encode {
            message: e.to_string(),
        })?;
        self.publish_deduplicated(NODE_EXECUTION_ROUTING_KEY, &task.node_run_id.to_string(), payload)
            .await
    }
}

/// Returns true if `routing_key` matches a binding.
///
/// Bindings use the broker's wildcard tokens: `*` matches one dot-separated
/// token and a trailing `>` matches one or more.
#[must_use]
pub fn routing_key_matches(binding: &str, routing_key: &str) -> bool {
    let mut pattern = binding.split('.');
    let mut tokens = routing_key.split('.');
    loop {
        match (pattern.next(), tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(expected), Some(token)) if expected == token => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Debug, Clone)]
struct Delivery {
    routing_key: String,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Delivery>,
    published: Vec<Delivery>,
    acked: usize,
    nacked: usize,
    message_ids: HashSet<String>,
    /// Publishes left before publishing starts failing; `None` never fails.
    publish_budget: Option<usize>,
}

/// Process-local queue for tests and single-instance runs.
///
/// Deliveries are processed one at a time in publish order; a nacked delivery
/// goes to the back of the queue.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryTaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following publish fail until reset.
    pub fn fail_publishes(&self, fail: bool) {
        self.lock().publish_budget = fail.then_some(0);
    }

    /// Lets `successes` more publishes through, then fails the rest until
    /// reset with `fail_publishes(false)`.
    pub fn fail_publishes_after(&self, successes: usize) {
        self.lock().publish_budget = Some(successes);
    }

    /// Returns every task ever published, in order.
    #[must_use]
    pub fn published_tasks(&self) -> Vec<TaskMessage> {
        self.lock()
            .published
            .iter()
            .filter_map(|d| TaskMessage::from_json_bytes(&d.payload).ok())
            .collect()
    }

    /// Returns the number of deliveries waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Returns how many deliveries were acknowledged and nacked.
    #[must_use]
    pub fn ack_counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.acked, state.nacked)
    }

    /// Puts a raw payload on the queue without going through `publish`.
    pub fn inject(&self, routing_key: &str, payload: Vec<u8>) {
        self.lock().pending.push_back(Delivery {
            routing_key: routing_key.to_string(),
            payload,
        });
        self.notify.notify_one();
    }

    /// Delivers waiting messages to `handler` until the queue is empty or
    /// `limit` deliveries were made. Returns the number of deliveries.
    pub async fn drain(&self, handler: &dyn TaskHandler, limit: usize) -> usize {
        let mut delivered = 0;
        while delivered < limit {
            let Some(delivery) = self.next_delivery(&[]) else {
                break;
            };
            self.deliver(handler, delivery).await;
            delivered += 1;
        }
        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accept(
        &self,
        routing_key: &str,
        message_id: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            if let Some(left) = state.publish_budget.as_mut() {
                if *left == 0 {
                    return Err(QueueError::Publish {
                        routing_key: routing_key.to_string(),
                        message: "publishing disabled".to_string(),
                    });
                }
                *left -= 1;
            }
            if let Some(id) = message_id
                && !state.message_ids.insert(id.to_string())
            {
                tracing::debug!(routing_key, message_id = id, "dropping duplicate publish");
                return Ok(());
            }
            let delivery = Delivery {
                routing_key: routing_key.to_string(),
                payload,
            };
            state.published.push(delivery.clone());
            state.pending.push_back(delivery);
        }
        self.notify.notify_one();
        Ok(())
    }

    fn next_delivery(&self, routing_keys: &[String]) -> Option<Delivery> {
        let mut state = self.lock();
        let position = state.pending.iter().position(|d| {
            routing_keys.is_empty()
                || routing_keys
                    .iter()
                    .any(|binding| routing_key_matches(binding, &d.routing_key))
        })?;
        state.pending.remove(position)
    }

    async fn deliver(&self, handler: &dyn TaskHandler, delivery: Delivery) {
        match handler.handle(&delivery.payload).await {
            Ok(()) => self.lock().acked += 1,
            Err(e) => {
                tracing::warn!(routing_key = %delivery.routing_key, error = %e, "handler failed, requeueing");
                let mut state = self.lock();
                state.nacked += 1;
                state.pending.push_back(delivery);
            }
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        self.accept(routing_key, None, payload)
    }

    async fn publish_deduplicated(
        &self,
        routing_key: &str,
        message_id: &str,
        payload: Vec<u8>,
    ) -> Result<(), QueueError> {
        self.accept(routing_key, Some(message_id), payload)
    }

    async fn subscribe(
        &self,
        queue: &str,
        routing_keys: &[String],
        handler: Arc<dyn TaskHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), QueueError> {
        tracing::info!(queue, "consuming from in-memory queue");
        loop {
            while let Some(delivery) = self.next_delivery(routing_keys) {
                if shutdown.is_cancelled() {
                    self.lock().pending.push_front(delivery);
                    return Ok(());
                }
                let requeued = {
                    let before = self.lock().nacked;
                    self.deliver(handler.as_ref(), delivery).await;
                    self.lock().nacked > before
                };
                if requeued {
                    tokio::task::yield_now().await;
                }
            }

            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                () = self.notify.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runwright_core::{NodeId, NodeRunId, UserId, WorkflowId, WorkflowRunId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        failures_left: AtomicUsize,
    }

    impl CountingHandler {
        fn failing(times: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(times),
            }
        }
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn handle(&self, _payload: &[u8]) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(HandlerError::new("transient"));
            }
            Ok(())
        }
    }

    fn task() -> TaskMessage {
        TaskMessage {
            user_id: UserId::new(),
            workflow_id: WorkflowId::new(),
            run_id: WorkflowRunId::new(),
            node_id: NodeId::new(),
            node_run_id: NodeRunId::new(),
        }
    }

    #[test]
    fn routing_key_wildcards() {
        assert!(routing_key_matches("workflow.tasks.>", "workflow.tasks.node_execution"));
        assert!(routing_key_matches("workflow.*.node_execution", "workflow.tasks.node_execution"));
        assert!(routing_key_matches("workflow.tasks.node_execution", "workflow.tasks.node_execution"));
        assert!(!routing_key_matches("workflow.tasks", "workflow.tasks.node_execution"));
        assert!(!routing_key_matches("workflow.tasks.>", "workflow.tasks"));
        assert!(!routing_key_matches("workflow.events.>", "workflow.tasks.node_execution"));
    }

    #[tokio::test]
    async fn publish_task_records_message() {
        let queue = InMemoryTaskQueue::new();
        let task = task();

        queue.publish_task(&task).await.unwrap();

        assert_eq!(queue.published_tasks(), vec![task]);
        assert_eq!(queue.pending(), 1);
    }

    #[tokio::test]
    async fn failed_publish_is_returned() {
        let queue = InMemoryTaskQueue::new();
        queue.fail_publishes(true);

        let result = queue.publish_task(&task()).await;

        assert!(matches!(result, Err(QueueError::Publish { .. })));
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn republished_task_is_dropped() {
        let queue = InMemoryTaskQueue::new();
        let task = task();

        queue.publish_task(&task).await.unwrap();
        queue.publish_task(&task).await.unwrap();

        assert_eq!(queue.published_tasks(), vec![task]);
        assert_eq!(queue.pending(), 1);
    }

    #[tokio::test]
    async fn publishes_fail_once_budget_is_spent() {
        let queue = InMemoryTaskQueue::new();
        queue.fail_publishes_after(1);

        assert!(queue.publish_task(&task()).await.is_ok());
        assert!(queue.publish_task(&task()).await.is_err());

        queue.fail_publishes(false);
        assert!(queue.publish_task(&task()).await.is_ok());
        assert_eq!(queue.pending(), 2);
    }

    #[tokio::test]
    async fn nack_requeues_until_success() {
        let queue = InMemoryTaskQueue::new();
        let handler = CountingHandler::failing(2);
        queue.publish_task(&task()).await.unwrap();

        let delivered = queue.drain(&handler, 10).await;

        assert_eq!(delivered, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.ack_counts(), (1, 2));
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn subscribe_processes_and_stops_on_cancel() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let handler = Arc::new(CountingHandler::failing(0));
        let shutdown = CancellationToken::new();

        let consumer = {
            let queue = queue.clone();
            let handler: Arc<dyn TaskHandler> = handler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                queue
                    .subscribe(
                        "executor",
                        &["workflow.tasks.>".to_string()],
                        handler,
                        shutdown,
                    )
                    .await
            })
        };

        queue.publish_task(&task()).await.unwrap();
        queue.publish_task(&task()).await.unwrap();
        while queue.ack_counts().0 < 2 {
            tokio::task::yield_now().await;
        }

        shutdown.cancel();
        consumer.await.unwrap().unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unbound_routing_keys_are_not_consumed() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        queue.inject("workflow.events.other", b"{}".to_vec());
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        queue
            .subscribe(
                "executor",
                &[NODE_EXECUTION_ROUTING_KEY.to_string()],
                Arc::new(CountingHandler::failing(0)),
                shutdown,
            )
            .await
            .unwrap();

        assert_eq!(queue.pending(), 1);
    }
}
