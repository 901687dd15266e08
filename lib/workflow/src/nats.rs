//! NATS JetStream task queue.
//!
//! The broker topology maps onto JetStream as follows:
//! - one file-backed stream capturing `workflow.tasks.>` plays the topic
//!   exchange; routing keys are subjects inside it
//! - one durable pull consumer per queue, filtered on the bound routing keys,
//!   with explicit acknowledgement
//!
//! A publish waits for the stream's acknowledgement, so a subject no stream
//! captures fails instead of being dropped. Deduplicated publishes carry a
//! `Nats-Msg-Id`; the stream drops repeats seen within its duplicate window.
//! A handler failure sends `Nak`, which makes JetStream redeliver the message.

use crate::error::QueueError;
use crate::queue::{TaskHandler, TaskQueue};
use async_nats::jetstream::{self, AckKind, consumer, context::Publish, stream};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Subject space captured by the task stream.
const TASKS_SUBJECT_PREFIX: &str = "workflow.tasks";

/// Default stream name.
const TASKS_STREAM_NAME: &str = "WORKFLOW_TASKS";

/// Default number of deliveries handled concurrently per consumer.
const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// How long the stream remembers message IDs.
const DUPLICATE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Configuration for the JetStream task queue.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URL.
    pub url: String,
    /// Stream name (defaults to WORKFLOW_TASKS).
    pub stream_name: Option<String>,
    /// Maximum concurrent handler invocations per consumer.
    pub max_in_flight: usize,
}

impl NatsConfig {
    /// Creates a new config with the given NATS URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_name: None,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    fn stream(&self) -> &str {
        self.stream_name.as_deref().unwrap_or(TASKS_STREAM_NAME)
    }
}

/// JetStream-backed task queue.
pub struct NatsTaskQueue {
    jetstream: jetstream::Context,
    stream: stream::Stream,
    max_in_flight: usize,
}

impl NatsTaskQueue {
    /// Connects and declares the task stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or stream setup fails.
    pub async fn connect(config: &NatsConfig) -> Result<Self, QueueError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| QueueError::Setup {
                message: format!("failed to connect to {}: {e}", config.url),
            })?;

        let jetstream = jetstream::new(client);

        let stream_config = stream::Config {
            name: config.stream().to_string(),
            subjects: vec![format!("{TASKS_SUBJECT_PREFIX}.>")],
            storage: stream::StorageType::File,
            retention: stream::RetentionPolicy::WorkQueue,
            duplicate_window: DUPLICATE_WINDOW,
            ..Default::default()
        };

        let stream = jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| QueueError::Setup {
                message: format!("failed to create task stream: {e}"),
            })?;

        Ok(Self {
            jetstream,
            stream,
            max_in_flight: config.max_in_flight.max(1),
        })
    }

    async fn consumer(
        &self,
        queue: &str,
        routing_keys: &[String],
    ) -> Result<consumer::Consumer<consumer::pull::Config>, QueueError> {
        let consumer_config = consumer::pull::Config {
            durable_name: Some(queue.to_string()),
            ack_policy: consumer::AckPolicy::Explicit,
            filter_subjects: routing_keys.to_vec(),
            max_ack_pending: i64::try_from(self.max_in_flight).unwrap_or(i64::MAX),
            ..Default::default()
        };

        self.stream
            .get_or_create_consumer(queue, consumer_config)
            .await
            .map_err(|e| QueueError::Subscribe {
                queue: queue.to_string(),
                message: e.to_string(),
            })
    }
}

async fn settle(handler: Arc<dyn TaskHandler>, message: jetstream::Message) {
    let subject = message.subject.to_string();
    match handler.handle(&message.payload).await {
        Ok(()) => {
            if let Err(e) = message.ack().await {
                tracing::warn!(%subject, error = %e, "failed to ack delivery");
            }
        }
        Err(e) => {
            tracing::warn!(%subject, error = %e, "handler failed, requesting redelivery");
            if let Err(e) = message.ack_with(AckKind::Nak(None)).await {
                tracing::warn!(%subject, error = %e, "failed to nak delivery");
            }
        }
    }
}

#[async_trait]
impl TaskQueue for NatsTaskQueue {
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        let publish_error = |e: &dyn std::fmt::Display| QueueError::Publish {
            routing_key: routing_key.to_string(),
            message: e.to_string(),
        };

        self.jetstream
            .publish(routing_key.to_string(), payload.into())
            .await
            .map_err(|e| publish_error(&e))?
            .await
            .map_err(|e| publish_error(&e))?;

        Ok(())
    }

    async fn publish_deduplicated(
        &self,
        routing_key: &str,
        message_id: &str,
        payload: Vec<u8>,
    ) -> Result<(), QueueError> {
        let publish_error = |e: &dyn std::fmt::Display| QueueError::Publish {
            routing_key: routing_key.to_string(),
            message: e.to_string(),
        };

        let ack = self
            .jetstream
            .send_publish(
                routing_key.to_string(),
                Publish::build().message_id(message_id).payload(payload.into()),
            )
            .await
            .map_err(|e| publish_error(&e))?
            .await
            .map_err(|e| publish_error(&e))?;

        if ack.duplicate {
            tracing::debug!(routing_key, message_id, "broker dropped duplicate publish");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        routing_keys: &[String],
        handler: Arc<dyn TaskHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), QueueError> {
        let consumer = self.consumer(queue, routing_keys).await?;
        let mut messages = consumer.messages().await.map_err(|e| QueueError::Subscribe {
            queue: queue.to_string(),
            message: e.to_string(),
        })?;

        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let tracker = TaskTracker::new();
        tracing::info!(queue, ?routing_keys, "consuming tasks");

        loop {
            let permit = tokio::select! {
                () = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                () = shutdown.cancelled() => break,
                next = messages.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    let handler = handler.clone();
                    tracker.spawn(async move {
                        settle(handler, message).await;
                        drop(permit);
                    });
                }
                Some(Err(e)) => {
                    tracing::warn!(queue, error = %e, "failed to receive delivery");
                }
                None => {
                    tracing::warn!(queue, "broker closed the delivery channel");
                    break;
                }
            }
        }

        tracker.close();
        tracker.wait().await;
        tracing::info!(queue, "consumer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nats_config_defaults() {
        let config = NatsConfig::new("nats://localhost:4222");

        assert_eq!(config.stream(), TASKS_STREAM_NAME);
        assert_eq!(config.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
    }

    #[test]
    fn nats_config_custom_stream() {
        let config = NatsConfig {
            url: "nats://localhost:4222".to_string(),
            stream_name: Some("CUSTOM_TASKS".to_string()),
            max_in_flight: 4,
        };

        assert_eq!(config.stream(), "CUSTOM_TASKS");
    }

    #[test]
    fn node_execution_key_is_captured_by_stream() {
        assert!(crate::queue::routing_key_matches(
            &format!("{TASKS_SUBJECT_PREFIX}.>"),
            crate::task::NODE_EXECUTION_ROUTING_KEY
        ));
    }
}
