//! Action handler registry.
//!
//! Handlers are keyed by the node's `action_type` discriminator. The executor
//! dispatches every action node through the registry, and the orchestrator
//! consults it to reject graphs naming unregistered action types.

use crate::error::NodeExecutionError;
use crate::node::{DELAY, HTTP_REQUEST, HttpMethod, LOG, LogLevel, NodeConfig};
use async_trait::async_trait;
use runwright_core::{NodeId, NodeRunId, UserId, WorkflowId, WorkflowRunId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Identifies the node being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeContext {
    pub user_id: UserId,
    pub workflow_id: WorkflowId,
    pub run_id: WorkflowRunId,
    pub node_id: NodeId,
    pub node_run_id: NodeRunId,
}

/// Executes one kind of action.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Runs the action described by `config`.
    async fn execute(
        &self,
        context: &NodeContext,
        config: &NodeConfig,
    ) -> Result<(), NodeExecutionError>;
}

fn unexpected_config(expected: &str, config: &NodeConfig) -> NodeExecutionError {
    NodeExecutionError::failed(format!(
        "{expected} handler received '{}' configuration",
        config.action_type()
    ))
}

/// Registered handlers by action type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the `log`, `delay` and `http_request` handlers.
    #[must_use]
    pub fn with_builtins(http: reqwest::Client) -> Self {
        let mut registry = Self::new();
        registry.register(LOG, Arc::new(LogHandler));
        registry.register(DELAY, Arc::new(DelayHandler));
        registry.register(HTTP_REQUEST, Arc::new(HttpRequestHandler::new(http)));
        registry
    }

    /// Registers (or replaces) the handler of an action type.
    pub fn register(&mut self, action_type: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(action_type.into(), handler);
    }

    /// Returns true if a handler is registered for `action_type`.
    #[must_use]
    pub fn contains(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }

    /// Dispatches `config` to its handler.
    ///
    /// # Errors
    ///
    /// Returns `UnknownType` if no handler is registered, otherwise the
    /// handler's own error.
    pub async fn dispatch(
        &self,
        context: &NodeContext,
        config: &NodeConfig,
    ) -> Result<(), NodeExecutionError> {
        let action_type = config.action_type();
        let handler = self
            .handlers
            .get(action_type)
            .ok_or_else(|| NodeExecutionError::UnknownType {
                action_type: action_type.to_string(),
            })?;
        handler.execute(context, config).await
    }
}

/// Writes the configured message to the log.
pub struct LogHandler;

#[async_trait]
impl NodeHandler for LogHandler {
    async fn execute(
        &self,
        context: &NodeContext,
        config: &NodeConfig,
    ) -> Result<(), NodeExecutionError> {
        let NodeConfig::Log { message, level } = config else {
            return Err(unexpected_config(LOG, config));
        };
        let (run_id, node_id) = (context.run_id, context.node_id);
        match level {
            LogLevel::Debug => tracing::debug!(%run_id, %node_id, "{message}"),
            LogLevel::Info => tracing::info!(%run_id, %node_id, "{message}"),
            LogLevel::Warn => tracing::warn!(%run_id, %node_id, "{message}"),
            LogLevel::Error => tracing::error!(%run_id, %node_id, "{message}"),
        }
        Ok(())
    }
}

/// Sleeps for the configured number of seconds.
pub struct DelayHandler;

#[async_trait]
impl NodeHandler for DelayHandler {
    async fn execute(
        &self,
        _context: &NodeContext,
        config: &NodeConfig,
    ) -> Result<(), NodeExecutionError> {
        let NodeConfig::Delay { seconds } = config else {
            return Err(unexpected_config(DELAY, config));
        };
        tokio::time::sleep(Duration::from_secs(*seconds)).await;
        Ok(())
    }
}

/// Calls an HTTP endpoint. Non-success statuses fail the node.
pub struct HttpRequestHandler {
    client: reqwest::Client,
}

impl HttpRequestHandler {
    /// Creates a handler sharing the given client.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeHandler for HttpRequestHandler {
    async fn execute(
        &self,
        context: &NodeContext,
        config: &NodeConfig,
    ) -> Result<(), NodeExecutionError> {
        let NodeConfig::HttpRequest {
            method,
            url,
            headers,
            body,
        } = config
        else {
            return Err(unexpected_config(HTTP_REQUEST, config));
        };

        let method = match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(NodeExecutionError::failed)?;
        let status = response.status();
        tracing::debug!(
            run_id = %context.run_id,
            node_id = %context.node_id,
            %status,
            %url,
            "http request finished"
        );
        if !status.is_success() {
            return Err(NodeExecutionError::failed(format!("{url} returned {status}")));
        }
        Ok(())
    }
}
