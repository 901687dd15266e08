//! Task message wire format.

use runwright_core::{NodeId, NodeRunId, UserId, WorkflowId, WorkflowRunId};
use serde::{Deserialize, Serialize};

/// Routing key of node-execution tasks.
pub const NODE_EXECUTION_ROUTING_KEY: &str = "workflow.tasks.node_execution";

/// Queue (durable consumer) that executes node tasks.
pub const NODE_EXECUTION_QUEUE: &str = "workflow-node-executor";

/// A request to execute one node of one run.
///
/// Serialized as `{user_id, workflow_id, run_id, node_id, node_run_id}`; every
/// field is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskMessage {
    pub user_id: UserId,
    pub workflow_id: WorkflowId,
    pub run_id: WorkflowRunId,
    pub node_id: NodeId,
    pub node_run_id: NodeRunId,
}

impl TaskMessage {
    /// Encodes the message as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes a message from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a complete task message.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message() -> TaskMessage {
        TaskMessage {
            user_id: UserId::new(),
            workflow_id: WorkflowId::new(),
            run_id: WorkflowRunId::new(),
            node_id: NodeId::new(),
            node_run_id: NodeRunId::new(),
        }
    }

    #[test]
    fn wire_format_field_names() {
        let message = message();
        let value: serde_json::Value =
            serde_json::from_slice(&message.to_json_bytes().expect("encode")).expect("json");

        let object = value.as_object().expect("object");
        let mut keys: Vec<_> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            ["node_id", "node_run_id", "run_id", "user_id", "workflow_id"]
        );
        assert_eq!(value["run_id"], message.run_id.as_ulid().to_string());
    }

    #[test]
    fn missing_field_is_rejected() {
        let message = message();
        let payload = json!({
            "user_id": message.user_id,
            "workflow_id": message.workflow_id,
            "run_id": message.run_id,
            "node_id": message.node_id,
        });
        let bytes = serde_json::to_vec(&payload).expect("encode");
        assert!(TaskMessage::from_json_bytes(&bytes).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(TaskMessage::from_json_bytes(b"not json").is_err());
    }
}
