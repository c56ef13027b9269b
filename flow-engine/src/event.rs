use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::flow::{Button, MediaRef};
use crate::session::Session;

/// One chat event handed to the engine by the transport or scheduler
/// collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundEvent {
    Message { text: String },
    Callback { data: String },
    /// Synthetic event produced by the endpoint bridge to resume a parked
    /// session at an endpoint node.
    EndpointResume {
        node_id: String,
        #[serde(default)]
        payload: Map<String, Value>,
    },
    /// Scheduler re-drive for delay waits.
    Tick,
}

/// Outbound side effect requested by a step. Payloads are opaque to the
/// engine; rendering is the transport collaborator's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    SendMessage {
        to: String,
        text: String,
        #[serde(default)]
        attachments: Vec<MediaRef>,
    },
    SendKeyboard {
        to: String,
        text: String,
        buttons: Vec<Button>,
    },
    SendFile {
        to: String,
        url: String,
        #[serde(default)]
        caption: Option<String>,
    },
}

/// How a step left the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Parked at a node, waiting for the next inbound event.
    WaitingForInput,
    /// Reached an end node; session-scope variables were cleared.
    Completed,
    /// No matching outgoing edge (or exhausted webhook retries with no
    /// error edge); the session stays at the current node for redelivery.
    Halted,
}

/// Result of executing one step against a session.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub session: Session,
    pub actions: Vec<Action>,
    /// Set by delay nodes: when the scheduler should re-drive this session.
    pub next_wait: Option<DateTime<Utc>>,
    pub status: StepStatus,
}
