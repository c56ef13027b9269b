use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::variables::ScopedVariables;

/// Composite key identifying one participant's session on one bot.
pub fn session_key(bot_id: &str, participant_id: &str) -> String {
    format!("{bot_id}:{participant_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Expired,
}

/// What kind of input a parked session is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    Keyboard,
    Form,
    Delay,
    Endpoint,
}

/// Wait marker for a session parked at a node. Also carries the form
/// progress cursor so multi-field collection survives a reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingWait {
    pub node_id: String,
    pub kind: WaitKind,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub form_field_index: Option<usize>,
}

impl PendingWait {
    /// An expired wait is a no-op input: the engine re-evaluates the node
    /// instead of auto-advancing.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        match self.timeout_ms {
            Some(ms) => now >= self.requested_at + chrono::Duration::milliseconds(ms as i64),
            None => false,
        }
    }
}

/// Per-(bot, participant) execution state: the current node plus scoped
/// variables. Mutated only inside the runner's per-key critical section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_key: String,
    pub bot_id: String,
    pub participant_id: String,
    pub flow_id: String,
    pub current_node_id: Option<String>,
    #[serde(default)]
    pub variables: ScopedVariables,
    pub status: SessionStatus,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub pending_wait: Option<PendingWait>,
    #[serde(default)]
    pub group_ref: Option<Uuid>,
}

impl Session {
    pub fn new(bot_id: &str, participant_id: &str, flow_id: &str) -> Self {
        Self {
            session_key: session_key(bot_id, participant_id),
            bot_id: bot_id.to_string(),
            participant_id: participant_id.to_string(),
            flow_id: flow_id.to_string(),
            current_node_id: None,
            variables: ScopedVariables::new(),
            status: SessionStatus::Active,
            last_activity: Utc::now(),
            pending_wait: None,
            group_ref: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_bot_and_participant() {
        assert_eq!(session_key("bot1", "user9"), "bot1:user9");
    }

    #[test]
    fn wait_without_timeout_never_expires() {
        let wait = PendingWait {
            node_id: "n".into(),
            kind: WaitKind::Keyboard,
            requested_at: Utc::now() - chrono::Duration::days(365),
            timeout_ms: None,
            form_field_index: None,
        };
        assert!(!wait.expired(Utc::now()));
    }

    #[test]
    fn wait_with_timeout_expires() {
        let wait = PendingWait {
            node_id: "n".into(),
            kind: WaitKind::Delay,
            requested_at: Utc::now() - chrono::Duration::seconds(10),
            timeout_ms: Some(5_000),
            form_field_index: None,
        };
        assert!(wait.expired(Utc::now()));
    }
}
