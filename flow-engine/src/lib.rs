pub mod endpoint;
pub mod engine;
pub mod error;
pub mod event;
pub mod flow;
pub mod group;
pub mod runner;
pub mod session;
pub mod storage;
pub mod variables;

// Re-export commonly used types
pub use endpoint::{EndpointBridge, IngestOutcome};
pub use engine::{
    DisabledWebhook, Engine, IntegrationRegistry, ListOnlyRecipients, NoIntegrations,
    RecipientSource, WebhookClient, WebhookRequest, WebhookResponse,
};
#[cfg(feature = "webhook")]
pub use engine::HttpWebhookClient;
pub use error::{FlowError, Result};
pub use event::{Action, InboundEvent, StepOutcome, StepStatus};
pub use flow::{
    BroadcastAudience, Button, ConditionOperator, DelayUnit, Edge, EdgeLabel, FieldKind,
    FlowDefinition, FlowStatus, FormField, MediaRef, Node, NodeConfig, RandomOption,
    ValidationReport,
};
pub use group::{GroupLimits, GroupService, GroupSession, GroupStatus};
pub use runner::{FlowSource, InMemoryFlows, StepRunner};
pub use session::{PendingWait, Session, SessionStatus, WaitKind, session_key};
pub use storage::{
    CacheTier, DurableTier, InMemoryCache, InMemoryDurable, PersistencePolicy, PostgresDurable,
    SessionStore, StatePersistencePolicy,
};
pub use variables::{Scope, ScopedVariables, VariableMutation, VariableOp, render_template};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn greeting_flow() -> FlowDefinition {
        FlowDefinition::from_json(
            r#"{
                "id": "greet-v1",
                "bot_id": "bot-1",
                "status": "active",
                "nodes": [
                    { "id": "start", "type": "start" },
                    { "id": "greet", "type": "message", "text": "Welcome, {{name}}!" },
                    { "id": "done", "type": "end" }
                ],
                "edges": [
                    { "from": "start", "to": "greet" },
                    { "from": "greet", "to": "done" }
                ]
            }"#,
        )
        .expect("flow fixture must parse")
    }

    #[tokio::test]
    async fn simple_flow_execution_through_the_runner() {
        let flows = Arc::new(InMemoryFlows::new());
        flows.publish(greeting_flow()).unwrap();
        let store = Arc::new(SessionStore::new(
            Arc::new(InMemoryCache::new()),
            Arc::new(InMemoryDurable::new()),
        ));
        let runner = StepRunner::new(Arc::new(Engine::default()), store, flows);

        let outcome = runner
            .process_event("bot-1", "user-1", InboundEvent::Message { text: "/start".into() })
            .await
            .unwrap();

        assert_eq!(outcome.status, StepStatus::Completed);
        assert_eq!(outcome.actions.len(), 1);
        match &outcome.actions[0] {
            Action::SendMessage { to, text, .. } => {
                assert_eq!(to, "user-1");
                assert_eq!(text, "Welcome, !");
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[tokio::test]
    async fn storage_round_trip() {
        let store = SessionStore::new(
            Arc::new(InMemoryCache::new()),
            Arc::new(InMemoryDurable::new()),
        );

        let session = Session::new("bot-1", "user-1", "greet-v1");
        store.save_session(&session, true).await.unwrap();

        let loaded = store.get_session("bot-1", "user-1").await.unwrap();
        assert!(loaded.is_some());

        store.delete_session("bot-1", "user-1").await.unwrap();
        assert!(store.get_session("bot-1", "user-1").await.unwrap().is_none());
    }

    #[test]
    fn yaml_flow_definitions_load() {
        let flow = FlowDefinition::from_yaml(
            r#"
id: poll-v2
bot_id: bot-9
status: draft
nodes:
  - id: start
    type: start
  - id: ask
    type: keyboard
    text: "Ready?"
    buttons:
      - label: "Yes"
        data: "yes"
  - id: done
    type: end
edges:
  - from: start
    to: ask
  - from: ask
    to: done
"#,
        )
        .unwrap();
        assert_eq!(flow.nodes.len(), 3);
        assert!(flow.validate().is_ok());
    }
}
