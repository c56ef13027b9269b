//! End-to-end scenarios driving the runner the way the transport
//! collaborator would: one call per inbound chat event.

use std::sync::Arc;

use flow_engine::{
    Action, Engine, FlowDefinition, InMemoryCache, InMemoryDurable, InMemoryFlows, InboundEvent,
    SessionStore, StepRunner, StepStatus,
};

fn survey_flow() -> FlowDefinition {
    FlowDefinition::from_json(
        r#"{
            "id": "survey-v1",
            "bot_id": "bot-1",
            "status": "active",
            "nodes": [
                { "id": "start", "type": "start" },
                { "id": "hi", "type": "message", "text": "Hi" },
                { "id": "pick", "type": "keyboard", "text": "Pick one",
                  "variable": "selected",
                  "buttons": [
                      { "label": "A", "data": "A" },
                      { "label": "B", "data": "B" }
                  ] },
                { "id": "check", "type": "condition",
                  "field": "selected", "operator": "equals", "value": "A",
                  "case_sensitive": true },
                { "id": "done", "type": "end" }
            ],
            "edges": [
                { "from": "start", "to": "hi" },
                { "from": "hi", "to": "pick" },
                { "from": "pick", "to": "check" },
                { "from": "check", "to": "done", "label": "on_true" }
            ]
        }"#,
    )
    .expect("flow fixture must parse")
}

fn setup(flow: FlowDefinition) -> StepRunner {
    let flows = Arc::new(InMemoryFlows::new());
    flows.publish(flow).unwrap();
    let store = Arc::new(SessionStore::new(
        Arc::new(InMemoryCache::new()),
        Arc::new(InMemoryDurable::new()),
    ));
    StepRunner::new(Arc::new(Engine::default()), store, flows)
}

#[tokio::test]
async fn callback_a_drives_keyboard_straight_to_end() {
    let runner = setup(survey_flow());

    // First event: start -> message -> keyboard, then suspend.
    let outcome = runner
        .process_event("bot-1", "alice", InboundEvent::Message { text: "/go".into() })
        .await
        .unwrap();
    assert_eq!(outcome.status, StepStatus::WaitingForInput);
    assert_eq!(outcome.session.current_node_id.as_deref(), Some("pick"));
    assert_eq!(outcome.actions.len(), 2);
    assert!(matches!(outcome.actions[0], Action::SendMessage { .. }));
    assert!(matches!(outcome.actions[1], Action::SendKeyboard { .. }));

    // Callback "A": records the selection, passes the condition, ends.
    let outcome = runner
        .process_event("bot-1", "alice", InboundEvent::Callback { data: "A".into() })
        .await
        .unwrap();
    assert_eq!(outcome.status, StepStatus::Completed);
    assert_eq!(outcome.session.current_node_id.as_deref(), Some("done"));
}

#[tokio::test]
async fn callback_b_halts_at_the_condition_node() {
    let runner = setup(survey_flow());

    runner
        .process_event("bot-1", "bob", InboundEvent::Message { text: "/go".into() })
        .await
        .unwrap();

    // Callback "B": the condition has no false edge, so the session halts
    // at the condition node and stays there for inspection.
    let outcome = runner
        .process_event("bot-1", "bob", InboundEvent::Callback { data: "B".into() })
        .await
        .unwrap();
    assert_eq!(outcome.status, StepStatus::Halted);
    assert_eq!(outcome.session.current_node_id.as_deref(), Some("check"));

    // A later event re-evaluates the same condition; with the variable
    // unchanged the session remains parked at the condition node.
    let outcome = runner
        .process_event("bot-1", "bob", InboundEvent::Tick)
        .await
        .unwrap();
    assert_eq!(outcome.status, StepStatus::Halted);
    assert_eq!(outcome.session.current_node_id.as_deref(), Some("check"));
}
