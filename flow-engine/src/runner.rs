//! StepRunner – loads a session, executes exactly one flow step, and
//! persists the updated session back through the storage service.
//!
//! This is also where the single-writer contract lives: the whole
//! load → execute → save sequence runs inside a per-session-key critical
//! section, so two simultaneous events for the same participant can never
//! race on `current_node_id` or variable state. Events for different
//! sessions proceed fully in parallel.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::{FlowError, Result};
use crate::event::{InboundEvent, StepOutcome, StepStatus};
use crate::flow::FlowDefinition;
use crate::group::GroupService;
use crate::session::{Session, SessionStatus, WaitKind, session_key};
use crate::storage::SessionStore;
use crate::variables::Scope;

/// Lookup of the active flow definition for a bot. Flow CRUD itself is a
/// collaborator concern; the engine only ever reads.
#[async_trait]
pub trait FlowSource: Send + Sync {
    async fn active_flow(&self, bot_id: &str) -> Result<Option<Arc<FlowDefinition>>>;
}

/// In-memory flow lookup keyed by bot id.
pub struct InMemoryFlows {
    flows: DashMap<String, Arc<FlowDefinition>>,
}

impl InMemoryFlows {
    pub fn new() -> Self {
        Self { flows: DashMap::new() }
    }

    /// Validate and activate a flow for its bot, replacing any previous
    /// active flow.
    pub fn publish(&self, mut flow: FlowDefinition) -> Result<()> {
        let report = flow.validate();
        if !report.is_ok() {
            return Err(FlowError::Validation(report.errors.join("; ")));
        }
        for warning in &report.warnings {
            warn!(flow_id = %flow.id, warning = %warning, "flow published with warning");
        }
        flow.status = crate::flow::FlowStatus::Active;
        self.flows.insert(flow.bot_id.clone(), Arc::new(flow));
        Ok(())
    }
}

impl Default for InMemoryFlows {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowSource for InMemoryFlows {
    async fn active_flow(&self, bot_id: &str) -> Result<Option<Arc<FlowDefinition>>> {
        Ok(self.flows.get(bot_id).map(|f| f.clone()))
    }
}

/// Orchestrates the load → execute → save pattern for inbound events.
pub struct StepRunner {
    engine: Arc<Engine>,
    store: Arc<SessionStore>,
    flows: Arc<dyn FlowSource>,
    groups: Option<Arc<GroupService>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl StepRunner {
    pub fn new(engine: Arc<Engine>, store: Arc<SessionStore>, flows: Arc<dyn FlowSource>) -> Self {
        Self {
            engine,
            store,
            flows,
            groups: None,
            locks: DashMap::new(),
        }
    }

    /// Wire the group service so group-bound sessions keep their lobby's
    /// activity clock fresh.
    pub fn with_groups(mut self, groups: Arc<GroupService>) -> Self {
        self.groups = Some(groups);
        self
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Process one inbound event for a participant: the single critical
    /// section per session key. A save failure on a persistence-required
    /// path propagates; the caller must not treat the event as consumed.
    pub async fn process_event(
        &self,
        bot_id: &str,
        participant_id: &str,
        event: InboundEvent,
    ) -> Result<StepOutcome> {
        let flow = self
            .flows
            .active_flow(bot_id)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound(format!("no active flow for bot {bot_id}")))?;

        let key = session_key(bot_id, participant_id);
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let session = self.prepare_session(bot_id, participant_id, &flow).await?;
        if let (Some(groups), Some(group_id)) = (&self.groups, session.group_ref) {
            if let Err(e) = groups.touch(group_id).await {
                warn!(group_id = %group_id, error = %e, "group activity touch failed");
            }
        }

        let outcome = self.engine.execute(&flow, session, &event).await?;
        let force = outcome.status == StepStatus::Completed;
        self.store.save_session(&outcome.session, force).await?;
        debug!(
            session_key = %key,
            status = ?outcome.status,
            actions = outcome.actions.len(),
            "step processed"
        );
        Ok(outcome)
    }

    /// Merge an endpoint payload into the session and, when the session is
    /// parked at that endpoint node, resume execution with a synthetic
    /// event. Returns the step outcome when a resumption ran.
    pub async fn resume_endpoint(
        &self,
        bot_id: &str,
        participant_id: &str,
        node_id: &str,
        payload: Map<String, Value>,
    ) -> Result<Option<StepOutcome>> {
        let flow = self
            .flows
            .active_flow(bot_id)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound(format!("no active flow for bot {bot_id}")))?;

        let key = session_key(bot_id, participant_id);
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let mut session = self.prepare_session(bot_id, participant_id, &flow).await?;
        for (field, value) in &payload {
            session.variables.set(
                Scope::Session,
                format!("endpoint_{node_id}_{field}"),
                value.clone(),
            );
        }

        let parked_at_endpoint = session
            .pending_wait
            .as_ref()
            .is_some_and(|w| w.kind == WaitKind::Endpoint && w.node_id == node_id);

        if parked_at_endpoint {
            let event = InboundEvent::EndpointResume {
                node_id: node_id.to_string(),
                payload,
            };
            let outcome = self.engine.execute(&flow, session, &event).await?;
            self.store.save_session(&outcome.session, true).await?;
            info!(session_key = %key, node_id, "session resumed from endpoint");
            Ok(Some(outcome))
        } else {
            self.store.save_session(&session, true).await?;
            debug!(session_key = %key, node_id, "endpoint payload merged, session not parked at endpoint");
            Ok(None)
        }
    }

    /// Load the participant's session, starting a fresh one (preserving
    /// the user and global variable scopes) when the stored session is
    /// finished or belongs to a superseded flow version.
    async fn prepare_session(
        &self,
        bot_id: &str,
        participant_id: &str,
        flow: &FlowDefinition,
    ) -> Result<Session> {
        let mut session = self
            .store
            .load_or_create(bot_id, participant_id, &flow.id)
            .await?;

        if session.status != SessionStatus::Active {
            debug!(session_key = %session.session_key, "previous session finished, starting fresh");
            let mut fresh = Session::new(bot_id, participant_id, &flow.id);
            fresh.variables.replace_scope(
                Scope::User,
                session.variables.scope_map(Scope::User).clone(),
            );
            fresh.variables.replace_scope(
                Scope::Global,
                session.variables.scope_map(Scope::Global).clone(),
            );
            session = fresh;
        } else if session.flow_id != flow.id {
            // The bot republished its flow: node ids are not comparable,
            // restart from the top of the new version.
            info!(session_key = %session.session_key, old_flow = %session.flow_id, new_flow = %flow.id, "flow version changed, restarting session");
            session.flow_id = flow.id.clone();
            session.current_node_id = None;
            session.pending_wait = None;
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Edge, EdgeLabel, Node, NodeConfig};
    use crate::storage::{InMemoryCache, InMemoryDurable};
    use crate::variables::VariableOp;
    use serde_json::json;

    fn counter_flow(bot_id: &str) -> FlowDefinition {
        FlowDefinition {
            id: "count-v1".into(),
            bot_id: bot_id.into(),
            status: crate::flow::FlowStatus::Active,
            nodes: vec![
                Node { id: "start".into(), config: NodeConfig::Start },
                Node {
                    id: "inc".into(),
                    config: NodeConfig::Variable {
                        name: "events_seen".into(),
                        scope: Scope::User,
                        operation: VariableOp::Increment,
                        value: json!(1),
                    },
                },
                Node { id: "done".into(), config: NodeConfig::End },
            ],
            edges: vec![
                Edge { from: "start".into(), to: "inc".into(), label: EdgeLabel::Default },
                Edge { from: "inc".into(), to: "done".into(), label: EdgeLabel::Default },
            ],
        }
    }

    fn runner_with(flow: FlowDefinition) -> (Arc<StepRunner>, Arc<SessionStore>) {
        let flows = Arc::new(InMemoryFlows::new());
        flows.publish(flow).unwrap();
        let store = Arc::new(SessionStore::new(
            Arc::new(InMemoryCache::new()),
            Arc::new(InMemoryDurable::new()),
        ));
        let runner = Arc::new(StepRunner::new(Arc::new(Engine::default()), store.clone(), flows));
        (runner, store)
    }

    #[tokio::test]
    async fn missing_flow_is_an_error() {
        let (runner, _) = runner_with(counter_flow("b1"));
        let err = runner
            .process_event("other-bot", "p1", InboundEvent::Tick)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::FlowNotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_events_for_one_session_never_lose_updates() {
        let (runner, store) = runner_with(counter_flow("b1"));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let runner = runner.clone();
            handles.push(tokio::spawn(async move {
                runner
                    .process_event("b1", "p1", InboundEvent::Tick)
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Each event ran the whole flow once; the user-scope counter must
        // reflect all ten despite the concurrency.
        let session = store.get_session("b1", "p1").await.unwrap().unwrap();
        assert_eq!(session.variables.resolve("events_seen"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn finished_session_restarts_but_keeps_user_scope() {
        let (runner, _) = runner_with(counter_flow("b1"));
        runner.process_event("b1", "p1", InboundEvent::Tick).await.unwrap();
        let outcome = runner.process_event("b1", "p1", InboundEvent::Tick).await.unwrap();
        assert_eq!(outcome.session.variables.resolve("events_seen"), Some(&json!(2)));
    }
}
