use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{FlowError, Result};
use crate::event::{Action, InboundEvent, StepOutcome, StepStatus};
use crate::flow::{
    BroadcastAudience, ConditionOperator, EdgeLabel, FieldKind, FlowDefinition, FormField, Node,
    NodeConfig, RandomOption,
};
use crate::session::{PendingWait, Session, SessionStatus, WaitKind};
use crate::variables::{
    render_template, value_to_string, Scope, ScopedVariables, VariableMutation,
};

/// Outbound HTTP call issued by a webhook node.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: Value,
}

/// Seam for the webhook node's outbound call, so the engine is testable
/// without network access.
#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn call(&self, request: &WebhookRequest) -> Result<WebhookResponse>;
}

/// Webhook client for builds without the `webhook` feature; every call
/// fails, which routes the node to its error edge.
pub struct DisabledWebhook;

#[async_trait]
impl WebhookClient for DisabledWebhook {
    async fn call(&self, request: &WebhookRequest) -> Result<WebhookResponse> {
        Err(FlowError::Webhook {
            url: request.url.clone(),
            attempts: 0,
            reason: "webhook support disabled".to_string(),
        })
    }
}

#[cfg(feature = "webhook")]
pub struct HttpWebhookClient {
    client: reqwest::Client,
}

#[cfg(feature = "webhook")]
impl HttpWebhookClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[cfg(feature = "webhook")]
impl Default for HttpWebhookClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "webhook")]
#[async_trait]
impl WebhookClient for HttpWebhookClient {
    async fn call(&self, request: &WebhookRequest) -> Result<WebhookResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| FlowError::Validation(format!("invalid HTTP method: {}", request.method)))?;
        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(|e| FlowError::Webhook {
            url: request.url.clone(),
            attempts: 1,
            reason: e.to_string(),
        })?;
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(WebhookResponse { status, body })
    }
}

/// Seam for integration nodes: a named action against a third-party
/// service wired up by the host platform.
#[async_trait]
pub trait IntegrationRegistry: Send + Sync {
    async fn run(
        &self,
        service: &str,
        action: &str,
        params: &HashMap<String, Value>,
    ) -> Result<Value>;
}

/// Registry with nothing wired up; every integration node fails over to
/// its error edge.
pub struct NoIntegrations;

#[async_trait]
impl IntegrationRegistry for NoIntegrations {
    async fn run(
        &self,
        service: &str,
        action: &str,
        _params: &HashMap<String, Value>,
    ) -> Result<Value> {
        Err(FlowError::Validation(format!(
            "no integration registered for {service}.{action}"
        )))
    }
}

/// Resolves a broadcast audience to participant ids. The participant
/// registry lives with a collaborator; the engine only expands actions.
#[async_trait]
pub trait RecipientSource: Send + Sync {
    async fn resolve(&self, bot_id: &str, audience: &BroadcastAudience) -> Result<Vec<String>>;
}

/// Default recipient source: explicit lists resolve from the node config
/// itself; registry-backed audiences resolve to nobody.
pub struct ListOnlyRecipients;

#[async_trait]
impl RecipientSource for ListOnlyRecipients {
    async fn resolve(&self, bot_id: &str, audience: &BroadcastAudience) -> Result<Vec<String>> {
        match audience {
            BroadcastAudience::List { ids } => Ok(ids.clone()),
            _ => {
                warn!(bot_id, "no participant registry wired, broadcast resolves to nobody");
                Ok(Vec::new())
            }
        }
    }
}

/// What a node handler decided for this iteration of the step loop.
enum Step {
    Advance(String),
    Wait,
    Halt,
    Complete,
}

/// The flow interpreter. Holds no storage handles: it mutates only the
/// session value passed in and the action list it is building.
pub struct Engine {
    webhook: Arc<dyn WebhookClient>,
    recipients: Arc<dyn RecipientSource>,
    integrations: Arc<dyn IntegrationRegistry>,
    /// Upper bound on nodes chained within a single step, against cyclic
    /// flows with no waiting node.
    max_chain: usize,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Arc::new(DisabledWebhook), Arc::new(ListOnlyRecipients))
    }
}

impl Engine {
    pub fn new(webhook: Arc<dyn WebhookClient>, recipients: Arc<dyn RecipientSource>) -> Self {
        Self {
            webhook,
            recipients,
            integrations: Arc::new(NoIntegrations),
            max_chain: 64,
        }
    }

    #[cfg(feature = "webhook")]
    pub fn with_http_client(recipients: Arc<dyn RecipientSource>) -> Self {
        Self::new(Arc::new(HttpWebhookClient::new()), recipients)
    }

    pub fn with_integrations(mut self, integrations: Arc<dyn IntegrationRegistry>) -> Self {
        self.integrations = integrations;
        self
    }

    /// Execute one step: interpret the current node against the inbound
    /// event, chain through non-waiting nodes, and return the mutated
    /// session plus the actions to hand to the transport.
    pub async fn execute(
        &self,
        flow: &FlowDefinition,
        mut session: Session,
        event: &InboundEvent,
    ) -> Result<StepOutcome> {
        if session.status != SessionStatus::Active {
            return Err(FlowError::Validation(format!(
                "session {} is not active",
                session.session_key
            )));
        }

        let mut actions = Vec::new();
        let mut next_wait = None;
        session.touch();

        let mut current = match &session.current_node_id {
            Some(id) => id.clone(),
            None => flow.start_node()?.id.clone(),
        };
        session.current_node_id = Some(current.clone());

        // An expired wait is a no-op input: drop it and re-evaluate the
        // node instead of auto-advancing.
        if session.pending_wait.as_ref().is_some_and(|w| w.expired(Utc::now())) {
            debug!(session_key = %session.session_key, node = %current, "pending wait expired, re-evaluating node");
            session.pending_wait = None;
        }

        let mut steps = 0;
        loop {
            steps += 1;
            if steps > self.max_chain {
                return Err(FlowError::Validation(format!(
                    "flow {} exceeded {} chained nodes at {}",
                    flow.id, self.max_chain, current
                )));
            }

            let node = flow
                .node(&current)
                .ok_or_else(|| FlowError::NodeNotFound(current.clone()))?;

            let parked_here = session
                .pending_wait
                .as_ref()
                .is_some_and(|w| w.node_id == node.id);

            let step = if parked_here {
                self.handle_input(flow, node, &mut session, event, &mut actions, &mut next_wait)
                    .await?
            } else {
                self.enter_node(flow, node, &mut session, &mut actions, &mut next_wait)
                    .await?
            };

            match step {
                Step::Advance(next) => {
                    session.current_node_id = Some(next.clone());
                    current = next;
                }
                Step::Wait => {
                    return Ok(StepOutcome {
                        session,
                        actions,
                        next_wait,
                        status: StepStatus::WaitingForInput,
                    });
                }
                Step::Halt => {
                    return Ok(StepOutcome {
                        session,
                        actions,
                        next_wait,
                        status: StepStatus::Halted,
                    });
                }
                Step::Complete => {
                    info!(session_key = %session.session_key, flow_id = %flow.id, "flow completed");
                    session.status = SessionStatus::Completed;
                    session.pending_wait = None;
                    session.variables.clear_scope(Scope::Session);
                    return Ok(StepOutcome {
                        session,
                        actions,
                        next_wait,
                        status: StepStatus::Completed,
                    });
                }
            }
        }
    }

    /// Evaluate a node being stepped onto for the first time.
    async fn enter_node(
        &self,
        flow: &FlowDefinition,
        node: &Node,
        session: &mut Session,
        actions: &mut Vec<Action>,
        next_wait: &mut Option<chrono::DateTime<Utc>>,
    ) -> Result<Step> {
        debug!(session_key = %session.session_key, node = %node.id, node_type = node.config.type_name(), "entering node");
        match &node.config {
            NodeConfig::Start => Ok(advance_or_halt(flow, &node.id)),

            NodeConfig::Message { text, attachments } => {
                actions.push(Action::SendMessage {
                    to: session.participant_id.clone(),
                    text: render_template(text, &session.variables),
                    attachments: attachments.clone(),
                });
                Ok(advance_or_halt(flow, &node.id))
            }

            NodeConfig::Keyboard { text, buttons, .. } => {
                actions.push(Action::SendKeyboard {
                    to: session.participant_id.clone(),
                    text: render_template(text, &session.variables),
                    buttons: buttons.clone(),
                });
                park(session, &node.id, WaitKind::Keyboard, None, None);
                Ok(Step::Wait)
            }

            NodeConfig::Condition { field, operator, value, case_sensitive } => {
                let outcome = evaluate_condition(
                    session.variables.resolve(field),
                    *operator,
                    value,
                    *case_sensitive,
                );
                let label = if outcome { EdgeLabel::OnTrue } else { EdgeLabel::OnFalse };
                match flow.edge_target(&node.id, &label) {
                    Some(target) => Ok(Step::Advance(target.to_string())),
                    None => {
                        info!(node = %node.id, outcome, "no edge for condition outcome, halting");
                        Ok(Step::Halt)
                    }
                }
            }

            NodeConfig::Webhook { url, method, headers, body, timeout_ms, retry_count } => {
                let request = WebhookRequest {
                    url: render_template(url, &session.variables),
                    method: method.clone(),
                    headers: headers.clone(),
                    body: body.as_ref().map(|b| render_value(b, &session.variables)),
                    timeout: Duration::from_millis(*timeout_ms),
                };
                self.run_webhook(flow, node, session, &request, *retry_count).await
            }

            NodeConfig::Form { fields, .. } => {
                if fields.is_empty() {
                    return Ok(advance_or_halt(flow, &node.id));
                }
                actions.push(Action::SendMessage {
                    to: session.participant_id.clone(),
                    text: render_template(&fields[0].prompt, &session.variables),
                    attachments: Vec::new(),
                });
                park(session, &node.id, WaitKind::Form, None, Some(0));
                Ok(Step::Wait)
            }

            NodeConfig::Delay { value, unit } => {
                let wake = Utc::now() + unit.to_duration(*value);
                park(session, &node.id, WaitKind::Delay, None, None);
                *next_wait = Some(wake);
                Ok(Step::Wait)
            }

            NodeConfig::Variable { name, scope, operation, value } => {
                session.variables.apply(&VariableMutation {
                    scope: *scope,
                    key: name.clone(),
                    op: *operation,
                    value: render_value(value, &session.variables),
                });
                Ok(advance_or_halt(flow, &node.id))
            }

            NodeConfig::File { url, caption } => {
                actions.push(Action::SendFile {
                    to: session.participant_id.clone(),
                    url: url.clone(),
                    caption: caption
                        .as_ref()
                        .map(|c| render_template(c, &session.variables)),
                });
                Ok(advance_or_halt(flow, &node.id))
            }

            NodeConfig::Random { options, variable } => {
                let Some(chosen) = pick_weighted(options, &mut rand::thread_rng()) else {
                    warn!(node = %node.id, "random node has no selectable option");
                    return Ok(Step::Halt);
                };
                let value = chosen.value.clone();
                if let Some(name) = variable {
                    session.variables.set(Scope::Session, name.clone(), value.clone());
                }
                match flow
                    .edge_target(&node.id, &EdgeLabel::Value(value.clone()))
                    .or_else(|| flow.default_target(&node.id))
                {
                    Some(target) => Ok(Step::Advance(target.to_string())),
                    None => Ok(Step::Halt),
                }
            }

            NodeConfig::Integration { service, action, params } => {
                let rendered: HashMap<String, Value> = params
                    .iter()
                    .map(|(k, v)| (k.clone(), render_value(v, &session.variables)))
                    .collect();
                match self.integrations.run(service, action, &rendered).await {
                    Ok(result) => {
                        session.variables.set(
                            Scope::Session,
                            format!("integration_{}", node.id),
                            result,
                        );
                        Ok(advance_or_halt(flow, &node.id))
                    }
                    Err(e) => {
                        warn!(node = %node.id, service = %service, action = %action, error = %e, "integration failed");
                        match flow.edge_target(&node.id, &EdgeLabel::OnError) {
                            Some(target) => Ok(Step::Advance(target.to_string())),
                            None => Ok(Step::Halt),
                        }
                    }
                }
            }

            NodeConfig::Endpoint { .. } => {
                park(session, &node.id, WaitKind::Endpoint, None, None);
                Ok(Step::Wait)
            }

            NodeConfig::Broadcast { text, audience } => {
                let recipients = self.recipients.resolve(&session.bot_id, audience).await?;
                let rendered = render_template(text, &session.variables);
                info!(node = %node.id, count = recipients.len(), "broadcast expanded");
                for recipient in recipients {
                    actions.push(Action::SendMessage {
                        to: recipient,
                        text: rendered.clone(),
                        attachments: Vec::new(),
                    });
                }
                Ok(advance_or_halt(flow, &node.id))
            }

            NodeConfig::End => Ok(Step::Complete),
        }
    }

    /// Feed the inbound event to the node the session is parked at.
    async fn handle_input(
        &self,
        flow: &FlowDefinition,
        node: &Node,
        session: &mut Session,
        event: &InboundEvent,
        actions: &mut Vec<Action>,
        next_wait: &mut Option<chrono::DateTime<Utc>>,
    ) -> Result<Step> {
        match &node.config {
            NodeConfig::Keyboard { buttons, variable, .. } => {
                let InboundEvent::Callback { data } = event else {
                    return Ok(Step::Wait);
                };
                if !buttons.iter().any(|b| &b.data == data) {
                    debug!(node = %node.id, data = %data, "callback does not match any button");
                    return Ok(Step::Wait);
                }
                if let Some(name) = variable {
                    session
                        .variables
                        .set(Scope::Session, name.clone(), data.clone());
                }
                session.pending_wait = None;
                match flow
                    .edge_target(&node.id, &EdgeLabel::Value(data.clone()))
                    .or_else(|| flow.default_target(&node.id))
                {
                    Some(target) => Ok(Step::Advance(target.to_string())),
                    None => Ok(Step::Halt),
                }
            }

            NodeConfig::Form { fields, scope } => {
                let InboundEvent::Message { text } = event else {
                    return Ok(Step::Wait);
                };
                self.advance_form(flow, node, fields, *scope, session, text, actions)
            }

            NodeConfig::Delay { value, unit } => {
                let requested_at = session
                    .pending_wait
                    .as_ref()
                    .map(|w| w.requested_at)
                    .unwrap_or_else(Utc::now);
                let wake = requested_at + unit.to_duration(*value);
                if Utc::now() >= wake {
                    session.pending_wait = None;
                    Ok(advance_or_halt(flow, &node.id))
                } else {
                    *next_wait = Some(wake);
                    Ok(Step::Wait)
                }
            }

            NodeConfig::Endpoint { .. } => {
                let InboundEvent::EndpointResume { node_id, .. } = event else {
                    return Ok(Step::Wait);
                };
                if node_id != &node.id {
                    return Ok(Step::Wait);
                }
                session.pending_wait = None;
                Ok(advance_or_halt(flow, &node.id))
            }

            // A wait marker on a non-waiting node means the session state
            // predates a flow edit; re-evaluate the node from scratch.
            _ => {
                warn!(node = %node.id, "wait marker on non-waiting node, re-entering");
                session.pending_wait = None;
                Box::pin(self.enter_node(flow, node, session, actions, next_wait)).await
            }
        }
    }

    fn advance_form(
        &self,
        flow: &FlowDefinition,
        node: &Node,
        fields: &[FormField],
        scope: Scope,
        session: &mut Session,
        input: &str,
        actions: &mut Vec<Action>,
    ) -> Result<Step> {
        let index = session
            .pending_wait
            .as_ref()
            .and_then(|w| w.form_field_index)
            .unwrap_or(0);
        let Some(field) = fields.get(index) else {
            session.pending_wait = None;
            return Ok(advance_or_halt(flow, &node.id));
        };

        match validate_field(field, input) {
            Some(value) => {
                session
                    .variables
                    .set(Scope::Session, temp_form_key(&node.id, &field.name), value);
            }
            None => {
                debug!(node = %node.id, field = %field.name, "form input rejected");
                actions.push(Action::SendMessage {
                    to: session.participant_id.clone(),
                    text: render_template(&field.prompt, &session.variables),
                    attachments: Vec::new(),
                });
                return Ok(Step::Wait);
            }
        }

        let next_index = index + 1;
        if let Some(next_field) = fields.get(next_index) {
            actions.push(Action::SendMessage {
                to: session.participant_id.clone(),
                text: render_template(&next_field.prompt, &session.variables),
                attachments: Vec::new(),
            });
            park(session, &node.id, WaitKind::Form, None, Some(next_index));
            return Ok(Step::Wait);
        }

        // All fields collected: bulk-assign into the target scope.
        for field in fields {
            if let Some(value) = session
                .variables
                .remove(Scope::Session, &temp_form_key(&node.id, &field.name))
            {
                session.variables.set(scope, field.name.clone(), value);
            }
        }
        session.pending_wait = None;
        Ok(advance_or_halt(flow, &node.id))
    }

    async fn run_webhook(
        &self,
        flow: &FlowDefinition,
        node: &Node,
        session: &mut Session,
        request: &WebhookRequest,
        retry_count: u32,
    ) -> Result<Step> {
        let attempts = retry_count.max(1);
        for attempt in 1..=attempts {
            match self.webhook.call(request).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    session.variables.set(
                        Scope::Session,
                        format!("webhook_{}", node.id),
                        response.body,
                    );
                    return Ok(advance_or_halt(flow, &node.id));
                }
                Ok(response) => {
                    warn!(node = %node.id, status = response.status, attempt, "webhook returned non-2xx");
                }
                Err(e) => {
                    warn!(node = %node.id, error = %e, attempt, "webhook call failed");
                }
            }
        }
        match flow.edge_target(&node.id, &EdgeLabel::OnError) {
            Some(target) => Ok(Step::Advance(target.to_string())),
            None => {
                // Stay at the webhook node; the next inbound tick retries.
                info!(node = %node.id, attempts, "webhook failed with no error edge, halting for redelivery");
                Ok(Step::Halt)
            }
        }
    }
}

fn advance_or_halt(flow: &FlowDefinition, node_id: &str) -> Step {
    match flow.default_target(node_id) {
        Some(target) => Step::Advance(target.to_string()),
        None => {
            info!(node = %node_id, "no outgoing edge, halting");
            Step::Halt
        }
    }
}

fn park(
    session: &mut Session,
    node_id: &str,
    kind: WaitKind,
    timeout_ms: Option<u64>,
    form_field_index: Option<usize>,
) {
    session.pending_wait = Some(PendingWait {
        node_id: node_id.to_string(),
        kind,
        requested_at: Utc::now(),
        timeout_ms,
        form_field_index,
    });
}

fn temp_form_key(node_id: &str, field_name: &str) -> String {
    format!("_form_{node_id}_{field_name}")
}

/// Validate a form input against the field kind; returns the typed value
/// to store, or None if rejected.
fn validate_field(field: &FormField, input: &str) -> Option<Value> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return if field.required { None } else { Some(Value::String(String::new())) };
    }
    match field.kind {
        FieldKind::Text => Some(Value::String(trimmed.to_string())),
        FieldKind::Number => trimmed.parse::<f64>().ok().and_then(|n| {
            serde_json::Number::from_f64(n).map(Value::Number)
        }),
        FieldKind::Email => {
            let valid = trimmed.contains('@') && trimmed.rsplit('@').next().is_some_and(|d| d.contains('.'));
            valid.then(|| Value::String(trimmed.to_string()))
        }
        FieldKind::Phone => {
            let digits = trimmed.chars().filter(|c| c.is_ascii_digit()).count();
            let clean = trimmed
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | ' ' | '(' | ')'));
            (clean && digits >= 5).then(|| Value::String(trimmed.to_string()))
        }
    }
}

/// Evaluate a condition operator against the resolved variable value.
fn evaluate_condition(
    actual: Option<&Value>,
    operator: ConditionOperator,
    expected: &str,
    case_sensitive: bool,
) -> bool {
    use ConditionOperator::*;

    match operator {
        Exists => return actual.is_some(),
        NotExists => return actual.is_none(),
        _ => {}
    }

    let actual_raw = actual.map(value_to_string).unwrap_or_default();

    if operator == Regex {
        let pattern = if case_sensitive {
            expected.to_string()
        } else {
            format!("(?i){expected}")
        };
        return match regex::Regex::new(&pattern) {
            Ok(re) => re.is_match(&actual_raw),
            Err(e) => {
                warn!(pattern = expected, error = %e, "invalid condition regex");
                false
            }
        };
    }

    let (a, e) = if case_sensitive {
        (actual_raw.clone(), expected.to_string())
    } else {
        (actual_raw.to_lowercase(), expected.to_lowercase())
    };

    match operator {
        Equals => a == e,
        NotEquals => a != e,
        Contains => a.contains(&e),
        NotContains => !a.contains(&e),
        StartsWith => a.starts_with(&e),
        EndsWith => a.ends_with(&e),
        IsEmpty => a.is_empty(),
        IsNotEmpty => !a.is_empty(),
        GreaterThan => match (a.trim().parse::<f64>(), e.trim().parse::<f64>()) {
            (Ok(x), Ok(y)) => x > y,
            _ => false,
        },
        LessThan => match (a.trim().parse::<f64>(), e.trim().parse::<f64>()) {
            (Ok(x), Ok(y)) => x < y,
            _ => false,
        },
        Exists | NotExists | Regex => unreachable!("handled above"),
    }
}

/// Weighted random choice; selection probability = weight / sum(weights).
/// Returns None when no option carries positive weight.
pub fn pick_weighted<'a, R: Rng>(
    options: &'a [RandomOption],
    rng: &mut R,
) -> Option<&'a RandomOption> {
    let total: u64 = options.iter().map(|o| o.weight as u64).sum();
    if total == 0 {
        return None;
    }
    let mut roll = rng.gen_range(0..total);
    for option in options {
        let weight = option.weight as u64;
        if roll < weight {
            return Some(option);
        }
        roll -= weight;
    }
    None
}

fn render_value(value: &Value, vars: &ScopedVariables) -> Value {
    match value {
        Value::String(s) => Value::String(render_template(s, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Button, Edge, FlowStatus};
    use crate::variables::VariableOp;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flow(nodes: Vec<Node>, edges: Vec<Edge>) -> FlowDefinition {
        FlowDefinition {
            id: "f1".into(),
            bot_id: "b1".into(),
            status: FlowStatus::Active,
            nodes,
            edges,
        }
    }

    fn edge(from: &str, to: &str, label: EdgeLabel) -> Edge {
        Edge { from: from.into(), to: to.into(), label }
    }

    fn node(id: &str, config: NodeConfig) -> Node {
        Node { id: id.into(), config }
    }

    fn msg(text: &str) -> NodeConfig {
        NodeConfig::Message { text: text.into(), attachments: vec![] }
    }

    fn session() -> Session {
        Session::new("b1", "p1", "f1")
    }

    #[tokio::test]
    async fn message_chain_runs_to_completion() {
        let flow = flow(
            vec![
                node("start", NodeConfig::Start),
                node("hello", msg("Hello {{name}}")),
                node("done", NodeConfig::End),
            ],
            vec![
                edge("start", "hello", EdgeLabel::Default),
                edge("hello", "done", EdgeLabel::Default),
            ],
        );
        let mut session = session();
        session.variables.set(Scope::User, "name", "Ada");

        let outcome = Engine::default()
            .execute(&flow, session, &InboundEvent::Message { text: "hi".into() })
            .await
            .unwrap();

        assert_eq!(outcome.status, StepStatus::Completed);
        assert_eq!(outcome.session.status, SessionStatus::Completed);
        assert_eq!(outcome.actions.len(), 1);
        match &outcome.actions[0] {
            Action::SendMessage { text, .. } => assert_eq!(text, "Hello Ada"),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[tokio::test]
    async fn next_node_is_always_an_edge_target_or_unchanged() {
        // keyboard -> keyboard so every advance is exactly one hop.
        let flow = flow(
            vec![
                node("start", NodeConfig::Start),
                node(
                    "k1",
                    NodeConfig::Keyboard {
                        text: "pick".into(),
                        buttons: vec![Button { label: "Go".into(), data: "go".into() }],
                        variable: None,
                    },
                ),
                node(
                    "k2",
                    NodeConfig::Keyboard {
                        text: "again".into(),
                        buttons: vec![Button { label: "Go".into(), data: "go".into() }],
                        variable: None,
                    },
                ),
            ],
            vec![
                edge("start", "k1", EdgeLabel::Default),
                edge("k1", "k2", EdgeLabel::Default),
            ],
        );
        let engine = Engine::default();

        let outcome = engine
            .execute(&flow, session(), &InboundEvent::Message { text: "hi".into() })
            .await
            .unwrap();
        assert_eq!(outcome.session.current_node_id.as_deref(), Some("k1"));

        let before = outcome.session.current_node_id.clone().unwrap();
        let targets: Vec<String> = flow.outgoing(&before).map(|e| e.to.clone()).collect();
        let outcome = engine
            .execute(&flow, outcome.session, &InboundEvent::Callback { data: "go".into() })
            .await
            .unwrap();
        let after = outcome.session.current_node_id.clone().unwrap();
        assert!(after == before || targets.contains(&after));

        // An unmatched callback leaves the node unchanged.
        let parked = outcome.session.current_node_id.clone().unwrap();
        let outcome = engine
            .execute(&flow, outcome.session, &InboundEvent::Callback { data: "bogus".into() })
            .await
            .unwrap();
        assert_eq!(outcome.session.current_node_id.unwrap(), parked);
    }

    #[tokio::test]
    async fn condition_routes_true_false_and_halts_without_edge() {
        let build = |with_false_edge: bool| {
            let mut edges = vec![
                edge("start", "cond", EdgeLabel::Default),
                edge("cond", "yes", EdgeLabel::OnTrue),
            ];
            if with_false_edge {
                edges.push(edge("cond", "no", EdgeLabel::OnFalse));
            }
            flow(
                vec![
                    node("start", NodeConfig::Start),
                    node(
                        "cond",
                        NodeConfig::Condition {
                            field: "selected".into(),
                            operator: ConditionOperator::Equals,
                            value: "x".into(),
                            case_sensitive: false,
                        },
                    ),
                    node("yes", NodeConfig::End),
                    node("no", NodeConfig::End),
                ],
                edges,
            )
        };
        let engine = Engine::default();

        let mut s = session();
        s.variables.set(Scope::Session, "selected", "x");
        let outcome = engine
            .execute(&build(true), s, &InboundEvent::Tick)
            .await
            .unwrap();
        assert_eq!(outcome.session.current_node_id.as_deref(), Some("yes"));

        let mut s = session();
        s.variables.set(Scope::Session, "selected", "y");
        let outcome = engine
            .execute(&build(true), s, &InboundEvent::Tick)
            .await
            .unwrap();
        assert_eq!(outcome.session.current_node_id.as_deref(), Some("no"));

        // No false edge: halt at the condition node, not an error.
        let mut s = session();
        s.variables.set(Scope::Session, "selected", "y");
        let outcome = engine
            .execute(&build(false), s, &InboundEvent::Tick)
            .await
            .unwrap();
        assert_eq!(outcome.status, StepStatus::Halted);
        assert_eq!(outcome.session.current_node_id.as_deref(), Some("cond"));
    }

    #[test]
    fn condition_operator_table() {
        use ConditionOperator::*;
        let v = json!("Hello World");
        assert!(evaluate_condition(Some(&v), Equals, "hello world", false));
        assert!(!evaluate_condition(Some(&v), Equals, "hello world", true));
        assert!(evaluate_condition(Some(&v), Contains, "World", true));
        assert!(evaluate_condition(Some(&v), StartsWith, "hello", false));
        assert!(evaluate_condition(Some(&v), EndsWith, "world", false));
        assert!(evaluate_condition(Some(&v), Regex, "^hello\\s", false));
        assert!(!evaluate_condition(Some(&v), Regex, "^hello\\s", true));
        assert!(evaluate_condition(Some(&v), Exists, "", true));
        assert!(evaluate_condition(None, NotExists, "", true));
        assert!(evaluate_condition(None, IsEmpty, "", true));
        assert!(evaluate_condition(Some(&json!(10)), GreaterThan, "9.5", true));
        assert!(evaluate_condition(Some(&json!("3")), LessThan, "4", true));
        assert!(!evaluate_condition(Some(&json!("abc")), GreaterThan, "1", true));
    }

    #[test]
    fn weighted_random_converges_to_weight_ratio() {
        let options = vec![
            RandomOption { value: "a".into(), weight: 1 },
            RandomOption { value: "b".into(), weight: 3 },
        ];
        let mut rng = StdRng::seed_from_u64(42);
        let mut b_count = 0u32;
        for _ in 0..10_000 {
            if pick_weighted(&options, &mut rng).unwrap().value == "b" {
                b_count += 1;
            }
        }
        let ratio = b_count as f64 / 10_000.0;
        assert!((ratio - 0.75).abs() < 0.03, "ratio was {ratio}");
    }

    #[tokio::test]
    async fn random_node_assigns_variable_and_routes_by_value() {
        let flow = flow(
            vec![
                node("start", NodeConfig::Start),
                node(
                    "rand",
                    NodeConfig::Random {
                        options: vec![RandomOption { value: "only".into(), weight: 1 }],
                        variable: Some("prize".into()),
                    },
                ),
                node("won", NodeConfig::End),
            ],
            vec![
                edge("start", "rand", EdgeLabel::Default),
                edge("rand", "won", EdgeLabel::Value("only".into())),
            ],
        );
        let outcome = Engine::default()
            .execute(&flow, session(), &InboundEvent::Tick)
            .await
            .unwrap();
        assert_eq!(outcome.status, StepStatus::Completed);
    }

    struct FlakyWebhook {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl WebhookClient for FlakyWebhook {
        async fn call(&self, _request: &WebhookRequest) -> Result<WebhookResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(FlowError::Webhook {
                    url: "test".into(),
                    attempts: 1,
                    reason: "connection refused".into(),
                })
            } else {
                Ok(WebhookResponse { status: 200, body: json!({"ok": true}) })
            }
        }
    }

    fn webhook_flow(with_error_edge: bool) -> FlowDefinition {
        let mut edges = vec![
            edge("start", "hook", EdgeLabel::Default),
            edge("hook", "done", EdgeLabel::Default),
        ];
        if with_error_edge {
            edges.push(edge("hook", "failed", EdgeLabel::OnError));
        }
        flow(
            vec![
                node("start", NodeConfig::Start),
                node(
                    "hook",
                    NodeConfig::Webhook {
                        url: "https://example.com/hook".into(),
                        method: "POST".into(),
                        headers: HashMap::new(),
                        body: None,
                        timeout_ms: 1_000,
                        retry_count: 3,
                    },
                ),
                node("done", NodeConfig::End),
                node("failed", NodeConfig::End),
            ],
            edges,
        )
    }

    #[tokio::test]
    async fn webhook_retries_then_succeeds() {
        let client = Arc::new(FlakyWebhook { calls: AtomicU32::new(0), fail_first: 2 });
        let engine = Engine::new(client.clone(), Arc::new(ListOnlyRecipients));
        let outcome = engine
            .execute(&webhook_flow(false), session(), &InboundEvent::Tick)
            .await
            .unwrap();
        assert_eq!(outcome.status, StepStatus::Completed);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            outcome.session.current_node_id.as_deref(),
            Some("done"),
        );
    }

    #[tokio::test]
    async fn webhook_exhausts_retries_then_takes_error_edge() {
        let client = Arc::new(FlakyWebhook { calls: AtomicU32::new(0), fail_first: 99 });
        let engine = Engine::new(client.clone(), Arc::new(ListOnlyRecipients));
        let outcome = engine
            .execute(&webhook_flow(true), session(), &InboundEvent::Tick)
            .await
            .unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.session.current_node_id.as_deref(), Some("failed"));
    }

    #[tokio::test]
    async fn webhook_without_error_edge_halts_for_redelivery() {
        let client = Arc::new(FlakyWebhook { calls: AtomicU32::new(0), fail_first: 99 });
        let engine = Engine::new(client, Arc::new(ListOnlyRecipients));
        let outcome = engine
            .execute(&webhook_flow(false), session(), &InboundEvent::Tick)
            .await
            .unwrap();
        assert_eq!(outcome.status, StepStatus::Halted);
        assert_eq!(outcome.session.current_node_id.as_deref(), Some("hook"));
    }

    struct CrmStub;

    #[async_trait]
    impl IntegrationRegistry for CrmStub {
        async fn run(
            &self,
            service: &str,
            action: &str,
            params: &HashMap<String, Value>,
        ) -> Result<Value> {
            assert_eq!(service, "crm");
            assert_eq!(action, "lookup");
            Ok(json!({ "customer": params.get("email") }))
        }
    }

    fn integration_flow() -> FlowDefinition {
        flow(
            vec![
                node("start", NodeConfig::Start),
                node(
                    "crm",
                    NodeConfig::Integration {
                        service: "crm".into(),
                        action: "lookup".into(),
                        params: HashMap::from([("email".to_string(), json!("{{email}}"))]),
                    },
                ),
                node("done", NodeConfig::End),
                node("failed", NodeConfig::End),
            ],
            vec![
                edge("start", "crm", EdgeLabel::Default),
                edge("crm", "done", EdgeLabel::Default),
                edge("crm", "failed", EdgeLabel::OnError),
            ],
        )
    }

    #[tokio::test]
    async fn integration_node_stores_result_and_advances() {
        let engine = Engine::default().with_integrations(Arc::new(CrmStub));
        let mut s = session();
        s.variables.set(Scope::User, "email", "ada@example.com");
        let outcome = engine
            .execute(&integration_flow(), s, &InboundEvent::Tick)
            .await
            .unwrap();
        assert_eq!(outcome.session.current_node_id.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn unregistered_integration_takes_error_edge() {
        let outcome = Engine::default()
            .execute(&integration_flow(), session(), &InboundEvent::Tick)
            .await
            .unwrap();
        assert_eq!(outcome.session.current_node_id.as_deref(), Some("failed"));
    }

    #[tokio::test]
    async fn form_collects_fields_and_bulk_assigns() {
        let flow = flow(
            vec![
                node("start", NodeConfig::Start),
                node(
                    "form",
                    NodeConfig::Form {
                        fields: vec![
                            FormField {
                                name: "name".into(),
                                prompt: "Your name?".into(),
                                kind: FieldKind::Text,
                                required: true,
                            },
                            FormField {
                                name: "age".into(),
                                prompt: "Your age?".into(),
                                kind: FieldKind::Number,
                                required: true,
                            },
                        ],
                        scope: Scope::User,
                    },
                ),
                node("done", NodeConfig::End),
            ],
            vec![
                edge("start", "form", EdgeLabel::Default),
                edge("form", "done", EdgeLabel::Default),
            ],
        );
        let engine = Engine::default();

        let outcome = engine
            .execute(&flow, session(), &InboundEvent::Message { text: "/start".into() })
            .await
            .unwrap();
        assert_eq!(outcome.status, StepStatus::WaitingForInput);

        let outcome = engine
            .execute(&flow, outcome.session, &InboundEvent::Message { text: "Ada".into() })
            .await
            .unwrap();
        assert_eq!(outcome.status, StepStatus::WaitingForInput);

        // Invalid number re-prompts without advancing the cursor.
        let outcome = engine
            .execute(&flow, outcome.session, &InboundEvent::Message { text: "not a number".into() })
            .await
            .unwrap();
        assert_eq!(outcome.status, StepStatus::WaitingForInput);

        let outcome = engine
            .execute(&flow, outcome.session, &InboundEvent::Message { text: "36".into() })
            .await
            .unwrap();
        assert_eq!(outcome.status, StepStatus::Completed);
        // User scope survives completion (session scope is cleared).
        assert_eq!(outcome.session.variables.resolve("name"), Some(&json!("Ada")));
        assert_eq!(outcome.session.variables.resolve("age"), Some(&json!(36.0)));
    }

    #[tokio::test]
    async fn delay_waits_until_wake_time() {
        let flow = flow(
            vec![
                node("start", NodeConfig::Start),
                node("wait", NodeConfig::Delay { value: 1, unit: crate::flow::DelayUnit::Hours }),
                node("done", NodeConfig::End),
            ],
            vec![
                edge("start", "wait", EdgeLabel::Default),
                edge("wait", "done", EdgeLabel::Default),
            ],
        );
        let engine = Engine::default();

        let outcome = engine
            .execute(&flow, session(), &InboundEvent::Tick)
            .await
            .unwrap();
        assert_eq!(outcome.status, StepStatus::WaitingForInput);
        let wake = outcome.next_wait.expect("delay must report a wake time");
        assert!(wake > Utc::now());

        // Early tick: still waiting.
        let outcome = engine
            .execute(&flow, outcome.session, &InboundEvent::Tick)
            .await
            .unwrap();
        assert_eq!(outcome.status, StepStatus::WaitingForInput);

        // Simulate the scheduler firing after the wake time.
        let mut session = outcome.session;
        if let Some(wait) = session.pending_wait.as_mut() {
            wait.requested_at = Utc::now() - chrono::Duration::hours(2);
        }
        let outcome = engine
            .execute(&flow, session, &InboundEvent::Tick)
            .await
            .unwrap();
        assert_eq!(outcome.status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn variable_node_applies_mutation() {
        let flow = flow(
            vec![
                node("start", NodeConfig::Start),
                node(
                    "inc",
                    NodeConfig::Variable {
                        name: "visits".into(),
                        scope: Scope::User,
                        operation: VariableOp::Increment,
                        value: json!(1),
                    },
                ),
                node("done", NodeConfig::End),
            ],
            vec![
                edge("start", "inc", EdgeLabel::Default),
                edge("inc", "done", EdgeLabel::Default),
            ],
        );
        let outcome = Engine::default()
            .execute(&flow, session(), &InboundEvent::Tick)
            .await
            .unwrap();
        assert_eq!(outcome.session.variables.resolve("visits"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn broadcast_expands_to_one_action_per_recipient() {
        let flow = flow(
            vec![
                node("start", NodeConfig::Start),
                node(
                    "blast",
                    NodeConfig::Broadcast {
                        text: "Sale on now".into(),
                        audience: BroadcastAudience::List {
                            ids: vec!["u1".into(), "u2".into(), "u3".into()],
                        },
                    },
                ),
                node("done", NodeConfig::End),
            ],
            vec![
                edge("start", "blast", EdgeLabel::Default),
                edge("blast", "done", EdgeLabel::Default),
            ],
        );
        let outcome = Engine::default()
            .execute(&flow, session(), &InboundEvent::Tick)
            .await
            .unwrap();
        assert_eq!(outcome.actions.len(), 3);
        assert_eq!(outcome.status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn expired_wait_re_evaluates_instead_of_advancing() {
        let flow = flow(
            vec![
                node("start", NodeConfig::Start),
                node(
                    "k",
                    NodeConfig::Keyboard {
                        text: "pick".into(),
                        buttons: vec![Button { label: "A".into(), data: "a".into() }],
                        variable: None,
                    },
                ),
                node("done", NodeConfig::End),
            ],
            vec![
                edge("start", "k", EdgeLabel::Default),
                edge("k", "done", EdgeLabel::Default),
            ],
        );
        let engine = Engine::default();
        let outcome = engine
            .execute(&flow, session(), &InboundEvent::Tick)
            .await
            .unwrap();

        let mut session = outcome.session;
        if let Some(wait) = session.pending_wait.as_mut() {
            wait.timeout_ms = Some(1);
            wait.requested_at = Utc::now() - chrono::Duration::seconds(10);
        }
        // Message input (not a callback): the expired wait is dropped, the
        // keyboard is re-emitted, and the session stays at the node.
        let outcome = engine
            .execute(&flow, session, &InboundEvent::Message { text: "hello?".into() })
            .await
            .unwrap();
        assert_eq!(outcome.status, StepStatus::WaitingForInput);
        assert_eq!(outcome.session.current_node_id.as_deref(), Some("k"));
        assert_eq!(outcome.actions.len(), 1);
    }
}
