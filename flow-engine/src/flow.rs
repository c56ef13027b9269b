use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FlowError, Result};
use crate::variables::{Scope, VariableOp};

/// Publication state of a flow definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    #[default]
    Draft,
    Active,
    Archived,
}

/// Immutable, versioned dialogue graph authored for a bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    pub bot_id: String,
    #[serde(default)]
    pub status: FlowStatus,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// A typed step in a flow. The node type and its configuration travel
/// together in `config`, so dispatch in the engine is exhaustive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub config: NodeConfig,
}

/// Per-node typed configuration, one variant per node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeConfig {
    Start,
    #[serde(alias = "new_message")]
    Message {
        text: String,
        #[serde(default)]
        attachments: Vec<MediaRef>,
    },
    Keyboard {
        text: String,
        buttons: Vec<Button>,
        /// Session variable that receives the pressed button's data.
        #[serde(default)]
        variable: Option<String>,
    },
    Condition {
        field: String,
        operator: ConditionOperator,
        #[serde(default)]
        value: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    #[serde(alias = "api")]
    Webhook {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<Value>,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
        #[serde(default = "default_retry_count")]
        retry_count: u32,
    },
    Form {
        fields: Vec<FormField>,
        #[serde(default)]
        scope: Scope,
    },
    Delay {
        value: u64,
        unit: DelayUnit,
    },
    Variable {
        name: String,
        #[serde(default)]
        scope: Scope,
        operation: VariableOp,
        #[serde(default)]
        value: Value,
    },
    File {
        url: String,
        #[serde(default)]
        caption: Option<String>,
    },
    Random {
        options: Vec<RandomOption>,
        #[serde(default)]
        variable: Option<String>,
    },
    Integration {
        service: String,
        action: String,
        #[serde(default)]
        params: HashMap<String, Value>,
    },
    Endpoint {
        access_key: String,
        #[serde(default)]
        description: Option<String>,
    },
    Broadcast {
        text: String,
        audience: BroadcastAudience,
    },
    End,
}

impl NodeConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeConfig::Start => "start",
            NodeConfig::Message { .. } => "message",
            NodeConfig::Keyboard { .. } => "keyboard",
            NodeConfig::Condition { .. } => "condition",
            NodeConfig::Webhook { .. } => "webhook",
            NodeConfig::Form { .. } => "form",
            NodeConfig::Delay { .. } => "delay",
            NodeConfig::Variable { .. } => "variable",
            NodeConfig::File { .. } => "file",
            NodeConfig::Random { .. } => "random",
            NodeConfig::Integration { .. } => "integration",
            NodeConfig::Endpoint { .. } => "endpoint",
            NodeConfig::Broadcast { .. } => "broadcast",
            NodeConfig::End => "end",
        }
    }
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_retry_count() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    #[serde(default)]
    pub media_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Exists,
    NotExists,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,
    GreaterThan,
    LessThan,
    IsEmpty,
    IsNotEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl DelayUnit {
    pub fn to_duration(self, value: u64) -> chrono::Duration {
        match self {
            DelayUnit::Seconds => chrono::Duration::seconds(value as i64),
            DelayUnit::Minutes => chrono::Duration::minutes(value as i64),
            DelayUnit::Hours => chrono::Duration::hours(value as i64),
            DelayUnit::Days => chrono::Duration::days(value as i64),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Text,
    Number,
    Email,
    Phone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomOption {
    pub value: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BroadcastAudience {
    All,
    List { ids: Vec<String> },
    ActiveSince { days: u32 },
}

/// Edge between nodes. Routing outcomes are carried on the edge label,
/// never inferred from node ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub label: EdgeLabel,
}

/// Edge tag selecting which outcome of the source node the edge serves.
/// `Value` carries a keyboard button's callback data or a random option's
/// chosen value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeLabel {
    #[default]
    Default,
    OnTrue,
    OnFalse,
    OnError,
    Value(String),
}

/// Result of validating a flow definition. Errors make the flow
/// unexecutable; warnings (unreachable nodes) do not.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl FlowDefinition {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| FlowError::Validation(e.to_string()))
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Result<&Node> {
        self.nodes
            .iter()
            .find(|n| matches!(n.config, NodeConfig::Start))
            .ok_or_else(|| FlowError::Validation(format!("flow {} has no start node", self.id)))
    }

    pub fn outgoing(&self, node_id: &str) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == node_id)
    }

    /// Target of the edge with the given label, if present.
    pub fn edge_target(&self, node_id: &str, label: &EdgeLabel) -> Option<&str> {
        self.outgoing(node_id)
            .find(|e| e.label == *label)
            .map(|e| e.to.as_str())
    }

    /// Target of the `Default`-labeled edge, falling back to the single
    /// outgoing edge when only one exists.
    pub fn default_target(&self, node_id: &str) -> Option<&str> {
        if let Some(to) = self.edge_target(node_id, &EdgeLabel::Default) {
            return Some(to);
        }
        let mut out = self.outgoing(node_id);
        match (out.next(), out.next()) {
            (Some(edge), None) => Some(edge.to.as_str()),
            _ => None,
        }
    }

    /// Structural validation: exactly one start node, unique node ids,
    /// edges pointing at real nodes, terminal end nodes. Unreachable
    /// nodes are warnings only; execution simply never visits them.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                report.errors.push(format!("duplicate node id: {}", node.id));
            }
        }

        let starts: Vec<_> = self
            .nodes
            .iter()
            .filter(|n| matches!(n.config, NodeConfig::Start))
            .collect();
        if starts.len() != 1 {
            report
                .errors
                .push(format!("flow must have exactly one start node, found {}", starts.len()));
        }

        for edge in &self.edges {
            if self.node(&edge.from).is_none() {
                report.errors.push(format!("edge from unknown node: {}", edge.from));
            }
            if self.node(&edge.to).is_none() {
                report.errors.push(format!("edge to unknown node: {}", edge.to));
            }
        }

        for node in &self.nodes {
            if matches!(node.config, NodeConfig::End) && self.outgoing(&node.id).next().is_some() {
                report
                    .errors
                    .push(format!("end node {} has outgoing edges", node.id));
            }
        }

        if let Some(start) = starts.first() {
            let mut reachable = HashSet::new();
            let mut queue = VecDeque::from([start.id.as_str()]);
            while let Some(id) = queue.pop_front() {
                if reachable.insert(id) {
                    for edge in self.outgoing(id) {
                        queue.push_back(edge.to.as_str());
                    }
                }
            }
            for node in &self.nodes {
                if !reachable.contains(node.id.as_str()) {
                    report
                        .warnings
                        .push(format!("node {} is unreachable from start", node.id));
                }
            }
        }

        report
    }
}
