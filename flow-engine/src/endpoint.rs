use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::error::{FlowError, Result};
use crate::flow::NodeConfig;
use crate::runner::{FlowSource, StepRunner};

/// Outcome of an endpoint ingestion. `resumption_requested` reports that a
/// detached resumption was fired, not that it succeeded; the resumption
/// outcome is reported via logs only.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub accepted: bool,
    pub resumption_requested: bool,
    pub data_keys: Vec<String>,
}

impl IngestOutcome {
    fn rejected() -> Self {
        Self {
            accepted: false,
            resumption_requested: false,
            data_keys: Vec::new(),
        }
    }
}

/// Narrow adapter letting an external HTTP call inject data into a running
/// session and resume execution at an endpoint node.
///
/// Payloads without a participant id land in a bot-scoped store owned by
/// this instance (passed by reference where needed, never a process-wide
/// singleton).
pub struct EndpointBridge {
    runner: Arc<StepRunner>,
    flows: Arc<dyn FlowSource>,
    bot_data: DashMap<(String, String), Map<String, Value>>,
}

impl EndpointBridge {
    pub fn new(runner: Arc<StepRunner>, flows: Arc<dyn FlowSource>) -> Self {
        Self {
            runner,
            flows,
            bot_data: DashMap::new(),
        }
    }

    /// Validate the access key and either fire a detached resumption (when
    /// the payload names a participant) or store the payload bot-wide.
    /// Never blocks on the engine's outbound side effects.
    pub async fn ingest(
        &self,
        bot_id: &str,
        node_id: &str,
        access_key: &str,
        payload: Value,
    ) -> Result<IngestOutcome> {
        let flow = self
            .flows
            .active_flow(bot_id)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound(format!("no active flow for bot {bot_id}")))?;
        let node = flow
            .node(node_id)
            .ok_or_else(|| FlowError::NodeNotFound(node_id.to_string()))?;
        let NodeConfig::Endpoint { access_key: expected, .. } = &node.config else {
            return Err(FlowError::Validation(format!(
                "node {node_id} is not an endpoint node"
            )));
        };

        if access_key != expected {
            // Rejected before anything is merged or logged as session data.
            warn!(bot_id, node_id, "endpoint ingest rejected: access key mismatch");
            return Ok(IngestOutcome::rejected());
        }

        let fields = payload.as_object().cloned().unwrap_or_default();
        let data_keys: Vec<String> = fields.keys().cloned().collect();

        let participant_id = fields
            .get("participant_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        match participant_id {
            Some(participant_id) => {
                let runner = self.runner.clone();
                let bot_id = bot_id.to_string();
                let node_id = node_id.to_string();
                tokio::spawn(async move {
                    match runner
                        .resume_endpoint(&bot_id, &participant_id, &node_id, fields)
                        .await
                    {
                        Ok(Some(_)) => {
                            info!(bot_id = %bot_id, participant_id = %participant_id, node_id = %node_id, "endpoint resumption executed")
                        }
                        Ok(None) => {
                            info!(bot_id = %bot_id, participant_id = %participant_id, node_id = %node_id, "endpoint payload merged without resumption")
                        }
                        Err(e) => {
                            error!(bot_id = %bot_id, participant_id = %participant_id, node_id = %node_id, error = %e, "endpoint resumption failed")
                        }
                    }
                });
                Ok(IngestOutcome {
                    accepted: true,
                    resumption_requested: true,
                    data_keys,
                })
            }
            None => {
                self.bot_data
                    .entry((bot_id.to_string(), node_id.to_string()))
                    .or_default()
                    .extend(fields);
                info!(bot_id, node_id, "endpoint payload stored bot-wide");
                Ok(IngestOutcome {
                    accepted: true,
                    resumption_requested: false,
                    data_keys,
                })
            }
        }
    }

    /// Bot-wide payload previously stored by a non-participant ingestion.
    pub fn stored_payload(&self, bot_id: &str, node_id: &str) -> Option<Map<String, Value>> {
        self.bot_data
            .get(&(bot_id.to_string(), node_id.to_string()))
            .map(|m| m.clone())
    }
}
