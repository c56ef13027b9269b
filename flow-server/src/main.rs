use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use flow_engine::{
    Action, EndpointBridge, Engine, FlowDefinition, FlowError, GroupService, InMemoryCache,
    InMemoryDurable, InMemoryFlows, InboundEvent, ListOnlyRecipients, PostgresDurable, Session,
    SessionStore, StepRunner, StepStatus, storage::DurableTier,
};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    runner: Arc<StepRunner>,
    bridge: Arc<EndpointBridge>,
    store: Arc<SessionStore>,
    flows: Arc<InMemoryFlows>,
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    bot_id: String,
    participant_id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    callback_data: Option<String>,
}

#[derive(Debug, Serialize)]
struct ExecuteResponse {
    session_key: String,
    status: String,
    actions: Vec<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_wait: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct IngestBody {
    #[serde(default)]
    access_key: Option<String>,
    #[serde(flatten)]
    payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    success: bool,
    message: String,
    data_keys: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flow_server=debug,flow_engine=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cache = Arc::new(InMemoryCache::new());
    let durable: Arc<dyn DurableTier> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = PgPoolOptions::new().max_connections(8).connect(&url).await?;
            let pg = PostgresDurable::new(pool);
            pg.ensure_schema().await?;
            info!("durable tier: postgres");
            Arc::new(pg)
        }
        Err(_) => {
            warn!("DATABASE_URL not set, using in-memory durable tier");
            Arc::new(InMemoryDurable::new())
        }
    };

    let store = Arc::new(SessionStore::new(cache.clone(), durable.clone()));
    let groups = Arc::new(GroupService::new(cache, durable));
    let flows = Arc::new(InMemoryFlows::new());
    flows.publish(demo_flow()).expect("demo flow must validate");

    let engine = Arc::new(Engine::with_http_client(Arc::new(ListOnlyRecipients)));
    let runner = Arc::new(
        StepRunner::new(engine, store.clone(), flows.clone()).with_groups(groups.clone()),
    );
    let bridge = Arc::new(EndpointBridge::new(runner.clone(), flows.clone()));

    // Periodic sweeps: expire stale durable sessions (1 year horizon) and
    // archive inactive groups (7 day horizon).
    {
        let store = store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60 * 60));
            loop {
                interval.tick().await;
                let horizon = Utc::now() - chrono::Duration::days(365);
                match store.sweep_expired(horizon).await {
                    Ok(n) if n > 0 => info!(expired = n, "session retention sweep"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "session retention sweep failed"),
                }
                let horizon = Utc::now() - chrono::Duration::days(7);
                if let Err(e) = groups.sweep_inactive(horizon).await {
                    warn!(error = %e, "group inactivity sweep failed");
                }
            }
        });
    }

    let app_state = AppState { runner, bridge, store, flows };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/execute", post(execute_event))
        .route("/flows", post(publish_flow))
        .route("/endpoint/{bot_id}/{node_id}", post(ingest_endpoint))
        .route("/session/{bot_id}/{participant_id}", get(get_session))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("server running on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

/// Map engine errors to acknowledgement-level failures: the client must be
/// able to distinguish "retry later" from "bad request", never a silent
/// drop.
fn error_status(err: &FlowError) -> StatusCode {
    match err {
        FlowError::FlowNotFound(_) | FlowError::NodeNotFound(_) | FlowError::SessionNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        FlowError::GroupNotFound(_) => StatusCode::NOT_FOUND,
        FlowError::Validation(_) | FlowError::Serialization(_) => StatusCode::UNPROCESSABLE_ENTITY,
        FlowError::Capacity(_) => StatusCode::CONFLICT,
        FlowError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        FlowError::Webhook { .. } => StatusCode::BAD_GATEWAY,
        FlowError::Concurrency(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn execute_event(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, StatusCode> {
    let event = match (&request.callback_data, &request.text) {
        (Some(data), _) => InboundEvent::Callback { data: data.clone() },
        (None, Some(text)) => InboundEvent::Message { text: text.clone() },
        (None, None) => InboundEvent::Tick,
    };

    let outcome = state
        .runner
        .process_event(&request.bot_id, &request.participant_id, event)
        .await
        .map_err(|e| {
            error!(bot_id = %request.bot_id, error = %e, "event processing failed");
            error_status(&e)
        })?;

    Ok(Json(ExecuteResponse {
        session_key: outcome.session.session_key.clone(),
        status: match outcome.status {
            StepStatus::WaitingForInput => "waiting_for_input".to_string(),
            StepStatus::Completed => "completed".to_string(),
            StepStatus::Halted => "halted".to_string(),
        },
        actions: outcome.actions,
        next_wait: outcome.next_wait,
    }))
}

async fn publish_flow(
    State(state): State<AppState>,
    Json(flow): Json<FlowDefinition>,
) -> Result<StatusCode, (StatusCode, String)> {
    let flow_id = flow.id.clone();
    state
        .flows
        .publish(flow)
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    info!(flow_id = %flow_id, "flow published");
    Ok(StatusCode::CREATED)
}

async fn ingest_endpoint(
    State(state): State<AppState>,
    Path((bot_id, node_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<IngestBody>,
) -> Result<(StatusCode, Json<IngestResponse>), StatusCode> {
    let access_key = headers
        .get("x-access-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(body.access_key)
        .unwrap_or_default();

    let outcome = state
        .bridge
        .ingest(&bot_id, &node_id, &access_key, serde_json::Value::Object(body.payload))
        .await
        .map_err(|e| {
            error!(bot_id = %bot_id, node_id = %node_id, error = %e, "endpoint ingestion failed");
            error_status(&e)
        })?;

    // The response never echoes the access key and never waits on
    // resumption side effects.
    if outcome.accepted {
        Ok((
            StatusCode::OK,
            Json(IngestResponse {
                success: true,
                message: if outcome.resumption_requested {
                    "payload accepted, resumption requested".to_string()
                } else {
                    "payload accepted".to_string()
                },
                data_keys: outcome.data_keys,
            }),
        ))
    } else {
        Ok((
            StatusCode::FORBIDDEN,
            Json(IngestResponse {
                success: false,
                message: "access key rejected".to_string(),
                data_keys: Vec::new(),
            }),
        ))
    }
}

async fn get_session(
    State(state): State<AppState>,
    Path((bot_id, participant_id)): Path<(String, String)>,
) -> Result<Json<Session>, StatusCode> {
    match state.store.get_session(&bot_id, &participant_id).await {
        Ok(Some(session)) => Ok(Json(session)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(bot_id = %bot_id, participant_id = %participant_id, error = %e, "session lookup failed");
            Err(error_status(&e))
        }
    }
}

fn demo_flow() -> FlowDefinition {
    FlowDefinition::from_json(
        r#"{
            "id": "welcome-v1",
            "bot_id": "demo-bot",
            "status": "active",
            "nodes": [
                { "id": "start", "type": "start" },
                { "id": "greet", "type": "message", "text": "Welcome! Pick an option." },
                { "id": "menu", "type": "keyboard", "text": "What would you like?",
                  "variable": "choice",
                  "buttons": [
                      { "label": "Catalog", "data": "catalog" },
                      { "label": "Support", "data": "support" }
                  ] },
                { "id": "route", "type": "condition",
                  "field": "choice", "operator": "equals", "value": "catalog" },
                { "id": "catalog", "type": "message", "text": "Here is our catalog." },
                { "id": "support", "type": "message", "text": "A human will reach out." },
                { "id": "done", "type": "end" }
            ],
            "edges": [
                { "from": "start", "to": "greet" },
                { "from": "greet", "to": "menu" },
                { "from": "menu", "to": "route" },
                { "from": "route", "to": "catalog", "label": "on_true" },
                { "from": "route", "to": "support", "label": "on_false" },
                { "from": "catalog", "to": "done" },
                { "from": "support", "to": "done" }
            ]
        }"#,
    )
    .expect("demo flow must parse")
}
