//! HTTP surface (spec §6.1) plus the WebSocket upgrade agents use for their
//! persistent event channel (§6.2). Every response is wrapped in the
//! `{success, data?, error?}` envelope; status codes follow
//! [`CoreError::status_code`].

mod ws;
#[cfg(test)]
mod tests;

use crate::collector::Collector;
use crate::error::{CoreError, Result};
use crate::event_bus::EventBus;
use crate::models::{
    Agent, CommLogEntry, CreateTaskRequest, ExecutionStatus, Fingerprint, SubtaskExecution, SubtaskKind, Task,
};
use crate::rate_limit::RateLimiters;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::validation::TaskValidator;
use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

const SERVICE_NAME: &str = "dispatchd";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct ApiServer {
    host: String,
    port: u16,
    allowed_origins: Vec<String>,
    store: Arc<Store>,
    events: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    collector: Arc<Collector>,
    validator: TaskValidator,
    rate_limiters: RateLimiters,
}

impl ApiServer {
    pub fn new(
        host: String,
        port: u16,
        allowed_origins: Vec<String>,
        store: Arc<Store>,
        events: Arc<EventBus>,
        scheduler: Arc<Scheduler>,
        collector: Arc<Collector>,
    ) -> Self {
        Self {
            host,
            port,
            allowed_origins,
            store,
            events,
            scheduler,
            collector,
            validator: TaskValidator::new(),
            rate_limiters: RateLimiters::new(),
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let app = self.clone().build_router();
        let listener = tokio::net::TcpListener::bind(format!("{}:{}", self.host, self.port))
            .await
            .map_err(|e| CoreError::Fatal(format!("failed to bind {}:{}: {e}", self.host, self.port)))?;
        tracing::info!(host = %self.host, port = self.port, "api server listening");
        axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
            .await
            .map_err(|e| CoreError::Fatal(format!("api server crashed: {e}")))?;
        Ok(())
    }

    fn build_router(self: Arc<Self>) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(
                self.allowed_origins
                    .iter()
                    .filter_map(|o| o.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::PUT,
                axum::http::Method::DELETE,
            ])
            .allow_headers([axum::http::header::CONTENT_TYPE]);

        Router::new()
            .route("/api/health", get(health))
            .route("/api/metrics", get(metrics))
            .route("/api/tasks", get(list_tasks).post(create_task))
            .route(
                "/api/tasks/{id}",
                get(get_task).put(update_task).delete(delete_task),
            )
            .route("/api/tasks/{id}/cancel", post(cancel_task))
            .route(
                "/api/tasks/{id}/subtask-executions",
                get(list_subtask_executions).post(post_subtask_execution_update),
            )
            .route("/api/agents/register", post(register_agent))
            .route("/api/agents/update_config", post(update_agent_config))
            .route("/api/agents/unregister", post(unregister_agent))
            .route("/api/agents/heartbeat", post(heartbeat))
            .route("/api/agents/names", get(list_agent_names))
            .route("/api/agents/validate_name", post(validate_agent_name))
            .route("/api/agents", get(list_agents))
            .route("/api/agents/{name}", get(get_agent).delete(delete_agent))
            .route("/api/agents/{name}/ws", get(ws::upgrade))
            .route("/api/subtasks", get(list_subtask_catalog))
            .route("/api/subtasks/{name}/test", post(test_subtask))
            .route("/api/execute", post(execute))
            .route("/api/result", post(result))
            .route("/api/subtask_result", post(subtask_result))
            .route("/api/logs", get(list_logs))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(self.clone(), rate_limit_middleware))
                    .layer(TraceLayer::new_for_http())
                    .layer(cors),
            )
            .with_state(self)
    }
}

async fn rate_limit_middleware(
    State(app): State<Arc<ApiServer>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if app.rate_limiters.check_request(addr.ip(), &request) {
        next.run(request).await
    } else {
        tracing::debug!(ip = %addr.ip(), path = %request.uri().path(), "rate limit exceeded");
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(Envelope::<()> {
                success: false,
                data: None,
                error: Some("rate limit exceeded".to_string()),
            }),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------

#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
    })
}

fn ok_created<T: Serialize>(data: T) -> (StatusCode, Json<Envelope<T>>) {
    (StatusCode::CREATED, ok(data))
}

fn ok_empty() -> Json<Envelope<()>> {
    Json(Envelope {
        success: true,
        data: None,
        error: None,
    })
}

struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        let body = Json(Envelope::<()> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
        });
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------
// Health / metrics
// ---------------------------------------------------------------

async fn health(State(app): State<Arc<ApiServer>>) -> ApiResult<Json<Envelope<serde_json::Value>>> {
    app.store.list_tasks()?;
    let tick_age_secs = app.scheduler.last_tick_age_secs();
    let status = if tick_age_secs > 2 * app.scheduler.tick_interval_secs() as i64 {
        "degraded"
    } else {
        "ok"
    };
    Ok(ok(serde_json::json!({
        "status": status,
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "scheduler_tick_age_secs": tick_age_secs,
    })))
}

#[derive(Debug, Serialize)]
struct MetricsSnapshot {
    queue_depth: usize,
    agents_free: usize,
    agents_busy: usize,
    agents_offline: usize,
    tasks_completed: usize,
    tasks_failed: usize,
}

async fn metrics(State(app): State<Arc<ApiServer>>) -> ApiResult<Json<Envelope<MetricsSnapshot>>> {
    let tasks = app.store.list_tasks()?;
    let queue_depth = tasks
        .iter()
        .filter(|t| t.status == crate::models::TaskStatus::Pending)
        .count();
    let tasks_completed = tasks
        .iter()
        .filter(|t| t.status == crate::models::TaskStatus::Completed)
        .count();
    let tasks_failed = tasks
        .iter()
        .filter(|t| t.status == crate::models::TaskStatus::Failed)
        .count();

    let now = chrono::Utc::now();
    let (mut free, mut busy, mut offline) = (0, 0, 0);
    for agent in app.store.list_agents()? {
        let timeout = 90; // presence timeout is a controller-level setting the monitoring snapshot does not need precisely
        match crate::presence::derive(&agent, now, timeout) {
            crate::models::Presence::Free => free += 1,
            crate::models::Presence::Busy => busy += 1,
            crate::models::Presence::Offline => offline += 1,
        }
    }

    Ok(ok(MetricsSnapshot {
        queue_depth,
        agents_free: free,
        agents_busy: busy,
        agents_offline: offline,
        tasks_completed,
        tasks_failed,
    }))
}

// ---------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------

async fn list_tasks(State(app): State<Arc<ApiServer>>) -> ApiResult<Json<Envelope<Vec<Task>>>> {
    Ok(ok(app.store.list_tasks()?))
}

async fn create_task(
    State(app): State<Arc<ApiServer>>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<Envelope<serde_json::Value>>)> {
    app.validator.validate_create(&req)?;
    let id = app.store.create_task(req)?;
    Ok(ok_created(serde_json::json!({ "id": id })))
}

async fn get_task(State(app): State<Arc<ApiServer>>, Path(id): Path<i64>) -> ApiResult<Json<Envelope<Task>>> {
    let task = app
        .store
        .get_task(id)?
        .ok_or_else(|| CoreError::NotFound(format!("task {id}")))?;
    Ok(ok(task))
}

#[derive(Debug, Deserialize)]
struct UpdateTaskRequest {
    status: Option<crate::models::TaskStatus>,
    result: Option<String>,
    error: Option<String>,
}

async fn update_task(
    State(app): State<Arc<ApiServer>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateTaskRequest>,
) -> ApiResult<Json<Envelope<()>>> {
    if let Some(status) = req.status {
        app.store
            .update_task_status(id, status, chrono::Utc::now(), req.result, req.error)?;
    }
    Ok(ok_empty())
}

async fn delete_task(State(app): State<Arc<ApiServer>>, Path(id): Path<i64>) -> ApiResult<Json<Envelope<()>>> {
    app.store.delete_task(id)?;
    Ok(ok_empty())
}

async fn cancel_task(State(app): State<Arc<ApiServer>>, Path(id): Path<i64>) -> ApiResult<Json<Envelope<()>>> {
    app.scheduler.cancel_task(id)?;
    Ok(ok_empty())
}

#[derive(Debug, Deserialize)]
struct SubtaskExecutionsQuery {
    agent: Option<String>,
}

async fn list_subtask_executions(
    State(app): State<Arc<ApiServer>>,
    Path(id): Path<i64>,
    Query(q): Query<SubtaskExecutionsQuery>,
) -> ApiResult<Json<Envelope<Vec<SubtaskExecution>>>> {
    let rows = app.store.get_executions_for(id, None, q.agent.as_deref())?;
    Ok(ok(rows))
}

/// Body for `POST /api/tasks/{id}/subtask-executions` — an agent pushing a
/// status/result update through the plain HTTP path rather than the
/// WebSocket channel (spec §6.1).
#[derive(Debug, Deserialize)]
struct SubtaskExecutionUpdate {
    subtask_name: String,
    agent: String,
    status: ExecutionStatus,
    result: Option<serde_json::Value>,
    error: Option<String>,
    elapsed: Option<f64>,
}

async fn post_subtask_execution_update(
    State(app): State<Arc<ApiServer>>,
    Path(id): Path<i64>,
    Json(req): Json<SubtaskExecutionUpdate>,
) -> ApiResult<Json<Envelope<()>>> {
    app.collector
        .subtask_result(id, &req.subtask_name, &req.agent, req.status, req.result, req.error, req.elapsed)
        .await?;
    Ok(ok_empty())
}

// ---------------------------------------------------------------
// Agents
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegisterAgentRequest {
    name: String,
    address: String,
    #[serde(default)]
    capabilities: HashSet<String>,
    #[serde(default)]
    fingerprint: Fingerprint,
}

async fn register_agent(
    State(app): State<Arc<ApiServer>>,
    Json(req): Json<RegisterAgentRequest>,
) -> ApiResult<Json<Envelope<Agent>>> {
    app.store
        .register_agent(&req.name, &req.address, &req.capabilities, &req.fingerprint)?;
    let agent = app
        .store
        .get_agent(&req.name)?
        .ok_or_else(|| CoreError::NotFound(format!("agent {}", req.name)))?;
    Ok(ok(agent))
}

#[derive(Debug, Deserialize)]
struct UpdateAgentConfigRequest {
    name: String,
    fingerprint: Fingerprint,
}

async fn update_agent_config(
    State(app): State<Arc<ApiServer>>,
    Json(req): Json<UpdateAgentConfigRequest>,
) -> ApiResult<Json<Envelope<()>>> {
    app.store.update_agent_config(&req.name, &req.fingerprint)?;
    Ok(ok_empty())
}

#[derive(Debug, Deserialize)]
struct UnregisterAgentRequest {
    name: String,
}

async fn unregister_agent(
    State(app): State<Arc<ApiServer>>,
    Json(req): Json<UnregisterAgentRequest>,
) -> ApiResult<Json<Envelope<()>>> {
    app.store.delete_agent(&req.name)?;
    app.events.leave_room(&req.name);
    Ok(ok_empty())
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    fingerprint: Option<Fingerprint>,
}

async fn heartbeat(State(app): State<Arc<ApiServer>>, Json(req): Json<HeartbeatRequest>) -> ApiResult<StatusCode> {
    app.store.touch_heartbeat(&req.name, req.status.as_deref())?;
    if let Some(fp) = req.fingerprint {
        app.store.update_agent_config(&req.name, &fp)?;
    }
    Ok(StatusCode::OK)
}

async fn list_agents(State(app): State<Arc<ApiServer>>) -> ApiResult<Json<Envelope<Vec<Agent>>>> {
    Ok(ok(app.store.list_agents()?))
}

async fn get_agent(
    State(app): State<Arc<ApiServer>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Envelope<Agent>>> {
    let agent = app
        .store
        .get_agent(&name)?
        .ok_or_else(|| CoreError::NotFound(format!("agent {name}")))?;
    Ok(ok(agent))
}

async fn delete_agent(
    State(app): State<Arc<ApiServer>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Envelope<()>>> {
    app.store.delete_agent(&name)?;
    app.events.leave_room(&name);
    Ok(ok_empty())
}

#[derive(Debug, Deserialize)]
struct AgentNamesQuery {
    online: Option<bool>,
}

async fn list_agent_names(
    State(app): State<Arc<ApiServer>>,
    Query(q): Query<AgentNamesQuery>,
) -> ApiResult<Json<Envelope<Vec<String>>>> {
    let agents = app.store.list_agents()?;
    let names = if q.online.unwrap_or(false) {
        agents
            .into_iter()
            .filter(|a| app.events.is_connected(&a.name))
            .map(|a| a.name)
            .collect()
    } else {
        agents.into_iter().map(|a| a.name).collect()
    };
    Ok(ok(names))
}

#[derive(Debug, Deserialize)]
struct ValidateAgentNameRequest {
    name: String,
}

async fn validate_agent_name(
    State(app): State<Arc<ApiServer>>,
    Json(req): Json<ValidateAgentNameRequest>,
) -> ApiResult<Json<Envelope<serde_json::Value>>> {
    let taken = app.store.get_agent(&req.name)?.is_some();
    Ok(ok(serde_json::json!({ "available": !taken })))
}

// ---------------------------------------------------------------
// Subtask catalog
// ---------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SubtaskCatalogEntry {
    name: &'static str,
    description: &'static str,
}

async fn list_subtask_catalog() -> Json<Envelope<Vec<SubtaskCatalogEntry>>> {
    let catalog = SubtaskKind::ALL
        .into_iter()
        .map(|k| SubtaskCatalogEntry {
            name: k.as_str(),
            description: k.description(),
        })
        .collect();
    ok(catalog)
}

async fn test_subtask(Path(name): Path<String>) -> ApiResult<Json<Envelope<serde_json::Value>>> {
    let kind = SubtaskKind::parse(&name).ok_or_else(|| CoreError::NotFound(format!("subtask kind {name}")))?;
    let result = match kind {
        SubtaskKind::GetHostname => serde_json::json!({ "hostname": hostname_fallback() }),
        SubtaskKind::GetSystemInfo => serde_json::json!({ "note": "fingerprint sampling runs on the agent, not the controller" }),
        SubtaskKind::Ping => serde_json::json!({ "pong": true }),
    };
    Ok(ok(result))
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

// ---------------------------------------------------------------
// Results ingestion
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    task_id: i64,
    subtask_name: String,
    agent: String,
}

async fn execute(State(app): State<Arc<ApiServer>>, Json(req): Json<ExecuteRequest>) -> ApiResult<Json<Envelope<()>>> {
    app.collector.subtask_started(req.task_id, &req.subtask_name, &req.agent)?;
    Ok(ok_empty())
}

#[derive(Debug, Deserialize)]
struct ResultRequest {
    task_id: i64,
    agent: String,
    subtasks: Vec<SubtaskResultEntry>,
}

#[derive(Debug, Deserialize)]
struct SubtaskResultEntry {
    subtask_name: String,
    status: ExecutionStatus,
    result: Option<serde_json::Value>,
    error: Option<String>,
    elapsed: Option<f64>,
}

/// Final aggregate from an agent covering every subtask it ran for a task
/// (spec §6.1 `/api/result`); reduces to one `subtask_result` call per entry.
async fn result(State(app): State<Arc<ApiServer>>, Json(req): Json<ResultRequest>) -> ApiResult<Json<Envelope<()>>> {
    for entry in req.subtasks {
        app.collector
            .subtask_result(req.task_id, &entry.subtask_name, &req.agent, entry.status, entry.result, entry.error, entry.elapsed)
            .await?;
    }
    Ok(ok_empty())
}

#[derive(Debug, Deserialize)]
struct SubtaskResultRequest {
    task_id: i64,
    subtask_name: String,
    agent: String,
    status: ExecutionStatus,
    result: Option<serde_json::Value>,
    error: Option<String>,
    elapsed: Option<f64>,
}

async fn subtask_result(
    State(app): State<Arc<ApiServer>>,
    Json(req): Json<SubtaskResultRequest>,
) -> ApiResult<Json<Envelope<()>>> {
    app.collector
        .subtask_result(req.task_id, &req.subtask_name, &req.agent, req.status, req.result, req.error, req.elapsed)
        .await?;
    Ok(ok_empty())
}

// ---------------------------------------------------------------
// Logs
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LogsQuery {
    agent_address: Option<String>,
    limit: Option<usize>,
}

async fn list_logs(
    State(app): State<Arc<ApiServer>>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<Json<Envelope<Vec<CommLogEntry>>>> {
    let limit = q.limit.unwrap_or(crate::constants::DEFAULT_LOG_LIMIT);
    let entries = app.store.list_logs(q.agent_address.as_deref(), limit)?;
    Ok(ok(entries))
}
