//! Operator HTTP surface. Loopback only, unauthenticated.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use esc_core::{BreakerSnapshot, DeliveryCounters, DeliveryStatus, RollupGranularity};
use esc_relay::{DeliveryWorker, EventBus};
use esc_storage::{CancelOutcome, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_DELIVERY_LIMIT: usize = 50;
const DEFAULT_ROLLUP_LIMIT: usize = 48;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AdminState {
    pub worker: Arc<DeliveryWorker>,
    pub bus: EventBus,
    pub webhook_configured: bool,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(status))
        .route("/breaker/reset", post(reset_breaker))
        .route("/passes", post(run_pass))
        .route("/events", post(emit_event))
        .route("/deliveries", get(list_deliveries))
        .route("/deliveries/:id/cancel", post(cancel_delivery))
        .route("/metrics/rollups", get(list_rollups))
        .with_state(state)
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        warn!(event = "admin_storage_error", error = %err);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct StatusBody {
    breaker: BreakerSnapshot,
    counters: DeliveryCounters,
    pending: u64,
    failed: u64,
    pass_running: bool,
    webhook_configured: bool,
}

async fn status(State(state): State<AdminState>) -> Result<Json<StatusBody>, ApiError> {
    let backlog = state.worker.store().delivery_backlog()?;
    Ok(Json(StatusBody {
        breaker: state.worker.breaker_snapshot(Utc::now()),
        counters: state.worker.counters(),
        pending: backlog.pending,
        failed: backlog.failed,
        pass_running: state.worker.is_running(),
        webhook_configured: state.webhook_configured,
    }))
}

async fn reset_breaker(State(state): State<AdminState>) -> Json<BreakerSnapshot> {
    info!(event = "admin_breaker_reset");
    Json(state.worker.reset_breaker(Utc::now()))
}

async fn run_pass(State(state): State<AdminState>) -> Response {
    match state.worker.try_run_pass(Utc::now()).await {
        None => ApiError::new(StatusCode::CONFLICT, "a delivery pass is already running")
            .into_response(),
        Some(Ok(report)) => Json(report).into_response(),
        Some(Err(err)) => {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmitRequest {
    event_name: String,
    #[serde(default)]
    payload: Value,
}

async fn emit_event(
    State(state): State<AdminState>,
    Json(request): Json<EmitRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let event_name = request.event_name.trim().to_string();
    if event_name.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "eventName is required"));
    }
    state.bus.emit(event_name.clone(), request.payload);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": true, "eventName": event_name })),
    ))
}

#[derive(Debug, Deserialize)]
struct DeliveryQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_deliveries(
    State(state): State<AdminState>,
    Query(query): Query<DeliveryQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<DeliveryStatus>()
                .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err.to_string()))?,
        ),
    };
    let limit = clamp_limit(query.limit, DEFAULT_DELIVERY_LIMIT);
    let deliveries = state.worker.store().recent_deliveries(status, limit)?;
    Ok(Json(json!({ "deliveries": deliveries })))
}

async fn cancel_delivery(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.worker.store().cancel_delivery(&id)? {
        CancelOutcome::Canceled(delivery) => {
            info!(event = "admin_delivery_canceled", delivery_id = %delivery.id);
            Ok(Json(json!({ "delivery": delivery })))
        }
        CancelOutcome::AlreadyTerminal(status) => Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("delivery is already {status}"),
        )),
        CancelOutcome::NotFound => Err(ApiError::new(StatusCode::NOT_FOUND, "delivery not found")),
    }
}

#[derive(Debug, Deserialize)]
struct RollupQuery {
    granularity: Option<String>,
    limit: Option<usize>,
}

async fn list_rollups(
    State(state): State<AdminState>,
    Query(query): Query<RollupQuery>,
) -> Result<Json<Value>, ApiError> {
    let granularity = match query.granularity.as_deref() {
        None => RollupGranularity::Hourly,
        Some(raw) => raw
            .parse::<RollupGranularity>()
            .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err))?,
    };
    let limit = clamp_limit(query.limit, DEFAULT_ROLLUP_LIMIT);
    let rollups = state.worker.store().rollups(granularity, limit)?;
    Ok(Json(json!({ "granularity": granularity, "rollups": rollups })))
}

fn clamp_limit(requested: Option<usize>, default: usize) -> usize {
    requested.unwrap_or(default).clamp(1, MAX_LIST_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use esc_core::{RedactionPolicy, ESCALATION_EVENT_NAME};
    use esc_relay::{DispatchOutcome, Dispatcher, EscalationIntake, RelayConfig};
    use esc_storage::EscalationStore;

    struct Refusing;

    #[async_trait]
    impl Dispatcher for Refusing {
        async fn dispatch(&self, _payload: &Value) -> DispatchOutcome {
            DispatchOutcome::Failed("webhook status 503".to_string())
        }
    }

    async fn spawn_admin() -> (String, esc_relay::Subscription) {
        let store = Arc::new(EscalationStore::open_in_memory().expect("open db"));
        let bus = EventBus::new();
        let (_intake, subscription) =
            EscalationIntake::subscribe(&bus, store.clone(), RedactionPolicy::default(), "test");
        let mut config = RelayConfig::default();
        config.breaker.failure_threshold = 1;
        let worker = Arc::new(DeliveryWorker::new(store, Arc::new(Refusing), &config));
        let app = router(AdminState {
            worker,
            bus,
            webhook_configured: false,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), subscription)
    }

    #[tokio::test]
    async fn operator_flow_over_http() {
        let (base, _subscription) = spawn_admin().await;
        let client = reqwest::Client::new();

        let health = client
            .get(format!("{base}/health"))
            .send()
            .await
            .expect("health");
        assert_eq!(health.text().await.expect("body"), "ok");

        let emitted = client
            .post(format!("{base}/events"))
            .json(&json!({
                "eventName": ESCALATION_EVENT_NAME,
                "payload": { "correlationId": "corr-http", "severity": "critical" }
            }))
            .send()
            .await
            .expect("emit");
        assert_eq!(emitted.status(), reqwest::StatusCode::ACCEPTED);

        let pass: Value = client
            .post(format!("{base}/passes"))
            .send()
            .await
            .expect("pass")
            .json()
            .await
            .expect("pass body");
        assert_eq!(pass["failed"], json!(1));

        let status: Value = client
            .get(format!("{base}/status"))
            .send()
            .await
            .expect("status")
            .json()
            .await
            .expect("status body");
        assert_eq!(status["breaker"]["state"], json!("open"));
        assert_eq!(status["failed"], json!(1));

        let reset: Value = client
            .post(format!("{base}/breaker/reset"))
            .send()
            .await
            .expect("reset")
            .json()
            .await
            .expect("reset body");
        assert_eq!(reset["state"], json!("closed"));

        let failed: Value = client
            .get(format!("{base}/deliveries?status=failed"))
            .send()
            .await
            .expect("list")
            .json()
            .await
            .expect("list body");
        let delivery = &failed["deliveries"][0];
        assert_eq!(delivery["last_error"], json!("webhook status 503"));
        let id = delivery["id"].as_str().expect("id").to_string();

        let canceled = client
            .post(format!("{base}/deliveries/{id}/cancel"))
            .send()
            .await
            .expect("cancel");
        assert_eq!(canceled.status(), reqwest::StatusCode::OK);

        let again = client
            .post(format!("{base}/deliveries/{id}/cancel"))
            .send()
            .await
            .expect("cancel again");
        assert_eq!(again.status(), reqwest::StatusCode::CONFLICT);

        let missing = client
            .post(format!("{base}/deliveries/nope/cancel"))
            .send()
            .await
            .expect("cancel missing");
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_query_values_are_rejected() {
        let (base, _subscription) = spawn_admin().await;
        let client = reqwest::Client::new();

        let bad_status = client
            .get(format!("{base}/deliveries?status=exploded"))
            .send()
            .await
            .expect("list");
        assert_eq!(bad_status.status(), reqwest::StatusCode::BAD_REQUEST);

        let bad_granularity = client
            .get(format!("{base}/metrics/rollups?granularity=weekly"))
            .send()
            .await
            .expect("rollups");
        assert_eq!(bad_granularity.status(), reqwest::StatusCode::BAD_REQUEST);

        let rollups: Value = client
            .get(format!("{base}/metrics/rollups?granularity=daily"))
            .send()
            .await
            .expect("rollups")
            .json()
            .await
            .expect("rollups body");
        assert_eq!(rollups["granularity"], json!("daily"));
        assert_eq!(rollups["rollups"], json!([]));

        let blank = client
            .post(format!("{base}/events"))
            .json(&json!({ "eventName": "  " }))
            .send()
            .await
            .expect("emit");
        assert_eq!(blank.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}
