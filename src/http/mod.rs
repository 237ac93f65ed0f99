use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::app::AppContext;
use crate::correlation::CorrelationEntry;
use crate::error::SinkError;
use crate::model::{Alert, MetricKind, Severity};
use crate::pipeline::{CYCLE_LOOP, CycleSummary};
use crate::state::{AlertOverview, LoopHealth};

const DEFAULT_WINDOW: Duration = Duration::from_secs(3_600);
const DEFAULT_LIMIT: usize = 500;
const MAX_LIMIT: usize = 10_000;

pub fn create_router(ctx: AppContext) -> Router {
    let api = Router::new()
        .route("/cycles", post(post_cycle))
        .route("/alerts", get(get_alerts))
        .route("/alerts/active", get(get_active_alerts))
        .route("/metrics", get(get_metric_documents))
        .route("/correlation", get(get_correlation))
        .route("/summary", get(get_summary));

    Router::new()
        .route("/healthz", get(get_healthz))
        .route("/metrics", get(get_metrics))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// `?window=15m&severity=high&kind=transaction&limit=100`
#[derive(Debug, Deserialize)]
struct WindowParams {
    #[serde(default, with = "humantime_serde")]
    window: Option<Duration>,
    #[serde(default)]
    severity: Option<Severity>,
    #[serde(default)]
    kind: Option<MetricKind>,
    #[serde(default)]
    limit: Option<usize>,
}

impl WindowParams {
    fn window(&self) -> Duration {
        self.window.unwrap_or(DEFAULT_WINDOW)
    }

    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Serialize)]
struct SummaryResponse {
    target: String,
    last_cycle: Option<CycleSummary>,
    alerts: AlertOverview,
    loops: Vec<LoopHealth>,
}

async fn get_healthz(State(ctx): State<AppContext>) -> StatusCode {
    let staleness = (ctx.config.schedule.interval * 3).max(Duration::from_secs(180));
    let is_ready = ctx.state.is_ready(&[CYCLE_LOOP], staleness).await;

    if is_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn get_metrics(State(ctx): State<AppContext>) -> Response {
    match ctx.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = ?err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn post_cycle(State(ctx): State<AppContext>) -> Response {
    match ctx.pipeline.trigger().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => {
            warn!(error = ?err, "cycle trigger failed");
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
    }
}

async fn get_alerts(
    State(ctx): State<AppContext>,
    Query(params): Query<WindowParams>,
) -> Result<Json<Vec<serde_json::Value>>, Response> {
    ctx.read_alerts(params.window(), params.severity, params.limit())
        .await
        .map(Json)
        .map_err(sink_error)
}

async fn get_metric_documents(
    State(ctx): State<AppContext>,
    Query(params): Query<WindowParams>,
) -> Result<Json<Vec<serde_json::Value>>, Response> {
    ctx.read_metrics(params.window(), params.kind, params.limit())
        .await
        .map(Json)
        .map_err(sink_error)
}

async fn get_active_alerts(State(ctx): State<AppContext>) -> Json<Vec<Alert>> {
    Json(ctx.state.active_alerts().await)
}

async fn get_correlation(State(ctx): State<AppContext>) -> Json<Vec<CorrelationEntry>> {
    Json(ctx.state.correlation().await)
}

async fn get_summary(State(ctx): State<AppContext>) -> Json<SummaryResponse> {
    Json(SummaryResponse {
        target: ctx.target_name().to_string(),
        last_cycle: ctx.state.last_summary().await,
        alerts: ctx.state.alert_overview().await,
        loops: ctx.state.loop_health().await,
    })
}

fn sink_error(err: SinkError) -> Response {
    warn!(error = %err, "sink query failed");
    (StatusCode::BAD_GATEWAY, err.to_string()).into_response()
}
