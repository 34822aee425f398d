mod dispatch;
mod http;
mod logistics;
mod metrics;
mod models;
mod notify;
mod pipeline;
mod run_lock;
mod scheduler;
mod security;
mod store;
mod wb;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use dispatch::{ReportDispatcher, check_credential};
use eyre::WrapErr;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, NotifyTimesResponse, RegisterSellerRequest, ReportQuery, ReportResponse,
    ScheduleRequest, SellerResponse, SubscriptionsResponse,
};
use notify::{LogNotifier, Notifier, TelegramNotifier};
use pipeline::{Pipeline, PipelineConfig, PipelineError, PipelineErrorKind};
use run_lock::RedisRunLock;
use scheduler::{JobInfo, Scheduler, notify_times};
use security::{AuthContext, AuthState, require_api_auth};
use serde_json::json;
use std::{collections::HashSet, net::SocketAddr, sync::Arc};
use store::{MemoryStore, NewUser, PostgrestStore, Store, StoreError, TariffSource, UserRow, latest_seller};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use wb::{Marketplace, WbClient};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "logistics_watch.api", "server crashed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let (store, tariffs): (Arc<dyn Store>, Arc<dyn TariffSource>) = match PostgrestStore::from_env() {
        Some(main_db) => {
            let tariff_db = PostgrestStore::tariffs_from_env().unwrap_or_else(|| main_db.clone());
            (Arc::new(main_db), Arc::new(tariff_db))
        }
        None => {
            warn!(
                target = "logistics_watch.api",
                "POSTGREST_URL not set; using the in-memory store"
            );
            let memory = MemoryStore::new();
            (Arc::new(memory.clone()), Arc::new(memory))
        }
    };
    let notifier: Arc<dyn Notifier> = match TelegramNotifier::from_env() {
        Some(telegram) => Arc::new(telegram),
        None => {
            warn!(
                target = "logistics_watch.api",
                "BOT_TOKEN not set; reports will only be logged"
            );
            Arc::new(LogNotifier)
        }
    };
    let marketplace: Arc<dyn Marketplace> = Arc::new(WbClient::new());
    let config = PipelineConfig::from_env();
    let offset = config.utc_offset;
    let pipeline = Pipeline::new(config, store.clone(), tariffs, marketplace.clone());
    let dispatcher = ReportDispatcher::new(pipeline, notifier, RedisRunLock::from_env());

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install prometheus recorder")?;
    let state = AppState {
        store,
        marketplace,
        scheduler: Scheduler::new(dispatcher, offset),
        openapi: Arc::new(load_openapi()),
        prometheus_handle,
    };
    let app = build_router(state, AuthState::from_env());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "logistics_watch.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .await
        .wrap_err("server error")?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn Store>,
    marketplace: Arc<dyn Marketplace>,
    scheduler: Scheduler,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

fn build_router(state: AppState, auth: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/users", post(register_user))
        .route("/users/{tg_id}/schedule", put(schedule_reports))
        .route("/users/{tg_id}/subscriptions", get(list_subscriptions))
        .route("/sellers", post(register_seller))
        .route(
            "/sellers/{id}/schedule",
            get(get_schedule).delete(cancel_schedule),
        )
        .route("/sellers/{id}/report", post(run_report))
        .route("/notify-times", get(list_notify_times))
        .route_layer(middleware::from_fn_with_state(auth, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({"openapi": "3.0.3"}))
}

/// Liveness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "logistics-watch-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Response {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    Json((*state.openapi).clone()).into_response()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64 * 1024)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Register a chat user; repeated calls return the existing row.
async fn register_user(
    State(state): State<AppState>,
    Json(payload): Json<NewUser>,
) -> Result<Json<UserRow>, AppError> {
    crate::metrics::inc_requests("/users");
    let existing = state
        .store
        .find_user(payload.user_tg_id)
        .await
        .map_err(store_error("register_user"))?;
    if let Some(existing) = existing {
        return Ok(Json(existing));
    }
    let user = state
        .store
        .insert_user(&payload)
        .await
        .map_err(store_error("register_user"))?;
    info!(target = "logistics_watch.api", user_tg_id = user.user_tg_id, "user registered");
    Ok(Json(user))
}

/// Validate a marketplace token and attach it to a chat user.
///
/// - Method: `POST`
/// - Path: `/sellers`
/// - Body: `RegisterSellerRequest`
/// - Response: `SellerResponse` with the token's scopes
async fn register_seller(
    State(state): State<AppState>,
    Json(payload): Json<RegisterSellerRequest>,
) -> Result<Json<SellerResponse>, AppError> {
    crate::metrics::inc_requests("/sellers");
    let api_token = payload.api_token.trim();
    let token = check_credential(api_token)?;
    if !state.marketplace.check_token(api_token).await {
        return Err(PipelineError::credential(
            "check_credential",
            "marketplace rejected the token",
        )
        .into());
    }
    let user = state
        .store
        .find_user(payload.user_tg_id)
        .await
        .map_err(store_error("register_seller"))?
        .ok_or_else(|| PipelineError::not_found("register_seller", "user is not registered"))?;
    let seller = state
        .store
        .upsert_seller(user.id, api_token)
        .await
        .map_err(store_error("register_seller"))?;
    info!(
        target = "logistics_watch.api",
        seller_id = seller.id,
        user_tg_id = payload.user_tg_id,
        supplier_id = ?token.supplier_id,
        token_id = ?token.id,
        read_only = token.is_read_only(),
        "seller registered"
    );
    Ok(Json(SellerResponse {
        seller_id: seller.id,
        user_id: seller.user_id,
        expires_at: token.expires_at,
        read_only: token.is_read_only(),
        scopes: token.scopes,
    }))
}

async fn list_notify_times(State(state): State<AppState>) -> Json<NotifyTimesResponse> {
    let offset = state.scheduler.dispatcher().pipeline().config.utc_offset;
    Json(NotifyTimesResponse {
        times: notify_times(),
        utc_offset_hours: offset.local_minus_utc() / 3600,
    })
}

/// Schedule daily reports for the user's most recent seller and send one now.
///
/// - Method: `PUT`
/// - Path: `/users/{tg_id}/schedule`
/// - Body: `{"notify_at": "HH:00"}`
async fn schedule_reports(
    State(state): State<AppState>,
    Path(tg_id): Path<i64>,
    Json(payload): Json<ScheduleRequest>,
) -> Result<Json<JobInfo>, AppError> {
    crate::metrics::inc_requests("/users/{tg_id}/schedule");
    let sellers = state
        .store
        .sellers_for_user(tg_id)
        .await
        .map_err(store_error("schedule"))?;
    let seller = latest_seller(sellers)
        .ok_or_else(|| PipelineError::not_found("schedule", "user has no sellers"))?;
    check_credential(&seller.api_token)?;
    let job = state
        .scheduler
        .schedule(seller.id, payload.notify_at, true)
        .await;
    Ok(Json(job))
}

/// Sellers of this user that currently have a daily job.
async fn list_subscriptions(
    State(state): State<AppState>,
    Path(tg_id): Path<i64>,
) -> Result<Json<SubscriptionsResponse>, AppError> {
    let sellers = state
        .store
        .sellers_for_user(tg_id)
        .await
        .map_err(store_error("subscriptions"))?;
    let seller_ids: HashSet<i64> = sellers.iter().map(|seller| seller.id).collect();
    let jobs = state
        .scheduler
        .active()
        .await
        .into_iter()
        .filter(|job| seller_ids.contains(&job.seller_id))
        .collect();
    Ok(Json(SubscriptionsResponse {
        user_tg_id: tg_id,
        jobs,
    }))
}

async fn get_schedule(
    State(state): State<AppState>,
    Path(seller_id): Path<i64>,
) -> Result<Json<JobInfo>, AppError> {
    state
        .scheduler
        .get(seller_id)
        .await
        .map(Json)
        .ok_or_else(|| PipelineError::not_found("schedule", "no active job").into())
}

async fn cancel_schedule(
    State(state): State<AppState>,
    Path(seller_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    crate::metrics::inc_requests("/sellers/{id}/schedule");
    if state.scheduler.cancel(seller_id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(PipelineError::not_found("schedule", "no active job").into())
    }
}

/// Run the tariff report for a seller now.
///
/// - Method: `POST`
/// - Path: `/sellers/{id}/report`
/// - Query: `deliver` (default `true`); `false` returns the pages without sending them
async fn run_report(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(seller_id): Path<i64>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<ReportResponse>, AppError> {
    crate::metrics::inc_requests("/sellers/{id}/report");
    info!(
        target = "logistics_watch.api",
        client = %context.client,
        api_key = %context.api_key_id,
        seller_id,
        deliver = query.deliver,
        "report requested"
    );
    let dispatcher = state.scheduler.dispatcher();
    let response = if query.deliver {
        dispatcher
            .dispatch(seller_id)
            .await?
            .map_or(ReportResponse::Skipped, ReportResponse::Delivered)
    } else {
        dispatcher
            .preview(seller_id)
            .await?
            .map_or(ReportResponse::Skipped, ReportResponse::Preview)
    };
    Ok(Json(response))
}

fn store_error(stage: &'static str) -> impl Fn(StoreError) -> PipelineError {
    move |err| PipelineError::internal(stage, err.to_string())
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::Credential => StatusCode::UNPROCESSABLE_ENTITY,
                    PipelineErrorKind::Internal => {
                        error!(target = "logistics_watch.api", stage = err.stage(), error = %err, "request failed");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;
    use crate::pipeline::tests::fixture;
    use crate::wb::token::encode_test_token;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    const KEY: &str = "secret";

    async fn app() -> Router {
        let (pipeline, store, marketplace) = fixture().await;
        let dispatcher = ReportDispatcher::new(pipeline, Arc::new(RecordingNotifier::default()), None);
        let state = AppState {
            store: Arc::new(store),
            marketplace,
            scheduler: Scheduler::new(dispatcher, scheduler::default_utc_offset()),
            openapi: Arc::new(load_openapi()),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
        };
        build_router(state, AuthState::from_keys(&format!("tests:{KEY}")))
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("X-Service-Key", KEY);
        let body = match body {
            Some(json) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn token(exp: i64) -> String {
        encode_test_token(&json!({ "exp": exp, "s": (1 << 1) | (1 << 5) }))
    }

    async fn registered_seller(app: &Router) -> i64 {
        let (status, _) = call(app, Method::POST, "/users", Some(json!({"user_tg_id": 77}))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(
            app,
            Method::POST,
            "/sellers",
            Some(json!({"user_tg_id": 77, "api_token": token(4_000_000_000)})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["seller_id"].as_i64().expect("seller id")
    }

    #[tokio::test]
    async fn health_needs_no_key() {
        let response = app()
            .await
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_routes_require_a_key() {
        let response = app()
            .await
            .oneshot(Request::get("/notify-times").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn notify_times_lists_all_slots() {
        let app = app().await;
        let (status, body) = call(&app, Method::GET, "/notify-times", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["times"].as_array().map(Vec::len), Some(16));
        assert_eq!(body["utc_offset_hours"], json!(3));
    }

    #[tokio::test]
    async fn seller_registration_reports_scopes() {
        let app = app().await;
        call(&app, Method::POST, "/users", Some(json!({"user_tg_id": 77}))).await;
        let (status, body) = call(
            &app,
            Method::POST,
            "/sellers",
            Some(json!({"user_tg_id": 77, "api_token": token(4_000_000_000)})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scopes"], json!(["content", "statistics"]));
        assert_eq!(body["read_only"], json!(false));
    }

    #[tokio::test]
    async fn expired_or_unknown_user_is_rejected() {
        let app = app().await;
        let (status, body) = call(
            &app,
            Method::POST,
            "/sellers",
            Some(json!({"user_tg_id": 77, "api_token": token(1_600_000_000)})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], json!("check_credential"));

        let (status, _) = call(
            &app,
            Method::POST,
            "/sellers",
            Some(json!({"user_tg_id": 999, "api_token": token(4_000_000_000)})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn schedule_lifecycle() {
        let app = app().await;
        let seller_id = registered_seller(&app).await;

        let (status, _) = call(
            &app,
            Method::PUT,
            "/users/77/schedule",
            Some(json!({"notify_at": "06:00"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, job) = call(
            &app,
            Method::PUT,
            "/users/77/schedule",
            Some(json!({"notify_at": "09:00"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["seller_id"], json!(seller_id));
        assert_eq!(job["notify_at"], json!("09:00"));

        let (_, subs) = call(&app, Method::GET, "/users/77/subscriptions", None).await;
        assert_eq!(subs["jobs"].as_array().map(Vec::len), Some(1));

        let uri = format!("/sellers/{seller_id}/schedule");
        let (status, _) = call(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn report_preview_returns_pages() {
        let app = app().await;
        let seller_id = registered_seller(&app).await;
        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/sellers/{seller_id}/report?deliver=false"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("preview"));
        assert_eq!(body["delivered"], json!(0));
        assert!(body["chunks"].as_array().is_some_and(|chunks| !chunks.is_empty()));
        assert_eq!(body["stages"].as_array().map(Vec::len), Some(6));
    }

    #[tokio::test]
    async fn report_for_unknown_seller_is_not_found() {
        let app = app().await;
        let (status, body) = call(&app, Method::POST, "/sellers/404/report", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("load_seller"));
    }
}
