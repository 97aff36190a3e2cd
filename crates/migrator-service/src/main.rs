mod config;
mod interactive;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use migrator_core::Pattern;
use migrator_engine::{FixerConsumer, OverrideFixer, Scheduler, SchedulerStatus};
use migrator_store_sqlite::{ConnPool, DualWritePool, SqliteEventLog, SqlitePool, StoreError};
use serde::{Deserialize, Serialize};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::MigratorConfig;
use crate::interactive::{Interactive, InteractiveDao};

const CODE_OK: i32 = 0;
const CODE_NOT_FOUND: i32 = 3;
const CODE_INVALID: i32 = 4;
const CODE_SYSTEM: i32 = 5;

#[derive(Clone)]
struct ServiceState {
    scheduler: Arc<Scheduler<Interactive>>,
    interactive: InteractiveDao,
}

/// Every response is HTTP 200; failures are reported through `code`.
#[derive(Debug, Clone, Serialize)]
struct ApiResult<T>
where
    T: Serialize,
{
    code: i32,
    msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

impl<T: Serialize> ApiResult<T> {
    fn ok(data: T) -> Self {
        Self { code: CODE_OK, msg: "OK".to_string(), data: Some(data) }
    }

    fn fail(code: i32, msg: impl Into<String>) -> Self {
        Self { code, msg: msg.into(), data: None }
    }
}

fn done() -> Json<ApiResult<()>> {
    Json(ApiResult { code: CODE_OK, msg: "OK".to_string(), data: None })
}

#[derive(Debug, Clone, Deserialize)]
struct StartIncrRequest {
    utime: i64,
    /// Milliseconds between passes once caught up; zero stops at end of data.
    interval: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct BizRequest {
    biz: String,
    biz_id: i64,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "migrator-service")]
#[command(about = "Dual-write migration control plane for the interactives table")]
struct Args {
    /// YAML config file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    bind: Option<SocketAddr>,
    #[arg(long)]
    src_db: Option<PathBuf>,
    #[arg(long)]
    dst_db: Option<PathBuf>,
    #[arg(long)]
    events_db: Option<PathBuf>,
}

impl Args {
    fn resolve(self) -> Result<MigratorConfig> {
        let mut config = MigratorConfig::load(self.config.as_deref())?;
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(path) = self.src_db {
            config.src_db = path;
        }
        if let Some(path) = self.dst_db {
            config.dst_db = path;
        }
        if let Some(path) = self.events_db {
            config.events_db = path;
        }
        Ok(config)
    }
}

fn open_store(name: &str, path: &std::path::Path) -> Result<Arc<dyn ConnPool>> {
    let pool = SqlitePool::open(name, path)
        .with_context(|| format!("failed to open {name} store at {}", path.display()))?;
    interactive::bootstrap(&pool).with_context(|| format!("failed to bootstrap {name} store"))?;
    Ok(Arc::new(pool))
}

fn build(config: &MigratorConfig) -> Result<(ServiceState, FixerConsumer<Interactive>)> {
    let src = open_store("src", &config.src_db)?;
    let dst = open_store("dst", &config.dst_db)?;
    let events = Arc::new(
        SqliteEventLog::open(&config.events_db, config.topic.clone())
            .with_context(|| format!("failed to open event log {}", config.events_db.display()))?,
    );
    let pool = Arc::new(DualWritePool::new(src.clone(), dst.clone()));
    let scheduler = Scheduler::<Interactive>::new(src.clone(), dst.clone(), pool.clone(), events.clone())
        .with_settings(config.validator_settings());
    let fixer = FixerConsumer::new(events, OverrideFixer::<Interactive>::new(src, dst))
        .poll_interval(config.fixer_poll_interval());
    let state = ServiceState { scheduler: Arc::new(scheduler), interactive: InteractiveDao::new(pool) };
    Ok((state, fixer))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/migrator/src_only", post(src_only))
        .route("/migrator/src_first", post(src_first))
        .route("/migrator/dst_first", post(dst_first))
        .route("/migrator/dst_only", post(dst_only))
        .route("/migrator/full/start", post(full_start))
        .route("/migrator/full/stop", post(full_stop))
        .route("/migrator/incr/start", post(incr_start))
        .route("/migrator/incr/stop", post(incr_stop))
        .route("/migrator/status", get(status))
        .route("/interactive/read", post(interactive_read))
        .route("/interactive/like", post(interactive_like))
        .route("/interactive/:biz/:biz_id", get(interactive_get))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c, running until killed");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Args::parse().resolve()?;
    let (state, fixer) = build(&config)?;

    let cancel = CancellationToken::new();
    let fixer_cancel = cancel.clone();
    let topic = config.topic.clone();
    let fixer_task = tokio::spawn(async move {
        if let Err(err) = fixer.run(fixer_cancel).await {
            tracing::error!(%topic, error = %err, "fixer consumer failed");
        }
    });

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(bind = %config.bind, topic = %config.topic, "migrator service listening");
    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;

    cancel.cancel();
    fixer_task.await.context("fixer consumer task panicked")?;
    tracing::info!("migrator service stopped");
    Ok(())
}

async fn health() -> Json<ApiResult<HealthResponse>> {
    Json(ApiResult::ok(HealthResponse { status: "ok" }))
}

fn switch(state: &ServiceState, pattern: Pattern) -> Json<ApiResult<()>> {
    state.scheduler.set_pattern(pattern);
    tracing::info!(%pattern, "pattern switched");
    done()
}

async fn src_only(State(state): State<ServiceState>) -> Json<ApiResult<()>> {
    switch(&state, Pattern::SrcOnly)
}

async fn src_first(State(state): State<ServiceState>) -> Json<ApiResult<()>> {
    switch(&state, Pattern::SrcFirst)
}

async fn dst_first(State(state): State<ServiceState>) -> Json<ApiResult<()>> {
    switch(&state, Pattern::DstFirst)
}

async fn dst_only(State(state): State<ServiceState>) -> Json<ApiResult<()>> {
    switch(&state, Pattern::DstOnly)
}

async fn full_start(State(state): State<ServiceState>) -> Json<ApiResult<()>> {
    let run = state.scheduler.start_full_validation();
    tracing::info!(run_id = %run.run_id(), "full validation requested");
    done()
}

async fn full_stop(State(state): State<ServiceState>) -> Json<ApiResult<()>> {
    state.scheduler.stop_full_validation();
    done()
}

async fn incr_start(
    State(state): State<ServiceState>,
    payload: Result<Json<StartIncrRequest>, JsonRejection>,
) -> Json<ApiResult<()>> {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return Json(ApiResult::fail(CODE_INVALID, rejection.body_text())),
    };
    let Ok(interval) = u64::try_from(request.interval) else {
        return Json(ApiResult::fail(CODE_INVALID, "interval must not be negative"));
    };
    let run = state
        .scheduler
        .start_increment_validation(request.utime, std::time::Duration::from_millis(interval));
    tracing::info!(run_id = %run.run_id(), utime = request.utime, interval, "incremental validation requested");
    done()
}

async fn incr_stop(State(state): State<ServiceState>) -> Json<ApiResult<()>> {
    state.scheduler.stop_increment_validation();
    done()
}

async fn status(State(state): State<ServiceState>) -> Json<ApiResult<SchedulerStatus>> {
    Json(ApiResult::ok(state.scheduler.status()))
}

fn stored<T: Serialize>(outcome: Result<Result<T, StoreError>, JoinError>) -> ApiResult<T> {
    match outcome {
        Ok(Ok(value)) => ApiResult::ok(value),
        Ok(Err(err)) => {
            tracing::error!(error = %err, "interactive store call failed");
            ApiResult::fail(CODE_SYSTEM, "system error")
        }
        Err(err) => {
            tracing::error!(error = %err, "interactive store worker panicked");
            ApiResult::fail(CODE_SYSTEM, "system error")
        }
    }
}

async fn bump(
    state: ServiceState,
    payload: Result<Json<BizRequest>, JsonRejection>,
    apply: fn(&InteractiveDao, &str, i64) -> Result<Interactive, StoreError>,
) -> Json<ApiResult<Interactive>> {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return Json(ApiResult::fail(CODE_INVALID, rejection.body_text())),
    };
    let dao = state.interactive.clone();
    let outcome = tokio::task::spawn_blocking(move || apply(&dao, &request.biz, request.biz_id)).await;
    Json(stored(outcome))
}

async fn interactive_read(
    State(state): State<ServiceState>,
    payload: Result<Json<BizRequest>, JsonRejection>,
) -> Json<ApiResult<Interactive>> {
    bump(state, payload, InteractiveDao::incr_read_cnt).await
}

async fn interactive_like(
    State(state): State<ServiceState>,
    payload: Result<Json<BizRequest>, JsonRejection>,
) -> Json<ApiResult<Interactive>> {
    bump(state, payload, InteractiveDao::like).await
}

async fn interactive_get(
    State(state): State<ServiceState>,
    Path((biz, biz_id)): Path<(String, i64)>,
) -> Json<ApiResult<Interactive>> {
    let dao = state.interactive.clone();
    let outcome = tokio::task::spawn_blocking(move || dao.get(&biz, biz_id)).await;
    match stored(outcome) {
        ApiResult { code: CODE_OK, data: Some(None), .. } => {
            Json(ApiResult::fail(CODE_NOT_FOUND, "interactive not found"))
        }
        ApiResult { code, msg, data } => Json(ApiResult { code, msg, data: data.flatten() }),
    }
}
