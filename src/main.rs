mod compose;
mod config;
mod constants;
mod generator;
mod models;
mod providers;
mod publisher;
mod resources;
mod schedule;
mod singleflight;
mod storage;
mod store;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

use compose::render::FontConfig;
use compose::{FfmpegRenderer, RenderBackend};
use config::PoolConfig;
use generator::{GenerationDeps, RunJobOutcome};
use models::CandidateStatus;
use providers::GenerationClient;
use publisher::{PublishClient, PublishContext, Publisher};
use resources::{FfprobeProber, MediaProber};
use singleflight::SingleFlight;
use storage::ArtifactStore;
use store::postgres::PgStore;
use store::Store;

struct AppState {
    deps: GenerationDeps,
    publisher: Arc<dyn Publisher>,
    pools: Vec<PoolConfig>,
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct GenerateResponse {
    pool: String,
    generated: usize,
    failed: usize,
    skipped_slots: usize,
}

/// POST /generate/{pool} - run one orchestrator pass for a pool now
async fn trigger_generate(
    State(state): State<Arc<AppState>>,
    Path(pool_name): Path<String>,
) -> Result<Json<GenerateResponse>, StatusCode> {
    let pool = state
        .pools
        .iter()
        .find(|p| p.name == pool_name)
        .ok_or(StatusCode::NOT_FOUND)?;

    let summary = generator::run_generation_pass(&state.deps, pool, chrono::Utc::now())
        .await
        .log_500("Generation pass error")?;

    Ok(Json(GenerateResponse {
        pool: pool_name,
        generated: summary.generated,
        failed: summary.failed,
        skipped_slots: summary.skipped_slots,
    }))
}

#[derive(Serialize)]
struct RunJobResponse {
    outcome: String,
    publication_id: Option<i64>,
    error: Option<String>,
}

/// POST /jobs/{id}/run - manual (re-)run of one job; idempotent when the
/// job already completed
async fn trigger_run_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<i64>,
) -> Result<Json<RunJobResponse>, StatusCode> {
    let outcome = generator::run_job(&state.deps, &state.pools, job_id)
        .await
        .log_500("Job run error")?;

    let response = match outcome {
        RunJobOutcome::NotFound => return Err(StatusCode::NOT_FOUND),
        RunJobOutcome::UnknownPool => return Err(StatusCode::CONFLICT),
        RunJobOutcome::AlreadyCompleted => RunJobResponse {
            outcome: "already_completed".to_string(),
            publication_id: None,
            error: None,
        },
        RunJobOutcome::Reprocessed { publication_id } => RunJobResponse {
            outcome: "completed".to_string(),
            publication_id: Some(publication_id),
            error: None,
        },
        RunJobOutcome::Failed(error) => RunJobResponse {
            outcome: "failed".to_string(),
            publication_id: None,
            error: Some(error),
        },
    };
    Ok(Json(response))
}

#[derive(Serialize)]
struct PublishCheckResponse {
    published: usize,
    failed: usize,
}

/// POST /publish/check - run one publish pass now
async fn trigger_publish_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PublishCheckResponse>, StatusCode> {
    let (published, failed) =
        publisher::run_publish_pass(state.deps.store.as_ref(), state.publisher.as_ref())
            .await
            .log_500("Publish check error")?;
    Ok(Json(PublishCheckResponse { published, failed }))
}

#[derive(Serialize)]
struct PoolDepthResponse {
    pool: String,
    remaining: i64,
    next_slot_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// GET /pools/{pool}/depth - remaining pending candidates for monitoring
async fn pool_depth(
    State(state): State<Arc<AppState>>,
    Path(pool_name): Path<String>,
) -> Result<Json<PoolDepthResponse>, StatusCode> {
    let pool = state
        .pools
        .iter()
        .find(|p| p.name == pool_name)
        .ok_or(StatusCode::NOT_FOUND)?;

    let remaining = state
        .deps
        .store
        .count_candidates(&pool.language, &pool.sources)
        .await
        .log_500("Depth query error")?;

    Ok(Json(PoolDepthResponse {
        pool: pool_name,
        remaining,
        next_slot_at: schedule::next_slot(&pool.slots, chrono::Utc::now()),
    }))
}

/// POST /candidates/{id}/reset - operator recovery path: reserved -> pending
async fn reset_candidate(
    State(state): State<Arc<AppState>>,
    Path(candidate_id): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    let candidate = state
        .deps
        .store
        .get_candidate(candidate_id)
        .await
        .log_500("Candidate lookup error")?
        .ok_or(StatusCode::NOT_FOUND)?;

    if candidate.status != CandidateStatus::Reserved {
        return Err(StatusCode::CONFLICT);
    }

    state
        .deps
        .store
        .mark_candidate(candidate_id, CandidateStatus::Pending)
        .await
        .log_500("Candidate reset error")?;

    println!("[candidates] Candidate {} reset to pending", candidate_id);
    Ok(StatusCode::NO_CONTENT)
}

/// Extension trait for logging errors and converting to StatusCode
trait LogErr<T> {
    fn log_500(self, context: &str) -> Result<T, StatusCode>;
}

impl<T, E: std::fmt::Display> LogErr<T> for Result<T, E> {
    fn log_500(self, context: &str) -> Result<T, StatusCode> {
        self.map_err(|e| {
            eprintln!("{}: {}", context, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
    }
}

#[tokio::main]
async fn main() {
    let database_url = config::database_url();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to database");

    let store = PgStore::new(pool.clone());
    store.migrate().await.expect("Failed to run migrations");
    let store: Arc<dyn Store> = Arc::new(store);

    let pools_path = config::pools_config_path();
    let pools = config::load_pools(&pools_path).expect("Failed to load pools config");

    // Artifact storage: local disk wins, otherwise GCS (uses
    // GOOGLE_APPLICATION_CREDENTIALS)
    let local_storage_path = config::local_storage_path();
    let gcs = if local_storage_path.is_none() {
        Some(
            google_cloud_storage::client::Storage::builder()
                .build()
                .await
                .expect("Failed to create GCS client"),
        )
    } else {
        None
    };
    let artifacts = Arc::new(ArtifactStore::new(
        gcs,
        local_storage_path,
        config::artifact_bucket(),
        config::public_base_url(),
    ));

    let fonts = FontConfig {
        regular: config::font_regular_path(),
        bold: config::font_bold_path(),
        emoji: config::font_emoji_path(),
    };
    let renderer: Arc<dyn RenderBackend> = Arc::new(FfmpegRenderer::new(fonts));
    let prober: Arc<dyn MediaProber> = Arc::new(FfprobeProber::new());

    // AI generation collaborator is optional; pools using generated
    // backgrounds fail their jobs without it
    let generation = match (
        std::env::var("GENERATION_API_URL"),
        std::env::var("GENERATION_API_KEY"),
    ) {
        (Ok(url), Ok(key)) => Some(Arc::new(GenerationClient::new(&url, &key))),
        _ => None,
    };

    let publish_client_id =
        std::env::var("PUBLISH_CLIENT_ID").expect("PUBLISH_CLIENT_ID must be set");
    let publish_client_secret =
        std::env::var("PUBLISH_CLIENT_SECRET").expect("PUBLISH_CLIENT_SECRET must be set");
    let publish_refresh_token =
        std::env::var("PUBLISH_REFRESH_TOKEN").expect("PUBLISH_REFRESH_TOKEN must be set");
    let publish_token_url =
        std::env::var("PUBLISH_TOKEN_URL").expect("PUBLISH_TOKEN_URL must be set");
    let publish_upload_url =
        std::env::var("PUBLISH_UPLOAD_URL").expect("PUBLISH_UPLOAD_URL must be set");
    let publish_client: Arc<dyn Publisher> = Arc::new(PublishClient::new(
        &publish_client_id,
        &publish_client_secret,
        &publish_refresh_token,
        &publish_token_url,
        &publish_upload_url,
    ));

    let deps = GenerationDeps {
        store: store.clone(),
        prober,
        renderer,
        artifacts,
        generation,
    };

    // Two independent cadences, both guarded by the same single-flight
    // abstraction (one flag per loop)
    let generation_flight = Arc::new(SingleFlight::new());
    let publish_flight = Arc::new(SingleFlight::new());

    tokio::spawn(generator::run_generation_scheduler(
        deps.clone(),
        pools.clone(),
        config::generation_interval_secs(),
        generation_flight,
    ));

    tokio::spawn(publisher::run_publish_worker(
        pool.clone(),
        PublishContext {
            store: store.clone(),
            publisher: publish_client.clone(),
            flight: publish_flight,
        },
        config::publish_cron_seconds(),
    ));

    let state = Arc::new(AppState {
        deps,
        publisher: publish_client,
        pools,
    });

    let app = Router::new()
        // Health
        .route("/health", get(health))
        // Triggers
        .route("/generate/{pool}", post(trigger_generate))
        .route("/jobs/{id}/run", post(trigger_run_job))
        .route("/publish/check", post(trigger_publish_check))
        // Monitoring & recovery
        .route("/pools/{pool}/depth", get(pool_depth))
        .route("/candidates/{id}/reset", post(reset_candidate))
        .with_state(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {}: {}", addr, e));

    println!("Listening on http://{}", addr);
    axum::serve(listener, app).await.expect("Server failed");
}
