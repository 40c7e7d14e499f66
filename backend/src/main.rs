use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use fallguard_verify::classifier::{Classifier, ForestClassifier, ProcessClassifier};
use fallguard_verify::config::{ClassifierChoice, Config};
use fallguard_verify::error::ApiError;
use fallguard_verify::model::{
    check_sensitivity, CompanionAnswer, PersonConfig, PredictRequest, PredictResponse, RecordPatch,
};
use fallguard_verify::monitor::MonitorRegistry;
use fallguard_verify::store::{MemoryStatusStore, PgStatusStore, StatusStore};
use fallguard_verify::window::FeatureWindow;
use fallguard_verify::{ImpactGate, SystemClock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod websockets;

use crate::websockets::ws_handler;

const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// **Global Application State**
///
/// - `registry`: one monitor (buffer, gate, verification coordinator, event
///   channel) per person.
/// - `rejected_payloads`: `/predict` bodies that failed to parse.
pub struct AppState {
    registry: Arc<MonitorRegistry>,
    rejected_payloads: AtomicU64,
}

impl AppState {
    fn reject(&self, err: impl std::fmt::Display) -> ApiError {
        self.rejected_payloads.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(error = %err, "Rejected payload");
        ApiError::bad_request(err.to_string())
    }
}

/// **POST /predict**
///
/// Evaluates the trailing window of a posted batch of samples.
async fn predict(
    body: web::Bytes,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let request: PredictRequest = serde_json::from_slice(&body).map_err(|e| data.reject(e))?;
    let monitor = data.registry.get_or_create(request.person_id());
    let required = monitor.window_len();

    if request.data.len() < required {
        return Ok(HttpResponse::Ok().json(PredictResponse::buffering(
            request.data.len(),
            required,
        )));
    }

    let skip = request.data.len() - required;
    let frames = request
        .data
        .iter()
        .cloned()
        .enumerate()
        .skip(skip)
        .map(|(i, sample)| sample.into_frame(i as f64))
        .collect();
    let window = FeatureWindow::from_frames(frames).map_err(|e| data.reject(e))?;

    let report = monitor
        .evaluate_window(&window, request.config.sensitivity)
        .await;
    Ok(HttpResponse::Ok().json(report.to_response()))
}

/// **GET /api/status/{person_id}**
async fn get_status(
    path: web::Path<String>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let person_id = path.into_inner();
    match data.registry.store().get(&person_id).await? {
        Some(record) => Ok(HttpResponse::Ok().json(record)),
        None => Err(ApiError::NotFound(person_id)),
    }
}

/// **POST /api/status/{person_id}/respond**
///
/// Companion answer to an open verification request.
async fn respond(
    path: web::Path<String>,
    answer: web::Json<CompanionAnswer>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let person_id = path.into_inner();
    let answer = answer.into_inner();
    if !answer.status.is_companion_answer() {
        return Err(ApiError::InvalidAnswer(answer.status.to_string()));
    }

    let patch = RecordPatch {
        status: Some(answer.status),
        note: answer.note,
        source: Some("companion".to_string()),
        ..RecordPatch::default()
    };
    data.registry.store().update(&person_id, &patch).await?;
    tracing::info!(%person_id, status = %answer.status, "Companion answered");

    match data.registry.store().get(&person_id).await? {
        Some(record) => Ok(HttpResponse::Ok().json(record)),
        None => Err(ApiError::NotFound(person_id)),
    }
}

/// **PUT /api/config/{person_id}**
///
/// Sets the person's sensitivity for streamed and posted windows alike.
async fn put_config(
    path: web::Path<String>,
    body: web::Json<PersonConfig>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let person_id = path.into_inner();
    let sensitivity = check_sensitivity(body.into_inner().sensitivity)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    data.registry.get_or_create(&person_id).set_sensitivity(sensitivity);

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "person_id": person_id,
        "sensitivity": sensitivity,
    })))
}

/// **GET /health**
async fn health(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "monitored": data.registry.len(),
        "rejected_payloads": data.rejected_payloads.load(Ordering::Relaxed),
        "malformed_frames": data.registry.malformed_frames(),
    }))
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/predict", web::post().to(predict))
        .route("/ws", web::get().to(ws_handler))
        .route("/api/status/{person_id}", web::get().to(get_status))
        .route("/api/status/{person_id}/respond", web::post().to(respond))
        .route("/api/config/{person_id}", web::put().to(put_config))
        .route("/health", web::get().to(health));
}

async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn StatusStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStatusStore::connect(url, config.verification.store_timeout * 3).await?;
            store.migrate().await?;
            tracing::info!("Using Postgres status store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; status records are kept in memory");
            Ok(Arc::new(MemoryStatusStore::new()))
        }
    }
}

fn build_classifier(choice: &ClassifierChoice) -> anyhow::Result<Arc<dyn Classifier>> {
    match choice {
        ClassifierChoice::Forest { model_path } => match ForestClassifier::load(model_path) {
            Ok(forest) => Ok(Arc::new(forest)),
            Err(e) => {
                tracing::error!(%model_path, error = %e, "Model artifact unusable; running degraded");
                Ok(Arc::new(ForestClassifier::unavailable(model_path)))
            }
        },
        ClassifierChoice::Process { command, input } => {
            let process = ProcessClassifier::from_command_line(command, *input)
                .ok_or_else(|| anyhow::anyhow!("empty classifier command"))?;
            Ok(Arc::new(process))
        }
    }
}

/// **Application Entry Point**
///
/// Loads configuration, builds the store, classifier and monitors, and starts the HTTP server.
#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let store = build_store(&config).await?;
    let classifier = build_classifier(&config.classifier)?;
    tracing::info!(classifier = classifier.name(), "Classifier ready");

    let registry = Arc::new(MonitorRegistry::new(
        config.monitor.clone(),
        Arc::new(ImpactGate::new(config.gate.clone(), classifier)),
        store,
        Arc::new(SystemClock),
        config.verification.clone(),
    ));

    let sweeper = Arc::clone(&registry);
    actix_rt::spawn(async move {
        let mut tick = tokio::time::interval(EVICTION_INTERVAL);
        loop {
            tick.tick().await;
            let evicted = sweeper.evict_idle();
            if evicted > 0 {
                tracing::info!(evicted, remaining = sweeper.len(), "Evicted idle monitors");
            }
        }
    });

    let app_state = web::Data::new(AppState {
        registry,
        rejected_payloads: AtomicU64::new(0),
    });

    tracing::info!(bind_addr = %config.bind_addr, "Server starting");

    HttpServer::new(move || {
        let cors = actix_cors::Cors::permissive();

        App::new()
            .wrap(cors)
            .app_data(app_state.clone())
            .configure(routes)
    })
    .bind(config.bind_addr.as_str())?
    .run()
    .await?;

    Ok(())
}
