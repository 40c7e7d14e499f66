use crate::AppState;
use actix_web::{web, HttpRequest, Responder};
use actix_ws::Message;
use fallguard_verify::error::ApiError;
use fallguard_verify::model::{check_sensitivity, DEFAULT_PERSON_ID};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    person: Option<String>,
    /// 0–100; kept for the person after the stream closes.
    sensitivity: Option<f64>,
}

/// **GET /ws?person=<id>&sensitivity=<0-100>**
///
/// Sensor stream for one wearer. Each text message carries one or more
/// newline-delimited `ax,ay,az,gx,gy,gz` tuples. Monitor events for the same
/// person are pushed back as JSON.
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<StreamQuery>,
    data: web::Data<AppState>,
) -> Result<impl Responder, actix_web::Error> {
    let query = query.into_inner();
    let sensitivity =
        check_sensitivity(query.sensitivity).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let person_id = query
        .person
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_PERSON_ID.to_string());

    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;
    let monitor = data.registry.get_or_create(&person_id);
    if sensitivity.is_some() {
        monitor.set_sensitivity(sensitivity);
    }
    let mut rx = monitor.subscribe();
    tracing::info!(%person_id, ?sensitivity, "Sensor stream connected");

    actix_rt::spawn(async move {
        loop {
            tokio::select! {
                val = msg_stream.next() => {
                    match val {
                        Some(Ok(Message::Text(text))) => {
                            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                                // Malformed tuples are counted by the monitor and skipped.
                                let _ = monitor.ingest_line(line).await;
                            }
                        }
                        Some(Ok(Message::Ping(bytes))) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            tracing::warn!(%person_id, error = %e, "Sensor stream error");
                            break;
                        }
                        _ => {}
                    }
                }
                val = rx.recv() => {
                    match val {
                        Ok(event) => {
                            if session.text(event.to_json()).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(%person_id, skipped, "Event subscriber lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }

        tracing::info!(
            %person_id,
            malformed = monitor.malformed_frames(),
            "Sensor stream closed"
        );
        let _ = session.close(None).await;
    });

    Ok(res)
}
