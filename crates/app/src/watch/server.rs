//! Actix Web front end exposing the live feed, lifecycle control, and snapshots.
//!
//! Blocking control-plane calls and filesystem access run on the blocking
//! pool via `web::block`. The MJPEG feed subscribes to the stream multiplexer
//! and falls back to a placeholder frame while the pipeline is idle.

use std::{io, sync::Arc};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use tracing::{debug, info};

use crate::watch::{
    annotation::placeholder_jpeg,
    config::WatchSettings,
    control::ControlPlane,
    data::{
        FramePacket, SnapshotsResponse, StartRequest, StartResponse, StatusResponse, StopResponse,
        VideosResponse,
    },
    error::ControlError,
    snapshots::{RECENT_SNAPSHOT_LIMIT, list_recent, snapshot_path},
    telemetry,
};

/// Shared state backing HTTP handlers.
pub(crate) struct AppState {
    pub(crate) control: Arc<ControlPlane>,
    pub(crate) settings: Arc<WatchSettings>,
}

/// Run the HTTP server on the current thread until it shuts down, then stop
/// the pipeline.
pub(crate) fn serve(
    control: Arc<ControlPlane>,
    settings: Arc<WatchSettings>,
    bind: String,
) -> Result<()> {
    let _ = telemetry::init_metrics_recorder();
    let state = web::Data::new(AppState {
        control: control.clone(),
        settings,
    });

    actix_web::rt::System::new().block_on(async move {
        let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(routes))
            .bind(bind.as_str())
            .with_context(|| format!("failed to bind HTTP server to {bind}"))?;
        info!("serving on http://{bind}");
        server.run().await.context("HTTP server error")
    })?;

    if control.stop()? {
        info!("pipeline stopped on shutdown");
    }
    Ok(())
}

pub(crate) fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/video_feed", web::get().to(video_feed_handler))
        .route("/start", web::post().to(start_handler))
        .route("/stop", web::post().to(stop_handler))
        .route("/status", web::get().to(status_handler))
        .route("/snapshots", web::get().to(snapshots_handler))
        .route("/snapshot/{filename}", web::get().to(snapshot_handler))
        .route("/videos", web::get().to(videos_handler))
        .route("/metrics", web::get().to(metrics_handler));
}

fn blocking_failed(err: actix_web::error::BlockingError) -> ControlError {
    ControlError::Internal(err.to_string())
}

fn multipart_chunk(jpeg: &[u8], packet: Option<&FramePacket>) -> Bytes {
    let mut payload = Vec::with_capacity(jpeg.len() + 128);
    payload.extend_from_slice(b"--frame\r\n");
    if let Some(packet) = packet {
        payload.extend_from_slice(
            format!(
                "X-Sequence: {}\r\nX-Timestamp: {}\r\n",
                packet.frame_number, packet.timestamp_ms
            )
            .as_bytes(),
        );
    }
    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

/// Stream annotated frames as `multipart/x-mixed-replace`.
async fn video_feed_handler(state: web::Data<AppState>) -> HttpResponse {
    let subscription = state.control.multiplexer().subscribe();
    let control = state.control.clone();
    let idle_interval = state.settings.stream.idle_interval;
    debug!(
        subscriber = subscription.id(),
        subscribers = state.control.multiplexer().subscriber_count(),
        "video feed opened"
    );

    let stream = stream! {
        let mut idle = tokio::time::interval(idle_interval);
        loop {
            let chunk = tokio::select! {
                packet = subscription.recv() => match packet {
                    Some(packet) => Some(multipart_chunk(&packet.jpeg, Some(&packet))),
                    None => break,
                },
                _ = idle.tick() => {
                    (!control.status().running).then(|| multipart_chunk(&placeholder_jpeg(), None))
                }
            };
            if let Some(chunk) = chunk {
                yield Ok::<Bytes, actix_web::Error>(chunk);
            }
        }
        debug!(subscriber = subscription.id(), "video feed subscriber evicted");
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

async fn start_handler(
    state: web::Data<AppState>,
    body: Bytes,
) -> Result<HttpResponse, ControlError> {
    let request: StartRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ControlError::InvalidRequest(format!("invalid request body: {err}")))?
    };
    let source = state.settings.resolve_source(
        request.source.as_deref(),
        request.video_path.as_deref(),
        request.camera_index,
    )?;
    let config = state.settings.pipeline.with_source(source);
    let kind = config.source.kind();

    let control = state.control.clone();
    let summary = web::block(move || control.start(config))
        .await
        .map_err(blocking_failed)??;
    Ok(HttpResponse::Ok().json(StartResponse {
        status: "started",
        source: kind,
        config: summary,
    }))
}

async fn stop_handler(state: web::Data<AppState>) -> Result<HttpResponse, ControlError> {
    let control = state.control.clone();
    let was_running = web::block(move || {
        if let Ok(config) = control.active_config() {
            info!(source = %config.source, "stop requested");
        }
        control.stop()
    })
    .await
    .map_err(blocking_failed)??;
    Ok(HttpResponse::Ok().json(StopResponse {
        status: "stopped",
        was_running,
    }))
}

async fn status_handler(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(StatusResponse::from(state.control.status()))
}

async fn snapshots_handler(state: web::Data<AppState>) -> Result<HttpResponse, ControlError> {
    let dir = state.settings.pipeline.output_dir.clone();
    let snapshots = web::block(move || list_recent(&dir, RECENT_SNAPSHOT_LIMIT))
        .await
        .map_err(blocking_failed)?
        .map_err(|err| ControlError::Internal(format!("failed to list snapshots: {err}")))?;
    Ok(HttpResponse::Ok().json(SnapshotsResponse { snapshots }))
}

async fn snapshot_handler(
    state: web::Data<AppState>,
    filename: web::Path<String>,
) -> Result<HttpResponse, ControlError> {
    let Some(path) = snapshot_path(&state.settings.pipeline.output_dir, &filename) else {
        return Ok(HttpResponse::NotFound().finish());
    };
    match web::block(move || std::fs::read(path))
        .await
        .map_err(blocking_failed)?
    {
        Ok(jpeg) => Ok(HttpResponse::Ok().content_type("image/jpeg").body(jpeg)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(HttpResponse::NotFound().finish()),
        Err(err) => Err(ControlError::Internal(format!(
            "failed to read snapshot: {err}"
        ))),
    }
}

async fn videos_handler(state: web::Data<AppState>) -> Result<HttpResponse, ControlError> {
    let settings = state.settings.clone();
    let videos = web::block(move || settings.list_videos())
        .await
        .map_err(blocking_failed)?
        .map_err(|err| ControlError::Internal(format!("failed to list videos: {err}")))?;
    Ok(HttpResponse::Ok().json(VideosResponse { videos }))
}

async fn metrics_handler() -> HttpResponse {
    let body = telemetry::prometheus_handle()
        .map(|handle| handle.render())
        .unwrap_or_default();
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body)
}
