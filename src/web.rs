use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use miette::{IntoDiagnostic, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use crate::authz::{Enforcer, Request};
use crate::plugin::{self, ActivateResponse, AuthZRequest, AuthZResponse};
use crate::settings::{Listen, Settings};

/// Media type of every plugin API response.
pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.2+json";

pub fn router(enforcer: Arc<Enforcer>) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/AuthZPlugin.AuthZReq", post(authz_request))
        .route("/AuthZPlugin.AuthZRes", post(authz_response))
        .route("/v1/check", post(handle_check))
        .route("/healthz", get(health))
        .with_state(enforcer)
}

pub async fn serve(settings: &Settings, enforcer: Arc<Enforcer>) -> Result<()> {
    let app = router(enforcer);

    match settings.server.listen {
        Listen::Unix => {
            let path = &settings.server.socket_path;
            prepare_socket_path(path).await?;
            let listener = tokio::net::UnixListener::bind(path).into_diagnostic()?;
            tracing::info!(socket = %path.display(), "Authorization plugin listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .into_diagnostic()?;
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::warn!(socket = %path.display(), error = %e, "Failed to remove socket");
            }
        }
        Listen::Tcp => {
            let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
                .parse()
                .into_diagnostic()?;
            let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
            tracing::info!(%addr, "Authorization plugin listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .into_diagnostic()?;
        }
    }

    tracing::info!("Authorization plugin stopped");
    Ok(())
}

/// Re-read the policy from `policy_path` on every SIGHUP. A policy that fails
/// to load is logged and the running one stays in effect.
pub fn spawn_reload_on_hangup(
    enforcer: Arc<Enforcer>,
    policy_path: PathBuf,
) -> std::io::Result<JoinHandle<()>> {
    let mut hangup = signal(SignalKind::hangup())?;
    Ok(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match enforcer.reload_from(&policy_path) {
                Ok(()) => tracing::info!(
                    path = %policy_path.display(),
                    rules = enforcer.policy().rules().len(),
                    "Policy reloaded"
                ),
                Err(e) => tracing::error!(
                    path = %policy_path.display(),
                    error = %e,
                    "Policy reload failed, keeping the current policy"
                ),
            }
        }
    }))
}

async fn prepare_socket_path(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.into_diagnostic()?;
    }
    // stale socket from a previous run
    if tokio::fs::try_exists(path).await.into_diagnostic()? {
        tokio::fs::remove_file(path).await.into_diagnostic()?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

async fn activate() -> Response {
    plugin_json(ActivateResponse::default())
}

async fn authz_request(State(enforcer): State<Arc<Enforcer>>, body: Bytes) -> Response {
    let response = match decode::<AuthZRequest>(&body) {
        Ok(req) => plugin::authorize_request(&enforcer, &req),
        Err(resp) => resp,
    };
    plugin_json(response)
}

async fn authz_response(body: Bytes) -> Response {
    let response = match decode::<AuthZRequest>(&body) {
        Ok(req) => plugin::authorize_response(&req),
        Err(resp) => resp,
    };
    plugin_json(response)
}

async fn handle_check(State(enforcer): State<Arc<Enforcer>>, body: Bytes) -> Response {
    let req: Request = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to decode check request body");
            let body = serde_json::json!({
                "allowed": false,
                "error": format!("invalid request body: {e}"),
            });
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };
    match enforcer.explain_request(&req) {
        Ok(decision) => Json(decision).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// The daemon sends bodies without a JSON content type, so they are parsed
/// by hand. An undecodable body is answered with a denial carrying `Err`.
fn decode<T: DeserializeOwned>(body: &[u8]) -> std::result::Result<T, AuthZResponse> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::warn!(error = %e, "Failed to decode plugin request body");
        AuthZResponse::error(format!("invalid request body: {e}"))
    })
}

fn plugin_json<T: Serialize>(value: T) -> Response {
    let mut resp = Json(value).into_response();
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(PLUGIN_CONTENT_TYPE));
    resp
}
