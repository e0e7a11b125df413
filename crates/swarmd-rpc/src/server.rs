//! HTTP transport: the axum router and the `/rpc` endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::info;

use swarmd_registry::{Registry, RequestContext};

use crate::envelope::{
    RequestDocument, RequestEnvelope, ResponseEnvelope, parse_request,
};
use crate::methods;
use crate::state::{SinkPersister, SwarmContext};
use crate::ws;

/// Default per-request deadline when the client does not send one.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

/// Shared axum state.
#[derive(Clone)]
pub(crate) struct AppState {
    pub registry: Registry,
    pub ctx: Arc<SwarmContext>,
}

/// The swarmd RPC server: registry wiring plus HTTP/WS transport.
pub struct RpcServer {
    registry: Registry,
    ctx: Arc<SwarmContext>,
}

impl RpcServer {
    /// Build the server: create the registry (with sink mirroring) and
    /// register the whole method catalog.
    pub fn new(ctx: Arc<SwarmContext>) -> Self {
        let persister = SinkPersister::new(ctx.sink.clone());
        let registry = Registry::with_persister(Some(persister));
        methods::register_all(&registry, &ctx);
        Self { registry, ctx }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            ctx: Arc::clone(&self.ctx),
        };
        Router::new()
            .route("/rpc", post(handle_rpc))
            .route("/ws", get(ws::ws_handler))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Serve on an already-bound listener until the process stops.
    pub async fn serve(self, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, methods = self.registry.method_names().len(), "rpc server listening");
        axum::serve(listener, self.router()).await
    }
}

/// Dispatch one envelope; `None` for notifications.
pub(crate) async fn dispatch_envelope(
    registry: &Registry,
    client_id: &str,
    envelope: RequestEnvelope,
) -> Option<ResponseEnvelope> {
    let id = envelope.id.clone();
    let notification = envelope.is_notification();

    let ctx = RequestContext::new(client_id).with_deadline(DEFAULT_DEADLINE);
    let params = envelope.params.unwrap_or_else(|| json!({}));
    let outcome = registry.dispatch(&envelope.method, params, ctx).await;

    if notification {
        return None;
    }
    Some(match outcome {
        Ok(result) => ResponseEnvelope::success(id, result),
        Err(err) => ResponseEnvelope::failure(id, err.into()),
    })
}

async fn handle_rpc(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let client_id = headers
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();

    let document = match parse_request(&body) {
        Ok(document) => document,
        Err(err) => {
            return axum::Json(ResponseEnvelope::failure(None, err)).into_response();
        }
    };

    match document {
        RequestDocument::Single(Ok(envelope)) => {
            match dispatch_envelope(&state.registry, &client_id, envelope).await {
                Some(response) => axum::Json(response).into_response(),
                None => StatusCode::NO_CONTENT.into_response(),
            }
        }
        RequestDocument::Single(Err(err)) => {
            axum::Json(ResponseEnvelope::failure(None, err)).into_response()
        }
        RequestDocument::Batch(entries) => {
            let mut responses = Vec::with_capacity(entries.len());
            for entry in entries {
                match entry {
                    Ok(envelope) => {
                        if let Some(response) =
                            dispatch_envelope(&state.registry, &client_id, envelope).await
                        {
                            responses.push(response);
                        }
                    }
                    Err(err) => responses.push(ResponseEnvelope::failure(None, err)),
                }
            }
            if responses.is_empty() {
                StatusCode::NO_CONTENT.into_response()
            } else {
                axum::Json(responses).into_response()
            }
        }
    }
}
