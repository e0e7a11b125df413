//! WebSocket transport: RPC envelopes plus event subscription.
//!
//! Clients connect to `/ws` and exchange JSON text frames. Frames with a
//! `type` member are control frames (`subscribe` / `unsubscribe` carrying an
//! `events` array of dotted patterns); everything else is treated as an RPC
//! envelope and dispatched exactly like `POST /rpc`. Matching events stream
//! to the client as `{"type": "event", "event": {…}}` frames, delivered
//! through a bus subscription so each connection gets pattern filtering and
//! cursor-based dedup.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tracing::{debug, warn};

use swarmd_bus::{BusError, Subscription};

use crate::envelope::{RequestDocument, ResponseEnvelope, parse_request};
use crate::error::{RpcCode, RpcErrorObject};
use crate::server::{AppState, dispatch_envelope};

pub(crate) async fn ws_handler(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(state, socket))
}

/// Wait on the subscription when one exists; park forever otherwise (the
/// select loop is then driven purely by inbound frames).
async fn next_event(
    subscription: &mut Option<Subscription>,
) -> Result<std::sync::Arc<swarmd_store::EventRecord>, BusError> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let client_id = format!("ws-{}", uuid::Uuid::now_v7());
    debug!(client_id, "websocket session opened");

    let (mut outbound, mut inbound) = socket.split();
    // Raw pattern list as subscribed; the compiled subscription is rebuilt
    // on every control frame so the dedup cursor (keyed by client id)
    // survives re-subscribes.
    let mut patterns: Vec<String> = Vec::new();
    let mut subscription: Option<Subscription> = None;

    loop {
        tokio::select! {
            frame = inbound.next() => {
                let Some(Ok(frame)) = frame else { break };
                match frame {
                    Message::Text(text) => {
                        let Some(reply) = handle_frame(
                            &state,
                            &client_id,
                            &mut patterns,
                            &mut subscription,
                            text.as_bytes(),
                        )
                        .await
                        else {
                            continue;
                        };
                        if outbound.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    // Ping/pong handled by the transport; binary ignored.
                    _ => {}
                }
            }
            event = next_event(&mut subscription) => {
                match event {
                    Ok(event) => {
                        let frame = json!({ "type": "event", "event": &*event });
                        if outbound.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                        if let Some(subscription) = &subscription {
                            subscription.ack(event.id);
                        }
                    }
                    Err(BusError::Lagged { skipped }) => {
                        warn!(client_id, skipped, "websocket subscriber lagged");
                        let frame = json!({ "type": "lagged", "skipped": skipped });
                        if outbound.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }

    debug!(client_id, "websocket session closed");
}

/// Process one inbound text frame; `None` means nothing to send back.
async fn handle_frame(
    state: &AppState,
    client_id: &str,
    patterns: &mut Vec<String>,
    subscription: &mut Option<Subscription>,
    raw: &[u8],
) -> Option<Value> {
    // Control frames are distinguished by a top-level `type`.
    if let Ok(value) = serde_json::from_slice::<Value>(raw) {
        if let Some(kind) = value.get("type").and_then(Value::as_str) {
            let requested: Vec<String> = value
                .get("events")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            return match kind {
                "subscribe" => {
                    let mut next = patterns.clone();
                    for pattern in requested {
                        if !next.contains(&pattern) {
                            next.push(pattern);
                        }
                    }
                    match state.ctx.bus.subscribe(client_id, &next) {
                        Ok(new_subscription) => {
                            *patterns = next;
                            *subscription = Some(new_subscription);
                            Some(json!({ "type": "subscribed", "events": patterns }))
                        }
                        Err(err) => Some(json!({
                            "type": "error",
                            "error": RpcErrorObject::new(RpcCode::InvalidParams, err.to_string()),
                        })),
                    }
                }
                "unsubscribe" => {
                    patterns.retain(|p| !requested.contains(p));
                    // Removal cannot make the remaining set invalid.
                    *subscription = if patterns.is_empty() {
                        None
                    } else {
                        state.ctx.bus.subscribe(client_id, patterns.as_slice()).ok()
                    };
                    Some(json!({ "type": "unsubscribed", "events": patterns }))
                }
                other => Some(json!({
                    "type": "error",
                    "error": RpcErrorObject::new(
                        RpcCode::InvalidRequest,
                        format!("unknown control frame: {other}"),
                    ),
                })),
            };
        }
    }

    // Otherwise: a plain RPC envelope (batches are HTTP-only).
    let response = match parse_request(raw) {
        Ok(RequestDocument::Single(Ok(envelope))) => {
            dispatch_envelope(&state.registry, client_id, envelope).await?
        }
        Ok(RequestDocument::Single(Err(err))) | Err(err) => ResponseEnvelope::failure(None, err),
        Ok(RequestDocument::Batch(_)) => ResponseEnvelope::failure(
            None,
            RpcErrorObject::new(RpcCode::InvalidRequest, "batches are not supported over ws"),
        ),
    };
    serde_json::to_value(response).ok()
}
