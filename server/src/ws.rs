//! Axum WebSocket transport for C13 streaming sessions (spec.md §6.1). This
//! module only moves bytes — all protocol semantics live in
//! `hybridsearch_core::session::Session`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use hybridsearch_core::session::{ClientMessage, ServerMessage, Session};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::AppContext;

pub async fn ws_handler(
    State(ctx): State<Arc<AppContext>>,
    Path(store): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, store))
}

async fn handle_socket(mut socket: WebSocket, ctx: Arc<AppContext>, store_name: String) {
    let conn_id = uuid::Uuid::new_v4().to_string();

    let store = match ctx.store_manager.ensure(&store_name) {
        Ok(store) => store,
        Err(e) => {
            let _ = send(&mut socket, &ServerMessage::from_error(None, &e)).await;
            return;
        }
    };

    let mut session = Session::new(
        conn_id.clone(),
        store_name.clone(),
        store,
        ctx.embedder.clone(),
        ctx.reranker.clone(),
        ctx.batch_size,
        ctx.batch_idle,
    );
    info!(conn_id = %conn_id, store = %store_name, "websocket connection opened");

    let mut idle_timer = tokio::time::interval(Duration::from_millis(50));

    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !dispatch_text(&mut socket, &mut session, &text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(conn_id = %conn_id, error = %e, "websocket transport error");
                        break;
                    }
                }
            }
            _ = idle_timer.tick() => {
                if session.batch_is_idle() {
                    for out in session.flush_batch().await {
                        if send(&mut socket, &out).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    // Transport closed: per spec.md §4.12, in-flight req_id work is
    // cancelled and partial upserts are not rolled back; the file tracker
    // reconciles on the next index call. We still flush a pending batch —
    // that work already completed, it just hasn't been acknowledged.
    session.begin_closing();
    let _ = session.flush_batch().await;
    session.close();
    debug!(conn_id = %conn_id, "websocket connection closed");
}

async fn dispatch_text(socket: &mut WebSocket, session: &mut Session, text: &str) -> bool {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
    let messages = match parsed {
        Ok(msg) => session.handle(msg).await,
        Err(e) => vec![ServerMessage::Error { req_id: None, code: "validation".to_string(), message: e.to_string() }],
    };
    for out in messages {
        if send(socket, &out).await.is_err() {
            return false;
        }
    }
    true
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).unwrap_or_else(|_| r#"{"type":"error","code":"internal","message":"serialization failure"}"#.to_string());
    socket.send(Message::Text(text.into())).await
}
