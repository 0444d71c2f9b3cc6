use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use uuid::Uuid;

use crate::api::models::{ClientFrame, WsQuery};
use crate::api::ApiState;
use crate::dispatcher::Dispatcher;
use crate::notify::connection::ConnectionHandle;

/// How long the writer gets to flush a close frame before it is aborted.
const WRITER_GRACE: Duration = Duration::from_secs(1);

/// Upgrade to a websocket session, optionally subscribed to `?job_id=`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(q): Query<WsQuery>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.dispatcher, q.job_id))
}

/// One live session: a writer task drains the connection's event buffer into
/// the socket while this task reads client frames. Either side ending, or
/// the broadcaster closing the connection, tears the session down.
async fn handle_socket(socket: WebSocket, dispatcher: Dispatcher, job_id: Option<Uuid>) {
    let (conn, mut rx) = match job_id {
        Some(id) => dispatcher.connect(id),
        None => dispatcher.open(),
    };
    let conn_id = conn.id();
    tracing::info!(conn_id = %conn_id, job_id = ?job_id, "websocket connected");

    let (mut sink, mut stream) = socket.split();

    let writer_conn = conn.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = writer_conn.closed() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let text = match serde_json::to_string(&*event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(conn_id = %writer_conn.id(), error = %e, "failed to encode event");
                    continue;
                }
            };

            if sink.send(Message::Text(text)).await.is_err() {
                tracing::debug!(conn_id = %writer_conn.id(), "websocket sink closed");
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    loop {
        let msg = tokio::select! {
            _ = conn.closed() => break,
            msg = stream.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => handle_frame(&dispatcher, &conn, &text),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "websocket receive error");
                break;
            }
        }
    }

    dispatcher.disconnect(conn_id);
    conn.close();
    if tokio::time::timeout(WRITER_GRACE, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
    tracing::info!(conn_id = %conn_id, "websocket disconnected");
}

fn handle_frame(dispatcher: &Dispatcher, conn: &ConnectionHandle, text: &str) {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Subscribe(job_id)) => {
            dispatcher.subscribe(conn, job_id);
            tracing::debug!(conn_id = %conn.id(), job_id = %job_id, "subscribed");
        }
        Ok(ClientFrame::Unsubscribe(job_id)) => {
            dispatcher.unsubscribe(conn.id(), job_id);
            tracing::debug!(conn_id = %conn.id(), job_id = %job_id, "unsubscribed");
        }
        Err(e) => {
            tracing::debug!(conn_id = %conn.id(), error = %e, "ignoring client frame");
        }
    }
}
