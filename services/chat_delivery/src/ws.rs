use axum::extract::ws::{Message as WsMessage, WebSocket};
use chat_protocol::{Action, Event};
use futures::{SinkExt, StreamExt};

use crate::auth::Identity;
use crate::error::ChatError;
use crate::service::ChatService;
use crate::session::{Outcome, Session};

/// Drive one upgraded connection until the client goes away.
///
/// Frames are handled one at a time in arrival order. Everything written to
/// the socket goes through the session's queue and a single writer task.
pub async fn handle_socket(socket: WebSocket, svc: ChatService, identity: Identity) {
    let (mut sink, mut stream) = socket.split();
    let (handle, mut rx) = svc
        .hub()
        .register(identity.user_id, identity.organization_id);
    let conn_id = handle.conn_id;
    let user_id = identity.user_id;
    tracing::info!(%user_id, conn_id, "session opened");

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "could not encode event");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    handle.send(Event::Hello {
        user_id,
        username: identity.username.clone(),
    });
    let mut session = Session::new(identity, handle);

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let outcome = match serde_json::from_str::<Action>(&text) {
            Ok(action) => session.dispatch(&svc, action).await,
            Err(e) => {
                tracing::debug!(%user_id, error = %e, "malformed action");
                Outcome::error(&ChatError::InvalidInput("malformed_action"), None)
            }
        };
        session.apply(&svc, outcome).await;
    }

    session.close(&svc);
    drop(session);
    let _ = writer.await;
    tracing::info!(%user_id, conn_id, "session closed");
}
