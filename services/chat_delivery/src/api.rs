use crate::auth::{CredentialValidator, Identity, JwtValidator};
use crate::config::Config;
use crate::error::{ChatError, ChatResult};
use crate::hub::Hub;
use crate::messages::Cursor;
use crate::model::{ChannelType, Message};
use crate::presence::Presence;
use crate::service::{parse_message_type, ChatService};
use crate::store::Store;
use crate::ws;
use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::{
    extract::{Extension, Path, Query, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub service: ChatService,
    pub validator: Arc<dyn CredentialValidator>,
    pub config: Config,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("creating {}", config.data_dir.display()))?;
        let store = Store::open(config.db_path(), config.store_timeout).context("opening store")?;
        let service = ChatService::new(
            store,
            Arc::new(Hub::new()),
            Arc::new(Presence::new(config.presence_debounce)),
            config.fanout,
        );
        let validator = Arc::new(JwtValidator::new(config.jwt_secret.as_bytes().to_vec()));
        Ok(Self {
            service,
            validator,
            config,
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/channels", post(create_channel).get(list_channels))
        .route(
            "/api/channels/:id",
            get(get_channel).patch(update_channel).delete(delete_channel),
        )
        .route("/api/channels/:id/archive", post(archive_channel))
        .route("/api/channels/:id/members", get(list_members).post(add_member))
        .route("/api/channels/:id/members/:user_id", axum::routing::delete(remove_member))
        .route("/api/channels/:id/messages", get(list_messages).post(send_message))
        .route("/api/channels/:id/stats", get(channel_stats))
        .route("/api/channels/:id/unread", get(unread_count))
        .route("/api/channels/:id/notifications/read", post(mark_channel_read))
        .route("/api/messages/:id", patch(edit_message).delete(delete_message))
        .route("/api/messages/:id/read", post(mark_read))
        .route("/api/messages/:id/deliveries", get(delivery_logs))
        .route("/api/messages/:id/receipts", get(read_receipts))
        .route("/api/notifications", get(notifications))
        .route("/api/notifications/:id/read", post(mark_notification_read))
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Accept `Authorization: Bearer <token>` or, for browsers opening a
/// WebSocket, a `token` query parameter.
async fn auth_middleware<B>(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response, ChatError> {
    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let token = bearer.or(query.token).ok_or(ChatError::Unauthenticated)?;
    let identity = state.validator.validate(&token).await?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

#[derive(Deserialize)]
struct CreateChannelReq {
    name: String,
    #[serde(default)]
    channel_type: Option<ChannelType>,
}

async fn create_channel(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Json(req): Json<CreateChannelReq>,
) -> ChatResult<impl IntoResponse> {
    let channel = state
        .service
        .create_channel(&who, req.name, req.channel_type.unwrap_or(ChannelType::Group))
        .await?;
    Ok((StatusCode::CREATED, Json(channel)))
}

async fn list_channels(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
) -> ChatResult<impl IntoResponse> {
    Ok(Json(state.service.list_channels(&who).await?))
}

async fn get_channel(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ChatResult<impl IntoResponse> {
    Ok(Json(state.service.get_channel(&who, id).await?))
}

#[derive(Deserialize)]
struct UpdateChannelReq {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    channel_type: Option<ChannelType>,
}

async fn update_channel(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateChannelReq>,
) -> ChatResult<impl IntoResponse> {
    let channel = state
        .service
        .update_channel(&who, id, req.name, req.channel_type)
        .await?;
    Ok(Json(channel))
}

async fn delete_channel(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ChatResult<StatusCode> {
    state.service.delete_channel(&who, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn archive_channel(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ChatResult<impl IntoResponse> {
    Ok(Json(state.service.archive_channel(&who, id).await?))
}

async fn channel_stats(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ChatResult<impl IntoResponse> {
    Ok(Json(state.service.channel_stats(&who, id).await?))
}

async fn list_members(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ChatResult<impl IntoResponse> {
    Ok(Json(state.service.list_members(&who, id).await?))
}

#[derive(Deserialize)]
struct AddMemberReq {
    user_id: Uuid,
}

async fn add_member(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(id): Path<Uuid>,
    Json(req): Json<AddMemberReq>,
) -> ChatResult<impl IntoResponse> {
    let membership = state.service.add_member(&who, id, req.user_id).await?;
    Ok((StatusCode::CREATED, Json(membership)))
}

async fn remove_member(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path((id, user_id)): Path<(Uuid, Uuid)>,
) -> ChatResult<impl IntoResponse> {
    Ok(Json(state.service.remove_member(&who, id, user_id).await?))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    /// `created_at` of the oldest message already shown.
    before: Option<i64>,
    /// Id of the oldest message already shown.
    before_id: Option<Uuid>,
}

impl HistoryQuery {
    fn cursor(&self) -> ChatResult<Option<Cursor>> {
        match (self.before, self.before_id) {
            (Some(_), Some(_)) => Err(ChatError::InvalidInput("cursor")),
            (Some(ts), None) => Ok(Some(Cursor::Timestamp(ts))),
            (None, Some(id)) => Ok(Some(Cursor::Id(id))),
            (None, None) => Ok(None),
        }
    }
}

async fn list_messages(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(id): Path<Uuid>,
    Query(q): Query<HistoryQuery>,
) -> ChatResult<impl IntoResponse> {
    let cursor = q.cursor()?;
    let page = state.service.list_messages(&who, id, cursor, q.limit).await?;
    Ok(Json(page))
}

#[derive(Deserialize)]
struct SendReq {
    content: String,
    #[serde(default)]
    message_type: Option<String>,
}

#[derive(Serialize)]
struct SendResp {
    message: Message,
    degraded: bool,
}

async fn send_message(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendReq>,
) -> ChatResult<impl IntoResponse> {
    let kind = parse_message_type(req.message_type.as_deref())?;
    let sent = state.service.send_message(&who, id, req.content, kind).await?;
    Ok((
        StatusCode::CREATED,
        Json(SendResp {
            message: sent.message,
            degraded: sent.report.degraded,
        }),
    ))
}

#[derive(Deserialize)]
struct EditReq {
    content: String,
}

async fn edit_message(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(id): Path<Uuid>,
    Json(req): Json<EditReq>,
) -> ChatResult<impl IntoResponse> {
    Ok(Json(state.service.edit_message(&who, id, req.content).await?))
}

async fn delete_message(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ChatResult<impl IntoResponse> {
    Ok(Json(state.service.delete_message(&who, id).await?))
}

#[derive(Serialize)]
struct ReadResp {
    message_id: Uuid,
    newly_read: bool,
    read_at: i64,
}

async fn mark_read(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ChatResult<impl IntoResponse> {
    let read = state.service.mark_read(&who, id).await?;
    Ok(Json(ReadResp {
        message_id: id,
        newly_read: read.newly_read,
        read_at: read.receipt.read_at,
    }))
}

async fn delivery_logs(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ChatResult<impl IntoResponse> {
    Ok(Json(state.service.delivery_logs(&who, id).await?))
}

async fn read_receipts(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ChatResult<impl IntoResponse> {
    Ok(Json(state.service.read_receipts(&who, id).await?))
}

async fn notifications(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
) -> ChatResult<impl IntoResponse> {
    Ok(Json(state.service.unread_notifications(&who).await?))
}

async fn mark_notification_read(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ChatResult<impl IntoResponse> {
    Ok(Json(state.service.mark_notification_read(&who, id).await?))
}

#[derive(Serialize)]
struct UpdatedResp {
    updated: usize,
}

async fn mark_channel_read(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ChatResult<impl IntoResponse> {
    let updated = state.service.mark_channel_notifications_read(&who, id).await?;
    Ok(Json(UpdatedResp { updated }))
}

#[derive(Serialize)]
struct UnreadResp {
    channel_id: Uuid,
    unread: u32,
}

async fn unread_count(
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ChatResult<impl IntoResponse> {
    let unread = state.service.unread_count(&who, id).await?;
    Ok(Json(UnreadResp { channel_id: id, unread }))
}

async fn ws_handler(
    upgrade: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(who): Extension<Identity>,
) -> impl IntoResponse {
    let service = state.service.clone();
    upgrade.on_upgrade(move |socket| ws::handle_socket(socket, service, who))
}

/// Run the HTTP server on the configured address.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config.bind.parse().context("invalid bind address")?;
    let state = AppState::new(config).await?;
    tracing::info!(%addr, "chat_delivery listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::issue_jwt;
    use crate::fanout::FanoutPolicy;
    use axum::body::Body;
    use std::time::Duration;
    use tower::ServiceExt;

    fn config(tmp: &tempfile::TempDir) -> Config {
        Config {
            bind: "127.0.0.1:0".into(),
            data_dir: tmp.path().to_path_buf(),
            logging_enabled: false,
            jwt_secret: "secret".into(),
            store_timeout: Duration::from_secs(2),
            fanout: FanoutPolicy::default(),
            presence_debounce: Duration::from_millis(10),
        }
    }

    fn token() -> String {
        let who = Identity {
            user_id: Uuid::new_v4(),
            username: "alice".into(),
            organization_id: Uuid::new_v4(),
        };
        issue_jwt(b"secret", &who, time::Duration::minutes(5)).unwrap()
    }

    #[tokio::test]
    async fn health_is_public_and_rest_is_not() {
        let tmp = tempfile::tempdir().unwrap();
        let app = build_router(AppState::new(config(&tmp)).await.unwrap());
        let resp = app
            .clone()
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(Request::get("/api/channels").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(
                Request::get(format!("/api/channels?token={}", token()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_channel_maps_to_404_body() {
        let tmp = tempfile::tempdir().unwrap();
        let app = build_router(AppState::new(config(&tmp)).await.unwrap());
        let resp = app
            .oneshot(
                Request::get(format!("/api/channels/{}", Uuid::new_v4()))
                    .header(header::AUTHORIZATION, format!("Bearer {}", token()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let body: chat_protocol::ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.code, "not_found");
    }

    #[test]
    fn both_cursors_are_rejected() {
        let q = HistoryQuery {
            limit: None,
            before: Some(1),
            before_id: Some(Uuid::new_v4()),
        };
        assert!(matches!(q.cursor(), Err(ChatError::InvalidInput("cursor"))));
    }
}
