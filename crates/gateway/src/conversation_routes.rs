//! Conversation membership, room moderation, and per-member view state
//! endpoints (spec §6.1 "Conversation operations").

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::{auth_extractor::AuthedSession, conversation_store::ConversationRow, error::ApiError, rate_limiter::{Action, hash_key}, state::Runtime};

pub fn conversation_router() -> Router<Arc<Runtime>> {
    Router::new()
        .route("/v1/dms/create", post(dms_create))
        .route("/v1/rooms/create", post(rooms_create))
        .route("/v1/rooms/invite", post(rooms_invite))
        .route("/v1/rooms/remove", post(rooms_remove))
        .route("/v1/rooms/ban", post(rooms_ban))
        .route("/v1/rooms/unban", post(rooms_unban))
        .route("/v1/rooms/promote", post(rooms_promote))
        .route("/v1/rooms/demote", post(rooms_demote))
        .route("/v1/rooms/mute", post(rooms_mute))
        .route("/v1/rooms/unmute", post(rooms_unmute))
        .route("/v1/rooms/members", get(rooms_members))
        .route("/v1/rooms/bans", get(rooms_bans))
        .route("/v1/rooms/mutes", get(rooms_mutes))
        .route("/v1/conversations", get(list_conversations))
        .route("/v1/conversations/title", post(set_title))
        .route("/v1/conversations/label", post(set_label))
        .route("/v1/conversations/pin", post(set_pin))
        .route("/v1/conversations/mute", post(set_mute))
        .route("/v1/conversations/archive", post(set_archive))
        .route("/v1/conversations/mark_read", post(mark_read))
        .route("/v1/conversations/mark_all_read", post(mark_all_read))
}

#[derive(Deserialize)]
struct DmCreateRequest {
    peer_user_id: String,
    conv_id: String,
}

#[derive(Serialize)]
struct DmCreateResponse {
    conv_id: String,
}

async fn dms_create(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<DmCreateRequest>,
) -> Result<Json<DmCreateResponse>, ApiError> {
    if state.presence.is_blocked(&session.device_id, &req.peer_user_id) {
        return Err(ApiError::forbidden("blocked"));
    }
    let limit_key = hash_key(&session.user_id);
    if matches!(
        state.rate_limiter.check(Action::DmCreate, limit_key),
        crate::rate_limiter::Decision::Denied { .. }
    ) {
        return Err(ApiError::rate_limited("rate limit exceeded", 60));
    }
    state
        .convs
        .create(
            &req.conv_id,
            &session.user_id,
            &[req.peer_user_id],
            &session.device_id,
            crate::state::now_ms(),
        )
        .await?;
    Ok(Json(DmCreateResponse { conv_id: req.conv_id }))
}

#[derive(Deserialize)]
struct RoomCreateRequest {
    conv_id: String,
    #[serde(default)]
    members: Vec<String>,
}

#[derive(Serialize)]
struct RoomCreateResponse {
    conv_id: String,
}

async fn rooms_create(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<RoomCreateRequest>,
) -> Result<Json<RoomCreateResponse>, ApiError> {
    state
        .convs
        .create(
            &req.conv_id,
            &session.user_id,
            &req.members,
            &session.device_id,
            crate::state::now_ms(),
        )
        .await?;
    Ok(Json(RoomCreateResponse { conv_id: req.conv_id }))
}

#[derive(Deserialize)]
struct MembersRequest {
    conv_id: String,
    #[serde(default)]
    members: Vec<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
}

async fn rooms_invite(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<MembersRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.convs.invite(&req.conv_id, &session.user_id, &req.members).await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

async fn rooms_remove(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<MembersRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.convs.remove(&req.conv_id, &session.user_id, &req.members).await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

async fn rooms_ban(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<MembersRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state
        .convs
        .ban(&req.conv_id, &session.user_id, &req.members, crate::state::now_ms())
        .await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

async fn rooms_unban(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<MembersRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.convs.unban(&req.conv_id, &session.user_id, &req.members).await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

async fn rooms_promote(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<MembersRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.convs.promote_admin(&req.conv_id, &session.user_id, &req.members).await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

async fn rooms_demote(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<MembersRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.convs.demote_admin(&req.conv_id, &session.user_id, &req.members).await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

async fn rooms_mute(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<MembersRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state
        .convs
        .mute_members(&req.conv_id, &session.user_id, &req.members, crate::state::now_ms())
        .await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

async fn rooms_unmute(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<MembersRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.convs.unmute_members(&req.conv_id, &session.user_id, &req.members).await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

#[derive(Deserialize)]
struct ConvIdQuery {
    conv_id: String,
}

#[derive(Serialize)]
struct MembersResponse {
    members: Vec<crate::conversation_store::MemberRow>,
}

async fn rooms_members(
    State(state): State<Arc<Runtime>>,
    AuthedSession(_session): AuthedSession,
    Query(q): Query<ConvIdQuery>,
) -> Result<Json<MembersResponse>, ApiError> {
    let members = state.convs.list_members(&q.conv_id).await?;
    Ok(Json(MembersResponse { members }))
}

#[derive(Serialize)]
struct BansResponse {
    bans: Vec<String>,
}

async fn rooms_bans(
    State(state): State<Arc<Runtime>>,
    AuthedSession(_session): AuthedSession,
    Query(q): Query<ConvIdQuery>,
) -> Result<Json<BansResponse>, ApiError> {
    let bans = state.convs.list_bans(&q.conv_id).await?;
    Ok(Json(BansResponse { bans }))
}

#[derive(Serialize)]
struct MutesResponse {
    mutes: Vec<String>,
}

async fn rooms_mutes(
    State(state): State<Arc<Runtime>>,
    AuthedSession(_session): AuthedSession,
    Query(q): Query<ConvIdQuery>,
) -> Result<Json<MutesResponse>, ApiError> {
    let mutes = state.convs.list_muted_members(&q.conv_id).await?;
    Ok(Json(MutesResponse { mutes }))
}

#[derive(Deserialize)]
struct ListConversationsQuery {
    #[serde(default)]
    include_archived: Option<u8>,
}

#[derive(Serialize)]
struct ListConversationsResponse {
    items: Vec<ConversationRow>,
}

async fn list_conversations(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Query(q): Query<ListConversationsQuery>,
) -> Result<Json<ListConversationsResponse>, ApiError> {
    let include_archived = q.include_archived.unwrap_or(0) == 1;
    let items = state
        .convs
        .list_for_user(&session.user_id)
        .await?
        .into_iter()
        .filter(|row| include_archived || !row.archived)
        .collect();
    Ok(Json(ListConversationsResponse { items }))
}

#[derive(Deserialize)]
struct TitleRequest {
    conv_id: String,
    title: String,
}

async fn set_title(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<TitleRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.convs.set_title(&req.conv_id, &session.user_id, &req.title).await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

#[derive(Deserialize)]
struct LabelRequest {
    conv_id: String,
    label: String,
}

async fn set_label(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<LabelRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state
        .convs
        .set_label(&req.conv_id, &session.user_id, &req.label, crate::state::now_ms())
        .await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

#[derive(Deserialize)]
struct PinRequest {
    conv_id: String,
    pinned: bool,
}

async fn set_pin(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<PinRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state
        .convs
        .set_pinned(&req.conv_id, &session.user_id, req.pinned, crate::state::now_ms())
        .await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

#[derive(Deserialize)]
struct MuteRequest {
    conv_id: String,
    muted: bool,
}

async fn set_mute(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<MuteRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state
        .convs
        .set_muted(&req.conv_id, &session.user_id, req.muted, crate::state::now_ms())
        .await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

#[derive(Deserialize)]
struct ArchiveRequest {
    conv_id: String,
    archived: bool,
}

async fn set_archive(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<ArchiveRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state
        .convs
        .set_archived(&req.conv_id, &session.user_id, req.archived, crate::state::now_ms())
        .await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

#[derive(Deserialize)]
struct MarkReadRequest {
    conv_id: String,
    #[serde(default)]
    to_seq: Option<i64>,
}

#[derive(Serialize)]
struct MarkReadResponse {
    status: &'static str,
    conv_id: String,
    last_read_seq: i64,
    unread_count: i64,
}

async fn mark_read(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
    Json(req): Json<MarkReadRequest>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let bounds = state.conv_log.bounds(&req.conv_id).await?;
    let last_read_seq = state
        .convs
        .mark_read(
            &req.conv_id,
            &session.user_id,
            req.to_seq,
            crate::state::now_ms(),
            bounds.latest_seq,
            bounds.earliest_seq,
        )
        .await?;
    let unread_count = bounds.latest_seq.map(|l| (l - last_read_seq).max(0)).unwrap_or(0);
    Ok(Json(MarkReadResponse {
        status: "ok",
        conv_id: req.conv_id,
        last_read_seq,
        unread_count,
    }))
}

#[derive(Serialize)]
struct MarkAllReadResponse {
    status: &'static str,
    conv_count: usize,
}

async fn mark_all_read(
    State(state): State<Arc<Runtime>>,
    AuthedSession(session): AuthedSession,
) -> Result<Json<MarkAllReadResponse>, ApiError> {
    let conv_count = state.convs.mark_all_read(&session.user_id, crate::state::now_ms()).await?;
    Ok(Json(MarkAllReadResponse { status: "ok", conv_count }))
}
