//! Terminal-facing `/iclock` endpoints. Every response is `200 text/plain`
//! with a protocol token, an options block, or a single command line.

use crate::api::types::IclockQuery;
use crate::protocol::{ProtocolReply, PushMeta};
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::header,
    response::IntoResponse,
};
use std::net::SocketAddr;
use tracing::{error, instrument};

fn text_reply(reply: ProtocolReply) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], reply.render())
}

fn join_failed(e: tokio::task::JoinError) -> ProtocolReply {
    error!(error = %e, "Task join error");
    ProtocolReply::Error(e.to_string())
}

/// `/iclock/cdata`: heartbeats and data uploads
#[instrument(skip(state, query, connect_info, body), fields(serial = ?query.serial, table = ?query.table))]
pub async fn cdata(
    State(state): State<AppState>,
    Query(query): Query<IclockQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> impl IntoResponse {
    let peer = connect_info.map(|ConnectInfo(addr)| addr.ip().to_string());
    text_reply(push(state, query, peer, body).await)
}

/// `/iclock/getrequest`: command polling
#[instrument(skip(state, query), fields(serial = ?query.serial))]
pub async fn getrequest(
    State(state): State<AppState>,
    Query(query): Query<IclockQuery>,
) -> impl IntoResponse {
    text_reply(poll(state, query).await)
}

/// `/iclock/devicecmd`: command results
#[instrument(skip(state, query, body), fields(serial = ?query.serial))]
pub async fn devicecmd(
    State(state): State<AppState>,
    Query(query): Query<IclockQuery>,
    body: Bytes,
) -> impl IntoResponse {
    text_reply(command_result(state, query, body).await)
}

/// Any other `/iclock/*` path. Terminals append suffixes (`cdata.aspx`,
/// `getrequest.php`) so the path is matched by content rather than rejected.
#[instrument(skip(state, query, connect_info, body))]
pub async fn fallback(
    State(state): State<AppState>,
    Path(rest): Path<String>,
    Query(query): Query<IclockQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> impl IntoResponse {
    let path = rest.to_ascii_lowercase();
    let reply = if path.contains("getrequest") {
        poll(state, query).await
    } else if path.contains("devicecmd") {
        command_result(state, query, body).await
    } else {
        let peer = connect_info.map(|ConnectInfo(addr)| addr.ip().to_string());
        push(state, query, peer, body).await
    };
    text_reply(reply)
}

async fn push(state: AppState, query: IclockQuery, peer: Option<String>, body: Bytes) -> ProtocolReply {
    let meta = PushMeta {
        serial: query.serial.unwrap_or_default(),
        table: query.table,
        command: query.command,
        options: query.options,
        push_version: query.pushver,
        language: query.language,
    };
    let body = String::from_utf8_lossy(&body).into_owned();

    tokio::task::spawn_blocking(move || state.gateway.handle_push(&meta, &body, peer.as_deref()))
        .await
        .unwrap_or_else(join_failed)
}

async fn poll(state: AppState, query: IclockQuery) -> ProtocolReply {
    let serial = query.serial.unwrap_or_default();
    tokio::task::spawn_blocking(move || state.gateway.handle_poll(&serial, query.info.as_deref()))
        .await
        .unwrap_or_else(join_failed)
}

async fn command_result(state: AppState, query: IclockQuery, body: Bytes) -> ProtocolReply {
    let serial = query.serial.unwrap_or_default();
    let body = String::from_utf8_lossy(&body).into_owned();
    tokio::task::spawn_blocking(move || state.gateway.handle_command_result(&serial, &body))
        .await
        .unwrap_or_else(join_failed)
}
