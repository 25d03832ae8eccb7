use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::types::{
    CommandListQuery, CommandResponse, DeleteResponse, EnqueueCommandRequest, EnqueueUserRequest, PunchTypeQuery,
    PunchTypeResponse, SweepResponse,
};
use crate::db::models::{Command, CommandStatus, Device, PunchRecord, TimeWindowRule};
use crate::protocol::{user_delete_instruction, user_upsert_instruction};
use crate::punch::{format_punch_time, parse_punch_time};
use crate::services::classifier;
use crate::services::ingestion::PunchFilter;
use crate::services::time_windows::NewTimeWindow;
use crate::state::AppState;
use tracing::instrument;

/// Health check endpoint
#[instrument]
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "healthy")
}

/// List all devices with their derived status
#[instrument(skip(state))]
pub async fn list_devices(State(state): State<AppState>) -> ApiResult<Json<Vec<Device>>> {
    let devices = tokio::task::spawn_blocking(move || state.registry.list_all()).await??;
    Ok(Json(devices))
}

#[instrument(skip(state))]
pub async fn get_device(
    State(state): State<AppState>,
    Path(serial): Path<String>,
) -> ApiResult<Json<Device>> {
    let device = tokio::task::spawn_blocking(move || state.registry.get(&serial)).await??;
    Ok(Json(device))
}

/// Command history for a device
#[instrument(skip(state))]
pub async fn list_commands(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    Query(query): Query<CommandListQuery>,
) -> ApiResult<Json<Vec<Command>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<CommandStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let commands = tokio::task::spawn_blocking(move || {
        state.registry.get(&serial)?;
        state.queue.list_for_device(&serial, status)
    })
    .await??;
    Ok(Json(commands))
}

/// Queue a raw instruction for a device
#[instrument(skip(state, req))]
pub async fn enqueue_command(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    Json(req): Json<EnqueueCommandRequest>,
) -> ApiResult<(StatusCode, Json<CommandResponse>)> {
    enqueue_for_device(state, serial, req.command, "command.enqueue").await
}

/// Queue a user upsert for a device
#[instrument(skip(state, req), fields(pin = %req.pin))]
pub async fn enqueue_user(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    Json(req): Json<EnqueueUserRequest>,
) -> ApiResult<(StatusCode, Json<CommandResponse>)> {
    validate_pin(&req.pin)?;
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name cannot be empty".into()));
    }
    let instruction =
        user_upsert_instruction(req.pin.trim(), req.name.trim(), req.privilege, req.card.as_deref());
    enqueue_for_device(state, serial, instruction, "user.upsert").await
}

/// Queue a user removal for a device
#[instrument(skip(state))]
pub async fn delete_user(
    State(state): State<AppState>,
    Path((serial, pin)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<CommandResponse>)> {
    validate_pin(&pin)?;
    enqueue_for_device(state, serial, user_delete_instruction(pin.trim()), "user.delete").await
}

async fn enqueue_for_device(
    state: AppState,
    serial: String,
    instruction: String,
    action: &'static str,
) -> ApiResult<(StatusCode, Json<CommandResponse>)> {
    let command = tokio::task::spawn_blocking(move || {
        // Only known terminals get commands
        state.registry.get(&serial)?;
        let command = state.queue.enqueue(&serial, &instruction)?;
        state.audit.record(
            action,
            &format!("device:{}", serial),
            &format!("command_id={} payload={}", command.id, command.payload),
        );
        Ok::<_, crate::errors::GatewayError>(command)
    })
    .await??;

    Ok((
        StatusCode::CREATED,
        Json(CommandResponse {
            success: true,
            command,
        }),
    ))
}

fn validate_pin(pin: &str) -> ApiResult<()> {
    let pin = pin.trim();
    if pin.is_empty() || pin.contains(|c: char| c.is_whitespace() || c == '=') {
        return Err(ApiError::BadRequest(format!("Invalid PIN: {:?}", pin)));
    }
    Ok(())
}

/// Stored punches, newest first
#[instrument(skip(state))]
pub async fn list_punches(
    State(state): State<AppState>,
    Query(filter): Query<PunchFilter>,
) -> ApiResult<Json<Vec<PunchRecord>>> {
    let punches = tokio::task::spawn_blocking(move || state.ingestor.list(&filter)).await??;
    Ok(Json(punches))
}

#[instrument(skip(state))]
pub async fn list_time_windows(State(state): State<AppState>) -> ApiResult<Json<Vec<TimeWindowRule>>> {
    let rules = tokio::task::spawn_blocking(move || state.time_windows.list(false)).await??;
    Ok(Json(rules))
}

#[instrument(skip(state, req))]
pub async fn create_time_window(
    State(state): State<AppState>,
    Json(req): Json<NewTimeWindow>,
) -> ApiResult<(StatusCode, Json<TimeWindowRule>)> {
    let rule = tokio::task::spawn_blocking(move || {
        let rule = state.time_windows.create(&req)?;
        state.audit.record(
            "time_window.create",
            &format!("time_window:{}", rule.id),
            &format!("{} {}", rule.punch_type, rule.days_column()),
        );
        Ok::<_, crate::errors::GatewayError>(rule)
    })
    .await??;
    Ok((StatusCode::CREATED, Json(rule)))
}

/// Replace a rule; toggling `active` is how stock windows are switched off
#[instrument(skip(state, req))]
pub async fn update_time_window(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<NewTimeWindow>,
) -> ApiResult<Json<TimeWindowRule>> {
    let rule = tokio::task::spawn_blocking(move || {
        let rule = state.time_windows.update(id, &req)?;
        state.audit.record(
            "time_window.update",
            &format!("time_window:{}", rule.id),
            &format!("{} {} active={}", rule.punch_type, rule.days_column(), rule.active),
        );
        Ok::<_, crate::errors::GatewayError>(rule)
    })
    .await??;
    Ok(Json(rule))
}

#[instrument(skip(state))]
pub async fn delete_time_window(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<DeleteResponse>> {
    tokio::task::spawn_blocking(move || {
        state.time_windows.delete(id)?;
        state
            .audit
            .record("time_window.delete", &format!("time_window:{}", id), "");
        Ok::<_, crate::errors::GatewayError>(())
    })
    .await??;
    Ok(Json(DeleteResponse {
        success: true,
        message: format!("Time window {} deleted", id),
    }))
}

/// Classify a wall-clock instant against the active rules without storing anything
#[instrument(skip(state))]
pub async fn classify_punch(
    State(state): State<AppState>,
    Query(query): Query<PunchTypeQuery>,
) -> ApiResult<Json<PunchTypeResponse>> {
    let at = parse_punch_time(&query.at)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid timestamp: {}", query.at)))?;

    let rules = tokio::task::spawn_blocking(move || state.time_windows.list(true)).await??;
    Ok(Json(PunchTypeResponse {
        at: format_punch_time(at),
        punch_type: classifier::classify(at, &rules),
    }))
}

/// Run the stale-command sweep now with the configured timeout
#[instrument(skip(state))]
pub async fn sweep_commands(State(state): State<AppState>) -> ApiResult<Json<SweepResponse>> {
    let timeout = state.stale_timeout;
    let swept = tokio::task::spawn_blocking(move || state.queue.sweep_stale(timeout)).await??;
    Ok(Json(SweepResponse {
        success: true,
        swept,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::create_test_db;

    fn state() -> AppState {
        AppState::new(create_test_db(), &Config::default())
    }

    #[tokio::test]
    async fn test_enqueue_for_unknown_device_is_not_found() {
        let result = enqueue_command(
            State(state()),
            Path("T404".to_string()),
            Json(EnqueueCommandRequest {
                command: "INFO".into(),
            }),
        )
        .await;

        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_enqueue_user_builds_instruction() {
        let state = state();
        state.registry.mark_seen("T001").unwrap();

        let (status, Json(response)) = enqueue_user(
            State(state.clone()),
            Path("T001".to_string()),
            Json(EnqueueUserRequest {
                pin: "1001".into(),
                name: "Ana Lima".into(),
                privilege: 0,
                card: Some("998877".into()),
            }),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(
            response.command.payload,
            "DATA USER PIN=1001\tName=Ana Lima\tPri=0\tCard=998877"
        );
        assert_eq!(response.command.status, CommandStatus::Pending);
    }

    #[tokio::test]
    async fn test_delete_user_rejects_bad_pin() {
        let state = state();
        state.registry.mark_seen("T001").unwrap();

        let result = delete_user(
            State(state),
            Path(("T001".to_string(), "10 01".to_string())),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_list_commands_bad_status() {
        let result = list_commands(
            State(state()),
            Path("T001".to_string()),
            Query(CommandListQuery {
                status: Some("queued".into()),
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_classify_punch_without_rules() {
        let Json(response) = classify_punch(
            State(state()),
            Query(PunchTypeQuery {
                at: "2024-03-04T08:55:00".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.punch_type, None);
        assert_eq!(response.at, "2024-03-04T08:55:00");
    }

    #[tokio::test]
    async fn test_time_window_update_and_delete() {
        let state = state();
        let rule: NewTimeWindow =
            serde_json::from_str(r#"{"punch_type":"CHECK_IN","start_time":"06:00","end_time":"10:00"}"#)
                .unwrap();
        let (_, Json(created)) = create_time_window(State(state.clone()), Json(rule.clone()))
            .await
            .unwrap();

        let mut disabled = rule;
        disabled.active = false;
        let Json(updated) = update_time_window(State(state.clone()), Path(created.id), Json(disabled))
            .await
            .unwrap();
        assert!(!updated.active);
        assert!(state.time_windows.list(true).unwrap().is_empty());

        let Json(deleted) = delete_time_window(State(state.clone()), Path(created.id))
            .await
            .unwrap();
        assert!(deleted.success);

        let missing = delete_time_window(State(state), Path(created.id)).await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = health_check().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
