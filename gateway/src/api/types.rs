use crate::db::models::Command;
use crate::punch::PunchType;
use serde::{Deserialize, Serialize};

/// Query string of every `/iclock/*` request.
///
/// Firmware versions disagree on casing, so the lowercase forms are accepted too.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IclockQuery {
    #[serde(rename = "SN", alias = "sn")]
    pub serial: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(rename = "c", default)]
    pub command: Option<String>,
    #[serde(default)]
    pub options: Option<String>,
    #[serde(default)]
    pub pushver: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(rename = "INFO", alias = "info", default)]
    pub info: Option<String>,
}

/// Request to queue a raw terminal instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueCommandRequest {
    pub command: String,
}

/// Request to create or update a user on a terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueUserRequest {
    pub pin: String,
    pub name: String,
    /// 0 = user, 14 = administrator
    #[serde(default)]
    pub privilege: u8,
    #[serde(default)]
    pub card: Option<String>,
}

/// Response carrying a queued command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    pub command: Command,
}

/// `?status=` filter on a device's command history
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PunchTypeQuery {
    /// `YYYY-MM-DDTHH:MM:SS`
    pub at: String,
}

/// Dry-run classification result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunchTypeResponse {
    pub at: String,
    pub punch_type: Option<PunchType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResponse {
    pub success: bool,
    /// Commands requeued or failed by this sweep
    pub swept: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub message: String,
}
