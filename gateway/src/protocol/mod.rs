//! Terminal push protocol ("iClock" / ADMS family)
//!
//! Requests carry their metadata in the query string (`SN`, `table`, `c`)
//! and tab/newline delimited records in the body. Every response is a plain
//! text body: `OK`, `ERROR`, an options block, or one command line.
//!
//! The parser turns bodies into explicit tagged records; lines that do not
//! fit a known shape are reported back as malformed rather than guessed at.

pub mod parser;

use crate::services::registry::DeviceMetadata;
use time::PrimitiveDateTime;

pub use parser::{
    parse_attendance_line, parse_command_reports, parse_device_info, parse_operation_line,
    parse_push, parse_registry_options,
};

/// Request metadata from the push URL
#[derive(Debug, Clone, Default)]
pub struct PushMeta {
    pub serial: String,
    pub table: Option<String>,
    pub command: Option<String>,
    /// `options=all` on the startup handshake
    pub options: Option<String>,
    pub push_version: Option<String>,
    pub language: Option<String>,
}

/// One decoded push, by payload kind
#[derive(Debug, Clone, PartialEq)]
pub enum PushPayload {
    /// `table=options`, `c=registry`, or an empty body
    Heartbeat(DeviceMetadata),
    /// `table=ATTLOG`
    Attendance(ParsedBatch<AttendanceLine>),
    /// `table=OPERLOG` or `table=USER`
    Operations(ParsedBatch<OperationLine>),
    /// A table this gateway does not consume
    Unsupported { table: String },
}

/// Records that parsed plus the raw lines that did not
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBatch<T> {
    pub records: Vec<T>,
    pub malformed: Vec<String>,
}

impl<T> Default for ParsedBatch<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            malformed: Vec::new(),
        }
    }
}

/// One ATTLOG line, fields still as sent by the terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceLine {
    pub pin: String,
    pub timestamp: String,
    /// Punch-type code (`Status`)
    pub status_code: Option<String>,
    pub verify_code: Option<String>,
    pub work_code: Option<String>,
    /// The line exactly as received (trailing whitespace trimmed)
    pub raw: String,
}

/// One OPERLOG / USER line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationLine {
    /// `OPLOG <code>\t<admin>\t<time>\t...`
    OpLog {
        code: String,
        admin_pin: String,
        time: String,
    },
    /// `USER PIN=..\tName=..\tPri=..\tCard=..`
    User {
        pin: String,
        name: Option<String>,
        privilege: Option<String>,
        card: Option<String>,
    },
    /// `FP PIN=..\tFID=..\t...`
    Fingerprint { pin: String, finger_index: Option<String> },
}

/// Outcome line from `/iclock/devicecmd`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReport {
    pub command_id: i64,
    pub return_code: Option<i64>,
    pub command: Option<String>,
    pub raw: String,
}

impl CommandReport {
    /// The firmware reports failures as negative return codes
    pub fn succeeded(&self) -> bool {
        self.return_code.map_or(false, |code| code >= 0)
    }
}

/// Values echoed back on a heartbeat
#[derive(Debug, Clone)]
pub struct OptionsEcho {
    pub server_time: PrimitiveDateTime,
    pub error_delay_secs: u64,
    pub poll_interval_secs: u64,
    pub utc_offset_minutes: i32,
}

/// Protocol-legal response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolReply {
    Ok,
    /// Rendered as the bare error token; the reason is only logged
    Error(String),
    Options(String),
    Command { id: i64, payload: String },
}

pub const OK_TOKEN: &str = "OK";
pub const ERROR_TOKEN: &str = "ERROR";

impl ProtocolReply {
    pub fn render(&self) -> String {
        match self {
            ProtocolReply::Ok => OK_TOKEN.to_string(),
            ProtocolReply::Error(_) => ERROR_TOKEN.to_string(),
            ProtocolReply::Options(body) => body.clone(),
            ProtocolReply::Command { id, payload } => format_command(*id, payload),
        }
    }
}

/// `C:<id>:<instruction>`
pub fn format_command(id: i64, payload: &str) -> String {
    format!("C:{}:{}", id, payload)
}

/// Longest name the terminal's user table accepts
pub const MAX_USER_NAME_CHARS: usize = 24;

/// Instruction creating or replacing a user on the terminal
pub fn user_upsert_instruction(pin: &str, name: &str, privilege: u8, card: Option<&str>) -> String {
    let name: String = name.chars().filter(|c| *c != '\t').take(MAX_USER_NAME_CHARS).collect();
    let mut instruction = format!("DATA USER PIN={}\tName={}\tPri={}", pin, name, privilege);
    if let Some(card) = card.filter(|c| !c.is_empty()) {
        instruction.push_str(&format!("\tCard={}", card));
    }
    instruction
}

/// Instruction removing a user from the terminal
pub fn user_delete_instruction(pin: &str) -> String {
    format!("DATA DEL USER PIN={}", pin)
}

/// Options block sent in reply to a heartbeat
pub fn render_options(serial: &str, echo: &OptionsEcho) -> String {
    let server_time = crate::punch::format_punch_time(echo.server_time).replacen('T', " ", 1);
    [
        format!("GET OPTION FROM: {}", serial),
        format!("ServerTime={}", server_time),
        "Stamp=0".to_string(),
        "OpStamp=0".to_string(),
        format!("ErrorDelay={}", echo.error_delay_secs),
        format!("Delay={}", echo.poll_interval_secs),
        "TransTimes=00:00;14:05".to_string(),
        "TransInterval=1".to_string(),
        "TransFlag=TransData AttLog\tOpLog\tEnrollUser\tChgUser\tEnrollFP\tChgFP".to_string(),
        format!("TimeZone={}", echo.utc_offset_minutes / 60),
        "Realtime=1".to_string(),
        "Encrypt=0".to_string(),
    ]
    .join("\r\n")
}
