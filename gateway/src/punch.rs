//! Attendance vocabulary shared by the wire parser, the classifier and storage.
//!
//! The numeric codes are fixed by the terminal firmware's push protocol.

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::PrimitiveDateTime;

/// Kind of clock event a punch represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PunchType {
    CheckIn,
    CheckOut,
    BreakOut,
    BreakIn,
    OvertimeIn,
    OvertimeOut,
}

impl PunchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PunchType::CheckIn => "CHECK_IN",
            PunchType::CheckOut => "CHECK_OUT",
            PunchType::BreakOut => "BREAK_OUT",
            PunchType::BreakIn => "BREAK_IN",
            PunchType::OvertimeIn => "OVERTIME_IN",
            PunchType::OvertimeOut => "OVERTIME_OUT",
        }
    }

    /// Map a terminal `Status` code. Unknown codes are treated as absent.
    pub fn from_device_code(code: &str) -> Option<Self> {
        match code.trim() {
            "0" => Some(PunchType::CheckIn),
            "1" => Some(PunchType::CheckOut),
            "2" => Some(PunchType::BreakOut),
            "3" => Some(PunchType::BreakIn),
            "4" => Some(PunchType::OvertimeIn),
            "5" => Some(PunchType::OvertimeOut),
            _ => None,
        }
    }
}

impl std::fmt::Display for PunchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PunchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CHECK_IN" => Ok(PunchType::CheckIn),
            "CHECK_OUT" => Ok(PunchType::CheckOut),
            "BREAK_OUT" => Ok(PunchType::BreakOut),
            "BREAK_IN" => Ok(PunchType::BreakIn),
            "OVERTIME_IN" => Ok(PunchType::OvertimeIn),
            "OVERTIME_OUT" => Ok(PunchType::OvertimeOut),
            _ => Err(format!("Invalid punch type: {}", s)),
        }
    }
}

/// How the employee identified themselves at the terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyMethod {
    Password,
    Fingerprint,
    Card,
    Face,
    Palm,
    Unknown(String),
}

impl VerifyMethod {
    pub fn from_device_code(code: &str) -> Self {
        match code.trim() {
            "0" => VerifyMethod::Password,
            "1" => VerifyMethod::Fingerprint,
            "2" | "3" => VerifyMethod::Card,
            "4" => VerifyMethod::Face,
            "15" => VerifyMethod::Palm,
            other => VerifyMethod::Unknown(other.to_string()),
        }
    }

    pub fn label(&self) -> String {
        match self {
            VerifyMethod::Password => "PASSWORD".to_string(),
            VerifyMethod::Fingerprint => "FINGERPRINT".to_string(),
            VerifyMethod::Card => "CARD".to_string(),
            VerifyMethod::Face => "FACE".to_string(),
            VerifyMethod::Palm => "PALM".to_string(),
            VerifyMethod::Unknown(code) => format!("UNKNOWN({})", code),
        }
    }
}

/// Canonical storage form of a punch time (device wall clock, no offset)
pub const PUNCH_TIME_FORMAT: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

const DEVICE_TIME_SPACE: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

const DEVICE_MINUTE_SPACE: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]");

const DEVICE_MINUTE_T: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]");

/// Parse a terminal timestamp (`2024-03-04 08:55:00` or `2024-03-04T08:55:00`).
/// Older firmware drops the seconds; those read as `:00`.
pub fn parse_punch_time(raw: &str) -> Option<PrimitiveDateTime> {
    let raw = raw.trim();
    [DEVICE_TIME_SPACE, PUNCH_TIME_FORMAT, DEVICE_MINUTE_SPACE, DEVICE_MINUTE_T]
        .into_iter()
        .find_map(|format| PrimitiveDateTime::parse(raw, format).ok())
}

/// Render a punch time in storage form
pub fn format_punch_time(at: PrimitiveDateTime) -> String {
    // The format only contains numeric components, so formatting cannot fail
    at.format(PUNCH_TIME_FORMAT)
        .unwrap_or_else(|_| at.to_string())
}
