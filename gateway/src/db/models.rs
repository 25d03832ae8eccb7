use crate::punch::PunchType;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, Time};

/// Format a UTC instant the way every timestamp column stores it
pub fn format_timestamp(at: OffsetDateTime) -> Result<String, time::error::Format> {
    at.format(&Rfc3339)
}

/// Read back a timestamp column
pub fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(raw, &Rfc3339)
}

/// Terminal registered with the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub serial_number: String,
    pub display_name: Option<String>,
    pub network_address: Option<String>,
    pub firmware_version: Option<String>,
    /// Derived from `last_seen` when the row is read
    pub status: DeviceStatus,
    pub last_seen: String,           // RFC 3339
    pub last_error: Option<String>,
    pub config: serde_json::Value,   // options reported by the terminal
    pub created_at: String,
}

/// Device status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error => "error",
        }
    }
}

/// One stored punch. Rows are never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunchRecord {
    pub id: i64,
    pub device_serial: String,
    pub employee_pin: String,
    pub employee_name: Option<String>,
    pub department: Option<String>,
    pub punch_time: String, // device wall clock, YYYY-MM-DDTHH:MM:SS
    pub punch_type: Option<PunchType>,
    pub verify_method: Option<String>,
    pub work_code: Option<String>,
    pub raw_payload: String,
    pub created_at: String,
}

/// Time-of-day window mapping punches to a punch type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindowRule {
    pub id: i64,
    pub punch_type: PunchType,
    #[serde(with = "clock_time")]
    pub start_time: Time,
    /// Exclusive. A value before `start_time` wraps past midnight.
    #[serde(with = "clock_time")]
    pub end_time: Time,
    /// 0 = Monday ... 6 = Sunday
    pub days_of_week: Vec<u8>,
    /// Lower wins
    pub priority: i64,
    pub active: bool,
    pub description: Option<String>,
}

impl TimeWindowRule {
    /// Serialise `days_of_week` for the `time_window_rules.days_of_week` column
    pub fn days_column(&self) -> String {
        self.days_of_week
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Parse the `days_of_week` column (`"0,1,2,3,4"`)
pub fn parse_days_column(raw: &str) -> Result<Vec<u8>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| match d.parse::<u8>() {
            Ok(day) if day <= 6 => Ok(day),
            _ => Err(format!("Invalid day of week: {}", d)),
        })
        .collect()
}

/// Queued instruction for a terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: i64,
    pub device_serial: String,
    pub payload: String,
    pub status: CommandStatus,
    /// Number of times the command has been handed to the terminal
    pub attempts: u32,
    pub result: Option<String>,
    pub created_at: String,
    pub sent_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Command lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }
}

impl std::str::FromStr for CommandStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "sent" => Ok(CommandStatus::Sent),
            "completed" => Ok(CommandStatus::Completed),
            "failed" => Ok(CommandStatus::Failed),
            _ => Err(format!("Invalid command status: {}", s)),
        }
    }
}

/// Directory entry used to denormalise punches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub pin: String,
    pub name: String,
    pub department: Option<String>,
}

/// `HH:MM` (seconds accepted on input) serde adapter for rule boundaries
pub mod clock_time {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::macros::format_description;
    use time::Time;

    pub fn format(t: Time) -> String {
        format!("{:02}:{:02}", t.hour(), t.minute())
    }

    pub fn parse(raw: &str) -> Result<Time, String> {
        let raw = raw.trim();
        Time::parse(raw, format_description!("[hour]:[minute]:[second]"))
            .or_else(|_| Time::parse(raw, format_description!("[hour]:[minute]")))
            .map_err(|_| format!("Invalid time of day: {}", raw))
    }

    pub fn serialize<S: Serializer>(t: &Time, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Time, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::time;

    #[test]
    fn test_command_status_roundtrip_strings() {
        for status in [
            CommandStatus::Pending,
            CommandStatus::Sent,
            CommandStatus::Completed,
            CommandStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<CommandStatus>().unwrap(), status);
        }
        assert!("queued".parse::<CommandStatus>().is_err());
        assert!(CommandStatus::Failed.is_terminal());
        assert!(!CommandStatus::Sent.is_terminal());
    }

    #[test]
    fn test_parse_days_column() {
        assert_eq!(parse_days_column("0,1, 2,3,4").unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(parse_days_column("").unwrap(), Vec::<u8>::new());
        assert!(parse_days_column("0,7").is_err());
        assert!(parse_days_column("mon").is_err());
    }

    #[test]
    fn test_clock_time_parse() {
        assert_eq!(clock_time::parse("06:00").unwrap(), time!(06:00));
        assert_eq!(clock_time::parse("23:59:30").unwrap(), time!(23:59:30));
        assert!(clock_time::parse("24:00").is_err());
        assert_eq!(clock_time::format(time!(22:05)), "22:05");
    }

    #[test]
    fn test_rule_json_shape() {
        let rule = TimeWindowRule {
            id: 1,
            punch_type: PunchType::CheckIn,
            start_time: time!(06:00),
            end_time: time!(10:00),
            days_of_week: vec![0, 1, 2, 3, 4],
            priority: 1,
            active: true,
            description: None,
        };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["punch_type"], "CHECK_IN");
        assert_eq!(json["start_time"], "06:00");
        assert_eq!(rule.days_column(), "0,1,2,3,4");
    }
}
