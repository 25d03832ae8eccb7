use super::{AttendanceLine, CommandReport, OperationLine, ParsedBatch, PushMeta, PushPayload};
use crate::services::registry::DeviceMetadata;
use std::collections::HashMap;

/// Decode a push request into its payload kind.
///
/// Table names are matched case-insensitively. A push with no table and no
/// body is a heartbeat.
pub fn parse_push(meta: &PushMeta, body: &str) -> PushPayload {
    let table = meta.table.as_deref().unwrap_or("").trim();
    let command = meta.command.as_deref().unwrap_or("").trim();

    if table.eq_ignore_ascii_case("ATTLOG") {
        return PushPayload::Attendance(parse_lines(body, parse_attendance_line));
    }
    if table.eq_ignore_ascii_case("OPERLOG") || table.eq_ignore_ascii_case("USER") {
        return PushPayload::Operations(parse_lines(body, parse_operation_line));
    }

    let is_heartbeat = table.eq_ignore_ascii_case("options")
        || command.eq_ignore_ascii_case("registry")
        || meta.options.is_some()
        || table.is_empty();

    if is_heartbeat {
        let mut metadata = parse_registry_options(body);
        if let Some(version) = &meta.push_version {
            metadata.config.insert("pushver".into(), version.clone().into());
        }
        if let Some(language) = &meta.language {
            metadata.config.insert("language".into(), language.clone().into());
        }
        return PushPayload::Heartbeat(metadata);
    }

    PushPayload::Unsupported {
        table: table.to_string(),
    }
}

fn parse_lines<T>(body: &str, parse: fn(&str) -> Option<T>) -> ParsedBatch<T> {
    let mut batch = ParsedBatch::default();
    for line in body.lines() {
        let line = line.trim_end_matches(['\r', ' ']);
        if line.trim().is_empty() {
            continue;
        }
        match parse(line) {
            Some(record) => batch.records.push(record),
            None => batch.malformed.push(line.to_string()),
        }
    }
    batch
}

/// Parse one ATTLOG line.
///
/// Positional: `PIN\tDateTime\tStatus\tVerify\tWorkCode\t...`
/// Key/value:  `PIN=..\tDateTime=..\tStatus=..\tVerified=..\tWorkCode=..`
///
/// Needs at least the PIN and DateTime fields. Their contents are checked
/// later by ingestion, so an empty PIN still parses.
pub fn parse_attendance_line(line: &str) -> Option<AttendanceLine> {
    let raw = line.trim_end().to_string();

    if line.contains('=') {
        let fields = key_values(line, &['\t']);
        let pin = fields.get("PIN")?.clone();
        let timestamp = fields.get("DateTime")?.clone();
        return Some(AttendanceLine {
            pin,
            timestamp,
            status_code: non_empty(fields.get("Status")),
            verify_code: non_empty(fields.get("Verified").or_else(|| fields.get("Verify"))),
            work_code: non_empty(fields.get("WorkCode")),
            raw,
        });
    }

    let parts: Vec<&str> = line.split('\t').collect();
    if parts.len() < 2 {
        return None;
    }
    Some(AttendanceLine {
        pin: parts[0].trim().to_string(),
        timestamp: parts[1].trim().to_string(),
        status_code: parts.get(2).and_then(|s| non_empty_str(s)),
        verify_code: parts.get(3).and_then(|s| non_empty_str(s)),
        work_code: parts.get(4).and_then(|s| non_empty_str(s)),
        raw,
    })
}

/// Parse one OPERLOG / USER line. Unknown tags are rejected.
pub fn parse_operation_line(line: &str) -> Option<OperationLine> {
    let line = line.trim();

    // USER table bodies omit the tag
    if line.starts_with("PIN=") {
        return parse_user(line);
    }

    let (tag, rest) = line.split_once(' ')?;
    match tag {
        "OPLOG" => {
            let parts: Vec<&str> = rest.split('\t').map(str::trim).collect();
            if parts.len() < 3 || parts[0].is_empty() {
                return None;
            }
            Some(OperationLine::OpLog {
                code: parts[0].to_string(),
                admin_pin: parts[1].to_string(),
                time: parts[2].to_string(),
            })
        }
        "USER" => parse_user(rest),
        "FP" => {
            let fields = key_values(rest, &['\t']);
            let pin = non_empty(fields.get("PIN"))?;
            Some(OperationLine::Fingerprint {
                pin,
                finger_index: non_empty(fields.get("FID")),
            })
        }
        _ => None,
    }
}

fn parse_user(fields: &str) -> Option<OperationLine> {
    let fields = key_values(fields, &['\t']);
    let pin = non_empty(fields.get("PIN"))?;
    Some(OperationLine::User {
        pin,
        name: non_empty(fields.get("Name")),
        privilege: non_empty(fields.get("Pri").or_else(|| fields.get("Privilege"))),
        card: non_empty(fields.get("Card")),
    })
}

/// Extract device metadata from a registry/options body.
///
/// Pairs are `key=value`, separated by commas, tabs or newlines, and may
/// carry a leading `~`. Recognised keys fill the typed fields; everything
/// else lands in the config blob.
pub fn parse_registry_options(body: &str) -> DeviceMetadata {
    let mut metadata = DeviceMetadata::default();

    for (key, value) in key_values(body, &[',', '\t', '\n', '\r']) {
        if value.is_empty() {
            continue;
        }
        match key.as_str() {
            "DeviceName" => metadata.display_name = Some(value),
            "FirmVer" | "FWVersion" => metadata.firmware_version = Some(value),
            "IPAddress" => metadata.network_address = Some(value),
            _ => {
                metadata.config.insert(key, value.into());
            }
        }
    }
    metadata
}

/// Decode the poll `INFO` parameter:
/// `firmware,users,fingerprints,attendance_records,ip,...`
pub fn parse_device_info(info: &str) -> DeviceMetadata {
    let parts: Vec<&str> = info.split(',').map(str::trim).collect();
    let mut metadata = DeviceMetadata {
        firmware_version: parts.first().and_then(|s| non_empty_str(s)),
        network_address: parts.get(4).and_then(|s| non_empty_str(s)),
        ..Default::default()
    };

    for (index, key) in [(1, "user_count"), (2, "fingerprint_count"), (3, "attlog_count")] {
        if let Some(value) = parts.get(index).and_then(|s| non_empty_str(s)) {
            metadata.config.insert(key.into(), value.into());
        }
    }
    metadata
}

/// Parse `/iclock/devicecmd` bodies: `ID=<id>&Return=<code>&CMD=<name>` per line.
/// Lines without a numeric ID are dropped.
pub fn parse_command_reports(body: &str) -> Vec<CommandReport> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let fields = key_values(line, &['&']);
            let command_id = fields.get("ID")?.parse::<i64>().ok()?;
            Some(CommandReport {
                command_id,
                return_code: fields.get("Return").and_then(|r| r.parse::<i64>().ok()),
                command: non_empty(fields.get("CMD")),
                raw: line.to_string(),
            })
        })
        .collect()
}

fn key_values(input: &str, separators: &[char]) -> HashMap<String, String> {
    input
        .split(|c| separators.contains(&c))
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| {
            (
                key.trim().trim_start_matches('~').to_string(),
                value.trim().to_string(),
            )
        })
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.and_then(|v| non_empty_str(v))
}

fn non_empty_str(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(table: Option<&str>) -> PushMeta {
        PushMeta {
            serial: "T001".into(),
            table: table.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_positional_attendance_line() {
        let line = parse_attendance_line("1001\t2024-03-04 08:55:00\t0\t1\t0\t0\t0\t0\t0\t0").unwrap();
        assert_eq!(line.pin, "1001");
        assert_eq!(line.timestamp, "2024-03-04 08:55:00");
        assert_eq!(line.status_code.as_deref(), Some("0"));
        assert_eq!(line.verify_code.as_deref(), Some("1"));
        assert_eq!(line.work_code.as_deref(), Some("0"));
    }

    #[test]
    fn test_positional_line_without_status() {
        let line = parse_attendance_line("1001\t2024-03-04 08:55:00").unwrap();
        assert!(line.status_code.is_none());
        assert!(line.verify_code.is_none());

        let line = parse_attendance_line("1001\t2024-03-04 08:55:00\t\t1").unwrap();
        assert!(line.status_code.is_none());
        assert_eq!(line.verify_code.as_deref(), Some("1"));
    }

    #[test]
    fn test_key_value_attendance_line() {
        let line =
            parse_attendance_line("PIN=1001\tDateTime=2024-03-04 08:55:00\tVerified=1\tStatus=1").unwrap();
        assert_eq!(line.pin, "1001");
        assert_eq!(line.status_code.as_deref(), Some("1"));
        assert_eq!(line.verify_code.as_deref(), Some("1"));

        assert!(parse_attendance_line("PIN=1001\tVerified=1").is_none());
    }

    #[test]
    fn test_single_field_line_is_malformed() {
        assert!(parse_attendance_line("garbage").is_none());
    }

    #[test]
    fn test_attendance_batch_counts_malformed_lines() {
        let body = "1001\t2024-03-04 08:55:00\t0\t1\n\nnonsense\r\n1002\t2024-03-04 08:56:00\t0\t1\r\n";
        match parse_push(&meta(Some("ATTLOG")), body) {
            PushPayload::Attendance(batch) => {
                assert_eq!(batch.records.len(), 2);
                assert_eq!(batch.malformed, vec!["nonsense".to_string()]);
                assert_eq!(batch.records[1].raw, "1002\t2024-03-04 08:56:00\t0\t1");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_table_names_are_case_insensitive() {
        assert!(matches!(
            parse_push(&meta(Some("attlog")), ""),
            PushPayload::Attendance(_)
        ));
        assert!(matches!(
            parse_push(&meta(Some("OperLog")), ""),
            PushPayload::Operations(_)
        ));
    }

    #[test]
    fn test_heartbeat_shapes() {
        assert!(matches!(parse_push(&meta(None), ""), PushPayload::Heartbeat(_)));
        assert!(matches!(
            parse_push(&meta(Some("options")), ""),
            PushPayload::Heartbeat(_)
        ));

        let registry = PushMeta {
            command: Some("registry".into()),
            push_version: Some("2.4.1".into()),
            ..meta(Some("tabledata"))
        };
        match parse_push(&registry, "~DeviceName=Lobby,FirmVer=Ver 8.0.4,IPAddress=10.0.0.5,MAC=00:17") {
            PushPayload::Heartbeat(metadata) => {
                assert_eq!(metadata.display_name.as_deref(), Some("Lobby"));
                assert_eq!(metadata.firmware_version.as_deref(), Some("Ver 8.0.4"));
                assert_eq!(metadata.network_address.as_deref(), Some("10.0.0.5"));
                assert_eq!(metadata.config["MAC"], "00:17");
                assert_eq!(metadata.config["pushver"], "2.4.1");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_table() {
        assert_eq!(
            parse_push(&meta(Some("ATTPHOTO")), "binary"),
            PushPayload::Unsupported {
                table: "ATTPHOTO".into()
            }
        );
    }

    #[test]
    fn test_operation_lines() {
        assert_eq!(
            parse_operation_line("OPLOG 4\t0\t2024-03-04 08:55:00\t0\t0\t0\t0"),
            Some(OperationLine::OpLog {
                code: "4".into(),
                admin_pin: "0".into(),
                time: "2024-03-04 08:55:00".into(),
            })
        );
        assert_eq!(
            parse_operation_line("USER PIN=1001\tName=Ann Lee\tPri=14\tPasswd=\tCard=\tGrp=1"),
            Some(OperationLine::User {
                pin: "1001".into(),
                name: Some("Ann Lee".into()),
                privilege: Some("14".into()),
                card: None,
            })
        );
        assert_eq!(
            parse_operation_line("PIN=1002\tName=Bo"),
            Some(OperationLine::User {
                pin: "1002".into(),
                name: Some("Bo".into()),
                privilege: None,
                card: None,
            })
        );
        assert!(matches!(
            parse_operation_line("FP PIN=1001\tFID=6\tSize=1024"),
            Some(OperationLine::Fingerprint { .. })
        ));
        assert!(parse_operation_line("BIOPHOTO PIN=1").is_none());
        assert!(parse_operation_line("USER Name=nobody").is_none());
    }

    #[test]
    fn test_parse_device_info() {
        let metadata = parse_device_info("Ver 8.0.4.2-20190719,2,0,15,192.168.1.201,10,7,12,1,11");
        assert_eq!(metadata.firmware_version.as_deref(), Some("Ver 8.0.4.2-20190719"));
        assert_eq!(metadata.network_address.as_deref(), Some("192.168.1.201"));
        assert_eq!(metadata.config["attlog_count"], "15");
    }

    #[test]
    fn test_parse_command_reports() {
        let reports = parse_command_reports("ID=7&Return=0&CMD=DATA\nID=8&Return=-1002&CMD=DATA\nbogus\n");
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].command_id, 7);
        assert!(reports[0].succeeded());
        assert_eq!(reports[1].command_id, 8);
        assert!(!reports[1].succeeded());
        assert_eq!(reports[1].command.as_deref(), Some("DATA"));
    }
}
