//! Protocol gateway: turns terminal requests into registry, ingestion and
//! queue calls and always answers with a protocol-legal reply.

use crate::protocol::{
    self, parse_command_reports, parse_device_info, parse_push, OptionsEcho, ProtocolReply,
    PushMeta, PushPayload,
};
use crate::services::collaborators::UserSync;
use crate::services::command_queue::{CommandQueue, ReportOutcome};
use crate::services::ingestion::AttendanceIngestor;
use crate::services::registry::DeviceRegistry;
use std::sync::Arc;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::{debug, error, info, warn};

/// Values the terminal is told to use on every heartbeat
#[derive(Debug, Clone, Copy)]
pub struct EchoSettings {
    pub poll_interval_secs: u64,
    pub error_delay_secs: u64,
    pub utc_offset_minutes: i32,
}

#[derive(Clone)]
pub struct ProtocolGateway {
    registry: DeviceRegistry,
    ingestor: AttendanceIngestor,
    queue: CommandQueue,
    user_sync: Arc<dyn UserSync>,
    echo: EchoSettings,
}

impl ProtocolGateway {
    pub fn new(
        registry: DeviceRegistry,
        ingestor: AttendanceIngestor,
        queue: CommandQueue,
        user_sync: Arc<dyn UserSync>,
        echo: EchoSettings,
    ) -> Self {
        Self {
            registry,
            ingestor,
            queue,
            user_sync,
            echo,
        }
    }

    /// Handle a `cdata` push: heartbeat, attendance upload or operation log
    pub fn handle_push(&self, meta: &PushMeta, body: &str, peer_addr: Option<&str>) -> ProtocolReply {
        let serial = meta.serial.trim();
        if serial.is_empty() {
            warn!(table = ?meta.table, "Push without serial number");
            return ProtocolReply::Error("missing serial number".into());
        }

        match parse_push(meta, body) {
            PushPayload::Heartbeat(mut metadata) => {
                if metadata.network_address.is_none() {
                    metadata.network_address = peer_addr.map(str::to_string);
                }
                if let Err(e) = self.registry.upsert(serial, &metadata) {
                    error!(serial = %serial, error = %e, "Failed to register heartbeat");
                    return ProtocolReply::Error(e.to_string());
                }
                debug!(serial = %serial, "Heartbeat");
                ProtocolReply::Options(protocol::render_options(serial, &self.options_echo()))
            }

            PushPayload::Attendance(batch) => {
                if let Err(e) = self.registry.mark_seen(serial) {
                    error!(serial = %serial, error = %e, "Failed to mark device seen");
                    return ProtocolReply::Error(e.to_string());
                }

                for line in &batch.malformed {
                    debug!(serial = %serial, raw = %line, "Malformed ATTLOG line skipped");
                }
                let submitted = batch.records.len() + batch.malformed.len();

                let report = match self.ingestor.ingest(serial, &batch.records) {
                    Ok(report) => report,
                    Err(e) => {
                        // The terminal resends the batch; stored lines come back as duplicates
                        error!(serial = %serial, error = %e, "Attendance ingestion failed");
                        return ProtocolReply::Error(e.to_string());
                    }
                };

                let usable = report.accepted + report.duplicates;
                if submitted > 0 && usable == 0 {
                    let reason = format!("all {} ATTLOG lines rejected", submitted);
                    if let Err(e) = self.registry.record_fault(serial, &reason) {
                        error!(serial = %serial, error = %e, "Failed to record device fault");
                    }
                    return ProtocolReply::Error(reason);
                }

                if usable > 0 {
                    if let Err(e) = self.registry.clear_fault(serial) {
                        warn!(serial = %serial, error = %e, "Failed to clear device fault");
                    }
                }

                if !batch.malformed.is_empty() || !report.rejected.is_empty() {
                    warn!(
                        serial = %serial,
                        malformed = batch.malformed.len(),
                        rejected = report.rejected.len(),
                        accepted = report.accepted,
                        "ATTLOG batch partially accepted"
                    );
                }
                ProtocolReply::Ok
            }

            PushPayload::Operations(batch) => {
                if let Err(e) = self.registry.mark_seen(serial) {
                    error!(serial = %serial, error = %e, "Failed to mark device seen");
                    return ProtocolReply::Error(e.to_string());
                }
                if batch.records.is_empty() && !batch.malformed.is_empty() {
                    warn!(serial = %serial, malformed = batch.malformed.len(), "No usable operation lines");
                    return ProtocolReply::Error("no usable operation lines".into());
                }
                if !batch.malformed.is_empty() {
                    debug!(serial = %serial, skipped = batch.malformed.len(), "Unrecognised operation lines skipped");
                }

                self.user_sync.sync(serial, &batch.records);
                ProtocolReply::Ok
            }

            PushPayload::Unsupported { table } => {
                if let Err(e) = self.registry.mark_seen(serial) {
                    error!(serial = %serial, error = %e, "Failed to mark device seen");
                    return ProtocolReply::Error(e.to_string());
                }
                info!(serial = %serial, table = %table, "Ignoring push for unsupported table");
                ProtocolReply::Ok
            }
        }
    }

    /// Handle a `getrequest` poll: hand out at most one command
    pub fn handle_poll(&self, serial: &str, info: Option<&str>) -> ProtocolReply {
        let serial = serial.trim();
        if serial.is_empty() {
            warn!("Poll without serial number");
            return ProtocolReply::Error("missing serial number".into());
        }

        let seen = match info.filter(|i| !i.trim().is_empty()) {
            Some(info) => self.registry.upsert(serial, &parse_device_info(info)).map(|_| ()),
            None => self.registry.mark_seen(serial),
        };
        if let Err(e) = seen {
            error!(serial = %serial, error = %e, "Failed to mark device seen");
            return ProtocolReply::Error(e.to_string());
        }

        match self.queue.dequeue_next(serial) {
            Ok(Some(command)) => {
                info!(
                    serial = %serial,
                    command_id = command.id,
                    attempt = command.attempts,
                    "Delivering command"
                );
                ProtocolReply::Command {
                    id: command.id,
                    payload: command.payload,
                }
            }
            Ok(None) => ProtocolReply::Ok,
            Err(e) => {
                error!(serial = %serial, error = %e, "Failed to dequeue command");
                ProtocolReply::Error(e.to_string())
            }
        }
    }

    /// Handle a `devicecmd` report. Always acknowledged.
    pub fn handle_command_result(&self, serial: &str, body: &str) -> ProtocolReply {
        let serial = serial.trim();
        if serial.is_empty() {
            warn!("Command result without serial number");
            return ProtocolReply::Ok;
        }
        if let Err(e) = self.registry.mark_seen(serial) {
            warn!(serial = %serial, error = %e, "Failed to mark device seen");
        }

        let reports = parse_command_reports(body);
        if reports.is_empty() {
            debug!(serial = %serial, "Command result body had no recognisable lines");
        }

        for report in reports {
            match self.queue.get(report.command_id) {
                Ok(command) if command.device_serial != serial => {
                    warn!(
                        serial = %serial,
                        command_id = report.command_id,
                        owner = %command.device_serial,
                        "Result reported for another device's command"
                    );
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(serial = %serial, command_id = report.command_id, error = %e, "Result for unknown command");
                    continue;
                }
            }

            match self
                .queue
                .report_result(report.command_id, report.succeeded(), &report.raw)
            {
                Ok(ReportOutcome::Closed(status)) => {
                    debug!(serial = %serial, command_id = report.command_id, status = status.as_str(), "Result recorded");
                }
                Ok(ReportOutcome::Ignored(status)) => {
                    info!(
                        serial = %serial,
                        command_id = report.command_id,
                        status = status.as_str(),
                        "Late or duplicate result ignored"
                    );
                }
                Ok(ReportOutcome::Unknown) => {}
                Err(e) => {
                    error!(serial = %serial, command_id = report.command_id, error = %e, "Failed to record command result");
                }
            }
        }

        ProtocolReply::Ok
    }

    fn options_echo(&self) -> OptionsEcho {
        let offset = UtcOffset::from_whole_seconds(self.echo.utc_offset_minutes * 60)
            .unwrap_or(UtcOffset::UTC);
        let local = OffsetDateTime::now_utc().to_offset(offset);

        OptionsEcho {
            server_time: PrimitiveDateTime::new(local.date(), local.time()),
            error_delay_secs: self.echo.error_delay_secs,
            poll_interval_secs: self.echo.poll_interval_secs,
            utc_offset_minutes: self.echo.utc_offset_minutes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_db;
    use crate::db::models::{CommandStatus, DeviceStatus};
    use crate::db::Database;
    use crate::services::ingestion::PunchFilter;
    use crate::protocol::OperationLine;
    use crate::punch::PunchType;
    use crate::services::collaborators::SqliteEmployeeDirectory;
    use crate::services::ingestion::PunchTypeSource;
    use crate::services::locks::DeviceLocks;
    use crate::services::time_windows::{NewTimeWindow, TimeWindowStore};
    use std::sync::Mutex;
    use std::time::Duration;
    use time::macros::time;

    #[derive(Default)]
    struct RecordingUserSync {
        lines: Mutex<Vec<(String, OperationLine)>>,
    }

    impl UserSync for RecordingUserSync {
        fn sync(&self, serial: &str, lines: &[OperationLine]) {
            let mut seen = self.lines.lock().unwrap();
            seen.extend(lines.iter().map(|l| (serial.to_string(), l.clone())));
        }
    }

    struct Harness {
        gateway: ProtocolGateway,
        registry: DeviceRegistry,
        ingestor: AttendanceIngestor,
        queue: CommandQueue,
        user_sync: Arc<RecordingUserSync>,
        db: Database,
    }

    fn harness() -> Harness {
        let db = create_test_db();
        let locks = DeviceLocks::new();
        let registry = DeviceRegistry::new(db.clone(), locks.clone(), Duration::from_secs(60));
        let ingestor = AttendanceIngestor::new(
            db.clone(),
            TimeWindowStore::new(db.clone()),
            Arc::new(SqliteEmployeeDirectory::new(db.clone())),
            PunchTypeSource::Device,
        );
        let queue = CommandQueue::new(db.clone(), locks, 3);
        let user_sync = Arc::new(RecordingUserSync::default());
        let gateway = ProtocolGateway::new(
            registry.clone(),
            ingestor.clone(),
            queue.clone(),
            user_sync.clone(),
            EchoSettings {
                poll_interval_secs: 30,
                error_delay_secs: 30,
                utc_offset_minutes: 0,
            },
        );
        Harness {
            gateway,
            registry,
            ingestor,
            queue,
            user_sync,
            db,
        }
    }

    fn push(serial: &str, table: Option<&str>) -> PushMeta {
        PushMeta {
            serial: serial.into(),
            table: table.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_heartbeat_registers_and_echoes_options() {
        let h = harness();
        let reply = h.gateway.handle_push(
            &push("T001", Some("options")),
            "~DeviceName=Lobby,FirmVer=Ver 8.0.4",
            Some("10.0.0.7"),
        );

        let ProtocolReply::Options(body) = reply else {
            panic!("expected options echo, got {reply:?}");
        };
        assert!(body.starts_with("GET OPTION FROM: T001"));
        assert!(body.contains("Delay=30"));

        let device = h.registry.get("T001").unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.display_name.as_deref(), Some("Lobby"));
        assert_eq!(device.network_address.as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn test_missing_serial_is_an_error() {
        let h = harness();
        assert!(matches!(
            h.gateway.handle_push(&push(" ", Some("ATTLOG")), "1001\t2024-03-04 08:55:00", None),
            ProtocolReply::Error(_)
        ));
        assert!(matches!(h.gateway.handle_poll("", None), ProtocolReply::Error(_)));
    }

    #[test]
    fn test_attendance_push_with_classification() {
        let h = harness();
        TimeWindowStore::new(h.db.clone())
            .create(&NewTimeWindow {
                punch_type: PunchType::CheckIn,
                start_time: time!(06:00),
                end_time: time!(10:00),
                days_of_week: vec![0, 1, 2, 3, 4],
                priority: 1,
                active: true,
                description: None,
            })
            .unwrap();

        // Monday, no punch-type code from the terminal
        let reply = h
            .gateway
            .handle_push(&push("T001", Some("ATTLOG")), "1001\t2024-03-04 08:55:00", None);
        assert_eq!(reply, ProtocolReply::Ok);

        let punches = h.ingestor.list(&PunchFilter::default()).unwrap();
        assert_eq!(punches.len(), 1);
        assert_eq!(punches[0].device_serial, "T001");
        assert_eq!(punches[0].punch_type, Some(PunchType::CheckIn));

        // The unknown serial was registered on first contact
        assert!(h.registry.get("T001").is_ok());
    }

    #[test]
    fn test_partial_batch_is_ok() {
        let h = harness();
        let body = "1001\t2024-03-04 08:55:00\t0\t1\ngarbage\n1002\tnot-a-time\t0\t1\n";
        let reply = h.gateway.handle_push(&push("T001", Some("ATTLOG")), body, None);

        assert_eq!(reply, ProtocolReply::Ok);
        assert_eq!(h.ingestor.list(&PunchFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_fully_rejected_batch_is_error_and_faults_device() {
        let h = harness();
        let reply = h
            .gateway
            .handle_push(&push("T001", Some("ATTLOG")), "garbage\nmore garbage", None);

        assert!(matches!(reply, ProtocolReply::Error(_)));
        assert_eq!(h.registry.get("T001").unwrap().status, DeviceStatus::Error);

        // A good batch clears the fault
        h.gateway
            .handle_push(&push("T001", Some("ATTLOG")), "1001\t2024-03-04 08:55:00\t0", None);
        assert_eq!(h.registry.get("T001").unwrap().status, DeviceStatus::Online);
    }

    #[test]
    fn test_redelivered_batch_is_ok() {
        let h = harness();
        let body = "1001\t2024-03-04 08:55:00\t0\t1";
        let meta = push("T001", Some("ATTLOG"));

        assert_eq!(h.gateway.handle_push(&meta, body, None), ProtocolReply::Ok);
        assert_eq!(h.gateway.handle_push(&meta, body, None), ProtocolReply::Ok);
        assert_eq!(h.ingestor.list(&PunchFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_operation_log_forwarded_not_stored() {
        let h = harness();
        let body = "USER PIN=1001\tName=Ana\tPri=0\nOPLOG 4\t0\t2024-03-04 08:00:00\t0\t0\t0\t0\n???";
        let reply = h.gateway.handle_push(&push("T001", Some("OPERLOG")), body, None);

        assert_eq!(reply, ProtocolReply::Ok);
        let forwarded = h.user_sync.lines.lock().unwrap();
        assert_eq!(forwarded.len(), 2);
        assert!(forwarded.iter().all(|(serial, _)| serial == "T001"));
        assert!(h.ingestor.list(&PunchFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_unsupported_table_acknowledged() {
        let h = harness();
        let reply = h
            .gateway
            .handle_push(&push("T001", Some("BIODATA")), "Pin=1\tNo=0", None);
        assert_eq!(reply, ProtocolReply::Ok);
    }

    #[test]
    fn test_poll_delivers_then_result_closes() {
        let h = harness();
        let cmd = h.queue.enqueue("T001", "INFO").unwrap();

        let reply = h.gateway.handle_poll("T001", None);
        assert_eq!(reply.render(), format!("C:{}:INFO", cmd.id));
        assert_eq!(h.gateway.handle_poll("T001", None), ProtocolReply::Ok);

        let body = format!("ID={}&Return=0&CMD=INFO", cmd.id);
        assert_eq!(h.gateway.handle_command_result("T001", &body), ProtocolReply::Ok);
        assert_eq!(h.queue.get(cmd.id).unwrap().status, CommandStatus::Completed);
    }

    #[test]
    fn test_result_from_wrong_device_ignored() {
        let h = harness();
        let cmd = h.queue.enqueue("T001", "INFO").unwrap();
        h.gateway.handle_poll("T001", None);

        let body = format!("ID={}&Return=0&CMD=INFO", cmd.id);
        assert_eq!(h.gateway.handle_command_result("T002", &body), ProtocolReply::Ok);
        assert_eq!(h.queue.get(cmd.id).unwrap().status, CommandStatus::Sent);
    }

    #[test]
    fn test_result_for_unknown_command_acknowledged() {
        let h = harness();
        assert_eq!(
            h.gateway.handle_command_result("T001", "ID=777&Return=0&CMD=INFO\nnoise"),
            ProtocolReply::Ok
        );
    }

    #[test]
    fn test_poll_info_updates_registry() {
        let h = harness();
        h.gateway
            .handle_poll("T001", Some("Ver 8.0.4,12,10,340,192.168.1.201"));

        let device = h.registry.get("T001").unwrap();
        assert_eq!(device.firmware_version.as_deref(), Some("Ver 8.0.4"));
        assert_eq!(device.network_address.as_deref(), Some("192.168.1.201"));
        assert_eq!(device.config["user_count"], "12");
    }

    #[test]
    fn test_unanswered_command_redelivered_after_sweep() {
        let h = harness();
        let cmd = h.queue.enqueue("T001", "DATA DEL USER PIN=1001").unwrap();

        let first = h.gateway.handle_poll("T001", None).render();
        assert_eq!(first, format!("C:{}:DATA DEL USER PIN=1001", cmd.id));

        let old = crate::db::models::format_timestamp(
            OffsetDateTime::now_utc() - time::Duration::minutes(10),
        )
        .unwrap();
        h.db.get_conn()
            .unwrap()
            .execute(
                "UPDATE device_commands SET sent_at = ? WHERE id = ?",
                rusqlite::params![&old, cmd.id],
            )
            .unwrap();
        assert_eq!(h.queue.sweep_stale(Duration::from_secs(300)).unwrap(), 1);

        let second = h.gateway.handle_poll("T001", None).render();
        assert_eq!(second, first);
    }
}
