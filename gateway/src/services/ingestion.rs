use crate::db::models::{format_timestamp, PunchRecord, TimeWindowRule};
use crate::db::Database;
use crate::errors::{GatewayError, Result};
use crate::protocol::AttendanceLine;
use crate::punch::{format_punch_time, parse_punch_time, PunchType, VerifyMethod};
use crate::services::classifier;
use crate::services::collaborators::EmployeeDirectory;
use crate::services::time_windows::TimeWindowStore;
use rusqlite::{params, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Which source decides a punch's type when both are available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunchTypeSource {
    /// Trust the terminal's status code; classify only when it is missing
    #[default]
    Device,
    /// Classify by time window; fall back to the terminal's code
    TimeWindow,
}

/// Outcome of one ingest call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestionReport {
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: Vec<RejectedRecord>,
}

impl IngestionReport {
    pub fn total(&self) -> usize {
        self.accepted + self.duplicates + self.rejected.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecord {
    pub raw: String,
    pub reason: String,
}

/// Filters for the punch listing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PunchFilter {
    pub device: Option<String>,
    pub pin: Option<String>,
    /// `YYYY-MM-DD`, matched against the punch's wall-clock date
    pub date: Option<String>,
    pub limit: Option<u32>,
}

const DEFAULT_LIST_LIMIT: u32 = 100;
const MAX_LIST_LIMIT: u32 = 1000;

/// A punch that passed validation, ready to insert
struct PreparedPunch {
    key: String,
    pin: String,
    punch_time: String,
    punch_type: Option<PunchType>,
    verify_method: Option<String>,
    work_code: Option<String>,
    employee_name: Option<String>,
    department: Option<String>,
    raw: String,
}

/// Turns parsed ATTLOG lines into stored punch records
#[derive(Clone)]
pub struct AttendanceIngestor {
    db: Database,
    rules: TimeWindowStore,
    directory: Arc<dyn EmployeeDirectory>,
    source: PunchTypeSource,
}

impl AttendanceIngestor {
    pub fn new(
        db: Database,
        rules: TimeWindowStore,
        directory: Arc<dyn EmployeeDirectory>,
        source: PunchTypeSource,
    ) -> Self {
        Self {
            db,
            rules,
            directory,
            source,
        }
    }

    /// Store a batch of punches from `device_serial`.
    ///
    /// Re-delivered punches are counted as duplicates and never stored twice.
    /// Invalid lines are rejected individually; the rest of the batch is
    /// written in a single transaction.
    pub fn ingest(&self, device_serial: &str, records: &[AttendanceLine]) -> Result<IngestionReport> {
        let mut report = IngestionReport::default();
        if records.is_empty() {
            return Ok(report);
        }

        // One rule snapshot per batch
        let rules = self.rules.list(true)?;

        let mut prepared = Vec::with_capacity(records.len());
        for line in records {
            match self.prepare(device_serial, line, &rules) {
                Ok(punch) => prepared.push(punch),
                Err(reason) => {
                    debug!(serial = %device_serial, raw = %line.raw, reason = %reason, "Punch rejected");
                    report.rejected.push(RejectedRecord {
                        raw: line.raw.clone(),
                        reason,
                    });
                }
            }
        }

        if !prepared.is_empty() {
            let now_str = format_timestamp(OffsetDateTime::now_utc())?;
            let mut conn = self.db.get_conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            {
                let mut insert = tx.prepare(
                    r#"
                    INSERT OR IGNORE INTO punch_records (
                        idempotency_key, device_serial, employee_pin, employee_name, department,
                        punch_time, punch_type, verify_method, work_code, raw_payload, created_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )?;

                for punch in &prepared {
                    let changed = insert.execute(params![
                        &punch.key,
                        device_serial,
                        &punch.pin,
                        &punch.employee_name,
                        &punch.department,
                        &punch.punch_time,
                        punch.punch_type.map(|t| t.as_str()),
                        &punch.verify_method,
                        &punch.work_code,
                        &punch.raw,
                        &now_str,
                    ])?;

                    if changed == 0 {
                        report.duplicates += 1;
                    } else {
                        report.accepted += 1;
                    }
                }
            }
            tx.commit()?;
        }

        info!(
            serial = %device_serial,
            accepted = report.accepted,
            duplicates = report.duplicates,
            rejected = report.rejected.len(),
            "Attendance batch ingested"
        );

        Ok(report)
    }

    fn prepare(
        &self,
        device_serial: &str,
        line: &AttendanceLine,
        rules: &[TimeWindowRule],
    ) -> std::result::Result<PreparedPunch, String> {
        let pin = line.pin.trim();
        if pin.is_empty() {
            return Err("empty employee PIN".to_string());
        }

        let at = parse_punch_time(&line.timestamp)
            .ok_or_else(|| format!("unparseable timestamp: {}", line.timestamp))?;
        let punch_time = format_punch_time(at);

        let device_type = line
            .status_code
            .as_deref()
            .and_then(PunchType::from_device_code);
        let punch_type = match self.source {
            PunchTypeSource::Device => device_type.or_else(|| classifier::classify(at, rules)),
            PunchTypeSource::TimeWindow => classifier::classify(at, rules).or(device_type),
        };

        let employee = match self.directory.lookup(pin) {
            Ok(employee) => employee,
            Err(e) => {
                warn!(pin = %pin, error = %e, "Employee lookup failed, storing punch without details");
                None
            }
        };

        Ok(PreparedPunch {
            key: idempotency_key(device_serial, pin, &punch_time, &line.raw),
            pin: pin.to_string(),
            punch_time,
            punch_type,
            verify_method: line
                .verify_code
                .as_deref()
                .map(|code| VerifyMethod::from_device_code(code).label()),
            work_code: line.work_code.clone().filter(|c| !c.is_empty()),
            employee_name: employee.as_ref().map(|e| e.name.clone()),
            department: employee.and_then(|e| e.department),
            raw: line.raw.clone(),
        })
    }

    /// Stored punches, newest first
    pub fn list(&self, filter: &PunchFilter) -> Result<Vec<PunchRecord>> {
        if let Some(date) = &filter.date {
            time::Date::parse(date, time::macros::format_description!("[year]-[month]-[day]"))
                .map_err(|_| GatewayError::InvalidInput(format!("Invalid date: {}", date)))?;
        }
        let limit = filter.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

        let conn = self.db.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, device_serial, employee_pin, employee_name, department, punch_time,
                   punch_type, verify_method, work_code, raw_payload, created_at
            FROM punch_records
            WHERE (?1 IS NULL OR device_serial = ?1)
              AND (?2 IS NULL OR employee_pin = ?2)
              AND (?3 IS NULL OR substr(punch_time, 1, 10) = ?3)
            ORDER BY punch_time DESC, id DESC
            LIMIT ?4
            "#,
        )?;

        let records = stmt
            .query_map(
                params![&filter.device, &filter.pin, &filter.date, limit],
                map_punch,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

/// Stable identity of a punch: same terminal, employee, time and line
pub fn idempotency_key(device_serial: &str, pin: &str, punch_time: &str, raw: &str) -> String {
    let payload_hash = Sha256::digest(raw.trim().as_bytes());

    let mut hasher = Sha256::new();
    for part in [device_serial.as_bytes(), pin.as_bytes(), punch_time.as_bytes()] {
        hasher.update(part);
        hasher.update([0x1f]);
    }
    hasher.update(payload_hash);
    hex::encode(hasher.finalize())
}

fn map_punch(row: &Row<'_>) -> rusqlite::Result<PunchRecord> {
    let punch_type: Option<String> = row.get(6)?;
    Ok(PunchRecord {
        id: row.get(0)?,
        device_serial: row.get(1)?,
        employee_pin: row.get(2)?,
        employee_name: row.get(3)?,
        department: row.get(4)?,
        punch_time: row.get(5)?,
        punch_type: punch_type.and_then(|t| t.parse().ok()),
        verify_method: row.get(7)?,
        work_code: row.get(8)?,
        raw_payload: row.get(9)?,
        created_at: row.get(10)?,
    })
}
