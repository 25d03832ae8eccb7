use crate::db::models::{format_timestamp, parse_timestamp, Command, CommandStatus};
use crate::db::Database;
use crate::errors::{GatewayError, Result};
use crate::services::locks::DeviceLocks;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use std::collections::BTreeMap;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// What happened to a reported result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The command moved out of `sent` into this state
    Closed(CommandStatus),
    /// The command was not awaiting a result; nothing changed
    Ignored(CommandStatus),
    /// No command with that id
    Unknown,
}

/// Per-device outbox drained by terminal polls.
///
/// State machine: `pending -> sent -> {completed, failed}`, plus
/// `sent -> pending` when the stale sweep requeues an unanswered command.
/// Completed and failed are final.
#[derive(Clone)]
pub struct CommandQueue {
    db: Database,
    locks: DeviceLocks,
    max_attempts: u32,
}

const COMMAND_COLUMNS: &str =
    "id, device_serial, payload, status, attempts, result, created_at, sent_at, completed_at";

impl CommandQueue {
    pub fn new(db: Database, locks: DeviceLocks, max_attempts: u32) -> Self {
        Self {
            db,
            locks,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Queue a single-line instruction for a device
    pub fn enqueue(&self, serial: &str, payload: &str) -> Result<Command> {
        if serial.trim().is_empty() {
            return Err(GatewayError::InvalidInput("serial_number cannot be empty".into()));
        }
        let payload = payload.trim();
        if payload.is_empty() {
            return Err(GatewayError::InvalidInput("command cannot be empty".into()));
        }
        if payload.contains(['\r', '\n']) {
            return Err(GatewayError::InvalidInput(
                "command must be a single line".into(),
            ));
        }

        let now_str = format_timestamp(OffsetDateTime::now_utc())?;
        let conn = self.db.get_conn()?;
        let command = conn.query_row(
            &format!(
                "INSERT INTO device_commands (device_serial, payload, status, attempts, created_at)
                 VALUES (?, ?, 'pending', 0, ?)
                 RETURNING {COMMAND_COLUMNS}"
            ),
            params![serial, payload, &now_str],
            map_command,
        )?;

        info!(serial = %serial, command_id = command.id, payload = %payload, "Command queued");
        Ok(command)
    }

    /// Hand the oldest pending command to the device, marking it `sent`
    pub fn dequeue_next(&self, serial: &str) -> Result<Option<Command>> {
        self.locks.with_device(serial, || -> Result<Option<Command>> {
            let now_str = format_timestamp(OffsetDateTime::now_utc())?;
            let mut conn = self.db.get_conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let next: Option<i64> = tx
                .query_row(
                    "SELECT id FROM device_commands
                     WHERE device_serial = ? AND status = 'pending'
                     ORDER BY id LIMIT 1",
                    params![serial],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(id) = next else {
                return Ok(None);
            };

            let command = tx.query_row(
                &format!(
                    "UPDATE device_commands
                     SET status = 'sent', attempts = attempts + 1, sent_at = ?
                     WHERE id = ?
                     RETURNING {COMMAND_COLUMNS}"
                ),
                params![&now_str, id],
                map_command,
            )?;
            tx.commit()?;

            debug!(
                serial = %serial,
                command_id = command.id,
                attempt = command.attempts,
                "Command dispatched"
            );
            Ok(Some(command))
        })
    }

    /// Close a `sent` command. Reports for commands in any other state are
    /// ignored so a late answer cannot overwrite a requeue or a final state.
    pub fn report_result(&self, command_id: i64, success: bool, result: &str) -> Result<ReportOutcome> {
        let Some(command) = self.find(command_id)? else {
            return Ok(ReportOutcome::Unknown);
        };

        self.locks.with_device(&command.device_serial, || -> Result<ReportOutcome> {
            let now_str = format_timestamp(OffsetDateTime::now_utc())?;
            let status = if success {
                CommandStatus::Completed
            } else {
                CommandStatus::Failed
            };

            let conn = self.db.get_conn()?;
            let changed = conn.execute(
                "UPDATE device_commands
                 SET status = ?, result = ?, completed_at = ?
                 WHERE id = ? AND status = 'sent'",
                params![status.as_str(), result, &now_str, command_id],
            )?;

            if changed == 0 {
                let current: String = conn.query_row(
                    "SELECT status FROM device_commands WHERE id = ?",
                    params![command_id],
                    |row| row.get(0),
                )?;
                let current = current.parse().unwrap_or(command.status);
                debug!(command_id, status = current.as_str(), "Result for command not awaiting one ignored");
                return Ok(ReportOutcome::Ignored(current));
            }

            info!(
                serial = %command.device_serial,
                command_id,
                status = status.as_str(),
                "Command closed"
            );
            Ok(ReportOutcome::Closed(status))
        })
    }

    /// Requeue or fail commands that have been `sent` for longer than
    /// `timeout`. Returns how many commands changed state.
    pub fn sweep_stale(&self, timeout: Duration) -> Result<usize> {
        let now = OffsetDateTime::now_utc();

        // Unlocked snapshot; every candidate is re-checked under its device lock
        let sent = {
            let conn = self.db.get_conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, device_serial, sent_at FROM device_commands WHERE status = 'sent' ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let mut stale_by_device: BTreeMap<String, Vec<(i64, String)>> = BTreeMap::new();
        for (id, serial, sent_at) in sent {
            let Some(sent_at) = sent_at else { continue };
            let is_stale = match parse_timestamp(&sent_at) {
                Ok(at) => now - at > timeout,
                Err(_) => true,
            };
            if is_stale {
                stale_by_device.entry(serial).or_default().push((id, sent_at));
            }
        }

        let mut changed = 0;
        for (serial, candidates) in stale_by_device {
            changed += self.locks.with_device(&serial, || -> Result<usize> {
                let mut conn = self.db.get_conn()?;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut changed = 0;

                for (id, sent_at) in &candidates {
                    // Skip anything closed or redelivered since the snapshot
                    let attempts: Option<u32> = tx
                        .query_row(
                            "SELECT attempts FROM device_commands
                             WHERE id = ? AND status = 'sent' AND sent_at = ?",
                            params![id, sent_at],
                            |row| row.get(0),
                        )
                        .optional()?;
                    let Some(attempts) = attempts else { continue };

                    if attempts < self.max_attempts {
                        tx.execute(
                            "UPDATE device_commands SET status = 'pending', sent_at = NULL WHERE id = ?",
                            params![id],
                        )?;
                        info!(serial = %serial, command_id = id, attempts, "Stale command requeued");
                    } else {
                        let reason = format!("timed out after {} attempts", attempts);
                        tx.execute(
                            "UPDATE device_commands
                             SET status = 'failed', result = ?, completed_at = ?
                             WHERE id = ?",
                            params![&reason, format_timestamp(now)?, id],
                        )?;
                        warn!(serial = %serial, command_id = id, attempts, "Command failed: no result received");
                    }
                    changed += 1;
                }

                tx.commit()?;
                Ok(changed)
            })?;
        }

        if changed > 0 {
            info!(count = changed, "Stale command sweep finished");
        }
        Ok(changed)
    }

    /// Look up a command by id
    pub fn get(&self, command_id: i64) -> Result<Command> {
        self.find(command_id)?
            .ok_or_else(|| GatewayError::NotFound(format!("Command {} not found", command_id)))
    }

    fn find(&self, command_id: i64) -> Result<Option<Command>> {
        let conn = self.db.get_conn()?;
        let command = conn
            .query_row(
                &format!("SELECT {COMMAND_COLUMNS} FROM device_commands WHERE id = ?"),
                params![command_id],
                map_command,
            )
            .optional()?;
        Ok(command)
    }

    /// Commands for one device in creation order, optionally by status
    pub fn list_for_device(&self, serial: &str, status: Option<CommandStatus>) -> Result<Vec<Command>> {
        let conn = self.db.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COMMAND_COLUMNS} FROM device_commands
             WHERE device_serial = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY id"
        ))?;
        let commands = stmt
            .query_map(params![serial, status.map(|s| s.as_str())], map_command)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(commands)
    }
}

fn map_command(row: &Row<'_>) -> rusqlite::Result<Command> {
    let status: String = row.get(3)?;
    Ok(Command {
        id: row.get(0)?,
        device_serial: row.get(1)?,
        payload: row.get(2)?,
        status: status.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?,
        attempts: row.get(4)?,
        result: row.get(5)?,
        created_at: row.get(6)?,
        sent_at: row.get(7)?,
        completed_at: row.get(8)?,
    })
}
