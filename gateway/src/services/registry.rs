use crate::db::models::{format_timestamp, parse_timestamp, Device, DeviceStatus};
use crate::db::Database;
use crate::errors::{GatewayError, Result};
use crate::services::locks::DeviceLocks;
use rusqlite::{params, OptionalExtension, Row};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Optional descriptive fields a terminal reports about itself
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceMetadata {
    pub display_name: Option<String>,
    pub network_address: Option<String>,
    pub firmware_version: Option<String>,
    /// Merged key-by-key into the stored config blob
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// Durable table of known terminals.
///
/// Status is never stored: it is computed from `last_seen` (and the last
/// recorded fault) every time a row is read.
#[derive(Clone)]
pub struct DeviceRegistry {
    db: Database,
    locks: DeviceLocks,
    online_threshold: Duration,
}

const DEVICE_COLUMNS: &str = "serial_number, display_name, network_address, firmware_version, \
     config, last_error, last_seen, created_at";

impl DeviceRegistry {
    pub fn new(db: Database, locks: DeviceLocks, online_threshold: Duration) -> Self {
        Self {
            db,
            locks,
            online_threshold,
        }
    }

    /// Create or refresh a device. Unknown serials are registered, never rejected.
    ///
    /// Absent metadata keeps the stored value; any recorded fault is cleared.
    pub fn upsert(&self, serial: &str, metadata: &DeviceMetadata) -> Result<Device> {
        validate_serial(serial)?;
        let now_str = format_timestamp(OffsetDateTime::now_utc())?;
        let config_json = serde_json::to_string(&metadata.config)?;

        self.locks.with_device(serial, || -> Result<()> {
            let conn = self.db.get_conn()?;
            conn.execute(
                r#"
                INSERT INTO devices (
                    serial_number, display_name, network_address, firmware_version,
                    config, last_error, last_seen, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?6, ?6)
                ON CONFLICT(serial_number) DO UPDATE SET
                    display_name = COALESCE(excluded.display_name, devices.display_name),
                    network_address = COALESCE(excluded.network_address, devices.network_address),
                    firmware_version = COALESCE(excluded.firmware_version, devices.firmware_version),
                    config = json_patch(devices.config, excluded.config),
                    last_error = NULL,
                    last_seen = excluded.last_seen,
                    updated_at = excluded.updated_at
                "#,
                params![
                    serial,
                    &metadata.display_name,
                    &metadata.network_address,
                    &metadata.firmware_version,
                    &config_json,
                    &now_str,
                ],
            )?;
            Ok(())
        })?;

        debug!(serial = %serial, last_seen = %now_str, "Device upserted");
        self.get(serial)
    }

    /// Stamp `last_seen`, registering the serial if it has never been seen
    pub fn mark_seen(&self, serial: &str) -> Result<()> {
        validate_serial(serial)?;
        let now_str = format_timestamp(OffsetDateTime::now_utc())?;

        let inserted = self.locks.with_device(serial, || -> Result<bool> {
            let conn = self.db.get_conn()?;
            let existed: Option<String> = conn
                .query_row(
                    "SELECT serial_number FROM devices WHERE serial_number = ?",
                    params![serial],
                    |row| row.get(0),
                )
                .optional()?;
            conn.execute(
                r#"
                INSERT INTO devices (serial_number, config, last_seen, created_at, updated_at)
                VALUES (?1, '{}', ?2, ?2, ?2)
                ON CONFLICT(serial_number) DO UPDATE SET
                    last_seen = excluded.last_seen,
                    updated_at = excluded.updated_at
                "#,
                params![serial, &now_str],
            )?;
            Ok(existed.is_none())
        })?;

        if inserted {
            info!(serial = %serial, "Auto-registered unknown device");
        }
        Ok(())
    }

    /// Remember that the device's last upload was unusable
    pub fn record_fault(&self, serial: &str, reason: &str) -> Result<()> {
        self.set_fault(serial, Some(reason))?;
        warn!(serial = %serial, reason = %reason, "Device fault recorded");
        Ok(())
    }

    /// Clear a previously recorded fault
    pub fn clear_fault(&self, serial: &str) -> Result<()> {
        self.set_fault(serial, None)
    }

    fn set_fault(&self, serial: &str, reason: Option<&str>) -> Result<()> {
        self.locks.with_device(serial, || -> Result<()> {
            let conn = self.db.get_conn()?;
            conn.execute(
                "UPDATE devices SET last_error = ? WHERE serial_number = ?",
                params![reason, serial],
            )?;
            Ok(())
        })
    }

    /// Look up a single device
    pub fn get(&self, serial: &str) -> Result<Device> {
        let conn = self.db.get_conn()?;
        let now = OffsetDateTime::now_utc();

        conn.query_row(
            &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE serial_number = ?"),
            params![serial],
            |row| self.map_device(row, now),
        )
        .optional()?
        .ok_or_else(|| GatewayError::NotFound(format!("Device {} not found", serial)))
    }

    /// All devices, ordered by serial
    pub fn list_all(&self) -> Result<Vec<Device>> {
        let conn = self.db.get_conn()?;
        let now = OffsetDateTime::now_utc();

        let mut stmt =
            conn.prepare(&format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY serial_number"))?;
        let devices = stmt
            .query_map([], |row| self.map_device(row, now))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    /// Status at `now` for a device last seen at `last_seen`
    pub fn status_at(
        &self,
        last_seen: OffsetDateTime,
        has_fault: bool,
        now: OffsetDateTime,
    ) -> DeviceStatus {
        let age = now - last_seen;
        if age > self.online_threshold {
            DeviceStatus::Offline
        } else if has_fault {
            DeviceStatus::Error
        } else {
            DeviceStatus::Online
        }
    }

    fn map_device(&self, row: &Row<'_>, now: OffsetDateTime) -> rusqlite::Result<Device> {
        let last_seen: String = row.get(6)?;
        let last_error: Option<String> = row.get(5)?;
        let config: String = row.get(4)?;

        let status = match parse_timestamp(&last_seen) {
            Ok(seen) => self.status_at(seen, last_error.is_some(), now),
            Err(_) => DeviceStatus::Offline,
        };

        Ok(Device {
            serial_number: row.get(0)?,
            display_name: row.get(1)?,
            network_address: row.get(2)?,
            firmware_version: row.get(3)?,
            status,
            last_seen,
            last_error,
            config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
            created_at: row.get(7)?,
        })
    }
}

fn validate_serial(serial: &str) -> Result<()> {
    if serial.trim().is_empty() {
        return Err(GatewayError::InvalidInput(
            "serial_number cannot be empty".into(),
        ));
    }
    Ok(())
}
