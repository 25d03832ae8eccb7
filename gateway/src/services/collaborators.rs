//! Seams to systems outside the gateway: the employee directory, the audit
//! trail, and whatever consumes user changes made on a terminal keypad.

use crate::db::models::Employee;
use crate::db::Database;
use crate::errors::Result;
use crate::protocol::OperationLine;
use rusqlite::{params, OptionalExtension};
use tracing::info;

/// Resolves PINs to employee details during ingestion
pub trait EmployeeDirectory: Send + Sync {
    fn lookup(&self, pin: &str) -> Result<Option<Employee>>;
}

/// Receives administrative actions
pub trait AuditSink: Send + Sync {
    fn record(&self, action: &str, resource: &str, details: &str);
}

/// Receives user records pushed from a terminal
pub trait UserSync: Send + Sync {
    fn sync(&self, serial: &str, lines: &[OperationLine]);
}

/// Directory backed by the local `employees` table
#[derive(Clone)]
pub struct SqliteEmployeeDirectory {
    db: Database,
}

impl SqliteEmployeeDirectory {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Add or replace an employee row
    pub fn upsert(&self, employee: &Employee) -> Result<()> {
        let conn = self.db.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO employees (pin, name, department, is_active) VALUES (?1, ?2, ?3, 1)
            ON CONFLICT(pin) DO UPDATE SET
                name = excluded.name,
                department = excluded.department,
                is_active = 1
            "#,
            params![&employee.pin, &employee.name, &employee.department],
        )?;
        Ok(())
    }
}

impl EmployeeDirectory for SqliteEmployeeDirectory {
    fn lookup(&self, pin: &str) -> Result<Option<Employee>> {
        let conn = self.db.get_conn()?;
        let employee = conn
            .query_row(
                "SELECT pin, name, department FROM employees WHERE pin = ? AND is_active = 1",
                params![pin],
                |row| {
                    Ok(Employee {
                        pin: row.get(0)?,
                        name: row.get(1)?,
                        department: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(employee)
    }
}

/// Audit trail written to the `audit` tracing target
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, action: &str, resource: &str, details: &str) {
        info!(target: "audit", action = %action, resource = %resource, details = %details, "Admin action");
    }
}

/// Logs terminal-side user changes without applying them anywhere
#[derive(Debug, Clone, Default)]
pub struct TracingUserSync;

impl UserSync for TracingUserSync {
    fn sync(&self, serial: &str, lines: &[OperationLine]) {
        for line in lines {
            log_operation(serial, line);
        }
    }
}

fn log_operation(serial: &str, operation: &OperationLine) {
    match operation {
        OperationLine::User { pin, name, privilege, .. } => {
            info!(
                serial = %serial,
                pin = %pin,
                name = name.as_deref().unwrap_or(""),
                privilege = privilege.as_deref().unwrap_or(""),
                "User record pushed by terminal"
            );
        }
        OperationLine::Fingerprint { pin, finger_index } => {
            info!(
                serial = %serial,
                pin = %pin,
                finger = finger_index.as_deref().unwrap_or(""),
                "Fingerprint template pushed by terminal"
            );
        }
        OperationLine::OpLog { code, admin_pin, time } => {
            info!(serial = %serial, code = %code, admin = %admin_pin, at = %time, "Terminal operation log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_db;

    #[test]
    fn test_directory_lookup() {
        let directory = SqliteEmployeeDirectory::new(create_test_db());
        assert!(directory.lookup("1001").unwrap().is_none());

        directory
            .upsert(&Employee {
                pin: "1001".into(),
                name: "Ana Lima".into(),
                department: Some("Warehouse".into()),
            })
            .unwrap();

        let employee = directory.lookup("1001").unwrap().unwrap();
        assert_eq!(employee.name, "Ana Lima");
        assert_eq!(employee.department.as_deref(), Some("Warehouse"));
    }

    #[test]
    fn test_inactive_employee_not_returned() {
        let db = create_test_db();
        let directory = SqliteEmployeeDirectory::new(db.clone());
        directory
            .upsert(&Employee {
                pin: "1002".into(),
                name: "Former".into(),
                department: None,
            })
            .unwrap();
        db.get_conn()
            .unwrap()
            .execute("UPDATE employees SET is_active = 0 WHERE pin = '1002'", [])
            .unwrap();

        assert!(directory.lookup("1002").unwrap().is_none());
    }
}
