use crate::db::models::{clock_time, format_timestamp, parse_days_column, TimeWindowRule};
use crate::db::Database;
use crate::errors::{GatewayError, Result};
use crate::punch::PunchType;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

/// Rule definition before it has an id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTimeWindow {
    pub punch_type: PunchType,
    #[serde(with = "clock_time")]
    pub start_time: time::Time,
    #[serde(with = "clock_time")]
    pub end_time: time::Time,
    #[serde(default = "all_days")]
    pub days_of_week: Vec<u8>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn all_days() -> Vec<u8> {
    (0..7).collect()
}

fn default_active() -> bool {
    true
}

/// Storage for classification rules
#[derive(Clone)]
pub struct TimeWindowStore {
    db: Database,
}

impl TimeWindowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Rules in declaration (id) order
    pub fn list(&self, active_only: bool) -> Result<Vec<TimeWindowRule>> {
        let conn = self.db.get_conn()?;
        let sql = if active_only {
            "SELECT id, punch_type, start_time, end_time, days_of_week, priority, active, description
             FROM time_window_rules WHERE active = 1 ORDER BY id"
        } else {
            "SELECT id, punch_type, start_time, end_time, days_of_week, priority, active, description
             FROM time_window_rules ORDER BY id"
        };

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], map_rule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Validate and store a rule
    pub fn create(&self, rule: &NewTimeWindow) -> Result<TimeWindowRule> {
        let days = validated_days(rule)?;

        let now_str = format_timestamp(OffsetDateTime::now_utc())?;
        let conn = self.db.get_conn()?;
        let id: i64 = conn.query_row(
            r#"
            INSERT INTO time_window_rules (
                punch_type, start_time, end_time, days_of_week, priority, active, description, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
            params![
                rule.punch_type.as_str(),
                clock_time::format(rule.start_time),
                clock_time::format(rule.end_time),
                days.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(","),
                rule.priority,
                rule.active,
                &rule.description,
                &now_str,
            ],
            |row| row.get(0),
        )?;

        info!(
            rule_id = id,
            punch_type = %rule.punch_type,
            start = %clock_time::format(rule.start_time),
            end = %clock_time::format(rule.end_time),
            "Time window created"
        );

        Ok(TimeWindowRule {
            id,
            punch_type: rule.punch_type,
            start_time: rule.start_time,
            end_time: rule.end_time,
            days_of_week: days,
            priority: rule.priority,
            active: rule.active,
            description: rule.description.clone(),
        })
    }

    /// Replace every field of an existing rule
    pub fn update(&self, id: i64, rule: &NewTimeWindow) -> Result<TimeWindowRule> {
        let days = validated_days(rule)?;

        let conn = self.db.get_conn()?;
        let changed = conn.execute(
            r#"
            UPDATE time_window_rules
            SET punch_type = ?, start_time = ?, end_time = ?, days_of_week = ?,
                priority = ?, active = ?, description = ?
            WHERE id = ?
            "#,
            params![
                rule.punch_type.as_str(),
                clock_time::format(rule.start_time),
                clock_time::format(rule.end_time),
                days.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(","),
                rule.priority,
                rule.active,
                &rule.description,
                id,
            ],
        )?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!("time window {}", id)));
        }

        info!(rule_id = id, punch_type = %rule.punch_type, active = rule.active, "Time window updated");

        Ok(TimeWindowRule {
            id,
            punch_type: rule.punch_type,
            start_time: rule.start_time,
            end_time: rule.end_time,
            days_of_week: days,
            priority: rule.priority,
            active: rule.active,
            description: rule.description.clone(),
        })
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        let conn = self.db.get_conn()?;
        let changed = conn.execute("DELETE FROM time_window_rules WHERE id = ?", params![id])?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!("time window {}", id)));
        }

        info!(rule_id = id, "Time window deleted");
        Ok(())
    }

    /// Install the stock Monday–Friday schedule when no rule exists yet.
    /// Returns the number of rules inserted.
    pub fn seed_defaults_if_empty(&self) -> Result<usize> {
        let count: i64 = self
            .db
            .get_conn()?
            .query_row("SELECT COUNT(*) FROM time_window_rules", [], |row| row.get(0))?;
        if count > 0 {
            return Ok(0);
        }

        let defaults = default_windows();
        for window in &defaults {
            self.create(window)?;
        }
        info!(count = defaults.len(), "Seeded default time windows");
        Ok(defaults.len())
    }
}

/// Checks a rule and returns its days sorted and deduplicated
fn validated_days(rule: &NewTimeWindow) -> Result<Vec<u8>> {
    if rule.days_of_week.iter().any(|d| *d > 6) {
        return Err(GatewayError::InvalidInput(
            "days_of_week entries must be 0 (Monday) through 6 (Sunday)".into(),
        ));
    }
    if rule.start_time == rule.end_time {
        return Err(GatewayError::InvalidInput(
            "start_time and end_time must differ".into(),
        ));
    }

    let mut days = rule.days_of_week.clone();
    days.sort_unstable();
    days.dedup();
    Ok(days)
}

fn default_windows() -> Vec<NewTimeWindow> {
    use time::macros::time;

    let weekdays = vec![0, 1, 2, 3, 4];
    let window = |punch_type, start, end, priority, description: &str| NewTimeWindow {
        punch_type,
        start_time: start,
        end_time: end,
        days_of_week: weekdays.clone(),
        priority,
        active: true,
        description: Some(description.to_string()),
    };

    vec![
        window(PunchType::CheckIn, time!(06:00), time!(10:00), 1, "Morning check-in (Mon-Fri)"),
        window(PunchType::BreakOut, time!(11:30), time!(12:30), 2, "Lunch break start (Mon-Fri)"),
        window(PunchType::BreakIn, time!(12:30), time!(14:00), 3, "Lunch break end (Mon-Fri)"),
        window(PunchType::CheckOut, time!(16:00), time!(20:00), 4, "Evening check-out (Mon-Fri)"),
        window(PunchType::OvertimeIn, time!(20:00), time!(22:00), 5, "Overtime start (Mon-Fri)"),
        // Ends at midnight so the whole 23:59 minute is covered
        window(PunchType::OvertimeOut, time!(22:00), time!(00:00), 6, "Overtime end (Mon-Fri)"),
    ]
}

fn map_rule(row: &Row<'_>) -> rusqlite::Result<TimeWindowRule> {
    let invalid = |index: usize, message: String| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            message.into(),
        )
    };

    let punch_type: String = row.get(1)?;
    let start: String = row.get(2)?;
    let end: String = row.get(3)?;
    let days: String = row.get(4)?;

    Ok(TimeWindowRule {
        id: row.get(0)?,
        punch_type: punch_type.parse().map_err(|e| invalid(1, e))?,
        start_time: clock_time::parse(&start).map_err(|e| invalid(2, e))?,
        end_time: clock_time::parse(&end).map_err(|e| invalid(3, e))?,
        days_of_week: parse_days_column(&days).map_err(|e| invalid(4, e))?,
        priority: row.get(5)?,
        active: row.get(6)?,
        description: row.get(7)?,
    })
}
