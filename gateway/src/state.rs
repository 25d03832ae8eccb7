use crate::config::Config;
use crate::db::Database;
use crate::gateway::{EchoSettings, ProtocolGateway};
use crate::services::collaborators::{
    AuditSink, EmployeeDirectory, SqliteEmployeeDirectory, TracingAuditSink, TracingUserSync,
    UserSync,
};
use crate::services::command_queue::CommandQueue;
use crate::services::ingestion::AttendanceIngestor;
use crate::services::locks::DeviceLocks;
use crate::services::registry::DeviceRegistry;
use crate::services::time_windows::TimeWindowStore;
use std::sync::Arc;
use std::time::Duration;

/// Axum application state shared across all request handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: Database,
    pub registry: DeviceRegistry,
    pub queue: CommandQueue,
    pub ingestor: AttendanceIngestor,
    pub time_windows: TimeWindowStore,
    /// Terminal-facing protocol handling
    pub gateway: ProtocolGateway,
    pub audit: Arc<dyn AuditSink>,
    /// Age after which an unanswered command is swept
    pub stale_timeout: Duration,
}

impl AppState {
    /// Wire the services with the default collaborators
    pub fn new(db: Database, config: &Config) -> Self {
        let directory: Arc<dyn EmployeeDirectory> =
            Arc::new(SqliteEmployeeDirectory::new(db.clone()));
        Self::with_collaborators(
            db,
            config,
            directory,
            Arc::new(TracingAuditSink),
            Arc::new(TracingUserSync),
        )
    }

    /// Wire the services with caller-supplied collaborators
    pub fn with_collaborators(
        db: Database,
        config: &Config,
        directory: Arc<dyn EmployeeDirectory>,
        audit: Arc<dyn AuditSink>,
        user_sync: Arc<dyn UserSync>,
    ) -> Self {
        // One lock table shared by every component touching per-device state
        let locks = DeviceLocks::new();

        let registry = DeviceRegistry::new(db.clone(), locks.clone(), config.online_threshold());
        let queue = CommandQueue::new(db.clone(), locks, config.commands.max_attempts);
        let time_windows = TimeWindowStore::new(db.clone());
        let ingestor = AttendanceIngestor::new(
            db.clone(),
            time_windows.clone(),
            directory,
            config.ingestion.punch_type_source,
        );
        let gateway = ProtocolGateway::new(
            registry.clone(),
            ingestor.clone(),
            queue.clone(),
            user_sync,
            EchoSettings {
                poll_interval_secs: config.devices.poll_interval_secs,
                error_delay_secs: config.devices.error_delay_secs,
                utc_offset_minutes: config.devices.utc_offset_minutes,
            },
        );

        Self {
            db,
            registry,
            queue,
            ingestor,
            time_windows,
            gateway,
            audit,
            stale_timeout: config.stale_timeout(),
        }
    }
}
