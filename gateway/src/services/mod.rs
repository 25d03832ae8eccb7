pub mod classifier;
pub mod collaborators;
pub mod command_queue;
pub mod ingestion;
pub mod locks;
pub mod registry;
pub mod sweeper;
pub mod time_windows;

pub use collaborators::{AuditSink, EmployeeDirectory, UserSync};
pub use command_queue::{CommandQueue, ReportOutcome};
pub use ingestion::{AttendanceIngestor, IngestionReport, PunchTypeSource};
pub use registry::{DeviceMetadata, DeviceRegistry};
pub use sweeper::command_sweeper;
pub use time_windows::TimeWindowStore;
