pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod gateway;
pub mod logging;
pub mod protocol;
pub mod punch;
pub mod services;
pub mod state;

pub use config::Config;
pub use db::{Database, DbError};
pub use errors::{GatewayError, Result};
pub use gateway::ProtocolGateway;
pub use state::AppState;
