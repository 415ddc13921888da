pub mod config;
pub mod error;
pub mod logs;
pub mod ports;
pub mod runs;
pub mod server;
pub mod telemetry;
pub mod workspace;

pub use config::Config;
pub use error::{ErrorBody, RunError};
pub use runs::RunOrchestrator;
