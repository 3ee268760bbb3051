// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod config;
pub mod envelope;
pub mod fs;
pub mod task;

pub use config::{ConfigError, DispatchMode, FleetConfig};
pub use envelope::{Envelope, MessageType, SCHEMA_VERSION};
pub use task::{Task, TaskState, TransitionError};
