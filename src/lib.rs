pub mod config;
pub mod error;
pub mod replicator;
pub mod session;

pub mod postgres;
pub mod sink;

pub use config::Config;
pub use error::{Error, Result};
pub use replicator::Replicator;
pub use session::{ReplicationSession, SessionOptions, SessionPhase, SessionState, SessionStats};
