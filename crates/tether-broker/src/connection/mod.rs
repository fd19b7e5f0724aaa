//! Connection management

mod health;
mod manager;
mod pool;

pub use health::HealthMonitor;
pub use manager::{ConnectionManager, RegisterOutcome};
pub use pool::{AgentCommand, AgentResponse, ConnectionPool, StreamEvent, TunnelHandle};
