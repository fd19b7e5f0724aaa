//! tether-broker: Broker daemon accepting reverse tunnels
//!
//! The broker accepts outbound-initiated SSH connections from remote
//! agents, verifies each machine's identity on every reconnect
//! (trust-on-first-use), tracks per-machine metadata and policy, and
//! dispatches remote operations over the live tunnels. Operator tools
//! drive it through a localhost control socket; lifecycle and audit
//! events go out as signed webhooks.

pub mod connection;
pub mod control;
pub mod directory;
pub mod dispatch;
pub mod ratelimit;
pub mod server;
pub mod state;
pub mod trust;
pub mod webhook;

pub use dispatch::Dispatcher;
pub use state::BrokerState;
