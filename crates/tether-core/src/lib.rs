//! tether-core: Core types, errors, and configuration for the Tether broker
//!
//! This crate provides the machine record model, the dispatch error
//! taxonomy, the control-surface message types, and configuration
//! structures shared by the broker and by tools driving it.

pub mod config;
pub mod control;
pub mod error;
pub mod machine;
pub mod time;
pub mod types;

pub use error::{DispatchError, TetherError};
pub use machine::{MachineQuery, MachineRecord, MachineSummary, MachineUpdate};
pub use types::MachineId;
