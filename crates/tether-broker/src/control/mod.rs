//! Control surface server

mod server;

pub use server::ControlServer;
