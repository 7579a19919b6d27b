//! Side-effecting helpers: configuration, backends and child processes.

pub mod config;
pub mod gateway;
pub mod hosted;
pub mod http;
pub mod process;
pub mod subprocess;
pub mod transport;
