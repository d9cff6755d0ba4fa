//! speakd daemon library
//!
//! This module re-exports the daemon's modules for integration testing.

pub mod config;
mod keepalive;
mod playback;
pub mod player;
pub mod server;
pub mod session;
pub mod sink;

pub use config::DaemonConfig;
pub use server::DaemonServer;
pub use session::{SessionController, SessionError, SessionEvent};
