//! Client protocol and event delivery for the speakd daemon
//!
//! This crate is transport-agnostic: it parses inbound JSON frames into typed
//! [`ClientMessage`]s, serializes [`ServerEvent`]s into text frames, and keeps
//! the registry of connected clients. The daemon's WebSocket layer only moves
//! frames between sockets and these types.
//!
//! # Wire format
//!
//! Every text frame is `{"type": .., "timestamp": .., "data": {..}}`.
//!
//! Client → daemon: `start_session`, `audio_chunk`, `end_stream`, `control`,
//! `heartbeat`, `status`, `timing_analysis`. Audio may also arrive as a raw
//! binary frame.
//!
//! Daemon → client: `session_started`, `status`, `timing_analysis`,
//! `state_change`, `completed`, `error`, `heartbeat`, `telemetry`.
//!
//! # Example Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use speakd_broadcaster::{Broadcaster, ClientMessage, ServerEvent};
//!
//! # async fn demo() {
//! let broadcaster = Broadcaster::new(Duration::from_secs(30));
//! let (client, mut outbound) = broadcaster.connect().await;
//!
//! match ClientMessage::parse(r#"{"type":"heartbeat"}"#) {
//!     Ok(ClientMessage::Heartbeat) => {
//!         broadcaster.heartbeat(client).await;
//!         broadcaster
//!             .send(client, &ServerEvent::Heartbeat { uptime_secs: 1.0 })
//!             .await;
//!     }
//!     _ => {}
//! }
//!
//! let frame = outbound.recv().await;
//! # }
//! ```

pub mod broadcaster;
pub mod client;
pub mod error;
pub mod events;
pub mod protocol;
pub mod throttle;

// Re-exports
pub use broadcaster::Broadcaster;
pub use client::{ClientId, ClientInfo, ClientManager};
pub use error::{BroadcasterError, ProtocolError, Result};
pub use events::{ErrorCode, ServerEvent, StatusSnapshot};
pub use protocol::{normalize_chunk, ClientMessage, ControlAction, WirePayload};
pub use throttle::LogThrottle;
