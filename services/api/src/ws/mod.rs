//! WebSocket Session Management
//!
//! This module contains the realtime side of the service:
//!
//! - `protocol`: Defines the JSON-based message format for client-server communication.
//! - `session`: Manages the WebSocket connection lifecycle, from connect to disconnect.

pub mod protocol;
pub mod session;

pub use session::ws_handler;
