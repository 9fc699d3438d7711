//! SignBridge API Library Crate
//!
//! This library contains all the service-side logic: configuration, the
//! shared application state, the live session registry, REST handlers, the
//! WebSocket protocol and routing. The `api` binary is a thin wrapper around
//! this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod registry;
pub mod router;
pub mod state;
pub mod ws;
