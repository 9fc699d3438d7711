//! SignBridge Core
//!
//! Session state, frame decoding, inference dispatch and sign lookup for the
//! SignBridge realtime service. Nothing in this crate knows about HTTP or
//! WebSockets; the transport lives in `signbridge-api`.

pub mod dispatcher;
pub mod frame;
pub mod lookup;
pub mod provider;
pub mod reorder;
pub mod session;
pub mod types;
