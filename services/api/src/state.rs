//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds all shared,
//! clonable resources: the sign index, the inference dispatcher, the frame
//! decoder and the live session registry.

use crate::{config::Config, registry::SessionRegistry};
use arc_swap::ArcSwap;
use signbridge_core::{
    dispatcher::InferenceDispatcher, frame::FrameDecoder, lookup::SignIndex,
    provider::RecognitionProvider,
};
use std::sync::Arc;
use tokio::sync::watch;

/// The shared application state, created once at startup and passed to all handlers.
/// All fields are public to be accessible from other modules.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Swapped wholesale on rebuild; readers keep whichever index they loaded.
    pub sign_index: Arc<ArcSwap<SignIndex>>,
    pub dispatcher: Arc<InferenceDispatcher>,
    pub decoder: FrameDecoder,
    pub sessions: Arc<SessionRegistry>,
    /// Flips to `true` when the server begins shutting down.
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(
        config: Config,
        sign_index: SignIndex,
        provider: Arc<dyn RecognitionProvider>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let dispatcher = InferenceDispatcher::new(provider, config.dispatch);
        let decoder = FrameDecoder::new(config.max_frame_bytes, config.max_frame_dimension);
        Self {
            config: Arc::new(config),
            sign_index: Arc::new(ArcSwap::from_pointee(sign_index)),
            dispatcher: Arc::new(dispatcher),
            decoder,
            sessions: Arc::new(SessionRegistry::new()),
            shutdown,
        }
    }
}
