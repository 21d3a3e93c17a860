//! Application state shared across the consumer's status handlers.

use std::sync::Arc;

use refsync_core::processors::MessageDispatcher;
use refsync_core::subscriber::Subscriber;

/// Cloneable and cheap to pass around (everything is behind Arc).
#[derive(Clone)]
pub struct AppState {
    pub subscriber: Arc<Subscriber>,
    pub dispatcher: Arc<MessageDispatcher>,
}

impl AppState {
    pub fn new(subscriber: Arc<Subscriber>, dispatcher: Arc<MessageDispatcher>) -> Self {
        Self {
            subscriber,
            dispatcher,
        }
    }
}
