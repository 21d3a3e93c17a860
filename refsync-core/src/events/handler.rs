use std::future::Future;

use async_trait::async_trait;
use refsync_sdk::objects::{Envelope, EventType};

use super::DispatchOutcome;

/// Processes validated envelopes of the types it was registered for.
///
/// Handlers run on the subscriber's receive task, one message at a time,
/// so a slow handler throttles that subscriber.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, kind: EventType, envelope: Envelope) -> DispatchOutcome;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(EventType, Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = DispatchOutcome> + Send,
{
    async fn handle(&self, kind: EventType, envelope: Envelope) -> DispatchOutcome {
        (self)(kind, envelope).await
    }
}
