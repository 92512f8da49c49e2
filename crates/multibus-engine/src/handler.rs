//! The subscriber-facing callable shape: `(event) -> ()`, async, no
//! inheritance tree (spec §9: "a handler is a single-method callable").

use async_trait::async_trait;
use multibus_core::Event;

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: Event);
}

/// Adapts any `Fn(Event) -> Fut` closure into a [`Handler`], so callers
/// don't need to hand-write a struct for simple subscriptions.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn handle(&self, event: Event) {
        (self.f)(event).await
    }
}
