use crate::handler::Subscriber;
use crate::pipeline::Shared;
use std::sync::Arc;
use tracing::trace;

/// One link of a topic's handler chain.
///
/// A stage consumes the ring in publish order, but only as far as the stage before it
/// (or, for the first stage, the producer) has advanced. When its upstream closes, it
/// drains what is left, then closes its own barrier so the next stage does the same.
pub(crate) struct Stage<E, R> {
    shared: Arc<Shared<E, R>>,
    index: usize,
    subscriber: Subscriber<E, R>,
}

impl<E, R> Stage<E, R>
where
    E: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn new(shared: Arc<Shared<E, R>>, index: usize, subscriber: Subscriber<E, R>) -> Self {
        Self {
            shared,
            index,
            subscriber,
        }
    }

    pub(crate) async fn run(self) {
        let shared = &*self.shared;
        let upstream = shared.upstream(self.index);
        let own = &shared.stages[self.index];
        let is_last = self.index + 1 == shared.stages.len();

        let mut next = own.cursor() + 1;

        while let Ok(available) = upstream.wait_for(next, shared.wait_strategy).await {
            while next <= available {
                // SAFETY: the upstream barrier has advanced past `next`, so the previous
                // holder of this slot is done with it, and the producer cannot reuse the
                // slot until the last stage advances past `next`. This stage is the only
                // holder until it advances its own barrier below.
                let slot = unsafe { &mut *shared.buffer.get(next) };

                slot.apply(&self.subscriber).await;
                if is_last {
                    slot.finish();
                }

                own.advance_to(next);
                next += 1;
            }
        }

        own.close();
        trace!(topic = %shared.topic, processed = next, "stage drained");
    }
}
