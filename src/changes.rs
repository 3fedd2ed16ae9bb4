//! Change notification bus.
//!
//! Every [`ChangeEvent`] produced by a worker is published here. Registered request caches are
//! cleared synchronously first, so a caller that awaits a mutation never reads a stale cached
//! entry afterwards; then the event is broadcast to subscribers on a bounded channel.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};

use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{trace, warn};

use crate::cache::RequestCache;
use crate::worker::ChangeEvent;

struct BusInner {
    sender: broadcast::Sender<ChangeEvent>,
    caches: Mutex<Vec<Weak<RequestCache>>>,
}

/// Global publish/subscribe point for change events. Clones share the same channel.
#[derive(Clone)]
pub struct ChangeBus {
    inner: Arc<BusInner>,
}

impl ChangeBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                sender,
                caches: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Clear `cache` on every future event. The bus holds a weak reference only.
    pub fn register_cache(&self, cache: &Arc<RequestCache>) {
        let mut caches = self.inner.caches.lock().unwrap_or_else(PoisonError::into_inner);
        caches.retain(|c| c.strong_count() > 0);
        caches.push(Arc::downgrade(cache));
    }

    /// Invalidate registered caches for the event's table, then broadcast it.
    ///
    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        {
            let mut caches = self.inner.caches.lock().unwrap_or_else(PoisonError::into_inner);
            caches.retain(|weak| match weak.upgrade() {
                Some(cache) => {
                    cache.clear_table(&event.table);
                    true
                }
                None => false,
            });
        }
        trace!(kind = %event.kind, table = %event.table, "change published");
        self.inner.sender.send(event).unwrap_or(0)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.sender.subscribe()
    }

    /// Stream of every event published after this call.
    #[must_use]
    pub fn stream(&self) -> ChangeStream {
        ChangeStream::new(self.subscribe())
    }

    /// Stream of events for the given tables only.
    #[must_use]
    pub fn stream_for<I, S>(&self, tables: I) -> ChangeStream
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stream().filter_tables(tables.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

/// Item of a [`ChangeStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeNotice {
    Change(ChangeEvent),
    /// The subscriber fell behind and this many events were dropped.
    Lagged(u64),
}

/// Filtered stream over a bus subscription.
pub struct ChangeStream {
    inner: BroadcastStream<ChangeEvent>,
    tables: Option<Vec<String>>,
}

impl ChangeStream {
    #[must_use]
    pub fn new(receiver: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
            tables: None,
        }
    }

    #[must_use]
    pub fn filter_tables(mut self, tables: Vec<String>) -> Self {
        self.tables = Some(tables);
        self
    }
}

impl Stream for ChangeStream {
    type Item = ChangeNotice;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if let Some(tables) = &self.tables
                        && !tables.contains(&event.table)
                    {
                        continue;
                    }
                    return Poll::Ready(Some(ChangeNotice::Change(event)));
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(count)))) => {
                    warn!(missed = count, "change stream lagged");
                    return Poll::Ready(Some(ChangeNotice::Lagged(count)));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;
    use crate::types::RowValues;
    use crate::worker::ChangeKind;

    #[tokio::test]
    async fn filtered_stream_skips_other_tables() {
        let bus = ChangeBus::new(8);
        let mut stream = bus.stream_for(["items"]);
        bus.publish(ChangeEvent::new(ChangeKind::Insert, "tags"));
        bus.publish(ChangeEvent::new(ChangeKind::Delete, "items"));
        assert_eq!(
            stream.next().await,
            Some(ChangeNotice::Change(ChangeEvent::new(ChangeKind::Delete, "items")))
        );
    }

    #[tokio::test]
    async fn slow_subscriber_sees_lag() {
        let bus = ChangeBus::new(2);
        let mut stream = bus.stream();
        for _ in 0..5 {
            bus.publish(ChangeEvent::new(ChangeKind::Update, "t"));
        }
        assert_eq!(stream.next().await, Some(ChangeNotice::Lagged(3)));
    }

    #[test]
    fn publish_clears_registered_caches() {
        let bus = ChangeBus::new(4);
        let cache = Arc::new(RequestCache::new(16));
        bus.register_cache(&cache);
        let epoch = cache.epoch();
        assert!(cache.memoize(&["items"], "count", RowValues::Int(3), epoch));
        bus.publish(ChangeEvent::new(ChangeKind::Insert, "items"));
        assert_eq!(cache.memoized("count"), None);

        drop(cache);
        bus.publish(ChangeEvent::new(ChangeKind::Insert, "items"));
        assert!(bus.inner.caches.lock().expect("lock").is_empty());
    }
}
