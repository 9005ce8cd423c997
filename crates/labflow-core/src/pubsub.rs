//! # In-process broadcast queue.
//!
//! [`PubSub`] has one producer side and any number of dynamically attached
//! consumers. Every [`Subscription`] is a private, unbounded, order-preserving
//! sequence of the messages published **after** it was created.
//!
//! ```text
//! publish() ──► PubSub ──┬──► Subscription 1
//!                        ├──► Subscription 2
//!                        └──► Subscription N
//! ```
//!
//! ## Rules
//! - **Broadcast**: every subscriber receives every message; nothing is load-balanced.
//! - **Non-blocking publish**: `publish()` never waits on a consumer.
//! - **No replay**: a subscriber never sees messages published before it subscribed.
//! - **Shutdown sentinel**: [`PubSub::shutdown`] ends every live subscription
//!   instead of being delivered as data. Later subscriptions end immediately.
//! - Subscriptions that were dropped are pruned on the next publish.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

enum Envelope<T> {
    Data(T),
    Shutdown,
}

struct Inner<T> {
    subscribers: Vec<mpsc::UnboundedSender<Envelope<T>>>,
    closed: bool,
}

/// Cloneable handle to a broadcast queue.
pub struct PubSub<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for PubSub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for PubSub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> PubSub<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                subscribers: Vec::new(),
                closed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver `msg` to every live subscriber. Returns how many received it.
    ///
    /// Publishing after [`shutdown`](Self::shutdown) is a no-op.
    pub fn publish(&self, msg: T) -> usize {
        let mut inner = self.lock();
        if inner.closed {
            return 0;
        }
        inner
            .subscribers
            .retain(|tx| tx.send(Envelope::Data(msg.clone())).is_ok());
        inner.subscribers.len()
    }

    /// Attach a new consumer that sees every message published from now on.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if inner.closed {
            let _ = tx.send(Envelope::Shutdown);
        } else {
            inner.subscribers.push(tx);
        }
        Subscription { rx, done: false }
    }

    /// End every live subscription.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        for tx in inner.subscribers.drain(..) {
            let _ = tx.send(Envelope::Shutdown);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }
}

/// One consumer's view of a [`PubSub`] queue.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<Envelope<T>>,
    done: bool,
}

impl<T> Subscription<T> {
    /// Next message, or `None` once the queue has shut down.
    pub async fn recv(&mut self) -> Option<T> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(Envelope::Data(msg)) => Some(msg),
            Some(Envelope::Shutdown) | None => {
                self.done = true;
                None
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<T> {
        if self.done {
            return None;
        }
        match self.rx.try_recv() {
            Ok(Envelope::Data(msg)) => Some(msg),
            Ok(Envelope::Shutdown) | Err(mpsc::error::TryRecvError::Disconnected) => {
                self.done = true;
                None
            }
            Err(mpsc::error::TryRecvError::Empty) => None,
        }
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Envelope::Data(msg))) => Poll::Ready(Some(msg)),
            Poll::Ready(Some(Envelope::Shutdown)) | Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn every_subscriber_gets_every_message() {
        let q = PubSub::new();
        let mut a = q.subscribe();
        let mut b = q.subscribe();
        q.publish(1);
        q.publish(2);
        q.shutdown();
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(a.recv().await, None);
        let collected: Vec<i32> = (&mut b).collect().await;
        assert_eq!(collected, vec![1, 2]);
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_messages() {
        let q = PubSub::new();
        q.publish("early");
        let mut late = q.subscribe();
        q.publish("late");
        q.shutdown();
        assert_eq!(late.recv().await, Some("late"));
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn subscribe_after_shutdown_ends_immediately() {
        let q: PubSub<u8> = PubSub::new();
        q.shutdown();
        let mut s = q.subscribe();
        assert_eq!(s.recv().await, None);
        assert_eq!(q.publish(1), 0);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let q = PubSub::new();
        let keep = q.subscribe();
        let gone = q.subscribe();
        drop(gone);
        assert_eq!(q.publish(7u8), 1);
        assert_eq!(q.subscriber_count(), 1);
        drop(keep);
    }

    #[test]
    fn publish_never_blocks_without_consumers_reading() {
        let q = PubSub::new();
        let mut s = q.subscribe();
        for i in 0..10_000u32 {
            q.publish(i);
        }
        assert_eq!(s.try_recv(), Some(0));
    }
}
