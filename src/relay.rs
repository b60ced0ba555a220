//! Unbounded hand-off between synchronous producers and one async consumer.
//!
//! Producers hold a [`RelaySender`] and may call [`RelaySender::push`] from
//! any context, including plain threads and callbacks that cannot await.
//! The single [`RelayReceiver`] pops items in push order until it observes
//! the end-of-stream marker written by [`RelaySender::close`].

use futures::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

enum Slot<T> {
    Item(T),
    End,
}

/// Create a connected sender/receiver pair.
pub fn channel<T>() -> (RelaySender<T>, RelayReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = RelaySender {
        tx: Arc::new(Mutex::new(Some(tx))),
    };
    let receiver = RelayReceiver {
        rx: UnboundedReceiverStream::new(rx),
        ended: false,
    };
    (sender, receiver)
}

/// Producer half. Cheap to clone; all clones share the same open/closed state.
pub struct RelaySender<T> {
    // `None` once closed. The lock is only held for a non-blocking send.
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<Slot<T>>>>>,
}

impl<T> Clone for RelaySender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T> RelaySender<T> {
    /// Append `item` to the tail. Never blocks and never fails.
    ///
    /// Items pushed after [`close`](Self::close), or after the receiver has
    /// been dropped, are discarded.
    pub fn push(&self, item: T) {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(Slot::Item(item));
        }
    }

    /// Write the end-of-stream marker. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        let mut guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.take() {
            Some(tx) => {
                let _ = tx.send(Slot::End);
                true
            }
            None => false,
        }
    }
}

/// Consumer half.
pub struct RelayReceiver<T> {
    rx: UnboundedReceiverStream<Slot<T>>,
    ended: bool,
}

impl<T> RelayReceiver<T> {
    /// Wait for the next item. `None` means end of stream: either the marker
    /// was popped or every sender is gone. Keeps returning `None` afterwards.
    pub async fn pop(&mut self) -> Option<T> {
        std::future::poll_fn(|cx| self.poll_pop(cx)).await
    }

    pub fn poll_pop(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        if self.ended {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.rx).poll_next(cx) {
            Poll::Ready(Some(Slot::Item(item))) => Poll::Ready(Some(item)),
            Poll::Ready(Some(Slot::End)) | Poll::Ready(None) => {
                self.ended = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}
