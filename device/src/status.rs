use alloc::{sync::Arc, vec::Vec};
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use spin::Mutex;

/// Broadcasts device status changes to every session of an instrument
/// endpoint.
///
/// Each session holds a [Receiver] which announces at most one service
/// request per status query: after a status byte is taken the receiver
/// latches and swallows further changes until [Receiver::rearm] is called.
#[derive(Clone)]
pub struct Sender {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<u8>>>>,
}

impl Sender {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Push a status byte to every live subscriber.
    /// Subscribers whose session has gone away are pruned.
    pub fn send_status(&mut self, status: u8) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain_mut(|subscriber| {
            let _ = subscriber.try_send(status);
            !subscriber.is_closed()
        });
    }

    /// Subscribe a new session. The receiver starts armed so the first
    /// status change is announced.
    pub fn subscribe(&mut self) -> Receiver {
        let (sender, events) = mpsc::channel(1);
        self.subscribers.lock().push(sender);
        Receiver {
            events,
            armed: true,
        }
    }
}

impl Default for Sender {
    fn default() -> Self {
        Self::new()
    }
}

/// A session's subscription to status changes.
///
/// Yields the status bytes that warrant a service request. The stream ends
/// when the endpoint's [Sender] is dropped.
pub struct Receiver {
    events: mpsc::Receiver<u8>,
    armed: bool,
}

impl Receiver {
    /// Re-arm the latch, typically once a status query has delivered the
    /// status byte to the client.
    pub fn rearm(&mut self) {
        self.armed = true;
    }
}

impl Stream for Receiver {
    type Item = u8;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<u8>> {
        let this = self.get_mut();
        loop {
            match this.events.poll_next_unpin(cx) {
                Poll::Ready(Some(status)) if this.armed => {
                    this.armed = false;
                    break Poll::Ready(Some(status));
                }
                // The previous service request has not been acknowledged by
                // a status query yet
                Poll::Ready(Some(_)) => continue,
                Poll::Ready(None) => break Poll::Ready(None),
                Poll::Pending => break Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::{FutureExt, StreamExt};

    #[test]
    fn test_broadcast() {
        let mut status = Sender::new();
        let mut first = status.subscribe();
        let mut second = status.clone().subscribe();

        status.send_status(0x42);

        assert_eq!(block_on(first.next()), Some(0x42));
        assert_eq!(block_on(second.next()), Some(0x42));
    }

    #[test]
    fn test_latch() {
        let mut status = Sender::new();
        let mut subscriber = status.subscribe();

        status.send_status(1);
        assert_eq!(block_on(subscriber.next()), Some(1));

        // Discarded until the latch is re-armed
        status.send_status(2);
        assert_eq!(subscriber.next().now_or_never(), None);

        subscriber.rearm();
        status.send_status(3);
        assert_eq!(block_on(subscriber.next()), Some(3));
    }

    #[test]
    fn test_endpoint_gone() {
        let mut status = Sender::new();
        let mut subscriber = status.subscribe();

        drop(status);
        assert_eq!(block_on(subscriber.next()), None);
    }
}
