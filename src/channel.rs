//! Bounded blocking channel.
//!
//! A fixed-capacity producer/consumer queue: senders block while the queue
//! is full (or drop the message via [`Sender::try_send`]), the receiver
//! blocks while it is empty, and [`Receiver::recv`] reports an error once
//! every sender is gone and the queue has drained. The buffer cache uses one
//! to feed sector read-ahead requests to its background worker.

use crate::sync::Semaphore;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use crossbeam_queue::ArrayQueue;

struct Inner<T> {
    queue: ArrayQueue<T>,
    // Permits for occupied and free slots respectively.
    items: Semaphore,
    space: Semaphore,
    senders: AtomicUsize,
}

/// The sending half of a channel.
pub struct Sender<T>(Arc<Inner<T>>);

/// The receiving half of a channel.
pub struct Receiver<T>(Arc<Inner<T>>);

/// Every [`Sender`] has been dropped and no further message will arrive.
#[derive(Debug, Eq, PartialEq)]
pub struct RecvError;

/// Creates a bounded channel with room for `cap` in-flight messages.
pub fn channel<T>(cap: usize) -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner {
        queue: ArrayQueue::new(cap),
        items: Semaphore::new(0),
        space: Semaphore::new(cap),
        senders: AtomicUsize::new(1),
    });
    (Sender(inner.clone()), Receiver(inner))
}

impl<T> Sender<T> {
    /// Sends `value`, blocking while the channel is full.
    pub fn send(&self, value: T) {
        self.0.space.down();
        if self.0.queue.push(value).is_err() {
            unreachable!("a space permit guarantees a free slot");
        }
        self.0.items.up();
    }

    /// Sends `value` if the channel has room, otherwise returns it back.
    ///
    /// This function does not block.
    pub fn try_send(&self, value: T) -> Result<(), T> {
        if self.0.space.try_down().is_err() {
            return Err(value);
        }
        if self.0.queue.push(value).is_err() {
            unreachable!("a space permit guarantees a free slot");
        }
        self.0.items.up();
        Ok(())
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.0.senders.fetch_add(1, Ordering::AcqRel);
        Sender(self.0.clone())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.0.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Wake the receiver so it can observe the disconnect.
            self.0.items.up();
        }
    }
}

impl<T> Receiver<T> {
    /// Receives the next message, blocking while the channel is empty.
    ///
    /// Returns [`RecvError`] once all senders are gone and the queue has
    /// been drained.
    pub fn recv(&self) -> Result<T, RecvError> {
        loop {
            self.0.items.down();
            if let Some(value) = self.0.queue.pop() {
                self.0.space.up();
                return Ok(value);
            }
            if self.0.senders.load(Ordering::Acquire) == 0 {
                // Leave the disconnect token for any other waiter.
                self.0.items.up();
                return Err(RecvError);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RecvError, channel};

    #[test]
    fn delivers_in_order_and_disconnects() {
        let (tx, rx) = channel(4);
        let producer = std::thread::spawn(move || {
            for i in 0..100 {
                tx.send(i);
            }
        });
        for i in 0..100 {
            assert_eq!(rx.recv(), Ok(i));
        }
        assert_eq!(rx.recv(), Err(RecvError));
        producer.join().unwrap();
    }

    #[test]
    fn try_send_refuses_when_full() {
        let (tx, rx) = channel(1);
        assert!(tx.try_send(1).is_ok());
        assert_eq!(tx.try_send(2), Err(2));
        assert_eq!(rx.recv(), Ok(1));
        assert!(tx.try_send(3).is_ok());
    }
}
