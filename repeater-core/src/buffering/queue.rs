//! Bounded FIFO of completed capture buffers between the duplex loops.
//!
//! Backed by a `crossbeam_channel::bounded` channel. The producer side also
//! holds a receiver clone so that, when the channel is full, it can evict the
//! oldest queued buffer itself instead of blocking the capture loop.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use super::capture::CaptureBuffer;

/// Result of handing a completed buffer to the queue.
#[derive(Debug)]
pub enum PushOutcome {
    Enqueued,
    /// The queue was full: the oldest unplayed buffer was dropped to make room.
    DroppedOldest { dropped: CaptureBuffer },
    /// The channel is disconnected; the buffer was discarded.
    Closed,
}

/// Result of waiting on the queue.
#[derive(Debug)]
pub enum QueuePop {
    Buffer(CaptureBuffer),
    Empty,
    Closed,
}

/// Capture-loop half of the queue.
pub struct QueueProducer {
    tx: Sender<CaptureBuffer>,
    evict: Receiver<CaptureBuffer>,
    dropped: Arc<AtomicUsize>,
}

/// Playback-loop half of the queue.
pub struct QueueConsumer {
    rx: Receiver<CaptureBuffer>,
}

/// Create a queue holding at most `capacity` buffers (minimum 1).
pub fn buffer_queue(capacity: usize) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (
        QueueProducer {
            tx,
            evict: rx.clone(),
            dropped: Arc::new(AtomicUsize::new(0)),
        },
        QueueConsumer { rx },
    )
}

impl QueueProducer {
    /// Enqueue without ever blocking. On overflow the oldest buffer is dropped.
    pub fn push(&self, buffer: CaptureBuffer) -> PushOutcome {
        let mut item = buffer;
        let mut evicted = None;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => {
                    return match evicted {
                        Some(dropped) => PushOutcome::DroppedOldest { dropped },
                        None => PushOutcome::Enqueued,
                    };
                }
                Err(TrySendError::Full(back)) => {
                    item = back;
                    // The consumer may have emptied a slot in between; then the
                    // retry succeeds without evicting.
                    if let Ok(oldest) = self.evict.try_recv() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        evicted = Some(oldest);
                    }
                }
                Err(TrySendError::Disconnected(_)) => return PushOutcome::Closed,
            }
        }
    }

    /// Total buffers dropped by overflow since creation.
    pub fn dropped_total(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(0)
    }
}

impl QueueConsumer {
    /// Wait up to `timeout` for the next completed buffer.
    pub fn pop_timeout(&self, timeout: Duration) -> QueuePop {
        match self.rx.recv_timeout(timeout) {
            Ok(buffer) => QueuePop::Buffer(buffer),
            Err(RecvTimeoutError::Timeout) => QueuePop::Empty,
            Err(RecvTimeoutError::Disconnected) => QueuePop::Closed,
        }
    }

    pub fn try_pop(&self) -> Option<CaptureBuffer> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(id: u64) -> CaptureBuffer {
        CaptureBuffer::from_samples(id, vec![id as i16; 8])
    }

    #[test]
    fn fifo_order_is_preserved() {
        let (tx, rx) = buffer_queue(4);
        for id in 0..3 {
            assert!(matches!(tx.push(buf(id)), PushOutcome::Enqueued));
        }
        let ids: Vec<u64> = std::iter::from_fn(|| rx.try_pop()).map(|b| b.id()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn overflow_drops_oldest_and_keeps_order() {
        let (tx, rx) = buffer_queue(2);
        tx.push(buf(1));
        tx.push(buf(2));
        match tx.push(buf(3)) {
            PushOutcome::DroppedOldest { dropped } => assert_eq!(dropped.id(), 1),
            other => panic!("expected a drop, got {other:?}"),
        }
        assert_eq!(tx.dropped_total(), 1);
        assert_eq!(rx.len(), 2);
        let ids: Vec<u64> = std::iter::from_fn(|| rx.try_pop()).map(|b| b.id()).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn empty_queue_times_out() {
        let (_tx, rx) = buffer_queue(1);
        assert!(matches!(
            rx.pop_timeout(Duration::from_millis(5)),
            QueuePop::Empty
        ));
    }

    #[test]
    fn dropped_producer_reports_closed() {
        let (tx, rx) = buffer_queue(1);
        drop(tx);
        assert!(matches!(
            rx.pop_timeout(Duration::from_millis(5)),
            QueuePop::Closed
        ));
    }
}
