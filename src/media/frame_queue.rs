//! Bounded hand-off queues between the media threads and the event loop.
//!
//! The producer side never blocks: when the queue is full the item is dropped and
//! counted.  The consumer side waits with a timeout.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError},
    Arc,
};
use std::time::Duration;

pub fn frame_queue<T>(capacity: usize) -> (FrameSink<T>, FrameSource<T>) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        FrameSink {
            tx: tx,
            dropped: dropped.clone(),
        },
        FrameSource {
            rx: rx,
            dropped: dropped,
        },
    )
}

pub struct FrameSink<T> {
    tx: SyncSender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for FrameSink<T> {
    fn clone(&self) -> Self {
        FrameSink {
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl<T> FrameSink<T> {
    /// Hand an item over without blocking.  False if it was dropped.
    pub fn offer(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct FrameSource<T> {
    rx: Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> FrameSource<T> {
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
    /// None on timeout or when every sink is gone
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
    /// everything waiting right now
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test_frame_queue {
    use super::*;
    use std::thread;

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (sink, source) = frame_queue::<u32>(2);
        assert!(sink.offer(1));
        assert!(sink.offer(2));
        assert!(!sink.offer(3));
        assert_eq!(source.dropped(), 1);
        assert_eq!(source.drain(), vec![1, 2]);
        assert!(source.try_recv().is_none());
    }

    #[test]
    fn crosses_threads() {
        let (sink, source) = frame_queue::<u32>(8);
        let handle = thread::spawn(move || {
            for i in 0..5 {
                sink.offer(i);
            }
        });
        let mut got = vec![];
        while got.len() < 5 {
            match source.recv_timeout(Duration::from_millis(500)) {
                Some(i) => got.push(i),
                None => break,
            }
        }
        handle.join().unwrap();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn times_out_when_empty() {
        let (_sink, source) = frame_queue::<u32>(1);
        assert_eq!(source.recv_timeout(Duration::from_millis(5)), None);
    }
}
