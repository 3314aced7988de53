//! Bounded record channel between handler invocations and the poll loop.
//!
//! Producers are cheap clones of [`TelemetryProducer`] and never block: when
//! the buffer is full the record is dropped and the shared drop counter goes
//! up. The single [`TelemetryConsumer`] drains whatever is queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{
    sync_channel, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError,
};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::record::Record;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("telemetry channel full, record dropped")]
pub struct Dropped;

/// Anything the poll loop can drain records from.
pub trait TelemetrySource {
    /// Wait up to `timeout` for records and hand each one to `callback` in
    /// arrival order. Returns how many records were delivered.
    fn poll(&mut self, timeout: Duration, callback: &mut dyn FnMut(Record)) -> Result<usize>;

    /// Records lost so far because the buffer was full.
    fn dropped(&self) -> u64;
}

pub struct TelemetryChannel;

impl TelemetryChannel {
    /// Create a channel that holds at most `capacity` undelivered records.
    pub fn bounded(capacity: usize) -> (TelemetryProducer, TelemetryConsumer) {
        // A zero sized sync_channel is a rendezvous channel, which would drop
        // everything submitted while the consumer isn't parked in recv.
        let capacity = capacity.max(1);
        let (tx, rx) = sync_channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        (
            TelemetryProducer {
                tx,
                dropped: dropped.clone(),
            },
            TelemetryConsumer {
                rx,
                dropped,
                capacity,
            },
        )
    }
}

#[derive(Clone)]
pub struct TelemetryProducer {
    tx: SyncSender<Record>,
    dropped: Arc<AtomicU64>,
}

impl TelemetryProducer {
    pub fn submit(&self, record: Record) -> Result<(), Dropped> {
        match self.tx.try_send(record) {
            Ok(()) => Ok(()),
            // A gone consumer is the same as a full buffer from the producer's
            // point of view, nobody is going to see this record.
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(Dropped)
            }
        }
    }
}

pub struct TelemetryConsumer {
    rx: Receiver<Record>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

impl TelemetryConsumer {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drain every record queued right now without waiting.
    ///
    /// At most `capacity` records can be queued at once, so stopping there
    /// keeps a busy producer from pinning the consumer in here forever.
    pub fn drain<F>(&mut self, mut callback: F) -> usize
    where
        F: FnMut(Record),
    {
        let mut count = 0;
        while count < self.capacity {
            match self.rx.try_recv() {
                Ok(record) => {
                    callback(record);
                    count += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        count
    }

    /// Wait up to `timeout` for the first record, then drain the rest.
    pub fn drain_timeout<F>(&mut self, timeout: Duration, mut callback: F) -> usize
    where
        F: FnMut(Record),
    {
        match self.rx.recv_timeout(timeout) {
            Ok(record) => {
                callback(record);
                1 + self.drain(callback)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TelemetrySource for TelemetryConsumer {
    fn poll(&mut self, timeout: Duration, callback: &mut dyn FnMut(Record)) -> Result<usize> {
        Ok(self.drain_timeout(timeout, callback))
    }

    fn dropped(&self) -> u64 {
        TelemetryConsumer::dropped(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_submit_then_poll_delivers_once() {
        let (producer, mut consumer) = TelemetryChannel::bounded(8);
        let record = Record::new(100, 1000, b"bash", b"Hello World");
        producer.submit(record).unwrap();

        let mut seen = Vec::new();
        assert_eq!(consumer.drain(|r| seen.push(r)), 1);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].to_bytes(), record.to_bytes());

        assert_eq!(consumer.drain(|r| seen.push(r)), 0);
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_overflow_drops_and_counts() {
        let (producer, mut consumer) = TelemetryChannel::bounded(4);
        let mut results = Vec::new();
        for i in 0..10 {
            results.push(producer.submit(Record::new(i, 0, b"cmd", b"msg")));
        }
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 4);
        assert_eq!(results.iter().filter(|r| **r == Err(Dropped)).count(), 6);
        assert_eq!(consumer.dropped(), 6);

        let mut seen = Vec::new();
        consumer.drain(|r| seen.push(r));
        assert_eq!(seen.len(), 4);
        for (i, record) in seen.iter().enumerate() {
            assert_eq!(*record, Record::new(i as i32, 0, b"cmd", b"msg"));
        }
    }

    #[test]
    fn test_per_producer_fifo() {
        let (producer, mut consumer) = TelemetryChannel::bounded(4096);
        let handles: Vec<_> = (0..4)
            .map(|p| {
                let producer = producer.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        producer.submit(Record::new(i, p, b"worker", b"tick")).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut last = [-1i32; 4];
        let total = consumer.drain(|r| {
            let p = r.uid as usize;
            assert!(r.pid > last[p]);
            last[p] = r.pid;
        });
        assert_eq!(total, 2000);
        assert_eq!(consumer.dropped(), 0);
    }

    #[test]
    fn test_drain_timeout_empty() {
        let (_producer, mut consumer) = TelemetryChannel::bounded(1);
        assert_eq!(consumer.drain_timeout(Duration::from_millis(10), |_| {}), 0);
    }

    #[test]
    fn test_submit_after_consumer_gone() {
        let (producer, consumer) = TelemetryChannel::bounded(1);
        drop(consumer);
        assert_eq!(producer.submit(Record::default()), Err(Dropped));
    }
}
