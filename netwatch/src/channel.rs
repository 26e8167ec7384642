use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use metrics::counter;
use netwatch_common::{EventSink, PacketEvent};
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};

/// Fan-in from the per-CPU readers to the monitor. Producers only ever
/// `try_send`; when the queue is full the event is counted and dropped.
#[derive(Clone)]
pub struct EventChannel {
    tx: Sender<PacketEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventChannel {
    pub fn bounded(capacity: usize) -> (Self, Receiver<PacketEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let channel = EventChannel {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (channel, rx)
    }

    /// Shared drop counter, readable after every sender is gone.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

impl EventSink for EventChannel {
    fn emit(&self, event: &PacketEvent) {
        match self.tx.try_send(*event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("netwatch_channel_dropped_total").increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dropped(channel: &EventChannel) -> u64 {
        channel.dropped_counter().load(Ordering::Relaxed)
    }

    fn event(ktime_ns: u64) -> PacketEvent {
        let mut event = PacketEvent::zeroed();
        event.action = 2;
        event.ktime_ns = ktime_ns;
        event
    }

    #[tokio::test]
    async fn delivers_in_order_per_producer() {
        let (channel, mut rx) = EventChannel::bounded(4);
        channel.emit(&event(1));
        channel.emit(&event(2));
        drop(channel);

        assert_eq!(rx.recv().await.map(|e| e.ktime_ns), Some(1));
        assert_eq!(rx.recv().await.map(|e| e.ktime_ns), Some(2));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn full_channel_drops_without_blocking() {
        let (channel, mut rx) = EventChannel::bounded(2);
        for t in 0..5 {
            channel.emit(&event(t));
        }
        assert_eq!(dropped(&channel), 3);

        assert_eq!(rx.recv().await.map(|e| e.ktime_ns), Some(0));
        channel.emit(&event(9));
        assert_eq!(dropped(&channel), 3);
    }

    #[tokio::test]
    async fn clones_share_the_counter() {
        let (channel, rx) = EventChannel::bounded(1);
        let producers: Vec<EventChannel> = (0..4).map(|_| channel.clone()).collect();
        let counter = channel.dropped_counter();
        for p in &producers {
            p.emit(&event(0));
        }
        drop(rx);
        channel.emit(&event(0));

        assert_eq!(counter.load(Ordering::Relaxed), 4);
    }
}
