//! Fan-out of encoded frames to any number of stream subscribers.
//!
//! Each subscriber owns a small latest-wins queue: when it is full the oldest
//! packet is dropped, so a slow viewer only ever loses its own frames and the
//! publisher never waits. A subscriber that leaves packets unread for longer
//! than the liveness window is evicted on the next publish.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::watch::data::FramePacket;

#[derive(Default)]
struct SlotQueue {
    packets: VecDeque<Arc<FramePacket>>,
    /// Set while packets are pending; reset whenever the subscriber reads.
    stalled_since: Option<Instant>,
    closed: bool,
}

#[derive(Default)]
struct SubscriberSlot {
    queue: Mutex<SlotQueue>,
    notify: Notify,
}

impl SubscriberSlot {
    fn lock(&self) -> MutexGuard<'_, SlotQueue> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }
}

pub(crate) struct StreamMultiplexer {
    subscribers: Mutex<HashMap<u64, Arc<SubscriberSlot>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    liveness_window: Duration,
}

impl StreamMultiplexer {
    pub(crate) fn new(queue_capacity: usize, liveness_window: Duration) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            liveness_window,
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, Arc<SubscriberSlot>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(SubscriberSlot::default());
        let count = {
            let mut subscribers = self.subscribers();
            subscribers.insert(id, slot.clone());
            subscribers.len()
        };
        metrics::gauge!("watch_stream_subscribers").set(count as f64);
        debug!(subscriber = id, "stream subscriber registered");
        Subscription {
            id,
            slot,
            mux: Arc::downgrade(self),
        }
    }

    /// Queue `packet` for every live subscriber and return how many received it.
    pub(crate) fn publish(&self, packet: Arc<FramePacket>) -> usize {
        let now = Instant::now();
        let mut subscribers = self.subscribers();
        let mut delivered = 0;
        let mut evicted = Vec::new();

        for (id, slot) in subscribers.iter() {
            let mut queue = slot.lock();
            if queue.closed {
                evicted.push(*id);
                continue;
            }
            let stalled = queue
                .stalled_since
                .is_some_and(|since| now.saturating_duration_since(since) > self.liveness_window);
            if stalled {
                queue.closed = true;
                drop(queue);
                slot.notify.notify_one();
                evicted.push(*id);
                continue;
            }
            if queue.packets.len() >= self.queue_capacity {
                queue.packets.pop_front();
                metrics::counter!("watch_stream_dropped_frames_total").increment(1);
            }
            queue.packets.push_back(packet.clone());
            queue.stalled_since.get_or_insert(now);
            drop(queue);
            slot.notify.notify_one();
            delivered += 1;
        }

        for id in evicted {
            subscribers.remove(&id);
            warn!(subscriber = id, "evicted stalled stream subscriber");
        }
        metrics::gauge!("watch_stream_subscribers").set(subscribers.len() as f64);
        delivered
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    fn unsubscribe(&self, id: u64) {
        let removed = self.subscribers().remove(&id);
        if let Some(slot) = removed {
            slot.close();
            debug!(subscriber = id, "stream subscriber left");
        }
    }
}

/// Receiving end of one stream subscriber. Dropping it unsubscribes.
pub(crate) struct Subscription {
    id: u64,
    slot: Arc<SubscriberSlot>,
    mux: Weak<StreamMultiplexer>,
}

impl Subscription {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Next pending packet without waiting.
    pub(crate) fn try_recv(&self) -> Option<Arc<FramePacket>> {
        let mut queue = self.slot.lock();
        let packet = queue.packets.pop_front();
        if packet.is_some() {
            queue.stalled_since = if queue.packets.is_empty() {
                None
            } else {
                Some(Instant::now())
            };
        }
        packet
    }

    /// Wait for the next packet. Returns `None` once the subscription has been
    /// evicted and its queue is drained.
    pub(crate) async fn recv(&self) -> Option<Arc<FramePacket>> {
        loop {
            let notified = self.slot.notify.notified();
            if let Some(packet) = self.try_recv() {
                return Some(packet);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(mux) = self.mux.upgrade() {
            mux.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use actix_web::web::Bytes;

    use super::*;
    use crate::watch::alert::AlertState;

    fn packet(frame_number: u64) -> Arc<FramePacket> {
        Arc::new(FramePacket {
            jpeg: Bytes::from_static(b"\xFF\xD8"),
            frame_number,
            timestamp_ms: frame_number as i64 * 40,
            fps: 25.0,
            alert: AlertState::Monitoring,
            annotated: true,
        })
    }

    fn drain(subscription: &Subscription) -> Vec<u64> {
        std::iter::from_fn(|| subscription.try_recv())
            .map(|packet| packet.frame_number)
            .collect()
    }

    #[test]
    fn slow_subscriber_keeps_only_latest_packets() {
        let mux = Arc::new(StreamMultiplexer::new(2, Duration::from_secs(10)));
        let slow = mux.subscribe();
        let fast = mux.subscribe();

        let mut fast_seen = Vec::new();
        for n in 1..=5 {
            assert_eq!(mux.publish(packet(n)), 2);
            fast_seen.extend(drain(&fast));
        }

        assert_eq!(fast_seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(drain(&slow), vec![4, 5]);
    }

    #[test]
    fn stalled_subscriber_is_evicted_on_publish() {
        let mux = Arc::new(StreamMultiplexer::new(2, Duration::from_millis(20)));
        let stalled = mux.subscribe();
        let healthy = mux.subscribe();

        mux.publish(packet(1));
        drain(&healthy);
        thread::sleep(Duration::from_millis(50));

        assert_eq!(mux.publish(packet(2)), 1);
        assert_eq!(mux.subscriber_count(), 1);
        assert!(stalled.is_closed());
        assert_eq!(drain(&stalled), vec![1]);
        assert_eq!(drain(&healthy), vec![2]);
    }

    #[test]
    fn idle_subscriber_with_empty_queue_is_kept() {
        let mux = Arc::new(StreamMultiplexer::new(2, Duration::from_millis(20)));
        let _idle = mux.subscribe();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(mux.publish(packet(1)), 1);
        assert_eq!(mux.subscriber_count(), 1);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let mux = Arc::new(StreamMultiplexer::new(2, Duration::from_secs(10)));
        let first = mux.subscribe();
        let second = mux.subscribe();
        assert_ne!(first.id(), second.id());
        drop(first);
        assert_eq!(mux.subscriber_count(), 1);
        assert_eq!(mux.publish(packet(1)), 1);
    }

    #[tokio::test]
    async fn recv_wakes_on_publish_from_another_thread() {
        let mux = Arc::new(StreamMultiplexer::new(2, Duration::from_secs(10)));
        let subscription = mux.subscribe();
        let publisher = mux.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            publisher.publish(packet(7));
        });

        let received = subscription.recv().await.unwrap();
        assert_eq!(received.frame_number, 7);
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn recv_ends_after_eviction() {
        let mux = Arc::new(StreamMultiplexer::new(1, Duration::from_millis(10)));
        let subscription = mux.subscribe();
        mux.publish(packet(1));
        thread::sleep(Duration::from_millis(30));
        mux.publish(packet(2));

        assert_eq!(subscription.recv().await.unwrap().frame_number, 1);
        assert!(subscription.recv().await.is_none());
    }
}
