//! Runtime event bus
//!
//! Fire-and-forget publication of task, pipeline, and circuit events for
//! monitoring consumers. Publishing never blocks and never fails the
//! publishing operation; slow subscribers lose events rather than exert
//! backpressure.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::types::EventEnvelope;

/// Event bus configuration
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Broadcast channel capacity per subscriber.
    pub channel_capacity: usize,
    /// Recent events retained for the admin surface.
    pub recent_ring_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            recent_ring_size: 256,
        }
    }
}

/// Broadcast event bus with a bounded ring of recent events
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    recent: Mutex<VecDeque<EventEnvelope>>,
    ring_size: usize,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity);
        Self {
            sender,
            recent: Mutex::new(VecDeque::with_capacity(config.recent_ring_size)),
            ring_size: config.recent_ring_size,
        }
    }

    /// Publish an event. Subscribers that lag are skipped; the publisher
    /// never observes an error.
    pub fn publish(&self, event: EventEnvelope) {
        {
            let mut recent = self.recent.lock();
            if recent.len() == self.ring_size {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        tracing::debug!(
            event_type = %event.event_type,
            run_id = ?event.run_id,
            task_id = ?event.task_id,
            "event published"
        );
        let _ = self.sender.send(event);
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Snapshot of the most recent events, oldest first.
    pub fn recent(&self) -> Vec<EventEnvelope> {
        self.recent.lock().iter().cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventType, RunId};

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let run_id = RunId::new();
        bus.publish(EventEnvelope::new(EventType::PipelineStarted).with_run(run_id));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::PipelineStarted);
        assert_eq!(received.run_id, Some(run_id));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(EventEnvelope::new(EventType::TaskCreated));
        assert_eq!(bus.recent().len(), 1);
    }

    #[test]
    fn recent_ring_is_bounded() {
        let bus = EventBus::new(EventBusConfig {
            channel_capacity: 16,
            recent_ring_size: 3,
        });
        for _ in 0..5 {
            bus.publish(EventEnvelope::new(EventType::TaskCreated));
        }
        bus.publish(EventEnvelope::new(EventType::TaskCompleted));
        let recent = bus.recent();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent.last().unwrap().event_type, EventType::TaskCompleted);
    }
}
