//! Event fan-out for task state changes and transfer progress
//!
//! Observers subscribe to a broadcast channel. Delivery is best-effort: when
//! nobody is subscribed a send simply drops the event, and a lagging receiver
//! loses the oldest events first. A run never blocks on its observers.

use tokio::sync::broadcast;

/// Events published by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Some task state changed; observers should re-read the store.
    TaskUpdate,
    /// A progress sample from the transfer currently running for `task_id`.
    TaskProgress {
        task_id: i64,
        percent: u8,
        speed: String,
    },
}

/// Shared handle to the engine's event channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish a task state change notification.
    pub fn task_update(&self) {
        // A send error only means there are no subscribers right now.
        let _ = self.sender.send(EngineEvent::TaskUpdate);
    }

    /// Publish a progress sample for a running transfer.
    pub fn task_progress(&self, task_id: i64, percent: u8, speed: String) {
        let _ = self.sender.send(EngineEvent::TaskProgress {
            task_id,
            percent,
            speed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.task_progress(7, 42, "1.2MB/s".to_string());
        match rx.recv().await.unwrap() {
            EngineEvent::TaskProgress {
                task_id,
                percent,
                speed,
            } => {
                assert_eq!(task_id, 7);
                assert_eq!(percent, 42);
                assert_eq!(speed, "1.2MB/s");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        bus.task_update();
        bus.task_progress(1, 100, "9.9MB/s".to_string());
    }
}
