//! In-process fan-out of live events to any number of subscribers.

use super::{EventSink, SinkError};
use crate::event::LiveEvent;
use async_trait::async_trait;
use log::trace;
use tokio::sync::broadcast;

/// Events buffered per subscriber before a slow subscriber starts lagging.
pub const HUB_CAPACITY: usize = 256;

/// Broadcast hub: every subscriber receives every event published after it subscribed.
#[derive(Debug, Clone)]
pub struct LiveHub {
    sender: broadcast::Sender<LiveEvent>,
}

impl Default for LiveHub {
    fn default() -> Self {
        Self::new(HUB_CAPACITY)
    }
}

impl LiveHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventSink for LiveHub {
    async fn publish(&self, event: LiveEvent) -> Result<(), SinkError> {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => trace!("published {name} to {receivers} subscriber(s)"),
            // nobody listening is not a failure
            Err(_) => trace!("published {name} with no subscribers"),
        }
        Ok(())
    }
}
