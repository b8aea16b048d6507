use crate::monitor::report::DeviceReport;
use crate::monitor::source::DeviceInfo;
use crate::sample::DeviceId;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The source reported the device gone
    Failed,
    /// No longer listed when devices were re-enumerated
    Vanished,
    /// Explicitly deregistered by the caller
    Deregistered,
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Added(DeviceInfo),
    Removed { id: DeviceId, reason: RemovalReason },
    Report(Arc<DeviceReport>),
}

/// Fan-out of events to any number of subscribers
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Sender<DeviceEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<DeviceEvent> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber; dropped receivers are pruned
    pub fn publish(&self, event: DeviceEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
