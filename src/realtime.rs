//! Realtime event channel between a widget and its browser.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Event-based transport the widget talks through.
pub trait RealtimeChannel: Send + Sync {
    fn on(&self, event: &str, handler: EventHandler);
    fn emit(&self, event: &str, payload: Value);
    fn disconnect(&self);
}

#[derive(Debug, Deserialize)]
struct EventEnvelopeIn {
    event: String,
    #[serde(default)]
    data: Value,
}

pub fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Channel backed by a WebSocket connection.
///
/// Outbound events are queued as JSON envelopes for the socket writer task;
/// inbound frames are routed to registered handlers through [`dispatch`].
///
/// [`dispatch`]: SocketChannel::dispatch
pub struct SocketChannel {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    handlers: Mutex<HashMap<String, Vec<EventHandler>>>,
}

impl SocketChannel {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            outbound: Mutex::new(Some(tx)),
            handlers: Mutex::new(HashMap::new()),
        });
        (channel, rx)
    }

    /// Routes one raw inbound frame. Returns `false` for frames that are not
    /// an event envelope or that no handler is registered for.
    pub fn dispatch(&self, raw: &str) -> bool {
        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(raw) else {
            debug!("ignoring malformed realtime frame");
            return false;
        };

        let handlers = lock(&self.handlers)
            .get(&envelope.event)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(event = %envelope.event, "no handler for realtime event");
            return false;
        }

        for handler in handlers {
            handler(envelope.data.clone());
        }
        true
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.outbound)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl RealtimeChannel for SocketChannel {
    fn on(&self, event: &str, handler: EventHandler) {
        lock(&self.handlers)
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    fn emit(&self, event: &str, payload: Value) {
        let Some(frame) = event_payload(event, payload) else {
            return;
        };
        let outbound = lock(&self.outbound);
        if let Some(tx) = outbound.as_ref() {
            if tx.send(frame).is_err() {
                warn!(event, "realtime client went away before the event was sent");
            }
        }
    }

    fn disconnect(&self) {
        lock(&self.outbound).take();
        lock(&self.handlers).clear();
    }
}

/// Replaceable holder for the channel a widget currently emits through.
#[derive(Clone, Default)]
pub struct ChannelSlot {
    current: Arc<RwLock<Option<Arc<dyn RealtimeChannel>>>>,
}

impl ChannelSlot {
    /// Attaches `channel`, disconnecting whichever one it replaces.
    pub fn attach(&self, channel: Arc<dyn RealtimeChannel>) {
        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(channel);
        if let Some(previous) = previous {
            previous.disconnect();
        }
    }

    pub fn detach(&self) {
        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            previous.disconnect();
        }
    }

    /// Detaches `channel` only if it is still the attached one. Returns
    /// whether it was.
    pub fn detach_if_current(&self, channel: &Arc<dyn RealtimeChannel>) -> bool {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let is_current = current.as_ref().is_some_and(|attached| {
            Arc::as_ptr(attached).cast::<()>() == Arc::as_ptr(channel).cast::<()>()
        });
        if !is_current {
            return false;
        }
        let previous = current.take();
        drop(current);
        if let Some(previous) = previous {
            previous.disconnect();
        }
        true
    }

    pub fn is_attached(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Emits through the attached channel; a no-op when nothing is attached.
    pub fn emit(&self, event: &str, payload: Value) {
        let channel = self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(channel) = channel {
            channel.emit(event, payload);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Channel that records emitted events. Inbound events are injected with
    /// [`RecordingChannel::fire`].
    #[derive(Default)]
    pub struct RecordingChannel {
        pub emitted: Mutex<Vec<(String, Value)>>,
        pub handlers: Mutex<HashMap<String, Vec<EventHandler>>>,
        pub disconnected: Mutex<bool>,
    }

    impl RecordingChannel {
        pub fn events(&self, name: &str) -> Vec<Value> {
            lock(&self.emitted)
                .iter()
                .filter(|(event, _)| event == name)
                .map(|(_, payload)| payload.clone())
                .collect()
        }

        pub fn was_disconnected(&self) -> bool {
            *lock(&self.disconnected)
        }

        /// Delivers an inbound event to the registered handlers. Returns
        /// whether any handler saw it.
        pub fn fire(&self, event: &str, data: Value) -> bool {
            let handlers = lock(&self.handlers).get(event).cloned().unwrap_or_default();
            for handler in &handlers {
                handler(data.clone());
            }
            !handlers.is_empty()
        }
    }

    impl RealtimeChannel for RecordingChannel {
        fn on(&self, event: &str, handler: EventHandler) {
            lock(&self.handlers)
                .entry(event.to_string())
                .or_default()
                .push(handler);
        }

        fn emit(&self, event: &str, payload: Value) {
            lock(&self.emitted).push((event.to_string(), payload));
        }

        fn disconnect(&self) {
            *lock(&self.disconnected) = true;
            lock(&self.handlers).clear();
        }
    }
}
