use std::sync::{Arc, RwLock};

use crate::types::EngineEvent;

/// Receives every published event synchronously, in publish order.
///
/// Sinks are the delivery path for external observability and audit tooling:
/// unlike broadcast subscribers they never lag or drop events.
pub trait EventSink: Send + Sync + 'static {
    fn deliver(&self, event: &EngineEvent);
}

/// Event bus using tokio broadcast channel plus registered sinks.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self {
            tx,
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn publish(&self, event: EngineEvent) {
        if let Ok(sinks) = self.sinks.read() {
            for sink in sinks.iter() {
                sink.deliver(&event);
            }
        }
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn register_sink(&self, sink: Arc<dyn EventSink>) {
        if let Ok(mut sinks) = self.sinks.write() {
            sinks.push(sink);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::types::RunId;

    #[derive(Default)]
    struct Collect(Mutex<Vec<&'static str>>);

    impl EventSink for Collect {
        fn deliver(&self, event: &EngineEvent) {
            self.0.lock().unwrap().push(event.name());
        }
    }

    #[test]
    fn sink_sees_every_event_in_order() {
        let bus = EventBus::new(1);
        let sink = Arc::new(Collect::default());
        bus.register_sink(sink.clone());

        for steps in 0..5 {
            bus.publish(EngineEvent::RunCompleted {
                run_id: RunId::new(),
                steps,
            });
        }
        bus.publish(EngineEvent::CircuitOpened {
            action: "flaky_api".into(),
            failure_count: 3,
        });

        let seen = sink.0.lock().unwrap();
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[5], "circuit_opened");
    }

    #[tokio::test]
    async fn broadcast_subscriber_receives() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::RunStarted {
            run_id: RunId::from_str("r1"),
            graph_id: "g".into(),
        });
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.name(), "run_started");
    }
}
