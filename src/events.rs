use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Kinds of advisory notifications emitted by the analysis components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConversationAdded,
    ConversationUpdated,
    ConversationCompleted,
    TcpStreamCreated,
    TcpStreamUpdated,
    TcpStreamComplete,
    StatisticsUpdated,
    ProtocolStatsUpdated,
    EndpointStatsUpdated,
    RateUpdated,
}

#[derive(Debug, Clone)]
pub enum AnalyzerEvent {
    ConversationAdded { conversation_id: String },
    ConversationUpdated { conversation_id: String },
    ConversationCompleted { conversation_id: String },
    TcpStreamCreated { stream_index: u32 },
    TcpStreamUpdated { stream_index: u32 },
    TcpStreamComplete { stream_index: u32 },
    StatisticsUpdated,
    ProtocolStatsUpdated,
    EndpointStatsUpdated,
    RateUpdated { packets_per_second: f64, bits_per_second: f64 },
}

impl AnalyzerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AnalyzerEvent::ConversationAdded { .. } => EventKind::ConversationAdded,
            AnalyzerEvent::ConversationUpdated { .. } => EventKind::ConversationUpdated,
            AnalyzerEvent::ConversationCompleted { .. } => EventKind::ConversationCompleted,
            AnalyzerEvent::TcpStreamCreated { .. } => EventKind::TcpStreamCreated,
            AnalyzerEvent::TcpStreamUpdated { .. } => EventKind::TcpStreamUpdated,
            AnalyzerEvent::TcpStreamComplete { .. } => EventKind::TcpStreamComplete,
            AnalyzerEvent::StatisticsUpdated => EventKind::StatisticsUpdated,
            AnalyzerEvent::ProtocolStatsUpdated => EventKind::ProtocolStatsUpdated,
            AnalyzerEvent::EndpointStatsUpdated => EventKind::EndpointStatsUpdated,
            AnalyzerEvent::RateUpdated { .. } => EventKind::RateUpdated,
        }
    }
}

type Handler = Box<dyn Fn(&AnalyzerEvent) + Send>;

/// Fan-out point for analyzer notifications.
///
/// Handlers registered with [`EventHub::subscribe`] run synchronously on the
/// ingestion thread while the emitting component's lock is held. A handler
/// must not call back into that component or it will deadlock.
///
/// [`EventHub::watch`] is the non-blocking alternative: events are cloned
/// onto an unbounded channel and consumed at the receiver's leisure.
/// Channels whose receiver was dropped are pruned on the next emission.
pub struct EventHub {
    handlers: Mutex<HashMap<EventKind, Vec<Handler>>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<AnalyzerEvent>>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        EventHub {
            handlers: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Register a synchronous handler for one event kind.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&AnalyzerEvent) + Send + 'static,
    {
        self.handlers.lock().entry(kind).or_default().push(Box::new(handler));
    }

    /// Open a channel that receives every emitted event.
    pub fn watch(&self) -> mpsc::UnboundedReceiver<AnalyzerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: AnalyzerEvent) {
        {
            let handlers = self.handlers.lock();
            if let Some(list) = handlers.get(&event.kind()) {
                for handler in list {
                    handler(&event);
                }
            }
        }
        self.watchers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("handler_kinds", &self.handlers.lock().len())
            .field("watchers", &self.watchers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_subscribe_receives_matching_kind_only() {
        let hub = EventHub::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        hub.subscribe(EventKind::StatisticsUpdated, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit(AnalyzerEvent::StatisticsUpdated);
        hub.emit(AnalyzerEvent::RateUpdated {
            packets_per_second: 1.0,
            bits_per_second: 8.0,
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_watch_delivers_in_emission_order() {
        let hub = EventHub::new();
        let mut rx = hub.watch();

        hub.emit(AnalyzerEvent::ConversationAdded {
            conversation_id: "c1".into(),
        });
        hub.emit(AnalyzerEvent::StatisticsUpdated);

        match rx.try_recv().unwrap() {
            AnalyzerEvent::ConversationAdded { conversation_id } => {
                assert_eq!(conversation_id, "c1")
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(rx.try_recv().unwrap(), AnalyzerEvent::StatisticsUpdated));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_watcher_is_pruned() {
        let hub = EventHub::new();
        let rx = hub.watch();
        drop(rx);
        hub.emit(AnalyzerEvent::StatisticsUpdated);
        assert_eq!(hub.watchers.lock().len(), 0);
    }
}
