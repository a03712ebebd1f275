//! Lifecycle notification bus
//!
//! Best-effort, fire-and-forget observability hooks emitted around
//! chain invocations and response creation. Listeners are plain
//! callbacks registered per event kind with an explicit handle for
//! unsubscription; delivery never affects engine control flow.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Lifecycle events observable on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// A response object was constructed by the downloader
    ResponseCreated,
    HttpMiddlewareStarted,
    HttpMiddlewareFinished,
    SpiderMiddlewareStarted,
    SpiderMiddlewareFinished,
    StartupPipelineStarted,
    StartupPipelineFinished,
    ItemsPipelineStarted,
    ItemsPipelineFinished,
    TasksPipelineStarted,
    TasksPipelineFinished,
}

/// One emitted event.
#[derive(Debug, Clone)]
pub struct Signal {
    pub kind: SignalKind,
    /// Free-form context, e.g. the URL or element count involved
    pub detail: Option<String>,
}

/// Handle returned by [`SignalBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&Signal) + Send + Sync>;

/// Registry of lifecycle listeners.
#[derive(Default)]
pub struct SignalBus {
    listeners: Mutex<HashMap<SignalKind, Vec<(SubscriptionId, Listener)>>>,
    next_id: AtomicU64,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one event kind.
    pub fn subscribe<F>(&self, kind: SignalKind, listener: F) -> SubscriptionId
    where
        F: Fn(&Signal) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.lock().expect("signal bus lock poisoned");
        listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a previously registered listener. Returns false if the
    /// handle was already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock().expect("signal bus lock poisoned");
        for entries in listeners.values_mut() {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.len() != before {
                return true;
            }
        }
        false
    }

    /// Fan an event out to its listeners. Listeners run synchronously
    /// on the calling task; the bus holds no lock while they execute.
    pub fn emit(&self, kind: SignalKind, detail: Option<String>) {
        let targets: Vec<Listener> = {
            let listeners = self.listeners.lock().expect("signal bus lock poisoned");
            match listeners.get(&kind) {
                Some(entries) => entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
                None => return,
            }
        };

        let signal = Signal { kind, detail };
        for listener in targets {
            listener(&signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_and_emit() {
        let bus = SignalBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        bus.subscribe(SignalKind::ResponseCreated, move |signal| {
            assert_eq!(signal.kind, SignalKind::ResponseCreated);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(SignalKind::ResponseCreated, Some("http://example.com".into()));
        bus.emit(SignalKind::ResponseCreated, None);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listeners_are_per_kind() {
        let bus = SignalBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        bus.subscribe(SignalKind::ItemsPipelineStarted, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(SignalKind::TasksPipelineStarted, None);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        bus.emit(SignalKind::ItemsPipelineStarted, None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = SignalBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let id = bus.subscribe(SignalKind::HttpMiddlewareStarted, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(SignalKind::HttpMiddlewareStarted, None);
        assert!(bus.unsubscribe(id));
        bus.emit(SignalKind::HttpMiddlewareStarted, None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!bus.unsubscribe(id));
    }

    #[test]
    fn test_emit_without_listeners_is_noop() {
        let bus = SignalBus::new();
        bus.emit(SignalKind::StartupPipelineFinished, None);
    }
}
