//! Listener registration and dispatch.
//!
//! The registry maps an event type to an ordered sequence of listeners. Each
//! sequence lives behind an `Arc` and is replaced on write, so a stage can
//! iterate the snapshot it took while NApps are loaded or unloaded
//! concurrently. No lock is held while a listener runs.

use crate::error::{panic_message, EventError};
use crate::event::Event;
use crate::napp::NAppKind;
use std::any::Any;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, Span};

/// Callback invoked synchronously on the dispatching stage's thread.
pub type ListenerFn = Arc<dyn Fn(&Event) -> Result<(), EventError> + Send + Sync>;

/// Who registered a listener, used to remove it again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerOwner {
    /// Listener installed by the controller or host application
    Controller,
    /// Listener declared by a loaded NApp
    NApp { kind: NAppKind, name: String },
}

impl ListenerOwner {
    pub fn napp(kind: NAppKind, name: impl Into<String>) -> Self {
        ListenerOwner::NApp {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ListenerOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerOwner::Controller => f.write_str("controller"),
            ListenerOwner::NApp { kind, name } => write!(f, "{kind}:{name}"),
        }
    }
}

/// Keeps the code behind a callback mapped, e.g. the shared library a NApp
/// was loaded from.
pub type ModuleGuard = Arc<dyn Any + Send + Sync>;

/// A named, owner-tagged callback.
///
/// A listener may hold a [`ModuleGuard`]. Dispatch snapshots hold listener
/// clones, so the module stays loaded until the last in-flight dispatch that
/// could still call into it has finished, even after the owner unloaded.
#[derive(Clone)]
pub struct Listener {
    name: String,
    owner: ListenerOwner,
    // Declared before `module` so the callback is dropped while its code is
    // still mapped.
    callback: ListenerFn,
    module: Option<ModuleGuard>,
}

impl Listener {
    pub fn new<F>(name: impl Into<String>, owner: ListenerOwner, callback: F) -> Self
    where
        F: Fn(&Event) -> Result<(), EventError> + Send + Sync + 'static,
    {
        Self::from_arc(name, owner, Arc::new(callback))
    }

    pub fn from_arc(name: impl Into<String>, owner: ListenerOwner, callback: ListenerFn) -> Self {
        Self {
            name: name.into(),
            owner,
            callback,
            module: None,
        }
    }

    /// Ties the listener to `module`, which is released only when the last
    /// clone of this listener is dropped.
    pub fn retaining(mut self, module: ModuleGuard) -> Self {
        self.module = Some(module);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &ListenerOwner {
        &self.owner
    }

    /// Runs the callback, turning a panic into [`EventError::ListenerPanicked`].
    pub fn invoke(&self, event: &Event) -> Result<(), EventError> {
        match catch_unwind(AssertUnwindSafe(|| (self.callback)(event))) {
            Ok(result) => result,
            Err(panic_info) => Err(EventError::ListenerPanicked(panic_message(panic_info))),
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("retains_module", &self.module.is_some())
            .finish()
    }
}

/// Result of dispatching a single event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub invoked: usize,
    pub failed: usize,
}

/// Cumulative dispatch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub events_dispatched: u64,
    pub events_without_listeners: u64,
    pub listener_invocations: u64,
    pub listener_failures: u64,
    pub total_listeners: usize,
}

#[derive(Debug, Default)]
struct DispatchCounters {
    events_dispatched: AtomicU64,
    events_without_listeners: AtomicU64,
    listener_invocations: AtomicU64,
    listener_failures: AtomicU64,
}

/// Event type to ordered listeners.
pub struct ListenerRegistry {
    listeners: DashMap<String, Arc<Vec<Listener>>>,
    counters: DispatchCounters,
    span: Span,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::with_span(Span::current())
    }

    /// Registry whose log lines are recorded under `span`.
    pub fn with_span(span: Span) -> Self {
        Self {
            listeners: DashMap::new(),
            counters: DispatchCounters::default(),
            span,
        }
    }

    /// Appends `listener` to the sequence for `event_type`.
    ///
    /// Registering the same callback twice yields two invocations per event.
    /// Safe to call while stages dispatch: a dispatch that already took its
    /// snapshot does not see the new listener, the next one does.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The event type to listen for; the sequence is created
    ///   on first use
    /// * `listener` - The callback, tagged with the owner that
    ///   [`ListenerRegistry::unregister_all`] removes it by
    pub fn register(&self, event_type: impl Into<String>, listener: Listener) {
        let event_type = event_type.into();
        let _enter = self.span.enter();
        debug!(
            event_type = %event_type,
            listener = %listener.name,
            owner = %listener.owner,
            "Registered listener"
        );

        let mut entry = self.listeners.entry(event_type).or_default();
        Arc::make_mut(entry.value_mut()).push(listener);
    }

    /// Removes every listener owned by `owner` and returns how many were removed.
    ///
    /// Event types left without listeners are dropped from the registry.
    pub fn unregister_all(&self, owner: &ListenerOwner) -> usize {
        let mut removed = 0;

        self.listeners.retain(|_, listeners| {
            if listeners.iter().any(|l| &l.owner == owner) {
                let before = listeners.len();
                let kept: Vec<Listener> = listeners
                    .iter()
                    .filter(|l| &l.owner != owner)
                    .cloned()
                    .collect();
                removed += before - kept.len();
                // In-flight dispatches keep iterating the old sequence.
                *listeners = Arc::new(kept);
            }
            !listeners.is_empty()
        });

        let _enter = self.span.enter();
        debug!(owner = %owner, removed, "Unregistered listeners");
        removed
    }

    /// Invokes every listener for the event's type, in registration order.
    ///
    /// An event type nobody listens for is silently dropped. Listener failures
    /// and panics are logged and counted; the remaining listeners still run.
    pub fn dispatch(&self, event: &Event) -> DispatchOutcome {
        self.counters.events_dispatched.fetch_add(1, Ordering::Relaxed);

        let snapshot = self
            .listeners
            .get(event.event_type())
            .map(|entry| entry.value().clone());

        let Some(listeners) = snapshot else {
            self.counters
                .events_without_listeners
                .fetch_add(1, Ordering::Relaxed);
            trace!(event_type = %event.event_type(), "No listeners for event");
            return DispatchOutcome::default();
        };

        let mut outcome = DispatchOutcome::default();
        for listener in listeners.iter() {
            outcome.invoked += 1;
            if let Err(e) = listener.invoke(event) {
                outcome.failed += 1;
                let _enter = self.span.enter();
                error!(
                    event_type = %event.event_type(),
                    listener = %listener.name,
                    owner = %listener.owner,
                    "Listener failed: {}",
                    e
                );
            }
        }

        self.counters
            .listener_invocations
            .fetch_add(outcome.invoked as u64, Ordering::Relaxed);
        self.counters
            .listener_failures
            .fetch_add(outcome.failed as u64, Ordering::Relaxed);
        outcome
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        self.listeners
            .get(event_type)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    /// Snapshot of the listeners registered for `event_type`.
    pub fn listeners_for(&self, event_type: &str) -> Vec<Listener> {
        self.listeners
            .get(event_type)
            .map(|entry| entry.value().as_ref().clone())
            .unwrap_or_default()
    }

    /// Event types with at least one listener, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.listeners.iter().map(|entry| entry.key().clone()).collect();
        types.sort();
        types
    }

    /// Total listeners across all event types.
    pub fn len(&self) -> usize {
        self.listeners.iter().map(|entry| entry.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            events_dispatched: self.counters.events_dispatched.load(Ordering::Relaxed),
            events_without_listeners: self.counters.events_without_listeners.load(Ordering::Relaxed),
            listener_invocations: self.counters.listener_invocations.load(Ordering::Relaxed),
            listener_failures: self.counters.listener_failures.load(Ordering::Relaxed),
            total_listeners: self.len(),
        }
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("event_types", &self.listeners.len())
            .field("listeners", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> impl Fn(&Event) -> Result<(), EventError> {
        let log = log.clone();
        let tag = tag.to_string();
        move |event: &Event| {
            log.lock()
                .expect("log lock")
                .push(format!("{}:{}", tag, event.event_type()));
            Ok(())
        }
    }

    #[test]
    fn test_dispatch_without_listeners_is_noop() {
        let registry = ListenerRegistry::new();
        let outcome = registry.dispatch(&Event::signal("nobody.cares"));

        assert_eq!(outcome, DispatchOutcome::default());
        assert_eq!(registry.stats().events_without_listeners, 1);
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register("x", Listener::new("a", ListenerOwner::napp(NAppKind::Core, "first"), recording(&log, "A")));
        registry.register("x", Listener::new("b", ListenerOwner::napp(NAppKind::Ordinary, "second"), recording(&log, "B")));

        let outcome = registry.dispatch(&Event::signal("x"));

        assert_eq!(outcome.invoked, 2);
        assert_eq!(*log.lock().expect("log lock"), vec!["A:x", "B:x"]);
    }

    #[test]
    fn test_double_registration_invokes_twice() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let listener = Listener::new("dup", ListenerOwner::Controller, recording(&log, "D"));

        registry.register("x", listener.clone());
        registry.register("x", listener);
        registry.dispatch(&Event::signal("x"));

        assert_eq!(log.lock().expect("log lock").len(), 2);
    }

    #[test]
    fn test_unregister_all_removes_only_owner() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let owner = ListenerOwner::napp(NAppKind::Ordinary, "topology");

        registry.register("switch.up", Listener::new("up", owner.clone(), recording(&log, "T")));
        registry.register("switch.down", Listener::new("down", owner.clone(), recording(&log, "T")));
        registry.register("switch.up", Listener::new("stats", ListenerOwner::Controller, recording(&log, "C")));

        assert_eq!(registry.unregister_all(&owner), 2);
        assert_eq!(registry.listener_count("switch.up"), 1);
        assert_eq!(registry.listener_count("switch.down"), 0);
        assert_eq!(registry.event_types(), vec!["switch.up".to_string()]);

        registry.dispatch(&Event::signal("switch.down"));
        registry.dispatch(&Event::signal("switch.up"));
        assert_eq!(*log.lock().expect("log lock"), vec!["C:switch.up"]);
    }

    #[test]
    fn test_failing_and_panicking_listeners_do_not_stop_dispatch() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register(
            "x",
            Listener::new("fails", ListenerOwner::Controller, |_: &Event| {
                Err(EventError::ListenerExecution("boom".to_string()))
            }),
        );
        registry.register(
            "x",
            Listener::new("panics", ListenerOwner::Controller, |_: &Event| -> Result<(), EventError> {
                panic!("listener exploded")
            }),
        );
        registry.register("x", Listener::new("ok", ListenerOwner::Controller, recording(&log, "OK")));

        let outcome = registry.dispatch(&Event::signal("x"));

        assert_eq!(outcome, DispatchOutcome { invoked: 3, failed: 2 });
        assert_eq!(*log.lock().expect("log lock"), vec!["OK:x"]);
        assert_eq!(registry.stats().listener_failures, 2);
    }

    #[test]
    fn test_listener_may_mutate_registry_during_dispatch() {
        let registry = Arc::new(ListenerRegistry::new());
        let owner = ListenerOwner::napp(NAppKind::Ordinary, "self_removing");

        let inner = registry.clone();
        let inner_owner = owner.clone();
        registry.register(
            "x",
            Listener::new("remove_self", owner.clone(), move |_: &Event| {
                inner.unregister_all(&inner_owner);
                Ok(())
            }),
        );

        let outcome = registry.dispatch(&Event::signal("x"));

        assert_eq!(outcome.invoked, 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_panic_message_extraction() {
        let listener = Listener::new("p", ListenerOwner::Controller, |_: &Event| -> Result<(), EventError> {
            panic!("bad {}", "state")
        });

        match listener.invoke(&Event::signal("x")) {
            Err(EventError::ListenerPanicked(message)) => assert_eq!(message, "bad state"),
            other => panic!("expected panic error, got {other:?}"),
        }
    }

    #[test]
    fn test_module_outlives_in_flight_dispatch() {
        use std::sync::{mpsc, Barrier};

        let registry = Arc::new(ListenerRegistry::new());
        let module: ModuleGuard = Arc::new("libslow.so".to_string());
        let owner = ListenerOwner::napp(NAppKind::Ordinary, "slow");
        let (entered_tx, entered_rx) = mpsc::channel();
        let release = Arc::new(Barrier::new(2));

        let gate = release.clone();
        registry.register(
            "x",
            Listener::new("slow", owner.clone(), move |_: &Event| {
                let _ = entered_tx.send(());
                gate.wait();
                Ok(())
            })
            .retaining(module.clone()),
        );
        assert_eq!(Arc::strong_count(&module), 2);

        let dispatcher = registry.clone();
        let stage = std::thread::spawn(move || dispatcher.dispatch(&Event::signal("x")));
        entered_rx.recv().expect("listener entered");

        assert_eq!(registry.unregister_all(&owner), 1);
        assert_eq!(
            Arc::strong_count(&module),
            2,
            "the running dispatch still holds the module"
        );

        release.wait();
        let outcome = stage.join().expect("dispatch thread");
        assert_eq!(outcome.invoked, 1);
        assert_eq!(Arc::strong_count(&module), 1);
    }
}
