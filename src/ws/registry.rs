//! Handler registry for typed message dispatch and lifecycle observers.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::Value;

use super::message::{Envelope, WILDCARD};

/// Callback invoked with a message payload (or the full envelope for wildcard handlers).
pub type MessageHandler = Arc<dyn Fn(&Value) + Send + Sync>;
/// Callback invoked on connection lifecycle events.
pub type LifecycleHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Slot {
    Message(String),
    Connect,
    Disconnect,
}

#[derive(Clone)]
enum Callback {
    Message(MessageHandler),
    Lifecycle(LifecycleHandler),
}

#[derive(Clone)]
struct Entry {
    id: u64,
    callback: Callback,
}

/// Ordered handler lists keyed by message type, plus connect/disconnect observers.
///
/// Dispatch works on a snapshot of the handler list, so handlers may register or unregister
/// (themselves included) while being invoked. Each invocation is isolated: a panicking handler is
/// logged and its siblings still run.
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    slots: DashMap<Slot, Vec<Entry>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `handler` for messages of `msg_type`, or every message when `msg_type` is `"*"`.
    pub fn on<F>(self: &Arc<Self>, msg_type: &str, handler: F) -> Registration
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.insert(
            Slot::Message(msg_type.to_owned()),
            Callback::Message(Arc::new(handler)),
        )
    }

    pub fn on_connect<F>(self: &Arc<Self>, handler: F) -> Registration
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(Slot::Connect, Callback::Lifecycle(Arc::new(handler)))
    }

    pub fn on_disconnect<F>(self: &Arc<Self>, handler: F) -> Registration
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(Slot::Disconnect, Callback::Lifecycle(Arc::new(handler)))
    }

    fn insert(self: &Arc<Self>, slot: Slot, callback: Callback) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots
            .entry(slot.clone())
            .or_default()
            .push(Entry { id, callback });

        Registration {
            registry: Arc::downgrade(self),
            slot,
            id,
        }
    }

    fn remove(&self, slot: &Slot, id: u64) {
        self.slots.remove_if_mut(slot, |_, entries| {
            entries.retain(|entry| entry.id != id);
            entries.is_empty()
        });
    }

    fn snapshot(&self, slot: &Slot) -> Vec<Entry> {
        self.slots
            .get(slot)
            .map(|entries| entries.value().clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn handler_count(&self, msg_type: &str) -> usize {
        self.slots
            .get(&Slot::Message(msg_type.to_owned()))
            .map_or(0, |entries| entries.len())
    }

    /// Deliver an application message: exact-type handlers receive the payload, wildcard
    /// handlers the full envelope. Untyped messages only reach wildcard handlers. Returns the
    /// number of handlers invoked.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let mut invoked = 0;

        if let Some(msg_type) = envelope.msg_type()
            && msg_type != WILDCARD
        {
            let slot = Slot::Message(msg_type.to_owned());
            for entry in self.snapshot(&slot) {
                if let Callback::Message(handler) = &entry.callback {
                    invoke_isolated(&slot, || handler(envelope.payload()));
                    invoked += 1;
                }
            }
        }

        let slot = Slot::Message(WILDCARD.to_owned());
        for entry in self.snapshot(&slot) {
            if let Callback::Message(handler) = &entry.callback {
                invoke_isolated(&slot, || handler(envelope.as_value()));
                invoked += 1;
            }
        }

        invoked
    }

    pub fn notify_connect(&self) {
        self.notify(&Slot::Connect);
    }

    pub fn notify_disconnect(&self) {
        self.notify(&Slot::Disconnect);
    }

    fn notify(&self, slot: &Slot) {
        for entry in self.snapshot(slot) {
            if let Callback::Lifecycle(handler) = &entry.callback {
                invoke_isolated(slot, || handler());
            }
        }
    }
}

fn invoke_isolated<F: FnOnce()>(slot: &Slot, f: F) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
        #[cfg(feature = "tracing")]
        tracing::error!(?slot, reason = panic_reason(&*panic), "Handler panicked");
        #[cfg(not(feature = "tracing"))]
        let _ = (slot, &panic);
    }
}

#[cfg(feature = "tracing")]
fn panic_reason(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Handle to a single registered handler.
///
/// Dropping a `Registration` leaves the handler in place; call [`Registration::unsubscribe`] to
/// remove it. Only this handler instance is removed, other handlers for the same type stay.
#[derive(Debug)]
pub struct Registration {
    registry: Weak<HandlerRegistry>,
    slot: Slot,
    id: u64,
}

impl Registration {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.slot, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    fn envelope(value: Value) -> Envelope {
        Envelope::from_value(value)
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&Value) + Send + Sync>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let make = move |tag: &str| -> Box<dyn Fn(&Value) + Send + Sync> {
            let seen = Arc::clone(&seen_clone);
            let tag = tag.to_owned();
            Box::new(move |value: &Value| seen.lock().unwrap().push(format!("{tag}:{value}")))
        };
        (seen, make)
    }

    #[test]
    fn exact_handlers_get_payload_and_wildcard_gets_envelope() {
        let registry = HandlerRegistry::new();
        let exact_seen = Arc::new(Mutex::new(Vec::new()));
        let any_seen = Arc::new(Mutex::new(Vec::new()));

        let exact_clone = Arc::clone(&exact_seen);
        let _exact = registry.on("price_update", move |v| exact_clone.lock().unwrap().push(v.clone()));
        let any_clone = Arc::clone(&any_seen);
        let _any = registry.on(WILDCARD, move |v| any_clone.lock().unwrap().push(v.clone()));

        let message = json!({"type": "price_update", "payload": {"symbol": "XAUUSD", "bid": 2310.5}});
        let invoked = registry.dispatch(&envelope(message.clone()));

        assert_eq!(invoked, 2);
        assert_eq!(
            *exact_seen.lock().unwrap(),
            vec![json!({"symbol": "XAUUSD", "bid": 2310.5})]
        );
        assert_eq!(*any_seen.lock().unwrap(), vec![message]);
    }

    #[test]
    fn other_types_are_not_delivered() {
        let registry = HandlerRegistry::new();
        let (seen, make) = recorder();
        let exact = make("exact");
        let _exact = registry.on("price_update", move |v| exact(v));

        let invoked = registry.dispatch(&envelope(json!({"type": "alert", "payload": 1})));

        assert_eq!(invoked, 0);
        assert!(seen.lock().unwrap().is_empty(), "alert must not reach price_update");
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let registry = HandlerRegistry::new();
        let (seen, make) = recorder();
        let registrations: Vec<_> = ["first", "second", "third"]
            .into_iter()
            .map(|tag| {
                let handler = make(tag);
                registry.on("alert", move |v| handler(v))
            })
            .collect();

        registry.dispatch(&envelope(json!({"type": "alert", "payload": "x"})));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![r#"first:"x""#, r#"second:"x""#, r#"third:"x""#]
        );
        assert_eq!(registrations.len(), 3);
    }

    #[test]
    fn unsubscribe_removes_only_that_handler() {
        let registry = HandlerRegistry::new();
        let (seen, make) = recorder();
        let a = make("a");
        let b = make("b");
        let first = registry.on("alert", move |v| a(v));
        let _second = registry.on("alert", move |v| b(v));

        first.unsubscribe();
        registry.dispatch(&envelope(json!({"type": "alert", "payload": 2})));

        assert_eq!(*seen.lock().unwrap(), vec!["b:2".to_owned()]);
        assert_eq!(registry.handler_count("alert"), 1);
    }

    #[test]
    fn same_closure_registered_twice_is_removed_once() {
        let registry = HandlerRegistry::new();
        let (seen, make) = recorder();
        let shared: Arc<dyn Fn(&Value) + Send + Sync> = Arc::from(make("h"));
        let h1 = Arc::clone(&shared);
        let h2 = Arc::clone(&shared);
        let first = registry.on("alert", move |v| h1(v));
        let _second = registry.on("alert", move |v| h2(v));

        first.unsubscribe();
        registry.dispatch(&envelope(json!({"type": "alert", "payload": 3})));

        assert_eq!(*seen.lock().unwrap(), vec!["h:3".to_owned()]);
    }

    #[test]
    fn panicking_handler_does_not_stop_siblings() {
        let registry = HandlerRegistry::new();
        let (seen, make) = recorder();
        let b = make("b");
        let _a = registry.on("alert", |_| panic!("handler A failed"));
        let _b = registry.on("alert", move |v| b(v));

        let invoked = registry.dispatch(&envelope(json!({"type": "alert", "payload": "boom"})));

        assert_eq!(invoked, 2);
        assert_eq!(*seen.lock().unwrap(), vec![r#"b:"boom""#.to_owned()]);
    }

    #[test]
    fn handler_may_unsubscribe_itself_during_dispatch() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicU64::new(0));
        let slot: Arc<Mutex<Option<Registration>>> = Arc::new(Mutex::new(None));

        let calls_clone = Arc::clone(&calls);
        let slot_clone = Arc::clone(&slot);
        let registration = registry.on("alert", move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            if let Some(registration) = slot_clone.lock().unwrap().take() {
                registration.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(registration);

        registry.dispatch(&envelope(json!({"type": "alert"})));
        registry.dispatch(&envelope(json!({"type": "alert"})));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.handler_count("alert"), 0);
    }

    #[test]
    fn wildcard_typed_message_reaches_wildcard_handlers_once() {
        let registry = HandlerRegistry::new();
        let (seen, make) = recorder();
        let any = make("any");
        let _any = registry.on(WILDCARD, move |v| any(v));

        let invoked = registry.dispatch(&envelope(json!({"type": "*"})));

        assert_eq!(invoked, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn untyped_message_reaches_only_wildcard_handlers() {
        let registry = HandlerRegistry::new();
        let (seen, make) = recorder();
        let exact = make("exact");
        let any = make("any");
        let _exact = registry.on("alert", move |v| exact(v));
        let _any = registry.on(WILDCARD, move |v| any(v));

        let invoked = registry.dispatch(&envelope(json!({"payload": "no type"})));

        assert_eq!(invoked, 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![r#"any:{"payload":"no type"}"#.to_owned()]
        );
    }

    #[test]
    fn lifecycle_observers_are_isolated() {
        let registry = HandlerRegistry::new();
        let connects = Arc::new(AtomicU64::new(0));
        let disconnects = Arc::new(AtomicU64::new(0));

        let _boom = registry.on_connect(|| panic!("observer failed"));
        let connects_clone = Arc::clone(&connects);
        let _ok = registry.on_connect(move || {
            connects_clone.fetch_add(1, Ordering::SeqCst);
        });
        let disconnects_clone = Arc::clone(&disconnects);
        let on_disconnect = registry.on_disconnect(move || {
            disconnects_clone.fetch_add(1, Ordering::SeqCst);
        });

        registry.notify_connect();
        registry.notify_disconnect();
        on_disconnect.unsubscribe();
        registry.notify_disconnect();

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_after_registry_dropped_is_a_no_op() {
        let registry = HandlerRegistry::new();
        let registration = registry.on("alert", |_| {});
        drop(registry);

        registration.unsubscribe();
    }
}
