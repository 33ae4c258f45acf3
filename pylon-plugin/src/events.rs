use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// A named cross-plugin event.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    /// Name of the emitting plugin.
    pub source: String,
    pub payload: Value,
}

type Callback = Rc<dyn Fn(&Event)>;

struct Subscriber {
    plugin: String,
    callback: Callback,
}

#[derive(Default)]
struct BusInner {
    subscribers: HashMap<String, Vec<Subscriber>>,
    queue: VecDeque<Event>,
}

/// Worker-local publish/subscribe bus for fire-and-forget plugin signals.
///
/// Emissions are queued and delivered by `drain()` at the end of the
/// current hook, so listeners never re-enter a plugin mid-execution.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Rc<RefCell<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event: &str, plugin: &str, callback: impl Fn(&Event) + 'static) {
        self.inner
            .borrow_mut()
            .subscribers
            .entry(event.to_string())
            .or_default()
            .push(Subscriber {
                plugin: plugin.to_string(),
                callback: Rc::new(callback),
            });
    }

    /// Remove every subscription owned by `plugin`.
    pub fn unsubscribe_plugin(&self, plugin: &str) {
        let mut inner = self.inner.borrow_mut();
        for subs in inner.subscribers.values_mut() {
            subs.retain(|s| s.plugin != plugin);
        }
    }

    /// Queue an event for delivery at the next `drain()`.
    pub fn emit(&self, source: &str, event: &str, payload: Value) {
        self.inner.borrow_mut().queue.push_back(Event {
            name: event.to_string(),
            source: source.to_string(),
            payload,
        });
    }

    /// Deliver every queued event. Events emitted by listeners are
    /// delivered in the same drain.
    pub fn drain(&self) {
        loop {
            let Some(event) = self.inner.borrow_mut().queue.pop_front() else {
                return;
            };
            // Snapshot callbacks so listeners can subscribe/emit freely.
            let callbacks: Vec<Callback> = self
                .inner
                .borrow()
                .subscribers
                .get(&event.name)
                .map(|subs| subs.iter().map(|s| Rc::clone(&s.callback)).collect())
                .unwrap_or_default();
            for cb in callbacks {
                cb(&event);
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.borrow().queue.len()
    }
}
