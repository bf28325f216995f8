//! Pub/Sub event bus between the player and whoever drives it.
//!
//! - `subscribe::<E>()` callbacks run synchronously inside `emit()`
//! - every emitted event is also queued; `poll()` drains the queue
//!
//! Callbacks of one event type run in subscription order. No ordering is
//! guaranteed across event types.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::warn;

/// Queue length at which the oldest half is dropped
const MAX_QUEUE_SIZE: usize = 1000;

/// Anything `Send + Sync + 'static` is an event.
pub trait Event: Any + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
}

impl<T: Any + Send + Sync + 'static> Event for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

type Callback = Arc<dyn Fn(&dyn Any) + Send + Sync>;

pub type BoxedEvent = Box<dyn Event>;

#[derive(Default)]
struct Shared {
    subscribers: RwLock<HashMap<TypeId, Vec<Callback>>>,
    queue: Mutex<Vec<BoxedEvent>>,
}

impl Shared {
    fn notify(&self, type_id: TypeId, event: &dyn Any) {
        // Clone the list so callbacks may subscribe without deadlocking
        let callbacks = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&type_id)
            .cloned();
        for cb in callbacks.into_iter().flatten() {
            cb(event);
        }
    }

    fn enqueue(&self, event: BoxedEvent) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= MAX_QUEUE_SIZE {
            let evict = queue.len() / 2;
            warn!("Event queue full ({} events), dropping oldest {}", queue.len(), evict);
            queue.drain(0..evict);
        }
        queue.push(event);
    }

    fn emit<E: Event>(&self, event: E) {
        self.notify(TypeId::of::<E>(), &event);
        self.enqueue(Box::new(event));
    }

    fn emit_boxed(&self, event: BoxedEvent) {
        // Deref to dyn Event: the Box itself would report its own TypeId
        let inner: &dyn Event = &*event;
        self.notify(inner.as_any().type_id(), inner.as_any());
        self.enqueue(event);
    }
}

/// Event bus handle. Clones share subscribers and queue.
#[derive(Clone, Default)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("queue_len", &self.queue_len()).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for events of type `E`.
    ///
    /// ```ignore
    /// bus.subscribe::<StateChangedEvent, _>(move |e| log::info!("{:?} -> {:?}", e.from, e.to));
    /// ```
    pub fn subscribe<E, F>(&self, callback: F)
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let wrapped: Callback = Arc::new(move |any: &dyn Any| {
            if let Some(event) = any.downcast_ref::<E>() {
                callback(event);
            }
        });
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(TypeId::of::<E>())
            .or_default()
            .push(wrapped);
    }

    /// Run callbacks, then queue the event for `poll()`
    pub fn emit<E: Event>(&self, event: E) {
        self.shared.emit(event);
    }

    pub fn emit_boxed(&self, event: BoxedEvent) {
        self.shared.emit_boxed(event);
    }

    /// Take every event queued since the last poll
    pub fn poll(&self) -> Vec<BoxedEvent> {
        std::mem::take(&mut *self.shared.queue.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Emit-only handle for UI code
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn unsubscribe_all<E: Event>(&self) {
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&TypeId::of::<E>());
    }

    pub fn has_subscribers<E: Event>(&self) -> bool {
        self.shared
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .is_some_and(|v| !v.is_empty())
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn clear(&self) {
        self.shared.subscribers.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.shared.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Cloneable emit-only view of an `EventBus`
#[derive(Clone)]
pub struct EventEmitter {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}

impl EventEmitter {
    pub fn emit<E: Event>(&self, event: E) {
        self.shared.emit(event);
    }

    pub fn emit_boxed(&self, event: BoxedEvent) {
        self.shared.emit_boxed(event);
    }
}

/// Downcast a queued event.
///
/// Derefs to `dyn Event` first: calling `as_any()` on the `Box` would go
/// through the blanket impl for `Box<dyn Event>` and never match `E`.
#[inline]
pub fn downcast_event<E: Event>(event: &BoxedEvent) -> Option<&E> {
    (**event).as_any().downcast_ref::<E>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::player::PlaybackMode;
    use crate::core::player_events::{SpeedChangedEvent, StateChangedEvent, StepEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_callbacks_fire_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            bus.subscribe::<SpeedChangedEvent, _>(move |e| seen.lock().unwrap().push((tag, e.0)));
        }

        bus.emit(SpeedChangedEvent(2.0));
        assert_eq!(*seen.lock().unwrap(), vec![("first", 2.0), ("second", 2.0)]);
    }

    #[test]
    fn test_poll_returns_queued_then_empties() {
        let bus = EventBus::new();
        bus.emit(SpeedChangedEvent(0.5));
        bus.emit(StateChangedEvent {
            from: PlaybackMode::Paused,
            to: PlaybackMode::Playing,
        });

        let events = bus.poll();
        assert_eq!(events.len(), 2);
        assert_eq!(downcast_event::<SpeedChangedEvent>(&events[0]), Some(&SpeedChangedEvent(0.5)));
        assert!(downcast_event::<SpeedChangedEvent>(&events[1]).is_none());
        assert_eq!(
            downcast_event::<StateChangedEvent>(&events[1]).map(|e| e.to),
            Some(PlaybackMode::Playing)
        );
        assert!(bus.poll().is_empty());
    }

    #[test]
    fn test_emitter_and_boxed_emit_reach_subscribers() {
        let bus = EventBus::new();
        let steps = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&steps);
        bus.subscribe::<StepEvent, _>(move |e| {
            s.fetch_add(e.0 as usize, Ordering::SeqCst);
        });

        let emitter = bus.emitter();
        emitter.emit(StepEvent(3));
        emitter.emit_boxed(Box::new(StepEvent(4)));
        assert_eq!(steps.load(Ordering::SeqCst), 7);
        assert_eq!(bus.queue_len(), 2);
    }

    #[test]
    fn test_unsubscribe_keeps_queueing() {
        let bus = EventBus::new();
        bus.subscribe::<StepEvent, _>(|_| {});
        assert!(bus.has_subscribers::<StepEvent>());
        bus.unsubscribe_all::<StepEvent>();
        assert!(!bus.has_subscribers::<StepEvent>());

        bus.emit(StepEvent(1));
        assert_eq!(bus.poll().len(), 1);
    }

    #[test]
    fn test_queue_overflow_drops_oldest() {
        let bus = EventBus::new();
        for i in 0..MAX_QUEUE_SIZE as i64 + 1 {
            bus.emit(StepEvent(i));
        }
        let events = bus.poll();
        assert_eq!(events.len(), MAX_QUEUE_SIZE / 2 + 1);
        assert_eq!(downcast_event::<StepEvent>(&events[0]).map(|e| e.0), Some(500));
    }
}
