//! Pub/sub event bus connecting tracks to the playback conductor.
//!
//! - Subscribers register per event type and are invoked synchronously on `emit`
//! - Every emitted event is also queued; `poll()` drains the queue for hosts that
//!   process notifications in their own loop
//!
//! Callbacks for one event type run in subscription order.
//! Callbacks run on the emitting thread (usually the scheduler thread inside
//! `TrackWorkflow::get_output`), so they must not call back into the track.

use log::warn;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Queue bound; half of the oldest events are dropped when reached
const MAX_QUEUE_SIZE: usize = 1000;

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

/// State shared by the bus and all its emitters
#[derive(Default)]
struct Channels {
    subscribers: RwLock<HashMap<TypeId, Vec<Callback>>>,
    queue: Mutex<Vec<BoxedEvent>>,
}

impl Channels {
    fn dispatch(&self, event: BoxedEvent) {
        let type_id = Any::type_id((*event).as_any());
        // Clone the list so callbacks may subscribe without deadlocking
        let callbacks: Vec<Callback> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&type_id)
            .cloned()
            .unwrap_or_default();
        for cb in &callbacks {
            cb((*event).as_any());
        }

        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= MAX_QUEUE_SIZE {
            let evict = queue.len() / 2;
            warn!("Event queue full ({} events), dropping oldest {}", queue.len(), evict);
            queue.drain(0..evict);
        }
        queue.push(event);
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    channels: Arc<Channels>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke `callback` for every future event of type `E`
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
        self.channels
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(TypeId::of::<E>())
            .or_default()
            .push(wrapped);
    }

    pub fn emit<E: Event>(&self, event: E) {
        self.channels.dispatch(Box::new(event));
    }

    /// Drain queued events
    pub fn poll(&self) -> Vec<BoxedEvent> {
        std::mem::take(&mut *self.channels.queue.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Cloneable emit-only handle
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            channels: Arc::clone(&self.channels),
        }
    }

    pub fn unsubscribe_all<E: Event>(&self) {
        self.channels
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&TypeId::of::<E>());
    }

    pub fn has_subscribers<E: Event>(&self) -> bool {
        self.channels
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .is_some_and(|v| !v.is_empty())
    }

    pub fn queue_len(&self) -> usize {
        self.channels.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Emit-only handle sharing the bus channels
#[derive(Clone)]
pub struct EventEmitter {
    channels: Arc<Channels>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("queue_len", &self.channels.queue.lock().map(|q| q.len()).unwrap_or(0))
            .finish()
    }
}

impl EventEmitter {
    pub fn emit<E: Event>(&self, event: E) {
        self.channels.dispatch(Box::new(event));
    }
}

/// Downcast a polled event.
///
/// Deref to `dyn Event` first: calling `as_any()` on the Box itself would hit
/// the blanket impl for `Box<dyn Event>` and never match `E`.
#[inline]
pub fn downcast_event<E: Event>(event: &BoxedEvent) -> Option<&E> {
    (**event).as_any().downcast_ref::<E>()
}
