//! Events raised by track workflows

use uuid::Uuid;

use super::event_bus::{Event, EventEmitter};
use crate::entities::frame::TrackType;

/// The track has nothing left to render at or after `frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackEndReached {
    pub track_id: Uuid,
    pub kind: TrackType,
    pub frame: i64,
}

/// Track-side emitter; a no-op until attached to a bus
#[derive(Clone, Default, Debug)]
pub struct TrackEventEmitter {
    inner: Option<EventEmitter>,
}

impl TrackEventEmitter {
    pub fn dummy() -> Self {
        Self { inner: None }
    }

    pub fn from_emitter(emitter: EventEmitter) -> Self {
        Self { inner: Some(emitter) }
    }

    pub fn is_attached(&self) -> bool {
        self.inner.is_some()
    }

    pub fn emit<E: Event>(&self, event: E) {
        if let Some(emitter) = &self.inner {
            emitter.emit(event);
        }
    }
}
