//! Change notifications emitted by the settings engine.
//!
//! Events are observation-only. They are delivered synchronously at the end
//! of a successful write, after invalidation has finished, so an observer
//! that reads back a property always sees the new value.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::container::PresetLayer;
use crate::setting_id::StackId;

/// Events emitted by `SettingsEngine` writes.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// A stored property was written or removed.
    PropertyChanged(PropertyChangedEvent),

    /// A stack's composition or links changed.
    StackRewired(StackRewiredEvent),
}

impl ChangeEvent {
    pub fn revision(&self) -> u64 {
        match self {
            ChangeEvent::PropertyChanged(e) => e.revision,
            ChangeEvent::StackRewired(e) => e.revision,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChangedEvent {
    /// Revision produced by the write.
    pub revision: u64,
    pub stack: StackId,
    pub key: String,
    pub property: String,
    /// Cached properties evicted by the write.
    pub invalidated: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StackRewiredEvent {
    pub revision: u64,
    pub stack: StackId,
    pub reason: RewireReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewireReason {
    PresetChanged(PresetLayer),
    WritableLayerReplaced,
    ExtruderAdded,
    ExtruderEnabled(bool),
    ObjectAdded,
    ObjectRebound { position: i64 },
    ObjectRemoved,
}

/// Callback type for receiving engine events.
pub type EventCallback = Box<dyn FnMut(ChangeEvent) + Send>;

/// Simple event collector for testing and for the CLI's verbose output.
#[derive(Debug, Default)]
pub struct EventCollector {
    events: Vec<ChangeEvent>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn push(&mut self, event: ChangeEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Filter to only PropertyChanged events.
    pub fn property_changed(&self) -> Vec<&PropertyChangedEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ChangeEvent::PropertyChanged(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    /// Filter to only StackRewired events.
    pub fn stack_rewired(&self) -> Vec<&StackRewiredEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ChangeEvent::StackRewired(r) => Some(r),
                _ => None,
            })
            .collect()
    }
}

/// Observer that appends into a shared collector.
pub fn collect_into(collector: Arc<Mutex<EventCollector>>) -> EventCallback {
    Box::new(move |event| collector.lock().push(event))
}
