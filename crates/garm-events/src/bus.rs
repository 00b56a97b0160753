//! Typed broadcast bus for configuration mutations.
//!
//! Built on `tokio::sync::broadcast`: bounded, fan-out, per-subscriber
//! ordered for events published from one task. Overflow drops the oldest
//! events for the lagging subscriber only, which then observes
//! [`BusEvent::Lagged`] and must reload its world from the store.

use std::collections::HashSet;

use garm_schemas::{
    ForgeCredentials, ForgeEndpoint, ForgeEntity, Instance, Pool, ScaleSet, Template,
};
use tokio::sync::broadcast;
use uuid::Uuid;

pub const DEFAULT_BUS_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    Endpoint,
    Credentials,
    Entity,
    Pool,
    ScaleSet,
    Instance,
    Template,
}

/// The mutated record, carried whole so consumers rarely need a store
/// round-trip.
#[derive(Debug, Clone)]
pub enum EventPayload {
    Endpoint(ForgeEndpoint),
    Credentials(ForgeCredentials),
    Entity(ForgeEntity),
    Pool(Pool),
    ScaleSet(ScaleSet),
    Instance(Instance),
    Template(Template),
}

impl EventPayload {
    pub fn entity_type(&self) -> EntityType {
        match self {
            EventPayload::Endpoint(_) => EntityType::Endpoint,
            EventPayload::Credentials(_) => EntityType::Credentials,
            EventPayload::Entity(_) => EntityType::Entity,
            EventPayload::Pool(_) => EntityType::Pool,
            EventPayload::ScaleSet(_) => EntityType::ScaleSet,
            EventPayload::Instance(_) => EntityType::Instance,
            EventPayload::Template(_) => EntityType::Template,
        }
    }

    /// The forge entity this record belongs to, when scoped to one.
    pub fn owning_entity(&self) -> Option<Uuid> {
        match self {
            EventPayload::Entity(e) => Some(e.id),
            EventPayload::Pool(p) => Some(p.entity_id),
            EventPayload::ScaleSet(s) => Some(s.entity_id),
            EventPayload::Instance(i) => Some(i.entity_id),
            EventPayload::Endpoint(_)
            | EventPayload::Credentials(_)
            | EventPayload::Template(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub operation: Operation,
    pub payload: EventPayload,
}

impl ChangeEvent {
    pub fn new(operation: Operation, payload: EventPayload) -> Self {
        Self { operation, payload }
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Subscription filter. `None` fields match everything; a subscriber may
/// hold several filters, an event is delivered when any filter matches.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    entity_types: Option<HashSet<EntityType>>,
    operations: Option<HashSet<Operation>>,
    owning_entity: Option<Uuid>,
}

impl EventFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn entity_types(mut self, types: impl IntoIterator<Item = EntityType>) -> Self {
        self.entity_types = Some(types.into_iter().collect());
        self
    }

    pub fn operations(mut self, ops: impl IntoIterator<Item = Operation>) -> Self {
        self.operations = Some(ops.into_iter().collect());
        self
    }

    pub fn owning_entity(mut self, entity_id: Uuid) -> Self {
        self.owning_entity = Some(entity_id);
        self
    }

    fn matches(&self, event: &ChangeEvent) -> bool {
        if let Some(types) = &self.entity_types {
            if !types.contains(&event.payload.entity_type()) {
                return false;
            }
        }
        if let Some(ops) = &self.operations {
            if !ops.contains(&event.operation) {
                return false;
            }
        }
        if let Some(owner) = self.owning_entity {
            if event.payload.owning_entity() != Some(owner) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fan-out publish. Never blocks; zero subscribers is not an error.
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventSubscriber {
        self.subscribe_filters(vec![filter])
    }

    /// Subscribe with several filters; an event matching any is delivered.
    pub fn subscribe_filters(&self, filters: Vec<EventFilter>) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
            filters,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// What a subscriber observes next.
#[derive(Debug)]
pub enum BusEvent {
    Change(ChangeEvent),
    /// The subscriber's queue overflowed and `skipped` events were dropped.
    /// The subscriber must reload its state from the store.
    Lagged(u64),
}

pub struct EventSubscriber {
    rx: broadcast::Receiver<ChangeEvent>,
    filters: Vec<EventFilter>,
}

impl EventSubscriber {
    /// Next matching event. Returns `None` once the bus is closed.
    pub async fn next(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.filters.iter().any(|f| f.matches(&event)) {
                        return Some(BusEvent::Change(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Some(BusEvent::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
