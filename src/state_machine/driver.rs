use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::state::Impact;
use crate::error::{OrchestrationError, Result};
use crate::model::{Entity, EntityKind, OwnerRef};
use crate::store::EntityStore;

/// What a listener sees after a transition has been persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub kind: EntityKind,
    pub entity_id: u64,
    pub owner: OwnerRef,
    pub from: String,
    pub event: String,
    pub to: String,
    pub impacts: Vec<Impact>,
    pub at: DateTime<Utc>,
}

/// Side channel for transition tags, e.g. usage accounting.
pub trait TransitionListener: Send + Sync {
    fn on_transition(&self, record: &TransitionRecord);
}

/// Collects usage-impacting transitions for the accounting subsystem.
#[derive(Debug, Default)]
pub struct UsageRecorder {
    records: Mutex<Vec<TransitionRecord>>,
}

impl UsageRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TransitionRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TransitionListener for UsageRecorder {
    fn on_transition(&self, record: &TransitionRecord) {
        if record.impacts.contains(&Impact::Usage) {
            self.records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(record.clone());
        }
    }
}

/// Applies state machine transitions to stored entities.
///
/// The next state comes from the entity's table; the write is a
/// compare-and-set so a concurrent writer is detected instead of overwritten.
#[derive(Clone, Default)]
pub struct StateDriver {
    listeners: Vec<Arc<dyn TransitionListener>>,
}

impl StateDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(mut self, listener: Arc<dyn TransitionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Fire `event` on `entity` as it was read.
    pub fn drive<E: Entity>(
        &self,
        store: &dyn EntityStore<E>,
        entity: &E,
        event: E::Event,
    ) -> Result<E> {
        let transition = E::machine().transition(entity.state(), event)?;
        let updated = store
            .update_state(
                entity.id(),
                transition.from,
                transition.to,
                entity.lifecycle().update_count(),
            )
            .ok_or_else(|| {
                OrchestrationError::ConcurrentOperation(format!(
                    "{} {} changed while applying {event}",
                    E::KIND,
                    entity.id()
                ))
            })?;

        debug!(
            kind = %E::KIND,
            id = entity.id(),
            from = %transition.from,
            event = %event,
            to = %transition.to,
            "state transition"
        );

        if !self.listeners.is_empty() {
            let record = TransitionRecord {
                kind: E::KIND,
                entity_id: entity.id(),
                owner: updated.owner(),
                from: transition.from.to_string(),
                event: event.to_string(),
                to: transition.to.to_string(),
                impacts: transition.impacts.to_vec(),
                at: updated.lifecycle().updated_at(),
            };
            for listener in &self.listeners {
                listener.on_transition(&record);
            }
        }

        Ok(updated)
    }

    /// Re-read the entity and fire `event` on its current state.
    pub fn drive_by_id<E: Entity>(
        &self,
        store: &dyn EntityStore<E>,
        id: u64,
        event: E::Event,
    ) -> Result<E> {
        let entity = store
            .find_by_id(id)
            .ok_or(OrchestrationError::EntityNotFound { kind: E::KIND, id })?;
        self.drive(store, &entity, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Volume, VolumeFormat};
    use crate::state_machine::{VolumeEvent, VolumeState};
    use crate::store::MemoryStore;

    fn setup() -> (StateDriver, Arc<UsageRecorder>, MemoryStore<Volume>, Volume) {
        let usage = Arc::new(UsageRecorder::new());
        let driver = StateDriver::new().with_listener(usage.clone());
        let store = MemoryStore::new();
        let volume = store.persist(Volume::new("root", 1, 10, VolumeFormat::Qcow2));
        (driver, usage, store, volume)
    }

    #[test]
    fn drive_persists_next_state() {
        let (driver, _, store, volume) = setup();
        let creating = driver.drive(&store, &volume, VolumeEvent::CreateRequested).unwrap();
        assert_eq!(creating.state(), VolumeState::Creating);
        assert_eq!(store.find_by_id(volume.id).unwrap().state(), VolumeState::Creating);
    }

    #[test]
    fn stale_read_is_a_concurrency_error() {
        let (driver, _, store, volume) = setup();
        driver.drive(&store, &volume, VolumeEvent::CreateRequested).unwrap();
        // `volume` still says Allocated with the old counter.
        let err = driver
            .drive(&store, &volume, VolumeEvent::CreateRequested)
            .unwrap_err();
        assert!(err.is_concurrency());
    }

    #[test]
    fn unregistered_event_leaves_entity_untouched() {
        let (driver, _, store, volume) = setup();
        let err = driver
            .drive(&store, &volume, VolumeEvent::ResizeRequested)
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::NoTransition { .. }));
        assert_eq!(store.find_by_id(volume.id).unwrap().state(), VolumeState::Allocated);
    }

    #[test]
    fn only_usage_edges_reach_the_recorder() {
        let (driver, usage, store, volume) = setup();
        driver.drive_by_id(&store, volume.id, VolumeEvent::CreateRequested).unwrap();
        driver.drive_by_id(&store, volume.id, VolumeEvent::OperationSucceeded).unwrap();

        let records = usage.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].from, "Creating");
        assert_eq!(records[0].to, "Ready");
    }

    #[test]
    fn completion_after_expunge_is_a_no_op() {
        let (driver, _, store, volume) = setup();
        for event in [
            VolumeEvent::DestroyRequested,
            VolumeEvent::ExpungingRequested,
            VolumeEvent::OperationSucceeded,
        ] {
            driver.drive_by_id(&store, volume.id, event).unwrap();
        }
        for event in [VolumeEvent::OperationSucceeded, VolumeEvent::OperationFailed] {
            let again = driver.drive_by_id(&store, volume.id, event).unwrap();
            assert_eq!(again.state(), VolumeState::Expunged);
        }
    }
}
