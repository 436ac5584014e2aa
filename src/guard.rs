//! Precondition checks run before a transition is attempted.

use std::sync::Arc;

use crate::error::{OrchestrationError, Result};
use crate::model::{Entity, OwnerRef};
use crate::store::EntityStore;
use crate::work_queue::WorkItem;

pub struct LifecycleGuard<E: Entity> {
    store: Arc<dyn EntityStore<E>>,
}

impl<E: Entity> Clone for LifecycleGuard<E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<E: Entity> LifecycleGuard<E> {
    pub fn new(store: Arc<dyn EntityStore<E>>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &dyn EntityStore<E> {
        self.store.as_ref()
    }

    pub fn find(&self, id: u64) -> Result<E> {
        self.store
            .find_by_id(id)
            .ok_or(OrchestrationError::EntityNotFound { kind: E::KIND, id })
    }

    /// Load `id` and require its state to be one of `allowed`.
    pub fn guard(&self, id: u64, allowed: &[E::State], operation: &str) -> Result<E> {
        let entity = self.find(id)?;
        if allowed.contains(&entity.state()) {
            Ok(entity)
        } else {
            Err(OrchestrationError::IllegalState {
                kind: E::KIND,
                id,
                state: entity.state().to_string(),
                operation: operation.to_string(),
            })
        }
    }

    /// Reject when `owner` already has work of this entity kind in flight.
    ///
    /// `active` must be the owner's active items as seen inside the work-item
    /// store's claim; this is what makes the check atomic with submission.
    /// Any entity of the owner sitting in `busy` counts as in flight too,
    /// except `target`, which the caller has already checked.
    pub fn ensure_idle(
        &self,
        owner: OwnerRef,
        active: &[WorkItem],
        busy: &[E::State],
        target: Option<u64>,
    ) -> Result<()> {
        if let Some(item) = active.iter().find(|item| item.entity_kind == E::KIND) {
            return Err(OrchestrationError::ConcurrentOperation(format!(
                "{owner} has {} work in progress (job {})",
                E::KIND,
                item.job_id
            )));
        }
        if let Some(entity) = self
            .store
            .list_by_owner(owner)
            .into_iter()
            .find(|entity| Some(entity.id()) != target && busy.contains(&entity.state()))
        {
            return Err(OrchestrationError::ConcurrentOperation(format!(
                "{} {} of {owner} is {}",
                E::KIND,
                entity.id(),
                entity.state()
            )));
        }
        Ok(())
    }
}
