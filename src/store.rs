//! Persistence collaborators and their in-memory implementations.
//!
//! Every call is atomic and immediately visible to the calling process. State
//! changes go through [`EntityStore::update_state`], a compare-and-set on the
//! entity's update counter.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::model::{Entity, OwnerRef, PowerState, VirtualMachine};

pub trait EntityStore<E: Entity>: Send + Sync {
    /// Reserve an id for an entity that is about to be persisted.
    fn allocate_id(&self) -> u64;

    fn find_by_id(&self, id: u64) -> Option<E>;

    /// Insert an entity, assigning an id when it has none.
    fn persist(&self, entity: E) -> E;

    /// Replace the domain attributes of a stored entity. The stored lifecycle
    /// is kept as-is.
    fn update(&self, entity: &E) -> bool;

    /// Move `id` from `from` to `to` if nobody changed it since
    /// `expected_count` was read. Returns the updated entity on success.
    fn update_state(&self, id: u64, from: E::State, to: E::State, expected_count: u64) -> Option<E>;

    fn list_by_owner(&self, owner: OwnerRef) -> Vec<E>;

    fn list_in_states(&self, states: &[E::State]) -> Vec<E>;
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Entity storage backed by a map. Ids are assigned from 1 upwards.
#[derive(Debug)]
pub struct MemoryStore<E> {
    entities: RwLock<BTreeMap<u64, E>>,
    next_id: AtomicU64,
}

impl<E> Default for MemoryStore<E> {
    fn default() -> Self {
        Self {
            entities: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E: Entity> MemoryStore<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        read(&self.entities).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pretend the entity has not been touched for `by`.
    #[cfg(test)]
    pub(crate) fn backdate(&self, id: u64, by: chrono::Duration) {
        if let Some(entity) = write(&self.entities).get_mut(&id) {
            entity.lifecycle_mut().backdate(by);
        }
    }
}

impl<E: Entity> EntityStore<E> for MemoryStore<E> {
    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn find_by_id(&self, id: u64) -> Option<E> {
        read(&self.entities).get(&id).cloned()
    }

    fn persist(&self, mut entity: E) -> E {
        if entity.id() == 0 {
            entity.assign_id(self.allocate_id());
        }
        write(&self.entities).insert(entity.id(), entity.clone());
        entity
    }

    fn update(&self, entity: &E) -> bool {
        let mut entities = write(&self.entities);
        match entities.get_mut(&entity.id()) {
            Some(stored) => {
                let lifecycle = stored.lifecycle().clone();
                *stored = entity.clone();
                *stored.lifecycle_mut() = lifecycle;
                true
            }
            None => false,
        }
    }

    fn update_state(
        &self,
        id: u64,
        from: E::State,
        to: E::State,
        expected_count: u64,
    ) -> Option<E> {
        let mut entities = write(&self.entities);
        let stored = entities.get_mut(&id)?;
        let lifecycle = stored.lifecycle_mut();
        if lifecycle.state() != from || lifecycle.update_count() != expected_count {
            return None;
        }
        lifecycle.advance(to);
        Some(stored.clone())
    }

    fn list_by_owner(&self, owner: OwnerRef) -> Vec<E> {
        read(&self.entities)
            .values()
            .filter(|e| e.owner() == owner)
            .cloned()
            .collect()
    }

    fn list_in_states(&self, states: &[E::State]) -> Vec<E> {
        read(&self.entities)
            .values()
            .filter(|e| states.contains(&e.state()))
            .cloned()
            .collect()
    }
}

/// Lookup of the VMs that own snapshots and volumes.
pub trait VmInventory: Send + Sync {
    fn find_vm(&self, id: u64) -> Option<VirtualMachine>;

    fn persist_vm(&self, vm: VirtualMachine) -> VirtualMachine;

    fn update_power_state(&self, id: u64, state: PowerState) -> bool;
}

#[derive(Debug, Default)]
pub struct MemoryInventory {
    vms: RwLock<HashMap<u64, VirtualMachine>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VmInventory for MemoryInventory {
    fn find_vm(&self, id: u64) -> Option<VirtualMachine> {
        read(&self.vms).get(&id).cloned()
    }

    fn persist_vm(&self, vm: VirtualMachine) -> VirtualMachine {
        write(&self.vms).insert(vm.id, vm.clone());
        vm
    }

    fn update_power_state(&self, id: u64, state: PowerState) -> bool {
        match write(&self.vms).get_mut(&id) {
            Some(vm) => {
                vm.power_state = state;
                true
            }
            None => false,
        }
    }
}
