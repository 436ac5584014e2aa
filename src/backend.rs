//! Downstream agents that perform the actual hypervisor and storage work.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{PowerState, VirtualMachine, VmSnapshot, Volume};

/// What the hypervisor reports after taking a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub size_bytes: u64,
}

#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    async fn take_snapshot(
        &self,
        vm: &VirtualMachine,
        snapshot: &VmSnapshot,
        quiesce: bool,
    ) -> Result<SnapshotInfo>;

    async fn delete_snapshot(&self, vm: &VirtualMachine, snapshot: &VmSnapshot) -> Result<()>;

    /// Returns the power state the VM ends up in.
    async fn revert_to_snapshot(
        &self,
        vm: &VirtualMachine,
        snapshot: &VmSnapshot,
    ) -> Result<PowerState>;
}

#[async_trait]
pub trait VolumeBackend: Send + Sync {
    /// Creates the volume and returns the pool it landed on.
    async fn create_volume(&self, volume: &Volume) -> Result<u64>;

    async fn resize_volume(&self, volume: &Volume, new_size: u64) -> Result<()>;

    async fn migrate_volume(&self, volume: &Volume, pool_id: u64) -> Result<()>;

    async fn expunge_volume(&self, volume: &Volume) -> Result<()>;
}
