//! Security and capability collaborators consulted during validation.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestrationError, Result};
use crate::model::Account;

pub trait AccessChecker: Send + Sync {
    /// Fails with `PermissionDenied` when `principal` may not act on a
    /// resource owned by `owner_account`.
    fn check_access(&self, principal: &Account, owner_account: u64, resource: &str) -> Result<()>;
}

/// Admins see everything, everyone else only their own resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerOrAdmin;

impl AccessChecker for OwnerOrAdmin {
    fn check_access(&self, principal: &Account, owner_account: u64, resource: &str) -> Result<()> {
        if principal.admin || principal.id == owner_account {
            Ok(())
        } else {
            Err(OrchestrationError::PermissionDenied(format!(
                "account {} cannot access {resource}",
                principal.name
            )))
        }
    }
}

/// Operations whose availability depends on the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    VmSnapshot,
    VmSnapshotMemory,
    VmSnapshotRevert,
    VolumeResize,
    VolumeLiveMigrate,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::VmSnapshot => "vm-snapshot",
            Operation::VmSnapshotMemory => "vm-snapshot-memory",
            Operation::VmSnapshotRevert => "vm-snapshot-revert",
            Operation::VolumeResize => "volume-resize",
            Operation::VolumeLiveMigrate => "volume-live-migrate",
        };
        f.write_str(name)
    }
}

pub trait CapabilityCatalog: Send + Sync {
    fn is_operation_supported(&self, resource_type: &str, operation: Operation) -> bool;

    fn require(&self, resource_type: &str, operation: Operation) -> Result<()> {
        if self.is_operation_supported(resource_type, operation) {
            Ok(())
        } else {
            Err(OrchestrationError::Unsupported(format!(
                "{operation} is not supported on {resource_type}"
            )))
        }
    }
}

/// A capability table fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct StaticCapabilities {
    supported: HashMap<String, HashSet<Operation>>,
}

impl StaticCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, resource_type: &str, operations: &[Operation]) -> Self {
        self.supported
            .entry(resource_type.to_string())
            .or_default()
            .extend(operations.iter().copied());
        self
    }

    /// The matrix shipped by default.
    pub fn standard() -> Self {
        use Operation::*;

        Self::new()
            .allow(
                "kvm",
                &[VmSnapshot, VmSnapshotMemory, VmSnapshotRevert, VolumeResize, VolumeLiveMigrate],
            )
            .allow(
                "vmware",
                &[VmSnapshot, VmSnapshotMemory, VmSnapshotRevert, VolumeResize, VolumeLiveMigrate],
            )
            .allow("xenserver", &[VmSnapshot, VmSnapshotRevert, VolumeResize])
            .allow(
                "simulator",
                &[VmSnapshot, VmSnapshotMemory, VmSnapshotRevert, VolumeResize, VolumeLiveMigrate],
            )
    }
}

impl CapabilityCatalog for StaticCapabilities {
    fn is_operation_supported(&self, resource_type: &str, operation: Operation) -> bool {
        self.supported
            .get(resource_type)
            .is_some_and(|ops| ops.contains(&operation))
    }
}
