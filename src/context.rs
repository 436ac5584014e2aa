//! Explicit execution context passed down every orchestrator call.
//!
//! A job body receives a context carrying a [`DispatchScope`]. Orchestrators
//! check that scope to decide between queueing new work and running inline.

use serde::{Deserialize, Serialize};

use crate::model::{Account, OwnerRef};
use crate::work_queue::JobId;

/// Identifies the dispatched job the current call runs inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchScope {
    pub job_id: JobId,
    pub dispatcher: String,
    pub owner: OwnerRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    principal: Account,
    scope: Option<DispatchScope>,
}

impl CallContext {
    /// A call from outside any job, e.g. an API request.
    pub fn new(principal: Account) -> Self {
        Self {
            principal,
            scope: None,
        }
    }

    pub(crate) fn dispatched(principal: Account, scope: DispatchScope) -> Self {
        Self {
            principal,
            scope: Some(scope),
        }
    }

    pub fn principal(&self) -> &Account {
        &self.principal
    }

    pub fn scope(&self) -> Option<&DispatchScope> {
        self.scope.as_ref()
    }

    pub fn is_dispatched(&self) -> bool {
        self.scope.is_some()
    }

    pub fn is_dispatched_by(&self, dispatcher: &str) -> bool {
        self.scope
            .as_ref()
            .is_some_and(|scope| scope.dispatcher == dispatcher)
    }
}
