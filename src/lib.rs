//! Lifecycle state machines and serialized job orchestration for IaaS
//! volumes and VM snapshots.
//!
//! Entities change state only through the declarative tables in
//! [`state_machine`]. Operations in [`orchestrator`] validate, claim the
//! owning resource in the [`work_queue`] and drive those tables from inside
//! the job body. [`reconcile`] resolves entities a crash left mid-transition.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod guard;
pub mod model;
pub mod orchestrator;
pub mod policy;
pub mod reconcile;
pub mod sim;
pub mod state_machine;
pub mod store;
pub mod work_queue;
