//! Keeps exactly one worker pod running per `Alpine` custom resource.
//!
//! A pod is created only when the owner index shows the Alpine has none.
//! Pods are controller-owned by their Alpine, so the garbage collector removes
//! them when the Alpine is deleted; this crate never deletes pods itself.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod logging;
pub mod owner_index;
pub mod pod;
pub mod reconciler;
pub mod store;
pub mod telemetry;

pub use crd::{Alpine, AlpineList, AlpineSpec, AlpineStatus};
pub use error::Error;
pub use owner_index::OwnerIndex;
pub use pod::{construct_pod, WorkerDefaults, SCHEDULED_AT_ANNOTATION};
pub use reconciler::Reconciler;
