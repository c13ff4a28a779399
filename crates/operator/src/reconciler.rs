//! The reconcile pass: make sure an `Alpine` has a worker pod.
//!
//! A pass is safe to repeat from any point. It only ever creates a pod when the
//! owner index reports none, and it writes the observed status before the
//! create so that a crash in between leaves a consistent baseline.

use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::crd::{Alpine, AlpineStatus};
use crate::error::Error;
use crate::pod::{construct_pod, WorkerDefaults};
use crate::store::{WorkerEvent, WorkloadStore};
use crate::telemetry;

/// Time budget for one pass, checked between steps.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    fn new(limit: Option<Duration>) -> Self {
        Self { started: Instant::now(), limit }
    }

    fn check(&self, next_step: &'static str) -> Result<(), Error> {
        match self.limit {
            Some(limit) if self.started.elapsed() >= limit => Err(Error::DeadlineExceeded(next_step)),
            _ => Ok(()),
        }
    }
}

pub struct Reconciler<S> {
    store: S,
    defaults: WorkerDefaults,
    timeout: Option<Duration>,
}

impl<S: WorkloadStore> Reconciler<S> {
    pub fn new(store: S, defaults: WorkerDefaults) -> Self {
        Self { store, defaults, timeout: None }
    }

    /// Abort passes that run longer than `timeout`. `None` disables the check.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn defaults(&self) -> &WorkerDefaults {
        &self.defaults
    }

    #[instrument(skip_all, fields(alpine = %key))]
    pub async fn reconcile(&self, key: &ObjectRef<Alpine>) -> Result<Action, Error> {
        let deadline = Deadline::new(self.timeout);
        let namespace = key
            .namespace
            .as_deref()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let name = key.name.as_str();

        let Some(mut alpine) = self.store.get_alpine(namespace, name).await.map_err(Error::Get)? else {
            // Deleted; the pod goes with it through garbage collection.
            debug!("reconcile.not_found");
            return Ok(Action::await_change());
        };

        deadline.check("listing child pods")?;
        let children = self.store.children(name, namespace).map_err(Error::List)?;
        debug!(active = children.len(), "reconcile.pod_count");
        if !children.is_empty() {
            debug!("reconcile.has_worker");
            return Ok(Action::await_change());
        }

        deadline.check("updating status")?;
        alpine.status = Some(AlpineStatus {
            active: children.iter().map(|pod| pod.object_ref(&())).collect(),
        });
        let alpine = match self.store.replace_status(namespace, &alpine).await {
            Ok(updated) => updated,
            Err(e) => {
                warn!(error = %e, "reconcile.status_failed");
                self.report(&alpine, WorkerEvent::warning("StatusUpdateFailed", e.to_string()))
                    .await;
                return Err(Error::StatusWrite(e));
            }
        };

        deadline.check("constructing pod")?;
        let pod = match construct_pod(&alpine, &self.defaults, Utc::now()) {
            Ok(pod) => pod,
            Err(e) => {
                warn!(error = %e, "reconcile.construct_failed");
                self.report(&alpine, WorkerEvent::warning("InvalidTemplate", e.to_string()))
                    .await;
                return Err(Error::Construct(e));
            }
        };

        deadline.check("creating pod")?;
        match self.store.create_pod(namespace, &pod).await {
            Ok(created) => {
                let pod_name = created.name_any();
                info!(pod = %pod_name, "reconcile.pod_created");
                telemetry::PODS_CREATED.inc();
                self.report(&alpine, WorkerEvent::normal("Created", format!("Created worker pod {pod_name}")))
                    .await;
            }
            Err(e) => {
                warn!(error = %e, pod = %pod.name_any(), "reconcile.create_failed");
                self.report(&alpine, WorkerEvent::warning("CreateFailed", e.to_string()))
                    .await;
                return Err(Error::Create(e));
            }
        }

        Ok(Action::await_change())
    }

    async fn report(&self, alpine: &Alpine, event: WorkerEvent) {
        if let Err(e) = self.store.publish_event(alpine, event).await {
            warn!(error = %e, "reconcile.event_failed");
        }
    }
}
