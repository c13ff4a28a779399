//! Registers the reconciler with the kube-rs runtime.
//!
//! The controller is `for` Alpine and `owns` Pod, so changes to either
//! trigger a pass for the owning Alpine. A separate pod watch keeps the owner
//! index current; passes only start once that index has seen a full listing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::Reporter;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::EffectiveConfig;
use crate::crd::Alpine;
use crate::error::Error;
use crate::owner_index::OwnerIndex;
use crate::reconciler::Reconciler;
use crate::store::KubeStore;
use crate::telemetry;

pub const CONTROLLER_NAME: &str = "alpine-operator";

pub struct Context {
    reconciler: Reconciler<KubeStore>,
    error_requeue: Duration,
}

async fn reconcile(alpine: Arc<Alpine>, ctx: Arc<Context>) -> Result<Action, Error> {
    let timer = telemetry::RECONCILE_DURATION.start_timer();
    let result = ctx.reconciler.reconcile(&ObjectRef::from_obj(alpine.as_ref())).await;
    timer.observe_duration();
    let outcome = if result.is_ok() { "success" } else { "error" };
    telemetry::RECONCILE_TOTAL.with_label_values(&[outcome]).inc();
    result
}

/// No retry happens inside a pass; failed keys come back after `error_requeue`.
fn error_policy(alpine: Arc<Alpine>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(alpine = %alpine.name_any(), kind = error.kind(), error = %error, "reconcile.failed");
    telemetry::RECONCILE_ERRORS.with_label_values(&[error.kind()]).inc();
    Action::requeue(ctx.error_requeue)
}

/// Feeds pod watch events into `index`, signalling `synced` after the first full listing.
pub async fn watch_pods(api: Api<Pod>, index: OwnerIndex<Alpine>, synced: oneshot::Sender<()>) {
    let mut synced = Some(synced);
    let mut events = watcher(api, watcher::Config::default()).default_backoff().boxed();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                index.apply(&event);
                if matches!(event, watcher::Event::Restarted(_)) {
                    if let Some(tx) = synced.take() {
                        debug!("pod_watch.synced");
                        let _ = tx.send(());
                    }
                }
            }
            Err(e) => warn!(error = %e, "pod_watch.error"),
        }
    }
    warn!("pod_watch.ended");
}

pub async fn run(client: Client, config: EffectiveConfig) -> anyhow::Result<()> {
    let (alpines, pods) = match config.namespace.as_deref() {
        Some(ns) => (Api::<Alpine>::namespaced(client.clone(), ns), Api::<Pod>::namespaced(client.clone(), ns)),
        None => (Api::<Alpine>::all(client.clone()), Api::<Pod>::all(client.clone())),
    };
    alpines
        .list(&ListParams::default().limit(1))
        .await
        .context("Alpine CRD is not installed or not readable; apply the output of crd-gen")?;

    telemetry::init();
    let index = OwnerIndex::<Alpine>::new();

    let listener = tokio::net::TcpListener::bind(config.metrics_addr)
        .await
        .with_context(|| format!("bind metrics address {}", config.metrics_addr))?;
    info!(addr = %config.metrics_addr, "metrics listening");
    let probes = telemetry::router(index.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, probes).await {
            warn!(error = %e, "metrics server stopped");
        }
    });

    let (synced_tx, synced_rx) = oneshot::channel();
    let pod_watch = tokio::spawn(watch_pods(pods.clone(), index.clone(), synced_tx));
    info!("waiting for pod cache to sync");
    synced_rx.await.context("pod watch ended before the initial listing")?;

    let reporter = Reporter {
        controller: CONTROLLER_NAME.into(),
        instance: std::env::var("POD_NAME").ok(),
    };
    let ctx = Arc::new(Context {
        reconciler: Reconciler::new(KubeStore::new(client, index, reporter), config.worker)
            .with_timeout(config.reconcile_timeout),
        error_requeue: config.error_requeue,
    });

    info!(namespace = config.namespace.as_deref().unwrap_or("*"), "running alpine controller");
    Controller::new(alpines, watcher::Config::default())
        .owns(pods, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(alpine = %obj, "reconciled"),
                Err(e) => debug!(error = %e, "reconcile attempt failed"),
            }
        })
        .await;

    pod_watch.abort();
    info!("controller terminated");
    Ok(())
}
