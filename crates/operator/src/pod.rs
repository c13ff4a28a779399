//! Builds the worker pod for an `Alpine`.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::Deserialize;

use crate::crd::Alpine;
use crate::error::ConstructError;

/// Annotation stamped on every worker pod with its construction time (RFC 3339, UTC).
pub const SCHEDULED_AT_ANNOTATION: &str = "staight.k8s.io/scheduled-at";

/// Pod spec used when an `Alpine` carries no pod spec of its own.
///
/// Immutable once loaded; every construction clones from it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerDefaults {
    pub container_name: String,
    pub image: String,
    pub image_pull_policy: String,
    pub command: Vec<String>,
    pub restart_policy: String,
}

impl Default for WorkerDefaults {
    fn default() -> Self {
        Self {
            container_name: "alpine".into(),
            image: "alpine".into(),
            image_pull_policy: "IfNotPresent".into(),
            command: vec!["sleep".into(), "3600".into()],
            restart_policy: "Always".into(),
        }
    }
}

impl WorkerDefaults {
    pub fn pod_spec(&self) -> PodSpec {
        PodSpec {
            containers: vec![Container {
                name: self.container_name.clone(),
                image: Some(self.image.clone()),
                image_pull_policy: Some(self.image_pull_policy.clone()),
                command: Some(self.command.clone()),
                ..Container::default()
            }],
            restart_policy: Some(self.restart_policy.clone()),
            ..PodSpec::default()
        }
    }
}

/// `<alpine name>-<unix seconds>`.
pub fn worker_name(alpine_name: &str, scheduled_at: DateTime<Utc>) -> String {
    format!("{}-{}", alpine_name, scheduled_at.timestamp())
}

/// Constructs the worker pod for `alpine` as of `scheduled_at`.
///
/// A pod spec in the Alpine's template replaces `defaults` entirely; the two
/// are never merged. Template labels and annotations are copied as-is and the
/// scheduled-at annotation is added on top. The pod is controller-owned by
/// `alpine` so that deleting the Alpine garbage-collects it.
pub fn construct_pod(
    alpine: &Alpine,
    defaults: &WorkerDefaults,
    scheduled_at: DateTime<Utc>,
) -> Result<Pod, ConstructError> {
    let name = alpine.metadata.name.as_deref().ok_or(ConstructError::MissingField(".metadata.name"))?;
    let namespace = alpine
        .metadata
        .namespace
        .as_deref()
        .ok_or(ConstructError::MissingField(".metadata.namespace"))?;

    let owner = alpine
        .controller_owner_ref(&())
        .ok_or_else(|| ConstructError::Ownership(format!("{namespace}/{name}")))?;

    let spec = match alpine.spec.pod_spec_override() {
        Some(spec) => spec.clone(),
        None => defaults.pod_spec(),
    };

    let labels: BTreeMap<String, String> =
        alpine.spec.template_labels().map(|(k, v)| (k.clone(), v.clone())).collect();
    let mut annotations: BTreeMap<String, String> =
        alpine.spec.template_annotations().map(|(k, v)| (k.clone(), v.clone())).collect();
    annotations.insert(
        SCHEDULED_AT_ANNOTATION.to_string(),
        scheduled_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    );

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(worker_name(name, scheduled_at)),
            namespace: Some(namespace.to_string()),
            labels: (!labels.is_empty()).then_some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner]),
            ..ObjectMeta::default()
        },
        spec: Some(spec),
        status: None,
    })
}

/// Parses the scheduled-at annotation of a worker pod.
pub fn scheduled_at(pod: &Pod) -> Option<DateTime<Utc>> {
    let raw = pod.annotations().get(SCHEDULED_AT_ANNOTATION)?;
    DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
}
