use k8s_openapi::api::core::v1::{ObjectReference, PodTemplateSpec};
use kube::core::ObjectList;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of an `Alpine`.
///
/// `pod_template` is the worker-template override. When its `spec` is present it
/// replaces the built-in worker pod spec wholesale; its metadata labels and
/// annotations are always copied onto the worker pod.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[kube(
    group = "staight.k8s.io",
    version = "v1",
    kind = "Alpine",
    plural = "alpines",
    shortname = "alp",
    namespaced,
    status = "AlpineStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AlpineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<PodTemplateSpec>,
}

/// Observed state, rewritten by every reconcile pass that finds no worker.
#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
pub struct AlpineStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active: Vec<ObjectReference>,
}

pub type AlpineList = ObjectList<Alpine>;

impl AlpineSpec {
    /// The user-supplied pod spec, if the template carries one.
    pub fn pod_spec_override(&self) -> Option<&k8s_openapi::api::core::v1::PodSpec> {
        self.pod_template.as_ref().and_then(|t| t.spec.as_ref())
    }

    pub fn template_labels(&self) -> impl Iterator<Item = (&String, &String)> {
        self.template_meta().and_then(|m| m.labels.as_ref()).into_iter().flatten()
    }

    pub fn template_annotations(&self) -> impl Iterator<Item = (&String, &String)> {
        self.template_meta().and_then(|m| m.annotations.as_ref()).into_iter().flatten()
    }

    fn template_meta(&self) -> Option<&k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta> {
        self.pod_template.as_ref().and_then(|t| t.metadata.as_ref())
    }
}
