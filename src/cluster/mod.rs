pub mod knative;
pub mod pac;
pub mod pipelines;
pub mod resources;
pub mod templates;
pub mod upload;

use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};

/// Label carried by every cluster resource belonging to a function.
pub const FUNCTION_NAME_LABEL: &str = "function.knative.dev/name";

pub fn tekton_gvk(kind: &str) -> GroupVersionKind {
    GroupVersionKind::gvk("tekton.dev", "v1", kind)
}

pub fn pac_repository_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("pipelinesascode.tekton.dev", "v1alpha1", "Repository")
}

pub fn knative_service_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("serving.knative.dev", "v1", "Service")
}

/// A namespaced API handle for a custom resource kind.
pub fn dynamic_api(
    client: kube::Client,
    namespace: &str,
    gvk: &GroupVersionKind,
) -> Api<DynamicObject> {
    Api::namespaced_with(client, namespace, &ApiResource::from_gvk(gvk))
}

/// The label selector matching all of a function's resources.
pub fn function_selector(name: &str) -> String {
    format!("{FUNCTION_NAME_LABEL}={name}")
}
