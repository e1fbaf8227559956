use k8s_openapi::api::core::v1::Endpoints;
use kube::Api;
use svclocal_common::{PodInfo, ServiceInfo};

use crate::error::ProxyError;

const POD_KIND: &str = "Pod";

/// Fetches the service's endpoints and returns the first ready pod.
///
/// No caching; callers decide how fresh they need the answer to be.
pub async fn pod_for_service(
    client: &kube::Client,
    service: &ServiceInfo,
) -> Result<PodInfo, ProxyError> {
    let api: Api<Endpoints> = Api::namespaced(client.clone(), &service.namespace);
    let endpoints = api.get(&service.name).await?;
    first_pod_endpoint(&endpoints, service).ok_or(ProxyError::NoEndpoints)
}

/// Scans subsets and addresses in the order the cluster returned them,
/// accepting the first address whose target reference names a pod.
pub fn first_pod_endpoint(endpoints: &Endpoints, service: &ServiceInfo) -> Option<PodInfo> {
    for subset in endpoints.subsets.as_deref().unwrap_or_default() {
        for address in subset.addresses.as_deref().unwrap_or_default() {
            let Some(target) = address.target_ref.as_ref() else {
                continue;
            };
            if target.kind.as_deref() != Some(POD_KIND) {
                continue;
            }
            let Some(name) = target.name.clone() else {
                continue;
            };
            let namespace = target
                .namespace
                .clone()
                .unwrap_or_else(|| service.namespace.clone());
            return Some(PodInfo::new(namespace, name));
        }
    }
    None
}
