//! Load balancer endpoint reported back to the caller

use crate::cluster::{ClusterClient, ClusterError};
use crate::model::Resource;
use serde_json::Value;
use tracing::debug;

/// First applied Service of type `LoadBalancer`
pub fn load_balancer_service(resources: &[Resource]) -> Option<&Resource> {
    resources.iter().find(|r| {
        r.id.kind == "Service"
            && r.id.group().is_empty()
            && r.object.data.pointer("/spec/type").and_then(Value::as_str) == Some("LoadBalancer")
    })
}

fn service_ports(service: &Resource) -> Vec<i64> {
    service
        .object
        .data
        .pointer("/spec/ports")
        .and_then(Value::as_array)
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| p.get("port").and_then(Value::as_i64))
                .collect()
        })
        .unwrap_or_default()
}

/// URL for a load balancer host given the Service ports
///
/// 443 wins over 80; a single other port is spelled out. With several
/// unrecognised ports only the host is returned.
pub fn endpoint_url(host: &str, ports: &[i64]) -> String {
    if ports.contains(&443) {
        format!("https://{}/", host)
    } else if ports.contains(&80) {
        format!("http://{}/", host)
    } else if let [port] = ports {
        format!("http://{}:{}/", host, port)
    } else {
        host.to_string()
    }
}

/// Endpoint of the release's load balancer, None when there is none or it is pending
pub async fn load_balancer_endpoint(
    cluster: &dyn ClusterClient,
    resources: &[Resource],
) -> Result<Option<String>, ClusterError> {
    let Some(service) = load_balancer_service(resources) else {
        return Ok(None);
    };
    let Some(host) = cluster.load_balancer_ingress(&service.id).await? else {
        debug!(service = %service.id, "Load balancer ingress not assigned yet");
        return Ok(None);
    };
    Ok(Some(endpoint_url(&host, &service_ports(service))))
}
