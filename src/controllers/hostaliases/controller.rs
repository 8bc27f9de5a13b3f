use k8s_openapi::api::core::v1::{HostAlias, Pod, Service};
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::ResourceExt;
use tracing::*;

use crate::Result;

/// Only pods carrying this label get host aliases
pub const WATCHING_LABEL: &str = "k8s-app";

/// Copies the cluster IP of every Service into the `/etc/hosts` of watched pods
pub struct HostAliasInjector {
    client: Client,
    cluster_domain: String,
    span: Span,
}

impl HostAliasInjector {
    pub fn new(client: Client, cluster_domain: impl Into<String>, span: Span) -> Self {
        Self {
            client,
            cluster_domain: cluster_domain.into(),
            span,
        }
    }

    /// The pod with host aliases injected, or `None` if the pod is not watched
    pub async fn inject(&self, pod: Pod) -> Result<Option<Pod>> {
        let span = info_span!(
            parent: &self.span,
            "inject",
            pod = %pod.name_any(),
            namespace = %pod.namespace().unwrap_or_default(),
        );
        self.inject_aliases(pod).instrument(span).await
    }

    async fn inject_aliases(&self, pod: Pod) -> Result<Option<Pod>> {
        if !is_watched(&pod) {
            debug!(action = "skip", "Uncontrolled target");
            return Ok(None);
        }

        let services = Api::<Service>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;
        let aliases = host_aliases(&services.items, &self.cluster_domain);
        let count = aliases.len();
        let pod = with_host_aliases(pod, aliases);

        info!(aliases = count, "Injected host aliases");
        Ok(Some(pod))
    }
}

pub fn is_watched(pod: &Pod) -> bool {
    pod.labels().contains_key(WATCHING_LABEL)
}

/// Replace the host aliases of the pod; an empty list unsets them
pub fn with_host_aliases(mut pod: Pod, aliases: Vec<HostAlias>) -> Pod {
    pod.spec.get_or_insert_with(Default::default).host_aliases =
        (!aliases.is_empty()).then_some(aliases);
    pod
}

/// One alias per ClusterIP service, resolving its fully qualified and shortened names
pub fn host_aliases(services: &[Service], cluster_domain: &str) -> Vec<HostAlias> {
    services
        .iter()
        .filter_map(|service| {
            let spec = service.spec.as_ref()?;
            // the API server defaults an unset type to ClusterIP
            if spec.type_.as_deref().unwrap_or("ClusterIP") != "ClusterIP" {
                return None;
            }
            let ip = match spec.cluster_ip.as_deref() {
                None | Some("") | Some("None") => return None,
                Some(ip) => ip,
            };

            let name = service.name_any();
            let namespace = service.namespace().unwrap_or_else(|| "default".into());
            Some(HostAlias {
                ip: ip.to_owned(),
                hostnames: Some(vec![
                    format!("{name}.{namespace}.svc.{cluster_domain}"),
                    format!("{name}.{namespace}.svc"),
                    format!("{name}.{namespace}"),
                ]),
            })
        })
        .collect()
}
