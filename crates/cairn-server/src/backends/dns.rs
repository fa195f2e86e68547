//! DNS Discovery Source
//!
//! Resolves Kubernetes headless-service names. Each service maps to
//! `{service}.{namespace}.svc.{cluster_domain}`; every resolved IP becomes a
//! node on the configured port. Read-only: the records belong to the cluster,
//! so register / deregister / refresh are not supported.

use async_trait::async_trait;
use cairn_core::{
    BackendError, BackendFactory, Capabilities, DiscoveredNode, DiscoveryBackend, NodeAddress,
    Settings, SharedBackend,
};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

pub struct DnsBackend {
    namespace: String,
    service_names: Vec<String>,
    cluster_domain: String,
    port: u16,
}

impl DnsBackend {
    pub fn new(settings: &Settings, cluster_domain: impl Into<String>, port: u16) -> Self {
        Self {
            namespace: settings.namespace().to_string(),
            service_names: settings.service_names().to_vec(),
            cluster_domain: cluster_domain.into(),
            port,
        }
    }

    /// Fully qualified name of a headless service
    pub fn service_dns(&self, service: &str) -> String {
        format!("{}.{}.svc.{}", service, self.namespace, self.cluster_domain)
    }
}

#[async_trait]
impl DiscoveryBackend for DnsBackend {
    fn name(&self) -> &str {
        "dns"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::read_only()
    }

    fn service_names(&self) -> &[String] {
        &self.service_names
    }

    async fn query_service(
        &self,
        service_name: &str,
        _only_alive: bool,
    ) -> Result<Vec<DiscoveredNode>, BackendError> {
        let dns = self.service_dns(service_name);
        let resolved = tokio::net::lookup_host(format!("{}:{}", dns, self.port))
            .await
            .map_err(|e| BackendError::Unavailable(format!("{dns}: {e}")))?;

        // a pod may be returned once per address family record
        let ips: BTreeSet<IpAddr> = resolved.map(|addr| addr.ip()).collect();
        debug!(service_dns = %dns, resolved = ips.len(), "Resolved headless service");

        // DNS only publishes ready endpoints, so everything found is healthy
        Ok(ips
            .into_iter()
            .map(|ip| DiscoveredNode::new(NodeAddress::new(ip.to_string(), self.port), true, service_name))
            .collect())
    }
}

pub struct DnsFactory {
    settings: Arc<Settings>,
    cluster_domain: String,
    port: u16,
}

impl DnsFactory {
    pub fn new(settings: Arc<Settings>, cluster_domain: impl Into<String>, port: u16) -> Self {
        Self {
            settings,
            cluster_domain: cluster_domain.into(),
            port,
        }
    }
}

#[async_trait]
impl BackendFactory for DnsFactory {
    async fn create(&self) -> Result<SharedBackend, BackendError> {
        Ok(Arc::new(DnsBackend::new(
            &self.settings,
            self.cluster_domain.clone(),
            self.port,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::Operation;

    fn backend() -> DnsBackend {
        let settings = Settings::builder()
            .namespace("infra")
            .service_names(["web", "api"])
            .build()
            .unwrap();
        DnsBackend::new(&settings, DEFAULT_CLUSTER_DOMAIN, 2552)
    }

    #[test]
    fn test_service_dns_name() {
        assert_eq!(backend().service_dns("web"), "web.infra.svc.cluster.local");
    }

    #[test]
    fn test_dns_is_read_only() {
        assert_eq!(backend().capabilities().first_missing(), Some(Operation::Register));
    }

    #[tokio::test]
    async fn test_unresolvable_service_is_unavailable() {
        let settings = Settings::builder()
            .namespace("does-not-exist")
            .build()
            .unwrap();
        let backend = DnsBackend::new(&settings, "invalid", 2552);

        let result = backend.query_service("nothing", true).await;
        assert!(matches!(result, Err(BackendError::Unavailable(_))));
    }
}
