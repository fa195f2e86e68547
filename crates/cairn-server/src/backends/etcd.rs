//! Etcd Directory Backend
//!
//! Each configured service gets one key per member:
//! `/cairn/v1/namespaces/{namespace}/services/{service}/members/{member_id}`.
//! Records are attached to a lease whose TTL is the service check TTL, so a
//! member that stops refreshing disappears on its own. The record also carries
//! an `updated_at` timestamp, rewritten on every liveness refresh, which
//! decides whether a listed member counts as healthy.

use anyhow::anyhow;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use cairn_core::{
    BackendError, BackendFactory, Capabilities, DiscoveredNode, DiscoveryBackend, MemberEntry,
    NodeAddress, Settings, SharedBackend,
};
use chrono::{DateTime, Utc};
use etcd_client::{Client, GetOptions, PutOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

const KEY_ROOT: &str = "/cairn/v1/namespaces";

/// Member record stored as the JSON value of each key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub address: NodeAddress,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl MemberRecord {
    fn from_entry(entry: &MemberEntry) -> Self {
        Self {
            address: entry.address.clone(),
            metadata: entry.metadata.clone(),
            updated_at: Utc::now(),
        }
    }

    /// Whether the record was refreshed within `ttl` of `now`
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now.signed_duration_since(self.updated_at) <= ttl,
            Err(_) => true,
        }
    }
}

/// Key layout for one namespace
#[derive(Debug, Clone)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Prefix holding every member of `service`
    pub fn service_prefix(&self, service: &str) -> String {
        format!("{}/{}/services/{}/members/", KEY_ROOT, self.namespace, service)
    }

    pub fn member_key(&self, service: &str, member_id: &str) -> String {
        format!("{}{}", self.service_prefix(service), member_id)
    }
}

fn unavailable(e: etcd_client::Error) -> BackendError {
    BackendError::Unavailable(e.to_string())
}

/// Lease TTL in whole seconds, at least one
fn lease_ttl_secs(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

/// Client handle onto an etcd cluster
pub struct EtcdBackend {
    client: Client,
    keys: KeySpace,
    service_names: Vec<String>,
    ttl: Duration,
    /// Lease holding this member's keys, once registered
    lease_id: Mutex<Option<i64>>,
}

impl EtcdBackend {
    pub fn new(client: Client, settings: &Settings) -> Self {
        Self {
            client,
            keys: KeySpace::new(settings.namespace()),
            service_names: settings.service_names().to_vec(),
            ttl: settings.service_check_ttl(),
            lease_id: Mutex::new(None),
        }
    }

    /// Write the member record for every service under `lease_id`
    async fn put_records(&self, entry: &MemberEntry, lease_id: i64) -> Result<(), BackendError> {
        let value = serde_json::to_string(&MemberRecord::from_entry(entry))
            .map_err(|e| BackendError::Other(e.into()))?;
        let mut client = self.client.clone();
        let member_id = entry.id();

        for service in &self.service_names {
            let key = self.keys.member_key(service, &member_id);
            client
                .put(key.clone(), value.clone(), Some(PutOptions::new().with_lease(lease_id)))
                .await
                .map_err(unavailable)?;
            trace!(key = %key, lease_id = lease_id, "Member record written");
        }
        Ok(())
    }

    /// Grant a fresh lease and write all records under it
    async fn grant_and_put(&self, entry: &MemberEntry) -> Result<i64, BackendError> {
        let mut client = self.client.clone();
        let lease = client
            .lease_grant(lease_ttl_secs(self.ttl), None)
            .await
            .map_err(unavailable)?;
        let lease_id = lease.id();
        debug!(lease_id = lease_id, ttl = lease.ttl(), "Lease granted");

        self.put_records(entry, lease_id).await?;
        Ok(lease_id)
    }

    /// Send one keep-alive for `lease_id`; `false` if etcd no longer knows it
    async fn keep_alive_once(&self, lease_id: i64) -> Result<bool, BackendError> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await.map_err(unavailable)?;
        keeper.keep_alive().await.map_err(unavailable)?;

        match stream.message().await.map_err(unavailable)? {
            Some(resp) => {
                trace!(lease_id = lease_id, ttl = resp.ttl(), "Keep-alive OK");
                Ok(resp.ttl() > 0)
            }
            None => Err(BackendError::Unavailable(
                "keep-alive stream closed".to_string(),
            )),
        }
    }
}

#[async_trait]
impl DiscoveryBackend for EtcdBackend {
    fn name(&self) -> &str {
        "etcd"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::full()
    }

    fn service_names(&self) -> &[String] {
        &self.service_names
    }

    async fn query_service(
        &self,
        service_name: &str,
        only_alive: bool,
    ) -> Result<Vec<DiscoveredNode>, BackendError> {
        let prefix = self.keys.service_prefix(service_name);
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;

        let now = Utc::now();
        let mut nodes = Vec::new();
        for kv in resp.kvs() {
            let value = match kv.value_str() {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "Non-UTF-8 member record");
                    continue;
                }
            };
            match serde_json::from_str::<MemberRecord>(value) {
                Ok(record) => {
                    let healthy = record.is_fresh(now, self.ttl);
                    if healthy || !only_alive {
                        nodes.push(DiscoveredNode::new(record.address, healthy, service_name));
                    }
                }
                Err(e) => {
                    warn!(error = %e, key = ?kv.key_str().ok(), "Invalid member record JSON");
                }
            }
        }
        Ok(nodes)
    }

    async fn register(&self, entry: &MemberEntry) -> Result<(), BackendError> {
        let mut lease = self.lease_id.lock().await;
        let lease_id = self.grant_and_put(entry).await?;

        // a previous lease from an earlier registration is superseded
        if let Some(old) = lease.replace(lease_id) {
            let mut client = self.client.clone();
            if let Err(e) = client.lease_revoke(old).await {
                debug!(lease_id = old, error = %e, "Failed to revoke superseded lease");
            }
        }
        Ok(())
    }

    async fn deregister(&self, entry: &MemberEntry) -> Result<(), BackendError> {
        let mut lease = self.lease_id.lock().await;
        let mut client = self.client.clone();
        let member_id = entry.id();

        for service in &self.service_names {
            client
                .delete(self.keys.member_key(service, &member_id), None)
                .await
                .map_err(unavailable)?;
        }

        if let Some(lease_id) = lease.take() {
            if let Err(e) = client.lease_revoke(lease_id).await {
                warn!(lease_id = lease_id, error = %e, "Failed to revoke lease");
            }
        }
        Ok(())
    }

    async fn refresh_liveness(&self, entry: &MemberEntry) -> Result<(), BackendError> {
        let mut lease = self.lease_id.lock().await;

        let alive = match *lease {
            Some(lease_id) => self.keep_alive_once(lease_id).await?,
            None => false,
        };

        match (*lease, alive) {
            (Some(lease_id), true) => self.put_records(entry, lease_id).await,
            _ => {
                // lease expired or this client never registered: upsert
                debug!(member_id = %entry.id(), "Lease missing, re-registering");
                let lease_id = self.grant_and_put(entry).await?;
                *lease = Some(lease_id);
                Ok(())
            }
        }
    }
}

/// Connects [`EtcdBackend`] clients with exponential backoff
pub struct EtcdFactory {
    settings: Arc<Settings>,
    backoff: ExponentialBackoff,
}

impl EtcdFactory {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            backoff: ExponentialBackoff {
                initial_interval: Duration::from_secs(1),
                max_interval: Duration::from_secs(10),
                max_elapsed_time: Some(Duration::from_secs(60)),
                multiplier: 2.0,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl BackendFactory for EtcdFactory {
    async fn create(&self) -> Result<SharedBackend, BackendError> {
        let endpoints = self.settings.endpoints().to_vec();

        let client = retry(self.backoff.clone(), || async {
            match Client::connect(&endpoints, None).await {
                Ok(client) => {
                    debug!(endpoints = ?endpoints, "Connected to etcd");
                    Ok(client)
                }
                Err(e) => {
                    warn!(error = %e, "etcd connection failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await
        .map_err(|e| BackendError::Other(anyhow!("failed to connect to etcd after retries: {e}")))?;

        Ok(Arc::new(EtcdBackend::new(client, &self.settings)))
    }
}
