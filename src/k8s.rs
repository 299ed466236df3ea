//! Kubernetes membership client using `Endpoints` list and watch calls.
//!
//! # How It Works
//!
//! 1. Loads in-cluster credentials, falling back to `~/.kube/config`
//! 2. Lists members by reading the service's `Endpoints` object
//! 3. Watches that one object with a `metadata.name` field selector, starting
//!    after the version the list returned
//! 4. Decodes every watch event into the object's full member groups and version
//!
//! # Example
//!
//! ```ignore
//! use tonic_k8s_resolver::{Connector, KubeConnector};
//!
//! let api = KubeConnector::new().connect().await?;
//! let members = api.list_members("production", "orders").await?;
//! let events = api
//!     .watch_members("production", "orders", members.resource_version.as_deref())
//!     .await?;
//! ```

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, future};
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::{WatchEvent, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};

use crate::error::{ConnectError, QueryError};
use crate::membership::{Connector, MemberGroup, MemberList, MemberStream, MembershipApi};

/// Connects to the Kubernetes API server.
///
/// In-cluster service account credentials are tried first. If they are not
/// available, the kubeconfig file is read from `$HOME/.kube/config`
/// (`%USERPROFILE%\.kube\config` on Windows) or from an explicit path.
#[derive(Clone, Debug, Default)]
pub struct KubeConnector {
    kubeconfig: Option<PathBuf>,
}

impl KubeConnector {
    /// Creates a connector using the default credential discovery.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the kubeconfig file at `path` when in-cluster credentials are unavailable.
    #[must_use]
    pub fn kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    async fn config(&self) -> Result<Config, ConnectError> {
        let in_cluster = match Config::incluster() {
            Ok(config) => {
                tracing::info!("using in-cluster Kubernetes credentials");
                return Ok(config);
            }

            Err(e) => e,
        };

        tracing::warn!("in-cluster Kubernetes config unavailable ({in_cluster}), trying kubeconfig");

        let path = self
            .kubeconfig
            .clone()
            .or_else(|| {
                default_kubeconfig_path(std::env::var_os("HOME"), std::env::var_os("USERPROFILE"))
            })
            .ok_or_else(|| {
                ConnectError::Credentials(format!("{in_cluster}; no home directory for kubeconfig"))
            })?;

        let kubeconfig = Kubeconfig::read_from(&path).map_err(|e| {
            ConnectError::Credentials(format!("{in_cluster}; {}: {e}", path.display()))
        })?;

        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                ConnectError::Credentials(format!("{in_cluster}; {}: {e}", path.display()))
            })?;

        tracing::info!("using kubeconfig credentials from {}", path.display());
        Ok(config)
    }
}

#[async_trait]
impl Connector for KubeConnector {
    async fn connect(&self) -> Result<Arc<dyn MembershipApi>, ConnectError> {
        let config = self.config().await?;
        let client = Client::try_from(config).map_err(ConnectError::Client)?;
        Ok(Arc::new(KubeMembership::new(client)))
    }
}

/// Membership API backed by core/v1 `Endpoints` objects.
#[derive(Clone)]
pub struct KubeMembership {
    client: Client,
}

impl KubeMembership {
    /// Wraps an existing Kubernetes client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn endpoints(&self, namespace: &str) -> Api<Endpoints> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl MembershipApi for KubeMembership {
    async fn list_members(&self, namespace: &str, service: &str) -> Result<MemberList, QueryError> {
        let endpoints = self
            .endpoints(namespace)
            .get_opt(service)
            .await
            .map_err(query_error)?;

        let Some(endpoints) = endpoints else {
            tracing::warn!("no Endpoints object for {namespace}/{service}");
            return Ok(MemberList::default());
        };

        let list = member_list(&endpoints);
        if list.groups.iter().all(|g| g.addresses.is_empty()) {
            tracing::warn!("{namespace}/{service} has no ready addresses");
        }

        Ok(list)
    }

    async fn watch_members(
        &self,
        namespace: &str,
        service: &str,
        resource_version: Option<&str>,
    ) -> Result<MemberStream, QueryError> {
        let params = WatchParams::default().fields(&format!("metadata.name={service}"));
        let version = watch_version(resource_version);
        let events = self
            .endpoints(namespace)
            .watch(&params, version)
            .await
            .map_err(query_error)?;

        tracing::debug!("opened Endpoints watch for {namespace}/{service} at version {version:?}");

        Ok(events
            .filter_map(|event| future::ready(decode_event(event)))
            .boxed())
    }
}

/// HTTP status the API server uses for an expired resource version.
const GONE: u16 = 410;

/// Resource version to start a watch from.
///
/// An empty version asks for the most recent state. `"0"` is never used: it
/// lets the server answer from a cache that may be older than the list.
fn watch_version(resource_version: Option<&str>) -> &str {
    resource_version.unwrap_or_default()
}

/// Returns `None` for events that carry no membership information.
fn decode_event(
    event: kube::Result<WatchEvent<Endpoints>>,
) -> Option<Result<MemberList, QueryError>> {
    match event {
        Ok(WatchEvent::Added(endpoints) | WatchEvent::Modified(endpoints)) => {
            Some(Ok(member_list(&endpoints)))
        }

        Ok(WatchEvent::Deleted(endpoints)) => Some(Ok(MemberList::new(
            Vec::new(),
            endpoints.metadata.resource_version,
        ))),

        Ok(WatchEvent::Bookmark(_)) => None,
        Ok(WatchEvent::Error(status)) if status.code == GONE => {
            Some(Err(QueryError::Expired(status.message.clone())))
        }

        Ok(WatchEvent::Error(status)) => Some(Err(QueryError::Status(format!("{status:?}")))),
        Err(e) => Some(Err(query_error(e))),
    }
}

fn query_error(e: kube::Error) -> QueryError {
    match e {
        kube::Error::SerdeError(e) => QueryError::Decode(e.to_string()),
        kube::Error::Api(status) if status.code == GONE => {
            QueryError::Expired(status.message.clone())
        }

        e => QueryError::Api(e),
    }
}

fn member_list(endpoints: &Endpoints) -> MemberList {
    MemberList::new(
        endpoint_groups(endpoints),
        endpoints.metadata.resource_version.clone(),
    )
}

/// Extracts ready addresses and declared ports from each `Endpoints` subset.
fn endpoint_groups(endpoints: &Endpoints) -> Vec<MemberGroup> {
    endpoints
        .subsets
        .iter()
        .flatten()
        .map(|subset| MemberGroup {
            addresses: subset
                .addresses
                .iter()
                .flatten()
                .map(|a| a.ip.clone())
                .collect(),
            ports: subset
                .ports
                .iter()
                .flatten()
                .filter_map(|p| u16::try_from(p.port).ok())
                .collect(),
        })
        .collect()
}

fn default_kubeconfig_path(home: Option<OsString>, user_profile: Option<OsString>) -> Option<PathBuf> {
    home.filter(|h| !h.is_empty())
        .or_else(|| user_profile.filter(|h| !h.is_empty()))
        .map(|home| PathBuf::from(home).join(".kube").join("config"))
}
