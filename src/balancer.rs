//! Balancer wiring: decides per address whether to resolve dynamically.
//!
//! An address of the form `service.environment:port` whose environment is in
//! the configured allow-list is dialed as `k8s:///service.environment:port`
//! through a resolver feeding a tonic balance channel. Any other address is
//! dialed directly.
//!
//! # Example
//!
//! ```ignore
//! use tonic_k8s_resolver::{BalancerConfig, ClientFactory};
//!
//! let factory = ClientFactory::with_kubernetes(BalancerConfig::from_env());
//! let client = factory.dial("orders.production:8080").await?;
//!
//! // Use with your generated gRPC client
//! let orders = OrdersClient::new(client.channel());
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;
use tonic::transport::channel::Change;
use tonic::transport::{Channel, Endpoint};

use crate::error::{DialError, SinkClosed};
use crate::k8s::KubeConnector;
use crate::registry::Registry;
use crate::resolver::{MembershipResolverBuilder, Resolver, ResolverBuilder, StateSink};
use crate::snapshot::Snapshot;
use crate::target::Target;
use crate::watcher::WatcherConfig;

/// Default resolver scheme.
pub const DEFAULT_SCHEME: &str = "k8s";

/// What to do when dynamic resolution applies but the resolver cannot be built.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectFailurePolicy {
    /// Fail the dial with the build error.
    #[default]
    Fail,
    /// Log the error and dial the address directly.
    DialDirect,
}

/// Configuration for [`ClientFactory`].
#[derive(Clone, Debug)]
pub struct BalancerConfig {
    /// Resolver scheme used in rewritten dial addresses.
    pub scheme: String,

    /// Environments whose services are resolved dynamically.
    pub environments: Vec<String>,

    /// Behavior when the resolver cannot be built.
    pub on_connect_failure: ConnectFailurePolicy,

    /// Capacity of the balance channel's change queue.
    pub buffer_size: usize,

    /// Connect timeout applied to every endpoint.
    pub connect_timeout: Option<Duration>,

    /// Configuration for the resolvers' watchers.
    pub watcher: WatcherConfig,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            environments: vec!["daily".to_string(), "production".to_string()],
            on_connect_failure: ConnectFailurePolicy::default(),
            buffer_size: 1024,
            connect_timeout: None,
            watcher: WatcherConfig::default(),
        }
    }
}

impl BalancerConfig {
    /// Loads configuration from the environment, falling back to defaults.
    ///
    /// - `K8S_RESOLVER_SCHEME`: resolver scheme (default: `k8s`)
    /// - `K8S_RESOLVER_ENVIRONMENTS`: comma-separated environments (default: `daily,production`)
    /// - `K8S_RESOLVER_ON_CONNECT_FAILURE`: `fail` or `direct` (default: `fail`)
    /// - `K8S_RESOLVER_BUFFER_SIZE`: balance channel capacity (default: 1024)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(scheme) = lookup("K8S_RESOLVER_SCHEME").filter(|s| !s.is_empty()) {
            config.scheme = scheme;
        }

        if let Some(environments) = lookup("K8S_RESOLVER_ENVIRONMENTS") {
            config.environments = environments
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect();
        }

        match lookup("K8S_RESOLVER_ON_CONNECT_FAILURE").as_deref() {
            Some("fail") | None => {}
            Some("direct") => config.on_connect_failure = ConnectFailurePolicy::DialDirect,
            Some(other) => tracing::warn!("ignoring unknown connect failure policy `{other}`"),
        }

        if let Some(size) = lookup("K8S_RESOLVER_BUFFER_SIZE").and_then(|s| s.parse().ok()) {
            config.buffer_size = size;
        }

        config
    }

    /// Sets the resolver scheme.
    #[must_use]
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Sets the environments resolved dynamically.
    #[must_use]
    pub fn environments<I, S>(mut self, environments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environments = environments.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the connect failure policy.
    #[must_use]
    pub fn on_connect_failure(mut self, policy: ConnectFailurePolicy) -> Self {
        self.on_connect_failure = policy;
        self
    }

    /// Sets the endpoint connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the watcher configuration.
    #[must_use]
    pub fn watcher(mut self, config: WatcherConfig) -> Self {
        self.watcher = config;
        self
    }

    /// Decides how `address` is dialed.
    #[must_use]
    pub fn plan(&self, address: &str) -> DialPlan {
        let target = match Target::from_address(&self.scheme, address) {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!("dialing {address} directly: {e}");
                return DialPlan::Direct {
                    address: address.to_string(),
                };
            }
        };

        if !self.environments.iter().any(|env| env == target.namespace()) {
            tracing::debug!(
                "dialing {address} directly: environment `{}` is not resolved",
                target.namespace()
            );

            return DialPlan::Direct {
                address: address.to_string(),
            };
        }

        DialPlan::Resolved {
            uri: format!("{}:///{address}", self.scheme),
            target,
        }
    }
}

/// How an address is dialed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DialPlan {
    /// Dial the address as-is, without a resolver.
    Direct {
        /// The address as given.
        address: String,
    },
    /// Dial through a resolver and round-robin style balancing.
    Resolved {
        /// The rewritten `scheme:///address` dial URI.
        uri: String,
        /// The target the resolver tracks.
        target: Target,
    },
}

/// Creates client channels, resolving addresses through its own [`Registry`].
pub struct ClientFactory {
    registry: Arc<Registry>,
    config: BalancerConfig,
}

impl ClientFactory {
    /// Creates a factory over an existing registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>, config: BalancerConfig) -> Self {
        Self { registry, config }
    }

    /// Creates a factory whose scheme resolves through the Kubernetes API.
    #[must_use]
    pub fn with_kubernetes(config: BalancerConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let watcher = config.watcher.clone();

        registry.register_if_absent(&config.scheme, || {
            Arc::new(MembershipResolverBuilder::new(KubeConnector::new()).watcher_config(watcher))
                as Arc<dyn ResolverBuilder>
        });

        Self::new(registry, config)
    }

    /// The registry resolvers are built from.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The factory configuration.
    #[must_use]
    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Creates a client channel for `address`.
    ///
    /// Connections are established lazily on first use.
    ///
    /// # Errors
    ///
    /// Returns [`DialError::Endpoint`] if the address is not a valid endpoint,
    /// or [`DialError::Resolver`] if the resolver cannot be built and the
    /// policy is [`ConnectFailurePolicy::Fail`].
    pub async fn dial(&self, address: &str) -> Result<RpcClient, DialError> {
        let (uri, target) = match self.config.plan(address) {
            DialPlan::Direct { address } => return self.dial_direct(&address),
            DialPlan::Resolved { uri, target } => (uri, target),
        };

        tracing::info!("using load balancer for {address}, dialing {uri}");

        let (channel, tx) = Channel::balance_channel::<SocketAddr>(self.config.buffer_size);
        let timeout = self.config.connect_timeout;
        let sink = BalanceSink::new(tx, move |addr| endpoint(addr, timeout));

        match self.registry.build(&uri, Box::new(sink)).await {
            Ok(resolver) => Ok(RpcClient {
                channel,
                resolver: Some(resolver),
            }),

            Err(e) => match self.config.on_connect_failure {
                ConnectFailurePolicy::Fail => Err(e.into()),
                ConnectFailurePolicy::DialDirect => {
                    tracing::warn!("cannot resolve {target} ({e}), dialing {address} directly");
                    self.dial_direct(address)
                }
            },
        }
    }

    fn dial_direct(&self, address: &str) -> Result<RpcClient, DialError> {
        let mut endpoint = Endpoint::from_shared(format!("http://{address}"))?;
        if let Some(timeout) = self.config.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }

        Ok(RpcClient {
            channel: endpoint.connect_lazy(),
            resolver: None,
        })
    }
}

fn endpoint(addr: SocketAddr, timeout: Option<Duration>) -> Result<Endpoint, tonic::transport::Error> {
    let endpoint = Endpoint::from_shared(format!("http://{addr}"))?;
    Ok(match timeout {
        Some(timeout) => endpoint.connect_timeout(timeout),
        None => endpoint,
    })
}

/// A dialed client channel and the resolver feeding it, if any.
pub struct RpcClient {
    channel: Channel,
    resolver: Option<Resolver>,
}

impl RpcClient {
    /// A handle to the channel, for use with generated gRPC clients.
    #[must_use]
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Whether the channel is fed by a resolver.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolver.is_some()
    }

    /// The resolver feeding the channel, if any.
    #[must_use]
    pub fn resolver(&self) -> Option<&Resolver> {
        self.resolver.as_ref()
    }

    /// Closes the resolver, if any, and waits for it to stop.
    pub async fn close(self) {
        if let Some(resolver) = self.resolver {
            resolver.close().await;
        }
    }
}

/// Connection-state sink feeding a tonic balance channel.
///
/// Each snapshot is diffed against the addresses already announced, and the
/// difference is sent as `Change::Remove` and `Change::Insert` events.
pub struct BalanceSink<F> {
    tx: Sender<Change<SocketAddr, Endpoint>>,
    known: HashSet<SocketAddr>,
    build: F,
}

impl<F> BalanceSink<F>
where
    F: Fn(SocketAddr) -> Result<Endpoint, tonic::transport::Error> + Send + 'static,
{
    /// Creates a sink sending changes to `tx` (from `Channel::balance_channel()`),
    /// building each new endpoint with `build`.
    #[must_use]
    pub fn new(tx: Sender<Change<SocketAddr, Endpoint>>, build: F) -> Self {
        Self {
            tx,
            known: HashSet::new(),
            build,
        }
    }
}

#[async_trait]
impl<F> StateSink for BalanceSink<F>
where
    F: Fn(SocketAddr) -> Result<Endpoint, tonic::transport::Error> + Send + 'static,
{
    async fn update(&mut self, snapshot: Snapshot) -> Result<(), SinkClosed> {
        for action in diff(&mut self.known, &snapshot) {
            let change = match action {
                EndpointAction::Insert(addr) => match (self.build)(addr) {
                    Ok(endpoint) => Change::Insert(addr, endpoint),
                    Err(e) => {
                        tracing::warn!("skipping endpoint {addr}: {e}");
                        self.known.remove(&addr);
                        continue;
                    }
                },

                EndpointAction::Remove(addr) => Change::Remove(addr),
            };

            self.tx.send(change).await.map_err(|_| SinkClosed)?;
        }

        tracing::debug!("balance channel has {} endpoints", self.known.len());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EndpointAction {
    Insert(SocketAddr),
    Remove(SocketAddr),
}

/// Computes the actions turning `known` into the snapshot's address set.
///
/// Removals are emitted before insertions.
fn diff(known: &mut HashSet<SocketAddr>, snapshot: &Snapshot) -> Vec<EndpointAction> {
    let current: HashSet<SocketAddr> = snapshot.addresses().collect();
    let mut actions = Vec::new();

    known.retain(|addr| {
        let keep = current.contains(addr);
        if !keep {
            tracing::debug!("removing endpoint: {addr}");
            actions.push(EndpointAction::Remove(*addr));
        }

        keep
    });

    for addr in snapshot.addresses() {
        if known.insert(addr) {
            tracing::debug!("adding endpoint: {addr}");
            actions.push(EndpointAction::Insert(addr));
        }
    }

    actions
}
