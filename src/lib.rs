#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Kubernetes service-discovery resolver for [Tonic](https://docs.rs/tonic) gRPC clients.
//!
//! Plain `ClusterIP` services don't load balance gRPC effectively: HTTP/2
//! multiplexes every request over one long-lived connection. This crate tracks
//! the live members of a Kubernetes service and republishes the full member set
//! to a tonic balance channel whenever it changes.
//!
//! # Features
//!
//! - **Push-based discovery**: list once, then watch the service's `Endpoints`
//! - **Resilient watches**: broken streams are re-opened with exponential backoff
//! - **Ordered delivery**: every snapshot reaches the channel, in order, through a bounded queue
//! - **Per-address wiring**: only `service.environment:port` addresses in known environments
//!   are resolved; everything else is dialed directly
//!
//! # Usage
//!
//! ```ignore
//! use std::time::Duration;
//! use tonic_k8s_resolver::{BalancerConfig, ClientFactory};
//!
//! let config = BalancerConfig::default()
//!     .environments(["staging", "production"])
//!     .connect_timeout(Duration::from_secs(5));
//!
//! let factory = ClientFactory::with_kubernetes(config);
//! let client = factory.dial("orders.production:8080").await?;
//!
//! // Use with your generated gRPC client
//! // let orders = OrdersClient::new(client.channel());
//!
//! client.close().await;
//! ```
//!
//! Lower-level pieces are exposed for custom wiring: a [`Registry`] of
//! [`ResolverBuilder`]s keyed by scheme, the [`Resolver`] that forwards
//! [`Snapshot`]s into any [`StateSink`], and the [`Watcher`] itself.

mod backoff;
mod balancer;
mod error;
mod k8s;
mod membership;
mod registry;
mod resolver;
mod snapshot;
mod target;
mod watcher;

#[cfg(test)]
mod test_utils;

pub use balancer::{
    BalanceSink, BalancerConfig, ClientFactory, ConnectFailurePolicy, DEFAULT_SCHEME, DialPlan,
    RpcClient,
};
pub use error::{
    BuildError, ConnectError, DialError, QueryError, RegistryError, SinkClosed, TargetError,
};
pub use k8s::{KubeConnector, KubeMembership};
pub use membership::{Connector, MemberGroup, MemberList, MemberStream, MembershipApi};
pub use registry::Registry;
pub use resolver::{MembershipResolverBuilder, Resolver, ResolverBuilder, StateSink};
pub use snapshot::{Member, PortPolicy, Snapshot};
pub use target::Target;
pub use watcher::{Watcher, WatcherConfig};
