//! Resolver demo: logs every member snapshot for one service.
//!
//! Runs against the current Kubernetes context (in-cluster credentials or
//! `~/.kube/config`) until interrupted.
//!
//! # Environment Variables
//!
//! - `TARGET_ADDRESS`: address to resolve (default: greeter-server.production:50051)
//! - `K8S_RESOLVER_*`: see `BalancerConfig::from_env`

use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use tonic_k8s_resolver::{
    BalancerConfig, DialPlan, KubeConnector, MembershipResolverBuilder, Registry, SinkClosed,
    Snapshot, StateSink,
};
use tracing::{Level, info, warn};

/// Sink that only logs what it receives.
struct LogSink;

#[async_trait]
impl StateSink for LogSink {
    async fn update(&mut self, snapshot: Snapshot) -> Result<(), SinkClosed> {
        info!("{} members: {snapshot}", snapshot.len());
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let address = env::var("TARGET_ADDRESS")
        .unwrap_or_else(|_| "greeter-server.production:50051".to_string());
    let config = BalancerConfig::from_env();

    let DialPlan::Resolved { uri, target } = config.plan(&address) else {
        warn!("{address} would be dialed directly; nothing to resolve");
        return Ok(());
    };

    info!("Resolving {target} via {uri}");

    let registry = Registry::new();
    registry.register(
        config.scheme.clone(),
        Arc::new(MembershipResolverBuilder::new(KubeConnector::new()).watcher_config(config.watcher)),
    )?;

    let resolver = registry.build(&uri, Box::new(LogSink)).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    resolver.close().await;

    Ok(())
}
