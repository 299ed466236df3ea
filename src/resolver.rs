//! Resolver: bridges a watcher's snapshots to a connection-state sink.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BuildError, SinkClosed};
use crate::membership::{Connector, MembershipApi};
use crate::snapshot::Snapshot;
use crate::target::Target;
use crate::watcher::{Watcher, WatcherConfig};

/// Consumer of address-set updates, typically an RPC client's balancer.
#[async_trait]
pub trait StateSink: Send + 'static {
    /// Replaces the current address set with `snapshot`.
    ///
    /// Returning [`SinkClosed`] stops the resolver's forwarding task.
    async fn update(&mut self, snapshot: Snapshot) -> Result<(), SinkClosed>;
}

/// Builds resolvers for targets of one scheme.
#[async_trait]
pub trait ResolverBuilder: Send + Sync {
    /// Starts resolving `target`, pushing every snapshot into `sink`.
    async fn build(&self, target: Target, sink: Box<dyn StateSink>)
    -> Result<Resolver, BuildError>;
}

/// A running resolver for one target.
///
/// Owns exactly one [`Watcher`] and one forwarding task. Every snapshot the
/// watcher produces is handed to the sink once, in order. Resolution is push
/// driven; [`Resolver::resolve_now`] does nothing.
pub struct Resolver {
    target: Target,
    cancel: CancellationToken,
    watcher: Option<Watcher>,
    forwarder: Option<JoinHandle<()>>,
}

impl Resolver {
    /// Starts a watcher for `target` and forwards its snapshots into `sink`.
    #[must_use]
    pub fn start(
        api: Arc<dyn MembershipApi>,
        target: Target,
        sink: Box<dyn StateSink>,
        config: WatcherConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (watcher, rx) = Watcher::spawn(api, target.clone(), config, cancel.child_token());
        let forwarder = tokio::spawn(forward(rx, sink, cancel.clone(), target.clone()));

        Self {
            target,
            cancel,
            watcher: Some(watcher),
            forwarder: Some(forwarder),
        }
    }

    /// The target being resolved.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Requests immediate re-resolution. Membership is push driven, so this is a no-op.
    pub fn resolve_now(&self) {
        tracing::trace!("ignoring resolve_now for {}", self.target);
    }

    /// Stops the watcher and waits for both background tasks to exit.
    ///
    /// No sink updates happen after this returns.
    pub async fn close(mut self) {
        self.cancel.cancel();

        if let Some(watcher) = self.watcher.take() {
            watcher.close().await;
        }

        if let Some(forwarder) = self.forwarder.take() {
            if let Err(e) = forwarder.await {
                tracing::error!("resolver task for {} failed: {e}", self.target);
            }
        }

        tracing::debug!("resolver for {} closed", self.target);
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn forward(
    mut rx: mpsc::Receiver<Snapshot>,
    mut sink: Box<dyn StateSink>,
    cancel: CancellationToken,
    target: Target,
) {
    while let Some(Some(snapshot)) = cancel.run_until_cancelled(rx.recv()).await {
        tracing::debug!("updating {target} with {} members", snapshot.len());

        match cancel.run_until_cancelled(sink.update(snapshot)).await {
            Some(Ok(())) => {}
            Some(Err(SinkClosed)) => {
                tracing::warn!("connection state for {target} closed, stopping resolver");
                break;
            }

            None => break,
        }
    }
}

/// Builds membership-backed resolvers, connecting once on first use.
///
/// The connected membership API handle is shared by every resolver this
/// builder creates. A failed connection is not remembered; the next build
/// tries again.
pub struct MembershipResolverBuilder<C> {
    connector: C,
    api: OnceCell<Arc<dyn MembershipApi>>,
    config: WatcherConfig,
}

impl<C: Connector> MembershipResolverBuilder<C> {
    /// Creates a builder using `connector` and the default watcher configuration.
    #[must_use]
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            api: OnceCell::new(),
            config: WatcherConfig::default(),
        }
    }

    /// Sets the configuration for watchers started by this builder.
    #[must_use]
    pub fn watcher_config(mut self, config: WatcherConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl<C: Connector> ResolverBuilder for MembershipResolverBuilder<C> {
    async fn build(
        &self,
        target: Target,
        sink: Box<dyn StateSink>,
    ) -> Result<Resolver, BuildError> {
        let api = self
            .api
            .get_or_try_init(|| self.connector.connect())
            .await
            .inspect_err(|e| tracing::error!("cannot resolve {target}: {e}"))?;

        tracing::info!("starting resolver for {target}");
        Ok(Resolver::start(
            Arc::clone(api),
            target,
            sink,
            self.config.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ConnectError;
    use crate::test_utils::{FakeConnector, FakeMembership, RecordingSink, group, recv};

    fn target() -> Target {
        Target::new("k8s", "production", "orders", 8080)
    }

    #[tokio::test]
    async fn forwards_snapshots_in_order() {
        let api = FakeMembership::with_members(vec![group(&["10.0.0.1"], &[8080])]);
        let events = api.push_stream();
        let (sink, mut updates) = RecordingSink::new();

        let resolver = Resolver::start(api, target(), Box::new(sink), WatcherConfig::default());

        events
            .unbounded_send(Ok(vec![group(&["10.0.0.1", "10.0.0.2"], &[8080])].into()))
            .unwrap();
        events
            .unbounded_send(Ok(vec![group(&["10.0.0.2"], &[8080])].into()))
            .unwrap();

        assert_eq!(recv(&mut updates).await.unwrap().len(), 1);
        assert_eq!(recv(&mut updates).await.unwrap().len(), 2);

        let last = recv(&mut updates).await.unwrap();
        assert_eq!(last.len(), 1);
        assert!(last.contains("10.0.0.2:8080".parse().unwrap()));

        resolver.close().await;
    }

    #[tokio::test]
    async fn no_updates_after_close() {
        let api = FakeMembership::with_members(vec![group(&["10.0.0.1"], &[8080])]);
        let events = api.push_stream();
        let (sink, mut updates) = RecordingSink::new();

        let resolver = Resolver::start(api, target(), Box::new(sink), WatcherConfig::default());
        recv(&mut updates).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), resolver.close())
            .await
            .unwrap();

        // The stream is still open, but nothing may reach the sink any more.
        let _ = events.unbounded_send(Ok(vec![group(&["10.0.0.9"], &[8080])].into()));

        assert!(updates.recv().await.is_none());
    }

    #[tokio::test]
    async fn stops_when_sink_closes() {
        let api = FakeMembership::with_members(vec![group(&["10.0.0.1"], &[8080])]);
        let events = api.push_stream();
        let (sink, updates) = RecordingSink::new();
        drop(updates);

        let resolver = Resolver::start(api, target(), Box::new(sink), WatcherConfig::default());
        let _ = events.unbounded_send(Ok(vec![group(&["10.0.0.2"], &[8080])].into()));

        tokio::time::timeout(Duration::from_secs(5), resolver.close())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resolve_now_is_noop() {
        let api = FakeMembership::with_members(Vec::new());
        let _events = api.push_stream();
        let (sink, mut updates) = RecordingSink::new();

        let resolver = Resolver::start(api, target(), Box::new(sink), WatcherConfig::default());
        assert!(recv(&mut updates).await.unwrap().is_empty());

        resolver.resolve_now();
        assert_eq!(resolver.target(), &target());

        resolver.close().await;
        assert!(updates.recv().await.is_none());
    }

    #[tokio::test]
    async fn build_fails_when_connect_fails() {
        let builder = MembershipResolverBuilder::new(FakeConnector::failing());
        let (sink, _updates) = RecordingSink::new();

        let result = builder.build(target(), Box::new(sink)).await;

        assert!(matches!(
            result,
            Err(BuildError::Connect(ConnectError::Credentials(_)))
        ));
    }

    #[tokio::test]
    async fn build_shares_one_connection() {
        let api = FakeMembership::with_members(vec![group(&["10.0.0.1"], &[8080])]);
        let _first = api.push_stream();
        let _second = api.push_stream();

        let connector = Arc::new(FakeConnector::new(api));
        let builder = MembershipResolverBuilder::new(Arc::clone(&connector));

        let (sink_a, mut updates_a) = RecordingSink::new();
        let (sink_b, mut updates_b) = RecordingSink::new();

        let a = builder.build(target(), Box::new(sink_a)).await.unwrap();
        let b = builder
            .build(Target::new("k8s", "production", "billing", 9090), Box::new(sink_b))
            .await
            .unwrap();

        assert!(recv(&mut updates_a).await.unwrap().contains("10.0.0.1:8080".parse().unwrap()));
        assert!(recv(&mut updates_b).await.unwrap().contains("10.0.0.1:9090".parse().unwrap()));
        assert_eq!(connector.connects(), 1);

        a.close().await;
        b.close().await;
    }
}
