//! Membership watcher: one list-then-watch loop per target.
//!
//! The watcher owns a single background task. The task lists the service's
//! members, publishes that baseline (even when empty), then consumes a watch
//! stream and publishes a fresh [`Snapshot`] whenever the member set changes.
//! When the stream breaks it is re-opened with exponential backoff from the
//! last resource version seen, keeping the last good snapshot as the current
//! truth in the meantime. If that version has expired the members are listed
//! again before the watch resumes.
//!
//! Snapshots are delivered through a bounded queue. A full queue blocks the
//! task rather than dropping updates, so the consumer sees every snapshot in
//! the order it was produced.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::error::QueryError;
use crate::membership::{MemberGroup, MemberStream, MembershipApi};
use crate::snapshot::{PortPolicy, Snapshot};
use crate::target::Target;

/// Configuration for a [`Watcher`].
#[derive(Clone, Debug)]
pub struct WatcherConfig {
    /// Capacity of the snapshot queue.
    pub queue_capacity: usize,

    /// Delay before the first reconnect attempt after a stream break.
    pub initial_backoff: Duration,

    /// Upper bound for the reconnect delay.
    pub max_backoff: Duration,

    /// Consecutive failed reconnect attempts before the watcher gives up.
    /// `None` retries until closed.
    pub max_reconnects: Option<u32>,

    /// Handling of members whose declared ports differ from the target port.
    pub port_policy: PortPolicy,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            max_reconnects: None,
            port_policy: PortPolicy::default(),
        }
    }
}

impl WatcherConfig {
    /// Sets the snapshot queue capacity.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the initial and maximum reconnect delay.
    #[must_use]
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Limits consecutive failed reconnect attempts.
    #[must_use]
    pub fn max_reconnects(mut self, attempts: u32) -> Self {
        self.max_reconnects = Some(attempts);
        self
    }

    /// Sets the port validation policy.
    #[must_use]
    pub fn port_policy(mut self, policy: PortPolicy) -> Self {
        self.port_policy = policy;
        self
    }
}

/// Handle to a running membership watch.
///
/// Dropping the handle cancels the task without waiting for it.
pub struct Watcher {
    target: Target,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Watcher {
    /// Starts watching `target` and returns the receiving end of the snapshot queue.
    ///
    /// The queue closes when the watcher stops, whether it was closed,
    /// cancelled through `cancel`, or gave up on the stream.
    #[must_use]
    pub fn spawn(
        api: Arc<dyn MembershipApi>,
        target: Target,
        config: WatcherConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Snapshot>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let backoff = Backoff::new(config.initial_backoff, config.max_backoff);

        let task = WatchTask {
            api,
            target: target.clone(),
            config,
            current: Snapshot::new(),
            resource_version: None,
            expired: false,
            tx,
            cancel: cancel.clone(),
            backoff,
        };

        let watcher = Self {
            target,
            cancel,
            task: Some(tokio::spawn(task.run())),
        };

        (watcher, rx)
    }

    /// The target being watched.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Cancels the watch and waits for the task to exit.
    pub async fn close(mut self) {
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("watcher task for {} failed: {e}", self.target);
            }
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// How a watch stream stopped being consumed.
enum StreamEnd {
    /// The stream closed or failed; `delivered` is set if it produced any event.
    Broken { delivered: bool },
    /// The watcher was cancelled or the consumer went away.
    Stopped,
}

struct WatchTask {
    api: Arc<dyn MembershipApi>,
    target: Target,
    config: WatcherConfig,
    current: Snapshot,
    /// Last resource version seen; watches resume after it.
    resource_version: Option<String>,
    /// Set when the server no longer keeps `resource_version`.
    expired: bool,
    tx: mpsc::Sender<Snapshot>,
    cancel: CancellationToken,
    backoff: Backoff,
}

impl WatchTask {
    async fn run(mut self) {
        if !self.init().await {
            return;
        }

        tracing::info!("watching members of {}", self.target);

        let mut stream = match self.open().await {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                tracing::error!("failed to watch members of {}: {e}", self.target);
                return;
            }

            None => return,
        };

        loop {
            match self.consume(&mut stream).await {
                StreamEnd::Stopped => break,
                StreamEnd::Broken { delivered } => {
                    if delivered {
                        self.backoff.reset();
                    }
                }
            }

            drop(stream);

            stream = match self.reopen().await {
                Some(stream) => stream,
                None => break,
            };
        }

        tracing::debug!("watcher for {} stopped", self.target);
    }

    /// Lists the initial members and publishes them as the baseline.
    async fn init(&mut self) -> bool {
        tracing::debug!("listing members of {}", self.target);

        let listed = self
            .cancel
            .run_until_cancelled(
                self.api
                    .list_members(self.target.namespace(), self.target.service()),
            )
            .await;

        self.current = match listed {
            Some(Ok(list)) => {
                self.resource_version = list.resource_version;
                self.decode(&list.groups)
            }

            Some(Err(e)) => {
                tracing::error!("failed to list members of {}: {e}", self.target);
                Snapshot::new()
            }

            None => return false,
        };

        if self.current.is_empty() {
            tracing::warn!("{} has no members", self.target);
        } else {
            tracing::info!("initial members of {}: {}", self.target, self.current);
        }

        self.publish().await
    }

    async fn open(&self) -> Option<Result<MemberStream, QueryError>> {
        self.cancel
            .run_until_cancelled(
                self.api.watch_members(
                    self.target.namespace(),
                    self.target.service(),
                    self.resource_version.as_deref(),
                ),
            )
            .await
    }

    /// Lists the members again after the watch version expired.
    ///
    /// Returns `None` once the watcher stops and `Some(false)` if the list failed.
    async fn relist(&mut self) -> Option<bool> {
        let listed = self
            .cancel
            .run_until_cancelled(
                self.api
                    .list_members(self.target.namespace(), self.target.service()),
            )
            .await?;

        match listed {
            Ok(list) => {
                self.expired = false;
                self.resource_version = list.resource_version;

                self.apply(&list.groups).await.then_some(true)
            }

            Err(e) => {
                tracing::warn!("failed to re-list members of {}: {e}", self.target);
                Some(false)
            }
        }
    }

    /// Re-opens the watch after a break, backing off between attempts.
    async fn reopen(&mut self) -> Option<MemberStream> {
        loop {
            if let Some(max) = self.config.max_reconnects {
                if self.backoff.attempts() >= max {
                    tracing::error!(
                        "giving up on {} after {max} reconnect attempts",
                        self.target
                    );

                    return None;
                }
            }

            let delay = self.backoff.next_delay();
            tracing::info!("re-opening watch for {} in {delay:?}", self.target);

            self.cancel
                .run_until_cancelled(tokio::time::sleep(delay))
                .await?;

            if self.expired && !self.relist().await? {
                continue;
            }

            match self.open().await? {
                Ok(stream) => return Some(stream),
                Err(e) => tracing::warn!("failed to re-open watch for {}: {e}", self.target),
            }
        }
    }

    async fn consume(&mut self, stream: &mut MemberStream) -> StreamEnd {
        let mut delivered = false;

        loop {
            let Some(next) = self.cancel.run_until_cancelled(stream.next()).await else {
                return StreamEnd::Stopped;
            };

            let list = match next {
                Some(Ok(list)) => list,
                Some(Err(QueryError::Decode(e))) => {
                    tracing::warn!("skipping malformed event for {}: {e}", self.target);
                    continue;
                }

                Some(Err(QueryError::Expired(e))) => {
                    tracing::warn!("watch version for {} expired ({e}), re-listing", self.target);
                    self.resource_version = None;
                    self.expired = true;
                    return StreamEnd::Broken { delivered };
                }

                Some(Err(e)) => {
                    tracing::warn!("watch stream for {} failed: {e}", self.target);
                    return StreamEnd::Broken { delivered };
                }

                None => {
                    tracing::info!("watch stream for {} closed", self.target);
                    return StreamEnd::Broken { delivered };
                }
            };

            delivered = true;

            if list.resource_version.is_some() {
                self.resource_version = list.resource_version;
            }

            if !self.apply(&list.groups).await {
                return StreamEnd::Stopped;
            }
        }
    }

    /// Publishes non-empty, changed members. `false` once the watcher stopped.
    async fn apply(&mut self, groups: &[MemberGroup]) -> bool {
        let snapshot = self.decode(groups);
        if snapshot.is_empty() {
            tracing::warn!(
                "{} reported no members, keeping {} known",
                self.target,
                self.current.len()
            );

            return true;
        }

        if snapshot.same_members(&self.current) {
            tracing::debug!("members of {} unchanged", self.target);
            return true;
        }

        tracing::info!("members of {} changed: {snapshot}", self.target);
        self.current = snapshot;

        self.publish().await
    }

    fn decode(&self, groups: &[MemberGroup]) -> Snapshot {
        Snapshot::decode(groups, self.target.port(), self.config.port_policy)
    }

    /// Queues a copy of the current snapshot.
    ///
    /// Returns `false` if the watcher was cancelled or the receiver is gone.
    async fn publish(&self) -> bool {
        let snapshot = self.current.clone();

        match self.cancel.run_until_cancelled(self.tx.send(snapshot)).await {
            Some(Ok(())) => true,
            Some(Err(_)) => {
                tracing::debug!("snapshot receiver for {} dropped", self.target);
                false
            }

            None => false,
        }
    }
}
