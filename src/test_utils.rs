//! Scripted fakes for the membership API and connection-state sink.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc as stream_mpsc;
use tokio::sync::mpsc;

use crate::error::{ConnectError, QueryError, SinkClosed};
use crate::membership::{Connector, MemberGroup, MemberList, MemberStream, MembershipApi};
use crate::resolver::StateSink;
use crate::snapshot::Snapshot;

pub(crate) type EventSender = stream_mpsc::UnboundedSender<Result<MemberList, QueryError>>;

pub(crate) const TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn group(addresses: &[&str], ports: &[u16]) -> MemberGroup {
    MemberGroup {
        addresses: addresses.iter().map(ToString::to_string).collect(),
        ports: ports.to_vec(),
    }
}

/// Membership API whose list result and watch streams are set up by the test.
///
/// Each `watch_members` call hands out the next queued stream; when none is
/// queued the call fails. The resource version of every watch call is kept.
#[derive(Default)]
pub(crate) struct FakeMembership {
    list: Mutex<Option<MemberList>>,
    lists: AtomicUsize,
    streams: Mutex<VecDeque<MemberStream>>,
    watch_versions: Mutex<Vec<Option<String>>>,
}

impl FakeMembership {
    pub(crate) fn with_members(groups: Vec<MemberGroup>) -> Arc<Self> {
        Self::with_list(groups.into())
    }

    pub(crate) fn with_list(list: MemberList) -> Arc<Self> {
        let fake = Self::default();
        fake.set_list(list);
        Arc::new(fake)
    }

    /// Replaces what later list calls return.
    pub(crate) fn set_list(&self, list: MemberList) {
        *self.list.lock().unwrap() = Some(list);
    }

    /// A fake whose list call fails.
    pub(crate) fn failing_list() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a stream for the next watch call and returns its event sender.
    pub(crate) fn push_stream(&self) -> EventSender {
        let (tx, rx) = stream_mpsc::unbounded();
        self.streams.lock().unwrap().push_back(rx.boxed());
        tx
    }

    pub(crate) fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub(crate) fn watches(&self) -> usize {
        self.watch_versions.lock().unwrap().len()
    }

    pub(crate) fn watch_versions(&self) -> Vec<Option<String>> {
        self.watch_versions.lock().unwrap().clone()
    }
}

#[async_trait]
impl MembershipApi for FakeMembership {
    async fn list_members(&self, _namespace: &str, _service: &str) -> Result<MemberList, QueryError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.list
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| QueryError::Status("list unavailable".to_string()))
    }

    async fn watch_members(
        &self,
        _namespace: &str,
        _service: &str,
        resource_version: Option<&str>,
    ) -> Result<MemberStream, QueryError> {
        self.watch_versions
            .lock()
            .unwrap()
            .push(resource_version.map(ToString::to_string));
        self.streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| QueryError::Status("watch unavailable".to_string()))
    }
}

/// Connector that hands out a fixed fake, or fails when there is none.
pub(crate) struct FakeConnector {
    api: Option<Arc<FakeMembership>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub(crate) fn new(api: Arc<FakeMembership>) -> Self {
        Self {
            api: Some(api),
            connects: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            api: None,
            connects: AtomicUsize::new(0),
        }
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn MembershipApi>, ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match &self.api {
            Some(api) => Ok(Arc::clone(api) as Arc<dyn MembershipApi>),
            None => Err(ConnectError::Credentials("no credentials in test".to_string())),
        }
    }
}

#[async_trait]
impl<C: Connector> Connector for Arc<C> {
    async fn connect(&self) -> Result<Arc<dyn MembershipApi>, ConnectError> {
        self.as_ref().connect().await
    }
}

/// Sink that records every update on a channel.
pub(crate) struct RecordingSink {
    tx: mpsc::UnboundedSender<Snapshot>,
}

impl RecordingSink {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Snapshot>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl StateSink for RecordingSink {
    async fn update(&mut self, snapshot: Snapshot) -> Result<(), SinkClosed> {
        self.tx.send(snapshot).map_err(|_| SinkClosed)
    }
}

pub(crate) async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
    tokio::time::timeout(TIMEOUT, rx.recv()).await.ok().flatten()
}
