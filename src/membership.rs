//! The membership API seams.
//!
//! [`Connector`] produces an authenticated [`MembershipApi`] handle, which
//! lists and watches the members of one named service at a time. The handle
//! is shared read-only between watchers.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::{ConnectError, QueryError};

/// One group of member addresses as reported by the membership API.
///
/// `ports` holds the ports the API declares for the group; it is only used
/// to validate the target port.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberGroup {
    /// Member IP addresses, unparsed.
    pub addresses: Vec<String>,
    /// Declared ports for the group.
    pub ports: Vec<u16>,
}

/// The member groups of a service at one server version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberList {
    /// Member groups, possibly empty.
    pub groups: Vec<MemberGroup>,
    /// Server version the groups were read at, if the server reports one.
    ///
    /// Watches resume from the last version seen.
    pub resource_version: Option<String>,
}

impl MemberList {
    /// Creates a list read at `resource_version`.
    #[must_use]
    pub fn new(groups: Vec<MemberGroup>, resource_version: Option<String>) -> Self {
        Self {
            groups,
            resource_version,
        }
    }
}

impl From<Vec<MemberGroup>> for MemberList {
    fn from(groups: Vec<MemberGroup>) -> Self {
        Self::new(groups, None)
    }
}

/// Stream of change events, each carrying the full current member groups.
pub type MemberStream = BoxStream<'static, Result<MemberList, QueryError>>;

/// Lists and watches the members of a service.
#[async_trait]
pub trait MembershipApi: Send + Sync {
    /// Returns the current members of `service` in `namespace`.
    ///
    /// A service without members yields an empty list, not an error.
    async fn list_members(&self, namespace: &str, service: &str)
    -> Result<MemberList, QueryError>;

    /// Opens a stream of changes to the members of exactly one service.
    ///
    /// With a `resource_version` the stream starts after that version.
    /// Without one it starts from the most recent state. The stream ends
    /// when the server closes it, and fails with [`QueryError::Expired`]
    /// once the version is too old to resume from.
    async fn watch_members(
        &self,
        namespace: &str,
        service: &str,
        resource_version: Option<&str>,
    ) -> Result<MemberStream, QueryError>;
}

/// Produces an authenticated membership API handle.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to the membership API.
    async fn connect(&self) -> Result<Arc<dyn MembershipApi>, ConnectError>;
}
