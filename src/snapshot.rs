//! Members and full-replacement snapshots of a service.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::membership::MemberGroup;

/// One reachable backend instance.
///
/// Members have no identity beyond their address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Member {
    address: SocketAddr,
}

impl Member {
    /// Creates a member reached at `ip` on `port`.
    #[must_use]
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            address: SocketAddr::new(ip, port),
        }
    }

    /// The member's socket address.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

impl From<SocketAddr> for Member {
    fn from(address: SocketAddr) -> Self {
        Self { address }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.address.fmt(f)
    }
}

/// Everyone currently reachable for a service.
///
/// A snapshot always replaces the previous one; it is never a delta.
/// Members keep the order they were first observed in and are unique.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    members: Vec<Member>,
}

impl Snapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The members, in first-observed order.
    #[must_use]
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Iterates over member socket addresses.
    pub fn addresses(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.members.iter().map(Member::address)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the snapshot has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether `address` is a member.
    #[must_use]
    pub fn contains(&self, address: SocketAddr) -> bool {
        self.members.iter().any(|m| m.address == address)
    }

    /// Whether both snapshots hold the same members, regardless of order.
    pub(crate) fn same_members(&self, other: &Self) -> bool {
        let other: HashSet<&Member> = other.members.iter().collect();
        self.members.len() == other.len() && self.members.iter().all(|m| other.contains(m))
    }

    /// Decodes member groups reported by the membership API.
    ///
    /// Every member is assigned `port`. Groups that declare ports not
    /// including `port` are handled according to `policy`.
    pub(crate) fn decode(groups: &[MemberGroup], port: u16, policy: PortPolicy) -> Self {
        let mut members = Vec::new();

        for group in groups {
            if !group.ports.is_empty() && !group.ports.contains(&port) {
                match policy {
                    PortPolicy::Normalize => {
                        tracing::warn!(
                            "member group declares ports {:?}, expected {port}; using {port}",
                            group.ports
                        );
                    }

                    PortPolicy::Reject => {
                        tracing::warn!(
                            "dropping member group with ports {:?}, expected {port}",
                            group.ports
                        );

                        continue;
                    }
                }
            }

            for address in &group.addresses {
                match address.parse::<IpAddr>() {
                    Ok(ip) => members.push(Member::new(ip, port)),
                    Err(_) => tracing::warn!("skipping invalid member address: {address}"),
                }
            }
        }

        members.into_iter().collect()
    }
}

impl FromIterator<Member> for Snapshot {
    fn from_iter<I: IntoIterator<Item = Member>>(iter: I) -> Self {
        let mut seen = HashSet::new();
        let members = iter.into_iter().filter(|m| seen.insert(*m)).collect();
        Self { members }
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Member;
    type IntoIter = std::slice::Iter<'a, Member>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.iter()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }

            member.fmt(f)?;
        }

        f.write_str("]")
    }
}

/// What to do with members whose declared ports disagree with the target port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PortPolicy {
    /// Log a warning and reach the members on the target port anyway.
    #[default]
    Normalize,
    /// Log a warning and leave the members out of the snapshot.
    Reject,
}
