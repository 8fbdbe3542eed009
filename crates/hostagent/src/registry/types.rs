//! Registry types.

use hostagent_types::{LocalTag, TunnelId};
use serde::Serialize;
use std::collections::BTreeSet;

/// Registry record for one tunnel id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelEntry {
    pub tunnel_id: TunnelId,
    pub local_tag: LocalTag,
    pub member_ports: BTreeSet<String>,
    pub standby_gateway_id: Option<String>,
}

impl TunnelEntry {
    pub fn new(tunnel_id: TunnelId, local_tag: LocalTag) -> Self {
        Self {
            tunnel_id,
            local_tag,
            member_ports: BTreeSet::new(),
            standby_gateway_id: None,
        }
    }
}

/// What a membership update did to a tunnel entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    /// The port is the tunnel's only member; install the classifier.
    FirstMember { local_tag: LocalTag },
    /// Added next to existing members.
    Added { local_tag: LocalTag },
    /// The port was already a member; nothing changed.
    AlreadyMember { local_tag: LocalTag },
    /// Removed; other members remain.
    Removed { local_tag: LocalTag },
    /// Removed the last member and dropped the entry; remove the classifier.
    LastMemberRemoved { local_tag: LocalTag },
}

impl MembershipChange {
    pub fn local_tag(&self) -> LocalTag {
        match *self {
            MembershipChange::FirstMember { local_tag }
            | MembershipChange::Added { local_tag }
            | MembershipChange::AlreadyMember { local_tag }
            | MembershipChange::Removed { local_tag }
            | MembershipChange::LastMemberRemoved { local_tag } => local_tag,
        }
    }

    pub fn is_first_member(&self) -> bool {
        matches!(self, MembershipChange::FirstMember { .. })
    }

    pub fn is_last_member_removed(&self) -> bool {
        matches!(self, MembershipChange::LastMemberRemoved { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub entries_created: u64,
    pub entries_removed: u64,
    pub ports_attached: u64,
    pub ports_detached: u64,
    /// Tags handed out after the monotonic counter ran past the top of the range
    pub tags_reclaimed: u64,
}
