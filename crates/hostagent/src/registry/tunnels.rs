//! Tunnel registry logic.

use super::types::{MembershipChange, RegistryStats, TunnelEntry};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use hostagent_common::{AgentError, AgentResult, SyncMap};
use hostagent_types::{LocalTag, TunnelId};
use parking_lot::Mutex;
use std::collections::HashMap;

struct RegistryState {
    tunnels: SyncMap<TunnelId, TunnelEntry>,
    by_tag: HashMap<LocalTag, TunnelId>,
    next_tag: u32,
    stats: RegistryStats,
}

/// Thread-safe tunnel id to local tag registry.
///
/// Forward map, reverse map and the tag counter share one lock, so a
/// create-or-get and every reverse lookup observe the same state.
pub struct TunnelRegistry {
    state: Mutex<RegistryState>,
    tag_limit: u16,
}

fn check_tunnel_id(tunnel_id: TunnelId) -> AgentResult<()> {
    if tunnel_id == 0 {
        return Err(AgentError::invalid_argument("tunnel_id", "must be non-zero"));
    }
    Ok(())
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::with_tag_limit(LocalTag::MAX)
    }

    /// Registry that hands out tags `1..=limit` only.
    pub fn with_tag_limit(limit: u16) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                tunnels: SyncMap::new(),
                by_tag: HashMap::new(),
                next_tag: u32::from(LocalTag::MIN),
                stats: RegistryStats::default(),
            }),
            tag_limit: limit.clamp(LocalTag::MIN, LocalTag::MAX),
        }
    }

    /// Returns the tunnel's tag, creating the entry on first reference.
    pub fn get_or_create_tag(&self, tunnel_id: TunnelId) -> AgentResult<LocalTag> {
        check_tunnel_id(tunnel_id)?;
        let mut state = self.state.lock();
        self.ensure_entry(&mut state, tunnel_id)
    }

    /// Lookup without creation.
    pub fn get_tag(&self, tunnel_id: TunnelId) -> AgentResult<LocalTag> {
        self.state
            .lock()
            .tunnels
            .get(&tunnel_id)
            .map(|entry| entry.local_tag)
            .ok_or_else(|| AgentError::not_found("tunnel", tunnel_id))
    }

    pub fn tag_to_tunnel(&self, tag: LocalTag) -> Option<TunnelId> {
        self.state.lock().by_tag.get(&tag).copied()
    }

    pub fn get_entry(&self, tunnel_id: TunnelId) -> Option<TunnelEntry> {
        self.state.lock().tunnels.get_cloned(&tunnel_id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().tunnels.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        self.state.lock().stats.clone()
    }

    /// Adds `port_name` to the tunnel, creating the entry if needed.
    pub fn attach_port(&self, tunnel_id: TunnelId, port_name: &str) -> AgentResult<MembershipChange> {
        check_tunnel_id(tunnel_id)?;
        if port_name.is_empty() {
            return Err(AgentError::empty_field("port_name"));
        }

        let mut state = self.state.lock();
        let local_tag = self.ensure_entry(&mut state, tunnel_id)?;
        let entry = state
            .tunnels
            .get_mut(&tunnel_id)
            .ok_or_else(|| AgentError::not_found("tunnel", tunnel_id))?;

        let change = if !entry.member_ports.insert(port_name.to_string()) {
            MembershipChange::AlreadyMember { local_tag }
        } else if entry.member_ports.len() == 1 {
            MembershipChange::FirstMember { local_tag }
        } else {
            MembershipChange::Added { local_tag }
        };

        if !matches!(change, MembershipChange::AlreadyMember { .. }) {
            state.stats.ports_attached = state.stats.ports_attached.saturating_add(1);
        }
        Ok(change)
    }

    /// Removes `port_name`; drops the entry once no members remain.
    pub fn detach_port(&self, tunnel_id: TunnelId, port_name: &str) -> AgentResult<MembershipChange> {
        let mut state = self.state.lock();
        let entry = state
            .tunnels
            .get_mut(&tunnel_id)
            .ok_or_else(|| AgentError::not_found("tunnel", tunnel_id))?;

        if !entry.member_ports.remove(port_name) {
            return Err(AgentError::not_found("tunnel member", port_name));
        }
        let local_tag = entry.local_tag;
        let now_empty = entry.member_ports.is_empty();
        state.stats.ports_detached = state.stats.ports_detached.saturating_add(1);

        if !now_empty {
            return Ok(MembershipChange::Removed { local_tag });
        }

        state.tunnels.remove(&tunnel_id);
        state.by_tag.remove(&local_tag);
        state.stats.entries_removed = state.stats.entries_removed.saturating_add(1);

        audit_log!(AuditRecord::new(
            AuditCategory::ResourceDelete,
            "TunnelRegistry",
            "remove_entry"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(tunnel_id.to_string())
        .with_object_type("tunnel")
        .with_details(serde_json::json!({
            "tunnel_id": tunnel_id,
            "local_tag": local_tag.as_u32(),
            "last_port": port_name,
        })));

        Ok(MembershipChange::LastMemberRemoved { local_tag })
    }

    /// Records the standby gateway for a tunnel, creating the entry if needed.
    pub fn set_standby_gateway(&self, tunnel_id: TunnelId, gateway_id: &str) -> AgentResult<()> {
        check_tunnel_id(tunnel_id)?;
        if gateway_id.is_empty() {
            return Err(AgentError::empty_field("standby_gateway_id"));
        }
        let mut state = self.state.lock();
        self.ensure_entry(&mut state, tunnel_id)?;
        if let Some(entry) = state.tunnels.get_mut(&tunnel_id) {
            entry.standby_gateway_id = Some(gateway_id.to_string());
        }
        Ok(())
    }

    pub fn clear_standby_gateway(&self, tunnel_id: TunnelId) -> AgentResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .tunnels
            .get_mut(&tunnel_id)
            .ok_or_else(|| AgentError::not_found("tunnel", tunnel_id))?;
        entry.standby_gateway_id = None;
        Ok(())
    }

    pub fn get_standby_gateway(&self, tunnel_id: TunnelId) -> AgentResult<Option<String>> {
        self.state
            .lock()
            .tunnels
            .get(&tunnel_id)
            .map(|entry| entry.standby_gateway_id.clone())
            .ok_or_else(|| AgentError::not_found("tunnel", tunnel_id))
    }

    fn ensure_entry(&self, state: &mut RegistryState, tunnel_id: TunnelId) -> AgentResult<LocalTag> {
        if let Some(entry) = state.tunnels.get(&tunnel_id) {
            return Ok(entry.local_tag);
        }

        let local_tag = match self.allocate_tag(state) {
            Ok(tag) => tag,
            Err(e) => {
                audit_log!(AuditRecord::new(
                    AuditCategory::ResourceCreate,
                    "TunnelRegistry",
                    "create_entry"
                )
                .with_object_id(tunnel_id.to_string())
                .with_object_type("tunnel")
                .with_error(e.to_string()));
                return Err(e);
            }
        };

        state
            .tunnels
            .insert(tunnel_id, TunnelEntry::new(tunnel_id, local_tag));
        state.by_tag.insert(local_tag, tunnel_id);
        state.stats.entries_created = state.stats.entries_created.saturating_add(1);

        audit_log!(AuditRecord::new(
            AuditCategory::ResourceCreate,
            "TunnelRegistry",
            "create_entry"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(tunnel_id.to_string())
        .with_object_type("tunnel")
        .with_details(serde_json::json!({
            "tunnel_id": tunnel_id,
            "local_tag": local_tag.as_u32(),
            "live_entries": state.tunnels.len(),
        })));

        Ok(local_tag)
    }

    /// Next counter value, or once the counter has run past the limit, the
    /// lowest tag no live entry holds.
    fn allocate_tag(&self, state: &mut RegistryState) -> AgentResult<LocalTag> {
        let limit = u32::from(self.tag_limit);

        while state.next_tag <= limit {
            let tag = LocalTag::new(state.next_tag)?;
            state.next_tag += 1;
            if !state.by_tag.contains_key(&tag) {
                return Ok(tag);
            }
        }

        for candidate in u32::from(LocalTag::MIN)..=limit {
            let tag = LocalTag::new(candidate)?;
            if !state.by_tag.contains_key(&tag) {
                state.stats.tags_reclaimed = state.stats.tags_reclaimed.saturating_add(1);
                return Ok(tag);
            }
        }

        Err(AgentError::conflict(format!(
            "all {} local tags are held by live tunnels",
            limit
        )))
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
