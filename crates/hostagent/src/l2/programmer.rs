//! L2 programming logic.

use super::types::{
    L2NeighborRecord, L2ProgrammerConfig, L2ProgrammerStats, PortProgramming, PortRecord,
};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::dataplane::{
    rules, SwitchClients, BRIDGE_INTEGRATION, BRIDGE_TUNNEL, PATCH_TO_INTEGRATION,
    PATCH_TO_TUNNEL,
};
use crate::registry::TunnelRegistry;
use crate::validate;
use hostagent_common::{AgentError, AgentResult, BatchOutcome, SyncMap};
use hostagent_types::{LocalTag, MacAddress, NetworkType, TunnelId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Programs local ports and remote L2 neighbors.
pub struct L2Programmer {
    config: L2ProgrammerConfig,
    registry: Arc<TunnelRegistry>,
    clients: SwitchClients,
    bridges_ready: Mutex<bool>,
    transport_ports: Mutex<HashSet<NetworkType>>,
    /// Held across a registry membership change and its classifier update.
    membership: Mutex<()>,
    ports: Arc<Mutex<SyncMap<String, PortRecord>>>,
    neighbors: Mutex<SyncMap<(LocalTag, MacAddress), L2NeighborRecord>>,
    stats: Arc<Mutex<L2ProgrammerStats>>,
}

impl L2Programmer {
    pub fn new(
        config: L2ProgrammerConfig,
        registry: Arc<TunnelRegistry>,
        clients: SwitchClients,
    ) -> Self {
        Self {
            config,
            registry,
            clients,
            bridges_ready: Mutex::new(false),
            transport_ports: Mutex::new(HashSet::new()),
            membership: Mutex::new(()),
            ports: Arc::new(Mutex::new(SyncMap::new())),
            neighbors: Mutex::new(SyncMap::new()),
            stats: Arc::new(Mutex::new(L2ProgrammerStats::default())),
        }
    }

    pub fn stats(&self) -> L2ProgrammerStats {
        self.stats.lock().clone()
    }

    pub fn port(&self, port_name: &str) -> Option<PortRecord> {
        self.ports.lock().get_cloned(&port_name.to_string())
    }

    pub fn port_count(&self) -> usize {
        self.ports.lock().len()
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.lock().len()
    }

    /// Creates br-int and br-tun with their patch ports and default pipeline
    /// the first time it runs against a switch that has neither.
    pub fn ensure_bridges(&self) -> AgentResult<()> {
        let mut ready = self.bridges_ready.lock();
        if *ready {
            return Ok(());
        }

        let topology = &self.clients.topology;
        let have_int = topology.bridge_exists(BRIDGE_INTEGRATION)?;
        let have_tun = topology.bridge_exists(BRIDGE_TUNNEL)?;

        match (have_int, have_tun) {
            (true, true) => {
                *ready = true;
                return Ok(());
            }
            (false, false) => {}
            _ => {
                let err = AgentError::conflict(format!(
                    "only one of {} and {} exists",
                    BRIDGE_INTEGRATION, BRIDGE_TUNNEL
                ));
                audit_log!(AuditRecord::new(
                    AuditCategory::NetworkConfig,
                    "L2Programmer",
                    "bootstrap_bridges"
                )
                .with_outcome(AuditOutcome::Denied)
                .with_error(err.to_string()));
                return Err(err);
            }
        }

        topology.add_bridge(BRIDGE_INTEGRATION)?;
        topology.add_bridge(BRIDGE_TUNNEL)?;
        topology.add_patch_port(BRIDGE_INTEGRATION, PATCH_TO_TUNNEL, PATCH_TO_INTEGRATION)?;
        topology.add_patch_port(BRIDGE_TUNNEL, PATCH_TO_INTEGRATION, PATCH_TO_TUNNEL)?;
        for (bridge, rule) in rules::bootstrap() {
            self.clients.flows.install(bridge, &rule)?;
        }
        *ready = true;
        drop(ready);

        self.ensure_transport_port(NetworkType::Vxlan)?;
        self.bump(|s| s.bridge_bootstraps = s.bridge_bootstraps.saturating_add(1));

        audit_log!(AuditRecord::new(
            AuditCategory::NetworkConfig,
            "L2Programmer",
            "bootstrap_bridges"
        )
        .with_outcome(AuditOutcome::Success)
        .with_details(serde_json::json!({
            "bridges": [BRIDGE_INTEGRATION, BRIDGE_TUNNEL],
            "patch_ports": [PATCH_TO_TUNNEL, PATCH_TO_INTEGRATION],
        })));
        Ok(())
    }

    /// Creates the flow-based transport port for `network_type` and its
    /// ingress rule, once per network type.
    fn ensure_transport_port(&self, network_type: NetworkType) -> AgentResult<String> {
        let port = network_type.transport_port_name();
        if self.transport_ports.lock().contains(&network_type) {
            return Ok(port);
        }
        self.clients
            .topology
            .add_tunnel_port(BRIDGE_TUNNEL, &port, network_type)?;
        self.clients
            .flows
            .install(BRIDGE_TUNNEL, &rules::transport_ingress(&port))?;
        self.transport_ports.lock().insert(network_type);
        info_log!("L2Programmer", port = %port, "transport port ready");
        Ok(port)
    }

    pub fn create_port(
        &self,
        vpc_id: &str,
        port_name: &str,
        virtual_ip: &str,
        virtual_mac: &str,
        tunnel_id: TunnelId,
    ) -> AgentResult<PortProgramming> {
        let result = self.program_port(vpc_id, port_name, virtual_ip, virtual_mac, tunnel_id);
        match &result {
            Ok(PortProgramming::AlreadyProgrammed) => {}
            Ok(outcome) => {
                let audit_outcome = if *outcome == PortProgramming::InProgress {
                    AuditOutcome::InProgress
                } else {
                    AuditOutcome::Success
                };
                audit_log!(AuditRecord::new(
                    AuditCategory::ResourceCreate,
                    "L2Programmer",
                    "create_port"
                )
                .with_outcome(audit_outcome)
                .with_object_id(port_name)
                .with_object_type("port")
                .with_details(serde_json::json!({
                    "vpc_id": vpc_id,
                    "virtual_ip": virtual_ip,
                    "virtual_mac": virtual_mac,
                    "tunnel_id": tunnel_id,
                })));
            }
            Err(e) => {
                self.bump(|s| s.errors = s.errors.saturating_add(1));
                audit_log!(AuditRecord::new(
                    AuditCategory::ResourceCreate,
                    "L2Programmer",
                    "create_port"
                )
                .with_object_id(port_name)
                .with_object_type("port")
                .with_error(e.to_string()));
            }
        }
        result
    }

    fn program_port(
        &self,
        vpc_id: &str,
        port_name: &str,
        virtual_ip: &str,
        virtual_mac: &str,
        tunnel_id: TunnelId,
    ) -> AgentResult<PortProgramming> {
        validate::required("vpc_id", vpc_id)?;
        validate::required("port_name", port_name)?;
        let virtual_ip = validate::ipv4("virtual_ip", virtual_ip)?;
        let virtual_mac = validate::mac("virtual_mac", virtual_mac)?;
        if tunnel_id == 0 {
            return Err(AgentError::invalid_argument("tunnel_id", "must be non-zero"));
        }

        self.ensure_bridges()?;

        let existing = self.ports.lock().get_cloned(&port_name.to_string());
        if let Some(existing) = &existing {
            if existing.tunnel_id != tunnel_id {
                return Err(AgentError::conflict(format!(
                    "port {} is already attached to tunnel {}",
                    port_name, existing.tunnel_id
                )));
            }
        }

        let membership = self.membership.lock();
        let change = self.registry.attach_port(tunnel_id, port_name)?;
        let local_tag = change.local_tag();
        let record = PortRecord {
            vpc_id: vpc_id.to_string(),
            virtual_ip,
            virtual_mac,
            tunnel_id,
            local_tag,
            tagged: false,
        };

        if let Some(existing) = existing {
            if existing.same_config(&record) {
                self.bump(|s| s.duplicate_creates = s.duplicate_creates.saturating_add(1));
                debug_log!("L2Programmer", port = %port_name, tunnel_id, "duplicate create_port ignored");
                return Ok(if existing.tagged {
                    PortProgramming::AlreadyProgrammed
                } else {
                    PortProgramming::InProgress
                });
            }
        }

        if change.is_first_member() {
            let classifier = rules::tunnel_classifier(tunnel_id, local_tag);
            if let Err(e) = self.clients.flows.install(BRIDGE_TUNNEL, &classifier) {
                if let Err(rollback) = self.registry.detach_port(tunnel_id, port_name) {
                    warn_log!("L2Programmer", port = %port_name, error = %rollback, "registry rollback failed");
                }
                return Err(e);
            }
        }
        drop(membership);

        self.ports.lock().insert(port_name.to_string(), record);

        match self.clients.topology.attach_port(port_name, local_tag) {
            Ok(()) => {
                self.mark_tagged(port_name);
                self.bump(|s| s.ports_created = s.ports_created.saturating_add(1));
                Ok(PortProgramming::Programmed)
            }
            Err(e @ AgentError::Upstream { .. }) => {
                if self.spawn_port_tag_retry(port_name, tunnel_id, local_tag) {
                    info_log!(
                        "L2Programmer",
                        port = %port_name,
                        error = %e,
                        "port not present on switch yet, retrying in background"
                    );
                    Ok(PortProgramming::InProgress)
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    fn mark_tagged(&self, port_name: &str) {
        if let Some(record) = self.ports.lock().get_mut(&port_name.to_string()) {
            record.tagged = true;
        }
    }

    /// Keeps trying to tag a port the switch did not know yet. Returns false
    /// when there is no runtime to run the retry on.
    fn spawn_port_tag_retry(&self, port_name: &str, tunnel_id: TunnelId, tag: LocalTag) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };

        let topology = Arc::clone(&self.clients.topology);
        let ports = Arc::clone(&self.ports);
        let stats = Arc::clone(&self.stats);
        let attempts = self.config.port_tag_retry_max;
        let interval = self.config.port_tag_retry_interval;
        let port_name = port_name.to_string();

        {
            let mut s = stats.lock();
            s.port_tag_retries_started = s.port_tag_retries_started.saturating_add(1);
        }

        handle.spawn(async move {
            for attempt in 1..=attempts {
                tokio::time::sleep(interval).await;

                let wanted = ports
                    .lock()
                    .get(&port_name)
                    .map(|r| r.tunnel_id == tunnel_id && !r.tagged)
                    .unwrap_or(false);
                if !wanted {
                    debug_log!("L2Programmer", port = %port_name, "port tag retry no longer needed");
                    return;
                }

                match topology.attach_port(&port_name, tag) {
                    Ok(()) => {
                        if let Some(record) = ports.lock().get_mut(&port_name) {
                            record.tagged = true;
                        }
                        let mut s = stats.lock();
                        s.port_tag_retries_succeeded = s.port_tag_retries_succeeded.saturating_add(1);
                        drop(s);
                        info_log!("L2Programmer", port = %port_name, attempt, tag = %tag, "port tagged");
                        return;
                    }
                    Err(e) => {
                        debug_log!("L2Programmer", port = %port_name, attempt, error = %e, "port tag retry failed");
                    }
                }
            }

            let mut s = stats.lock();
            s.port_tag_retries_exhausted = s.port_tag_retries_exhausted.saturating_add(1);
            drop(s);
            audit_log!(AuditRecord::new(
                AuditCategory::DataplaneOperation,
                "L2Programmer",
                "tag_port"
            )
            .with_object_id(port_name.clone())
            .with_object_type("port")
            .with_error(format!("port still missing after {} attempts", attempts)));
        });
        true
    }

    pub fn delete_port(&self, vpc_id: &str, port_name: &str, tunnel_id: TunnelId) -> AgentResult<()> {
        validate::required("port_name", port_name)?;

        let membership = self.membership.lock();
        let change = match self.registry.detach_port(tunnel_id, port_name) {
            Ok(change) => change,
            Err(e) => {
                drop(membership);
                self.bump(|s| s.errors = s.errors.saturating_add(1));
                return Err(e);
            }
        };
        self.ports.lock().remove(&port_name.to_string());
        let mut outcome = BatchOutcome::new();
        if change.is_last_member_removed() {
            outcome.record(self.clients.flows.remove(
                BRIDGE_TUNNEL,
                &rules::tunnel_classifier_match(tunnel_id),
                true,
            ));
        }
        drop(membership);

        outcome.record(self.clients.topology.detach_port(port_name));

        let result = outcome.into_result("delete_port");
        let record = AuditRecord::new(AuditCategory::ResourceDelete, "L2Programmer", "delete_port")
            .with_object_id(port_name)
            .with_object_type("port")
            .with_details(serde_json::json!({
                "vpc_id": vpc_id,
                "tunnel_id": tunnel_id,
                "classifier_removed": change.is_last_member_removed(),
            }));
        match &result {
            Ok(()) => {
                self.bump(|s| s.ports_deleted = s.ports_deleted.saturating_add(1));
                audit_log!(record.with_outcome(AuditOutcome::Success));
            }
            Err(e) => {
                self.bump(|s| s.errors = s.errors.saturating_add(1));
                audit_log!(record.with_error(e.to_string()));
            }
        }
        result
    }

    pub fn create_or_update_l2_neighbor(
        &self,
        virtual_ip: &str,
        virtual_mac: &str,
        remote_host_ip: &str,
        tunnel_id: TunnelId,
        network_type: NetworkType,
    ) -> AgentResult<()> {
        let virtual_ip = validate::ipv4("virtual_ip", virtual_ip)?;
        let virtual_mac = validate::mac("virtual_mac", virtual_mac)?;
        let remote_host_ip = validate::ipv4("remote_host_ip", remote_host_ip)?;
        let tunnel_id = validate::tunnel_id(network_type, tunnel_id)?;

        self.ensure_bridges()?;
        let transport = self.ensure_transport_port(network_type)?;
        let local_tag = self.registry.get_or_create_tag(tunnel_id)?;

        let record = L2NeighborRecord {
            local_tag,
            virtual_ip,
            virtual_mac,
            remote_host_ip,
        };
        if self.neighbors.lock().get(&(local_tag, virtual_mac)) == Some(&record) {
            debug_log!("L2Programmer", virtual_ip = %virtual_ip, "l2 neighbor unchanged");
            return Ok(());
        }

        let flows = &self.clients.flows;
        let result = flows
            .install(
                BRIDGE_TUNNEL,
                &rules::l2_neighbor(local_tag, virtual_mac, tunnel_id, remote_host_ip, &transport),
            )
            .and_then(|_| {
                flows.install(
                    BRIDGE_TUNNEL,
                    &rules::arp_responder(local_tag, virtual_ip, virtual_mac),
                )
            })
            .and_then(|_| {
                self.clients
                    .address_resolution
                    .upsert(virtual_ip, virtual_mac, local_tag)
            });

        let audit = AuditRecord::new(
            AuditCategory::ResourceCreate,
            "L2Programmer",
            "create_l2_neighbor",
        )
        .with_object_id(virtual_ip.to_string())
        .with_object_type("l2_neighbor")
        .with_details(serde_json::json!({
            "virtual_mac": virtual_mac.to_string(),
            "remote_host_ip": remote_host_ip.to_string(),
            "tunnel_id": tunnel_id,
            "local_tag": local_tag.as_u32(),
        }));

        match result {
            Ok(()) => {
                if let Some(previous) = self.neighbors.lock().insert((local_tag, virtual_mac), record) {
                    if previous.remote_host_ip != remote_host_ip {
                        info_log!(
                            "L2Programmer",
                            virtual_mac = %virtual_mac,
                            from = %previous.remote_host_ip,
                            to = %remote_host_ip,
                            "l2 neighbor moved"
                        );
                    }
                }
                self.bump(|s| s.neighbors_programmed = s.neighbors_programmed.saturating_add(1));
                audit_log!(audit.with_outcome(AuditOutcome::Success));
                Ok(())
            }
            Err(e) => {
                self.bump(|s| s.errors = s.errors.saturating_add(1));
                audit_log!(audit.with_error(e.to_string()));
                Err(e)
            }
        }
    }

    pub fn delete_l2_neighbor(
        &self,
        virtual_ip: &str,
        virtual_mac: &str,
        tunnel_id: TunnelId,
    ) -> AgentResult<()> {
        let virtual_ip = validate::ipv4("virtual_ip", virtual_ip)?;
        let virtual_mac = validate::mac("virtual_mac", virtual_mac)?;
        let local_tag = self.registry.get_tag(tunnel_id)?;

        let mut outcome = BatchOutcome::new();
        outcome.record(self.clients.flows.remove(
            BRIDGE_TUNNEL,
            &rules::l2_neighbor_match(local_tag, virtual_mac),
            true,
        ));
        outcome.record(self.clients.flows.remove(
            BRIDGE_TUNNEL,
            &rules::arp_responder_match(local_tag, virtual_ip),
            false,
        ));
        outcome.record(
            self.clients
                .address_resolution
                .remove(virtual_ip, virtual_mac, local_tag),
        );

        self.neighbors.lock().remove(&(local_tag, virtual_mac));

        let result = outcome.into_result("delete_l2_neighbor");
        let audit = AuditRecord::new(
            AuditCategory::ResourceDelete,
            "L2Programmer",
            "delete_l2_neighbor",
        )
        .with_object_id(virtual_ip.to_string())
        .with_object_type("l2_neighbor");
        match &result {
            Ok(()) => {
                self.bump(|s| s.neighbors_removed = s.neighbors_removed.saturating_add(1));
                audit_log!(audit.with_outcome(AuditOutcome::Success));
            }
            Err(e) => {
                self.bump(|s| s.errors = s.errors.saturating_add(1));
                audit_log!(audit.with_error(e.to_string()));
            }
        }
        result
    }

    fn bump(&self, f: impl FnOnce(&mut L2ProgrammerStats)) {
        f(&mut self.stats.lock());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::{FaultPoint, FlowMatch, FlowRule, FlowTableClient, InMemoryDataplane};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn setup_with(dataplane: InMemoryDataplane) -> (Arc<InMemoryDataplane>, Arc<TunnelRegistry>, L2Programmer) {
        let dataplane = Arc::new(dataplane);
        let registry = Arc::new(TunnelRegistry::new());
        let programmer = L2Programmer::new(
            L2ProgrammerConfig {
                port_tag_retry_max: 5,
                port_tag_retry_interval: Duration::from_millis(100),
            },
            Arc::clone(&registry),
            SwitchClients::in_memory(Arc::clone(&dataplane)),
        );
        (dataplane, registry, programmer)
    }

    fn setup() -> (Arc<InMemoryDataplane>, Arc<TunnelRegistry>, L2Programmer) {
        setup_with(InMemoryDataplane::new())
    }

    #[test]
    fn test_bootstrap_creates_layout_once() {
        let (dp, _, l2) = setup();
        l2.ensure_bridges().unwrap();
        l2.ensure_bridges().unwrap();

        assert_eq!(dp.bridges(), vec!["br-int".to_string(), "br-tun".to_string()]);
        assert_eq!(dp.patch_peer("patch-tun").as_deref(), Some("patch-int"));
        assert_eq!(dp.port_bridge("patch-int").as_deref(), Some("br-tun"));
        assert_eq!(dp.tunnel_port_type("vxlan-generic"), Some(NetworkType::Vxlan));
        // six default rules plus the transport ingress rule
        assert_eq!(dp.flow_count(BRIDGE_TUNNEL), 7);
        assert_eq!(l2.stats().bridge_bootstraps, 1);
    }

    #[test]
    fn test_bootstrap_half_present_is_conflict() {
        let dp = InMemoryDataplane::new();
        crate::dataplane::SwitchTopologyClient::add_bridge(&dp, BRIDGE_INTEGRATION).unwrap();
        let (_, _, l2) = setup_with(dp);
        assert!(matches!(l2.ensure_bridges(), Err(AgentError::Conflict { .. })));
    }

    #[test]
    fn test_create_port_installs_classifier_once() {
        let (dp, registry, l2) = setup();
        assert_eq!(
            l2.create_port("vpc1", "tap-a", "10.0.0.2", "fa:16:3e:00:00:02", 20).unwrap(),
            PortProgramming::Programmed
        );
        assert_eq!(
            l2.create_port("vpc1", "tap-b", "10.0.0.3", "fa:16:3e:00:00:03", 20).unwrap(),
            PortProgramming::Programmed
        );

        let tag = registry.get_tag(20).unwrap();
        assert_eq!(dp.port_tag("tap-a"), Some(tag));
        assert_eq!(dp.port_tag("tap-b"), Some(tag));
        let classifier = dp
            .find_flow(BRIDGE_TUNNEL, &rules::tunnel_classifier_match(20))
            .unwrap();
        assert_eq!(classifier, rules::tunnel_classifier(20, tag));
        assert_eq!(dp.flow_count(BRIDGE_TUNNEL), 8);
    }

    #[test]
    fn test_duplicate_create_is_noop() {
        let (dp, _, l2) = setup();
        l2.create_port("vpc1", "tap-a", "10.0.0.2", "fa:16:3e:00:00:02", 20).unwrap();
        let flows_before = dp.flow_count(BRIDGE_TUNNEL);

        assert_eq!(
            l2.create_port("vpc1", "tap-a", "10.0.0.2", "fa:16:3e:00:00:02", 20).unwrap(),
            PortProgramming::AlreadyProgrammed
        );
        assert_eq!(dp.flow_count(BRIDGE_TUNNEL), flows_before);
        assert_eq!(l2.stats().duplicate_creates, 1);
    }

    #[test]
    fn test_port_moved_to_other_tunnel_is_conflict() {
        let (_, _, l2) = setup();
        l2.create_port("vpc1", "tap-a", "10.0.0.2", "fa:16:3e:00:00:02", 20).unwrap();
        let err = l2
            .create_port("vpc1", "tap-a", "10.0.0.2", "fa:16:3e:00:00:02", 30)
            .unwrap_err();
        assert!(matches!(err, AgentError::Conflict { .. }));
    }

    #[test]
    fn test_create_port_validation() {
        let (dp, _, l2) = setup();
        assert!(l2.create_port("", "tap", "10.0.0.2", "fa:16:3e:00:00:02", 20).unwrap_err().is_invalid_argument());
        assert!(l2.create_port("vpc", "", "10.0.0.2", "fa:16:3e:00:00:02", 20).unwrap_err().is_invalid_argument());
        assert!(l2.create_port("vpc", "tap", "", "fa:16:3e:00:00:02", 20).unwrap_err().is_invalid_argument());
        assert!(l2.create_port("vpc", "tap", "10.0.0.2", "nope", 20).unwrap_err().is_invalid_argument());
        assert!(l2.create_port("vpc", "tap", "10.0.0.2", "fa:16:3e:00:00:02", 0).unwrap_err().is_invalid_argument());
        assert!(dp.bridges().is_empty());
    }

    #[test]
    fn test_classifier_failure_rolls_back_membership() {
        let (dp, registry, l2) = setup();
        l2.ensure_bridges().unwrap();
        dp.inject_fault(FaultPoint::Install, 1);

        assert!(l2.create_port("vpc1", "tap-a", "10.0.0.2", "fa:16:3e:00:00:02", 20).is_err());
        assert!(registry.get_entry(20).is_none());
        assert_eq!(l2.port_count(), 0);
    }

    #[test]
    fn test_delete_last_port_removes_classifier() {
        let (dp, registry, l2) = setup();
        l2.create_port("vpc1", "tap-a", "10.0.0.2", "fa:16:3e:00:00:02", 20).unwrap();
        l2.create_port("vpc1", "tap-b", "10.0.0.3", "fa:16:3e:00:00:03", 20).unwrap();

        l2.delete_port("vpc1", "tap-a", 20).unwrap();
        assert!(dp.find_flow(BRIDGE_TUNNEL, &rules::tunnel_classifier_match(20)).is_some());

        l2.delete_port("vpc1", "tap-b", 20).unwrap();
        assert!(dp.find_flow(BRIDGE_TUNNEL, &rules::tunnel_classifier_match(20)).is_none());
        assert!(registry.get_entry(20).is_none());
        assert_eq!(dp.port_tag("tap-b"), None);

        assert!(l2.delete_port("vpc1", "tap-b", 20).unwrap_err().is_not_found());
    }

    #[test]
    fn test_port_tag_without_runtime_is_upstream() {
        let (_, registry, l2) = setup_with(InMemoryDataplane::with_strict_ports());
        let err = l2
            .create_port("vpc1", "tap-a", "10.0.0.2", "fa:16:3e:00:00:02", 20)
            .unwrap_err();
        assert!(matches!(err, AgentError::Upstream { .. }));
        // registered state stays so the orchestrator's retry finds it
        assert!(registry.get_entry(20).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_tag_retry_succeeds_once_port_appears() {
        let (dp, registry, l2) = setup_with(InMemoryDataplane::with_strict_ports());
        assert_eq!(
            l2.create_port("vpc1", "tap-a", "10.0.0.2", "fa:16:3e:00:00:02", 20).unwrap(),
            PortProgramming::InProgress
        );
        assert_eq!(
            l2.create_port("vpc1", "tap-a", "10.0.0.2", "fa:16:3e:00:00:02", 20).unwrap(),
            PortProgramming::InProgress
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(dp.port_tag("tap-a"), None);

        dp.add_vm_port("tap-a");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(dp.port_tag("tap-a"), Some(registry.get_tag(20).unwrap()));
        assert!(l2.port("tap-a").unwrap().tagged);
        assert_eq!(l2.stats().port_tag_retries_succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_tag_retry_gives_up() {
        let (dp, _, l2) = setup_with(InMemoryDataplane::with_strict_ports());
        l2.create_port("vpc1", "tap-a", "10.0.0.2", "fa:16:3e:00:00:02", 20).unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(l2.stats().port_tag_retries_exhausted, 1);
        assert!(!dp.has_port("tap-a"));
    }

    #[test]
    fn test_l2_neighbor_lifecycle() {
        let (dp, registry, l2) = setup();
        l2.create_or_update_l2_neighbor("10.0.0.9", "fa:16:3e:00:00:09", "192.168.1.20", 20, NetworkType::Vxlan)
            .unwrap();

        let tag = registry.get_tag(20).unwrap();
        let ip = "10.0.0.9".parse().unwrap();
        let mac = "fa:16:3e:00:00:09".parse().unwrap();
        assert_eq!(
            dp.find_flow(BRIDGE_TUNNEL, &rules::l2_neighbor_match(tag, mac)),
            Some(rules::l2_neighbor(tag, mac, 20, "192.168.1.20".parse().unwrap(), "vxlan-generic"))
        );
        assert!(dp.find_flow(BRIDGE_TUNNEL, &rules::arp_responder_match(tag, ip)).is_some());
        assert_eq!(dp.arp_entry(ip, tag), Some(mac));

        // re-applying is a no-op
        let flows = dp.flow_count(BRIDGE_TUNNEL);
        l2.create_or_update_l2_neighbor("10.0.0.9", "fa:16:3e:00:00:09", "192.168.1.20", 20, NetworkType::Vxlan)
            .unwrap();
        assert_eq!(dp.flow_count(BRIDGE_TUNNEL), flows);
        assert_eq!(l2.stats().neighbors_programmed, 1);

        l2.delete_l2_neighbor("10.0.0.9", "fa:16:3e:00:00:09", 20).unwrap();
        assert!(dp.find_flow(BRIDGE_TUNNEL, &rules::l2_neighbor_match(tag, mac)).is_none());
        assert!(dp.find_flow(BRIDGE_TUNNEL, &rules::arp_responder_match(tag, ip)).is_none());
        assert_eq!(dp.arp_entry(ip, tag), None);
        assert_eq!(l2.neighbor_count(), 0);
    }

    #[test]
    fn test_l2_neighbor_follows_remote_host() {
        let (dp, registry, l2) = setup();
        let (h1, h2) = ("192.168.1.20", "192.168.1.30");
        for host in [h1, h2, h1] {
            l2.create_or_update_l2_neighbor("10.0.0.9", "fa:16:3e:00:00:09", host, 20, NetworkType::Vxlan)
                .unwrap();
        }

        let tag = registry.get_tag(20).unwrap();
        let mac = "fa:16:3e:00:00:09".parse().unwrap();
        assert_eq!(
            dp.find_flow(BRIDGE_TUNNEL, &rules::l2_neighbor_match(tag, mac)),
            Some(rules::l2_neighbor(tag, mac, 20, h1.parse().unwrap(), "vxlan-generic"))
        );
        assert_eq!(l2.neighbor_count(), 1);
        assert_eq!(l2.stats().neighbors_programmed, 3);

        // the same host again changes nothing
        l2.create_or_update_l2_neighbor("10.0.0.9", "fa:16:3e:00:00:09", h1, 20, NetworkType::Vxlan)
            .unwrap();
        assert_eq!(l2.stats().neighbors_programmed, 3);

        l2.delete_l2_neighbor("10.0.0.9", "fa:16:3e:00:00:09", 20).unwrap();
        assert_eq!(l2.neighbor_count(), 0);
        assert!(dp.find_flow(BRIDGE_TUNNEL, &rules::l2_neighbor_match(tag, mac)).is_none());
    }

    /// Flow table that runs a hook right before the next removal.
    struct HookedFlows {
        inner: Arc<InMemoryDataplane>,
        before_remove: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl FlowTableClient for HookedFlows {
        fn install(&self, bridge: &str, rule: &FlowRule) -> AgentResult<()> {
            FlowTableClient::install(&*self.inner, bridge, rule)
        }

        fn remove(&self, bridge: &str, flow_match: &FlowMatch, strict: bool) -> AgentResult<()> {
            let hook = self.before_remove.lock().take();
            if let Some(hook) = hook {
                hook();
            }
            FlowTableClient::remove(&*self.inner, bridge, flow_match, strict)
        }

        fn flow_exists(&self, bridge: &str, flow_match: &FlowMatch) -> AgentResult<bool> {
            FlowTableClient::flow_exists(&*self.inner, bridge, flow_match)
        }
    }

    #[test]
    fn test_last_port_delete_racing_first_create_keeps_classifier() {
        let dp = Arc::new(InMemoryDataplane::new());
        let flows = Arc::new(HookedFlows {
            inner: Arc::clone(&dp),
            before_remove: Mutex::new(None),
        });
        let registry = Arc::new(TunnelRegistry::new());
        let l2 = Arc::new(L2Programmer::new(
            L2ProgrammerConfig::default(),
            Arc::clone(&registry),
            SwitchClients {
                topology: dp.clone(),
                flows: flows.clone(),
                address_resolution: dp.clone(),
            },
        ));
        l2.create_port("vpc1", "tap-a", "10.0.0.2", "fa:16:3e:00:00:02", 20).unwrap();

        // a create for the same tunnel arrives while the classifier is being removed
        let racer = Arc::clone(&l2);
        let (tx, rx) = std::sync::mpsc::channel();
        *flows.before_remove.lock() = Some(Box::new(move || {
            let handle = std::thread::spawn(move || {
                racer.create_port("vpc1", "tap-b", "10.0.0.3", "fa:16:3e:00:00:03", 20)
            });
            std::thread::sleep(Duration::from_millis(50));
            tx.send(handle).unwrap();
        }));

        l2.delete_port("vpc1", "tap-a", 20).unwrap();
        let created = rx.recv().unwrap().join().unwrap();
        assert_eq!(created.unwrap(), PortProgramming::Programmed);

        let entry = registry.get_entry(20).unwrap();
        assert_eq!(entry.member_ports.iter().cloned().collect::<Vec<_>>(), vec!["tap-b".to_string()]);
        assert_eq!(
            dp.find_flow(BRIDGE_TUNNEL, &rules::tunnel_classifier_match(20)),
            Some(rules::tunnel_classifier(20, entry.local_tag))
        );
    }

    #[test]
    fn test_l2_neighbor_other_network_type_gets_own_transport() {
        let (dp, _, l2) = setup();
        l2.create_or_update_l2_neighbor("10.1.0.9", "fa:16:3e:00:01:09", "192.168.1.21", 77, NetworkType::Geneve)
            .unwrap();
        assert_eq!(dp.tunnel_port_type("geneve-generic"), Some(NetworkType::Geneve));
    }

    #[test]
    fn test_l2_neighbor_validation() {
        let (_, _, l2) = setup();
        assert!(l2
            .create_or_update_l2_neighbor("10.0.0.9", "fa:16:3e:00:00:09", "192.168.1.20", 5000, NetworkType::Vlan)
            .unwrap_err()
            .is_invalid_argument());
        assert!(l2
            .create_or_update_l2_neighbor("10.0.0.9", "", "192.168.1.20", 20, NetworkType::Vxlan)
            .unwrap_err()
            .is_invalid_argument());
        assert!(l2
            .delete_l2_neighbor("10.0.0.9", "fa:16:3e:00:00:09", 999)
            .unwrap_err()
            .is_not_found());
    }
}
