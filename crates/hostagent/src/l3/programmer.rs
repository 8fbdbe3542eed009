//! L3 programming logic.
//!
//! The whole router table sits behind one lock held for the full duration of
//! a router or L3 neighbor operation, switch calls included. Routers change
//! rarely, and this keeps neighbor programming consistent with the subnets
//! it reads.

use super::types::{
    L3NeighborRequest, L3ProgrammerConfig, L3ProgrammerStats, NeighborPort, RouterEntry,
    RoutingRule, SubnetRoutingTable,
};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::dataplane::rules::{self, L3Delivery, DVR_RESTORE_BRIDGE};
use crate::dataplane::{FlowMatch, FlowRule, SwitchClients, BRIDGE_TUNNEL};
use crate::goal_state::{
    OperationType, RouterConfiguration, RoutingRuleConfig, SubnetConfiguration, UpdateKind,
};
use crate::l2::L2Programmer;
use crate::registry::TunnelRegistry;
use crate::validate;
use hostagent_common::{AgentError, AgentResult, BatchOutcome, SyncMap};
use hostagent_types::{LocalTag, MacAddress, TunnelId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Programs routers and routed (L3) neighbors.
pub struct L3Programmer {
    config: L3ProgrammerConfig,
    registry: Arc<TunnelRegistry>,
    clients: SwitchClients,
    l2: Arc<L2Programmer>,
    routers: Mutex<SyncMap<String, RouterEntry>>,
    stats: Mutex<L3ProgrammerStats>,
}

/// Gateway rules of one subnet, in install order.
fn gateway_rules(
    tag: LocalTag,
    gateway_ip: Ipv4Addr,
    gateway_mac: MacAddress,
    host_dvr_mac: MacAddress,
) -> [(&'static str, FlowRule); 3] {
    [
        (BRIDGE_TUNNEL, rules::arp_responder(tag, gateway_ip, gateway_mac)),
        (BRIDGE_TUNNEL, rules::icmp_responder(tag, gateway_ip, gateway_mac)),
        (
            DVR_RESTORE_BRIDGE,
            rules::dvr_restore(tag, host_dvr_mac, gateway_mac),
        ),
    ]
}

impl L3Programmer {
    pub fn new(
        config: L3ProgrammerConfig,
        registry: Arc<TunnelRegistry>,
        clients: SwitchClients,
        l2: Arc<L2Programmer>,
    ) -> Self {
        Self {
            config,
            registry,
            clients,
            l2,
            routers: Mutex::new(SyncMap::new()),
            stats: Mutex::new(L3ProgrammerStats::default()),
        }
    }

    pub fn stats(&self) -> L3ProgrammerStats {
        self.stats.lock().clone()
    }

    pub fn get_router(&self, router_id: &str) -> Option<RouterEntry> {
        self.routers.lock().get_cloned(&router_id.to_string())
    }

    pub fn router_count(&self) -> usize {
        self.routers.lock().len()
    }

    /// The subnet as attached to whichever router owns it.
    pub fn find_subnet(&self, subnet_id: &str) -> Option<SubnetRoutingTable> {
        self.routers
            .lock()
            .values()
            .find_map(|r| r.subnets.get(subnet_id).cloned())
    }

    /// The DVR mac recorded for this host, once any router exists.
    pub fn host_dvr_mac(&self) -> Option<MacAddress> {
        self.routers.lock().values().next().map(|r| r.host_dvr_mac)
    }

    pub fn create_or_update_router(
        &self,
        router: &RouterConfiguration,
        subnets: &[SubnetConfiguration],
    ) -> AgentResult<()> {
        let result = self.apply_router(router, subnets);
        let audit = AuditRecord::new(
            AuditCategory::ResourceModify,
            "L3Programmer",
            "create_or_update_router",
        )
        .with_object_id(router.id.clone())
        .with_object_type("router")
        .with_details(serde_json::json!({
            "update_kind": router.update_kind,
            "subnets": router
                .subnet_routing_tables
                .iter()
                .map(|t| t.subnet_id.as_str())
                .collect::<Vec<_>>(),
        }));
        match &result {
            Ok(()) => {
                audit_log!(audit.with_outcome(AuditOutcome::Success));
            }
            Err(e) => {
                self.bump(|s| s.errors = s.errors.saturating_add(1));
                audit_log!(audit.with_error(e.to_string()));
            }
        }
        result
    }

    fn apply_router(
        &self,
        router: &RouterConfiguration,
        subnets: &[SubnetConfiguration],
    ) -> AgentResult<()> {
        validate::required("router_id", &router.id)?;
        let host_dvr_mac = validate::mac("host_dvr_mac_address", &router.host_dvr_mac_address)?;
        self.l2.ensure_bridges()?;

        let mut routers = self.routers.lock();
        if let Some((other, entry)) = routers.find(|_, r| r.host_dvr_mac != host_dvr_mac) {
            return Err(AgentError::conflict(format!(
                "router {} already uses host DVR mac {}, got {}",
                other, entry.host_dvr_mac, host_dvr_mac
            )));
        }

        let mut outcome = BatchOutcome::new();
        let existing = routers.remove(&router.id);
        let is_new = existing.is_none();
        let mut attached = match existing {
            Some(entry) if router.update_kind == UpdateKind::Full => {
                debug_log!("L3Programmer", router = %router.id, "full update, repopulating");
                for table in entry.subnets.values() {
                    outcome.absorb(self.teardown_subnet(entry.host_dvr_mac, table));
                }
                BTreeMap::new()
            }
            Some(entry) => entry.subnets,
            None => BTreeMap::new(),
        };

        for table_config in &router.subnet_routing_tables {
            let subnet_id = &table_config.subnet_id;
            let previous = attached.remove(subnet_id);
            let attach = self.attach_subnet(host_dvr_mac, subnet_id, subnets, previous.as_ref());
            let Some(mut table) = outcome.record(attach) else {
                warn_log!("L3Programmer", router = %router.id, subnet = %subnet_id, "subnet not attached");
                // A failed re-attach keeps the subnet as it was.
                if let Some(previous) = previous {
                    attached.insert(subnet_id.clone(), previous);
                }
                continue;
            };

            for rule in &table_config.routing_rules {
                if outcome.record(apply_routing_rule(&mut table, rule)).is_some() {
                    self.bump(|s| s.routing_rules_applied = s.routing_rules_applied.saturating_add(1));
                }
            }
            attached.insert(subnet_id.clone(), table);
        }

        routers.insert(
            router.id.clone(),
            RouterEntry {
                router_id: router.id.clone(),
                host_dvr_mac,
                subnets: attached,
            },
        );
        drop(routers);

        self.bump(|s| {
            if is_new {
                s.routers_created = s.routers_created.saturating_add(1);
            } else {
                s.routers_updated = s.routers_updated.saturating_add(1);
            }
        });
        outcome.into_result("create_or_update_router")
    }

    /// Validates one subnet and installs its gateway rules. A re-seen subnet
    /// keeps its gateway and its rule and neighbor bookkeeping.
    fn attach_subnet(
        &self,
        host_dvr_mac: MacAddress,
        subnet_id: &str,
        subnets: &[SubnetConfiguration],
        previous: Option<&SubnetRoutingTable>,
    ) -> AgentResult<SubnetRoutingTable> {
        validate::required("subnet_id", subnet_id)?;
        let config = subnets
            .iter()
            .find(|s| s.id == subnet_id)
            .ok_or_else(|| AgentError::not_found("subnet", subnet_id))?;

        validate::required("vpc_id", &config.vpc_id)?;
        let tunnel_id = validate::tunnel_id(config.network_type, config.tunnel_id)?;
        let cidr = validate::cidr("cidr", &config.cidr)?;
        let mut gateway_ip = validate::ipv4("gateway_ip", &config.gateway.ip_address)?;
        let mut gateway_mac = validate::mac("gateway_mac", &config.gateway.mac_address)?;

        if let Some(previous) = previous {
            if previous.gateway_ip != gateway_ip || previous.gateway_mac != gateway_mac {
                warn_log!(
                    "L3Programmer",
                    subnet = %subnet_id,
                    "gateway change ignored; detach and reattach the subnet to apply it"
                );
                gateway_ip = previous.gateway_ip;
                gateway_mac = previous.gateway_mac;
            }
        }

        let local_tag = self.registry.get_or_create_tag(tunnel_id)?;
        // A re-seen subnet's rules are live; a failed reinstall leaves them be.
        self.install_gateway(local_tag, gateway_ip, gateway_mac, host_dvr_mac, previous.is_none())?;
        if previous.is_none() {
            self.bump(|s| s.subnets_attached = s.subnets_attached.saturating_add(1));
        }

        Ok(SubnetRoutingTable {
            subnet_id: subnet_id.to_string(),
            vpc_id: config.vpc_id.clone(),
            network_type: config.network_type,
            cidr,
            tunnel_id,
            local_tag,
            gateway_ip,
            gateway_mac,
            routing_rules: previous.map(|p| p.routing_rules.clone()).unwrap_or_default(),
            neighbor_ports: previous.map(|p| p.neighbor_ports.clone()).unwrap_or_default(),
        })
    }

    /// Installs the gateway ARP entry and rules. With `rollback`, a failure
    /// removes what was installed so far.
    fn install_gateway(
        &self,
        tag: LocalTag,
        gateway_ip: Ipv4Addr,
        gateway_mac: MacAddress,
        host_dvr_mac: MacAddress,
        rollback: bool,
    ) -> AgentResult<()> {
        self.clients
            .address_resolution
            .upsert(gateway_ip, gateway_mac, tag)?;

        let steps = gateway_rules(tag, gateway_ip, gateway_mac, host_dvr_mac);
        for (done, (bridge, rule)) in steps.iter().enumerate() {
            if let Err(e) = self.clients.flows.install(bridge, rule) {
                if !rollback {
                    return Err(e);
                }
                for (bridge, rule) in &steps[..done] {
                    if let Err(rollback) = self.clients.flows.remove(bridge, &rule.flow_match, true) {
                        warn_log!("L3Programmer", rule = %rule.flow_match, error = %rollback, "rollback failed");
                    }
                }
                if let Err(rollback) = self
                    .clients
                    .address_resolution
                    .remove(gateway_ip, gateway_mac, tag)
                {
                    warn_log!("L3Programmer", gateway_ip = %gateway_ip, error = %rollback, "rollback failed");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn teardown_subnet(&self, host_dvr_mac: MacAddress, table: &SubnetRoutingTable) -> BatchOutcome {
        let mut outcome = BatchOutcome::new();
        outcome.record(self.clients.address_resolution.remove(
            table.gateway_ip,
            table.gateway_mac,
            table.local_tag,
        ));
        let matches: [(&str, FlowMatch); 3] = [
            (BRIDGE_TUNNEL, rules::arp_responder_match(table.local_tag, table.gateway_ip)),
            (BRIDGE_TUNNEL, rules::icmp_responder_match(table.local_tag, table.gateway_ip)),
            (
                DVR_RESTORE_BRIDGE,
                rules::dvr_restore_match(table.local_tag, host_dvr_mac),
            ),
        ];
        for (bridge, flow_match) in &matches {
            outcome.record(self.clients.flows.remove(bridge, flow_match, true));
        }
        if !outcome.is_success() {
            warn_log!(
                "L3Programmer",
                subnet = %table.subnet_id,
                failures = outcome.failures().len(),
                "subnet teardown incomplete"
            );
        }
        self.bump(|s| s.subnets_detached = s.subnets_detached.saturating_add(1));
        outcome
    }

    pub fn delete_router(&self, router_id: &str) -> AgentResult<()> {
        validate::required("router_id", router_id)?;
        let mut routers = self.routers.lock();
        let Some(entry) = routers.remove(&router_id.to_string()) else {
            return Err(AgentError::not_found("router", router_id));
        };

        let mut outcome = BatchOutcome::new();
        for table in entry.subnets.values() {
            outcome.absorb(self.teardown_subnet(entry.host_dvr_mac, table));
        }
        drop(routers);

        let result = outcome.into_result("delete_router");
        self.bump(|s| s.routers_deleted = s.routers_deleted.saturating_add(1));
        let audit = AuditRecord::new(AuditCategory::ResourceDelete, "L3Programmer", "delete_router")
            .with_object_id(router_id)
            .with_object_type("router")
            .with_details(serde_json::json!({
                "subnets": entry.subnets.keys().collect::<Vec<_>>(),
            }));
        match &result {
            Ok(()) => {
                audit_log!(audit.with_outcome(AuditOutcome::Success));
            }
            Err(e) => {
                self.bump(|s| s.errors = s.errors.saturating_add(1));
                audit_log!(audit.with_error(e.to_string()));
            }
        }
        result
    }

    pub fn create_or_update_l3_neighbor(&self, request: &L3NeighborRequest) -> AgentResult<()> {
        validate::required("neighbor_id", &request.neighbor_id)?;
        validate::required("vpc_id", &request.vpc_id)?;
        validate::required("subnet_id", &request.subnet_id)?;
        let virtual_ip = validate::ipv4("virtual_ip", &request.virtual_ip)?;
        let virtual_mac = validate::mac("virtual_mac", &request.virtual_mac)?;
        let host_ip = validate::ipv4("remote_host_ip", &request.remote_host_ip)?;
        if request.tunnel_id == 0 {
            return Err(AgentError::invalid_argument("tunnel_id", "must be non-zero"));
        }

        self.l2.ensure_bridges()?;

        let mut routers = self.routers.lock();
        let Some(router) = routers
            .values_mut()
            .find(|r| r.subnets.contains_key(&request.subnet_id))
        else {
            return Err(AgentError::not_found("router for subnet", &request.subnet_id));
        };

        let host_dvr_mac = router.host_dvr_mac;
        let Some(destination) = router.subnets.get(&request.subnet_id) else {
            return Err(AgentError::not_found("subnet", &request.subnet_id));
        };
        if destination.tunnel_id != request.tunnel_id {
            warn_log!(
                "L3Programmer",
                neighbor = %request.neighbor_id,
                subnet_tunnel = destination.tunnel_id,
                neighbor_tunnel = request.tunnel_id,
                "neighbor tunnel differs from its subnet"
            );
        }
        let destination_tag = destination.local_tag;
        let delivery = if self.config.local_host_ip == Some(host_ip) {
            L3Delivery::Local {
                destination_gateway_mac: destination.gateway_mac,
            }
        } else {
            L3Delivery::Remote { host_dvr_mac }
        };

        let mut outcome = BatchOutcome::new();
        for source in router.subnets.values() {
            if source.subnet_id == request.subnet_id {
                continue;
            }
            let rule = rules::l3_neighbor(
                source.local_tag,
                source.gateway_mac,
                destination_tag,
                virtual_ip,
                virtual_mac,
                delivery,
            );
            outcome.record(self.clients.flows.install(BRIDGE_TUNNEL, &rule));
        }

        if let Some(destination) = router.subnets.get_mut(&request.subnet_id) {
            destination.neighbor_ports.insert(
                request.neighbor_id.clone(),
                NeighborPort {
                    virtual_ip,
                    virtual_mac,
                    host_ip,
                },
            );
        }
        let router_id = router.router_id.clone();
        drop(routers);

        let rules_installed = outcome.total() - outcome.failures().len();
        let result = outcome.into_result("create_or_update_l3_neighbor");
        let audit = AuditRecord::new(
            AuditCategory::ResourceCreate,
            "L3Programmer",
            "create_l3_neighbor",
        )
        .with_object_id(request.neighbor_id.clone())
        .with_object_type("l3_neighbor")
        .with_details(serde_json::json!({
            "router_id": router_id,
            "subnet_id": request.subnet_id,
            "virtual_ip": virtual_ip.to_string(),
            "local": matches!(delivery, L3Delivery::Local { .. }),
            "rules_installed": rules_installed,
        }));
        match &result {
            Ok(()) => {
                self.bump(|s| s.l3_neighbors_programmed = s.l3_neighbors_programmed.saturating_add(1));
                audit_log!(audit.with_outcome(AuditOutcome::Success));
            }
            Err(e) => {
                self.bump(|s| s.errors = s.errors.saturating_add(1));
                audit_log!(audit.with_error(e.to_string()));
            }
        }
        result
    }

    pub fn delete_l3_neighbor(
        &self,
        neighbor_id: &str,
        subnet_id: &str,
        virtual_ip: &str,
        tunnel_id: TunnelId,
    ) -> AgentResult<()> {
        validate::required("neighbor_id", neighbor_id)?;
        validate::required("subnet_id", subnet_id)?;
        let virtual_ip = validate::ipv4("virtual_ip", virtual_ip)?;

        let mut routers = self.routers.lock();
        let Some(router) = routers
            .values_mut()
            .find(|r| r.subnets.contains_key(subnet_id))
        else {
            return Err(AgentError::not_found("router for subnet", subnet_id));
        };

        let mut outcome = BatchOutcome::new();
        for source in router.subnets.values() {
            if source.subnet_id == subnet_id {
                continue;
            }
            outcome.record(self.clients.flows.remove(
                BRIDGE_TUNNEL,
                &rules::l3_neighbor_match(source.local_tag, virtual_ip, source.gateway_mac),
                true,
            ));
        }
        if let Some(destination) = router.subnets.get_mut(subnet_id) {
            destination.neighbor_ports.remove(neighbor_id);
        }
        drop(routers);

        let result = outcome.into_result("delete_l3_neighbor");
        let audit = AuditRecord::new(
            AuditCategory::ResourceDelete,
            "L3Programmer",
            "delete_l3_neighbor",
        )
        .with_object_id(neighbor_id)
        .with_object_type("l3_neighbor")
        .with_details(serde_json::json!({
            "subnet_id": subnet_id,
            "virtual_ip": virtual_ip.to_string(),
            "tunnel_id": tunnel_id,
        }));
        match &result {
            Ok(()) => {
                self.bump(|s| s.l3_neighbors_removed = s.l3_neighbors_removed.saturating_add(1));
                audit_log!(audit.with_outcome(AuditOutcome::Success));
            }
            Err(e) => {
                self.bump(|s| s.errors = s.errors.saturating_add(1));
                audit_log!(audit.with_error(e.to_string()));
            }
        }
        result
    }

    fn bump(&self, f: impl FnOnce(&mut L3ProgrammerStats)) {
        f(&mut self.stats.lock());
    }
}

fn apply_routing_rule(table: &mut SubnetRoutingTable, rule: &RoutingRuleConfig) -> AgentResult<()> {
    validate::required("routing_rule_id", &rule.id)?;
    if rule.operation_type == OperationType::Delete {
        return table
            .routing_rules
            .remove(&rule.id)
            .map(|_| ())
            .ok_or_else(|| AgentError::not_found("routing rule", &rule.id));
    }

    let next_hop_mac = if rule.next_hop_mac.is_empty() {
        None
    } else {
        Some(validate::mac("next_hop_mac", &rule.next_hop_mac)?)
    };
    table.routing_rules.insert(
        rule.id.clone(),
        RoutingRule {
            id: rule.id.clone(),
            destination: validate::cidr("destination", &rule.destination)?,
            next_hop_ip: validate::ipv4("next_hop_ip", &rule.next_hop_ip)?,
            priority: rule.priority,
            destination_type: rule.destination_type,
            next_hop_mac,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::{FaultPoint, InMemoryDataplane};
    use crate::goal_state::{DestinationType, GatewayConfig, SubnetRoutingTableConfig};
    use crate::l2::L2ProgrammerConfig;
    use hostagent_types::NetworkType;
    use pretty_assertions::assert_eq;

    const DVR_MAC: &str = "fe:16:11:00:00:01";
    const LOCAL_HOST: &str = "192.168.1.10";

    struct Fixture {
        dp: Arc<InMemoryDataplane>,
        registry: Arc<TunnelRegistry>,
        l3: L3Programmer,
    }

    fn fixture() -> Fixture {
        let dp = Arc::new(InMemoryDataplane::new());
        let registry = Arc::new(TunnelRegistry::new());
        let clients = SwitchClients::in_memory(Arc::clone(&dp));
        let l2 = Arc::new(L2Programmer::new(
            L2ProgrammerConfig::default(),
            Arc::clone(&registry),
            clients.clone(),
        ));
        let l3 = L3Programmer::new(
            L3ProgrammerConfig {
                local_host_ip: Some(LOCAL_HOST.parse().unwrap()),
            },
            Arc::clone(&registry),
            clients,
            l2,
        );
        Fixture { dp, registry, l3 }
    }

    fn subnet(id: &str, tunnel_id: u32, third_octet: u8) -> SubnetConfiguration {
        SubnetConfiguration {
            id: id.to_string(),
            vpc_id: "vpc1".to_string(),
            network_type: NetworkType::Vxlan,
            cidr: format!("10.0.{}.0/24", third_octet),
            tunnel_id,
            gateway: GatewayConfig {
                ip_address: format!("10.0.{}.1", third_octet),
                mac_address: format!("fa:16:3e:00:{:02x}:01", third_octet),
            },
            standby_gateway_id: None,
        }
    }

    fn router(id: &str, dvr_mac: &str, subnet_ids: &[&str]) -> RouterConfiguration {
        RouterConfiguration {
            id: id.to_string(),
            update_kind: UpdateKind::Full,
            host_dvr_mac_address: dvr_mac.to_string(),
            subnet_routing_tables: subnet_ids
                .iter()
                .map(|s| SubnetRoutingTableConfig {
                    subnet_id: s.to_string(),
                    routing_rules: vec![],
                })
                .collect(),
        }
    }

    fn routing_rule(id: &str, op: OperationType) -> RoutingRuleConfig {
        RoutingRuleConfig {
            id: id.to_string(),
            operation_type: op,
            destination: "0.0.0.0/0".to_string(),
            next_hop_ip: "10.0.1.254".to_string(),
            priority: 10,
            destination_type: DestinationType::Internet,
            next_hop_mac: String::new(),
        }
    }

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_router_installs_gateway_rules() {
        let f = fixture();
        let subnets = vec![subnet("sn1", 20, 1), subnet("sn2", 30, 2)];
        f.l3
            .create_or_update_router(&router("r1", DVR_MAC, &["sn1", "sn2"]), &subnets)
            .unwrap();

        let tag = f.registry.get_tag(20).unwrap();
        let gw_mac = mac("fa:16:3e:00:01:01");
        assert_eq!(f.dp.arp_entry(ip("10.0.1.1"), tag), Some(gw_mac));
        assert!(f
            .dp
            .find_flow(BRIDGE_TUNNEL, &rules::icmp_responder_match(tag, ip("10.0.1.1")))
            .is_some());
        assert_eq!(
            f.dp.find_flow(DVR_RESTORE_BRIDGE, &rules::dvr_restore_match(tag, mac(DVR_MAC))),
            Some(rules::dvr_restore(tag, mac(DVR_MAC), gw_mac))
        );

        let entry = f.l3.get_router("r1").unwrap();
        assert_eq!(entry.subnets.len(), 2);
        assert_eq!(entry.subnets["sn2"].local_tag, f.registry.get_tag(30).unwrap());
        assert_eq!(f.l3.host_dvr_mac(), Some(mac(DVR_MAC)));
    }

    #[test]
    fn test_second_router_with_other_dvr_mac_conflicts() {
        let f = fixture();
        let subnets = vec![subnet("sn1", 20, 1), subnet("sn2", 30, 2)];
        f.l3
            .create_or_update_router(&router("r1", DVR_MAC, &["sn1"]), &subnets)
            .unwrap();
        let before = f.l3.get_router("r1").unwrap();
        let flows_before = f.dp.flow_count(BRIDGE_TUNNEL);

        let err = f
            .l3
            .create_or_update_router(&router("r2", "fe:16:11:00:00:02", &["sn2"]), &subnets)
            .unwrap_err();
        assert!(matches!(err, AgentError::Conflict { .. }));
        assert_eq!(f.l3.get_router("r1"), Some(before));
        assert!(f.l3.get_router("r2").is_none());
        assert_eq!(f.dp.flow_count(BRIDGE_TUNNEL), flows_before);
    }

    #[test]
    fn test_invalid_dvr_mac() {
        let f = fixture();
        let err = f
            .l3
            .create_or_update_router(&router("r1", "not-a-mac", &[]), &[])
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_missing_subnet_record_is_partial_failure() {
        let f = fixture();
        let subnets = vec![subnet("sn1", 20, 1)];
        let err = f
            .l3
            .create_or_update_router(&router("r1", DVR_MAC, &["missing", "sn1"]), &subnets)
            .unwrap_err();
        assert!(matches!(err, AgentError::PartialFailure { .. }));

        let entry = f.l3.get_router("r1").unwrap();
        assert_eq!(entry.subnets.keys().collect::<Vec<_>>(), vec!["sn1"]);
        let tag = f.registry.get_tag(20).unwrap();
        assert!(f
            .dp
            .find_flow(BRIDGE_TUNNEL, &rules::arp_responder_match(tag, ip("10.0.1.1")))
            .is_some());
    }

    #[test]
    fn test_invalid_tunnel_fails_only_that_subnet() {
        let f = fixture();
        let mut bad = subnet("sn2", 5000, 2);
        bad.network_type = NetworkType::Vlan;
        let subnets = vec![subnet("sn1", 20, 1), bad];
        assert!(f
            .l3
            .create_or_update_router(&router("r1", DVR_MAC, &["sn1", "sn2"]), &subnets)
            .is_err());
        assert_eq!(f.l3.get_router("r1").unwrap().subnets.len(), 1);
    }

    #[test]
    fn test_install_failure_rolls_back_subnet() {
        let f = fixture();
        f.l3
            .create_or_update_router(&router("r1", DVR_MAC, &[]), &[])
            .unwrap();
        let flows_before = f.dp.flow_count(BRIDGE_TUNNEL);

        f.dp.inject_fault(FaultPoint::Install, 1);
        assert!(f
            .l3
            .create_or_update_router(&router("r1", DVR_MAC, &["sn1"]), &[subnet("sn1", 20, 1)])
            .is_err());
        assert_eq!(f.dp.flow_count(BRIDGE_TUNNEL), flows_before);
        assert_eq!(f.dp.arp_entry_count(), 0);
    }

    #[test]
    fn test_routing_rules_by_id() {
        let f = fixture();
        let subnets = vec![subnet("sn1", 20, 1)];
        let mut config = router("r1", DVR_MAC, &["sn1"]);
        config.subnet_routing_tables[0].routing_rules = vec![
            routing_rule("rt1", OperationType::Create),
            routing_rule("rt2", OperationType::Create),
        ];
        f.l3.create_or_update_router(&config, &subnets).unwrap();
        assert_eq!(f.l3.find_subnet("sn1").unwrap().routing_rules.len(), 2);

        config.update_kind = UpdateKind::Delta;
        config.subnet_routing_tables[0].routing_rules = vec![
            routing_rule("rt1", OperationType::Delete),
            routing_rule("nope", OperationType::Delete),
        ];
        let err = f.l3.create_or_update_router(&config, &subnets).unwrap_err();
        assert!(matches!(err, AgentError::PartialFailure { .. }));

        let table = f.l3.find_subnet("sn1").unwrap();
        assert_eq!(table.routing_rules.keys().collect::<Vec<_>>(), vec!["rt2"]);
        assert_eq!(table.routing_rules["rt2"].next_hop_ip, ip("10.0.1.254"));
    }

    #[test]
    fn test_delta_keeps_unrelated_subnets() {
        let f = fixture();
        let subnets = vec![subnet("sn1", 20, 1), subnet("sn2", 30, 2)];
        f.l3
            .create_or_update_router(&router("r1", DVR_MAC, &["sn1"]), &subnets)
            .unwrap();

        let mut delta = router("r1", DVR_MAC, &["sn2"]);
        delta.update_kind = UpdateKind::Delta;
        f.l3.create_or_update_router(&delta, &subnets).unwrap();
        assert_eq!(f.l3.get_router("r1").unwrap().subnets.len(), 2);

        // FULL repopulates from scratch
        f.l3
            .create_or_update_router(&router("r1", DVR_MAC, &["sn2"]), &subnets)
            .unwrap();
        assert_eq!(f.l3.get_router("r1").unwrap().subnets.len(), 1);
        let tag = f.registry.get_tag(20).unwrap();
        assert!(f
            .dp
            .find_flow(DVR_RESTORE_BRIDGE, &rules::dvr_restore_match(tag, mac(DVR_MAC)))
            .is_none());
    }

    #[test]
    fn test_delete_router() {
        let f = fixture();
        assert!(f.l3.delete_router("ghost").unwrap_err().is_not_found());

        let subnets = vec![subnet("sn1", 20, 1), subnet("sn2", 30, 2)];
        f.l3
            .create_or_update_router(&router("r1", DVR_MAC, &["sn1", "sn2"]), &subnets)
            .unwrap();
        f.dp.inject_fault(FaultPoint::Remove, 1);

        let err = f.l3.delete_router("r1").unwrap_err();
        assert!(matches!(err, AgentError::PartialFailure { .. }));
        assert!(f.l3.get_router("r1").is_none());

        let tag2 = f.registry.get_tag(30).unwrap();
        assert!(f
            .dp
            .find_flow(BRIDGE_TUNNEL, &rules::icmp_responder_match(tag2, ip("10.0.2.1")))
            .is_none());
        assert_eq!(f.dp.arp_entry_count(), 0);
    }

    #[test]
    fn test_l3_neighbor_remote_and_local() {
        let f = fixture();
        let subnets = vec![subnet("sn1", 20, 1), subnet("sn2", 30, 2)];
        f.l3
            .create_or_update_router(&router("r1", DVR_MAC, &["sn1", "sn2"]), &subnets)
            .unwrap();
        let tag1 = f.registry.get_tag(20).unwrap();
        let tag2 = f.registry.get_tag(30).unwrap();

        let mut request = L3NeighborRequest {
            neighbor_id: "n1".to_string(),
            vpc_id: "vpc1".to_string(),
            subnet_id: "sn2".to_string(),
            virtual_ip: "10.0.2.5".to_string(),
            virtual_mac: "fa:16:3e:00:02:05".to_string(),
            remote_host_ip: "192.168.1.20".to_string(),
            tunnel_id: 30,
        };
        f.l3.create_or_update_l3_neighbor(&request).unwrap();

        let gw1 = mac("fa:16:3e:00:01:01");
        let rule_match = rules::l3_neighbor_match(tag1, ip("10.0.2.5"), gw1);
        assert_eq!(
            f.dp.find_flow(BRIDGE_TUNNEL, &rule_match),
            Some(rules::l3_neighbor(
                tag1,
                gw1,
                tag2,
                ip("10.0.2.5"),
                mac("fa:16:3e:00:02:05"),
                L3Delivery::Remote {
                    host_dvr_mac: mac(DVR_MAC)
                }
            ))
        );
        // nothing is installed with the destination subnet as source
        let gw2 = mac("fa:16:3e:00:02:01");
        assert!(f
            .dp
            .find_flow(BRIDGE_TUNNEL, &rules::l3_neighbor_match(tag2, ip("10.0.2.5"), gw2))
            .is_none());
        assert!(f.l3.find_subnet("sn2").unwrap().neighbor_ports.contains_key("n1"));

        request.remote_host_ip = LOCAL_HOST.to_string();
        f.l3.create_or_update_l3_neighbor(&request).unwrap();
        let rule = f.dp.find_flow(BRIDGE_TUNNEL, &rule_match).unwrap();
        assert_eq!(
            rule,
            rules::l3_neighbor(
                tag1,
                gw1,
                tag2,
                ip("10.0.2.5"),
                mac("fa:16:3e:00:02:05"),
                L3Delivery::Local {
                    destination_gateway_mac: gw2
                }
            )
        );

        f.l3.delete_l3_neighbor("n1", "sn2", "10.0.2.5", 30).unwrap();
        assert!(f.dp.find_flow(BRIDGE_TUNNEL, &rule_match).is_none());
        assert!(f.l3.find_subnet("sn2").unwrap().neighbor_ports.is_empty());
    }

    #[test]
    fn test_l3_neighbor_without_router() {
        let f = fixture();
        let request = L3NeighborRequest {
            neighbor_id: "n1".to_string(),
            vpc_id: "vpc1".to_string(),
            subnet_id: "sn9".to_string(),
            virtual_ip: "10.0.9.5".to_string(),
            virtual_mac: "fa:16:3e:00:09:05".to_string(),
            remote_host_ip: "192.168.1.20".to_string(),
            tunnel_id: 90,
        };
        assert!(f.l3.create_or_update_l3_neighbor(&request).unwrap_err().is_not_found());
        assert!(f.l3.delete_l3_neighbor("n1", "sn9", "10.0.9.5", 90).unwrap_err().is_not_found());

        let mut bad = request.clone();
        bad.vpc_id = String::new();
        assert!(f.l3.create_or_update_l3_neighbor(&bad).unwrap_err().is_invalid_argument());
    }
}
