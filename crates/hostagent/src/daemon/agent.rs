//! HostAgent implementation.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::config::AgentConfig;
use crate::dataplane::{
    AddressResolutionClient, ArpResponder, ConnectionId, DhcpResponder, FlowTableClient,
    InMemoryDataplane, SwitchClients, SwitchTopologyClient,
};
use crate::goal_state::{GoalState, GoalStateHandler, GoalStateReply};
use crate::l2::L2Programmer;
use crate::l3::L3Programmer;
use crate::on_demand::{CompletionReceiver, OnDemandEngine, OrchestratorRpcClient, PacketInOutcome};
use crate::registry::TunnelRegistry;
use hostagent_common::{AgentError, AgentResult};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Everything the agent talks to outside its own state.
#[derive(Clone)]
pub struct HostAgentCollaborators {
    pub topology: Arc<dyn SwitchTopologyClient>,
    pub flows: Arc<dyn FlowTableClient>,
    pub address_resolution: Arc<dyn AddressResolutionClient>,
    pub arp_responder: Arc<dyn ArpResponder>,
    pub dhcp_responder: Arc<dyn DhcpResponder>,
    pub orchestrator: Arc<dyn OrchestratorRpcClient>,
}

impl HostAgentCollaborators {
    /// Backs every switch concern with one in-memory dataplane.
    pub fn in_memory(
        dataplane: Arc<InMemoryDataplane>,
        orchestrator: Arc<dyn OrchestratorRpcClient>,
    ) -> Self {
        Self {
            topology: dataplane.clone(),
            flows: dataplane.clone(),
            address_resolution: dataplane.clone(),
            arp_responder: dataplane.clone(),
            dhcp_responder: dataplane,
            orchestrator,
        }
    }

    fn switch_clients(&self) -> SwitchClients {
        SwitchClients {
            topology: Arc::clone(&self.topology),
            flows: Arc::clone(&self.flows),
            address_resolution: Arc::clone(&self.address_resolution),
        }
    }
}

/// The per-host agent.
///
/// Goal-state applies run on blocking workers; the completion drainer and
/// the pending-table sweeper run as tasks between [`HostAgent::start`] and
/// [`HostAgent::shutdown`].
pub struct HostAgent {
    config: AgentConfig,
    registry: Arc<TunnelRegistry>,
    l2: Arc<L2Programmer>,
    l3: Arc<L3Programmer>,
    handler: Arc<GoalStateHandler>,
    engine: Arc<OnDemandEngine>,
    completions: Mutex<Option<CompletionReceiver>>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl HostAgent {
    pub fn new(
        config: AgentConfig,
        collaborators: HostAgentCollaborators,
        completions: CompletionReceiver,
    ) -> Self {
        let registry = Arc::new(TunnelRegistry::new());
        let clients = collaborators.switch_clients();
        let l2 = Arc::new(L2Programmer::new(
            config.l2_config(),
            Arc::clone(&registry),
            clients.clone(),
        ));
        let l3 = Arc::new(L3Programmer::new(
            config.l3_config(),
            Arc::clone(&registry),
            clients.clone(),
            Arc::clone(&l2),
        ));
        let handler = Arc::new(GoalStateHandler::new(
            Arc::clone(&registry),
            Arc::clone(&l2),
            Arc::clone(&l3),
        ));
        let engine = Arc::new(OnDemandEngine::new(
            config.on_demand_config(),
            Arc::clone(&registry),
            &clients,
            collaborators.arp_responder,
            collaborators.dhcp_responder,
            collaborators.orchestrator,
        ));

        Self {
            config,
            registry,
            l2,
            l3,
            handler,
            engine,
            completions: Mutex::new(Some(completions)),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn l2(&self) -> &Arc<L2Programmer> {
        &self.l2
    }

    pub fn l3(&self) -> &Arc<L3Programmer> {
        &self.l3
    }

    pub fn engine(&self) -> &Arc<OnDemandEngine> {
        &self.engine
    }

    /// Spawns the background tasks. Must be called from within a runtime,
    /// and only once.
    pub fn start(&self) -> AgentResult<()> {
        let Some(completions) = self.completions.lock().take() else {
            return Err(AgentError::conflict("agent already started"));
        };

        if self.config.enable_on_demand {
            self.tasks.spawn(
                Arc::clone(&self.engine).run_completion_drainer(completions, self.cancel.clone()),
            );
            self.tasks
                .spawn(Arc::clone(&self.engine).run_sweeper(self.cancel.clone()));
        }

        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "HostAgent", "start")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({
                "host_ip": self.config.host_ip.map(|ip| ip.to_string()),
                "on_demand": self.config.enable_on_demand,
                "dry_run": self.config.dry_run,
            })));
        Ok(())
    }

    /// Applies one goal-state message on a blocking worker.
    pub async fn apply_goal_state(&self, goal_state: GoalState) -> AgentResult<GoalStateReply> {
        let handler = Arc::clone(&self.handler);
        tokio::task::spawn_blocking(move || handler.apply(&goal_state))
            .await
            .map_err(|e| AgentError::upstream("apply_goal_state", e.to_string()))
    }

    pub async fn on_packet_in(
        &self,
        ingress_port: u32,
        packet: &[u8],
        connection: ConnectionId,
    ) -> AgentResult<PacketInOutcome> {
        if !self.config.enable_on_demand {
            return Err(AgentError::conflict("on-demand resolution is disabled"));
        }
        self.engine.on_packet_in(ingress_port, packet, connection).await
    }

    /// Stops the background tasks and waits for in-flight replays.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "HostAgent", "shutdown")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({
                "tunnels": self.registry.len(),
                "ports": self.l2.port_count(),
                "routers": self.l3.router_count(),
                "abandoned_pending": self.engine.pending_count(),
            })));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal_state::{
        FixedIp, GatewayConfig, OperationType, PortConfiguration, PortState, SubnetConfiguration,
        SubnetState, UpdateKind,
    };
    use crate::on_demand::{completion_queue, ResolutionRequest};
    use async_trait::async_trait;
    use hostagent_common::{AggregateCode, OperationStatus};
    use hostagent_types::NetworkType;
    use pretty_assertions::assert_eq;

    struct AcceptingOrchestrator;

    #[async_trait]
    impl OrchestratorRpcClient for AcceptingOrchestrator {
        async fn request_resolution(&self, _request: ResolutionRequest) -> AgentResult<()> {
            Ok(())
        }
    }

    fn agent(config: AgentConfig) -> (Arc<InMemoryDataplane>, HostAgent) {
        let dp = Arc::new(InMemoryDataplane::new());
        let (_tx, rx) = completion_queue(16);
        let collaborators =
            HostAgentCollaborators::in_memory(Arc::clone(&dp), Arc::new(AcceptingOrchestrator));
        (dp, HostAgent::new(config, collaborators, rx))
    }

    fn one_port() -> GoalState {
        GoalState {
            port_states: vec![PortState {
                operation_type: OperationType::Create,
                configuration: PortConfiguration {
                    id: "0f1e2d3c4b5a".to_string(),
                    update_kind: UpdateKind::Full,
                    vpc_id: "vpc1".to_string(),
                    name: None,
                    mac_address: "fa:16:3e:00:00:02".to_string(),
                    fixed_ips: vec![FixedIp {
                        subnet_id: "sn1".to_string(),
                        ip_address: "10.0.0.2".to_string(),
                    }],
                },
            }],
            subnet_states: vec![SubnetState {
                operation_type: OperationType::Info,
                configuration: SubnetConfiguration {
                    id: "sn1".to_string(),
                    vpc_id: "vpc1".to_string(),
                    network_type: NetworkType::Vxlan,
                    cidr: "10.0.0.0/24".to_string(),
                    tunnel_id: 20,
                    gateway: GatewayConfig {
                        ip_address: "10.0.0.1".to_string(),
                        mac_address: "fa:16:3e:00:00:01".to_string(),
                    },
                    standby_gateway_id: None,
                },
            }],
            ..GoalState::default()
        }
    }

    #[tokio::test]
    async fn test_apply_goal_state_on_blocking_worker() {
        let (dp, agent) = agent(AgentConfig::default());
        agent.start().unwrap();

        let reply = agent.apply_goal_state(one_port()).await.unwrap();
        assert_eq!(reply.aggregate, AggregateCode::Success);
        assert_eq!(reply.status_of("0f1e2d3c4b5a"), Some(OperationStatus::Success));
        assert!(dp.port_tag("tap0f1e2d3c4b5").is_some());
        assert_eq!(agent.l2().port_count(), 1);

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_only_once() {
        let (_dp, agent) = agent(AgentConfig::default());
        agent.start().unwrap();
        assert!(matches!(agent.start(), Err(AgentError::Conflict { .. })));
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_packet_in_rejected_when_on_demand_disabled() {
        let (_dp, agent) = agent(AgentConfig {
            enable_on_demand: false,
            ..AgentConfig::default()
        });
        agent.start().unwrap();
        let result = agent.on_packet_in(1, &[0u8; 64], 1).await;
        assert!(matches!(result, Err(AgentError::Conflict { .. })));
        agent.shutdown().await;
    }
}
