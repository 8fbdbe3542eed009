//! Applies goal-state messages to the programmers.
//!
//! Ports go first, then routers, then neighbors, so an L3 neighbor always
//! finds the router that owns its subnet when both arrive together. Every
//! resource gets its own status; one failing resource never stops the rest.

use super::types::{
    FixedIp, GoalState, GoalStateReply, NeighborConfiguration, NeighborState, NeighborType,
    OperationType, PortState, ResourceStatus, ResourceType, RouterState,
};
use crate::l2::{L2Programmer, PortProgramming};
use crate::l3::{L3NeighborRequest, L3Programmer};
use crate::registry::TunnelRegistry;
use crate::validate;
use hostagent_common::{AgentError, AgentResult, AggregateCode, BatchOutcome, OperationStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Splits one resource's elapsed time into configuration and programming.
struct ResourceTimer {
    started: Instant,
    configured: Option<Instant>,
}

impl ResourceTimer {
    fn start() -> Self {
        Self {
            started: Instant::now(),
            configured: None,
        }
    }

    /// Marks the end of lookup and validation.
    fn configured(&mut self) {
        self.configured = Some(Instant::now());
    }

    /// (network configuration, dataplane programming, total)
    fn finish(&self) -> (Duration, Duration, Duration) {
        let now = Instant::now();
        let configured = self.configured.unwrap_or(now);
        (
            configured.duration_since(self.started),
            now.duration_since(configured),
            now.duration_since(self.started),
        )
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

pub struct GoalStateHandler {
    registry: Arc<TunnelRegistry>,
    l2: Arc<L2Programmer>,
    l3: Arc<L3Programmer>,
}

impl GoalStateHandler {
    pub fn new(registry: Arc<TunnelRegistry>, l2: Arc<L2Programmer>, l3: Arc<L3Programmer>) -> Self {
        Self { registry, l2, l3 }
    }

    pub fn apply(&self, goal_state: &GoalState) -> GoalStateReply {
        let started = Instant::now();
        let mut statuses = Vec::with_capacity(
            goal_state.port_states.len()
                + goal_state.router_states.len()
                + goal_state.neighbor_states.len(),
        );

        for state in &goal_state.port_states {
            let mut timer = ResourceTimer::start();
            let result = self.apply_port(state, goal_state, &mut timer);
            statuses.push(status_for(
                &state.configuration.id,
                ResourceType::Port,
                state.operation_type,
                result,
                &timer,
            ));
        }

        for state in &goal_state.router_states {
            let mut timer = ResourceTimer::start();
            let result = self.apply_router(state, goal_state, &mut timer);
            statuses.push(status_for(
                &state.configuration.id,
                ResourceType::Router,
                state.operation_type,
                result,
                &timer,
            ));
        }

        for state in &goal_state.neighbor_states {
            let mut timer = ResourceTimer::start();
            let result = self.apply_neighbor(state, goal_state, &mut timer);
            statuses.push(status_for(
                &state.configuration.id,
                ResourceType::Neighbor,
                state.operation_type,
                result,
                &timer,
            ));
        }

        let aggregate = AggregateCode::from_statuses(statuses.iter().map(|s| &s.status));
        let total_time_us = micros(started.elapsed());
        info_log!(
            "GoalStateHandler",
            resources = statuses.len(),
            aggregate = ?aggregate,
            total_time_us,
            "goal state applied"
        );

        GoalStateReply {
            statuses,
            aggregate,
            total_time_us,
        }
    }

    fn apply_port(
        &self,
        state: &PortState,
        goal_state: &GoalState,
        timer: &mut ResourceTimer,
    ) -> AgentResult<OperationStatus> {
        let port = &state.configuration;
        validate::required("port_id", &port.id)?;
        if state.operation_type == OperationType::Info {
            return Ok(OperationStatus::Success);
        }

        let fixed_ip = match port.fixed_ips.as_slice() {
            [only] => only,
            other => {
                return Err(AgentError::invalid_argument(
                    "fixed_ips",
                    format!("expected exactly one, got {}", other.len()),
                ))
            }
        };
        let subnet = goal_state
            .subnet(&fixed_ip.subnet_id)
            .ok_or_else(|| AgentError::not_found("subnet", &fixed_ip.subnet_id))?;
        let tunnel_id = validate::tunnel_id(subnet.network_type, subnet.tunnel_id)?;
        let port_name = port.port_name();
        timer.configured();

        if state.operation_type == OperationType::Delete {
            self.l2.delete_port(&port.vpc_id, &port_name, tunnel_id)?;
            return Ok(OperationStatus::Success);
        }

        let programmed = self.l2.create_port(
            &port.vpc_id,
            &port_name,
            &fixed_ip.ip_address,
            &port.mac_address,
            tunnel_id,
        )?;
        if let Some(gateway_id) = &subnet.standby_gateway_id {
            self.registry.set_standby_gateway(tunnel_id, gateway_id)?;
        }

        Ok(match programmed {
            PortProgramming::InProgress => OperationStatus::InProgress,
            PortProgramming::Programmed | PortProgramming::AlreadyProgrammed => {
                OperationStatus::Success
            }
        })
    }

    fn apply_router(
        &self,
        state: &RouterState,
        goal_state: &GoalState,
        timer: &mut ResourceTimer,
    ) -> AgentResult<OperationStatus> {
        let router = &state.configuration;
        let subnets = goal_state.subnet_configurations();
        timer.configured();

        match state.operation_type {
            OperationType::Create | OperationType::Update => {
                self.l3.create_or_update_router(router, &subnets)?
            }
            OperationType::Delete => self.l3.delete_router(&router.id)?,
            OperationType::Info => {}
        }
        Ok(OperationStatus::Success)
    }

    fn apply_neighbor(
        &self,
        state: &NeighborState,
        goal_state: &GoalState,
        timer: &mut ResourceTimer,
    ) -> AgentResult<OperationStatus> {
        let neighbor = &state.configuration;
        validate::required("neighbor_id", &neighbor.id)?;
        if state.operation_type == OperationType::Info {
            return Ok(OperationStatus::Success);
        }
        if neighbor.fixed_ips.is_empty() {
            return Err(AgentError::empty_field("fixed_ips"));
        }
        timer.configured();

        let mut outcome = BatchOutcome::new();
        for fixed_ip in &neighbor.fixed_ips {
            outcome.record(self.apply_neighbor_ip(
                state.operation_type,
                neighbor,
                fixed_ip,
                goal_state,
            ));
        }
        outcome.into_result("apply_neighbor")?;
        Ok(OperationStatus::Success)
    }

    /// An L3 neighbor is also an L2 neighbor inside its own subnet.
    fn apply_neighbor_ip(
        &self,
        operation: OperationType,
        neighbor: &NeighborConfiguration,
        fixed_ip: &FixedIp,
        goal_state: &GoalState,
    ) -> AgentResult<()> {
        let subnet = goal_state
            .subnet(&fixed_ip.subnet_id)
            .ok_or_else(|| AgentError::not_found("subnet", &fixed_ip.subnet_id))?;
        let tunnel_id = validate::tunnel_id(subnet.network_type, subnet.tunnel_id)?;
        let is_l3 = neighbor.neighbor_type == NeighborType::L3;

        if operation == OperationType::Delete {
            let mut outcome = BatchOutcome::new();
            if is_l3 {
                outcome.record(self.l3.delete_l3_neighbor(
                    &neighbor.id,
                    &fixed_ip.subnet_id,
                    &fixed_ip.ip_address,
                    tunnel_id,
                ));
            }
            outcome.record(self.l2.delete_l2_neighbor(
                &fixed_ip.ip_address,
                &neighbor.mac_address,
                tunnel_id,
            ));
            return outcome.into_result("delete_neighbor");
        }

        self.l2.create_or_update_l2_neighbor(
            &fixed_ip.ip_address,
            &neighbor.mac_address,
            &neighbor.host_ip_address,
            tunnel_id,
            subnet.network_type,
        )?;
        if is_l3 {
            self.l3.create_or_update_l3_neighbor(&L3NeighborRequest {
                neighbor_id: neighbor.id.clone(),
                vpc_id: neighbor.vpc_id.clone(),
                subnet_id: fixed_ip.subnet_id.clone(),
                virtual_ip: fixed_ip.ip_address.clone(),
                virtual_mac: neighbor.mac_address.clone(),
                remote_host_ip: neighbor.host_ip_address.clone(),
                tunnel_id,
            })?;
        }
        Ok(())
    }
}

fn status_for(
    resource_id: &str,
    resource_type: ResourceType,
    operation: OperationType,
    result: AgentResult<OperationStatus>,
    timer: &ResourceTimer,
) -> ResourceStatus {
    let status = match result {
        Ok(status) => status,
        Err(e) => {
            warn_log!(
                "GoalStateHandler",
                resource_id,
                resource_type = ?resource_type,
                operation = ?operation,
                error = %e,
                "resource not applied"
            );
            OperationStatus::from_error(&e)
        }
    };
    let (configuration, programming, total) = timer.finish();
    ResourceStatus {
        resource_id: resource_id.to_string(),
        resource_type,
        operation,
        status,
        dataplane_programming_time_us: micros(programming),
        network_configuration_time_us: micros(configuration),
        total_time_us: micros(total),
    }
}
