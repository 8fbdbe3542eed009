//! On-demand resolution engine.
//!
//! A packet-in whose destination has no local rule is buffered under a fresh
//! request id and the orchestrator is asked to push the missing goal state.
//! The reply, delivered on the completion queue, either replays the packet
//! or drops it. Entries whose reply never comes are swept after
//! [`OnDemandConfig::expiration`].
//!
//! The pending entry is inserted before the request is sent, so a reply can
//! never arrive for an id the table does not know yet.

use super::packet::{self, ParsedPacket, ARP_OP_REQUEST};
use super::types::{
    OnDemandConfig, OnDemandStats, PacketInOutcome, PendingResolution, Protocol, ReplyDisposition,
    ResolutionKey, ResolutionReply, ResolutionRequest,
};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::dataplane::{
    AddressResolutionClient, ArpResponder, ConnectionId, DhcpResponder, SwitchClients,
    SwitchTopologyClient, BRIDGE_TUNNEL,
};
use crate::registry::TunnelRegistry;
use async_trait::async_trait;
use hostagent_common::{AgentError, AgentResult, OperationStatus, SyncMap};
use hostagent_types::LocalTag;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Asks the orchestrator to push the goal state behind a resolution key.
///
/// The call only submits the request; the answer comes back later on the
/// completion queue.
#[async_trait]
pub trait OrchestratorRpcClient: Send + Sync {
    async fn request_resolution(&self, request: ResolutionRequest) -> AgentResult<()>;
}

pub type CompletionSender = mpsc::Sender<ResolutionReply>;
pub type CompletionReceiver = mpsc::Receiver<ResolutionReply>;

/// Channel the orchestrator client delivers replies on.
pub fn completion_queue(capacity: usize) -> (CompletionSender, CompletionReceiver) {
    mpsc::channel(capacity)
}

pub struct OnDemandEngine {
    config: OnDemandConfig,
    registry: Arc<TunnelRegistry>,
    topology: Arc<dyn SwitchTopologyClient>,
    address_resolution: Arc<dyn AddressResolutionClient>,
    arp_responder: Arc<dyn ArpResponder>,
    dhcp_responder: Arc<dyn DhcpResponder>,
    orchestrator: Arc<dyn OrchestratorRpcClient>,
    pending: Mutex<SyncMap<Uuid, PendingResolution>>,
    replays: TaskTracker,
    stats: Mutex<OnDemandStats>,
}

impl OnDemandEngine {
    pub fn new(
        config: OnDemandConfig,
        registry: Arc<TunnelRegistry>,
        clients: &SwitchClients,
        arp_responder: Arc<dyn ArpResponder>,
        dhcp_responder: Arc<dyn DhcpResponder>,
        orchestrator: Arc<dyn OrchestratorRpcClient>,
    ) -> Self {
        Self {
            config,
            registry,
            topology: Arc::clone(&clients.topology),
            address_resolution: Arc::clone(&clients.address_resolution),
            arp_responder,
            dhcp_responder,
            orchestrator,
            pending: Mutex::new(SyncMap::new()),
            replays: TaskTracker::new(),
            stats: Mutex::new(OnDemandStats::default()),
        }
    }

    pub fn stats(&self) -> OnDemandStats {
        self.stats.lock().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, request_id: &Uuid) -> bool {
        self.pending.lock().contains_key(request_id)
    }

    fn bump(&self, f: impl FnOnce(&mut OnDemandStats)) {
        f(&mut self.stats.lock());
    }

    fn drop_packet(&self, ingress_port: u32, err: AgentError) -> AgentError {
        self.bump(|s| s.dropped = s.dropped.saturating_add(1));
        debug_log!("OnDemandEngine", ingress_port, error = %err, "packet-in dropped");
        err
    }

    /// Handles one packet-in the switch could not forward.
    pub async fn on_packet_in(
        &self,
        ingress_port: u32,
        packet: &[u8],
        connection: ConnectionId,
    ) -> AgentResult<PacketInOutcome> {
        let parsed = packet::parse(packet).map_err(|e| {
            self.drop_packet(ingress_port, AgentError::invalid_argument("packet", e.to_string()))
        })?;

        if parsed.is_dhcp() {
            self.dhcp_responder.handle(connection, ingress_port, packet)?;
            self.bump(|s| s.dhcp_forwarded = s.dhcp_forwarded.saturating_add(1));
            return Ok(PacketInOutcome::ForwardedToDhcp);
        }

        let key = self
            .resolution_key(&parsed)
            .map_err(|e| self.drop_packet(ingress_port, e))?;
        let tunnel_id = self
            .registry
            .tag_to_tunnel(key.vlan_tag)
            .ok_or_else(|| {
                self.drop_packet(ingress_port, AgentError::not_found("tunnel for tag", key.vlan_tag))
            })?;

        let request_id = Uuid::new_v4();
        self.buffer(PendingResolution {
            request_id,
            ingress_port,
            packet: packet.to_vec(),
            key,
            tunnel_id,
            connection,
            inserted_at: Instant::now(),
        })
        .await
        .map_err(|e| self.drop_packet(ingress_port, e))?;

        let request = ResolutionRequest {
            request_id,
            tunnel_id,
            key,
        };
        if let Err(e) = self.orchestrator.request_resolution(request).await {
            self.pending.lock().remove(&request_id);
            self.bump(|s| s.requests_failed = s.requests_failed.saturating_add(1));
            let err = match e {
                AgentError::Upstream { .. } => e,
                other => AgentError::upstream("request_resolution", other.to_string()),
            };
            return Err(self.drop_packet(ingress_port, err));
        }

        debug_log!(
            "OnDemandEngine",
            request_id = %request_id,
            tunnel_id,
            protocol = %key.protocol,
            dst = %key.dst_ip,
            "resolution requested"
        );
        Ok(PacketInOutcome::Buffered(request_id))
    }

    fn resolution_key(&self, parsed: &ParsedPacket) -> AgentResult<ResolutionKey> {
        let vlan = parsed
            .vlan()
            .ok_or_else(|| AgentError::invalid_argument("vlan", "packet-in carries no local tag"))?;
        let vlan_tag = LocalTag::from_tci(vlan).map_err(|e| AgentError::from_parse("vlan", e))?;

        match *parsed {
            ParsedPacket::Arp { op, .. } if op != ARP_OP_REQUEST => Err(AgentError::invalid_argument(
                "arp_op",
                format!("only requests are resolved, got op {}", op),
            )),
            ParsedPacket::Arp {
                sender_ip,
                target_ip,
                ..
            } => Ok(ResolutionKey {
                vlan_tag,
                src_ip: sender_ip,
                dst_ip: target_ip,
                src_port: 0,
                dst_port: 0,
                protocol: Protocol::Arp,
            }),
            ParsedPacket::Ipv4 {
                src,
                dst,
                protocol,
                src_port,
                dst_port,
                ..
            } => Ok(ResolutionKey {
                vlan_tag,
                src_ip: src,
                dst_ip: dst,
                src_port,
                dst_port,
                protocol,
            }),
        }
    }

    /// Inserts under the table cap, backing off while the table is full.
    async fn buffer(&self, entry: PendingResolution) -> AgentResult<()> {
        let deadline = Instant::now() + self.config.backoff_budget;
        loop {
            {
                let mut pending = self.pending.lock();
                if pending.len() < self.config.pending_max {
                    pending.insert(entry.request_id, entry);
                    drop(pending);
                    self.bump(|s| s.packets_buffered = s.packets_buffered.saturating_add(1));
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(AgentError::timeout("pending resolution table full"));
            }
            tokio::time::sleep(self.config.backoff_interval).await;
        }
    }

    /// Consumes the pending entry for `reply` and schedules its replay when
    /// the orchestrator resolved it.
    pub fn on_resolution_reply(self: &Arc<Self>, reply: &ResolutionReply) -> AgentResult<ReplyDisposition> {
        let Some(entry) = self.pending.lock().remove(&reply.request_id) else {
            self.bump(|s| s.replies_unknown = s.replies_unknown.saturating_add(1));
            warn_log!("OnDemandEngine", request_id = %reply.request_id, "reply for unknown request");
            return Err(AgentError::not_found("pending resolution", reply.request_id));
        };

        if reply.status != OperationStatus::Success {
            self.bump(|s| s.replies_failed = s.replies_failed.saturating_add(1));
            info_log!(
                "OnDemandEngine",
                request_id = %reply.request_id,
                status = %reply.status,
                dst = %entry.key.dst_ip,
                "resolution failed, packet dropped"
            );
            return Ok(ReplyDisposition::Dropped);
        }

        self.bump(|s| s.replies_success = s.replies_success.saturating_add(1));
        let engine = Arc::clone(self);
        self.replays.spawn(async move {
            engine.replay(entry).await;
        });
        Ok(ReplyDisposition::ReplayScheduled)
    }

    async fn replay(&self, entry: PendingResolution) {
        let result = match entry.key.protocol {
            Protocol::Arp => self.replay_arp(&entry).await,
            _ => self.topology.packet_out(
                entry.connection,
                BRIDGE_TUNNEL,
                entry.ingress_port,
                &entry.packet,
            ),
        };
        match result {
            Ok(()) => {
                self.bump(|s| s.replays_sent = s.replays_sent.saturating_add(1));
                debug_log!("OnDemandEngine", request_id = %entry.request_id, "packet replayed");
            }
            Err(e) => {
                self.bump(|s| s.replays_failed = s.replays_failed.saturating_add(1));
                warn_log!("OnDemandEngine", request_id = %entry.request_id, error = %e, "replay failed");
            }
        }
    }

    /// Waits for the goal state the reply announced to land in the ARP
    /// table, then has the responder answer the buffered request.
    async fn replay_arp(&self, entry: &PendingResolution) -> AgentResult<()> {
        let deadline = Instant::now() + self.config.arp_poll_budget;
        let (target, tag) = (entry.key.dst_ip, entry.key.vlan_tag);
        while !self.address_resolution.exists(target, tag) {
            if Instant::now() >= deadline {
                self.bump(|s| s.arp_poll_timeouts = s.arp_poll_timeouts.saturating_add(1));
                warn_log!(
                    "OnDemandEngine",
                    request_id = %entry.request_id,
                    target = %target,
                    error = %AgentError::timeout("arp entry poll"),
                    "answering without a confirmed entry"
                );
                break;
            }
            tokio::time::sleep(self.config.arp_poll_interval).await;
        }
        self.arp_responder
            .respond(entry.connection, entry.ingress_port, &entry.packet)
    }

    /// Drops entries older than the expiration window. Returns how many.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expiration = self.config.expiration;
        let expired = self
            .pending
            .lock()
            .drain_where(|_, e| now.duration_since(e.inserted_at) >= expiration);

        for (request_id, entry) in &expired {
            info_log!(
                "OnDemandEngine",
                request_id = %request_id,
                tunnel_id = entry.tunnel_id,
                dst = %entry.key.dst_ip,
                "pending resolution expired"
            );
        }
        let count = expired.len();
        if count > 0 {
            self.bump(|s| s.expired = s.expired.saturating_add(count as u64));
        }
        count
    }

    /// Waits until every scheduled replay has finished.
    pub async fn wait_for_replays(&self) {
        self.replays.close();
        self.replays.wait().await;
        self.replays.reopen();
    }

    /// Feeds replies from the completion queue until cancelled or the
    /// queue closes.
    pub async fn run_completion_drainer(
        self: Arc<Self>,
        mut completions: CompletionReceiver,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                reply = completions.recv() => match reply {
                    Some(reply) => {
                        // unknown ids are already logged
                        let _ = self.on_resolution_reply(&reply);
                    }
                    None => {
                        info_log!("OnDemandEngine", "completion queue closed");
                        break;
                    }
                },
            }
        }
        self.wait_for_replays().await;
    }

    /// Runs [`Self::sweep`] every `sweep_interval` until cancelled.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }

        let abandoned = self.pending_count();
        if abandoned > 0 {
            audit_log!(AuditRecord::new(
                AuditCategory::Resolution,
                "OnDemandEngine",
                "stop_sweeper"
            )
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({ "abandoned_pending": abandoned })));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::packet::test_frames;
    use super::*;
    use crate::dataplane::{FaultPoint, InMemoryDataplane};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingOrchestrator {
        requests: Mutex<Vec<ResolutionRequest>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl OrchestratorRpcClient for RecordingOrchestrator {
        async fn request_resolution(&self, request: ResolutionRequest) -> AgentResult<()> {
            if *self.fail.lock() {
                return Err(AgentError::upstream("request_resolution", "connection refused"));
            }
            self.requests.lock().push(request);
            Ok(())
        }
    }

    struct Fixture {
        dp: Arc<InMemoryDataplane>,
        orchestrator: Arc<RecordingOrchestrator>,
        engine: Arc<OnDemandEngine>,
        tag: LocalTag,
    }

    fn fixture_with(config: OnDemandConfig) -> Fixture {
        let dp = Arc::new(InMemoryDataplane::new());
        let registry = Arc::new(TunnelRegistry::new());
        let tag = registry.get_or_create_tag(20).unwrap();
        let orchestrator = Arc::new(RecordingOrchestrator::default());
        let engine = Arc::new(OnDemandEngine::new(
            config,
            registry,
            &SwitchClients::in_memory(Arc::clone(&dp)),
            dp.clone(),
            dp.clone(),
            orchestrator.clone(),
        ));
        Fixture {
            dp,
            orchestrator,
            engine,
            tag,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(OnDemandConfig::default())
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn tcp_frame(tag: LocalTag) -> Vec<u8> {
        test_frames::tcp(Some(tag.as_u16()), ip("10.0.0.2"), ip("10.0.0.3"), 40000, 443)
    }

    fn reply(request_id: Uuid, status: OperationStatus) -> ResolutionReply {
        ResolutionReply { request_id, status }
    }

    #[tokio::test]
    async fn test_tcp_packet_in_then_successful_reply() {
        let f = fixture();
        let frame = tcp_frame(f.tag);

        let PacketInOutcome::Buffered(id) = f.engine.on_packet_in(7, &frame, 3).await.unwrap() else {
            panic!("expected buffered packet");
        };
        assert_eq!(f.engine.pending_count(), 1);

        let requests = f.orchestrator.requests.lock().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].request_id, id);
        assert_eq!(requests[0].tunnel_id, 20);
        assert_eq!(requests[0].key.dst_port, 443);
        assert_eq!(requests[0].key.protocol, Protocol::Tcp);

        assert_eq!(
            f.engine.on_resolution_reply(&reply(id, OperationStatus::Success)).unwrap(),
            ReplyDisposition::ReplayScheduled
        );
        f.engine.wait_for_replays().await;

        let outs = f.dp.packet_outs();
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0].out_port, 7);
        assert_eq!(outs[0].connection, 3);
        assert_eq!(outs[0].bridge, BRIDGE_TUNNEL);
        assert_eq!(outs[0].packet, frame);
        assert_eq!(f.engine.pending_count(), 0);
        assert_eq!(f.engine.stats().replays_sent, 1);

        // a second reply for the same id finds nothing
        assert!(f
            .engine
            .on_resolution_reply(&reply(id, OperationStatus::Success))
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_failed_reply_drops_packet() {
        let f = fixture();
        let PacketInOutcome::Buffered(id) = f.engine.on_packet_in(7, &tcp_frame(f.tag), 1).await.unwrap() else {
            panic!("expected buffered packet");
        };
        assert_eq!(
            f.engine.on_resolution_reply(&reply(id, OperationStatus::Failure)).unwrap(),
            ReplyDisposition::Dropped
        );
        f.engine.wait_for_replays().await;
        assert!(f.dp.packet_outs().is_empty());
        assert!(!f.engine.is_pending(&id));
    }

    #[tokio::test]
    async fn test_dhcp_goes_to_responder() {
        let f = fixture();
        let frame = test_frames::dhcp_discover(Some(f.tag.as_u16()));
        assert_eq!(
            f.engine.on_packet_in(4, &frame, 1).await.unwrap(),
            PacketInOutcome::ForwardedToDhcp
        );
        assert_eq!(f.dp.dhcp_packets().len(), 1);
        assert_eq!(f.engine.pending_count(), 0);
        assert!(f.orchestrator.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_packets_are_dropped() {
        let f = fixture();
        let untagged = test_frames::tcp(None, ip("10.0.0.2"), ip("10.0.0.3"), 1, 2);
        assert!(f.engine.on_packet_in(1, &untagged, 1).await.unwrap_err().is_invalid_argument());

        let unknown_tag = test_frames::tcp(Some(999), ip("10.0.0.2"), ip("10.0.0.3"), 1, 2);
        assert!(f.engine.on_packet_in(1, &unknown_tag, 1).await.unwrap_err().is_not_found());

        let arp_reply = test_frames::arp(Some(f.tag.as_u16()), 2, ip("10.0.0.2"), ip("10.0.0.3"));
        assert!(f.engine.on_packet_in(1, &arp_reply, 1).await.unwrap_err().is_invalid_argument());

        assert!(f.engine.on_packet_in(1, &[0u8; 10], 1).await.unwrap_err().is_invalid_argument());

        assert_eq!(f.engine.pending_count(), 0);
        assert_eq!(f.engine.stats().dropped, 4);
    }

    #[tokio::test]
    async fn test_send_failure_removes_pending_entry() {
        let f = fixture();
        *f.orchestrator.fail.lock() = true;
        let err = f.engine.on_packet_in(1, &tcp_frame(f.tag), 1).await.unwrap_err();
        assert!(matches!(err, AgentError::Upstream { .. }));
        assert_eq!(f.engine.pending_count(), 0);
        assert_eq!(f.engine.stats().requests_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_only_old_entries() {
        let f = fixture();
        f.engine.on_packet_in(1, &tcp_frame(f.tag), 1).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(f.engine.sweep(), 0);
        assert_eq!(f.engine.pending_count(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(f.engine.sweep(), 1);
        assert_eq!(f.engine.pending_count(), 0);
        assert!(f.dp.packet_outs().is_empty());
        assert_eq!(f.engine.stats().expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_table_backs_off_then_times_out() {
        let f = fixture_with(OnDemandConfig {
            pending_max: 1,
            ..OnDemandConfig::default()
        });
        let first = f.engine.on_packet_in(1, &tcp_frame(f.tag), 1).await.unwrap();

        let err = f.engine.on_packet_in(1, &tcp_frame(f.tag), 1).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout { .. }));
        assert_eq!(f.engine.pending_count(), 1);

        let PacketInOutcome::Buffered(id) = first else {
            panic!("expected buffered packet");
        };
        f.engine.on_resolution_reply(&reply(id, OperationStatus::Failure)).unwrap();
        assert!(f.engine.on_packet_in(1, &tcp_frame(f.tag), 1).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_arp_replay_waits_for_entry() {
        let f = fixture();
        let frame = test_frames::arp(Some(f.tag.as_u16()), ARP_OP_REQUEST, ip("10.0.0.2"), ip("10.0.0.9"));
        let PacketInOutcome::Buffered(id) = f.engine.on_packet_in(5, &frame, 2).await.unwrap() else {
            panic!("expected buffered packet");
        };
        f.engine.on_resolution_reply(&reply(id, OperationStatus::Success)).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(f.dp.arp_responses().is_empty());

        AddressResolutionClient::upsert(&*f.dp, ip("10.0.0.9"), "fa:16:3e:00:00:09".parse().unwrap(), f.tag)
            .unwrap();
        f.engine.wait_for_replays().await;

        let responses = f.dp.arp_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].out_port, 5);
        assert_eq!(responses[0].packet, frame);
        assert_eq!(f.engine.stats().arp_poll_timeouts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arp_replay_answers_after_budget() {
        let f = fixture();
        let frame = test_frames::arp(Some(f.tag.as_u16()), ARP_OP_REQUEST, ip("10.0.0.2"), ip("10.0.0.9"));
        let PacketInOutcome::Buffered(id) = f.engine.on_packet_in(5, &frame, 2).await.unwrap() else {
            panic!("expected buffered packet");
        };
        f.engine.on_resolution_reply(&reply(id, OperationStatus::Success)).unwrap();
        f.engine.wait_for_replays().await;

        assert_eq!(f.dp.arp_responses().len(), 1);
        assert_eq!(f.engine.stats().arp_poll_timeouts, 1);
    }

    #[tokio::test]
    async fn test_replay_failure_is_counted() {
        let f = fixture();
        let PacketInOutcome::Buffered(id) = f.engine.on_packet_in(7, &tcp_frame(f.tag), 1).await.unwrap() else {
            panic!("expected buffered packet");
        };
        f.dp.inject_fault(FaultPoint::PacketOut, 1);
        f.engine.on_resolution_reply(&reply(id, OperationStatus::Success)).unwrap();
        f.engine.wait_for_replays().await;
        assert_eq!(f.engine.stats().replays_failed, 1);
    }

    #[tokio::test]
    async fn test_drainer_dispatches_replies() {
        let f = fixture();
        let (tx, rx) = completion_queue(8);
        let cancel = CancellationToken::new();
        let drainer = tokio::spawn(Arc::clone(&f.engine).run_completion_drainer(rx, cancel.clone()));

        let PacketInOutcome::Buffered(id) = f.engine.on_packet_in(7, &tcp_frame(f.tag), 1).await.unwrap() else {
            panic!("expected buffered packet");
        };
        tx.send(reply(id, OperationStatus::Success)).await.unwrap();
        drop(tx);
        drainer.await.unwrap();

        assert_eq!(f.dp.packet_outs().len(), 1);
        assert_eq!(f.engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let sweeper = tokio::spawn(Arc::clone(&f.engine).run_sweeper(cancel.clone()));
        f.engine.on_packet_in(1, &tcp_frame(f.tag), 1).await.unwrap();

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(f.engine.pending_count(), 0);

        cancel.cancel();
        sweeper.await.unwrap();
    }
}
