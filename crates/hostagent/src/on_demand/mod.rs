//! On-demand resolution of traffic with no local forwarding rule.

mod engine;
pub mod packet;
mod types;

pub use engine::{
    completion_queue, CompletionReceiver, CompletionSender, OnDemandEngine, OrchestratorRpcClient,
};
pub use packet::{ParsedPacket, PacketError};
pub use types::{
    OnDemandConfig, OnDemandStats, PacketInOutcome, PendingResolution, Protocol,
    ReplyDisposition, ResolutionKey, ResolutionReply, ResolutionRequest,
};
