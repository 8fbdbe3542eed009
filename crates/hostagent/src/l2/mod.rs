//! L2 dataplane programming: local ports, tunnel classifiers and remote
//! L2 neighbors on the two-bridge layout.

mod programmer;
mod types;

pub use programmer::L2Programmer;
pub use types::{L2NeighborRecord, L2ProgrammerConfig, L2ProgrammerStats, PortProgramming, PortRecord};
