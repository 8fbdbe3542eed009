//! Agent runtime: wires the programmers, the goal-state handler and the
//! on-demand engine to their collaborators and runs the background tasks.

mod agent;

pub use agent::{HostAgent, HostAgentCollaborators};
