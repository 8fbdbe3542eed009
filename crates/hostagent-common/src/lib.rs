//! Common abstractions shared by the hostagent components.
//!
//! - [`AgentError`]: error taxonomy for every programming operation
//! - [`OperationStatus`]: per-resource status reported back to the orchestrator
//! - [`BatchOutcome`]: accumulator for multi-item operations that continue on failure
//! - [`SyncMap`]: map wrapper that never creates entries implicitly
//!
//! # Propagation
//!
//! Component methods return [`AgentResult`]. Operations over N items (subnets,
//! routing rules, torn-down rules) record each failure in a [`BatchOutcome`]
//! and keep going; the aggregate is reported once the batch is done:
//!
//! ```
//! use hostagent_common::{AgentError, BatchOutcome};
//!
//! let mut outcome = BatchOutcome::new();
//! outcome.record(Ok::<(), AgentError>(()));
//! outcome.record(Err::<(), _>(AgentError::not_found("subnet", "s-1")));
//! assert_eq!(outcome.failures().len(), 1);
//! assert!(outcome.into_result("update_router").is_err());
//! ```

mod error;
mod status;
mod sync_map;

pub use error::{AgentError, AgentResult};
pub use status::{AggregateCode, BatchOutcome, OperationStatus};
pub use sync_map::SyncMap;
