//! Operation status and batch outcome types.

use crate::error::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-resource status reported back to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// Resource fully programmed
    Success,
    /// Accepted; background work (port-tag retry) still pending
    InProgress,
    /// Rejected because of malformed input
    InvalidArgument,
    /// Programming failed (not found, conflict, collaborator failure, timeout)
    Failure,
}

impl OperationStatus {
    /// Maps an error onto the status reported for it.
    pub fn from_error(err: &AgentError) -> Self {
        if err.is_invalid_argument() {
            OperationStatus::InvalidArgument
        } else {
            OperationStatus::Failure
        }
    }

    /// Maps a plain result onto a status.
    pub fn from_result<T>(result: &AgentResult<T>) -> Self {
        match result {
            Ok(_) => OperationStatus::Success,
            Err(e) => Self::from_error(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OperationStatus::Success | OperationStatus::InProgress)
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Success => write!(f, "SUCCESS"),
            OperationStatus::InProgress => write!(f, "IN_PROGRESS"),
            OperationStatus::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            OperationStatus::Failure => write!(f, "FAILURE"),
        }
    }
}

/// Caller-visible return code of a whole goal-state apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregateCode {
    Success,
    InProgress,
    Failure,
}

impl AggregateCode {
    /// Folds per-resource statuses: any failure wins, then any in-progress.
    pub fn from_statuses<'a>(statuses: impl IntoIterator<Item = &'a OperationStatus>) -> Self {
        let mut code = AggregateCode::Success;
        for status in statuses {
            match status {
                OperationStatus::Success => {}
                OperationStatus::InProgress => {
                    if code == AggregateCode::Success {
                        code = AggregateCode::InProgress;
                    }
                }
                OperationStatus::InvalidArgument | OperationStatus::Failure => {
                    return AggregateCode::Failure;
                }
            }
        }
        code
    }
}

/// Accumulates failures over a batch without stopping at the first one.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    total: usize,
    failures: Vec<AgentError>,
}

impl BatchOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one item's result and hands back its value on success.
    pub fn record<T>(&mut self, result: AgentResult<T>) -> Option<T> {
        self.total = self.total.saturating_add(1);
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.failures.push(e);
                None
            }
        }
    }

    /// Folds another batch's items and failures into this one.
    pub fn absorb(&mut self, other: BatchOutcome) {
        self.total = self.total.saturating_add(other.total);
        self.failures.extend(other.failures);
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn failures(&self) -> &[AgentError] {
        &self.failures
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Collapses the batch into a single result.
    ///
    /// A single-item batch keeps its original error; larger batches report
    /// [`AgentError::PartialFailure`].
    pub fn into_result(self, operation: &str) -> AgentResult<()> {
        let mut failures = self.failures;
        if failures.is_empty() {
            return Ok(());
        }
        if self.total == 1 && failures.len() == 1 {
            if let Some(only) = failures.pop() {
                return Err(only);
            }
        }
        Err(AgentError::PartialFailure {
            operation: operation.to_string(),
            total: self.total,
            errors: failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_from_error() {
        assert_eq!(
            OperationStatus::from_error(&AgentError::empty_field("port_name")),
            OperationStatus::InvalidArgument
        );
        assert_eq!(
            OperationStatus::from_error(&AgentError::not_found("router", "r1")),
            OperationStatus::Failure
        );
        let ok: AgentResult<()> = Ok(());
        assert_eq!(OperationStatus::from_result(&ok), OperationStatus::Success);
    }

    #[test]
    fn test_aggregate_code() {
        use OperationStatus::*;
        assert_eq!(AggregateCode::from_statuses(&[Success, Success]), AggregateCode::Success);
        assert_eq!(
            AggregateCode::from_statuses(&[Success, InProgress]),
            AggregateCode::InProgress
        );
        assert_eq!(
            AggregateCode::from_statuses(&[InProgress, InvalidArgument, Success]),
            AggregateCode::Failure
        );
        assert_eq!(AggregateCode::from_statuses(&[]), AggregateCode::Success);
    }

    #[test]
    fn test_batch_keeps_going() {
        let mut batch = BatchOutcome::new();
        assert_eq!(batch.record(Ok(1)), Some(1));
        assert_eq!(batch.record::<i32>(Err(AgentError::timeout("x"))), None);
        assert_eq!(batch.record(Ok(3)), Some(3));
        assert_eq!(batch.total(), 3);
        assert!(!batch.is_success());

        match batch.into_result("batch") {
            Err(AgentError::PartialFailure { total, errors, .. }) => {
                assert_eq!(total, 3);
                assert_eq!(errors.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_single_item_batch_keeps_error() {
        let mut batch = BatchOutcome::new();
        batch.record::<()>(Err(AgentError::not_found("subnet", "s1")));
        assert_eq!(
            batch.into_result("batch"),
            Err(AgentError::not_found("subnet", "s1"))
        );
    }

    #[test]
    fn test_batch_into_result() {
        let mut clean = BatchOutcome::new();
        clean.record(Ok(()));
        clean.record(Ok(()));
        assert_eq!(clean.into_result("batch"), Ok(()));

        let mut failed = BatchOutcome::new();
        failed.record::<()>(Err(AgentError::timeout("a")));
        failed.record::<()>(Err(AgentError::timeout("b")));
        match failed.into_result("batch") {
            Err(AgentError::PartialFailure { operation, total, errors }) => {
                assert_eq!(operation, "batch");
                assert_eq!(total, 2);
                assert_eq!(errors, vec![AgentError::timeout("a"), AgentError::timeout("b")]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_absorb() {
        let mut outer = BatchOutcome::new();
        outer.record(Ok(()));
        let mut inner = BatchOutcome::new();
        inner.record::<()>(Err(AgentError::conflict("c")));
        inner.record(Ok(()));
        outer.absorb(inner);
        assert_eq!(outer.total(), 3);
        assert_eq!(outer.failures().len(), 1);
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&OperationStatus::InvalidArgument).unwrap();
        assert_eq!(json, "\"INVALID_ARGUMENT\"");
    }
}
