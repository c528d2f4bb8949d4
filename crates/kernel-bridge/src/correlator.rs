//! Request id → cell id bookkeeping for one kernel process.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::{CellId, RequestId};

/// An `execute_request` that has been (or is about to be) sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub request_id: RequestId,
    pub cell_id: CellId,
    pub submitted_at: DateTime<Utc>,
}

impl ExecutionRequest {
    pub fn new(request_id: impl Into<RequestId>, cell_id: impl Into<CellId>) -> Self {
        Self {
            request_id: request_id.into(),
            cell_id: cell_id.into(),
            submitted_at: Utc::now(),
        }
    }
}

/// Maps outstanding request ids to the cells that issued them.
///
/// Scoped to a single kernel process: a restart starts from an empty
/// correlator, so ids from the previous process never resolve.
#[derive(Debug, Default)]
pub struct ExecutionCorrelator {
    requests: HashMap<RequestId, ExecutionRequest>,
}

impl ExecutionCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request.
    ///
    /// Older requests for the same cell are evicted: a cell only ever shows
    /// the outputs of its latest run. Returns the evicted request ids.
    pub fn record(&mut self, request: ExecutionRequest) -> Vec<RequestId> {
        let superseded: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, r)| r.cell_id == request.cell_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &superseded {
            self.requests.remove(id);
        }
        self.requests.insert(request.request_id.clone(), request);
        superseded
    }

    /// The cell a request belongs to, if it is still tracked.
    pub fn resolve(&self, request_id: &str) -> Option<&CellId> {
        self.requests.get(request_id).map(|r| &r.cell_id)
    }

    pub fn forget(&mut self, request_id: &str) -> Option<ExecutionRequest> {
        self.requests.remove(request_id)
    }

    pub fn clear(&mut self) {
        self.requests.clear();
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
