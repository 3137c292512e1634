//! Pending request and retry budget
//!
//! A `PendingRequest` is the caller's request plus the bookkeeping the
//! pipeline needs to replay it. The budget is carried on the value, not on
//! the transport, so a replay can never itself trigger another renewal.

use transport::ApiRequest;

/// Renewal-and-replay allowance for one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    remaining: u8,
}

impl RetryBudget {
    /// One renewal-and-replay.
    pub fn single() -> Self {
        Self { remaining: 1 }
    }

    pub fn spent() -> Self {
        Self { remaining: 0 }
    }

    pub fn is_available(&self) -> bool {
        self.remaining > 0
    }

    /// Budget after one replay.
    pub fn spend(self) -> Self {
        Self {
            remaining: self.remaining.saturating_sub(1),
        }
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::single()
    }
}

/// A request in flight through the pipeline.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request: ApiRequest,
    pub budget: RetryBudget,
    /// Location to return to if the session has to be re-established.
    pub return_to: String,
}

impl PendingRequest {
    pub fn new(request: ApiRequest, return_to: impl Into<String>) -> Self {
        Self {
            request,
            budget: RetryBudget::single(),
            return_to: return_to.into(),
        }
    }

    pub fn with_budget(mut self, budget: RetryBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Copy of this request for replay, or `None` when the budget is spent.
    pub fn replay(&self) -> Option<PendingRequest> {
        self.budget.is_available().then(|| PendingRequest {
            request: self.request.clone(),
            budget: self.budget.spend(),
            return_to: self.return_to.clone(),
        })
    }
}
