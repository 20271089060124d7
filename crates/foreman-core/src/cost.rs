//! Spend accounting boundary. The engine consults a [`CostOracle`] after every
//! model reply; pricing tables and token arithmetic live behind it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Accumulated dollar totals for a project and a single run within it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CostTotals {
    pub project: f64,
    pub run: f64,
}

/// Which spend threshold was crossed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CostType {
    Project,
    Run,
}

impl fmt::Display for CostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Project => f.write_str("project"),
            Self::Run => f.write_str("run"),
        }
    }
}

/// Raised by the spend gate when a threshold is reached. Propagates through
/// the gateway and the pipeline runtime without being swallowed.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("Abort: {cost_type} cost ${current_cost:.2} exceeds threshold ${threshold:.2}")]
pub struct CostExceeded {
    pub cost_type: CostType,
    pub current_cost: f64,
    pub threshold: f64,
}

#[derive(Debug, thiserror::Error)]
#[error("cost oracle error: {0}")]
pub struct CostError(pub String);

#[async_trait(?Send)]
pub trait CostOracle {
    /// Current dollar totals for `(project, run_id)`.
    async fn cost(&self, project: &str, run_id: &str) -> Result<CostTotals, CostError>;
}

/// Oracle returning a preset total, adjustable from tests.
#[derive(Default)]
pub struct FixedCostOracle {
    totals: std::sync::Mutex<CostTotals>,
}

impl FixedCostOracle {
    pub fn new(project: f64, run: f64) -> Arc<Self> {
        Arc::new(Self {
            totals: std::sync::Mutex::new(CostTotals { project, run }),
        })
    }

    pub fn set(&self, project: f64, run: f64) {
        *self.totals.lock().unwrap() = CostTotals { project, run };
    }
}

#[async_trait(?Send)]
impl CostOracle for FixedCostOracle {
    async fn cost(&self, _project: &str, _run_id: &str) -> Result<CostTotals, CostError> {
        Ok(*self.totals.lock().unwrap())
    }
}
