//! PLB search engine: constraint checks, placement, repair, balancing.
//!
//! This crate turns a [`plb_model::DomainSnapshot`] into movements. It
//! holds no state between runs: every search starts from a fresh
//! [`PlacementState`] and returns a movement table for the scheduler to
//! emit.
//!
//! # Components
//!
//! - **`expression`**: Placement-constraint expression parser
//! - **`state`**: Mutable working placement with incremental load accounting
//! - **`constraints`**: Hard-constraint checks in fixed precedence
//! - **`objective`**: Load-deviation score and imbalance analysis
//! - **`placer`**: New replica placement, extra replica drops, placement with move
//! - **`fixer`**: Constraint violation repair, upgrade swaps, requested moves
//! - **`balancer`**: Hill-climbing load balancing
//! - **`movements`**: Placement diff to failover unit movements
//! - **`analysis`** / **`search`**: Per-domain needs and the search entry point

pub mod analysis;
pub mod balancer;
pub mod constraints;
pub mod expression;
pub mod fixer;
pub mod movements;
pub mod objective;
pub mod placer;
pub mod search;
pub mod state;

pub use analysis::{DomainAnalysis, analyze};
pub use constraints::{ExistingViolation, Placement, Violation, check_existing, check_placement, check_swap, find_violations};
pub use expression::{Expr, ExpressionError};
pub use movements::{build_movements, verify_movements};
pub use objective::{BalanceAnalysis, MetricStats, Objective};
pub use search::{SearchResult, UnplacedReport, ViolationReport, analyze_snapshot, run_search};
pub use state::PlacementState;

/// Caps the number of candidate evaluations one search may make.
#[derive(Debug, Clone)]
pub struct SearchBudget {
    limit: u32,
    used: u32,
}

impl SearchBudget {
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    /// Take one evaluation; false once the budget is spent.
    pub fn spend(&mut self) -> bool {
        if self.used >= self.limit {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }

    pub fn used(&self) -> u32 {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_runs_out() {
        let mut budget = SearchBudget::new(2);
        assert!(budget.spend());
        assert!(budget.spend());
        assert!(!budget.spend());
        assert!(budget.is_exhausted());
        assert_eq!(budget.used(), 2);
    }
}
