/// Per-session cost ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostBudget {
    limit_usd: Option<f64>,
}

impl CostBudget {
    pub fn new(limit_usd: Option<f64>) -> Self {
        Self { limit_usd }
    }

    /// No ceiling.
    pub fn unlimited() -> Self {
        Self { limit_usd: None }
    }

    pub fn limit_usd(&self) -> Option<f64> {
        self.limit_usd
    }

    /// True once recorded spend has gone past the ceiling.
    pub fn is_exceeded(&self, total_cost_usd: f64) -> bool {
        self.limit_usd
            .is_some_and(|limit| total_cost_usd > limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_exceeded() {
        assert!(!CostBudget::unlimited().is_exceeded(1e9));
    }

    #[test]
    fn test_exceeded_only_past_limit() {
        let budget = CostBudget::new(Some(1.0));
        assert!(!budget.is_exceeded(0.5));
        assert!(!budget.is_exceeded(1.0));
        assert!(budget.is_exceeded(1.01));
    }
}
