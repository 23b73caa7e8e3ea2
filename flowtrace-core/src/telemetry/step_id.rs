//! Execution identity of a single step run.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one concrete execution of one step.
///
/// Every loop iteration of a call site shares the `correlation_id`; the
/// `loop_index` tells the iterations apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepId {
    pub correlation_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_index: Option<u32>,
}

impl StepId {
    pub fn new(correlation_id: Uuid, loop_index: Option<u32>) -> Self {
        Self {
            correlation_id,
            loop_index,
        }
    }

    /// Identity of a step executed outside of any loop.
    pub fn outside_loop(correlation_id: Uuid) -> Self {
        Self::new(correlation_id, None)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.loop_index {
            Some(index) => write!(f, "{}#{}", self.correlation_id, index),
            None => write!(f, "{}", self.correlation_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_loop_iterations_are_distinct() {
        let corr = Uuid::new_v4();
        let ids: HashSet<StepId> = (0..3).map(|i| StepId::new(corr, Some(i))).collect();
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&StepId::outside_loop(corr)));
    }

    #[test]
    fn test_equality_requires_both_fields() {
        let corr = Uuid::new_v4();
        assert_eq!(StepId::new(corr, Some(1)), StepId::new(corr, Some(1)));
        assert_ne!(StepId::new(corr, Some(1)), StepId::new(Uuid::new_v4(), Some(1)));
    }

    #[test]
    fn test_json_shape() {
        let corr = Uuid::parse_str("6a1c2b4e-1f0d-4c55-9d43-8a2f8f3b1e10").unwrap();
        assert_eq!(
            serde_json::to_string(&StepId::new(corr, Some(2))).unwrap(),
            r#"{"correlationId":"6a1c2b4e-1f0d-4c55-9d43-8a2f8f3b1e10","loopIndex":2}"#
        );
        assert_eq!(
            serde_json::to_string(&StepId::outside_loop(corr)).unwrap(),
            r#"{"correlationId":"6a1c2b4e-1f0d-4c55-9d43-8a2f8f3b1e10"}"#
        );
    }

    #[test]
    fn test_display() {
        let corr = Uuid::nil();
        assert_eq!(
            StepId::new(corr, Some(4)).to_string(),
            "00000000-0000-0000-0000-000000000000#4"
        );
    }
}
