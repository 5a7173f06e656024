use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::operation::Priority;

/// `processing_capacity` key of `PipelineConfig` (spec §3/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingCapacity {
    pub total_workers: u32,
    /// Fractional share per priority; values MUST sum to 1.0 +/- 0.01
    /// (spec §6). Keys are whichever priorities the operator configures —
    /// three or four lanes are both valid (spec §9 open question).
    pub priority_allocation: BTreeMap<Priority, f64>,
}

impl ProcessingCapacity {
    pub fn validate(&self) -> Result<(), String> {
        let sum: f64 = self.priority_allocation.values().sum();
        if (sum - 1.0).abs() > 0.01 {
            return Err(format!(
                "priority_allocation must sum to 1.0 +/- 0.01, got {sum}"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub backoff_base_seconds: f64,
    pub backoff_multiplier: f64,
    pub backoff_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_seconds: 10.0,
            backoff_multiplier: 2.0,
            backoff_jitter: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OperationTimeouts {
    pub default_seconds: u64,
    pub per_type_seconds: BTreeMap<String, u64>,
}

impl OperationTimeouts {
    pub fn for_type(&self, op_type: &str) -> u64 {
        self.per_type_seconds
            .get(op_type)
            .copied()
            .unwrap_or(self.default_seconds)
    }
}

/// Operator-configurable pipeline tuning (spec §3, `GET/PATCH
/// /pipeline/config`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub processing_capacity: ProcessingCapacity,
    pub retry_policy: RetryPolicy,
    pub operation_timeouts: OperationTimeouts,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut priority_allocation = BTreeMap::new();
        priority_allocation.insert(Priority::High, 0.4);
        priority_allocation.insert(Priority::Normal, 0.4);
        priority_allocation.insert(Priority::Low, 0.2);

        Self {
            processing_capacity: ProcessingCapacity {
                total_workers: 10,
                priority_allocation,
            },
            retry_policy: RetryPolicy::default(),
            operation_timeouts: OperationTimeouts {
                default_seconds: 120,
                per_type_seconds: BTreeMap::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allocation_sums_to_one() {
        PipelineConfig::default()
            .processing_capacity
            .validate()
            .unwrap();
    }

    #[test]
    fn rejects_allocation_off_by_more_than_one_percent() {
        let mut cap = PipelineConfig::default().processing_capacity;
        cap.priority_allocation.insert(Priority::Low, 0.5);
        assert!(cap.validate().is_err());
    }
}
