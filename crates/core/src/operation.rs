// crates/core/src/operation.rs
//! The closed set of aggregation operations a chart can run.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Aggregation applied to the chart's operation field within each bucket.
///
/// `StdDev` and `Variance` are derived aggregates: SQLite ships no stddev
/// built-in, so the query builder emits (count, sum, sum-of-squares)
/// columns and the assembler finishes the math. `AvgCountPerInstance` is
/// the ratio of matching rows to distinct owning rows with a non-null
/// operation field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Count,
    DistinctCount,
    Sum,
    Avg,
    Min,
    Max,
    StdDev,
    Variance,
    AvgCountPerInstance,
}

impl Operation {
    pub const ALL: [Operation; 9] = [
        Operation::Count,
        Operation::DistinctCount,
        Operation::Sum,
        Operation::Avg,
        Operation::Min,
        Operation::Max,
        Operation::StdDev,
        Operation::Variance,
        Operation::AvgCountPerInstance,
    ];

    /// The name stored in chart configuration and cache rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Count => "Count",
            Operation::DistinctCount => "DistinctCount",
            Operation::Sum => "Sum",
            Operation::Avg => "Avg",
            Operation::Min => "Min",
            Operation::Max => "Max",
            Operation::StdDev => "StdDev",
            Operation::Variance => "Variance",
            Operation::AvgCountPerInstance => "AvgCountPerInstance",
        }
    }

    /// True for aggregates finished in Rust from component columns.
    pub fn is_derived(&self) -> bool {
        matches!(self, Operation::StdDev | Operation::Variance)
    }

    /// True when the SQL DISTINCT qualifier applies to this aggregate.
    /// Min/Max are unaffected by duplicates; the derived aggregates keep
    /// every sample.
    pub fn supports_distinct(&self) -> bool {
        matches!(
            self,
            Operation::Count | Operation::Sum | Operation::Avg | Operation::AvgCountPerInstance
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Count" => Ok(Operation::Count),
            "DistinctCount" => Ok(Operation::DistinctCount),
            "Sum" => Ok(Operation::Sum),
            "Avg" => Ok(Operation::Avg),
            "Min" => Ok(Operation::Min),
            "Max" => Ok(Operation::Max),
            "StdDev" => Ok(Operation::StdDev),
            "Variance" => Ok(Operation::Variance),
            "AvgCountPerInstance" => Ok(Operation::AvgCountPerInstance),
            other => Err(CoreError::UnknownOperation {
                name: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_str() {
        for op in Operation::ALL {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
    }

    #[test]
    fn unknown_operation_is_an_error() {
        assert!("Median".parse::<Operation>().is_err());
    }
}
