use std::cmp::Ordering;

use common::database::DYNAMIC_PARTITIONS_SCHEMA;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{PartitioningError, Result};

static DEFINITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^FOR VALUES FROM \('?(\d+)'?\) TO \('?(\d+)'?\)$").expect("valid regex")
});

/// A range partition over positive integers, `[from, to)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IntRangePartition {
    pub table: String,
    pub schema: String,
    pub partition_name: String,
    pub from: i64,
    pub to: i64,
}

impl IntRangePartition {
    /// Named `<table>_<from>`
    pub fn new(table: &str, from: i64, to: i64) -> Result<Self> {
        Self::with_name(table, from, to, format!("{table}_{from}"))
    }

    pub fn with_name(table: &str, from: i64, to: i64, partition_name: String) -> Result<Self> {
        if from <= 0 || to <= 0 {
            return Err(PartitioningError::InvalidArgument(format!(
                "partition bounds of {partition_name} must be positive, got [{from}, {to})"
            )));
        }
        if to <= from {
            return Err(PartitioningError::InvalidArgument(format!(
                "upper bound of {partition_name} must be greater than its lower bound, got [{from}, {to})"
            )));
        }
        Ok(Self {
            table: table.to_string(),
            schema: DYNAMIC_PARTITIONS_SCHEMA.to_string(),
            partition_name,
            from,
            to,
        })
    }

    pub fn from_definition(table: &str, partition_name: &str, definition: &str) -> Result<Self> {
        let parse_error = || PartitioningError::Parse {
            partition: partition_name.to_string(),
            definition: definition.to_string(),
        };

        let caps = DEFINITION.captures(definition.trim()).ok_or_else(parse_error)?;
        let from = caps[1].parse::<i64>().map_err(|_| parse_error())?;
        let to = caps[2].parse::<i64>().map_err(|_| parse_error())?;
        Self::with_name(table, from, to, partition_name.to_string())
    }

    pub fn in_schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_string();
        self
    }

    /// `<schema>.<name>`
    pub fn identifier(&self) -> String {
        format!("{}.{}", self.schema, self.partition_name)
    }

    pub(crate) fn bounds_clause(&self) -> String {
        format!("FROM ({}) TO ({})", self.from, self.to)
    }
}

impl Ord for IntRangePartition {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.from, self.to, &self.partition_name).cmp(&(other.from, other.to, &other.partition_name))
    }
}

impl PartialOrd for IntRangePartition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
