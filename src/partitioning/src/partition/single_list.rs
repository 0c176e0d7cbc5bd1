use std::cmp::Ordering;

use common::database::DYNAMIC_PARTITIONS_SCHEMA;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{PartitioningError, Result};

static DEFINITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^FOR VALUES IN \('?(\d+)'?\)$").expect("valid regex"));

/// A list partition holding exactly one integer value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SingleNumericListPartition {
    pub table: String,
    pub schema: String,
    pub partition_name: String,
    pub value: i64,
}

impl SingleNumericListPartition {
    /// Named `<table>_<value>`
    pub fn new(table: &str, value: i64) -> Self {
        Self::with_name(table, value, format!("{table}_{value}"))
    }

    pub fn with_name(table: &str, value: i64, partition_name: String) -> Self {
        Self {
            table: table.to_string(),
            schema: DYNAMIC_PARTITIONS_SCHEMA.to_string(),
            partition_name,
            value,
        }
    }

    pub fn from_definition(table: &str, partition_name: &str, definition: &str) -> Result<Self> {
        let value = DEFINITION
            .captures(definition.trim())
            .and_then(|caps| caps[1].parse::<i64>().ok())
            .ok_or_else(|| PartitioningError::Parse {
                partition: partition_name.to_string(),
                definition: definition.to_string(),
            })?;
        Ok(Self::with_name(table, value, partition_name.to_string()))
    }

    /// Catalog-reported partitions may live outside the dynamic partitions
    /// schema, e.g. a table converted into the first partition.
    pub fn in_schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_string();
        self
    }

    /// `<schema>.<name>`
    pub fn identifier(&self) -> String {
        format!("{}.{}", self.schema, self.partition_name)
    }

    pub(crate) fn bounds_clause(&self) -> String {
        format!("IN ({})", self.value)
    }
}

impl Ord for SingleNumericListPartition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .cmp(&other.value)
            .then_with(|| self.partition_name.cmp(&other.partition_name))
    }
}

impl PartialOrd for SingleNumericListPartition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
