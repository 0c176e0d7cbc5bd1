use std::cmp::Ordering;

use common::database::DYNAMIC_PARTITIONS_SCHEMA;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{PartitioningError, Result};

static DEFINITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^FOR VALUES IN \(([\d,' ]+)\)$").expect("valid regex"));

/// A list partition holding several integer values, kept sorted and unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MultiNumericListPartition {
    pub table: String,
    pub schema: String,
    pub partition_name: String,
    pub values: Vec<i64>,
}

impl MultiNumericListPartition {
    /// Named `<table>_<lowest value>`
    pub fn new(table: &str, values: Vec<i64>) -> Result<Self> {
        let values = normalize(values)?;
        let partition_name = format!("{table}_{}", values[0]);
        Ok(Self {
            table: table.to_string(),
            schema: DYNAMIC_PARTITIONS_SCHEMA.to_string(),
            partition_name,
            values,
        })
    }

    pub fn with_name(table: &str, values: Vec<i64>, partition_name: String) -> Result<Self> {
        Ok(Self {
            table: table.to_string(),
            schema: DYNAMIC_PARTITIONS_SCHEMA.to_string(),
            partition_name,
            values: normalize(values)?,
        })
    }

    pub fn from_definition(table: &str, partition_name: &str, definition: &str) -> Result<Self> {
        let parse_error = || PartitioningError::Parse {
            partition: partition_name.to_string(),
            definition: definition.to_string(),
        };

        let caps = DEFINITION.captures(definition.trim()).ok_or_else(parse_error)?;
        let values = caps[1]
            .split(',')
            .map(|v| v.trim().trim_matches('\'').parse::<i64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| parse_error())?;

        Self::with_name(table, values, partition_name.to_string())
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
        let values = self
            .values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!("IN ({values})")
    }
}

fn normalize(mut values: Vec<i64>) -> Result<Vec<i64>> {
    if values.is_empty() {
        return Err(PartitioningError::InvalidArgument(
            "a list partition needs at least one value".to_string(),
        ));
    }
    values.sort_unstable();
    values.dedup();
    Ok(values)
}

impl Ord for MultiNumericListPartition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.values
            .cmp(&other.values)
            .then_with(|| self.partition_name.cmp(&other.partition_name))
    }
}

impl PartialOrd for MultiNumericListPartition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_definition() {
        let p = MultiNumericListPartition::from_definition(
            "builds",
            "builds_100",
            "FOR VALUES IN ('101', '100', '102')",
        )
        .unwrap();
        assert_eq!(p.values, vec![100, 101, 102]);
        assert_eq!(p.bounds_clause(), "IN (100, 101, 102)");
    }

    #[test]
    fn test_empty_values_are_invalid() {
        let err = MultiNumericListPartition::new("builds", vec![]).unwrap_err();
        assert!(matches!(err, PartitioningError::InvalidArgument(_)));
    }

    #[test]
    fn test_default_name_uses_lowest_value() {
        let p = MultiNumericListPartition::new("builds", vec![7, 5, 5]).unwrap();
        assert_eq!(p.partition_name, "builds_5");
        assert_eq!(p.values, vec![5, 7]);
    }

    #[test]
    fn test_rejects_range_definition() {
        assert!(
            MultiNumericListPartition::from_definition(
                "builds",
                "builds_1",
                "FOR VALUES FROM ('1') TO ('5')"
            )
            .is_err()
        );
    }
}
