use std::cmp::Ordering;

use chrono::NaiveDate;
use common::database::{DYNAMIC_PARTITIONS_SCHEMA, quote_literal};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{PartitioningError, Result};

static DEFINITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^FOR VALUES FROM \((.+?)\) TO \((.+?)\)$").expect("valid regex"));
static DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^'?(\d{4}-\d{2}-\d{2})").expect("valid regex"));

const MINVALUE: &str = "MINVALUE";
const MAXVALUE: &str = "MAXVALUE";

/// A date range partition `[from, to)`; `from = None` is unbounded below.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimePartition {
    pub table: String,
    pub schema: String,
    pub partition_name: String,
    pub from: Option<NaiveDate>,
    pub to: NaiveDate,
}

impl TimePartition {
    /// Named `<table>_YYYYMM` after the lower bound, `<table>_000000` when
    /// unbounded below.
    pub fn new(table: &str, from: Option<NaiveDate>, to: NaiveDate) -> Result<Self> {
        let suffix = match from {
            Some(from) => from.format("%Y%m").to_string(),
            None => "000000".to_string(),
        };
        Self::with_name(table, from, to, format!("{table}_{suffix}"))
    }

    pub fn with_name(
        table: &str,
        from: Option<NaiveDate>,
        to: NaiveDate,
        partition_name: String,
    ) -> Result<Self> {
        if let Some(from) = from {
            if to <= from {
                return Err(PartitioningError::InvalidArgument(format!(
                    "upper bound of {partition_name} must be after its lower bound, got [{from}, {to})"
                )));
            }
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
        let (from, to) = (caps[1].trim(), caps[2].trim());

        if to == MAXVALUE {
            return Err(PartitioningError::UnsupportedDefinition {
                partition: partition_name.to_string(),
                definition: definition.to_string(),
            });
        }

        let from = if from == MINVALUE {
            None
        } else {
            Some(parse_date(from).ok_or_else(parse_error)?)
        };
        let to = parse_date(to).ok_or_else(parse_error)?;

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
        let from = match self.from {
            Some(from) => quote_literal(&from.to_string()),
            None => MINVALUE.to_string(),
        };
        format!(
            "FROM ({from}) TO ({})",
            quote_literal(&self.to.to_string())
        )
    }
}

/// Accepts `'2024-01-01'` as well as timestamp forms like
/// `'2024-01-01 00:00:00+00'`.
fn parse_date(value: &str) -> Option<NaiveDate> {
    let caps = DATE.captures(value)?;
    NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d").ok()
}

impl Ord for TimePartition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.partition_name.cmp(&other.partition_name)
    }
}

impl PartialOrd for TimePartition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_from_timestamp_definition() {
        let p = TimePartition::from_definition(
            "audit_events",
            "audit_events_202401",
            "FOR VALUES FROM ('2024-01-01 00:00:00+00') TO ('2024-02-01 00:00:00+00')",
        )
        .unwrap();
        assert_eq!(p.from, Some(date(2024, 1, 1)));
        assert_eq!(p.to, date(2024, 2, 1));
        assert_eq!(
            p,
            TimePartition::new("audit_events", Some(date(2024, 1, 1)), date(2024, 2, 1)).unwrap()
        );
    }

    #[test]
    fn test_minvalue_lower_bound() {
        let p = TimePartition::from_definition(
            "audit_events",
            "audit_events_000000",
            "FOR VALUES FROM (MINVALUE) TO ('2024-01-01')",
        )
        .unwrap();
        assert_eq!(p.from, None);
        assert_eq!(p.bounds_clause(), "FROM (MINVALUE) TO ('2024-01-01')");
    }

    #[test]
    fn test_maxvalue_upper_bound_is_unsupported() {
        let err = TimePartition::from_definition(
            "audit_events",
            "audit_events_202401",
            "FOR VALUES FROM ('2024-01-01') TO (MAXVALUE)",
        )
        .unwrap_err();
        assert!(matches!(err, PartitioningError::UnsupportedDefinition { .. }));
    }

    #[test]
    fn test_unparseable_definition() {
        let err = TimePartition::from_definition("audit_events", "x", "FOR VALUES IN ('1')")
            .unwrap_err();
        assert!(matches!(err, PartitioningError::Parse { .. }));
    }

    #[test]
    fn test_ordering_by_name() {
        let mut partitions = vec![
            TimePartition::new("t", Some(date(2024, 2, 1)), date(2024, 3, 1)).unwrap(),
            TimePartition::new("t", None, date(2024, 1, 1)).unwrap(),
            TimePartition::new("t", Some(date(2024, 1, 1)), date(2024, 2, 1)).unwrap(),
        ];
        partitions.sort();
        let names: Vec<_> = partitions.iter().map(|p| p.partition_name.as_str()).collect();
        assert_eq!(names, vec!["t_000000", "t_202401", "t_202402"]);
    }
}
