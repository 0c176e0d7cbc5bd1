//! Partition count gauges.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Gauge, Meter};

use common::database::Queryable;

use crate::error::Result;
use crate::table::PartitionedTable;

/// Sizes of one table's partition plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionCounts {
    pub present: u64,
    pub missing: u64,
    pub extra: u64,
}

pub struct PartitionMonitoring {
    present: Gauge<u64>,
    missing: Gauge<u64>,
    extra: Gauge<u64>,
}

impl PartitionMonitoring {
    pub fn new(meter: &Meter) -> Self {
        Self {
            present: meter
                .u64_gauge("db_partitions_present")
                .with_description("Number of database partitions present")
                .build(),
            missing: meter
                .u64_gauge("db_partitions_missing")
                .with_description("Number of database partitions currently expected, but not present")
                .build(),
            extra: meter
                .u64_gauge("db_partitions_extra")
                .with_description("Number of database partitions currently attached that should be detached")
                .build(),
        }
    }

    pub async fn report_metrics<Q: Queryable + ?Sized>(
        &self,
        conn: &Q,
        table: &PartitionedTable,
    ) -> Result<PartitionCounts> {
        let plan = table.strategy.plan(conn).await?;
        let counts = PartitionCounts {
            present: plan.current.len() as u64,
            missing: plan.missing.len() as u64,
            extra: plan.extra.len() as u64,
        };

        let labels = [KeyValue::new("table", table.name.clone())];
        self.present.record(counts.present, &labels);
        self.missing.record(counts.missing, &labels);
        self.extra.record(counts.extra, &labels);

        Ok(counts)
    }
}
