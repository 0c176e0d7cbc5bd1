//! Partition value objects.
//!
//! A partition is identified by its parent table, its name and its bounds.
//! Values are parsed from the `FOR VALUES ...` expression reported by the
//! catalog and are never mutated; every reconciliation pass builds fresh ones.

mod int_range;
mod multi_list;
mod single_list;
mod time;

pub use int_range::IntRangePartition;
pub use multi_list::MultiNumericListPartition;
pub use single_list::SingleNumericListPartition;
pub use time::TimePartition;

use std::cmp::Ordering;

use common::database::{DYNAMIC_PARTITIONS_SCHEMA, Queryable, quote_table_name};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Partition {
    SingleList(SingleNumericListPartition),
    MultiList(MultiNumericListPartition),
    IntRange(IntRangePartition),
    Time(TimePartition),
}

impl Partition {
    pub fn table(&self) -> &str {
        match self {
            Partition::SingleList(p) => &p.table,
            Partition::MultiList(p) => &p.table,
            Partition::IntRange(p) => &p.table,
            Partition::Time(p) => &p.table,
        }
    }

    pub fn schema(&self) -> &str {
        match self {
            Partition::SingleList(p) => &p.schema,
            Partition::MultiList(p) => &p.schema,
            Partition::IntRange(p) => &p.schema,
            Partition::Time(p) => &p.schema,
        }
    }

    /// Bare name inside [`Partition::schema`]
    pub fn name(&self) -> &str {
        match self {
            Partition::SingleList(p) => &p.partition_name,
            Partition::MultiList(p) => &p.partition_name,
            Partition::IntRange(p) => &p.partition_name,
            Partition::Time(p) => &p.partition_name,
        }
    }

    /// `<schema>.<name>`
    pub fn identifier(&self) -> String {
        format!("{}.{}", self.schema(), self.name())
    }

    /// Name stored in `detached_partitions`: bare inside the dynamic
    /// partitions schema, qualified anywhere else.
    pub fn detached_record_name(&self) -> String {
        if self.schema() == DYNAMIC_PARTITIONS_SCHEMA {
            self.name().to_string()
        } else {
            self.identifier()
        }
    }

    pub fn to_create_ddl(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} FOR VALUES {}",
            quote_table_name(&self.identifier()),
            quote_table_name(self.table()),
            self.bounds_clause()
        )
    }

    pub fn to_detach_ddl(&self) -> String {
        format!(
            "ALTER TABLE {} DETACH PARTITION {}",
            quote_table_name(self.table()),
            quote_table_name(&self.identifier())
        )
    }

    /// The bound expression after `FOR VALUES`
    pub fn bounds_clause(&self) -> String {
        match self {
            Partition::SingleList(p) => p.bounds_clause(),
            Partition::MultiList(p) => p.bounds_clause(),
            Partition::IntRange(p) => p.bounds_clause(),
            Partition::Time(p) => p.bounds_clause(),
        }
    }

    pub async fn holds_data<Q: Queryable + ?Sized>(&self, conn: &Q) -> Result<bool> {
        Ok(conn.holds_data(&self.identifier()).await?)
    }

    fn rank(&self) -> u8 {
        match self {
            Partition::SingleList(_) => 0,
            Partition::MultiList(_) => 1,
            Partition::IntRange(_) => 2,
            Partition::Time(_) => 3,
        }
    }
}

impl Ord for Partition {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Partition::SingleList(a), Partition::SingleList(b)) => a.cmp(b),
            (Partition::MultiList(a), Partition::MultiList(b)) => a.cmp(b),
            (Partition::IntRange(a), Partition::IntRange(b)) => a.cmp(b),
            (Partition::Time(a), Partition::Time(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Partition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<SingleNumericListPartition> for Partition {
    fn from(p: SingleNumericListPartition) -> Self {
        Partition::SingleList(p)
    }
}

impl From<MultiNumericListPartition> for Partition {
    fn from(p: MultiNumericListPartition) -> Self {
        Partition::MultiList(p)
    }
}

impl From<IntRangePartition> for Partition {
    fn from(p: IntRangePartition) -> Self {
        Partition::IntRange(p)
    }
}

impl From<TimePartition> for Partition {
    fn from(p: TimePartition) -> Self {
        Partition::Time(p)
    }
}
