use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Days, Months, NaiveDate};
use common::config::RetainFor;
use common::database::Queryable;
use common::time::TimeProvider;

use crate::error::{PartitioningError, Result};
use crate::partition::TimePartition;

/// Months of partitions kept ready past the current month
pub const HEADROOM_MONTHS: u32 = 6;

/// One partition per calendar month, optionally pruned after `retain_for`.
#[derive(Debug, Clone)]
pub struct MonthlyStrategy {
    table_name: String,
    partitioning_key: String,
    retain_for: Option<RetainFor>,
    retain_non_empty_partitions: bool,
    analyze_interval: Option<Duration>,
    time_provider: Arc<dyn TimeProvider>,
}

impl MonthlyStrategy {
    pub fn new(
        table_name: &str,
        partitioning_key: &str,
        retain_for: Option<RetainFor>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            table_name: table_name.to_string(),
            partitioning_key: partitioning_key.to_string(),
            retain_for,
            retain_non_empty_partitions: false,
            analyze_interval: None,
            time_provider,
        }
    }

    /// Never report partitions that still hold rows as extra
    pub fn retain_non_empty_partitions(mut self, retain: bool) -> Self {
        self.retain_non_empty_partitions = retain;
        self
    }

    pub fn with_analyze_interval(mut self, interval: Option<Duration>) -> Self {
        self.analyze_interval = interval;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn partitioning_key(&self) -> &str {
        &self.partitioning_key
    }

    pub fn analyze_interval(&self) -> Option<Duration> {
        self.analyze_interval
    }

    pub async fn current_partitions<Q: Queryable + ?Sized>(
        &self,
        conn: &Q,
    ) -> Result<Vec<TimePartition>> {
        let mut partitions = Vec::new();
        for partition in conn.partitions(&self.table_name).await? {
            partitions.push(TimePartition::from_definition(
                &self.table_name,
                &partition.name,
                &partition.condition,
            )?
            .in_schema(&partition.schema));
        }
        partitions.sort();
        Ok(partitions)
    }

    pub(crate) fn missing_partitions(&self, current: &[TimePartition]) -> Result<Vec<TimePartition>> {
        Ok(self
            .desired_partitions(current)?
            .into_iter()
            .filter(|partition| !current.contains(partition))
            .collect())
    }

    pub(crate) async fn extra_partitions<Q: Queryable + ?Sized>(
        &self,
        conn: &Q,
        current: &[TimePartition],
    ) -> Result<Vec<TimePartition>> {
        let desired = self.desired_partitions(current)?;
        let mut extra = Vec::new();
        for partition in current {
            if desired.contains(partition) {
                continue;
            }
            if self.retain_non_empty_partitions
                && conn
                    .holds_data(&partition.identifier())
                    .await?
            {
                continue;
            }
            extra.push(partition.clone());
        }
        Ok(extra)
    }

    fn desired_partitions(&self, current: &[TimePartition]) -> Result<Vec<TimePartition>> {
        let (mut min_date, max_date) = self.relevant_range(current)?;
        let mut partitions = Vec::new();

        match self.oldest_active_date()? {
            Some(oldest_active_date) if min_date <= oldest_active_date => {
                min_date = oldest_active_date;
            }
            _ => partitions.push(TimePartition::new(&self.table_name, None, min_date)?),
        }

        while min_date < max_date {
            let next_date = add_months(min_date, 1)?;
            partitions.push(TimePartition::new(
                &self.table_name,
                Some(min_date),
                next_date,
            )?);
            min_date = next_date;
        }

        Ok(partitions)
    }

    /// Month-aligned range we expect data for, excluding the half-unbounded
    /// first partition.
    fn relevant_range(&self, current: &[TimePartition]) -> Result<(NaiveDate, NaiveDate)> {
        let today = self.time_provider.today();

        let min_date = match current.first() {
            // A first partition starting at MINVALUE is skipped over
            Some(first) => first.from.unwrap_or(first.to),
            None => self.oldest_active_date()?.unwrap_or(today),
        };
        let min_date = beginning_of_month(min_date);

        let max_date = add_months(end_of_month(today)?, HEADROOM_MONTHS)?;
        Ok((min_date, max_date))
    }

    fn oldest_active_date(&self) -> Result<Option<NaiveDate>> {
        let today = self.time_provider.today();
        let oldest = match self.retain_for {
            None => return Ok(None),
            Some(RetainFor::Months(months)) => today.checked_sub_months(Months::new(months)),
            Some(RetainFor::Days(days)) => today.checked_sub_days(Days::new(u64::from(days))),
        };
        oldest
            .map(|date| Some(beginning_of_month(date)))
            .ok_or_else(|| {
                PartitioningError::InvalidArgument(format!(
                    "retention of {} reaches before the supported date range",
                    self.table_name
                ))
            })
    }
}

fn beginning_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn end_of_month(date: NaiveDate) -> Result<NaiveDate> {
    add_months(beginning_of_month(date), 1)?
        .pred_opt()
        .ok_or_else(|| PartitioningError::InvalidArgument(format!("no end of month for {date}")))
}

fn add_months(date: NaiveDate, months: u32) -> Result<NaiveDate> {
    date.checked_add_months(Months::new(months))
        .ok_or_else(|| PartitioningError::InvalidArgument(format!("date overflow after {date}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::testing::MockProvider;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn strategy(retain_for: Option<RetainFor>) -> MonthlyStrategy {
        let time = MockProvider::new(Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap());
        MonthlyStrategy::new("audit_events", "created_at", retain_for, Arc::new(time))
    }

    #[test]
    fn test_desired_partitions_without_existing_partitions() {
        let desired = strategy(None).desired_partitions(&[]).unwrap();

        assert_eq!(desired[0].from, None);
        assert_eq!(desired[0].to, date(2024, 3, 1));
        assert_eq!(desired[0].partition_name, "audit_events_000000");

        // March through September (end of March + 6 months)
        let monthly: Vec<_> = desired[1..].iter().map(|p| p.from.unwrap()).collect();
        assert_eq!(monthly.first(), Some(&date(2024, 3, 1)));
        assert_eq!(monthly.last(), Some(&date(2024, 9, 1)));
        assert_eq!(monthly.len(), 7);
    }

    #[test]
    fn test_oldest_active_date() {
        assert_eq!(
            strategy(Some(RetainFor::Months(2))).oldest_active_date().unwrap(),
            Some(date(2024, 1, 1))
        );
        assert_eq!(
            strategy(Some(RetainFor::Days(30))).oldest_active_date().unwrap(),
            Some(date(2024, 2, 1))
        );
        assert_eq!(strategy(None).oldest_active_date().unwrap(), None);
    }

    #[test]
    fn test_end_of_month() {
        assert_eq!(end_of_month(date(2024, 2, 10)).unwrap(), date(2024, 2, 29));
        assert_eq!(end_of_month(date(2023, 12, 31)).unwrap(), date(2023, 12, 31));
    }
}
