//! In-memory stand-in for a PostgreSQL database.
//!
//! Models just enough of the catalog for partition maintenance: tables and
//! partitions with their bound expressions, column defaults, constraints,
//! foreign keys, owned sequences, analyze statistics and the detached
//! partition bookkeeping rows. The DDL emitted by the partitioning crate is
//! interpreted and applied; anything else fails with
//! [`DatabaseError::Unsupported`]. Every executed statement is recorded.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;

use crate::database::{
    ConstraintKind, Connection, DYNAMIC_PARTITIONS_SCHEMA, DatabaseError, DetachedPartition,
    OwnedSequence, PostgresConstraint, PostgresForeignKey, PostgresPartition, Queryable,
    Transaction, ValueBound,
};
use crate::time::{SystemProvider, TimeProvider};

const IDENT: &str = r#"(?:"[^"]+"|[\w$]+)(?:\.(?:"[^"]+"|[\w$]+))?"#;

fn statement_regex(pattern: &str) -> Regex {
    Regex::new(&format!("(?is)^{}$", pattern.replace("IDENT", IDENT))).expect("valid regex")
}

static CREATE_PARTITION: Lazy<Regex> = Lazy::new(|| {
    statement_regex(r"CREATE TABLE IF NOT EXISTS (IDENT) PARTITION OF (IDENT) (FOR VALUES .+)")
});
static CREATE_PARTITIONED_LIKE: Lazy<Regex> = Lazy::new(|| {
    statement_regex(
        r"CREATE TABLE IF NOT EXISTS (IDENT) \(LIKE (IDENT) INCLUDING ALL\) PARTITION BY LIST\s*\((IDENT)\)",
    )
});
static DETACH_PARTITION: Lazy<Regex> =
    Lazy::new(|| statement_regex(r"ALTER TABLE (IDENT) DETACH PARTITION (IDENT)"));
static ATTACH_PARTITION: Lazy<Regex> = Lazy::new(|| {
    statement_regex(r"ALTER TABLE (IDENT) ATTACH PARTITION (IDENT) (FOR VALUES .+)")
});
static DROP_TABLE: Lazy<Regex> =
    Lazy::new(|| statement_regex(r"DROP TABLE (?:IF EXISTS )?(IDENT)"));
static SET_DEFAULT: Lazy<Regex> = Lazy::new(|| {
    statement_regex(r"ALTER TABLE (IDENT) ALTER COLUMN (IDENT) SET DEFAULT (.+)")
});
static DROP_CONSTRAINT: Lazy<Regex> = Lazy::new(|| {
    statement_regex(r"ALTER TABLE (IDENT) DROP CONSTRAINT (?:IF EXISTS )?(IDENT)")
});
static ADD_CHECK: Lazy<Regex> = Lazy::new(|| {
    statement_regex(r"ALTER TABLE (IDENT) ADD CONSTRAINT (IDENT) CHECK \((IDENT) (?:= (\d+)|IN \(([\d, ]+)\))\)( NOT VALID)?")
});
static VALIDATE_CONSTRAINT: Lazy<Regex> = Lazy::new(|| {
    statement_regex(r"ALTER TABLE (IDENT) VALIDATE CONSTRAINT (IDENT)")
});
static ADD_FOREIGN_KEY: Lazy<Regex> = Lazy::new(|| {
    statement_regex(r"ALTER TABLE (IDENT) ADD CONSTRAINT (IDENT) (FOREIGN KEY .+ REFERENCES (IDENT)\s*\(.+)")
});
static SEQUENCE_OWNED_BY: Lazy<Regex> =
    Lazy::new(|| statement_regex(r"ALTER SEQUENCE (IDENT) OWNED BY (.+)"));
static CREATE_TRIGGER: Lazy<Regex> =
    Lazy::new(|| statement_regex(r"CREATE TRIGGER (IDENT) .+? ON (IDENT) .+"));
static ANALYZE: Lazy<Regex> =
    Lazy::new(|| statement_regex(r"ANALYZE (?:\(SKIP_LOCKED\) )?(IDENT)"));
static LOCK_TABLE: Lazy<Regex> = Lazy::new(|| statement_regex(r"LOCK TABLE .+ IN [A-Z ]+ MODE"));
static SET_LOCAL: Lazy<Regex> = Lazy::new(|| statement_regex(r"SET LOCAL \w+ TO .+"));

/// Strip quotes and qualify with `public` when no schema is given.
fn normalize(name: &str) -> String {
    let name = name.trim().replace('"', "");
    if name.contains('.') {
        name
    } else {
        format!("public.{name}")
    }
}

/// Inverse of [`normalize`] for names reported back to callers.
fn display_name(key: &str) -> String {
    key.strip_prefix("public.").unwrap_or(key).to_string()
}

fn bare_name(key: &str) -> &str {
    key.rsplit('.').next().unwrap_or(key)
}

#[derive(Debug, Clone, Default)]
struct FakeTable {
    partitioned: bool,
    parent: Option<String>,
    bound: Option<String>,
    rows: usize,
    timestamps: HashMap<String, Vec<DateTime<Utc>>>,
    defaults: HashMap<String, String>,
    constraints: Vec<PostgresConstraint>,
    foreign_keys: Vec<PostgresForeignKey>,
    owned_sequences: Vec<OwnedSequence>,
    sequence_min_values: HashMap<String, i64>,
    last_analyzed_at: Option<DateTime<Utc>>,
    triggers: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct State {
    tables: BTreeMap<String, FakeTable>,
    detached: Vec<DetachedPartition>,
    next_detached_id: i64,
}

impl State {
    fn table(&self, name: &str) -> Option<&FakeTable> {
        self.tables.get(&normalize(name))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut FakeTable, DatabaseError> {
        let key = normalize(name);
        self.tables
            .get_mut(&key)
            .ok_or_else(|| DatabaseError::Other(format!("relation \"{key}\" does not exist")))
    }

    fn apply(&mut self, sql: &str, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        let sql = sql.trim().trim_end_matches(';');

        if SET_LOCAL.is_match(sql) || LOCK_TABLE.is_match(sql) {
            return Ok(());
        }

        if let Some(caps) = CREATE_PARTITION.captures(sql) {
            let partition = normalize(&caps[1]);
            let parent = normalize(&caps[2]);
            if self.tables.contains_key(&partition) {
                return Ok(());
            }
            let parent_table = self.table_mut(&parent)?;
            if !parent_table.partitioned {
                return Err(DatabaseError::Other(format!("\"{parent}\" is not partitioned")));
            }
            let defaults = parent_table.defaults.clone();
            self.tables.insert(
                partition,
                FakeTable {
                    parent: Some(parent),
                    bound: Some(caps[3].to_string()),
                    defaults,
                    ..FakeTable::default()
                },
            );
            return Ok(());
        }

        if let Some(caps) = CREATE_PARTITIONED_LIKE.captures(sql) {
            let parent = normalize(&caps[1]);
            if self.tables.contains_key(&parent) {
                return Ok(());
            }
            let source = self.table_mut(&caps[2])?.clone();
            self.tables.insert(
                parent,
                FakeTable {
                    partitioned: true,
                    defaults: source.defaults,
                    constraints: source.constraints,
                    ..FakeTable::default()
                },
            );
            return Ok(());
        }

        if let Some(caps) = DETACH_PARTITION.captures(sql) {
            let parent = normalize(&caps[1]);
            let partition = self.table_mut(&caps[2])?;
            if partition.parent.as_deref() != Some(parent.as_str()) {
                return Err(DatabaseError::Other(format!(
                    "\"{}\" is not a partition of \"{parent}\"",
                    &caps[2]
                )));
            }
            partition.parent = None;
            return Ok(());
        }

        if let Some(caps) = ATTACH_PARTITION.captures(sql) {
            let parent = normalize(&caps[1]);
            if !self.table(&parent).is_some_and(|t| t.partitioned) {
                return Err(DatabaseError::Other(format!("\"{parent}\" is not partitioned")));
            }
            let partition = self.table_mut(&caps[2])?;
            partition.parent = Some(parent);
            partition.bound = Some(caps[3].to_string());
            return Ok(());
        }

        if let Some(caps) = DROP_TABLE.captures(sql) {
            let key = normalize(&caps[1]);
            if self.tables.remove(&key).is_none() {
                if sql.to_uppercase().contains("IF EXISTS") {
                    return Ok(());
                }
                return Err(DatabaseError::Other(format!("table \"{key}\" does not exist")));
            }
            self.tables.retain(|_, t| t.parent.as_deref() != Some(key.as_str()));
            let referenced = display_name(&key);
            for table in self.tables.values_mut() {
                table
                    .foreign_keys
                    .retain(|fk| normalize(&fk.referenced_table) != normalize(&referenced));
            }
            return Ok(());
        }

        if let Some(caps) = SET_DEFAULT.captures(sql) {
            let column = caps[2].replace('"', "");
            let value = caps[3].to_string();
            let key = normalize(&caps[1]);
            self.table_mut(&key)?.defaults.insert(column.clone(), value.clone());
            for table in self.tables.values_mut() {
                if table.parent.as_deref() == Some(key.as_str()) {
                    table.defaults.insert(column.clone(), value.clone());
                }
            }
            return Ok(());
        }

        if let Some(caps) = DROP_CONSTRAINT.captures(sql) {
            let name = caps[2].replace('"', "");
            let if_exists = sql.to_uppercase().contains("IF EXISTS");
            let table = self.table_mut(&caps[1])?;
            let before = table.constraints.len() + table.foreign_keys.len();
            table.constraints.retain(|c| c.name != name);
            table.foreign_keys.retain(|fk| fk.name != name);
            if before == table.constraints.len() + table.foreign_keys.len() && !if_exists {
                return Err(DatabaseError::Other(format!(
                    "constraint \"{name}\" does not exist"
                )));
            }
            return Ok(());
        }

        if let Some(caps) = ADD_CHECK.captures(sql) {
            let name = caps[2].replace('"', "");
            let column = caps[3].replace('"', "");
            let definition = match (caps.get(4), caps.get(5)) {
                (Some(value), _) => format!("CHECK (({column} = {}))", value.as_str()),
                (None, Some(values)) => {
                    let values = values
                        .as_str()
                        .split(',')
                        .map(|v| format!("({})::bigint", v.trim()))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("CHECK (({column} = ANY (ARRAY[{values}])))")
                }
                (None, None) => return Err(DatabaseError::Unsupported(sql.to_string())),
            };
            let valid = caps.get(6).is_none();
            let table = self.table_mut(&caps[1])?;
            table.constraints.push(PostgresConstraint {
                name,
                kind: ConstraintKind::Check,
                valid,
                column_names: vec![column],
                definition,
            });
            return Ok(());
        }

        if let Some(caps) = VALIDATE_CONSTRAINT.captures(sql) {
            let name = caps[2].replace('"', "");
            let table = self.table_mut(&caps[1])?;
            let constraint = table
                .constraints
                .iter_mut()
                .find(|c| c.name == name)
                .ok_or_else(|| DatabaseError::Other(format!("constraint \"{name}\" does not exist")))?;
            constraint.valid = true;
            return Ok(());
        }

        if let Some(caps) = ADD_FOREIGN_KEY.captures(sql) {
            let constrained = normalize(&caps[1]);
            let foreign_key = PostgresForeignKey {
                name: caps[2].replace('"', ""),
                constrained_table: constrained.clone(),
                referenced_table: normalize(&caps[4]),
                definition: caps[3].to_string(),
            };
            self.table_mut(&constrained)?.foreign_keys.push(foreign_key);
            return Ok(());
        }

        if let Some(caps) = SEQUENCE_OWNED_BY.captures(sql) {
            let sequence = normalize(&caps[1]);
            let target = caps[2].replace('"', "");
            let (table, column) = target
                .rsplit_once('.')
                .ok_or_else(|| DatabaseError::Unsupported(sql.to_string()))?;
            for t in self.tables.values_mut() {
                t.owned_sequences.retain(|s| normalize(&s.name) != sequence);
            }
            self.table_mut(table)?.owned_sequences.push(OwnedSequence {
                name: sequence,
                column_name: column.to_string(),
            });
            return Ok(());
        }

        if let Some(caps) = CREATE_TRIGGER.captures(sql) {
            let name = caps[1].replace('"', "");
            let table = self.table_mut(&caps[2])?;
            if table.triggers.contains(&name) {
                return Err(DatabaseError::Other(format!("trigger \"{name}\" already exists")));
            }
            table.triggers.push(name);
            return Ok(());
        }

        if let Some(caps) = ANALYZE.captures(sql) {
            let key = normalize(&caps[1]);
            self.table_mut(&key)?.last_analyzed_at = Some(now);
            for table in self.tables.values_mut() {
                if table.parent.as_deref() == Some(key.as_str()) {
                    table.last_analyzed_at = Some(now);
                }
            }
            return Ok(());
        }

        Err(DatabaseError::Unsupported(sql.to_string()))
    }
}

#[derive(Debug)]
struct Shared {
    statements: Mutex<Vec<String>>,
    lock_timeouts_remaining: Mutex<usize>,
    lock_timeouts_by_pattern: Mutex<Vec<(String, usize)>>,
    failing_statements: Mutex<Vec<String>>,
    time_provider: Arc<dyn TimeProvider>,
}

/// One view of the state: the committed state for the database itself or a
/// private copy for an open transaction.
#[derive(Debug, Clone)]
struct Session {
    state: Arc<Mutex<State>>,
    shared: Arc<Shared>,
}

impl Session {
    fn execute(&self, sql: &str) -> Result<(), DatabaseError> {
        self.shared.statements.lock().push(sql.trim().to_string());

        if !SET_LOCAL.is_match(sql.trim()) {
            let mut remaining = self.shared.lock_timeouts_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DatabaseError::LockTimeout);
            }
            if let Some((_, remaining)) = self
                .shared
                .lock_timeouts_by_pattern
                .lock()
                .iter_mut()
                .find(|(pattern, remaining)| *remaining > 0 && sql.contains(pattern.as_str()))
            {
                *remaining -= 1;
                return Err(DatabaseError::LockTimeout);
            }
        }
        if let Some(pattern) = self
            .shared
            .failing_statements
            .lock()
            .iter()
            .find(|pattern| sql.contains(pattern.as_str()))
        {
            return Err(DatabaseError::Other(format!("scripted failure: {pattern}")));
        }

        self.state.lock().apply(sql, self.shared.time_provider.now())
    }

    fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        f(&self.state.lock())
    }
}

/// In-memory [`Connection`] for tests.
#[derive(Debug, Clone)]
pub struct InMemoryDatabase {
    name: String,
    load_balanced: bool,
    session: Session,
}

impl InMemoryDatabase {
    pub fn new(name: &str) -> Self {
        Self::with_time_provider(name, Arc::new(SystemProvider::new()))
    }

    /// The clock stamps `ANALYZE` statistics
    pub fn with_time_provider(name: &str, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            name: name.to_string(),
            load_balanced: false,
            session: Session {
                state: Arc::new(Mutex::new(State::default())),
                shared: Arc::new(Shared {
                    statements: Mutex::new(Vec::new()),
                    lock_timeouts_remaining: Mutex::new(0),
                    lock_timeouts_by_pattern: Mutex::new(Vec::new()),
                    failing_statements: Mutex::new(Vec::new()),
                    time_provider,
                }),
            },
        }
    }

    pub fn set_load_balanced(&mut self, load_balanced: bool) {
        self.load_balanced = load_balanced;
    }

    pub fn create_table(&self, name: &str) {
        self.session
            .state
            .lock()
            .tables
            .entry(normalize(name))
            .or_default();
    }

    pub fn create_partitioned_table(&self, name: &str) {
        self.session
            .state
            .lock()
            .tables
            .entry(normalize(name))
            .or_default()
            .partitioned = true;
    }

    /// Attach `partition` (bare names land in the partitions schema) with a
    /// catalog-style bound such as `FOR VALUES IN ('1')`.
    pub fn attach_partition(&self, parent: &str, partition: &str, condition: &str) {
        let key = if partition.contains('.') {
            normalize(partition)
        } else {
            format!("{DYNAMIC_PARTITIONS_SCHEMA}.{partition}")
        };
        let mut state = self.session.state.lock();
        let parent = normalize(parent);
        let defaults = state
            .tables
            .get(&parent)
            .map(|t| t.defaults.clone())
            .unwrap_or_default();
        let table = state.tables.entry(key).or_default();
        table.parent = Some(parent);
        table.bound = Some(condition.to_string());
        table.defaults = defaults;
    }

    pub fn insert_rows(&self, table: &str, rows: usize) {
        if let Some(t) = self.session.state.lock().tables.get_mut(&normalize(table)) {
            t.rows += rows;
        }
    }

    /// Insert one row per timestamp into `table`
    pub fn insert_timestamps(&self, table: &str, column: &str, values: &[DateTime<Utc>]) {
        if let Some(t) = self.session.state.lock().tables.get_mut(&normalize(table)) {
            t.rows += values.len();
            t.timestamps
                .entry(column.to_string())
                .or_default()
                .extend_from_slice(values);
        }
    }

    /// Raw default expression, as `information_schema` would report it
    pub fn set_column_default(&self, table: &str, column: &str, default: &str) {
        if let Some(t) = self.session.state.lock().tables.get_mut(&normalize(table)) {
            t.defaults.insert(column.to_string(), default.to_string());
        }
    }

    pub fn add_foreign_key(&self, constrained: &str, name: &str, referenced: &str) {
        let definition = format!("FOREIGN KEY (id) REFERENCES {referenced}(id)");
        if let Some(t) = self
            .session
            .state
            .lock()
            .tables
            .get_mut(&normalize(constrained))
        {
            t.foreign_keys.push(PostgresForeignKey {
                name: name.to_string(),
                constrained_table: normalize(constrained),
                referenced_table: normalize(referenced),
                definition,
            });
        }
    }

    pub fn add_constraint(&self, table: &str, constraint: PostgresConstraint) {
        if let Some(t) = self.session.state.lock().tables.get_mut(&normalize(table)) {
            t.constraints.push(constraint);
        }
    }

    pub fn add_owned_sequence(&self, table: &str, sequence: &str, column: &str) {
        if let Some(t) = self.session.state.lock().tables.get_mut(&normalize(table)) {
            t.owned_sequences.push(OwnedSequence {
                name: normalize(sequence),
                column_name: column.to_string(),
            });
        }
    }

    pub fn set_sequence_min_value(&self, table: &str, column: &str, min_value: i64) {
        if let Some(t) = self.session.state.lock().tables.get_mut(&normalize(table)) {
            t.sequence_min_values.insert(column.to_string(), min_value);
        }
    }

    pub fn set_last_analyzed_at(&self, table: &str, at: DateTime<Utc>) {
        if let Some(t) = self.session.state.lock().tables.get_mut(&normalize(table)) {
            t.last_analyzed_at = Some(at);
        }
    }

    /// Make the next `count` statements fail as if `lock_timeout` expired.
    /// `SET LOCAL` statements are not affected.
    pub fn fail_with_lock_timeout(&self, count: usize) {
        *self.session.shared.lock_timeouts_remaining.lock() = count;
    }

    /// Make the next `count` statements containing `pattern` fail with a
    /// lock timeout.
    pub fn fail_with_lock_timeout_on(&self, pattern: &str, count: usize) {
        self.session
            .shared
            .lock_timeouts_by_pattern
            .lock()
            .push((pattern.to_string(), count));
    }

    /// Make every statement containing `pattern` fail
    pub fn fail_statements_containing(&self, pattern: &str) {
        self.session
            .shared
            .failing_statements
            .lock()
            .push(pattern.to_string());
    }

    /// Every statement executed so far, including failed and rolled back ones
    pub fn statements(&self) -> Vec<String> {
        self.session.shared.statements.lock().clone()
    }

    pub fn statements_containing(&self, pattern: &str) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| s.contains(pattern))
            .collect()
    }

    pub fn clear_statements(&self) {
        self.session.shared.statements.lock().clear();
    }

    /// Bare names of the partitions attached to `parent`, sorted
    pub fn partition_names(&self, parent: &str) -> Vec<String> {
        let parent = normalize(parent);
        self.session.read(|state| {
            state
                .tables
                .iter()
                .filter(|(_, t)| t.parent.as_deref() == Some(parent.as_str()))
                .map(|(key, _)| bare_name(key).to_string())
                .collect()
        })
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.session.read(|state| state.table(name).is_some())
    }

    pub fn triggers(&self, table: &str) -> Vec<String> {
        self.session
            .read(|state| state.table(table).map(|t| t.triggers.clone()).unwrap_or_default())
    }

    pub fn defaults(&self, table: &str, column: &str) -> Option<String> {
        self.session
            .read(|state| state.table(table).and_then(|t| t.defaults.get(column).cloned()))
    }

    pub fn constraint_names(&self, table: &str) -> Vec<String> {
        self.session.read(|state| {
            state
                .table(table)
                .map(|t| {
                    t.constraints
                        .iter()
                        .map(|c| c.name.clone())
                        .chain(t.foreign_keys.iter().map(|fk| fk.name.clone()))
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    pub fn sequence_owner(&self, sequence: &str) -> Option<(String, String)> {
        let sequence = normalize(sequence);
        self.session.read(|state| {
            state.tables.iter().find_map(|(key, t)| {
                t.owned_sequences
                    .iter()
                    .find(|s| normalize(&s.name) == sequence)
                    .map(|s| (display_name(key), s.column_name.clone()))
            })
        })
    }

    pub fn detached_records(&self) -> Vec<DetachedPartition> {
        self.session.read(|state| state.detached.clone())
    }
}

macro_rules! impl_queryable {
    ($ty:ty) => {
        #[async_trait]
        impl Queryable for $ty {
            async fn execute(&self, sql: &str) -> Result<(), DatabaseError> {
                self.session.execute(sql)
            }

            async fn table_exists(&self, table: &str) -> Result<bool, DatabaseError> {
                Ok(self.session.read(|s| s.table(table).is_some()))
            }

            async fn is_partitioned(&self, table: &str) -> Result<bool, DatabaseError> {
                Ok(self
                    .session
                    .read(|s| s.table(table).is_some_and(|t| t.partitioned)))
            }

            async fn partitions(
                &self,
                parent: &str,
            ) -> Result<Vec<PostgresPartition>, DatabaseError> {
                let key = normalize(parent);
                Ok(self.session.read(|s| {
                    s.tables
                        .iter()
                        .filter(|(_, t)| t.parent.as_deref() == Some(key.as_str()))
                        .map(|(name, t)| {
                            let (schema, bare) = name.split_once('.').unwrap_or(("public", name.as_str()));
                            PostgresPartition {
                                parent_table: parent.to_string(),
                                schema: schema.to_string(),
                                name: bare.to_string(),
                                condition: t.bound.clone().unwrap_or_default(),
                            }
                        })
                        .collect()
                }))
            }

            async fn partition_parent(&self, table: &str) -> Result<Option<String>, DatabaseError> {
                Ok(self.session.read(|s| {
                    s.table(table)
                        .and_then(|t| t.parent.as_deref().map(display_name))
                }))
            }

            async fn holds_data(&self, table: &str) -> Result<bool, DatabaseError> {
                let key = normalize(table);
                self.session.read(|s| {
                    let own = s
                        .tables
                        .get(&key)
                        .map(|t| t.rows)
                        .ok_or_else(|| DatabaseError::Other(format!("relation \"{key}\" does not exist")))?;
                    let children: usize = s
                        .tables
                        .values()
                        .filter(|t| t.parent.as_deref() == Some(key.as_str()))
                        .map(|t| t.rows)
                        .sum();
                    Ok(own + children > 0)
                })
            }

            async fn timestamp_bound(
                &self,
                table: &str,
                column: &str,
                bound: ValueBound,
            ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
                Ok(self.session.read(|s| {
                    let values = s.table(table).and_then(|t| t.timestamps.get(column))?;
                    match bound {
                        ValueBound::Min => values.iter().min().copied(),
                        ValueBound::Max => values.iter().max().copied(),
                    }
                }))
            }

            async fn column_default(
                &self,
                table: &str,
                column: &str,
            ) -> Result<Option<String>, DatabaseError> {
                Ok(self
                    .session
                    .read(|s| s.table(table).and_then(|t| t.defaults.get(column).cloned())))
            }

            async fn sequence_min_value(
                &self,
                table: &str,
                column: &str,
            ) -> Result<Option<i64>, DatabaseError> {
                Ok(self.session.read(|s| {
                    s.table(table)
                        .and_then(|t| t.sequence_min_values.get(column).copied())
                }))
            }

            async fn foreign_keys_referencing(
                &self,
                table: &str,
            ) -> Result<Vec<PostgresForeignKey>, DatabaseError> {
                let key = normalize(table);
                Ok(self.session.read(|s| {
                    s.tables
                        .values()
                        .flat_map(|t| t.foreign_keys.iter())
                        .filter(|fk| normalize(&fk.referenced_table) == key)
                        .cloned()
                        .collect()
                }))
            }

            async fn foreign_keys_constrained_by(
                &self,
                table: &str,
            ) -> Result<Vec<PostgresForeignKey>, DatabaseError> {
                Ok(self
                    .session
                    .read(|s| s.table(table).map(|t| t.foreign_keys.clone()).unwrap_or_default()))
            }

            async fn constraints(
                &self,
                table: &str,
            ) -> Result<Vec<PostgresConstraint>, DatabaseError> {
                Ok(self
                    .session
                    .read(|s| s.table(table).map(|t| t.constraints.clone()).unwrap_or_default()))
            }

            async fn owned_sequences(
                &self,
                table: &str,
            ) -> Result<Vec<OwnedSequence>, DatabaseError> {
                Ok(self.session.read(|s| {
                    s.table(table)
                        .map(|t| t.owned_sequences.clone())
                        .unwrap_or_default()
                }))
            }

            async fn last_analyzed_at(
                &self,
                table: &str,
            ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
                Ok(self
                    .session
                    .read(|s| s.table(table).and_then(|t| t.last_analyzed_at)))
            }

            async fn detached_partitions_ready_to_drop(
                &self,
                now: DateTime<Utc>,
            ) -> Result<Vec<DetachedPartition>, DatabaseError> {
                Ok(self.session.read(|s| {
                    s.detached
                        .iter()
                        .filter(|d| d.drop_after < now)
                        .cloned()
                        .collect()
                }))
            }

            async fn lock_detached_partition(
                &self,
                id: i64,
            ) -> Result<Option<DetachedPartition>, DatabaseError> {
                Ok(self
                    .session
                    .read(|s| s.detached.iter().find(|d| d.id == id).cloned()))
            }

            async fn insert_detached_partition(
                &self,
                table_name: &str,
                drop_after: DateTime<Utc>,
            ) -> Result<(), DatabaseError> {
                let mut state = self.session.state.lock();
                if let Some(existing) = state.detached.iter_mut().find(|d| d.table_name == table_name) {
                    existing.drop_after = drop_after;
                    return Ok(());
                }
                state.next_detached_id += 1;
                let id = state.next_detached_id;
                state.detached.push(DetachedPartition {
                    id,
                    table_name: table_name.to_string(),
                    drop_after,
                });
                Ok(())
            }

            async fn delete_detached_partition(&self, id: i64) -> Result<(), DatabaseError> {
                self.session.state.lock().detached.retain(|d| d.id != id);
                Ok(())
            }
        }
    };
}

impl_queryable!(InMemoryDatabase);
impl_queryable!(InMemoryTransaction);

#[async_trait]
impl Connection for InMemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_balanced(&self) -> bool {
        self.load_balanced
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, DatabaseError> {
        let snapshot = self.session.state.lock().clone();
        Ok(Box::new(InMemoryTransaction {
            committed: self.session.state.clone(),
            session: Session {
                state: Arc::new(Mutex::new(snapshot)),
                shared: self.session.shared.clone(),
            },
        }))
    }
}

/// Works on a private copy of the state that replaces the committed state
/// on commit. Concurrent transactions are last-writer-wins.
#[derive(Debug)]
pub struct InMemoryTransaction {
    committed: Arc<Mutex<State>>,
    session: Session,
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let state = self.session.state.lock().clone();
        *self.committed.lock() = state;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        Ok(())
    }
}
