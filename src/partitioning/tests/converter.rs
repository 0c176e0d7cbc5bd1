use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use common::database::{Connection, ConstraintKind, DatabaseError, PostgresConstraint};
use common::lock_retries::WithLockRetries;
use common::testing::{InMemoryDatabase, InMemoryLeaseService, MockProvider, fast_lock_retry_timing};
use partitioning::strategy::CiSlidingListStrategy;
use partitioning::{
    ConvertTable, ManagerSettings, PARTITIONING_CONSTRAINT_NAME, PartitionCondition,
    PartitionManager, PartitionedTable, PartitioningError, PartitioningStrategy, SyncOutcome,
};

fn primary_key(columns: &[&str]) -> PostgresConstraint {
    PostgresConstraint {
        name: "ci_builds_pkey".to_string(),
        kind: ConstraintKind::PrimaryKey,
        valid: true,
        column_names: columns.iter().map(|c| c.to_string()).collect(),
        definition: format!("PRIMARY KEY ({})", columns.join(", ")),
    }
}

fn database(pk_columns: &[&str]) -> Arc<InMemoryDatabase> {
    let db = InMemoryDatabase::new("ci");
    db.create_table("projects");
    db.create_table("ci_builds");
    db.add_constraint("ci_builds", primary_key(pk_columns));
    db.add_foreign_key("ci_builds", "fk_ci_builds_project", "projects");
    db.add_owned_sequence("ci_builds", "ci_builds_id_seq", "id");
    Arc::new(db)
}

fn converter(db: &Arc<InMemoryDatabase>) -> ConvertTable {
    ConvertTable::new(db.clone(), "ci_builds", "p_ci_builds", "partition_id", vec![100])
        .unwrap()
        .with_lock_retries(WithLockRetries::new(fast_lock_retry_timing(3)))
}

#[tokio::test]
async fn test_convert_table_into_first_partition() {
    let db = database(&["id", "partition_id"]);
    let convert = converter(&db).with_locking_order(vec!["projects".to_string(), "ci_builds".to_string()]);

    convert.prepare_for_partitioning().await.unwrap();
    assert!(db.constraint_names("ci_builds").contains(&PARTITIONING_CONSTRAINT_NAME.to_string()));

    convert.partition().await.unwrap();

    assert_eq!(db.partition_names("p_ci_builds"), vec!["ci_builds"]);
    assert_eq!(
        db.sequence_owner("ci_builds_id_seq"),
        Some(("p_ci_builds".to_string(), "id".to_string()))
    );
    let parent_constraints = db.constraint_names("p_ci_builds");
    assert!(parent_constraints.contains(&"fk_ci_builds_project".to_string()));
    assert!(parent_constraints.contains(&"ci_builds_pkey".to_string()));
    assert!(!parent_constraints.contains(&PARTITIONING_CONSTRAINT_NAME.to_string()));
    assert_eq!(
        db.statements_containing("LOCK TABLE"),
        vec!["LOCK TABLE \"projects\", \"ci_builds\" IN ACCESS EXCLUSIVE MODE".to_string()]
    );
}

#[tokio::test]
async fn test_revert_partitioning_restores_the_table() {
    let db = database(&["id", "partition_id"]);
    let convert = converter(&db);
    convert.prepare_for_partitioning().await.unwrap();
    convert.partition().await.unwrap();

    convert.revert_partitioning().await.unwrap();

    assert!(!db.has_table("p_ci_builds"));
    assert!(db.has_table("ci_builds"));
    assert_eq!(
        db.sequence_owner("ci_builds_id_seq"),
        Some(("ci_builds".to_string(), "id".to_string()))
    );
    assert!(db.constraint_names("ci_builds").contains(&PARTITIONING_CONSTRAINT_NAME.to_string()));
}

#[tokio::test]
async fn test_prepare_is_idempotent_and_reversible() {
    let db = database(&["id", "partition_id"]);
    let convert = converter(&db);

    convert.prepare_for_partitioning().await.unwrap();
    assert_eq!(
        db.statements(),
        vec![
            r#"ALTER TABLE "ci_builds" ADD CONSTRAINT "partitioning_constraint" CHECK ("partition_id" = 100) NOT VALID"#
                .to_string(),
            r#"ALTER TABLE "ci_builds" VALIDATE CONSTRAINT "partitioning_constraint""#.to_string(),
        ]
    );

    convert.prepare_for_partitioning().await.unwrap();
    assert_eq!(db.statements_containing("ADD CONSTRAINT \"partitioning_constraint\"").len(), 1);

    convert.revert_preparation_for_partitioning().await.unwrap();
    assert!(!db.constraint_names("ci_builds").contains(&PARTITIONING_CONSTRAINT_NAME.to_string()));
}

#[tokio::test]
async fn test_invalid_constraint_is_validated() {
    let db = database(&["id", "partition_id"]);
    db.add_constraint(
        "ci_builds",
        PostgresConstraint {
            name: "partitioning_constraint".to_string(),
            kind: ConstraintKind::Check,
            valid: false,
            column_names: vec!["partition_id".to_string()],
            definition: "CHECK ((partition_id = 100)) NOT VALID".to_string(),
        },
    );

    converter(&db).prepare_for_partitioning().await.unwrap();

    assert_eq!(
        db.statements(),
        vec![
            "ALTER TABLE \"ci_builds\" VALIDATE CONSTRAINT \"partitioning_constraint\"".to_string()
        ]
    );
}

#[tokio::test]
async fn test_primary_key_without_partitioning_column_is_rejected() {
    let db = database(&["id"]);

    let result = converter(&db).prepare_for_partitioning().await;

    assert!(
        matches!(&result, Err(PartitioningError::UnableToPartition { reason, .. }) if reason.contains("ci_builds_pkey")),
        "{result:?}"
    );
    assert!(db.statements().is_empty());
}

#[tokio::test]
async fn test_partition_requires_preparation() {
    let db = database(&["id", "partition_id"]);

    let result = converter(&db).partition().await;

    assert!(matches!(result, Err(PartitioningError::UnableToPartition { .. })), "{result:?}");
    assert!(!db.has_table("p_ci_builds"));
}

#[tokio::test]
async fn test_partition_fails_once_lock_retries_are_exhausted() {
    let db = database(&["id", "partition_id"]);
    let convert = converter(&db);
    convert.prepare_for_partitioning().await.unwrap();
    db.fail_with_lock_timeout_on("ATTACH PARTITION", 10);

    let result = convert.partition().await;

    assert!(
        matches!(
            result,
            Err(PartitioningError::Database(DatabaseError::LockRetriesExhausted { attempts: 3 }))
        ),
        "{result:?}"
    );
    // Every attempt ran with a lock timeout
    assert_eq!(db.statements_containing("ATTACH PARTITION").len(), 3);
    assert_eq!(db.statements_containing("SET LOCAL lock_timeout").len(), 3);
    assert!(db.partition_names("p_ci_builds").is_empty());
}

#[tokio::test]
async fn test_converted_table_is_maintained_by_the_manager() {
    let time = Arc::new(MockProvider::new(
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap(),
    ));
    let db = database(&["id", "partition_id"]);
    let convert = converter(&db);
    convert.prepare_for_partitioning().await.unwrap();
    convert.partition().await.unwrap();
    assert_eq!(db.partition_names("p_ci_builds"), vec!["ci_builds"]);

    let strategy = CiSlidingListStrategy::new(
        "p_ci_builds",
        "partition_id",
        PartitionCondition::Empty,
        time.clone(),
    )
    .with_analyze_interval(Some(Duration::from_secs(86400)));
    let table = Arc::new(PartitionedTable::new(
        "p_ci_builds",
        "ci",
        PartitioningStrategy::CiSlidingList(strategy),
    ));
    let connection: Arc<dyn Connection> = db.clone();
    let manager = PartitionManager::new(
        table,
        connection,
        Arc::new(InMemoryLeaseService::new(time.clone())),
        time,
        ManagerSettings {
            lock_retries: WithLockRetries::new(fast_lock_retry_timing(3)),
            ..ManagerSettings::default()
        },
    );

    let outcome = manager.sync_partitions(true).await.unwrap();

    assert_eq!(
        outcome,
        SyncOutcome::Synced {
            created: vec!["ci_builds_101".to_string()],
            detached: Vec::new(),
            analyzed: true,
        }
    );
    let mut partitions = db.partition_names("p_ci_builds");
    partitions.sort();
    assert_eq!(partitions, vec!["ci_builds", "ci_builds_101"]);
}
