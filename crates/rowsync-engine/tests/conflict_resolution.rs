//! Conflict resolution against the in-memory target database

mod common;

use common::*;
use rowsync_engine::prelude::*;
use rowsync_rdbc::prelude::{Row, Value};
use std::time::Duration;

fn newer_wins_by_timestamp(row_only: bool) -> ConflictPolicy {
    ConflictPolicy::new("item_ts", ResolveType::NewerWins, DetectType::UseTimestamp)
        .for_table("item")
        .with_detect_expression("updated_at")
        .with_resolve_row_only(row_only)
}

fn find(fixture: &ApplyFixture, id: i64) -> Option<Row> {
    fixture.db.find("item", &Row::default().with("id", id))
}

#[tokio::test]
async fn test_insert_conflict_falls_back_to_update() {
    init_test_logging();
    let f = ApplyFixture::new(item_database(), vec![]);
    f.db.seed_row("item", item(1, "pen", 10)).unwrap();

    let result = f.apply(&[insert(1, "item", item(1, "pen", 12))]).await;

    assert!(result.is_ok());
    assert_eq!(result.statistics.fallback_update_count, 1);
    assert_eq!(result.statistics.insert_count, 0);
    assert_eq!(result.statistics.update_count, 1);
    assert_eq!(
        find(&f, 1).unwrap().get_by_name("price"),
        Some(&Value::Int64(12))
    );
    assert_eq!(f.engine.stats().fallback_updates, 1);
}

#[tokio::test]
async fn test_insert_newer_wins_by_timestamp() {
    init_test_logging();
    let f = ApplyFixture::new(item_database(), vec![newer_wins_by_timestamp(true)]);
    f.db.seed_row(
        "item",
        item(1, "pen", 10).with("updated_at", "2024-03-01 10:00:00"),
    )
    .unwrap();

    // Destination is older: the incoming row wins through an update
    let newer = item(1, "pen", 12).with("updated_at", "2024-03-01 11:00:00");
    let result = f.apply(&[insert(1, "item", newer)]).await;
    assert!(result.is_ok());
    assert_eq!(result.statistics.fallback_update_count, 1);
    assert_eq!(
        find(&f, 1).unwrap().get_by_name("price"),
        Some(&Value::Int64(12))
    );

    // Destination is newer or equal: the row is skipped and the batch continues
    let older = item(1, "pen", 5).with("updated_at", "2024-03-01 09:00:00");
    let same = item(1, "pen", 6).with("updated_at", "2024-03-01 11:00:00");
    let result = f
        .apply(&[
            insert(2, "item", older),
            insert(3, "item", same),
            insert(4, "item", item(2, "ink", 3)),
        ])
        .await;
    assert!(result.is_ok());
    assert_eq!(result.statistics.ignore_count, 2);
    assert_eq!(result.statistics.insert_count, 1);
    assert_eq!(
        find(&f, 1).unwrap().get_by_name("price"),
        Some(&Value::Int64(12))
    );
}

#[tokio::test]
async fn test_newer_wins_aborts_batch_without_row_only() {
    init_test_logging();
    let f = ApplyFixture::new(item_database(), vec![newer_wins_by_timestamp(false)]);
    f.db.seed_row(
        "item",
        item(1, "pen", 10).with("updated_at", "2024-03-01 10:00:00"),
    )
    .unwrap();

    let stale = item(1, "pen", 5).with("updated_at", "2024-02-01 00:00:00");
    let batch_id = f.sent_batch().await;
    let result = f
        .engine
        .apply_batch(
            batch_id,
            &[insert(1, "item", item(2, "ink", 3)), insert(2, "item", stale)],
            &ResolvedRows::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, BatchStatus::Error);
    assert!(matches!(
        result.failure,
        Some(BatchFailure::Aborted { line_number: 2, .. })
    ));
    // The row applied before the abort was rolled back
    assert!(find(&f, 2).is_none());
    assert!(!f.db.has_pending_work());

    let batch = f.registry.get(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Error);
    assert!(batch.error_message.unwrap().contains("line 2"));
}

#[tokio::test]
async fn test_update_of_missing_row_falls_back_to_insert() {
    init_test_logging();
    let f = ApplyFixture::new(item_database(), vec![]);

    let result = f
        .apply(&[update(1, "item", item(1, "pen", 10), item(1, "pen", 12))])
        .await;

    assert!(result.is_ok());
    assert_eq!(result.statistics.fallback_insert_count, 1);
    let row = find(&f, 1).unwrap();
    assert_eq!(row.get_by_name("name"), Some(&Value::from("pen")));
    assert_eq!(row.get_by_name("price"), Some(&Value::Int64(12)));
}

#[tokio::test]
async fn test_update_fallback_retries_update_at_most_once() {
    init_test_logging();
    let f = ApplyFixture::new(item_database(), vec![]);
    f.db.seed_row("item", item(2, "ink", 3)).unwrap();

    // Key moves from 1 (absent) to 2 (taken): update misses, insert collides,
    // the second update misses again and the conflict is reported
    let result = f
        .apply(&[update(1, "item", item(1, "pen", 10), item(2, "pen", 12))])
        .await;

    assert_eq!(result.status, BatchStatus::Error);
    assert!(matches!(
        result.failure,
        Some(BatchFailure::Conflict { line_number: 1, ref table, .. }) if table == "item"
    ));
    assert_eq!(result.statistics.statement_count, 3);
    assert_eq!(f.db.statements().len(), 3);
    assert_eq!(
        find(&f, 2).unwrap().get_by_name("name"),
        Some(&Value::from("ink"))
    );
}

#[tokio::test]
async fn test_update_newer_wins_by_version() {
    init_test_logging();
    let policy = ConflictPolicy::new("item_v", ResolveType::NewerWins, DetectType::UseVersion)
        .with_detect_expression("version");
    let f = ApplyFixture::new(item_database(), vec![policy]);
    f.db.seed_row("item", item(1, "pen", 10).with("version", 3))
        .unwrap();

    // The old version no longer matches, but version 4 beats the stored 3
    let result = f
        .apply(&[update(
            1,
            "item",
            item(1, "pen", 10).with("version", 2),
            item(1, "pen", 11).with("version", 4),
        )])
        .await;
    assert!(result.is_ok());
    assert_eq!(result.statistics.fallback_update_count, 1);
    let row = find(&f, 1).unwrap();
    assert_eq!(row.get_by_name("version"), Some(&Value::Int32(4)));

    // Version 4 does not beat the stored 4
    let result = f
        .apply(&[update(
            2,
            "item",
            item(1, "pen", 10).with("version", 2),
            item(1, "pen", 99).with("version", 4),
        )])
        .await;
    assert!(result.is_ok());
    assert_eq!(result.statistics.ignore_count, 1);
    assert_eq!(
        find(&f, 1).unwrap().get_by_name("price"),
        Some(&Value::Int64(11))
    );
}

#[tokio::test]
async fn test_delete_of_missing_row_counts_missing_delete() {
    init_test_logging();
    let f = ApplyFixture::new(item_database(), vec![]);

    let result = f.apply(&[delete(1, "item", 7)]).await;

    assert!(result.is_ok());
    assert!(result.failure.is_none());
    assert_eq!(result.statistics.missing_delete_count, 1);
    assert_eq!(result.statistics.statement_count, 1);
    assert_eq!(f.engine.stats().missing_deletes, 1);
}

#[tokio::test]
async fn test_delete_retries_without_detect_column() {
    init_test_logging();
    let policy = newer_wins_by_timestamp(true);
    let policy = ConflictPolicy {
        resolve_type: ResolveType::Fallback,
        ..policy
    };
    let f = ApplyFixture::new(item_database(), vec![policy]);
    f.db.seed_row(
        "item",
        item(1, "pen", 10).with("updated_at", "2024-03-01 10:00:00"),
    )
    .unwrap();

    let change = delete(1, "item", 1)
        .with_old_values(item(1, "pen", 10).with("updated_at", "2024-01-01 00:00:00"));
    let result = f.apply(&[change]).await;

    assert!(result.is_ok());
    assert_eq!(result.statistics.statement_count, 2);
    assert_eq!(result.statistics.delete_count, 1);
    assert_eq!(result.statistics.missing_delete_count, 0);
    assert!(find(&f, 1).is_none());
}

#[tokio::test]
async fn test_ignore_policy() {
    init_test_logging();
    let skip = ConflictPolicy::new("skip", ResolveType::Ignore, DetectType::UsePkData);
    let f = ApplyFixture::new(item_database(), vec![skip]);
    f.db.seed_row("item", item(1, "pen", 10)).unwrap();

    let result = f.apply(&[insert(1, "item", item(1, "pen", 12))]).await;
    assert!(result.is_ok());
    assert_eq!(result.statistics.ignore_count, 1);
    assert_eq!(
        find(&f, 1).unwrap().get_by_name("price"),
        Some(&Value::Int64(10))
    );

    // A skipped delete is an ignored row, not a missing one
    let result = f.apply(&[delete(2, "item", 7)]).await;
    assert!(result.is_ok());
    assert_eq!(result.statistics.ignore_count, 1);
    assert_eq!(result.statistics.missing_delete_count, 0);
    assert_eq!(f.engine.stats().missing_deletes, 0);

    let abort = ConflictPolicy::new("abort", ResolveType::Ignore, DetectType::UsePkData)
        .with_resolve_row_only(false);
    let f = ApplyFixture::new(item_database(), vec![abort]);
    f.db.seed_row("item", item(1, "pen", 10)).unwrap();

    let result = f.apply(&[insert(1, "item", item(1, "pen", 12))]).await;
    assert_eq!(result.status, BatchStatus::Error);
    assert!(matches!(result.failure, Some(BatchFailure::Aborted { .. })));
}

#[tokio::test]
async fn test_manual_resolution() {
    init_test_logging();
    let manual = ConflictPolicy::new("manual", ResolveType::Manual, DetectType::UsePkData);
    let f = ApplyFixture::new(item_database(), vec![manual]);
    f.db.seed_row("item", item(1, "pen", 10)).unwrap();
    f.db.seed_row("item", item(2, "ink", 3)).unwrap();

    // Without resolved data the conflict fails the batch
    let result = f.apply(&[insert(1, "item", item(1, "pen", 12))]).await;
    assert_eq!(result.status, BatchStatus::Error);
    assert!(matches!(result.failure, Some(BatchFailure::Conflict { .. })));

    // Resolved data replaces the incoming row
    let resolved = ResolvedRows::new().with(1, ResolvedData::with_row(item(1, "fountain pen", 15)));
    let result = f
        .apply_resolved(&[insert(2, "item", item(1, "pen", 12))], &resolved)
        .await;
    assert!(result.is_ok());
    let row = find(&f, 1).unwrap();
    assert_eq!(row.get_by_name("name"), Some(&Value::from("fountain pen")));
    assert_eq!(row.get_by_name("price"), Some(&Value::Int64(15)));

    // A manual delete conflict with resolved data performs the delete
    let resolved = ResolvedRows::new().with(1, ResolvedData::default());
    let change = delete(3, "item", 2).with_old_values(item(2, "ink", 3));
    let stale = ConflictPolicy::new("manual_ts", ResolveType::Manual, DetectType::UseTimestamp)
        .with_detect_expression("price");
    let f2 = ApplyFixture::new(item_database(), vec![stale]);
    f2.db.seed_row("item", item(2, "ink", 4)).unwrap();
    let result = f2.apply_resolved(&[change], &resolved).await;
    assert!(result.is_ok());
    assert!(f2.db.find("item", &Row::default().with("id", 2)).is_none());
}

#[tokio::test]
async fn test_identity_insert_toggled_for_explicit_identity_values() {
    init_test_logging();
    let db = item_database();
    db.create_table(
        rowsync_rdbc::prelude::TableMetadata::new("ticket")
            .with_column(
                rowsync_rdbc::prelude::ColumnMetadata::new("id", "INTEGER")
                    .primary_key(1)
                    .identity(),
            )
            .with_column(rowsync_rdbc::prelude::ColumnMetadata::new("subject", "VARCHAR")),
    );
    let f = ApplyFixture::new(db, vec![]);

    let row = Row::default().with("id", 41i64).with("subject", "login fails");
    let result = f.apply(&[insert(1, "ticket", row)]).await;

    assert!(result.is_ok());
    assert!(f
        .db
        .find("ticket", &Row::default().with("id", 41i64))
        .is_some());
}

#[tokio::test]
async fn test_run_skips_when_load_lock_held() {
    init_test_logging();
    let f = ApplyFixture::new(item_database(), vec![]);
    let batch_id = f.sent_batch().await;
    let action = format!("pull:store-001-{}", batch_id);
    assert!(f.lock.acquire(&action, Duration::ZERO).await.unwrap());

    let outcome = f
        .engine
        .run(batch_id, &[insert(1, "item", item(1, "pen", 1))], &ResolvedRows::new())
        .await
        .unwrap();
    assert!(outcome.is_skipped());
    assert!(find(&f, 1).is_none());

    f.lock.release(&action).await.unwrap();
    let outcome = f
        .engine
        .run(batch_id, &[insert(1, "item", item(1, "pen", 1))], &ResolvedRows::new())
        .await
        .unwrap();
    assert!(outcome.ran().unwrap().is_ok());
    assert!(!f.lock.is_held(&action));
}
