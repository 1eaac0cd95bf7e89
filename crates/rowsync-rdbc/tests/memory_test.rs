//! Unit-of-work behaviour of the in-memory backend across multiple tables

use rowsync_rdbc::prelude::*;

fn schema() -> MemoryDatabase {
    let db = MemoryDatabase::new();
    db.create_table(
        TableMetadata::new("customer")
            .with_column(ColumnMetadata::new("customer_id", "integer").primary_key(1))
            .with_column(ColumnMetadata::new("name", "varchar"))
            .with_column(ColumnMetadata::new("last_update", "timestamp")),
    );
    db.create_table(
        TableMetadata::new("order_line")
            .with_column(ColumnMetadata::new("order_id", "integer").primary_key(1))
            .with_column(ColumnMetadata::new("line_no", "integer").primary_key(2))
            .with_column(ColumnMetadata::new("qty", "integer")),
    );
    db
}

#[tokio::test]
async fn test_rollback_spans_all_touched_tables() {
    let db = schema();

    db.execute(&DmlStatement::new(
        DmlType::Insert,
        "customer",
        Row::default().with("customer_id", 1).with("name", "Ada"),
        Row::default(),
    ))
    .await
    .unwrap();
    db.commit().await.unwrap();

    db.execute(&DmlStatement::new(
        DmlType::Update,
        "customer",
        Row::default().with("name", "Grace"),
        Row::default().with("customer_id", 1),
    ))
    .await
    .unwrap();
    db.execute(&DmlStatement::new(
        DmlType::Insert,
        "order_line",
        Row::default().with("order_id", 7).with("line_no", 1).with("qty", 3),
        Row::default(),
    ))
    .await
    .unwrap();

    db.rollback().await.unwrap();

    let customer = db
        .find("customer", &Row::default().with("customer_id", 1))
        .unwrap();
    assert_eq!(customer.get_by_name("name"), Some(&Value::from("Ada")));
    assert!(db.rows("order_line").is_empty());
}

#[tokio::test]
async fn test_composite_key_uniqueness() {
    let db = schema();
    let line = |line_no: i32| {
        DmlStatement::new(
            DmlType::Insert,
            "order_line",
            Row::default().with("order_id", 7).with("line_no", line_no),
            Row::default(),
        )
    };

    db.execute(&line(1)).await.unwrap();
    db.execute(&line(2)).await.unwrap();
    let err = db.execute(&line(1)).await.unwrap_err();

    assert!(err.is_unique_violation());
    assert_eq!(db.statements().len(), 3);
}

#[tokio::test]
async fn test_unknown_table_and_column() {
    let db = schema();

    let err = db
        .execute(&DmlStatement::new(
            DmlType::Insert,
            "missing",
            Row::default().with("id", 1),
            Row::default(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TableNotFound { .. }));

    let err = db
        .execute(&DmlStatement::new(
            DmlType::Insert,
            "customer",
            Row::default().with("customer_id", 1).with("nickname", "x"),
            Row::default(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ColumnNotFound { .. }));
    assert!(db.describe_table("CUSTOMER").await.unwrap().is_some());
}
