mod common;

use common::{CATEGORY, open_db, record};
use sqlite_access::prelude::*;

#[tokio::test]
async fn builders_run_against_a_real_database() -> Result<(), SqlAccessError> {
    let (_dir, db) = open_db("builders").await;
    let repo = db.repository();

    for (id, name, rank) in [("a", "Art", 1), ("b", "Biology", 5), ("c", "Chemistry", 9)] {
        let stmt = Inserter::new()
            .into("categories")
            .set("id", id)
            .set("name", name)
            .set("rank", rank)
            .build()?;
        repo.run(stmt).await?;
    }

    let ranked = Selector::new()
        .select(["id"])
        .from("categories")
        .filter(gt(SqlField::new("rank"), 2))
        .order_by("rank", Direction::Desc);
    let ids: Vec<String> = repo
        .find_many(&ranked)
        .await?
        .iter()
        .filter_map(|row| row.get("id").and_then(RowValues::as_text).map(str::to_owned))
        .collect();
    assert_eq!(ids, ["c", "b"]);
    assert_eq!(repo.count(&ranked).await?, 2);
    assert!(repo.exists(&ranked).await?);

    let updated = Updater::new()
        .table("categories")
        .set("featured", true)
        .filter(in_list(SqlField::new("id"), ["a", "c"]))
        .build()?;
    assert_eq!(repo.run(updated).await?.rows_affected, 2);
    let featured = Selector::new()
        .from("categories")
        .filter(eq(SqlField::new("featured"), true));
    assert_eq!(repo.count(&featured).await?, 2);

    let deleted = Deleter::new()
        .from("categories")
        .filter(eq(SqlField::new("id"), "a"))
        .build()?;
    assert_eq!(repo.run(deleted).await?.rows_affected, 1);
    assert_eq!(repo.count(&Selector::new().from("categories")).await?, 2);

    db.shutdown().await
}

#[tokio::test]
async fn sub_queries_and_joins() -> Result<(), SqlAccessError> {
    let (_dir, db) = open_db("subqueries").await;
    db.exec_batch(
        "INSERT INTO categories (id, name) VALUES ('c1', 'Science'), ('c2', 'History');
         INSERT INTO tags (id, label) VALUES ('t1', 'lab'), ('t2', 'old');
         INSERT INTO category_tags (category_id, tag_id) VALUES ('c1', 't1'), ('c2', 't2');",
    )
    .await?;
    let repo = db.repository();

    let lab_categories = Selector::new()
        .select(["category_id"])
        .from("category_tags")
        .join("tags", Some("t"))
        .on(eq(SqlField::parse("t.id"), SqlField::parse("category_tags.tag_id")))
        .filter(eq(SqlField::parse("t.label"), "lab"));
    let found = repo
        .find_many(
            &Selector::new()
                .select(["name"])
                .from("categories")
                .filter_in("id", lab_categories),
        )
        .await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("name").and_then(RowValues::as_text), Some("Science"));

    let tagged = Selector::new()
        .from("category_tags")
        .filter(SqlExpr::custom(
            "\"category_tags\".\"category_id\" = \"categories\".\"id\"",
            vec![],
        ));
    let with_tags = Selector::new().from("categories").filter_exists(tagged);
    assert_eq!(repo.count(&with_tags).await?, 2);

    db.shutdown().await
}

#[tokio::test]
async fn upsert_merge_is_idempotent() -> Result<(), SqlAccessError> {
    let (_dir, db) = open_db("upsert").await;
    let repo = db.repository();
    repo.execute(
        "INSERT INTO categories (id, name, rank) VALUES ('other', 'Other', 3)",
        vec![],
    )
    .await?;

    let upsert = || {
        Inserter::new()
            .into_entity(&CATEGORY)
            .set("id", "x")
            .set("name", "Physics")
            .set("rank", 7)
            .on_conflict(["id"])
            .do_merge()
            .build()
    };
    repo.run(upsert()?).await?;
    repo.run(upsert()?).await?;

    let rows = repo
        .find_many(
            &Selector::new()
                .select(["id", "name", "rank"])
                .from("categories")
                .order_by("id", Direction::Asc),
        )
        .await?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("rank"), Some(&RowValues::Int(3)));
    assert_eq!(rows[1].get("name").and_then(RowValues::as_text), Some("Physics"));

    let renamed = Inserter::new()
        .into("categories")
        .set("id", "x")
        .set("name", "Astrophysics")
        .on_conflict(["id"])
        .do_merge()
        .build()?;
    repo.run(renamed).await?;
    let row = repo
        .find_one(&Selector::new().from("categories").filter(eq(SqlField::new("id"), "x")))
        .await?
        .expect("row x");
    assert_eq!(row.get("name").and_then(RowValues::as_text), Some("Astrophysics"));
    assert_eq!(row.get("rank"), Some(&RowValues::Int(7)));

    let ignored = Inserter::new()
        .into("categories")
        .set("id", "x")
        .set("name", "Ignored")
        .on_conflict(["id"])
        .do_nothing()
        .build()?;
    assert_eq!(repo.run(ignored).await?.rows_affected, 0);

    db.shutdown().await
}

#[tokio::test]
async fn malformed_statements_never_reach_a_worker() -> Result<(), SqlAccessError> {
    let (_dir, db) = open_db("malformed").await;
    let repo = db.repository();

    let err = Updater::new().set("name", "x").build().expect_err("no table");
    assert_eq!(err, BuildError::MissingTable { statement: "UPDATE" });

    let err = repo
        .run(Statement {
            sql: "SELECT * FROM categories WHERE id = ? AND name = ?".into(),
            params: vec![RowValues::Text("a".into())],
        })
        .await
        .expect_err("placeholder mismatch");
    assert!(matches!(
        err,
        SqlAccessError::Build(BuildError::PlaceholderMismatch { placeholders: 2, params: 1 })
    ));

    let err = repo
        .query("SELECT * FROM missing_table", vec![])
        .await
        .expect_err("engine error");
    assert!(matches!(err, SqlAccessError::Worker(_)));

    db.shutdown().await
}

#[tokio::test]
async fn table_names_are_always_quoted() -> Result<(), SqlAccessError> {
    let (_dir, db) = open_db("quoted_tables").await;
    db.exec_batch(
        "CREATE TABLE \"trivia-categories\" (id TEXT PRIMARY KEY, label TEXT);
         CREATE TABLE \"my table\" (id INTEGER PRIMARY KEY, label TEXT);",
    )
    .await?;
    let repo = db.repository();

    let insert = Inserter::new().into("my table").set("label", "spaced").build()?;
    assert!(insert.sql.starts_with("INSERT INTO \"my table\" ("));
    repo.run(insert).await?;
    let update = Updater::new().table("my table").set("label", "renamed").build()?;
    assert_eq!(repo.run(update).await?.rows_affected, 1);
    let labels = Selector::new()
        .select(["label"])
        .from_as("my table", "t");
    assert_eq!(
        repo.find_first_value(&labels).await?,
        Some(RowValues::Text("renamed".into()))
    );

    let dashed = SqlEntity::dynamic("trivia-categories");
    let table = repo.of(&dashed);
    let saved = table
        .save(&record(&[("id", "t1".into()), ("label", "History".into())]))
        .await?;
    assert_eq!(saved.get("label"), Some(&RowValues::Text("History".into())));
    assert_eq!(table.count(None).await?, 1);
    assert_eq!(
        repo.count(&Selector::new().from("trivia-categories")).await?,
        1
    );

    let delete = Deleter::new()
        .from("trivia-categories")
        .filter(eq(SqlField::new("id"), "t1"))
        .build()?;
    assert!(delete.sql.starts_with("DELETE FROM \"trivia-categories\""));
    assert_eq!(repo.run(delete).await?.rows_affected, 1);

    db.shutdown().await
}

#[tokio::test]
async fn worker_errors_do_not_leak_statement_text() -> Result<(), SqlAccessError> {
    let (_dir, db) = open_db("redacted").await;
    let err = db
        .query(
            "SELECT secret_col FROM categories WHERE id = ? - - FROM",
            vec![RowValues::Text("a".into())],
        )
        .await
        .err()
        .expect("syntax error");
    let message = err.to_string();
    assert!(matches!(err, SqlAccessError::Worker(_)), "{message}");
    assert!(!message.contains("secret_col"), "{message}");

    db.shutdown().await
}
