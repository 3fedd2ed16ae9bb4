mod common;

use std::collections::HashSet;

use common::{CATEGORY, Category, TAG, open_db, options, record, temp_db};
use sqlite_access::prelude::*;

#[tokio::test]
async fn save_generates_id_and_reads_back() -> Result<(), SqlAccessError> {
    let (_dir, db) = open_db("science").await;
    let repo = db.repository();
    let categories = repo.of(&CATEGORY);

    let saved = categories
        .save(&record(&[
            ("name", "Science".into()),
            ("_client_only", "ignored".into()),
        ]))
        .await?;
    assert!(!saved.id.is_empty());
    assert_eq!(saved.name, "Science");

    let found = categories
        .find_one_by_id(saved.id.as_str())
        .await?
        .expect("saved category");
    assert_eq!(
        found,
        Category {
            id: saved.id.clone(),
            name: "Science".into(),
            rank: 0,
            featured: false,
        }
    );

    // Saving the same record again is idempotent.
    let again = categories
        .save(&record(&[("id", saved.id.as_str().into()), ("name", "Science".into())]))
        .await?;
    assert_eq!(again, found);
    assert_eq!(categories.count(None).await?, 1);

    let err = categories
        .save(&record(&[("nope", RowValues::Int(1))]))
        .await
        .expect_err("unknown column");
    assert!(matches!(err, SqlAccessError::Build(BuildError::UnknownColumn { .. })));

    db.shutdown().await
}

#[tokio::test]
async fn rowid_entities_let_sqlite_assign_ids() -> Result<(), SqlAccessError> {
    let (_dir, db) = open_db("rowid_ids").await;
    db.exec_batch("CREATE TABLE scores (id INTEGER PRIMARY KEY, label TEXT NOT NULL);")
        .await?;
    let scores_entity = SqlEntity::dynamic("scores").with_rowid_ids();
    let repo = db.repository();
    let scores = repo.of(&scores_entity);

    let first = scores.save(&record(&[("label", "first".into())])).await?;
    assert_eq!(first.get("id"), Some(&RowValues::Int(1)));
    let second = scores
        .save(&record(&[("id", RowValues::Null), ("label", "second".into())]))
        .await?;
    assert_eq!(second.get("id"), Some(&RowValues::Int(2)));

    let renamed = scores
        .save(&record(&[("id", RowValues::Int(1)), ("label", "renamed".into())]))
        .await?;
    assert_eq!(renamed.get("label"), Some(&RowValues::Text("renamed".into())));
    assert_eq!(repo.count(&Selector::new().from("scores")).await?, 2);

    db.shutdown().await
}

#[tokio::test]
async fn batched_lookup_returns_every_id() -> Result<(), SqlAccessError> {
    let (_dir, path) = temp_db("batched");
    let db = Database::open(options(&path).max_batch_size(16).finish()).await?;

    let ids: Vec<EntityId> = (0..150).map(|i| EntityId::from(format!("cat-{i:03}"))).collect();
    let values = ids
        .iter()
        .map(|id| format!("('{id}', 'Category {id}')"))
        .collect::<Vec<_>>()
        .join(",\n");
    db.exec_batch(&format!("INSERT INTO categories (id, name) VALUES {values};"))
        .await?;

    let found = db.repository().of(&CATEGORY).find_many_by_id(&ids).await?;
    assert_eq!(found.len(), 150);
    let distinct: HashSet<_> = found.iter().map(|c| c.id.clone()).collect();
    assert_eq!(distinct.len(), 150);

    // Duplicates and unknown ids do not produce extra rows.
    let mut mixed = ids[..5].to_vec();
    mixed.extend(ids[..5].iter().cloned());
    mixed.push(EntityId::from("missing"));
    assert_eq!(db.repository().of(&CATEGORY).find_many_by_id(&mixed).await?.len(), 5);

    db.shutdown().await
}

#[tokio::test]
async fn concurrent_point_lookups_share_one_loader() -> Result<(), SqlAccessError> {
    let (_dir, db) = open_db("loader").await;
    db.exec_batch("INSERT INTO categories (id, name) VALUES ('a', 'A'), ('b', 'B'), ('c', 'C');")
        .await?;
    let repo = db.repository();
    let categories = repo.of(&CATEGORY);

    let (a, b, missing) = tokio::join!(
        categories.find_one_by_id("a"),
        categories.find_one_by_id("b"),
        categories.find_one_by_id("zzz"),
    );
    assert_eq!(a?.map(|c| c.name), Some("A".to_owned()));
    assert_eq!(b?.map(|c| c.name), Some("B".to_owned()));
    assert!(missing?.is_none());
    assert!(categories.exists_by_id("c").await?);
    assert!(!categories.exists_by_id("zzz").await?);

    db.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_saves_are_both_persisted() -> Result<(), SqlAccessError> {
    let (_dir, db) = open_db("concurrent").await;

    let mut handles = Vec::new();
    for (id, name) in [("left", "Left"), ("right", "Right")] {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.repository()
                .of(&CATEGORY)
                .save(&record(&[
                    ("id", id.into()),
                    ("name", name.into()),
                    ("rank", RowValues::Int(4)),
                ]))
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("save task")?;
    }

    let categories = db.repository();
    let categories = categories.of(&CATEGORY);
    for (id, name) in [("left", "Left"), ("right", "Right")] {
        let row = categories.find_one_by_id(id).await?.expect("persisted");
        assert_eq!(row.name, name);
        assert_eq!(row.rank, 4);
    }
    assert_eq!(categories.count(None).await?, 2);

    db.shutdown().await
}

#[tokio::test]
async fn writes_invalidate_cached_reads() -> Result<(), SqlAccessError> {
    let (_dir, db) = open_db("invalidate").await;
    db.exec_batch("INSERT INTO categories (id, name) VALUES ('a', 'Old');")
        .await?;
    let repo = db.repository();
    let categories = repo.of(&CATEGORY);

    assert_eq!(categories.find_one_by_id("a").await?.map(|c| c.name), Some("Old".into()));
    assert_eq!(categories.count(None).await?, 1);

    db.execute("UPDATE categories SET name = 'New' WHERE id = 'a'", vec![])
        .await?;
    assert_eq!(categories.find_one_by_id("a").await?.map(|c| c.name), Some("New".into()));

    db.execute("INSERT INTO categories (id, name) VALUES ('b', 'B')", vec![])
        .await?;
    assert_eq!(categories.count(None).await?, 2);

    db.shutdown().await
}

#[tokio::test]
async fn remove_enable_and_paginate() -> Result<(), SqlAccessError> {
    let (_dir, db) = open_db("paginate").await;
    let repo = db.repository();
    let categories = repo.of(&CATEGORY);
    let records: Vec<Record> = (0..30_i64)
        .map(|i| {
            record(&[
                ("id", format!("c{i:02}").into()),
                ("name", format!("Name {i}").into()),
                ("rank", i.into()),
            ])
        })
        .collect();
    categories.save_many(&records).await?;

    let page = categories
        .find_many_paginated(
            categories.select().order_by("rank", Direction::Asc),
            PageRequest::new(25, 10),
        )
        .await?;
    assert_eq!(page.page_index, 2);
    assert_eq!(page.page_count, 3);
    assert_eq!(page.slice.len(), 5);
    assert_eq!(page.slice[0].rank, 25);

    let first = categories
        .find_many_paginated(categories.select(), PageRequest::default())
        .await?;
    assert_eq!((first.page_index, first.page_count, first.slice.len()), (0, 2, 25));

    assert_eq!(categories.enable("featured", &records[..3]).await?, 3);
    assert_eq!(categories.enable_one_by_id("featured", "c10").await?, 1);
    assert_eq!(
        categories
            .count(eq(SqlField::new("featured"), true))
            .await?,
        4
    );
    assert!(matches!(
        categories.enable_many("secret", None).await,
        Err(SqlAccessError::Build(BuildError::UnknownColumn { .. }))
    ));

    assert_eq!(categories.remove(&records[..2]).await?, 2);
    assert_eq!(categories.remove_one_by_id("c02").await?, 1);
    assert_eq!(
        categories
            .remove_many_by_id(&[EntityId::from("c03"), EntityId::from("unknown")])
            .await?,
        1
    );
    assert_eq!(categories.remove_many(lt(SqlField::new("rank"), 10)).await?, 6);
    assert_eq!(categories.count(None).await?, 20);
    assert_eq!(
        categories.find_id(eq(SqlField::new("name"), "Name 29")).await?,
        Some(EntityId::from("c29"))
    );

    db.shutdown().await
}

#[tokio::test]
async fn n2m_loader_groups_children_by_parent() -> Result<(), SqlAccessError> {
    let (_dir, db) = open_db("n2m").await;
    db.exec_batch(
        "INSERT INTO categories (id, name) VALUES ('c1', 'One'), ('c2', 'Two'), ('c3', 'Three');
         INSERT INTO tags (id, label) VALUES ('t1', 'red'), ('t2', 'green'), ('t3', 'blue');
         INSERT INTO category_tags (category_id, tag_id) VALUES
             ('c1', 't1'), ('c1', 't2'), ('c2', 't3');",
    )
    .await?;
    let repo = db.repository();
    let tags = repo.n2m_loader(&TAG, N2mLink::new("category_tags", "category_id", "tag_id"));

    let grouped = tags
        .load_many(&[EntityId::from("c1"), EntityId::from("c2"), EntityId::from("c3")])
        .await?;
    let mut c1: Vec<String> = grouped[&EntityId::from("c1")]
        .iter()
        .map(|t| t.label.clone())
        .collect();
    c1.sort();
    assert_eq!(c1, ["green", "red"]);
    assert_eq!(grouped[&EntityId::from("c2")].len(), 1);
    assert!(!grouped.contains_key(&EntityId::from("c3")));

    // A new link invalidates the cached children.
    db.execute(
        "INSERT INTO category_tags (category_id, tag_id) VALUES ('c3', 't1')",
        vec![],
    )
    .await?;
    assert_eq!(tags.load("c3").await?.len(), 1);

    db.shutdown().await
}
