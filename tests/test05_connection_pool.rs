mod common;

use std::time::Duration;

use common::{CATEGORY, options, record, temp_db};
use sqlite_access::prelude::*;

fn pool_for(path: &str, idle_timeout: Duration) -> (ConnectionPool, ChangeBus) {
    let bus = ChangeBus::new(64);
    let pool = ConnectionPool::new(options(path).idle_timeout(idle_timeout).finish(), bus.clone())
        .expect("valid migrations");
    (pool, bus)
}

#[tokio::test]
async fn checkout_prefers_idle_connections() -> Result<(), SqlAccessError> {
    let (_dir, path) = temp_db("reuse");
    let (pool, _bus) = pool_for(&path, Duration::from_secs(60));

    let first = pool.checkout().await?;
    let first_id = first.id();
    first
        .execute("INSERT INTO categories (id, name) VALUES ('a', 'A')", vec![])
        .await?;
    drop(first);
    assert_eq!(pool.idle_count(), 1);

    let again = pool.checkout().await?;
    assert_eq!(again.id(), first_id);
    let other = pool.checkout().await?;
    assert_ne!(other.id(), first_id);
    assert_eq!(pool.open_count(), 2);

    let rows = count_categories(&other).await?;
    assert_eq!(rows, 1);
    drop(again);
    drop(other);
    assert_eq!(pool.idle_count(), 2);

    pool.shutdown().await?;
    assert!(matches!(
        pool.checkout().await,
        Err(SqlAccessError::ConnectionError(_))
    ));
    Ok(())
}

async fn count_categories(conn: &PooledConnection) -> Result<i64, SqlAccessError> {
    let rows = conn.query("SELECT count(*) FROM categories", vec![]).await?;
    Ok(rows.first_value().and_then(RowValues::as_int).copied().unwrap_or(0))
}

#[tokio::test]
async fn idle_connections_are_evicted() -> Result<(), SqlAccessError> {
    let (_dir, path) = temp_db("evict");
    let (pool, _bus) = pool_for(&path, Duration::from_millis(100));

    let conn = pool.checkout().await?;
    conn.execute("INSERT INTO categories (id, name) VALUES ('a', 'A')", vec![])
        .await?;
    drop(conn);
    assert_eq!(pool.open_count(), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.open_count(), 0);

    // A new connection sees the data written by the evicted one.
    let conn = pool.checkout().await?;
    assert_eq!(count_categories(&conn).await?, 1);
    drop(conn);

    pool.shutdown().await
}

#[tokio::test]
async fn reused_connection_is_not_evicted_early() -> Result<(), SqlAccessError> {
    let (_dir, path) = temp_db("rearm");
    let (pool, _bus) = pool_for(&path, Duration::from_millis(300));

    drop(pool.checkout().await?);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let conn = pool.checkout().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(conn);
    // The first timer fired while the connection was checked out.
    assert_eq!(pool.idle_count(), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(pool.open_count(), 0);

    pool.shutdown().await
}

#[tokio::test]
async fn pooled_transactions_publish_on_commit() -> Result<(), SqlAccessError> {
    let (_dir, path) = temp_db("pooled-tx");
    let (pool, bus) = pool_for(&path, Duration::from_secs(60));
    let mut events = bus.subscribe();

    let tx = pool.begin().await?;
    assert!(tx.in_transaction());
    tx.repository()
        .of(&CATEGORY)
        .save(&record(&[("id", "p".into()), ("name", "Pooled".into())]))
        .await?;
    assert!(events.try_recv().is_err());

    let reader = pool.checkout().await?;
    assert_eq!(count_categories(&reader).await?, 0);

    tx.commit().await?;
    assert_eq!(
        events.try_recv().expect("published on commit"),
        ChangeEvent::new(ChangeKind::Insert, "categories")
    );
    assert_eq!(count_categories(&reader).await?, 1);

    {
        let abandoned = pool.begin().await?;
        abandoned
            .execute("DELETE FROM categories", vec![])
            .await?;
    }
    assert_eq!(count_categories(&reader).await?, 1);

    // The abandoned connection was rolled back before it went idle.
    let reused = pool.begin().await?;
    reused.rollback().await?;
    drop(reused);
    drop(reader);
    drop(tx);

    pool.shutdown().await
}

#[tokio::test]
async fn database_writes_invalidate_pooled_caches() -> Result<(), SqlAccessError> {
    let (_dir, path) = temp_db("shared-bus");
    let (pool, bus) = pool_for(&path, Duration::from_secs(60));
    let db = Database::open_with_bus(options(&path).worker_count(2).finish(), bus).await?;
    db.execute("INSERT INTO categories (id, name) VALUES ('a', 'Old')", vec![])
        .await?;

    let conn = pool.checkout().await?;
    let repo = conn.repository();
    let categories = repo.of(&CATEGORY);
    assert_eq!(categories.find_one_by_id("a").await?.map(|c| c.name), Some("Old".into()));

    db.execute("UPDATE categories SET name = 'New' WHERE id = 'a'", vec![])
        .await?;
    assert_eq!(categories.find_one_by_id("a").await?.map(|c| c.name), Some("New".into()));

    drop(conn);
    pool.shutdown().await?;
    db.shutdown().await
}
