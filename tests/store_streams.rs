use mailbox_pipeline::db;
use mailbox_pipeline::error::StoreError;
use mailbox_pipeline::store::{RecordStore, SqlStore};
use mailbox_pipeline::test_support::{TestDatabase, TestFixtures};
use std::time::Duration;

async fn seeded(count: i64, users_each: i64) -> TestDatabase {
    let test_db = TestDatabase::new().await.expect("test database");
    TestFixtures::new(test_db.pool())
        .seed(count, users_each)
        .await
        .expect("seed fixtures");
    test_db
}

#[tokio::test]
async fn all_mailboxes_yields_every_row() {
    let test_db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(test_db.pool());
    fixtures.insert_mailbox(1, "mpi123", "token123").await.unwrap();
    fixtures.insert_mailbox(2, "mpi456", "token456").await.unwrap();

    let store = test_db.store();
    let (mut mailboxes, summary) = store.all_mailboxes().await.unwrap().collect_all().await;
    mailboxes.sort_by_key(|m| m.id);

    assert_eq!(mailboxes.len(), 2);
    assert_eq!(mailboxes[0].mpi_id, "mpi123");
    assert_eq!(mailboxes[0].token, "token123");
    assert_eq!(mailboxes[1].mpi_id, "mpi456");
    assert_eq!(summary.emitted, 2);
    assert!(summary.is_clean());

    test_db.close().await;
}

#[tokio::test]
async fn users_are_filtered_by_mailbox() {
    let test_db = seeded(3, 4).await;
    let store = test_db.store();

    let (users, summary) = store.users_for_mailbox(2).await.unwrap().collect_all().await;

    assert_eq!(users.len(), 4);
    assert!(users.iter().all(|u| u.mailbox_id == 2));
    assert_eq!(summary.emitted, 4);

    test_db.close().await;
}

#[tokio::test]
async fn mailbox_without_users_is_an_empty_stream() {
    let test_db = seeded(1, 2).await;
    let store = test_db.store();

    let (users, summary) = store.users_for_mailbox(42).await.unwrap().collect_all().await;

    assert!(users.is_empty());
    assert_eq!(summary.emitted, 0);
    assert!(summary.error.is_none());

    test_db.close().await;
}

#[tokio::test]
async fn empty_table_is_an_empty_stream() {
    let test_db = TestDatabase::new().await.expect("test database");
    let store = test_db.store();

    let (mailboxes, summary) = store.all_mailboxes().await.unwrap().collect_all().await;
    assert!(mailboxes.is_empty());
    assert!(summary.is_clean());

    test_db.close().await;
}

#[tokio::test]
async fn malformed_rows_are_skipped() {
    let test_db = TestDatabase::new().await.expect("test database");
    let fixtures = TestFixtures::new(test_db.pool());
    fixtures.insert_mailbox(1, "mpi123", "token123").await.unwrap();
    fixtures.insert_user(101, 1, "alice", "alice@example.com").await.unwrap();
    fixtures.insert_incomplete_user(102, 1).await.unwrap();
    fixtures.insert_user(103, 1, "carol", "carol@example.com").await.unwrap();

    let store = test_db.store();
    let (mut users, summary) = store.users_for_mailbox(1).await.unwrap().collect_all().await;
    users.sort_by_key(|u| u.id);

    let ids: Vec<i64> = users.iter().map(|u| u.id).collect();
    assert_eq!(ids, vec![101, 103]);
    assert_eq!(summary.emitted, 2);
    assert_eq!(summary.skipped, 1);
    assert!(summary.error.is_none());

    test_db.close().await;
}

#[tokio::test]
async fn missing_table_fails_the_call() {
    let test_db = TestDatabase::new().await.expect("test database");
    sqlx::query("DROP TABLE users")
        .execute(test_db.pool())
        .await
        .unwrap();

    let store = test_db.store();
    match store.users_for_mailbox(1).await {
        Err(StoreError::Query { query, .. }) => assert_eq!(query, "users(mailbox=1)"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("query against a missing table should fail"),
    }

    test_db.close().await;
}

#[tokio::test]
async fn concurrent_streams_are_independent() {
    let test_db = seeded(4, 25).await;
    let store = test_db.store().with_channel_capacity(2);

    let mut handles = Vec::new();
    for mailbox_id in 1..=4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let (users, _) = store
                .users_for_mailbox(mailbox_id)
                .await
                .unwrap()
                .collect_all()
                .await;
            (mailbox_id, users)
        }));
    }

    for handle in handles {
        let (mailbox_id, users) = handle.await.unwrap();
        assert_eq!(users.len(), 25);
        assert!(users.iter().all(|u| u.mailbox_id == mailbox_id));
    }

    test_db.close().await;
}

#[tokio::test]
async fn dropping_a_stream_early_releases_the_connection() {
    let test_db = seeded(2, 50).await;
    let pool = db::connect("sqlite", &test_db.path().to_string_lossy(), db::MIN_CONNECTIONS)
        .await
        .unwrap();
    let store = SqlStore::new(pool).with_channel_capacity(1);

    let mut users = store.users_for_mailbox(1).await.unwrap();
    assert!(users.next().await.is_some());
    let summary = tokio::time::timeout(Duration::from_secs(5), users.finish())
        .await
        .expect("producer stops once the consumer is gone");
    assert!(summary.consumer_closed);

    // Hold one connection with a blocked cursor; the other must have been released.
    let mut held = store.users_for_mailbox(2).await.unwrap();
    assert!(held.next().await.is_some());

    let (mailboxes, _) = tokio::time::timeout(Duration::from_secs(5), async {
        store.all_mailboxes().await.unwrap().collect_all().await
    })
    .await
    .expect("connection returned to the pool");
    assert_eq!(mailboxes.len(), 2);

    held.finish().await;
    store.close().await;
    test_db.close().await;
}
