//! Integration tests for the article lifecycle: merge, mark, search, purge,
//! re-delivery.
//!
//! Each test creates its own in-memory SQLite database for isolation. These
//! tests exercise the storage layer end-to-end, verifying that the merge
//! engine, the status ledger, search, and retention compose correctly.

use feedvault::storage::{derive_article_id, MarkOrigin};
use feedvault::{ArticleSelector, Database, ParsedItem, StatusKind};

async fn test_db() -> Database {
    // RUST_LOG-driven tracing for debugging test failures; only the first
    // caller installs the subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Database::open(":memory:").await.unwrap()
}

fn test_item(guid: &str, title: &str) -> ParsedItem {
    ParsedItem {
        guid: guid.to_string(),
        title: Some(title.to_string()),
        content_text: Some(format!("Body of {}", title)),
        date_published: Some(1_700_000_000),
        ..Default::default()
    }
}

// ============================================================================
// Merge Lifecycle
// ============================================================================

#[tokio::test]
async fn test_first_update_then_identical_refetch() {
    let db = test_db().await;
    let feed = "feed-1".to_string();
    let items = [test_item("1", "Alpha"), test_item("2", "Beta")];

    let first = db.update_feed_articles(&feed, &items, true).await.unwrap();
    assert_eq!(first.new.len(), 2);

    let second = db.update_feed_articles(&feed, &items, true).await.unwrap();
    assert!(second.is_empty());

    let stored = db
        .fetch_articles(ArticleSelector::Feeds(vec![feed]), None)
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);
}

#[tokio::test]
async fn test_edited_item_updates_in_place() {
    let db = test_db().await;
    let feed = "feed-1".to_string();

    db.update_feed_articles(&feed, &[test_item("1", "Draft")], true)
        .await
        .unwrap();
    let changes = db
        .update_feed_articles(&feed, &[test_item("1", "Final")], true)
        .await
        .unwrap();
    assert!(changes.new.is_empty());
    assert_eq!(changes.updated.len(), 1);

    let stored = db
        .fetch_articles(ArticleSelector::Feeds(vec![feed]), None)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].title.as_deref(), Some("Final"));
}

// ============================================================================
// Status Ledger Independence
// ============================================================================

#[tokio::test]
async fn test_read_state_survives_content_purge_and_redelivery() {
    let db = test_db().await;
    let feed = "feed-1".to_string();
    let item = test_item("1", "Keeper");
    let id = derive_article_id(&feed, "1");

    db.update_feed_articles(&feed, &[item.clone()], true)
        .await
        .unwrap();
    db.mark_statuses(&[id.clone()], StatusKind::Read, true, MarkOrigin::Local)
        .await
        .unwrap();

    // Content purged, status stays
    db.delete_articles(&[id.clone()], MarkOrigin::Local)
        .await
        .unwrap();

    // The feed delivers the same item again: it comes back read, not unread
    let changes = db
        .update_feed_articles(&feed, &[item], true)
        .await
        .unwrap();
    assert_eq!(changes.new.len(), 1);
    assert!(changes.new[0].status.read);

    let unread = db.unread_article_ids().await.unwrap();
    assert!(!unread.contains(&id));
}

#[tokio::test]
async fn test_unread_counts_follow_marks() {
    let db = test_db().await;
    let feed = "feed-1".to_string();
    db.update_feed_articles(
        &feed,
        &[test_item("1", "A"), test_item("2", "B"), test_item("3", "C")],
        true,
    )
    .await
    .unwrap();

    let counts = db.unread_counts(&[]).await.unwrap();
    assert_eq!(counts[&feed], 3);

    db.mark_statuses(
        &[derive_article_id(&feed, "1"), derive_article_id(&feed, "2")],
        StatusKind::Read,
        true,
        MarkOrigin::Local,
    )
    .await
    .unwrap();

    let counts = db.unread_counts(&[]).await.unwrap();
    assert_eq!(counts[&feed], 1);
}

// ============================================================================
// Search Across the Lifecycle
// ============================================================================

#[tokio::test]
async fn test_search_tracks_article_lifecycle() {
    let db = test_db().await;
    let feed = "feed-1".to_string();

    db.update_feed_articles(&feed, &[test_item("1", "Quantum computing news")], true)
        .await
        .unwrap();
    assert_eq!(db.search_articles("quantum", &[], None).await.unwrap().len(), 1);

    db.update_feed_articles(&feed, &[test_item("1", "Classical computing news")], true)
        .await
        .unwrap();
    assert!(db.search_articles("quantum", &[], None).await.unwrap().is_empty());
    assert_eq!(
        db.search_articles("classical", &[], None).await.unwrap().len(),
        1
    );

    db.delete_articles(&[derive_article_id(&feed, "1")], MarkOrigin::Local)
        .await
        .unwrap();
    assert!(db
        .search_articles("classical", &[], None)
        .await
        .unwrap()
        .is_empty());
}

// ============================================================================
// Unsubscribe
// ============================================================================

#[tokio::test]
async fn test_unsubscribe_removes_articles_statuses_and_search() {
    let db = test_db().await;
    let kept = "feed-kept".to_string();
    let dropped = "feed-dropped".to_string();

    db.update_feed_articles(&kept, &[test_item("1", "Kept story")], true)
        .await
        .unwrap();
    db.update_feed_articles(&dropped, &[test_item("1", "Dropped story")], true)
        .await
        .unwrap();

    db.delete_articles_not_in_feeds(&[kept.clone()]).await.unwrap();

    let remaining = db
        .fetch_articles(ArticleSelector::Feeds(vec![]), None)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].feed_id, kept);

    assert!(db
        .search_articles("dropped", &[], None)
        .await
        .unwrap()
        .is_empty());
    assert!(db
        .fetch_statuses(&[derive_article_id(&dropped, "1")])
        .await
        .unwrap()
        .is_empty());
}

// ============================================================================
// Pending Queue Through the Public Surface
// ============================================================================

#[tokio::test]
async fn test_marks_queue_until_cleared() {
    let db = test_db().await;
    let feed = "feed-1".to_string();
    db.update_feed_articles(&feed, &[test_item("1", "A")], true)
        .await
        .unwrap();
    let id = derive_article_id(&feed, "1");

    db.mark_statuses(&[id.clone()], StatusKind::Starred, true, MarkOrigin::Local)
        .await
        .unwrap();
    // One `new` change from the insert plus the star
    assert_eq!(db.pending_change_count().await.unwrap(), 2);

    let batch = db.select_for_sending(10).await.unwrap();
    db.clear_selected(&batch).await.unwrap();
    assert_eq!(db.pending_change_count().await.unwrap(), 0);

    // Starred state itself is untouched by queue bookkeeping
    assert!(db.starred_article_ids().await.unwrap().contains(&id));
}
