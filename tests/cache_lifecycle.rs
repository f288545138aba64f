//! Integration tests for the cache store lifecycle: persistence across
//! restarts, eviction, staging, the durable action queue and media caching.
//!
//! File-backed tests use a unique temp directory each, in-memory tests their
//! own `:memory:` database.

use chrono::{DateTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedsync::api::{ApiClient, ClientOptions};
use feedsync::model::{ActionPayload, ActionState, Author, FeedItem, LikeUndo, OfflineAction, PostKind};
use feedsync::storage::{ActionOutcome, CacheStore, MediaOutcome, Overlay, StoreLimits};

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn post(id: &str, created: i64, updated: Option<i64>) -> FeedItem {
    FeedItem {
        id: id.to_string(),
        author: Author {
            id: "u1".into(),
            name: "Ada".into(),
            avatar_url: None,
        },
        body: format!("post {id}"),
        media: vec![],
        kind: PostKind::General,
        created_at: ts(created),
        updated_at: updated.map(ts),
        like_count: 3,
        comment_count: 0,
        share_count: 0,
        liked_by_viewer: false,
        saved_by_viewer: false,
        pinned: false,
        recent_comments: vec![],
    }
}

fn temp_db(name: &str) -> (PathBuf, String) {
    let dir = std::env::temp_dir().join(format!("feedsync_it_{name}_{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let db = dir.join("cache.db").to_str().unwrap().to_string();
    (dir, db)
}

async fn memory_store(max_items: usize) -> CacheStore {
    CacheStore::open_in_memory(StoreLimits {
        max_items,
        ..StoreLimits::default()
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_snapshot_survives_reopen() {
    let (dir, db) = temp_db("reopen");

    {
        let store = CacheStore::open(&db, StoreLimits::default()).await.unwrap();
        store
            .write_items(vec![post("a", 10, None), post("b", 20, None)])
            .await
            .unwrap();
        store.mark_synced(ts(30)).await.unwrap();
    }

    let store = CacheStore::open(&db, StoreLimits::default()).await.unwrap();
    let snapshot = store.read_snapshot(10).await.unwrap();
    assert_eq!(snapshot.order, vec!["b".to_string(), "a".to_string()]);
    assert_eq!(snapshot.last_synced_at, Some(ts(30)));

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_queue_survives_restart_and_resets_in_flight() {
    let (dir, db) = temp_db("queue");
    let like = OfflineAction::new(
        Some("a".into()),
        ActionPayload::Like {
            intended: true,
            undo: LikeUndo {
                liked: false,
                like_count: 3,
            },
        },
    );
    let post_action = OfflineAction::new(
        None,
        ActionPayload::Post {
            body: "draft".into(),
            kind: PostKind::Tip,
            media: vec![],
        },
    );

    {
        let store = CacheStore::open(&db, StoreLimits::default()).await.unwrap();
        store.enqueue_action(&like).await.unwrap();
        store.enqueue_action(&post_action).await.unwrap();
        // Claimed, then the process dies mid-request
        let claimed = store.dequeue_next_action(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, like.id);
    }

    let store = CacheStore::open(&db, StoreLimits::default()).await.unwrap();
    assert_eq!(store.reset_in_flight_actions().await.unwrap(), 1);

    let pending = store.pending_actions().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, like.id);
    assert_eq!(pending[0].state, ActionState::Pending);
    assert_eq!(pending[0].payload, like.payload);
    assert_eq!(pending[1].payload, post_action.payload);

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_retry_moves_action_to_tail() {
    let store = memory_store(500).await;
    let first = OfflineAction::new(
        Some("a".into()),
        ActionPayload::Like {
            intended: true,
            undo: LikeUndo {
                liked: false,
                like_count: 0,
            },
        },
    );
    let second = OfflineAction::new(
        Some("b".into()),
        ActionPayload::Like {
            intended: false,
            undo: LikeUndo {
                liked: true,
                like_count: 1,
            },
        },
    );
    store.enqueue_action(&first).await.unwrap();
    store.enqueue_action(&second).await.unwrap();

    let claimed = store.dequeue_next_action(Utc::now()).await.unwrap().unwrap();
    store
        .mark_action_result(
            &claimed.id,
            &ActionOutcome::RetryLater {
                attempts: 1,
                next_attempt_at: Utc::now(),
                error: "HTTP error: status 503".into(),
            },
        )
        .await
        .unwrap();

    let order: Vec<_> = store
        .pending_actions()
        .await
        .unwrap()
        .into_iter()
        .map(|a| (a.id, a.attempts))
        .collect();
    assert_eq!(order, vec![(second.id.clone(), 0), (first.id.clone(), 1)]);

    // Confirmed actions leave the queue
    let next = store.dequeue_next_action(Utc::now()).await.unwrap().unwrap();
    store
        .mark_action_result(&next.id, &ActionOutcome::Succeeded)
        .await
        .unwrap();
    assert_eq!(store.pending_action_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_eviction_spares_rendered_and_pending_items() {
    let store = memory_store(3).await;
    store.set_rendered(["old-1"]);
    store.push_overlay(
        "c1",
        Overlay::Like {
            item_id: "old-2".into(),
            liked: true,
            undo: LikeUndo {
                liked: false,
                like_count: 3,
            },
            applied_at: Utc::now(),
        },
    );

    let report = store
        .write_items(vec![
            post("old-1", 1, None),
            post("old-2", 2, None),
            post("old-3", 3, None),
            post("new-1", 10, None),
            post("new-2", 11, None),
        ])
        .await
        .unwrap();
    assert_eq!(report.evicted, 2);

    let snapshot = store.read_snapshot(10).await.unwrap();
    let mut kept = snapshot.order.clone();
    kept.sort();
    assert_eq!(kept, vec!["new-2", "old-1", "old-2"]);
    // The overlay is applied on read
    assert_eq!(snapshot.get("old-2").unwrap().like_count, 4);
}

#[tokio::test]
async fn test_staged_items_stay_hidden_until_promoted() {
    let store = memory_store(500).await;
    store.write_items(vec![post("a", 1, None)]).await.unwrap();
    store
        .stage_items(&[post("b", 2, None), post("c", 3, None)])
        .await
        .unwrap();

    assert_eq!(store.read_snapshot(10).await.unwrap().len(), 1);
    assert_eq!(store.stats().await.unwrap().item_count, 1);
    assert_eq!(store.stats().await.unwrap().staged_count, 2);

    // A regular write naming a staged ID publishes just that one
    store.write_items(vec![post("b", 2, None)]).await.unwrap();
    assert_eq!(store.read_snapshot(10).await.unwrap().len(), 2);

    assert_eq!(store.promote_staged().await.unwrap(), 1);
    assert_eq!(store.read_snapshot(10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_freshness_rule_across_writes() {
    let store = memory_store(500).await;
    store.write_items(vec![post("a", 1, Some(50))]).await.unwrap();

    let mut older = post("a", 1, Some(40));
    older.like_count = 99;
    let report = store.write_items(vec![older]).await.unwrap();
    assert_eq!(report.stale, 1);
    assert_eq!(store.get_item("a").await.unwrap().unwrap().like_count, 3);

    // Same item twice: one entry, unchanged
    store.write_items(vec![post("a", 1, Some(50))]).await.unwrap();
    let snapshot = store.read_snapshot(10).await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.get("a").unwrap().updated_at, Some(ts(50)));
}

#[tokio::test]
async fn test_media_prefetch_through_http_client() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/media/a.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/jpeg")
                .set_body_bytes(vec![7u8; 2048]),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/media/huge.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64 * 1024]))
        .mount(&server)
        .await;

    let client = ApiClient::new(
        &server.uri(),
        None,
        ClientOptions {
            max_media_bytes: 16 * 1024,
            allow_private_hosts: true,
            retry_base: Duration::from_millis(10),
            ..ClientOptions::default()
        },
    )
    .unwrap();
    let store = memory_store(500).await;
    let url = format!("{}/media/a.jpg", server.uri());

    let outcome = store.prefetch_media(&client, &url).await.unwrap();
    assert_eq!(outcome, MediaOutcome::Stored { size_bytes: 2048 });
    assert_eq!(
        store.prefetch_media(&client, &url).await.unwrap(),
        MediaOutcome::AlreadyCached
    );

    let cached = store.get_media(&url).await.unwrap().unwrap();
    assert_eq!(cached.bytes.len(), 2048);
    assert_eq!(cached.content_type.as_deref(), Some("image/jpeg"));
    assert_eq!(cached.sha256.len(), 64);

    let huge = format!("{}/media/huge.jpg", server.uri());
    assert!(matches!(
        store.prefetch_media(&client, &huge).await.unwrap(),
        MediaOutcome::Failed(_)
    ));
    assert!(!store.has_media(&huge).await.unwrap());
}

#[tokio::test]
async fn test_clear_wipes_everything() {
    let store = memory_store(500).await;
    store.write_items(vec![post("a", 1, None)]).await.unwrap();
    store
        .enqueue_action(&OfflineAction::new(
            None,
            ActionPayload::Post {
                body: "x".into(),
                kind: PostKind::General,
                media: vec![],
            },
        ))
        .await
        .unwrap();

    store.clear().await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.item_count, 0);
    assert_eq!(stats.pending_action_count, 0);
    assert!(store.read_snapshot(10).await.unwrap().is_empty());
}
