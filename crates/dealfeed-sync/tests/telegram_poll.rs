use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use dealfeed_adapters::{TagRules, TelegramConfig, TelegramSource};
use dealfeed_core::DataOrigin;
use dealfeed_storage::{BackoffPolicy, DealStore, HttpClientConfig, HttpFetcher, MemoryDealStore};
use dealfeed_sync::{PollPipeline, PollSettings};
use serde_json::{json, Value};
use tokio::net::TcpListener;

type Queue = Arc<Mutex<Vec<i64>>>;

/// Unconfirmed channel posts stay queued; a negative offset reads the tail.
async fn get_updates(State(queue): State<Queue>, Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    let ids = queue.lock().unwrap().clone();
    let offset = params.get("offset").and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
    let limit = params.get("limit").and_then(|v| v.parse::<usize>().ok()).unwrap_or(100);
    let window: Vec<i64> = if offset < 0 {
        let keep = offset.unsigned_abs() as usize;
        ids[ids.len().saturating_sub(keep)..].to_vec()
    } else {
        ids.into_iter().take(limit).collect()
    };
    let result = window
        .into_iter()
        .map(|id| {
            json!({
                "update_id": 1000 + id,
                "channel_post": {
                    "message_id": id,
                    "chat": {"id": -100, "username": "dealsdrop", "type": "channel"},
                    "date": 1_760_000_000 + id,
                    "text": format!("Deal {id}: earbuds at Amazon")
                }
            })
        })
        .collect::<Vec<_>>();
    Json(json!({"ok": true, "result": result}))
}

async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}")
}

fn pipeline_for(base: &str, store: Arc<MemoryDealStore>) -> PollPipeline {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        backoff: BackoffPolicy {
            max_retries: 0,
            ..Default::default()
        },
        ..Default::default()
    })
    .expect("http client");
    let mut config = TelegramConfig::new("TEST", "@dealsdrop");
    config.api_base = base.to_string();
    config.web_base = base.to_string();

    PollPipeline::new(
        Arc::new(TelegramSource::new(http, config)),
        store,
        TagRules::bundled().expect("rules"),
    )
    .with_settings(PollSettings {
        retry: BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        ..Default::default()
    })
}

#[tokio::test]
async fn second_poll_persists_only_posts_above_the_watermark() {
    let queue: Queue = Arc::new(Mutex::new(vec![1, 2, 3]));
    let router = Router::new()
        .route("/{bot}/getUpdates", get(get_updates))
        .with_state(Arc::clone(&queue));
    let base = serve(router).await;
    let store = Arc::new(MemoryDealStore::new());
    let pipeline = pipeline_for(&base, store.clone());

    let first = pipeline.run_once().await.expect("first poll");
    assert_eq!(first.origin, DataOrigin::Live);
    assert_eq!((first.total, first.processed), (3, 3));

    queue.lock().unwrap().extend([4, 5]);
    let second = pipeline.run_once().await.expect("second poll");
    assert_eq!((second.total, second.processed, second.duplicates), (2, 2, 0));
    assert!(second.messages.iter().all(|m| m.id > 3));

    assert_eq!(store.all_ids().await, vec![1, 2, 3, 4, 5]);
    let stored = store.recent_messages(1).await.unwrap();
    assert_eq!(stored[0].store.as_deref(), Some("amazon"));
    let runs = store.all_runs().await;
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.origin == Some(DataOrigin::Live) && r.error.is_none()));
}

#[tokio::test]
async fn backlog_beyond_one_page_still_reaches_new_posts() {
    let queue: Queue = Arc::new(Mutex::new((1..=150).collect()));
    let router = Router::new()
        .route("/{bot}/getUpdates", get(get_updates))
        .with_state(queue);
    let base = serve(router).await;
    let store = Arc::new(MemoryDealStore::new());
    let pipeline = pipeline_for(&base, store.clone());

    let summary = pipeline.run_once().await.expect("poll");
    assert_eq!(summary.processed, 100);
    assert_eq!(store.all_ids().await.last(), Some(&150));
}

#[tokio::test]
async fn total_outage_serves_fallback_and_marks_the_run() {
    let router = Router::new()
        .route("/{bot}/getUpdates", get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "down") }))
        .route("/s/{handle}", get(|| async { (StatusCode::BAD_GATEWAY, "down") }));
    let base = serve(router).await;
    let store = Arc::new(MemoryDealStore::new());

    let summary = pipeline_for(&base, store.clone()).run_once().await.expect("never errors");

    assert_eq!(summary.origin, DataOrigin::Fallback);
    assert_eq!(summary.processed, 0);
    assert!(summary.total > 0);
    assert_eq!(store.count_messages().await.unwrap(), 0);
    let runs = store.all_runs().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].origin, Some(DataOrigin::Fallback));
}
