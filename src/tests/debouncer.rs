use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::DebouncerConfig;
use crate::content::now_ms;
use crate::debouncer::{EventDebouncer, InternalWriteTags};
use crate::watcher::{ChangeKind, WatchEvent};

fn event(kind: ChangeKind, path: &str) -> WatchEvent {
    WatchEvent {
        kind,
        path: PathBuf::from(path),
        timestamp_ms: now_ms(),
    }
}

struct Pipeline {
    raw_tx: mpsc::UnboundedSender<WatchEvent>,
    out_rx: mpsc::UnboundedReceiver<WatchEvent>,
    tags: Arc<InternalWriteTags>,
}

fn pipeline(debounce_ms: u64, tag_expiry: Duration) -> Pipeline {
    let tags = Arc::new(InternalWriteTags::new(tag_expiry));
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    // Detach the debounce task; it dies with its channels
    let _ = EventDebouncer::spawn(&DebouncerConfig { debounce_ms }, tags.clone(), raw_rx, out_tx);
    Pipeline {
        raw_tx,
        out_rx,
        tags,
    }
}

/// Receives the next event, or `None` if nothing arrives within the (paused,
/// auto-advancing) window.
async fn try_next(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) -> Option<WatchEvent> {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test(start_paused = true)]
async fn should_collapse_modify_burst_into_one_event() {
    let mut pipeline = pipeline(100, Duration::from_secs(5));
    for _ in 0..8 {
        pipeline
            .raw_tx
            .send(event(ChangeKind::Modify, "/a.md"))
            .unwrap();
    }

    let emitted = try_next(&mut pipeline.out_rx).await.unwrap();
    assert_eq!(emitted.kind, ChangeKind::Modify);
    assert_eq!(emitted.path, PathBuf::from("/a.md"));

    // Exactly one: the window has long elapsed and nothing else is pending
    assert!(pipeline.out_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn should_keep_delete_distinct_from_modify() {
    let mut pipeline = pipeline(100, Duration::from_secs(5));
    pipeline
        .raw_tx
        .send(event(ChangeKind::Modify, "/a.md"))
        .unwrap();
    pipeline
        .raw_tx
        .send(event(ChangeKind::Delete, "/a.md"))
        .unwrap();

    // Coalescing is keyed by (kind, path): a delete after a modify is new
    // information and both must come out
    let first = try_next(&mut pipeline.out_rx).await.unwrap();
    let second = try_next(&mut pipeline.out_rx).await.unwrap();
    let mut kinds = vec![first.kind, second.kind];
    kinds.sort_by_key(|kind| format!("{kind:?}"));
    assert_eq!(kinds, vec![ChangeKind::Delete, ChangeKind::Modify]);
}

#[tokio::test(start_paused = true)]
async fn should_debounce_paths_independently() {
    let mut pipeline = pipeline(100, Duration::from_secs(5));
    pipeline
        .raw_tx
        .send(event(ChangeKind::Modify, "/a.md"))
        .unwrap();
    pipeline
        .raw_tx
        .send(event(ChangeKind::Modify, "/b.md"))
        .unwrap();
    pipeline
        .raw_tx
        .send(event(ChangeKind::Modify, "/a.md"))
        .unwrap();

    let mut paths = vec![
        try_next(&mut pipeline.out_rx).await.unwrap().path,
        try_next(&mut pipeline.out_rx).await.unwrap().path,
    ];
    paths.sort();
    assert_eq!(paths, vec![PathBuf::from("/a.md"), PathBuf::from("/b.md")]);
    assert!(pipeline.out_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn should_forward_everything_with_zero_window() {
    let mut pipeline = pipeline(0, Duration::from_secs(5));
    for _ in 0..3 {
        pipeline
            .raw_tx
            .send(event(ChangeKind::Modify, "/a.md"))
            .unwrap();
    }
    // Coalescing disabled: all three come straight through
    for _ in 0..3 {
        assert!(try_next(&mut pipeline.out_rx).await.is_some());
    }
}

#[tokio::test(start_paused = true)]
#[tracing_test::traced_test]
async fn should_suppress_tagged_internal_write() {
    let mut pipeline = pipeline(50, Duration::from_secs(5));
    pipeline.tags.insert(&PathBuf::from("/a.md"));

    // The echo of our own write: consumed, nothing emitted
    pipeline
        .raw_tx
        .send(event(ChangeKind::Modify, "/a.md"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pipeline.out_rx.try_recv().is_err());
    assert_eq!(pipeline.tags.live_count(), 0);
    assert!(logs_contain("suppressed echo of internal write"));

    // The tag is single-use: the next modification is a real external change
    pipeline
        .raw_tx
        .send(event(ChangeKind::Modify, "/a.md"))
        .unwrap();
    assert!(try_next(&mut pipeline.out_rx).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn should_not_suppress_after_tag_expiry() {
    let mut pipeline = pipeline(50, Duration::from_millis(5000));
    pipeline.tags.insert(&PathBuf::from("/a.md"));

    // No matching event arrives within the tag's lifetime
    tokio::time::sleep(Duration::from_millis(5001)).await;
    assert_eq!(pipeline.tags.live_count(), 0);

    // An event after expiry is treated as external, the safer direction
    pipeline
        .raw_tx
        .send(event(ChangeKind::Modify, "/a.md"))
        .unwrap();
    assert!(try_next(&mut pipeline.out_rx).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn should_only_suppress_tagged_path() {
    let mut pipeline = pipeline(50, Duration::from_secs(5));
    pipeline.tags.insert(&PathBuf::from("/a.md"));

    pipeline
        .raw_tx
        .send(event(ChangeKind::Modify, "/b.md"))
        .unwrap();
    let emitted = try_next(&mut pipeline.out_rx).await.unwrap();
    assert_eq!(emitted.path, PathBuf::from("/b.md"));
    // The unrelated path didn't consume the tag
    assert_eq!(pipeline.tags.live_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn should_reset_window_on_repeated_events() {
    let mut pipeline = pipeline(100, Duration::from_secs(5));

    // Events arriving every 60ms keep resetting a 100ms window; nothing can
    // come out until they stop
    for _ in 0..5 {
        pipeline
            .raw_tx
            .send(event(ChangeKind::Modify, "/a.md"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(pipeline.out_rx.try_recv().is_err());
    }
    let emitted = try_next(&mut pipeline.out_rx).await.unwrap();
    assert_eq!(emitted.kind, ChangeKind::Modify);
    assert!(pipeline.out_rx.try_recv().is_err());
}
