//! Scheduler and manager tests: ticks, pause, delete, events.

mod support;

use std::sync::Arc;
use std::time::Duration;

use downloader_engine::{DownloadManager, EngineConfig, Event};
use tempfile::TempDir;

use support::{Body, CollectingSink, ScriptedTransport, content, wait_until};

const URL: &str = "https://example.test/f.bin";

fn config(dir: &TempDir) -> EngineConfig {
    EngineConfig::new(dir.path())
        .with_min_attempt_interval(Duration::ZERO)
        .with_intervals(Duration::from_millis(20), Duration::from_millis(50))
        .with_event_pacing(Duration::ZERO)
}

fn open(
    dir: &TempDir,
    transport: &Arc<ScriptedTransport>,
) -> (DownloadManager, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::default());
    let manager = DownloadManager::open(config(dir), transport.clone(), sink.clone()).unwrap();
    (manager, sink)
}

#[tokio::test]
async fn test_two_ticks_complete_interrupted_download() {
    let dir = TempDir::new().unwrap();
    let data = content(1000);
    let transport = ScriptedTransport::new(data.clone(), true)
        .then(Body::Cut(400))
        .into_arc();
    let (manager, sink) = open(&dir, &transport);
    manager.add(URL).await.unwrap();

    let first = manager.tick().await;
    assert_eq!(first.launched, vec![URL.to_string()]);
    manager.join_attempts().await;
    let partial = manager.record(URL).unwrap();
    assert_eq!(partial.downloaded_bytes, 400);
    assert!(!partial.complete);

    let second = manager.tick().await;
    assert_eq!(second.launched, vec![URL.to_string()]);
    manager.join_attempts().await;

    let done = manager.record(URL).unwrap();
    assert!(done.complete);
    assert!((done.percent - 100.0).abs() < f32::EPSILON);
    assert_eq!(done.downloaded_bytes, 1000);
    assert_eq!(transport.fetch_offsets(), vec![None, Some(400)]);
    assert_eq!(std::fs::read(&done.temp_file_path).unwrap(), data);

    // Complete records are skipped from now on
    let third = manager.tick().await;
    assert!(third.launched.is_empty());
    assert_eq!(third.skipped, 1);

    manager.shutdown().await;
    let events = sink.events();
    assert!(events.contains(&Event::Done {
        url: URL.to_string(),
        complete: true
    }));
    for event in &events {
        match event {
            Event::RegistryChanged(records) => {
                for r in records {
                    if let Some(total) = r.total_bytes {
                        assert!(r.downloaded_bytes <= total, "{r:?}");
                    }
                }
            }
            Event::Progress(p) => {
                if let Some(total) = p.total {
                    assert!(p.downloaded <= total, "{p:?}");
                }
            }
            Event::Done { .. } => {}
        }
    }
}

#[tokio::test]
async fn test_paused_record_is_never_launched() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(content(100), true).into_arc();
    let (manager, _sink) = open(&dir, &transport);
    manager.add(URL).await.unwrap();
    assert!(manager.pause(URL, true).await.unwrap());

    for _ in 0..3 {
        let report = manager.tick().await;
        assert!(report.launched.is_empty());
        assert_eq!(report.skipped, 1);
    }
    assert!(transport.fetch_offsets().is_empty());
    assert_eq!(transport.probe_count(), 0);

    assert!(manager.pause(URL, false).await.unwrap());
    assert_eq!(manager.tick().await.launched.len(), 1);
    manager.join_attempts().await;
    assert!(manager.record(URL).unwrap().complete);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_pause_cancels_in_flight_attempt() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(content(1000), true)
        .then(Body::Stall(300))
        .into_arc();
    let (manager, _sink) = open(&dir, &transport);
    manager.add(URL).await.unwrap();

    manager.tick().await;
    assert!(
        wait_until(Duration::from_secs(5), || {
            manager.record(URL).unwrap().downloaded_bytes >= 300
        })
        .await
    );

    let paused = tokio::time::timeout(Duration::from_secs(5), manager.pause(URL, true))
        .await
        .expect("pause must not hang on a stalled transfer")
        .unwrap();
    assert!(paused);

    let snap = manager.record(URL).unwrap();
    assert!(snap.paused);
    assert!(!snap.complete);
    assert_eq!(snap.downloaded_bytes, 300);
    assert_eq!(std::fs::metadata(&snap.temp_file_path).unwrap().len(), 300);

    // A mid-attempt record would be refreshed, a paused one is skipped
    let report = manager.tick().await;
    assert_eq!(report.refreshed, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(transport.fetch_offsets().len(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_delete_cancels_attempt_and_removes_temp_file() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(content(1000), true)
        .then(Body::Stall(200))
        .into_arc();
    let (manager, _sink) = open(&dir, &transport);
    let added = manager.add(URL).await.unwrap();

    manager.tick().await;
    assert!(
        wait_until(Duration::from_secs(5), || {
            manager.record(URL).is_some_and(|r| r.downloaded_bytes >= 200)
        })
        .await
    );

    assert!(manager.delete(URL, true).await.unwrap());
    assert!(manager.records().is_empty());
    assert!(!added.temp_file_path.exists());
    assert!(!manager.delete(URL, true).await.unwrap());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_running_loop_finishes_and_persists() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(content(600), true)
        .then(Body::Cut(250))
        .into_arc();
    let (manager, sink) = open(&dir, &transport);
    manager.add(URL).await.unwrap();

    assert!(manager.start());
    assert!(!manager.start(), "second start is a no-op");
    assert!(
        wait_until(Duration::from_secs(10), || !manager.has_pending()).await,
        "download should finish"
    );
    manager.shutdown().await;

    let state = std::fs::read_to_string(dir.path().join("state.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&state).unwrap();
    let record = &doc["records"][0];
    assert_eq!(record["url"], URL);
    assert_eq!(record["complete"], true);
    assert_eq!(record["downloadedBytes"], 600);
    assert!(record["attemptCount"].as_u64().unwrap() >= 2);

    assert!(
        sink.events()
            .iter()
            .any(|e| matches!(e, Event::RegistryChanged(_)))
    );
}

#[tokio::test]
async fn test_restart_resumes_from_persisted_progress() {
    let dir = TempDir::new().unwrap();
    let data = content(900);

    let first = ScriptedTransport::new(data.clone(), true)
        .then(Body::Cut(500))
        .into_arc();
    let (manager, _sink) = open(&dir, &first);
    manager.add(URL).await.unwrap();
    manager.tick().await;
    manager.join_attempts().await;
    manager.shutdown().await;

    let second = ScriptedTransport::new(data.clone(), true).into_arc();
    let (manager, _sink) = open(&dir, &second);
    let restored = manager.record(URL).unwrap();
    assert_eq!(restored.downloaded_bytes, 500);
    assert_eq!(restored.attempt_count, 1);

    manager.tick().await;
    manager.join_attempts().await;
    assert_eq!(second.fetch_offsets(), vec![Some(500)]);
    let done = manager.record(URL).unwrap();
    assert!(done.complete);
    assert_eq!(std::fs::read(&done.temp_file_path).unwrap(), data);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_resume_right_after_pause_launches_again() {
    let dir = TempDir::new().unwrap();
    // Default five-second attempt spacing
    let config = EngineConfig::new(dir.path())
        .with_intervals(Duration::from_millis(20), Duration::from_millis(50))
        .with_event_pacing(Duration::ZERO);
    let transport = ScriptedTransport::new(content(600), true)
        .then(Body::Stall(200))
        .into_arc();
    let sink = Arc::new(CollectingSink::default());
    let manager = DownloadManager::open(config, transport.clone(), sink).unwrap();
    manager.add(URL).await.unwrap();

    assert_eq!(manager.tick().await.launched, vec![URL.to_string()]);
    assert!(
        wait_until(Duration::from_secs(5), || {
            manager.record(URL).unwrap().downloaded_bytes >= 200
        })
        .await
    );
    assert!(manager.pause(URL, true).await.unwrap());
    assert!(manager.pause(URL, false).await.unwrap());

    assert_eq!(manager.tick().await.launched, vec![URL.to_string()]);
    manager.join_attempts().await;
    assert_eq!(transport.fetch_offsets(), vec![None, Some(200)]);
    assert!(manager.record(URL).unwrap().complete);
    manager.shutdown().await;
}
