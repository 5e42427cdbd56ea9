//! End-to-end scenarios

use std::time::{Duration, Instant};
use tempfile::TempDir;

use crate::events::PipelineEvent;
use crate::integration::fixtures::{dash_request, test_state};
use crate::session::{Container, SessionStatus};

/// Wait until the session reaches a terminal status.
async fn wait_terminal(
    state: &crate::state::AppState,
    session_id: uuid::Uuid,
    deadline: Duration,
) -> SessionStatus {
    let start = Instant::now();
    loop {
        let session = state
            .session_store
            .get_session(session_id)
            .expect("session exists");
        if session.status.is_terminal() {
            return session.status;
        }
        if start.elapsed() > deadline {
            panic!("session stuck in {:?}", session.status);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_startup_latency_and_progressive_manifest() {
    let dir = TempDir::new().unwrap();
    let state = test_state(dir.path(), 4, 150);
    let mut events = state.pipeline.events().subscribe();

    let started = Instant::now();
    let handle = state
        .start_transcode(dash_request(dir.path()))
        .await
        .expect("start streaming");
    // The handle comes back long before encoding finishes
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(handle.status, SessionStatus::Running);

    // First segment-ready event for index 0 arrives within seconds
    let first = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await.expect("event stream open") {
                PipelineEvent::SegmentReady { session_id, index, .. } => {
                    assert_eq!(session_id, handle.session_id);
                    break index;
                }
                _ => continue,
            }
        }
    })
    .await
    .expect("first segment within deadline");
    assert_eq!(first, 0);

    // The dynamic manifest exists and references at least one segment
    let manifest_path = handle.output_dir.join("stream.mpd");
    for _ in 0..40 {
        if manifest_path.is_file() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let manifest = std::fs::read_to_string(&manifest_path).expect("manifest written");
    assert!(manifest.contains(r#"type="dynamic""#));
    assert!(manifest.contains("video-720p-$Number$.m4s"));

    // Run to completion: the manifest flips to static
    let status = wait_terminal(&state, handle.session_id, Duration::from_secs(15)).await;
    assert_eq!(status, SessionStatus::Completed);

    let session = state.session_store.get_session(handle.session_id).unwrap();
    let stored_manifest =
        std::fs::read_to_string(session.manifest_url.expect("manifest url recorded"))
            .expect("stored manifest readable");
    assert!(stored_manifest.contains(r#"type="static""#));
    assert!(!stored_manifest.contains("minimumUpdatePeriod"));

    // Segment indices arrived contiguously
    let status = state.pipeline.get_streaming_status(handle.session_id).unwrap();
    assert_eq!(status.status, SessionStatus::Completed);
    state.shutdown();
}

#[tokio::test]
async fn test_dedup_serves_from_content_store() {
    let dir = TempDir::new().unwrap();
    let state = test_state(dir.path(), 3, 100);

    let request = dash_request(dir.path());
    let first = state.start_transcode(request.clone()).await.unwrap();
    let status = wait_terminal(&state, first.session_id, Duration::from_secs(15)).await;
    assert_eq!(status, SessionStatus::Completed);
    assert!(state.content_store.exists(&first.fingerprint));

    // The identical request completes instantly without a new encoder
    let started = Instant::now();
    let second = state.start_transcode(request).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(second.status, SessionStatus::Completed);
    assert_eq!(second.fingerprint, first.fingerprint);
    let manifest_url = second.manifest_url.expect("dedup handle carries manifest url");
    assert!(manifest_url.contains(&first.fingerprint));
    state.shutdown();
}

#[tokio::test]
async fn test_segment_bytes_match_store() {
    let dir = TempDir::new().unwrap();
    let state = test_state(dir.path(), 3, 100);

    let handle = state.start_transcode(dash_request(dir.path())).await.unwrap();
    wait_terminal(&state, handle.session_id, Duration::from_secs(15)).await;

    let bytes = state
        .pipeline
        .get_segment(handle.session_id, 0)
        .await
        .expect("segment 0 readable");
    // The fake encoder writes deterministic payloads
    assert_eq!(&bytes[..], b"vseg-00001");

    let (content_dir, _) = state.content_store.get(&handle.fingerprint).unwrap();
    let on_disk = std::fs::read(content_dir.join("segments/video-720p-0.m4s")).unwrap();
    assert_eq!(&bytes[..], &on_disk[..]);
    state.shutdown();
}

#[tokio::test]
async fn test_cancellation_leaves_no_content() {
    let dir = TempDir::new().unwrap();
    // A slow encoder: 30 segments, 300ms apart
    let state = test_state(dir.path(), 30, 300);
    let mut events = state.pipeline.events().subscribe();

    let handle = state.start_transcode(dash_request(dir.path())).await.unwrap();

    // Wait for streaming to actually begin
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if matches!(
                events.recv().await.expect("event stream open"),
                PipelineEvent::SegmentReady { .. }
            ) {
                break;
            }
        }
    })
    .await
    .expect("first segment before cancellation");

    state.stop_session(handle.session_id).unwrap();
    let status = wait_terminal(&state, handle.session_id, Duration::from_secs(5)).await;
    assert_eq!(status, SessionStatus::Cancelled);

    // Partial output was not promoted
    assert!(!state.content_store.exists(&handle.fingerprint));

    // The same request runs the pipeline again
    let again = state.start_transcode(dash_request(dir.path())).await.unwrap();
    assert_eq!(again.status, SessionStatus::Running);
    state.stop_session(again.session_id).unwrap();
    wait_terminal(&state, again.session_id, Duration::from_secs(5)).await;
    state.shutdown();
}

#[tokio::test]
async fn test_hls_playlist_lifecycle() {
    let dir = TempDir::new().unwrap();
    let state = test_state(dir.path(), 3, 100);

    let mut request = dash_request(dir.path());
    request.container = Container::Hls;
    let handle = state.start_transcode(request).await.unwrap();
    let status = wait_terminal(&state, handle.session_id, Duration::from_secs(15)).await;
    assert_eq!(status, SessionStatus::Completed);

    let session = state.session_store.get_session(handle.session_id).unwrap();
    let playlist = std::fs::read_to_string(session.manifest_url.unwrap()).unwrap();
    assert!(playlist.starts_with("#EXTM3U"));
    assert!(playlist.contains("#EXT-X-ENDLIST"));
    assert!(playlist.contains("segments/video-720p-0.m4s"));
    state.shutdown();
}
