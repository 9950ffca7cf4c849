mod support;

use std::sync::Arc;
use std::time::Duration;

use stampede_bot::executor::Executor;
use stampede_bot::http::{self, Endpoints, LiveApi};
use stampede_bot::viewer::{Viewer, ViewerState};
use stampede_bot::viewer_manager::{ViewerManager, ViewerOptions};
use stampede_media::engine::PeerConnectionFactory;
use stampede_media::synthetic::{SyntheticConfig, SyntheticFactory};
use support::MockLivePortal;

fn fast_video() -> SyntheticConfig {
    SyntheticConfig {
        video_fps: 60,
        video_width: 64,
        video_height: 36,
        ..Default::default()
    }
}

fn viewer(portal: &MockLivePortal, config: SyntheticConfig) -> Viewer {
    let factory: Arc<dyn PeerConnectionFactory> = Arc::new(SyntheticFactory::new(config));
    Viewer::new(
        Executor::new(),
        LiveApi::new(http::new_client(), portal.http_base.clone()),
        factory,
    )
}

async fn eventually(deadline: Duration, check: impl Fn() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn viewer_completes_and_receives_video() {
    let portal = MockLivePortal::spawn().await;
    let viewer = viewer(&portal, fast_video());

    viewer.watch("streamer-1".into());

    assert!(
        eventually(Duration::from_secs(10), || {
            viewer.state() == ViewerState::Completed
        })
        .await,
        "viewer stuck in {:?}",
        viewer.state(),
    );
    assert_eq!(portal.resume_count(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let stat = viewer.video_stat();
    assert!(stat.frame_rate > 0.0, "no frames: {stat:?}");
    assert_eq!((stat.width, stat.height), (64, 36));

    // Keepalive pings flow once the viewer is watching.
    assert!(eventually(Duration::from_secs(5), || portal.ping_count() >= 1).await);

    // Stopping tears the sink down; no more frames arrive.
    viewer.stop_and_wait().await;
    let _ = viewer.video_stat();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(viewer.video_stat().frame_rate, 0.0);
}

#[tokio::test]
async fn refused_sign_parks_the_viewer_in_auth_failed() {
    let portal = MockLivePortal::spawn().await;
    portal.refuse_sign();
    let viewer = viewer(&portal, fast_video());

    viewer.watch("streamer-2".into());

    assert!(
        eventually(Duration::from_secs(5), || {
            viewer.state() == ViewerState::GettingAuthTokenFailed
        })
        .await
    );
    assert_eq!(portal.resume_count(), 0);
}

#[tokio::test]
async fn missing_stream_parks_the_viewer_in_stream_not_found() {
    let portal = MockLivePortal::spawn().await;
    portal.drop_stream();
    let viewer = viewer(&portal, fast_video());

    viewer.watch("streamer-3".into());

    assert!(
        eventually(Duration::from_secs(5), || {
            viewer.state() == ViewerState::StreamNotFound
        })
        .await
    );
    assert!(viewer.state().is_error());
}

#[tokio::test]
async fn viewer_swarm_grows_and_shrinks() {
    let portal = MockLivePortal::spawn().await;
    let manager = ViewerManager::new(2, 1, ViewerOptions {
        endpoints: Endpoints {
            ws: portal.http_base.clone(),
            http: portal.http_base.clone(),
        },
        engine: fast_video(),
    });
    manager.set_streamer_id("streamer-4");

    manager.set_viewer_count(3).await;
    assert_eq!(manager.viewer_count(), 3);

    assert!(
        eventually(Duration::from_secs(10), || {
            manager
                .state_stats()
                .get(&ViewerState::Completed)
                .copied()
                .unwrap_or(0)
                == 3
        })
        .await
    );

    let video = manager.video_stats();
    assert_eq!(video.resolution.get("64x36").copied(), Some(3));

    manager.set_viewer_count(1).await;
    assert_eq!(manager.viewer_count(), 1);
}
