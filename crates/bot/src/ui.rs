//! Terminal dashboard.
//!
//! A plain-text view redrawn twice a second. With `--nogui` the livestream
//! mode falls back to a single refreshing status line and the conference
//! mode runs silently (logs only).

use std::fmt::Write as _;
use std::io::Write as _;
use std::time::Duration;

use crate::conference::ConferenceStatus;
use crate::conference_manager::ConferenceManager;
use crate::viewer::ViewerState;
use crate::viewer_manager::ViewerManager;

const REFRESH_INTERVAL: Duration = Duration::from_millis(500);

const CONFERENCE_STATUS_ROWS: [ConferenceStatus; 10] = [
    ConferenceStatus::Idle,
    ConferenceStatus::New,
    ConferenceStatus::Checking,
    ConferenceStatus::Connecting,
    ConferenceStatus::Connected,
    ConferenceStatus::Completed,
    ConferenceStatus::Failed,
    ConferenceStatus::Disconnected,
    ConferenceStatus::Closed,
    ConferenceStatus::Exception,
];

const VIEWER_STATE_ROWS: [ViewerState; 11] = [
    ViewerState::Idle,
    ViewerState::Handshaking,
    ViewerState::CreatingTransport,
    ViewerState::Consuming,
    ViewerState::New,
    ViewerState::Checking,
    ViewerState::Connected,
    ViewerState::Completed,
    ViewerState::Failed,
    ViewerState::Disconnected,
    ViewerState::Closed,
];

const VIEWER_ERROR_ROWS: [ViewerState; 4] = [
    ViewerState::GettingAuthTokenFailed,
    ViewerState::StreamNotFound,
    ViewerState::ConsumeStreamFailed,
    ViewerState::Exception,
];

pub async fn conference_dashboard(manager: &ConferenceManager) {
    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
    loop {
        ticker.tick().await;

        let stats = manager.stats();
        let mut screen = String::new();
        screen.push_str("\x1b[2J\x1b[H");
        let _ = writeln!(screen, "=== Conference Swarm ({} sessions) ===", manager.session_count());

        let _ = writeln!(screen, "--- Session Status ---");
        for status in CONFERENCE_STATUS_ROWS {
            let count = stats.status.get(&status).copied().unwrap_or(0);
            let _ = writeln!(screen, "{:<14} {:>5}", status.label(), count);
        }

        let _ = writeln!(screen, "--- Consumed Peers ---");
        let mut buckets: Vec<_> = stats.consume_peer.iter().collect();
        buckets.sort_by_key(|(bucket, _)| **bucket);
        for (bucket, count) in buckets {
            let _ = writeln!(screen, "{bucket:>3} peers {count:>5}");
        }

        let _ = writeln!(screen, "--- Producers ---");
        let _ = writeln!(screen, "productive     {:>5}", stats.productive_peer);
        let mut audio_frames = 0u64;
        let mut data_messages = 0u64;
        for factory in manager.factories() {
            audio_frames += factory.audio_frames_sent();
            data_messages += factory.data_messages_sent();
        }
        let _ = writeln!(screen, "audio frames   {audio_frames:>10}");
        let _ = writeln!(screen, "data messages  {data_messages:>10}");

        let _ = writeln!(screen, "avg peers      {:>8.2}", stats.avg_peer_count);
        let _ = writeln!(screen, "avg data fps   {:>8.4}", stats.avg_frame_rate);

        print!("{screen}");
        let _ = std::io::stdout().flush();
    }
}

pub async fn livestream_dashboard(manager: &ViewerManager) {
    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
    loop {
        ticker.tick().await;

        let state_stats = manager.state_stats();
        let video_stats = manager.video_stats();

        let mut screen = String::new();
        screen.push_str("\x1b[2J\x1b[H");
        let _ = writeln!(
            screen,
            "=== Livestream Viewers ({} watching {}) ===",
            manager.viewer_count(),
            manager.streamer_id(),
        );

        let _ = writeln!(screen, "--- Viewer State ---");
        for state in VIEWER_STATE_ROWS {
            let count = state_stats.get(&state).copied().unwrap_or(0);
            let _ = writeln!(screen, "{:<16} {:>5}", state.label(), count);
        }

        let _ = writeln!(screen, "--- Errors ---");
        for state in VIEWER_ERROR_ROWS {
            let count = state_stats.get(&state).copied().unwrap_or(0);
            let _ = writeln!(screen, "{:<16} {:>5}", state.label(), count);
        }

        let _ = writeln!(screen, "Average FPS: {:8.4}", video_stats.avg_fps);
        let _ = writeln!(screen, "--- Resolutions ---");
        let mut resolutions: Vec<_> = video_stats.resolution.iter().collect();
        resolutions.sort_by(|a, b| a.0.cmp(b.0));
        for (resolution, count) in resolutions {
            let _ = writeln!(screen, "{resolution:<12} {count}");
        }

        print!("{screen}");
        let _ = std::io::stdout().flush();
    }
}

/// The `--nogui` livestream view: one line, refreshed in place. Returns
/// once every viewer has failed or errored out.
pub async fn livestream_status_line(manager: &ViewerManager) {
    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
    loop {
        ticker.tick().await;

        let stats = manager.state_stats();
        let count = |state: ViewerState| stats.get(&state).copied().unwrap_or(0);

        let init = count(ViewerState::Idle)
            + count(ViewerState::Handshaking)
            + count(ViewerState::CreatingTransport)
            + count(ViewerState::Consuming)
            + count(ViewerState::New)
            + count(ViewerState::Checking)
            + count(ViewerState::Connected);
        let ok = count(ViewerState::Completed);
        let fail = count(ViewerState::Failed)
            + count(ViewerState::Disconnected)
            + count(ViewerState::Closed);
        let err: u32 = VIEWER_ERROR_ROWS.iter().map(|state| count(*state)).sum();

        print!(
            "\r[init={:2} ok={:2} fail={:2} err={:2} | avgFps={:8.4}]",
            init,
            ok,
            fail,
            err,
            manager.video_stats().avg_fps,
        );
        let _ = std::io::stdout().flush();

        let viewer_count = manager.viewer_count() as u32;
        if viewer_count > 0 && fail + err == viewer_count {
            println!();
            return;
        }
    }
}
