//! Receive-side consumers that turn frames into dashboard statistics.

use std::sync::Mutex;

use stampede_media::{DataConsumer, VideoConsumer, VideoFrame, rtc_timestamp_ms};
use stampede_protocol::frame;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default)]
pub struct VideoStat {
    pub freeze_time_ms: i64,
    pub frame_rate: f32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DataStat {
    pub freeze_time_ms: i64,
    pub frame_rate: f32,
}

#[derive(Default)]
struct StatWindow {
    time_last_report: i64,
    time_last_frame: i64,
    frame_count: u32,
    width: u32,
    height: u32,
}

impl StatWindow {
    fn record_frame(&mut self, now: i64) {
        self.frame_count += 1;
        if self.time_last_report == 0 {
            self.time_last_report = now;
        }
        self.time_last_frame = now;
    }

    /// Frames per second since the last report; resets the window.
    fn drain_rate(&mut self, now: i64) -> f32 {
        let elapsed = now - self.time_last_report;
        let rate = if elapsed > 0 {
            self.frame_count as f32 / elapsed as f32 * 1000.0
        } else {
            0.0
        };
        self.frame_count = 0;
        self.time_last_report = now;
        rate
    }
}

/// Counts decoded video frames and remembers the last resolution.
#[derive(Default)]
pub struct ReportVideoConsumer {
    window: Mutex<StatWindow>,
}

impl ReportVideoConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn video_stat(&self) -> VideoStat {
        let now = rtc_timestamp_ms();
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        VideoStat {
            freeze_time_ms: now - window.time_last_frame,
            width: window.width,
            height: window.height,
            frame_rate: window.drain_rate(now),
        }
    }

    pub fn reset(&self) {
        *self.window.lock().unwrap_or_else(|e| e.into_inner()) = StatWindow::default();
    }
}

impl VideoConsumer for ReportVideoConsumer {
    fn on_video_frame(&self, frame: &VideoFrame<'_>) {
        let now = rtc_timestamp_ms();
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.record_frame(now);
        window.width = frame.width;
        window.height = frame.height;
    }
}

/// Validates incoming data-channel frames and counts the ones that pass.
pub struct ReportDataConsumer {
    validate: bool,
    window: Mutex<StatWindow>,
}

impl ReportDataConsumer {
    pub fn new(validate: bool) -> Self {
        Self {
            validate,
            window: Mutex::new(StatWindow::default()),
        }
    }

    pub fn data_stat(&self) -> DataStat {
        let now = rtc_timestamp_ms();
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let freeze_time_ms = now - window.time_last_frame;
        DataStat {
            freeze_time_ms,
            frame_rate: window.drain_rate(now),
        }
    }
}

impl DataConsumer for ReportDataConsumer {
    fn on_data(&self, payload: &[u8]) {
        if payload.len() < frame::CHECKSUM_LEN {
            warn!(len = payload.len(), "dropping data frame, too short");
            return;
        }

        if self.validate
            && let Err(e) = frame::verify(payload)
        {
            warn!(error = %e, "dropping data frame");
            return;
        }

        let now = rtc_timestamp_ms();
        self.window
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_frame(now);
    }
}
