//! Livestream viewer swarm supervisor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use stampede_media::engine::PeerConnectionFactory;
use stampede_media::synthetic::{SyntheticConfig, SyntheticFactory};
use tracing::info;

use crate::executor::Executor;
use crate::http::{self, Endpoints, LiveApi};
use crate::viewer::{Viewer, ViewerState};

#[derive(Debug, Clone)]
pub struct ViewerOptions {
    pub endpoints: Endpoints,
    pub engine: SyntheticConfig,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            engine: SyntheticConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VideoStats {
    pub avg_fps: f32,
    /// Count of viewers per last-seen resolution (`"1280x720"`).
    pub resolution: HashMap<String, u32>,
}

pub struct ViewerManager {
    options: ViewerOptions,
    executors: Vec<Arc<Executor>>,
    factories: Vec<Arc<SyntheticFactory>>,
    http: reqwest::Client,
    streamer_id: Mutex<String>,
    viewers: Mutex<Vec<Viewer>>,
}

impl ViewerManager {
    pub fn new(
        num_worker_threads: usize,
        num_peer_connection_factories: usize,
        options: ViewerOptions,
    ) -> Self {
        Self {
            executors: Executor::pool(num_worker_threads),
            factories: (0..num_peer_connection_factories.max(1))
                .map(|_| Arc::new(SyntheticFactory::new(options.engine.clone())))
                .collect(),
            http: http::new_client(),
            streamer_id: Mutex::new(String::new()),
            viewers: Mutex::new(Vec::new()),
            options,
        }
    }

    pub fn set_streamer_id(&self, streamer_id: impl Into<String>) {
        *self
            .streamer_id
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = streamer_id.into();
    }

    pub fn streamer_id(&self) -> String {
        self.streamer_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Grow or shrink the swarm. New viewers start watching immediately;
    /// removed viewers are stopped and drained before release.
    pub async fn set_viewer_count(&self, viewer_count: usize) {
        let removed: Vec<Viewer> = {
            let mut viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
            if viewers.len() > viewer_count {
                viewers.drain(viewer_count..).collect()
            } else {
                Vec::new()
            }
        };
        for viewer in &removed {
            viewer.stop_and_wait().await;
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), "viewers stopped");
            return;
        }

        let streamer_id = self.streamer_id();
        let mut viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
        while viewers.len() < viewer_count {
            let shard = viewers.len();
            let concrete_factory = Arc::clone(&self.factories[shard % self.factories.len()]);
            let factory: Arc<dyn PeerConnectionFactory> = concrete_factory;
            let viewer = Viewer::new(
                Arc::clone(&self.executors[shard % self.executors.len()]),
                LiveApi::new(self.http.clone(), self.options.endpoints.http.clone()),
                factory,
            );
            viewer.watch(streamer_id.clone());
            viewers.push(viewer);
        }
    }

    pub fn state_stats(&self) -> HashMap<ViewerState, u32> {
        let mut stats = HashMap::new();
        let viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
        for viewer in viewers.iter() {
            *stats.entry(viewer.state()).or_insert(0) += 1;
        }
        stats
    }

    pub fn video_stats(&self) -> VideoStats {
        let mut stats = VideoStats::default();
        let viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
        if viewers.is_empty() {
            return stats;
        }

        let mut fps_sum = 0.0f32;
        for viewer in viewers.iter() {
            let video = viewer.video_stat();
            fps_sum += video.frame_rate;
            *stats
                .resolution
                .entry(format!("{}x{}", video.width, video.height))
                .or_insert(0) += 1;
        }
        stats.avg_fps = fps_sum / viewers.len() as f32;
        stats
    }
}
