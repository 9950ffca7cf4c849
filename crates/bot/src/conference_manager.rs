//! Conference swarm supervisor.
//!
//! Owns the shared pools (executors, HTTP client, peer-connection
//! factories), creates and destroys sessions on `apply_config`, drives the
//! global producer tick, and aggregates per-session state into a dashboard
//! snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng as _;
use stampede_media::engine::PeerConnectionFactory;
use stampede_media::synthetic::{SyntheticConfig, SyntheticFactory};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::conference::{ConferencePeer, ConferenceStatus};
use crate::executor::Executor;
use crate::http::{self, Endpoints};
use crate::protoo::DEFAULT_REQUEST_TIMEOUT;

#[derive(Debug, Clone)]
pub struct ConferenceOptions {
    pub endpoints: Endpoints,
    pub request_timeout: Duration,
    /// Cadence of the global producer tick.
    pub tick_interval: Duration,
    /// Stamp and verify CRC prefixes on data-channel frames.
    pub validate_data_channel: bool,
    pub engine: SyntheticConfig,
}

impl Default for ConferenceOptions {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            tick_interval: Duration::from_millis(50),
            validate_data_channel: true,
            engine: SyntheticConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConferenceStats {
    pub status: HashMap<ConferenceStatus, u32>,
    /// Histogram: how many sessions see `key` remote peers.
    pub consume_peer: HashMap<u32, u32>,
    pub productive_peer: usize,
    pub avg_peer_count: f32,
    pub avg_frame_rate: f32,
}

pub struct ConferenceManager {
    inner: Arc<ManagerInner>,
    tick_task: AbortHandle,
}

struct ManagerInner {
    device_id: String,
    options: ConferenceOptions,
    http: reqwest::Client,
    executors: Vec<Arc<Executor>>,
    factories: Vec<Arc<SyntheticFactory>>,
    sessions: Mutex<Vec<ConferencePeer>>,
    config: Mutex<(usize, usize)>,
    next_user_id: AtomicU32,
}

impl ConferenceManager {
    pub fn new(
        num_worker_threads: usize,
        num_peer_connection_factories: usize,
        options: ConferenceOptions,
    ) -> Self {
        let device_id = format!("ltb_{}", rand::rng().random::<u32>());
        info!(device_id = %device_id, "conference swarm ready");

        let executors = Executor::pool(num_worker_threads);
        let factories = (0..num_peer_connection_factories.max(1))
            .map(|_| Arc::new(SyntheticFactory::new(options.engine.clone())))
            .collect();

        let inner = Arc::new(ManagerInner {
            device_id,
            http: http::new_client(),
            executors,
            factories,
            sessions: Mutex::new(Vec::new()),
            config: Mutex::new((0, 0)),
            next_user_id: AtomicU32::new(1),
            options,
        });

        // The tick holds only a weak handle so a dropped manager dies clean.
        let tick_interval = inner.options.tick_interval;
        let weak = Arc::downgrade(&inner);
        let tick_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.tick_producer();
            }
        })
        .abort_handle();

        Self { inner, tick_task }
    }

    /// Resize the swarm to `room_count × user_per_room` sessions and
    /// (re)join every session. A no-op when the config is unchanged.
    pub async fn apply_config(
        &self,
        room_count: usize,
        user_per_room: usize,
        base_room_id: usize,
    ) {
        {
            let mut config = self.inner.config.lock().unwrap_or_else(|e| e.into_inner());
            if *config == (room_count, user_per_room) {
                return;
            }
            *config = (room_count, user_per_room);
        }

        info!(room_count, user_per_room, base_room_id, "applying swarm config");
        let required = room_count * user_per_room;

        let removed: Vec<ConferencePeer> = {
            let mut sessions = self
                .inner
                .sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for session in sessions.iter() {
                session.leave();
            }
            if sessions.len() > required {
                sessions.drain(required..).collect()
            } else {
                Vec::new()
            }
        };

        // Shrinking is deliberately synchronous: each dropped session's
        // executor drains its teardown before the handles are released.
        for session in removed {
            session.leave_and_wait().await;
        }

        let sessions_to_join = {
            let mut sessions = self
                .inner
                .sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            while sessions.len() < required {
                let shard = sessions.len();
                let concrete_factory =
                    Arc::clone(&self.inner.factories[shard % self.inner.factories.len()]);
                let factory: Arc<dyn PeerConnectionFactory> = concrete_factory;
                sessions.push(ConferencePeer::new(
                    Arc::clone(&self.inner.executors[shard % self.inner.executors.len()]),
                    self.inner.http.clone(),
                    factory,
                    self.inner.options.endpoints.clone(),
                    self.inner.options.request_timeout,
                ));
            }
            sessions.len()
        };

        let sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        debug_assert_eq!(sessions_to_join, required);
        for room in 0..room_count {
            for seat in 0..user_per_room {
                let session = &sessions[room * user_per_room + seat];
                let user_seq = self.inner.next_user_id.fetch_add(1, Ordering::SeqCst);
                session.validate_data_channel(self.inner.options.validate_data_channel);
                session.join_room(
                    format!("{}_u{}", self.inner.device_id, 10_000 + user_seq),
                    format!("{}_r{}", self.inner.device_id, base_room_id + room),
                );
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// The peer-connection factories, exposed for their aggregate counters.
    pub fn factories(&self) -> &[Arc<SyntheticFactory>] {
        &self.inner.factories
    }

    pub fn stats(&self) -> ConferenceStats {
        let (_, user_per_room) = *self.inner.config.lock().unwrap_or_else(|e| e.into_inner());
        let mut stats = ConferenceStats::default();
        for bucket in 0..user_per_room as u32 {
            stats.consume_peer.insert(bucket, 0);
        }

        let sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for session in sessions.iter() {
            let state = session.state();
            stats.avg_frame_rate += session.avg_frame_rate();
            stats.avg_peer_count += state.peer_count as f32;
            stats.productive_peer += usize::from(state.produce_success);
            *stats.status.entry(state.status).or_insert(0) += 1;
            *stats.consume_peer.entry(state.peer_count).or_insert(0) += 1;
        }

        if !sessions.is_empty() {
            stats.avg_frame_rate /= sessions.len() as f32;
            stats.avg_peer_count /= sessions.len() as f32;
        }
        stats
    }
}

impl Drop for ConferenceManager {
    fn drop(&mut self) {
        self.tick_task.abort();
    }
}

impl ManagerInner {
    /// Timer callback: only enqueues per-session work, never blocks.
    fn tick_producer(&self) {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        for session in sessions.iter() {
            session.tick_producer();
        }
    }
}
