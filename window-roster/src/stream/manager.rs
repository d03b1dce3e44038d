//! Bounded pool of live capture sessions.
//!
//! Sessions are kept in least-recently-used order. Admission never blocks:
//! when the pool is full the least recently used session is evicted and
//! stopped in the background.

use crate::config::StreamingConfig;
use crate::sources::StreamProvider;
use crate::stream::epoch::Epoch;
use crate::stream::session::StreamSession;
use crate::types::{Frame, KeepAlive, StreamQuality, WindowId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

#[derive(Default)]
struct SessionPool {
    sessions: HashMap<WindowId, Arc<StreamSession>>,
    /// Front is least recently used
    order: VecDeque<WindowId>,
}

impl SessionPool {
    fn touch(&mut self, window_id: WindowId) {
        if let Some(pos) = self.order.iter().position(|id| *id == window_id) {
            self.order.remove(pos);
        }
        self.order.push_back(window_id);
    }

    fn remove(&mut self, window_id: WindowId) -> Option<Arc<StreamSession>> {
        self.order.retain(|id| *id != window_id);
        self.sessions.remove(&window_id)
    }

    /// Forget sessions that already stopped on their own (keep-alive expiry)
    fn prune_stopped(&mut self) {
        let stopped: Vec<WindowId> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.state().is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in stopped {
            self.remove(id);
        }
    }

    fn drain(&mut self) -> Vec<Arc<StreamSession>> {
        self.order.clear();
        self.sessions.drain().map(|(_, session)| session).collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LiveCaptureResourceManager {
    provider: Arc<dyn StreamProvider>,
    config: StreamingConfig,
    pool: Mutex<SessionPool>,
    /// Panel visibility generation. Lock order: `epoch` before `pool`.
    epoch: Mutex<Epoch>,
}

impl LiveCaptureResourceManager {
    pub fn new(provider: Arc<dyn StreamProvider>, config: StreamingConfig) -> Self {
        Self {
            provider,
            config,
            pool: Mutex::new(SessionPool::default()),
            epoch: Mutex::new(Epoch::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.max_sessions.max(1)
    }

    /// Session for a window, created on demand. A request for a window that
    /// already has a session reuses it as is, whatever quality it runs at.
    pub fn get_or_create(
        &self,
        window_id: WindowId,
        quality: StreamQuality,
        frame_rate: u32,
    ) -> Arc<StreamSession> {
        let (session, evicted) = {
            let mut pool = lock(&self.pool);
            pool.prune_stopped();

            if let Some(session) = pool.sessions.get(&window_id).cloned() {
                pool.touch(window_id);
                (session, Vec::new())
            } else {
                let session = Arc::new(StreamSession::new(
                    window_id,
                    quality,
                    frame_rate,
                    self.provider.clone(),
                ));
                pool.sessions.insert(window_id, session.clone());
                pool.touch(window_id);

                let mut evicted = Vec::new();
                while pool.sessions.len() > self.capacity() {
                    let Some(victim) = pool.order.pop_front() else {
                        break;
                    };
                    if let Some(victim) = pool.sessions.remove(&victim) {
                        evicted.push(victim);
                    }
                }
                (session, evicted)
            }
        };

        for victim in evicted {
            debug!("Evicting live capture of window {}", victim.window_id());
            victim.stop_detached();
        }
        session
    }

    /// Get or create a session, start it and subscribe to its frames.
    /// Start failures are logged; the receiver then simply never updates.
    pub async fn request_live_preview(
        &self,
        window_id: WindowId,
        quality: Option<StreamQuality>,
        frame_rate: Option<u32>,
    ) -> watch::Receiver<Option<Frame>> {
        let session = self.get_or_create(
            window_id,
            quality.unwrap_or(self.config.default_quality),
            frame_rate.unwrap_or(self.config.default_frame_rate),
        );
        let frames = session.subscribe();
        if let Err(e) = session.start().await {
            warn!("Failed to start live capture of window {}: {}", window_id, e);
        }
        frames
    }

    /// Stop one window's session after the keep-alive period
    pub fn release(&self, window_id: WindowId, keep_alive: KeepAlive) {
        let session = lock(&self.pool).sessions.get(&window_id).cloned();
        if let Some(session) = session {
            session.request_stop(keep_alive);
        }
    }

    /// The preview panel became visible: any pending panel-close stop is void
    pub fn panel_opened(&self) {
        let token = lock(&self.epoch).advance();
        trace!("Panel opened, generation {}", token.generation());
    }

    /// The preview panel went away: stop every session, now or after the
    /// keep-alive period unless the panel reopens first
    pub async fn panel_closed(self: &Arc<Self>, keep_alive: KeepAlive) {
        match keep_alive {
            KeepAlive::Never => {}
            KeepAlive::Immediate => {
                let drained = {
                    let mut epoch = lock(&self.epoch);
                    epoch.advance();
                    lock(&self.pool).drain()
                };
                stop_all(drained).await;
            }
            KeepAlive::After(delay) => {
                let token = lock(&self.epoch).advance();
                let manager = self.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {
                            trace!("Panel reopened within keep-alive, sessions kept");
                        }
                        _ = tokio::time::sleep(delay) => {
                            let drained = {
                                let epoch = lock(&manager.epoch);
                                if !epoch.is_current(&token) {
                                    return;
                                }
                                lock(&manager.pool).drain()
                            };
                            debug!("Keep-alive expired, stopping {} live sessions", drained.len());
                            stop_all(drained).await;
                        }
                    }
                });
            }
        }
    }

    /// Stop every session and wait for all of them
    pub async fn shutdown(&self) {
        let drained = {
            let mut epoch = lock(&self.epoch);
            epoch.advance();
            lock(&self.pool).drain()
        };
        info!("Stopping {} live sessions", drained.len());
        stop_all(drained).await;
    }

    pub fn len(&self) -> usize {
        lock(&self.pool).sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, window_id: WindowId) -> bool {
        lock(&self.pool).sessions.contains_key(&window_id)
    }

    /// Window ids from least to most recently used
    pub fn window_ids(&self) -> Vec<WindowId> {
        lock(&self.pool).order.iter().copied().collect()
    }
}

async fn stop_all(sessions: Vec<Arc<StreamSession>>) {
    let mut stops = JoinSet::new();
    for session in sessions {
        stops.spawn(async move { session.force_stop().await });
    }
    while let Some(result) = stops.join_next().await {
        if let Err(e) = result {
            warn!("Session stop task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::SessionState;
    use crate::testing::FakeStreams;
    use std::time::Duration;

    fn manager(streams: &Arc<FakeStreams>) -> Arc<LiveCaptureResourceManager> {
        Arc::new(LiveCaptureResourceManager::new(
            streams.clone(),
            StreamingConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_lru_evicts_first_session() {
        let streams = FakeStreams::new();
        let manager = manager(&streams);

        let first = manager.get_or_create(1, StreamQuality::Medium, 30);
        first.start().await.unwrap();
        for id in 2..=25 {
            manager.get_or_create(id, StreamQuality::Medium, 30);
        }

        assert_eq!(manager.len(), 24);
        assert!(!manager.contains(1));
        assert!(manager.contains(25));
        assert!(first.state().is_terminal());
    }

    #[tokio::test]
    async fn test_reuse_refreshes_lru_position() {
        let streams = FakeStreams::new();
        let manager = manager(&streams);

        for id in 1..=24 {
            manager.get_or_create(id, StreamQuality::Low, 30);
        }
        let reused = manager.get_or_create(1, StreamQuality::High, 60);
        assert_eq!(reused.quality(), StreamQuality::Low);

        manager.get_or_create(25, StreamQuality::Low, 30);
        assert!(manager.contains(1));
        assert!(!manager.contains(2));
        assert_eq!(manager.window_ids().last(), Some(&25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panel_reopen_within_keep_alive_keeps_sessions() {
        let streams = FakeStreams::new();
        let manager = manager(&streams);
        let mut sessions = Vec::new();
        for id in 1..=3 {
            manager.request_live_preview(id, None, None).await;
            sessions.push(manager.get_or_create(id, StreamQuality::Medium, 30));
        }

        manager.panel_closed(KeepAlive::After(Duration::from_secs(2))).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        manager.panel_opened();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(manager.len(), 3);
        assert!(sessions.iter().all(|s| s.state() == SessionState::Streaming));
        assert_eq!(streams.closed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panel_closed_stops_after_keep_alive() {
        let streams = FakeStreams::new();
        let manager = manager(&streams);
        manager.request_live_preview(1, None, None).await;
        let session = manager.get_or_create(1, StreamQuality::Medium, 30);

        manager.panel_closed(KeepAlive::After(Duration::from_secs(2))).await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(manager.is_empty());
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(streams.closed(), 1);
    }

    #[tokio::test]
    async fn test_panel_closed_immediately_drains_pool() {
        let streams = FakeStreams::new();
        let manager = manager(&streams);
        manager.request_live_preview(1, None, None).await;
        manager.request_live_preview(2, None, None).await;

        manager.panel_closed(KeepAlive::Immediate).await;

        assert!(manager.is_empty());
        assert_eq!(streams.closed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_with_keep_alive() {
        let streams = FakeStreams::new();
        let manager = manager(&streams);
        manager.request_live_preview(1, None, None).await;

        manager.release(1, KeepAlive::After(Duration::from_secs(1)));
        tokio::time::sleep(Duration::from_secs(2)).await;

        // stopped sessions are pruned on the next admission
        manager.get_or_create(2, StreamQuality::Medium, 30);
        assert!(!manager.contains(1));
        assert_eq!(streams.closed(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let streams = FakeStreams::new();
        let manager = manager(&streams);
        for id in 1..=4 {
            manager.request_live_preview(id, Some(StreamQuality::Native), Some(60)).await;
        }

        manager.shutdown().await;

        assert!(manager.is_empty());
        assert_eq!(streams.opened(), 4);
        assert_eq!(streams.closed(), 4);
    }
}
