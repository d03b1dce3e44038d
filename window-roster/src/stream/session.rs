//! A single live capture session.
//!
//! State machine: `Idle -> Starting -> Streaming -> Stopping -> Stopped`.
//! Transitions happen under the session lock; the slow parts (opening and
//! closing the feed) run outside it and re-check their token before
//! committing anything.
//!
//! Two epochs are kept. `starts` is advanced by a teardown and voids an open
//! that is still in flight. `stops` is advanced by every start and every
//! delayed stop request, so a keep-alive stop only fires if nothing asked for
//! the session in the meantime, and never cancels an open.

use crate::sources::{FeedHandle, LiveFeed, StreamProvider};
use crate::stream::epoch::Epoch;
use crate::types::{Frame, KeepAlive, StreamError, StreamQuality, WindowId};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Streaming,
    Stopping,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Streaming => "streaming",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
        }
    }

    /// Stopping or stopped; such a session never streams again
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopping | SessionState::Stopped)
    }
}

struct SessionInner {
    state: SessionState,
    starts: Epoch,
    stops: Epoch,
    feed: Option<Box<dyn FeedHandle>>,
    pump: Option<JoinHandle<()>>,
}

/// Resources detached from a session that still have to be released
struct Teardown {
    feed: Option<Box<dyn FeedHandle>>,
    pump: Option<JoinHandle<()>>,
}

pub struct StreamSession {
    window_id: WindowId,
    quality: StreamQuality,
    frame_rate: u32,
    provider: Arc<dyn StreamProvider>,
    inner: Mutex<SessionInner>,
    frames: watch::Sender<Option<Frame>>,
    state_tx: watch::Sender<SessionState>,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("window_id", &self.window_id)
            .field("quality", &self.quality)
            .field("frame_rate", &self.frame_rate)
            .field("state", &self.state())
            .finish()
    }
}

impl StreamSession {
    pub fn new(
        window_id: WindowId,
        quality: StreamQuality,
        frame_rate: u32,
        provider: Arc<dyn StreamProvider>,
    ) -> Self {
        let (frames, _) = watch::channel(None);
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            window_id,
            quality,
            frame_rate,
            provider,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                starts: Epoch::new(),
                stops: Epoch::new(),
                feed: None,
                pump: None,
            }),
            frames,
            state_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        trace!(
            "Session {} {} -> {}",
            self.window_id,
            inner.state.as_str(),
            state.as_str()
        );
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    pub fn window_id(&self) -> WindowId {
        self.window_id
    }

    pub fn quality(&self) -> StreamQuality {
        self.quality
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Generation of pending-stop requests
    pub fn generation(&self) -> u64 {
        self.lock().stops.generation()
    }

    /// Receiver of the latest frame; starts out with the last frame seen
    pub fn subscribe(&self) -> watch::Receiver<Option<Frame>> {
        self.frames.subscribe()
    }

    /// Most recent frame, kept after the session stops
    pub fn last_frame(&self) -> Option<Frame> {
        self.frames.borrow().clone()
    }

    /// Open the live feed, or keep an open one alive
    pub async fn start(self: &Arc<Self>) -> Result<(), StreamError> {
        let token = {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Stopping | SessionState::Stopped => {
                    return Err(StreamError::InvalidState {
                        window_id: self.window_id,
                        action: "start",
                        state: inner.state.as_str(),
                    });
                }
                SessionState::Streaming => {
                    // reopen: a pending delayed stop is void
                    inner.stops.advance();
                    trace!("Session {} reopened", self.window_id);
                    return Ok(());
                }
                SessionState::Starting => return Ok(()),
                SessionState::Idle => {
                    debug!(
                        "Opening live capture of window {} at {}x scale, {} fps",
                        self.window_id,
                        self.quality.scale(),
                        self.frame_rate
                    );
                    inner.stops.advance();
                    self.set_state(&mut inner, SessionState::Starting);
                    inner.starts.current()
                }
            }
        };

        let opened = self
            .provider
            .open(self.window_id, self.quality, self.frame_rate)
            .await;

        let mut stale_feed = {
            let mut inner = self.lock();
            match opened {
                // A delayed stop requested meanwhile stays pending
                Ok(feed) if token.is_current() && inner.state == SessionState::Starting => {
                    let LiveFeed { frames, handle } = feed;
                    inner.feed = Some(handle);
                    inner.pump = Some(self.spawn_pump(frames));
                    self.set_state(&mut inner, SessionState::Streaming);
                    debug!("Live capture of window {} streaming", self.window_id);
                    return Ok(());
                }
                Ok(feed) => feed.handle,
                Err(e) => {
                    if inner.state == SessionState::Starting {
                        self.set_state(&mut inner, SessionState::Idle);
                    }
                    return Err(e.into());
                }
            }
        };

        trace!(
            "Discarding feed of window {} opened for stale generation {}",
            self.window_id,
            token.generation()
        );
        stale_feed.close().await;
        Ok(())
    }

    fn spawn_pump(self: &Arc<Self>, mut frames: mpsc::Receiver<Frame>) -> JoinHandle<()> {
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.frames.send_replace(Some(frame));
            }
        })
    }

    /// Stop once the session is no longer needed
    pub fn request_stop(self: &Arc<Self>, keep_alive: KeepAlive) {
        match keep_alive {
            KeepAlive::Never => {}
            KeepAlive::Immediate => self.stop_detached(),
            KeepAlive::After(delay) => {
                let token = {
                    let mut inner = self.lock();
                    if inner.state.is_terminal() {
                        return;
                    }
                    inner.stops.advance()
                };

                let session = self.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {
                            trace!("Pending stop of window {} cancelled", session.window_id);
                        }
                        _ = tokio::time::sleep(delay) => {
                            let teardown = {
                                let mut inner = session.lock();
                                if inner.stops.is_current(&token) {
                                    session.begin_teardown(&mut inner)
                                } else {
                                    None
                                }
                            };
                            if let Some(teardown) = teardown {
                                session.finish_teardown(teardown).await;
                            }
                        }
                    }
                });
            }
        }
    }

    /// Stop unconditionally and wait until the feed is closed
    pub async fn force_stop(self: &Arc<Self>) {
        let teardown = {
            let mut inner = self.lock();
            self.begin_teardown(&mut inner)
        };
        match teardown {
            Some(teardown) => self.finish_teardown(teardown).await,
            None => self.wait_stopped().await,
        }
    }

    /// Stop unconditionally without waiting. The session is `Stopping` by the
    /// time this returns.
    pub fn stop_detached(self: &Arc<Self>) {
        let teardown = {
            let mut inner = self.lock();
            self.begin_teardown(&mut inner)
        };
        if let Some(teardown) = teardown {
            let session = self.clone();
            tokio::spawn(async move { session.finish_teardown(teardown).await });
        }
    }

    fn begin_teardown(&self, inner: &mut SessionInner) -> Option<Teardown> {
        if inner.state.is_terminal() {
            return None;
        }
        inner.starts.advance();
        inner.stops.advance();
        self.set_state(inner, SessionState::Stopping);
        Some(Teardown {
            feed: inner.feed.take(),
            pump: inner.pump.take(),
        })
    }

    async fn finish_teardown(&self, teardown: Teardown) {
        if let Some(pump) = teardown.pump {
            pump.abort();
        }
        if let Some(mut feed) = teardown.feed {
            feed.close().await;
        }
        let mut inner = self.lock();
        self.set_state(&mut inner, SessionState::Stopped);
        debug!("Live capture of window {} stopped", self.window_id);
    }

    async fn wait_stopped(&self) {
        let mut state = self.state_tx.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Stopped).await;
    }
}
