//! Session store: owns every live session and its per-session resources

use super::Session;
use crate::events::EventEnvelope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session {0} not found")]
    NotFound(String),
    #[error("Session {0} belongs to another user")]
    Forbidden(String),
}

/// A live session plus the machinery that serializes its turns
pub struct SessionHandle {
    id: String,
    owner: String,
    /// Held for the whole of a turn; waiting on it is the turn queue
    state: tokio::sync::Mutex<Session>,
    running: Mutex<Option<CancellationToken>>,
    /// Number of messages announced so far; a queued turn whose
    /// generation is behind this has been superseded
    generation: AtomicU64,
    closed: CancellationToken,
    events: broadcast::Sender<EventEnvelope>,
    last_active: Mutex<Instant>,
}

/// Marks a turn as running until dropped
pub struct TurnGuard<'a> {
    handle: &'a SessionHandle,
    token: CancellationToken,
}

impl TurnGuard<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        *self
            .handle
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.handle.touch();
    }
}

impl SessionHandle {
    fn new(session: Session) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id: session.id.clone(),
            owner: session.owner.clone(),
            state: tokio::sync::Mutex::new(session),
            running: Mutex::new(None),
            generation: AtomicU64::new(0),
            closed: CancellationToken::new(),
            events,
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<EventEnvelope> {
        self.events.clone()
    }

    /// Wait for exclusive access to the session. Turns queue here in
    /// arrival order.
    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        let guard = self.state.lock().await;
        self.touch();
        guard
    }

    /// Record a new inbound message and cancel the turn currently
    /// running, if any. Returns the message's generation, which
    /// [`SessionHandle::begin_turn`] takes once the message reaches the
    /// front of the queue.
    pub fn announce_message(&self) -> u64 {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(token) = running.as_ref() {
            token.cancel();
            tracing::info!(session_id = %self.id, generation, "Interrupting running turn for newer message");
        }
        generation
    }

    /// Register the turn about to run. Call with the session lock held.
    ///
    /// The turn starts cancelled when a newer message was announced while
    /// it waited in the queue.
    pub fn begin_turn(&self, generation: u64) -> TurnGuard<'_> {
        let token = self.closed.child_token();
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::SeqCst) > generation {
            tracing::info!(session_id = %self.id, generation, "Queued turn superseded by a newer message");
            token.cancel();
        }
        *running = Some(token.clone());
        TurnGuard {
            handle: self,
            token,
        }
    }

    pub fn is_turn_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Tear the session down, cancelling any in-flight turn
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    agent_max_steps: u32,
    idle_timeout: Duration,
}

impl SessionStore {
    pub fn new(agent_max_steps: u32, idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            agent_max_steps,
            idle_timeout,
        }
    }

    pub async fn create(&self, owner: &str) -> Arc<SessionHandle> {
        let id = Uuid::new_v4().to_string();
        let handle = Arc::new(SessionHandle::new(Session::new(
            id.clone(),
            owner.to_string(),
            self.agent_max_steps,
        )));
        self.sessions.write().await.insert(id.clone(), handle.clone());
        tracing::info!(session_id = %id, user_id = %owner, "Session created");
        handle
    }

    /// Look up a session on behalf of `user`
    pub async fn get(&self, id: &str, user: &str) -> Result<Arc<SessionHandle>, SessionError> {
        let handle = self
            .sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if handle.owner() != user {
            return Err(SessionError::Forbidden(id.to_string()));
        }
        Ok(handle)
    }

    /// Disconnect a session. Its in-flight turn is cancelled and its
    /// state is released once that turn unwinds.
    pub async fn remove(&self, id: &str, user: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get(id) {
            None => return Err(SessionError::NotFound(id.to_string())),
            Some(handle) if handle.owner() != user => {
                return Err(SessionError::Forbidden(id.to_string()))
            }
            Some(_) => {}
        }
        if let Some(handle) = sessions.remove(id) {
            handle.close();
            tracing::info!(session_id = %id, "Session disconnected");
        }
        Ok(())
    }

    /// Drop sessions idle longer than the configured timeout. Sessions
    /// with a running turn are never expired.
    pub async fn expire_idle(&self) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .values()
            .filter(|h| !h.is_turn_running() && h.idle_for() >= self.idle_timeout)
            .map(|h| h.id().to_string())
            .collect();
        for id in &expired {
            if let Some(handle) = sessions.remove(id) {
                handle.close();
            }
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired idle sessions");
        }
        expired
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Run [`SessionStore::expire_idle`] every `interval` until `shutdown`
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        store.expire_idle().await;
                    }
                }
            }
        })
    }
}
