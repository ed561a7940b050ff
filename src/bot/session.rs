use async_trait::async_trait;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    /// Credentials rejected by the platform.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network failure: {0}")]
    Network(String),

    /// The session was terminated; no further logins happen.
    #[error("session terminated")]
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Ready = 2,
    Terminated = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Ready,
            3 => Self::Terminated,
            _ => Self::Disconnected,
        }
    }
}

/// Why the platform link went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client library is already reconnecting on its own
    Reconnecting,
    /// The client stopped
    Closed,
    LinkLost(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "connection closed"),
            Self::LinkLost(cause) => write!(f, "link lost: {cause}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Ready,
    Disconnected(DisconnectReason),
}

/// Handed to the connector so the platform can report link changes.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn ready(&self) {
        let _ = self.tx.send(SessionEvent::Ready);
    }

    pub fn disconnected(&self, reason: DisconnectReason) {
        let _ = self.tx.send(SessionEvent::Disconnected(reason));
    }
}

/// Opens and closes the platform connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GatewayConnector: Send + Sync + 'static {
    /// Logs in and starts the link. Returns once the link is live; later
    /// changes are reported through `events`.
    async fn connect(&self, events: SessionEvents) -> Result<(), SessionError>;

    /// Best-effort logout.
    async fn disconnect(&self) -> Result<(), SessionError>;
}

/// Owns the platform connection: login, reconnect after link loss and
/// graceful shutdown.
///
/// Reconnects wait a fixed cooldown between attempts and retry until
/// [`SessionManager::terminate`] is called. Only one retry loop runs at a
/// time.
pub struct SessionManager<C: GatewayConnector> {
    me: Weak<Self>,
    connector: C,
    cooldown: Duration,
    state: AtomicU8,
    shutdown: AtomicBool,
    reconnect_pending: AtomicBool,
    attempts: AtomicU32,
    login_lock: Mutex<()>,
    events: SessionEvents,
    events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    exit: CancellationToken,
}

impl<C: GatewayConnector> SessionManager<C> {
    pub fn new(connector: C, cooldown: Duration) -> Arc<Self> {
        let (events, rx) = SessionEvents::channel();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            connector,
            cooldown,
            state: AtomicU8::new(SessionState::Disconnected as u8),
            shutdown: AtomicBool::new(false),
            reconnect_pending: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            login_lock: Mutex::new(()),
            events,
            events_rx: parking_lot::Mutex::new(Some(rx)),
            exit: CancellationToken::new(),
        })
    }

    /// Starts the event pump and performs the first login.
    ///
    /// Rejected credentials are returned to the caller. A network failure
    /// only schedules a reconnect.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.spawn_event_pump();

        match self.login().await {
            Ok(()) => Ok(()),
            Err(SessionError::Network(cause)) => {
                warn!("⚠️ Initial login failed: {}", cause);
                self.schedule_reconnect(DisconnectReason::LinkLost(cause));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Connects unless a live link already exists.
    pub async fn login(&self) -> Result<(), SessionError> {
        if self.is_shutdown() {
            return Err(SessionError::Terminated);
        }

        let _guard = self.login_lock.lock().await;

        match self.state() {
            SessionState::Terminated => return Err(SessionError::Terminated),
            SessionState::Connecting | SessionState::Ready => {
                debug!("Login skipped, session already {:?}", self.state());
                return Ok(());
            }
            SessionState::Disconnected => {}
        }

        self.transition(SessionState::Connecting);
        info!("🔌 Connecting to gateway...");

        match self.connector.connect(self.events.clone()).await {
            Ok(()) => {
                if self.is_shutdown() {
                    if let Err(e) = self.connector.disconnect().await {
                        warn!("Logout after late login failed: {}", e);
                    }
                    return Err(SessionError::Terminated);
                }
                Ok(())
            }
            Err(e) => {
                self.transition(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Starts the retry loop for a disconnect. Returns `None` when nothing
    /// was scheduled: the client is already reconnecting, the session is
    /// terminated, or a loop is already pending.
    pub fn schedule_reconnect(&self, reason: DisconnectReason) -> Option<JoinHandle<()>> {
        if reason == DisconnectReason::Reconnecting {
            debug!("Client is reconnecting on its own, no retry scheduled");
            return None;
        }

        if self.is_shutdown() {
            debug!("Session terminated, ignoring disconnect: {}", reason);
            return None;
        }

        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            debug!("Reconnect already pending, ignoring disconnect: {}", reason);
            return None;
        }

        let Some(manager) = self.me.upgrade() else {
            self.reconnect_pending.store(false, Ordering::SeqCst);
            return None;
        };

        Some(tokio::spawn(async move {
            manager.reconnect_loop(reason.to_string()).await;
        }))
    }

    /// Stops reconnecting for good, logs out and releases the exit signal.
    pub async fn terminate(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        self.state
            .store(SessionState::Terminated as u8, Ordering::SeqCst);
        info!("🛑 Terminating session");

        if let Err(e) = self.connector.disconnect().await {
            warn!("Logout failed: {}", e);
        }

        self.exit.cancel();
    }

    /// Cancelled once the session is terminated.
    pub fn exit_signal(&self) -> CancellationToken {
        self.exit.clone()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Reconnect attempts since the last ready event.
    #[cfg(test)]
    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Moves to `next` unless terminated; `Terminated` is final.
    fn transition(&self, next: SessionState) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != SessionState::Terminated as u8).then_some(next as u8)
            });
    }

    fn spawn_event_pump(&self) {
        let Some(mut rx) = self.events_rx.lock().take() else {
            return;
        };
        let Some(manager) = self.me.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            let exit = manager.exit_signal();
            loop {
                let event = tokio::select! {
                    _ = exit.cancelled() => break,
                    event = rx.recv() => event,
                };
                let Some(event) = event else {
                    break;
                };
                manager.handle_event(event);
            }
            debug!("Session event pump stopped");
        });
    }

    fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Ready => {
                self.transition(SessionState::Ready);
                self.attempts.store(0, Ordering::SeqCst);
                info!("🔗 Session ready");
            }
            SessionEvent::Disconnected(DisconnectReason::Reconnecting) => {
                debug!("Gateway link is reconnecting");
            }
            SessionEvent::Disconnected(reason) => {
                if self.is_shutdown() {
                    return;
                }
                warn!("⚠️ Disconnected: {}", reason);
                self.transition(SessionState::Disconnected);
                self.schedule_reconnect(reason);
            }
        }
    }

    async fn reconnect_loop(&self, mut cause: String) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.cooldown) => {}
                _ = self.exit.cancelled() => break,
            }

            if self.is_shutdown() {
                break;
            }

            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            warn!("🔄 Reconnect attempt {} ({})", attempt, cause);

            match self.login().await {
                Ok(()) => {
                    self.reconnect_pending.store(false, Ordering::SeqCst);
                    // a disconnect that raced in while this loop was still pending
                    if self.state() == SessionState::Disconnected
                        && !self.is_shutdown()
                        && !self.reconnect_pending.swap(true, Ordering::SeqCst)
                    {
                        cause = "link lost during reconnect".to_string();
                        continue;
                    }
                    return;
                }
                Err(SessionError::Terminated) => break,
                Err(e) => {
                    if matches!(e, SessionError::Auth(_)) {
                        error!("❌ Credentials rejected during reconnect: {}", e);
                    }
                    cause = e.to_string();
                }
            }
        }

        self.reconnect_pending.store(false, Ordering::SeqCst);
        debug!("Reconnect loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const COOLDOWN: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn retries_with_fixed_cooldown_until_login_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let mut connector = MockGatewayConnector::new();
        connector.expect_connect().times(3).returning(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SessionError::Network("connection refused".into()))
            } else {
                Ok(())
            }
        });

        let manager = SessionManager::new(connector, COOLDOWN);
        let started = tokio::time::Instant::now();
        let handle = manager
            .schedule_reconnect(DisconnectReason::LinkLost("reset".into()))
            .unwrap();
        handle.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), COOLDOWN * 3);
        assert_eq!(manager.attempts(), 3);
        assert_eq!(manager.state(), SessionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnecting_reason_schedules_nothing() {
        let mut connector = MockGatewayConnector::new();
        connector.expect_connect().times(0);

        let manager = SessionManager::new(connector, COOLDOWN);
        assert!(manager
            .schedule_reconnect(DisconnectReason::Reconnecting)
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn no_reconnect_after_terminate() {
        let mut connector = MockGatewayConnector::new();
        connector.expect_connect().times(0);
        connector.expect_disconnect().times(1).returning(|| Ok(()));

        let manager = SessionManager::new(connector, COOLDOWN);
        manager.terminate().await;

        assert!(manager.exit_signal().is_cancelled());
        assert_eq!(manager.state(), SessionState::Terminated);
        assert!(manager
            .schedule_reconnect(DisconnectReason::Closed)
            .is_none());
        assert_eq!(manager.login().await, Err(SessionError::Terminated));
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_stops_pending_retry() {
        let mut connector = MockGatewayConnector::new();
        connector.expect_connect().times(0);
        connector
            .expect_disconnect()
            .returning(|| Err(SessionError::Network("already gone".into())));

        let manager = SessionManager::new(connector, COOLDOWN);
        let handle = manager
            .schedule_reconnect(DisconnectReason::Closed)
            .unwrap();

        // logout failure is logged, not fatal
        manager.terminate().await;
        handle.await.unwrap();
        assert_eq!(manager.state(), SessionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_disconnects_share_one_loop() {
        let mut connector = MockGatewayConnector::new();
        connector.expect_connect().times(1).returning(|_| Ok(()));

        let manager = SessionManager::new(connector, COOLDOWN);
        let handle = manager
            .schedule_reconnect(DisconnectReason::Closed)
            .unwrap();
        assert!(manager
            .schedule_reconnect(DisconnectReason::LinkLost("again".into()))
            .is_none());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn login_is_idempotent_while_linked() {
        let mut connector = MockGatewayConnector::new();
        connector.expect_connect().times(1).returning(|_| Ok(()));

        let manager = SessionManager::new(connector, COOLDOWN);
        manager.login().await.unwrap();
        manager.login().await.unwrap();
        assert_eq!(manager.state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn rejected_credentials_fail_start() {
        let mut connector = MockGatewayConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|_| Err(SessionError::Auth("401 Unauthorized".into())));

        let manager = SessionManager::new(connector, COOLDOWN);
        assert_eq!(
            manager.start().await,
            Err(SessionError::Auth("401 Unauthorized".into()))
        );
        assert_eq!(manager.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_and_disconnect_events_drive_state() {
        let mut connector = MockGatewayConnector::new();
        connector.expect_connect().times(2).returning(|events| {
            events.ready();
            Ok(())
        });

        let manager = SessionManager::new(connector, COOLDOWN);
        manager.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.state(), SessionState::Ready);

        manager
            .events
            .disconnected(DisconnectReason::LinkLost("reset".into()));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.state(), SessionState::Disconnected);

        tokio::time::sleep(COOLDOWN * 2).await;
        assert_eq!(manager.state(), SessionState::Ready);
        assert_eq!(manager.attempts(), 0);
    }
}
