//! Connection Resilience Manager
//!
//! One task owns the [`TunnelSession`] and serializes everything that touches
//! it: heartbeat, liveness check, reconnect and stop.
//!
//! ```text
//! start() ──► Connecting ──► Connected ◄────────────────┐
//!                               │ liveness down         │ reconnect ok
//!                               ▼                       │
//!                             Lost ──► Retrying ────────┘
//!                                         │ budget spent / auth rejected
//!                                         ▼
//!                                      GaveUp ──► rebuild hook (once)
//! stop() from anywhere ──► Stopped
//! ```
//!
//! Reconnects use a fixed delay and one attempt per timer. The timer stays
//! armed while an attempt runs, so `attempts` only moves while retrying.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::error::TunnelError;
use super::session::{ForwardSpec, SecureConnector, TunnelSession};
use super::status::{RetryState, TunnelEvent, TunnelState, TunnelStatus};
use crate::config::AgentConfig;
use crate::relay::RelayGate;
use crate::ssh::PingResult;

/// Consecutive missed heartbeats before the liveness check calls the session down
pub const HEARTBEAT_FAIL_THRESHOLD: u32 = 2;

const EVENT_CAPACITY: usize = 64;

/// Floor for the heartbeat and liveness periods; tokio intervals reject zero
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// Called once when the manager gives up, to request a brand-new tunnel
pub type RebuildHook = Box<dyn FnOnce() + Send>;

/// Timing and forwards of one manager instance
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub heartbeat_interval: Duration,
    pub liveness_interval: Duration,
    pub retry_delay: Duration,
    pub max_attempts: u32,
    /// Installed on every connect, in order
    pub forwards: Vec<ForwardSpec>,
}

impl ManagerSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            liveness_interval: config.liveness_interval(),
            retry_delay: config.retry_delay(),
            max_attempts: config.max_retry_attempts,
            forwards: ForwardSpec::for_agent(config),
        }
    }

    fn clamped(mut self) -> Self {
        self.heartbeat_interval = self.heartbeat_interval.max(MIN_TIMER_PERIOD);
        self.liveness_interval = self.liveness_interval.max(MIN_TIMER_PERIOD);
        self
    }
}

enum ManagerCommand {
    Stop { reply: oneshot::Sender<()> },
}

/// State visible outside the manager task
struct Shared {
    gate: RelayGate,
    shutting_down: AtomicBool,
    authenticated: AtomicBool,
    status: watch::Sender<TunnelStatus>,
    state: watch::Sender<TunnelState>,
    retry: watch::Sender<RetryState>,
    events: broadcast::Sender<TunnelEvent>,
}

impl Shared {
    fn set_state(&self, state: TunnelState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            debug!("Tunnel state {:?} -> {:?}", prev, state);
        }
    }

    fn emit(&self, event: TunnelEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish_live(&self, session: &TunnelSession) {
        self.status.send_replace(TunnelStatus {
            live: true,
            session_id: Some(session.id.clone()),
            local_port: session.local_port(),
        });
    }

    fn publish_down(&self) {
        self.status.send_modify(|status| status.live = false);
    }
}

/// Keeps one tunnel alive: heartbeat, liveness check, bounded reconnect
pub struct TunnelManager {
    connector: Arc<dyn SecureConnector>,
    settings: ManagerSettings,
    shared: Arc<Shared>,
    cmd_tx: Mutex<Option<mpsc::Sender<ManagerCommand>>>,
    rebuild_hook: Mutex<Option<RebuildHook>>,
}

impl TunnelManager {
    pub fn new(
        connector: Arc<dyn SecureConnector>,
        settings: ManagerSettings,
        gate: RelayGate,
    ) -> Self {
        let settings = settings.clamped();
        let retry = RetryState::new(settings.retry_delay, settings.max_attempts);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connector,
            settings,
            shared: Arc::new(Shared {
                gate,
                shutting_down: AtomicBool::new(false),
                authenticated: AtomicBool::new(false),
                status: watch::channel(TunnelStatus::default()).0,
                state: watch::channel(TunnelState::Idle).0,
                retry: watch::channel(retry).0,
                events,
            }),
            cmd_tx: Mutex::new(None),
            rebuild_hook: Mutex::new(None),
        }
    }

    pub fn with_rebuild_hook(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.rebuild_hook.lock() = Some(Box::new(hook));
        self
    }

    /// Connect, authenticate, install the forwards and start monitoring
    ///
    /// A failure here is returned to the caller and never retried.
    pub async fn start(&self) -> Result<(), TunnelError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(TunnelError::Stopped);
        }
        if *self.shared.state.borrow() != TunnelState::Idle {
            return Err(TunnelError::Session("tunnel manager already started".into()));
        }
        self.shared.set_state(TunnelState::Connecting);

        let session = match establish(self.connector.as_ref(), &self.settings.forwards).await {
            Ok(session) => session,
            Err(e) => {
                error!("Tunnel connect failed: {}", e);
                if !self.shared.shutting_down.load(Ordering::SeqCst) {
                    self.shared.set_state(TunnelState::Idle);
                }
                return Err(e);
            }
        };

        // stop() sets the flag before taking the sender, so checking it under
        // the same lock that installs the sender leaves no gap
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let registered = {
            let mut slot = self.cmd_tx.lock();
            if self.shared.shutting_down.load(Ordering::SeqCst) {
                false
            } else {
                *slot = Some(cmd_tx);
                true
            }
        };
        if !registered {
            info!(session_id = %session.id, "Stopped while connecting, closing session");
            let mut session = session;
            session.disconnect().await;
            self.shared.set_state(TunnelState::Stopped);
            return Err(TunnelError::Stopped);
        }

        info!(session_id = %session.id, "Tunnel connected");
        self.shared.authenticated.store(true, Ordering::SeqCst);
        self.shared.publish_live(&session);
        self.shared.gate.resume();
        self.shared.emit(TunnelEvent::Connected {
            session_id: session.id.clone(),
        });
        self.shared.set_state(TunnelState::Connected);

        let task = ManagerTask {
            connector: self.connector.clone(),
            settings: self.settings.clone(),
            shared: self.shared.clone(),
            session: Some(session),
            retry: RetryState::new(self.settings.retry_delay, self.settings.max_attempts),
            missed_pings: 0,
            transport_error: false,
            rebuild_hook: self.rebuild_hook.lock().take(),
            cmd_rx,
        };
        tokio::spawn(task.run());
        Ok(())
    }

    /// Disconnect and stop monitoring; safe to call more than once
    pub async fn stop(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let cmd_tx = self.cmd_tx.lock().take();
        let Some(cmd_tx) = cmd_tx else {
            // Never started
            self.shared.set_state(TunnelState::Stopped);
            return;
        };
        let (reply, done) = oneshot::channel();
        if cmd_tx.send(ManagerCommand::Stop { reply }).await.is_ok() {
            let _ = done.await;
        } else {
            debug!("Tunnel manager task already exited");
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.shared.authenticated.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> watch::Receiver<TunnelStatus> {
        self.shared.status.subscribe()
    }

    pub fn state(&self) -> TunnelState {
        *self.shared.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<TunnelState> {
        self.shared.state.subscribe()
    }

    pub fn retry_state(&self) -> RetryState {
        self.shared.retry.borrow().clone()
    }

    pub fn retry_changes(&self) -> watch::Receiver<RetryState> {
        self.shared.retry.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.shared.events.subscribe()
    }

    pub fn gate(&self) -> &RelayGate {
        &self.shared.gate
    }
}

/// Open a session and install every forward; nothing is left half-open on error
async fn establish(
    connector: &dyn SecureConnector,
    forwards: &[ForwardSpec],
) -> Result<TunnelSession, TunnelError> {
    let mut session = TunnelSession::new(connector.connect().await?);
    if !session.authenticated {
        session.disconnect().await;
        return Err(TunnelError::Auth("session is not authenticated".into()));
    }
    if let Err(e) = session.install_forwards(forwards).await {
        session.disconnect().await;
        return Err(e);
    }
    Ok(session)
}

enum Flow {
    Continue,
    Exit,
}

struct ManagerTask {
    connector: Arc<dyn SecureConnector>,
    settings: ManagerSettings,
    shared: Arc<Shared>,
    session: Option<TunnelSession>,
    retry: RetryState,
    missed_pings: u32,
    /// Last heartbeat hit a transport error
    transport_error: bool,
    rebuild_hook: Option<RebuildHook>,
    cmd_rx: mpsc::Receiver<ManagerCommand>,
}

impl ManagerTask {
    async fn run(mut self) {
        let now = Instant::now();
        let mut heartbeat = interval_at(
            now + self.settings.heartbeat_interval,
            self.settings.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut liveness = interval_at(
            now + self.settings.liveness_interval,
            self.settings.liveness_interval,
        );
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.retry.deadline();
            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => {
                    self.shutdown().await;
                    if let Some(ManagerCommand::Stop { reply }) = cmd {
                        let _ = reply.send(());
                    }
                    break;
                }

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Flow::Exit = self.reconnect().await {
                        break;
                    }
                }

                _ = heartbeat.tick() => self.heartbeat().await,

                _ = liveness.tick() => self.check_liveness(),
            }
        }

        debug!("Tunnel manager task exited");
    }

    /// Advisory keepalive; results feed the liveness check
    async fn heartbeat(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        match session.ping().await {
            PingResult::Ok => {
                debug!(session_id = %session.id, "Heartbeat ok");
                self.missed_pings = 0;
            }
            PingResult::Timeout => {
                self.missed_pings += 1;
                warn!(
                    session_id = %session.id,
                    "Heartbeat timed out ({}/{})", self.missed_pings, HEARTBEAT_FAIL_THRESHOLD
                );
            }
            PingResult::IoError => {
                warn!(session_id = %session.id, "Heartbeat hit a transport error");
                self.transport_error = true;
            }
        }
    }

    fn check_liveness(&mut self) {
        if self.shared.shutting_down.load(Ordering::SeqCst) || self.retry.retrying() {
            return;
        }
        let down = match &self.session {
            None => true,
            Some(session) => {
                !session.is_connected()
                    || self.transport_error
                    || self.missed_pings >= HEARTBEAT_FAIL_THRESHOLD
            }
        };
        if down {
            self.on_lost();
        }
    }

    fn on_lost(&mut self) {
        let session_id = self
            .session
            .as_ref()
            .map(|s| s.id.clone())
            .unwrap_or_default();
        warn!(session_id = %session_id, "Tunnel lost, pausing relay front end");

        self.shared.gate.pause();
        self.shared.publish_down();
        self.shared.emit(TunnelEvent::Lost { session_id });
        self.shared.set_state(TunnelState::Lost);

        if !self.retry.retrying() {
            self.retry.schedule();
            self.publish_retry();
            info!("Reconnecting in {:?}", self.retry.delay);
            self.shared.set_state(TunnelState::Retrying);
        }
    }

    async fn reconnect(&mut self) -> Flow {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            self.retry.reset();
            self.publish_retry();
            return Flow::Continue;
        }

        if let Some(mut old) = self.session.take() {
            debug!(session_id = %old.id, "Closing lost session");
            old.disconnect().await;
        }

        info!(
            "Reconnect attempt {}/{}",
            self.retry.attempts + 1,
            self.retry.max_attempts
        );

        match establish(self.connector.as_ref(), &self.settings.forwards).await {
            Ok(mut session) if self.shared.shutting_down.load(Ordering::SeqCst) => {
                // A stop is queued: do not resume anything it is about to tear down
                debug!(session_id = %session.id, "Reconnected during shutdown, closing");
                session.disconnect().await;
                self.retry.reset();
                self.publish_retry();
                Flow::Continue
            }
            Ok(session) => {
                let attempts = self.retry.attempts + 1;
                self.retry.reset();
                self.publish_retry();
                self.missed_pings = 0;
                self.transport_error = false;

                info!(session_id = %session.id, "Tunnel recovered after {} attempt(s)", attempts);
                self.shared.publish_live(&session);
                self.shared.gate.resume();
                self.shared.emit(TunnelEvent::Recovered {
                    session_id: session.id.clone(),
                    attempts,
                });
                self.shared.set_state(TunnelState::Connected);
                self.session = Some(session);
                Flow::Continue
            }
            Err(e) if e.is_auth() => {
                error!("Reconnect rejected: {}", e);
                self.give_up(e.to_string());
                Flow::Exit
            }
            Err(e) => {
                let budget_left = self.retry.record_failure();
                warn!(
                    "Reconnect attempt {}/{} failed: {}",
                    self.retry.attempts, self.retry.max_attempts, e
                );
                if self.shared.shutting_down.load(Ordering::SeqCst) {
                    self.retry.reset();
                    self.publish_retry();
                    return Flow::Continue;
                }
                if budget_left {
                    self.retry.schedule();
                    self.publish_retry();
                    self.shared.emit(TunnelEvent::Retrying {
                        attempt: self.retry.attempts,
                        max_attempts: self.retry.max_attempts,
                    });
                    Flow::Continue
                } else {
                    self.give_up(format!(
                        "{} reconnect attempts failed, last error: {}",
                        self.retry.attempts, e
                    ));
                    Flow::Exit
                }
            }
        }
    }

    fn give_up(&mut self, reason: String) {
        error!("Giving up on tunnel: {}", reason);
        self.retry.reset();
        self.publish_retry();
        self.shared.authenticated.store(false, Ordering::SeqCst);
        self.shared.publish_down();
        self.shared.set_state(TunnelState::GaveUp);
        self.shared.emit(TunnelEvent::GaveUp { reason });
        if let Some(hook) = self.rebuild_hook.take() {
            hook();
        }
    }

    async fn shutdown(&mut self) {
        info!("Stopping tunnel manager");
        self.retry.reset();
        self.publish_retry();
        if let Some(mut session) = self.session.take() {
            if session.is_connected() {
                session.disconnect().await;
            }
        }
        self.shared.authenticated.store(false, Ordering::SeqCst);
        self.shared.status.send_replace(TunnelStatus::default());
        self.shared.set_state(TunnelState::Stopped);
        self.shared.emit(TunnelEvent::Stopped);
    }

    fn publish_retry(&self) {
        self.shared.retry.send_replace(self.retry.clone());
    }
}
