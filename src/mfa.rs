//! Countdown for items waiting on the user to finish an MFA challenge.
//!
//! A poller discovers items in `WAITING_USER_INPUT` and starts a session; a
//! one second ticker then counts down to the client side timeout. Only one
//! session runs at a time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::BankingApi;
use crate::model::ItemStatus;
use crate::notify::{Notifier, Toast};

const TICK: Duration = Duration::from_secs(1);
const CRITICAL: Duration = Duration::from_secs(10);
const FALLBACK_INSTITUTION: &str = "seu banco";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MfaConfig {
    /// Assumed lifetime of the aggregator's MFA session. The backend does
    /// not report the real value, so this is a best guess.
    pub timeout: Duration,
    pub warning_threshold: Duration,
    pub poll_interval: Duration,
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            warning_threshold: Duration::from_secs(20),
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MfaPhase {
    Idle,
    Active,
    /// Still counting down, past the warning threshold.
    Warning,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MfaStatus {
    pub phase: MfaPhase,
    pub item_id: Option<String>,
    pub institution_name: Option<String>,
    pub remaining: Duration,
    pub elapsed: Duration,
    pub is_urgent: bool,
    pub is_critical: bool,
    pub formatted_time: String,
    pub progress: f64,
}

impl MfaStatus {
    fn idle() -> Self {
        Self {
            phase: MfaPhase::Idle,
            item_id: None,
            institution_name: None,
            remaining: Duration::ZERO,
            elapsed: Duration::ZERO,
            is_urgent: false,
            is_critical: false,
            formatted_time: format_time(Duration::ZERO),
            progress: 0.0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase != MfaPhase::Idle
    }
}

/// Renders a remaining time as `M:SS` from one minute up, `Ns` below.
pub fn format_time(remaining: Duration) -> String {
    let secs = remaining.as_secs();
    if secs >= 60 {
        format!("{}:{:02}", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Percentage of `timeout` already elapsed, clamped to `0..=100`.
pub fn progress(elapsed: Duration, timeout: Duration) -> f64 {
    if timeout.is_zero() {
        return 100.0;
    }
    (elapsed.as_secs_f64() / timeout.as_secs_f64() * 100.0).clamp(0.0, 100.0)
}

type WarningFn = Arc<dyn Fn(&MfaStatus) + Send + Sync>;
type TimeoutFn = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct MfaCallbacks {
    pub on_warning: Option<WarningFn>,
    /// Receives the item id; the usual reaction is opening the reconnect flow.
    pub on_timeout: Option<TimeoutFn>,
}

impl MfaCallbacks {
    pub fn on_warning(mut self, f: impl Fn(&MfaStatus) + Send + Sync + 'static) -> Self {
        self.on_warning = Some(Arc::new(f));
        self
    }

    pub fn on_timeout(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_timeout = Some(Arc::new(f));
        self
    }
}

struct Session {
    id: u64,
    item_id: String,
    institution_name: String,
    started: Instant,
    warned: bool,
    countdown: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Sessions {
    current: Option<Session>,
    next_id: u64,
}

struct Inner {
    api: Arc<dyn BankingApi>,
    notifier: Arc<dyn Notifier>,
    config: MfaConfig,
    callbacks: MfaCallbacks,
    sessions: Mutex<Sessions>,
    status: watch::Sender<MfaStatus>,
}

enum Tick {
    Continue,
    Done,
}

impl Inner {
    fn sessions(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status_of(&self, session: &Session) -> MfaStatus {
        let elapsed = session.started.elapsed();
        let remaining = self.config.timeout.saturating_sub(elapsed);
        let is_urgent = remaining <= self.config.warning_threshold;

        MfaStatus {
            phase: if is_urgent {
                MfaPhase::Warning
            } else {
                MfaPhase::Active
            },
            item_id: Some(session.item_id.clone()),
            institution_name: Some(session.institution_name.clone()),
            remaining,
            elapsed,
            is_urgent,
            is_critical: remaining <= CRITICAL,
            formatted_time: format_time(remaining),
            progress: progress(elapsed, self.config.timeout),
        }
    }

    fn tick(&self, session_id: u64) -> Tick {
        let mut warning = None;
        let mut expired = None;

        {
            let mut sessions = self.sessions();
            let session = match sessions.current.as_mut() {
                Some(session) if session.id == session_id => session,
                _ => return Tick::Done,
            };

            let status = self.status_of(session);
            if status.is_urgent && !session.warned {
                session.warned = true;
                warning = Some(status.clone());
            }

            if status.remaining.is_zero() {
                expired = sessions.current.take();
                self.status.send_modify(|s| *s = MfaStatus::idle());
            } else {
                self.status.send_modify(|s| *s = status);
            }
        }

        if let Some(status) = warning {
            info!(item = ?status.item_id, remaining = %status.formatted_time, "mfa session about to expire");
            self.notifier.notify(Toast::warning(
                "Tempo acabando",
                format!(
                    "Restam {} para concluir a autenticação no {}.",
                    status.formatted_time,
                    status.institution_name.as_deref().unwrap_or(FALLBACK_INSTITUTION)
                ),
            ));
            if let Some(on_warning) = &self.callbacks.on_warning {
                on_warning(&status);
            }
        }

        match expired {
            Some(session) => {
                warn!(item = %session.item_id, "mfa session timed out");
                if let Some(on_timeout) = &self.callbacks.on_timeout {
                    on_timeout(&session.item_id);
                }
                self.notifier.notify(Toast::error(
                    "Tempo esgotado",
                    format!(
                        "A autenticação no {} expirou. Reconecte sua conta.",
                        session.institution_name
                    ),
                ));
                Tick::Done
            }
            None => Tick::Continue,
        }
    }

    fn stop(&self) -> bool {
        let session = self.sessions().current.take();
        match session {
            Some(session) => {
                debug!(item = %session.item_id, "mfa session stopped");
                if let Some(countdown) = session.countdown {
                    countdown.abort();
                }
                self.status.send_modify(|s| *s = MfaStatus::idle());
                true
            }
            None => false,
        }
    }
}

fn start(inner: &Arc<Inner>, item_id: &str, institution_name: &str) -> bool {
    let mut sessions = inner.sessions();
    if sessions.current.is_some() {
        return false;
    }

    sessions.next_id += 1;
    let id = sessions.next_id;
    let started = Instant::now();

    let countdown = tokio::spawn({
        let inner = Arc::clone(inner);
        async move {
            let mut ticker = time::interval_at(started + TICK, TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Tick::Done = inner.tick(id) {
                    break;
                }
            }
        }
    });

    let session = Session {
        id,
        item_id: item_id.to_string(),
        institution_name: institution_name.to_string(),
        started,
        warned: false,
        countdown: Some(countdown),
    };
    info!(item = item_id, institution = institution_name, "mfa session started");
    let status = inner.status_of(&session);
    sessions.current = Some(session);
    inner.status.send_modify(|s| *s = status);
    true
}

async fn poll_once(inner: &Arc<Inner>) {
    let items = match inner.api.waiting_items().await {
        Ok(items) => items,
        Err(err) => {
            warn!(error = %err, "failed to poll waiting items");
            return;
        }
    };

    let waiting = items
        .iter()
        .find(|item| item.status == ItemStatus::WaitingUserInput);
    let active = inner.sessions().current.is_some();

    match (active, waiting) {
        (true, None) => {
            debug!("no item waiting anymore, stopping mfa session");
            inner.stop();
        }
        (false, Some(item)) => {
            let institution = item
                .connector_name
                .as_deref()
                .unwrap_or(FALLBACK_INSTITUTION);
            start(inner, &item.id, institution);
        }
        _ => {}
    }
}

/// Tracks at most one MFA session. Dropping the tracker stops its timers.
pub struct MfaTracker {
    inner: Arc<Inner>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl MfaTracker {
    pub fn new(
        api: Arc<dyn BankingApi>,
        notifier: Arc<dyn Notifier>,
        config: MfaConfig,
        callbacks: MfaCallbacks,
    ) -> Self {
        let (status, _) = watch::channel(MfaStatus::idle());
        Self {
            inner: Arc::new(Inner {
                api,
                notifier,
                config,
                callbacks,
                sessions: Mutex::new(Sessions::default()),
                status,
            }),
            poller: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MfaConfig {
        &self.inner.config
    }

    /// Starts polling for waiting items. Calling it again is a no-op.
    pub fn mount(&self) {
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *poller = Some(tokio::spawn(async move {
            let mut ticker = time::interval(inner.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                poll_once(&inner).await;
            }
        }));
    }

    /// Stops polling and any running session.
    pub fn unmount(&self) {
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(poller) = poller {
            poller.abort();
        }
        self.inner.stop();
    }

    pub async fn poll(&self) {
        poll_once(&self.inner).await
    }

    /// Starts a session directly, for callers that learn about the MFA
    /// challenge from a pushed event rather than the poller. Returns false
    /// when a session is already running.
    pub fn start_mfa_timeout(&self, item_id: &str, institution_name: &str) -> bool {
        start(&self.inner, item_id, institution_name)
    }

    pub fn stop_mfa_timeout(&self) {
        self.inner.stop();
    }

    pub fn status(&self) -> MfaStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MfaStatus> {
        self.inner.status.subscribe()
    }
}

impl Drop for MfaTracker {
    fn drop(&mut self) {
        self.unmount();
    }
}
