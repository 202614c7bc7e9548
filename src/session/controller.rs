use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::Error;
use crate::session::activity::{ActivityKind, ActivityTracker, RESET_THROTTLE};
use crate::session::timers::SessionTimers;
use crate::session::SessionBackend;

/// UI-facing view of the session clock, published through a watch channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub show_warning: bool,
    pub remaining_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Warning,
    Expired,
    LoggedOut,
}

struct State {
    phase: Phase,
    remaining_seconds: u64,
    timers: SessionTimers,
    started: bool,
    logged_out: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            remaining_seconds: 0,
            timers: SessionTimers::default(),
            started: false,
            logged_out: false,
        }
    }
}

struct Inner {
    config: SessionConfig,
    backend: Arc<dyn SessionBackend>,
    activity: ActivityTracker,
    state: Mutex<State>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

/// Tracks idle time for an authenticated session: raises a warning with a
/// 1 Hz countdown after `warning_time`, forces logout after
/// `timeout_duration`, and silently refreshes the backend session while the
/// user stays active.
///
/// Call [`SessionController::start`] when the user becomes authenticated
/// and [`SessionController::shutdown`] when they stop being authenticated
/// or the surface unmounts. Timer tasks hold weak references, so dropping
/// the controller also stops them.
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(config: SessionConfig, backend: Arc<dyn SessionBackend>) -> Result<Self, Error> {
        config.validate()?;
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                backend,
                activity: ActivityTracker::new(RESET_THROTTLE),
                state: Mutex::new(State::default()),
                snapshot_tx,
            }),
        })
    }

    /// Subscribe to warning/countdown updates.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Current warning/countdown view.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Begin idle tracking. Called when the user becomes authenticated.
    pub async fn start(&self) {
        let mut state = self.inner.state.lock().await;
        if state.started {
            debug!("session controller already started");
            return;
        }
        state.started = true;
        state.logged_out = false;
        state.phase = Phase::Idle;
        state.remaining_seconds = 0;
        self.inner.activity.restart().await;
        arm_timers(&self.inner, &mut state);
        self.inner.snapshot_tx.send_replace(SessionSnapshot::default());
        info!(
            warning_ms = self.inner.config.warning_time_ms,
            timeout_ms = self.inner.config.timeout_duration_ms,
            refresh_ms = self.inner.config.refresh_interval_ms,
            "session tracking started"
        );
    }

    /// Report one interaction event from the UI.
    ///
    /// Events during the warning are deliberately ignored: only an explicit
    /// continue may extend a session the user appears to have abandoned.
    pub async fn record_activity(&self, kind: ActivityKind) {
        let mut state = self.inner.state.lock().await;
        if !state.started {
            return;
        }
        match state.phase {
            Phase::Warning => {
                trace!(kind = ?kind, "activity ignored while warning is active");
                return;
            }
            Phase::Expired | Phase::LoggedOut => return,
            Phase::Idle => {}
        }
        if self.inner.activity.record(kind).await {
            arm_timers(&self.inner, &mut state);
            trace!(kind = ?kind, "inactivity timers reset");
        }
    }

    /// Explicitly extend the session from the warning dialog.
    ///
    /// The backend refresh is awaited first; if it fails the error
    /// propagates and the warning stays visible, so a session is never
    /// silently extended on a failed refresh.
    pub async fn continue_session(&self) -> anyhow::Result<()> {
        {
            let state = self.inner.state.lock().await;
            if !state.started {
                anyhow::bail!("session is not active");
            }
        }

        self.inner.backend.refresh_session().await?;

        let mut state = self.inner.state.lock().await;
        if !state.started {
            anyhow::bail!("session ended while continuing");
        }
        state.phase = Phase::Idle;
        state.remaining_seconds = 0;
        self.inner.activity.restart().await;
        arm_timers(&self.inner, &mut state);
        self.inner.snapshot_tx.send_replace(SessionSnapshot::default());
        info!("session continued after warning");
        Ok(())
    }

    /// Log out on the user's request.
    ///
    /// Local teardown happens first and unconditionally; a remote failure
    /// propagates but can never leave the timers running or the warning
    /// stuck on screen.
    pub async fn logout(&self) -> anyhow::Result<()> {
        let backend = {
            let mut state = self.inner.state.lock().await;
            if state.logged_out {
                debug!("logout already performed");
                return Ok(());
            }
            state.logged_out = true;
            state.started = false;
            state.phase = Phase::LoggedOut;
            state.remaining_seconds = 0;
            state.timers.abort_all();
            self.inner.snapshot_tx.send_replace(SessionSnapshot::default());
            self.inner.backend.clone()
        };
        info!("logging out");
        backend.logout().await
    }

    /// Stop tracking without touching the backend, e.g. when the surface
    /// unmounts or the auth store flips to unauthenticated on its own.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        state.started = false;
        state.phase = Phase::Idle;
        state.remaining_seconds = 0;
        state.timers.abort_all();
        self.inner.snapshot_tx.send_replace(SessionSnapshot::default());
        debug!("session controller shut down");
    }
}

fn arm_timers(inner: &Arc<Inner>, state: &mut State) {
    let warning = spawn_warning(inner);
    let hard = spawn_hard(inner);
    let refresh = spawn_refresh(inner);
    state.timers.install(warning, hard, refresh);
}

fn spawn_warning(inner: &Arc<Inner>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let delay = inner.config.warning_time();
    let countdown_from = inner.config.countdown_seconds();
    tokio::spawn(async move {
        sleep(delay).await;
        let Some(inner) = weak.upgrade() else { return };
        let mut state = inner.state.lock().await;
        if !state.started || state.phase != Phase::Idle {
            return;
        }
        state.phase = Phase::Warning;
        state.remaining_seconds = countdown_from;
        let countdown = spawn_countdown(Arc::downgrade(&inner));
        state.timers.set_countdown(countdown);
        inner.snapshot_tx.send_replace(SessionSnapshot {
            show_warning: true,
            remaining_seconds: countdown_from,
        });
        info!(remaining_seconds = countdown_from, "inactivity warning raised");
    })
}

fn spawn_countdown(weak: Weak<Inner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(Duration::from_secs(1)).await;
            let Some(inner) = weak.upgrade() else { return };
            let mut state = inner.state.lock().await;
            if state.phase != Phase::Warning {
                return;
            }
            state.remaining_seconds = state.remaining_seconds.saturating_sub(1);
            inner.snapshot_tx.send_replace(SessionSnapshot {
                show_warning: true,
                remaining_seconds: state.remaining_seconds,
            });
            // The hard timer owns the actual logout; the countdown only
            // drives the display down to zero.
            if state.remaining_seconds == 0 {
                return;
            }
        }
    })
}

fn spawn_hard(inner: &Arc<Inner>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let delay = inner.config.timeout_duration();
    tokio::spawn(async move {
        sleep(delay).await;
        let Some(inner) = weak.upgrade() else { return };
        expire(inner).await;
    })
}

/// Forced logout after the hard timeout, regardless of warning state.
async fn expire(inner: Arc<Inner>) {
    let backend = {
        let mut state = inner.state.lock().await;
        if !state.started || state.logged_out {
            return;
        }
        state.logged_out = true;
        state.started = false;
        state.phase = Phase::Expired;
        state.remaining_seconds = 0;
        state.timers.abort_all();
        inner.snapshot_tx.send_replace(SessionSnapshot::default());
        inner.backend.clone()
    };
    warn!("session expired after inactivity, logging out");
    // abort_all above cancelled the hard-timer task running this function;
    // the cancellation lands at its next await, so the remote call must run
    // on its own task.
    tokio::spawn(async move {
        if let Err(err) = backend.logout().await {
            warn!(error = %err, "remote logout after expiry failed");
        }
    });
}

fn spawn_refresh(inner: &Arc<Inner>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let interval = inner.config.refresh_interval();
    tokio::spawn(async move {
        loop {
            sleep(interval).await;
            let Some(inner) = weak.upgrade() else { return };
            // Only spend a round trip when the user was active within the
            // last interval; the loop keeps running either way.
            if inner.activity.idle_for().await < interval {
                match inner.backend.refresh_session().await {
                    Ok(()) => debug!("background session refresh completed"),
                    Err(err) => warn!(error = %err, "background session refresh failed"),
                }
            } else {
                trace!("no recent activity, skipping background session refresh");
            }
        }
    })
}
