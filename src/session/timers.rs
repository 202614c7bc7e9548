use tokio::task::JoinHandle;

/// Owned set of timer task handles for one session lifecycle.
///
/// Installing a new set always cancels the previous one first, and teardown
/// cancels everything at once, so the timers are either all armed or all
/// stopped and a re-subscription can never leak a running task.
#[derive(Debug, Default)]
pub struct SessionTimers {
    warning: Option<JoinHandle<()>>,
    hard: Option<JoinHandle<()>>,
    refresh: Option<JoinHandle<()>>,
    countdown: Option<JoinHandle<()>>,
}

impl SessionTimers {
    /// Replace the three inactivity timers, cancelling whatever was armed
    /// before (including a running countdown).
    pub fn install(
        &mut self,
        warning: JoinHandle<()>,
        hard: JoinHandle<()>,
        refresh: JoinHandle<()>,
    ) {
        self.abort_all();
        self.warning = Some(warning);
        self.hard = Some(hard);
        self.refresh = Some(refresh);
    }

    /// Attach the 1 Hz countdown started when the warning fires.
    pub fn set_countdown(&mut self, handle: JoinHandle<()>) {
        if let Some(old) = self.countdown.take() {
            old.abort();
        }
        self.countdown = Some(handle);
    }

    /// Cancel every timer task.
    pub fn abort_all(&mut self) {
        for handle in [
            self.warning.take(),
            self.hard.take(),
            self.refresh.take(),
            self.countdown.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.warning.is_some() && self.hard.is_some() && self.refresh.is_some()
    }
}

impl Drop for SessionTimers {
    fn drop(&mut self) {
        self.abort_all();
    }
}
