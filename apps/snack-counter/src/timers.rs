use std::future::Future;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Expiry,
    Warning,
    DisconnectGrace,
    PayingGrace,
}

impl TimerKind {
    fn name(&self) -> &'static str {
        match self {
            TimerKind::Expiry => "expiry",
            TimerKind::Warning => "warning",
            TimerKind::DisconnectGrace => "disconnect_grace",
            TimerKind::PayingGrace => "paying_grace",
        }
    }
}

/// Named delayed actions attached to the active session. At most one live
/// timer per kind; scheduling is first-writer-wins. Expiry/warning deadlines
/// are computed from the session's start instant by the caller, so a delayed
/// schedule call does not stretch the budget.
#[derive(Default)]
pub struct TimerTable {
    expiry: Option<JoinHandle<()>>,
    warning: Option<JoinHandle<()>>,
    disconnect_grace: Option<JoinHandle<()>>,
    paying_grace: Option<JoinHandle<()>>,
}

impl TimerTable {
    fn slot_mut(&mut self, kind: TimerKind) -> &mut Option<JoinHandle<()>> {
        match kind {
            TimerKind::Expiry => &mut self.expiry,
            TimerKind::Warning => &mut self.warning,
            TimerKind::DisconnectGrace => &mut self.disconnect_grace,
            TimerKind::PayingGrace => &mut self.paying_grace,
        }
    }

    pub fn is_set(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::Expiry => self.expiry.is_some(),
            TimerKind::Warning => self.warning.is_some(),
            TimerKind::DisconnectGrace => self.disconnect_grace.is_some(),
            TimerKind::PayingGrace => self.paying_grace.is_some(),
        }
    }

    /// Spawn a timer firing at `deadline`. Refuses (and logs, invariant
    /// violation) when a timer of this kind is already live.
    pub fn schedule<F>(&mut self, kind: TimerKind, deadline: Instant, fire: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let slot = self.slot_mut(kind);
        if slot.is_some() {
            error!(timer = kind.name(), "duplicate timer schedule refused");
            return false;
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fire.await;
        }));
        true
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(task) = self.slot_mut(kind).take() {
            task.abort();
        }
    }

    /// A reconnect clears the grace pair only; the expiry/warning budget is
    /// never extended by resuming.
    pub fn cancel_grace(&mut self) {
        self.cancel(TimerKind::DisconnectGrace);
        self.cancel(TimerKind::PayingGrace);
    }

    pub fn cancel_all(&mut self) {
        self.cancel(TimerKind::Expiry);
        self.cancel(TimerKind::Warning);
        self.cancel(TimerKind::DisconnectGrace);
        self.cancel(TimerKind::PayingGrace);
    }
}

impl Drop for TimerTable {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
