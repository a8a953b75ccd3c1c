/// Session cancellation and the per-session idle timer
use crossbeam_channel::{after, bounded, never, select, Receiver, Sender};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What ended a session before its process exited on its own
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Idle,
    Shutdown,
    PeerClosed,
    Requested,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Idle => write!(f, "idle timeout"),
            CancelReason::Shutdown => write!(f, "server shutdown"),
            CancelReason::PeerClosed => write!(f, "peer closed"),
            CancelReason::Requested => write!(f, "cancelation"),
        }
    }
}

#[derive(Debug)]
struct TokenState {
    reason: Mutex<Option<CancelReason>>,
    trigger: Mutex<Option<Sender<()>>>,
    done: Receiver<()>,
}

/// Cancellable context shared by everything serving one session (or, for
/// the shutdown token, the whole process).
///
/// `done()` becomes ready once the token is cancelled, so it can sit in a
/// `select!` next to other channels.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        // nothing is ever sent; dropping the sender disconnects `done`
        let (trigger, done) = bounded(0);
        Self {
            state: Arc::new(TokenState {
                reason: Mutex::new(None),
                trigger: Mutex::new(Some(trigger)),
                done,
            }),
        }
    }

    /// Cancel with `reason`. Only the first call has an effect; returns
    /// whether this call was it.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let mut current = self
            .state
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        drop(current);

        let trigger = self
            .state
            .trigger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(trigger);
        debug!("Context cancelled: {}", reason);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self
            .state
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Disconnected once the token is cancelled
    pub fn done(&self) -> &Receiver<()> {
        &self.state.done
    }

    /// Block until cancelled or until `timeout` passes; returns whether the
    /// token was cancelled
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        select! {
            recv(self.done()) -> _ => true,
            recv(after(timeout)) -> _ => self.is_cancelled(),
        }
    }
}

/// Cancels a session after `idle` without activity, or as soon as the
/// shutdown token fires. Whichever comes first wins; the session token
/// ignores the loser.
pub struct SessionTimer {
    activity: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SessionTimer {
    pub fn start(
        idle: Option<Duration>,
        session: CancellationToken,
        shutdown: CancellationToken,
    ) -> Self {
        let (activity, touches) = bounded::<()>(1);

        let handle = thread::spawn(move || loop {
            let deadline: Receiver<Instant> = idle.map(after).unwrap_or_else(never);
            select! {
                recv(touches) -> touch => {
                    if touch.is_err() {
                        return;
                    }
                }
                recv(shutdown.done()) -> _ => {
                    session.cancel(CancelReason::Shutdown);
                    return;
                }
                recv(session.done()) -> _ => return,
                recv(deadline) -> _ => {
                    session.cancel(CancelReason::Idle);
                    return;
                }
            }
        });

        Self {
            activity: Some(activity),
            handle: Some(handle),
        }
    }

    /// Renew the idle deadline
    pub fn touch(&self) {
        if let Some(activity) = &self.activity {
            // a pending touch already renews the deadline
            let _ = activity.try_send(());
        }
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.activity.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
