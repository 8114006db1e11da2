//! Generic actor/mailbox and supervision helpers shared by every supervised
//! component (Queue, TestExecutionActor and its children).
//!
//! Each supervised component is a `tokio::spawn`ed task that owns an
//! `mpsc::Receiver<Msg>` mailbox; the only way to reach it from outside is a
//! cloneable `Handle` wrapping the matching `mpsc::Sender<Msg>`. Request/reply
//! operations embed a `oneshot::Sender<Reply>` in the message variant and are
//! bounded by `tokio::time::timeout`, producing `Error::Timeout` on expiry
//! without touching callee state.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, warn};

/// Default mailbox capacity for supervised actors.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Send a message into a mailbox and await its reply within `timeout`.
pub async fn call<Req, Reply>(
    sender: &mpsc::Sender<Req>,
    timeout: Duration,
    build: impl FnOnce(oneshot::Sender<Reply>) -> Req,
) -> Result<Reply> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let message = build(reply_tx);

    sender
        .send(message)
        .await
        .map_err(|_| Error::Fatal {
            message: "actor mailbox closed".into(),
        })?;

    match tokio::time::timeout(timeout, reply_rx).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(_)) => Err(Error::Fatal {
            message: "actor dropped reply channel without responding".into(),
        }),
        Err(_) => Err(Error::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// How a supervisor should react to a child's termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionDecision {
    /// Re-spawn the child from scratch.
    Restart,
    /// Leave the child stopped; its state (if any) is discarded by the
    /// caller, who already holds whatever result it needs.
    Resume,
    /// Stop supervising and escalate to the parent.
    Stop,
}

/// Classify an `Error` into a supervision decision, per the propagation
/// policy table: retryable errors restart (bounded rate), resumable errors
/// are logged and the child resumes with its state intact, everything else
/// stops and escalates.
pub fn classify(err: &Error) -> SupervisionDecision {
    if err.is_fatal() {
        SupervisionDecision::Stop
    } else if err.is_retryable() {
        SupervisionDecision::Restart
    } else if err.is_resumable() {
        SupervisionDecision::Resume
    } else {
        SupervisionDecision::Stop
    }
}

/// Token-bucket style bound on how many restarts are allowed within a
/// rolling time window.
pub struct RestartBudget {
    max_count: u32,
    window: Duration,
    restarts: Vec<Instant>,
}

impl RestartBudget {
    pub fn new(max_count: u32, window: Duration) -> Self {
        Self {
            max_count,
            window,
            restarts: Vec::new(),
        }
    }

    /// Record a restart attempt now and report whether the budget still
    /// allows it. Once exhausted within the window, the caller must treat
    /// the child as fatal and escalate.
    pub fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        self.restarts.retain(|t| now.duration_since(*t) < self.window);
        if self.restarts.len() as u32 >= self.max_count {
            return false;
        }
        self.restarts.push(now);
        true
    }
}

/// Spawns `make_child` repeatedly, applying the supervision policy on each
/// terminal `Err` it returns. `make_child` receives a fresh `watch::Sender`
/// it must drop (by task exit) to signal termination to `termination_rx`
/// callers awaiting prompt shutdown notice, matching the "upgraded from
/// poll-loop" design in the concurrency notes: termination propagates the
/// instant the child task ends rather than on the next 100ms poll tick.
pub async fn supervise<F, Fut>(
    label: &'static str,
    max_restarts: u32,
    window: Duration,
    mut make_child: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut budget = RestartBudget::new(max_restarts, window);

    loop {
        match make_child().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                let decision = classify(&err);
                match decision {
                    SupervisionDecision::Restart => {
                        if budget.try_consume() {
                            warn!(child = label, error = %err, "restarting child after error");
                            continue;
                        }
                        error!(child = label, error = %err, "restart budget exhausted, escalating");
                        return Err(err);
                    }
                    SupervisionDecision::Resume => {
                        warn!(child = label, error = %err, "resuming child, state preserved");
                        return Ok(());
                    }
                    SupervisionDecision::Stop => {
                        error!(child = label, error = %err, "fatal error, stopping child");
                        return Err(err);
                    }
                }
            }
        }
    }
}

/// Pairs a `watch::Sender<()>` held by a running task with a cheap
/// `watch::Receiver<()>` callers can `.changed()`-await (or check
/// `has_changed()`/closed state on) to learn the instant the task ends,
/// replacing a `JoinHandle::is_finished()` poll loop.
pub fn termination_signal() -> (watch::Sender<()>, watch::Receiver<()>) {
    watch::channel(())
}

/// Await a task's termination signal, closing as soon as its `watch::Sender`
/// half is dropped (i.e. the owning task has exited, for any reason).
pub async fn await_termination(mut rx: watch::Receiver<()>) {
    // `changed()` returns `Err` exactly when every Sender has been dropped.
    let _ = rx.changed().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_budget_caps_within_window() {
        let mut budget = RestartBudget::new(2, Duration::from_secs(60));
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
    }

    #[test]
    fn classify_maps_error_kinds_to_decisions() {
        assert_eq!(
            classify(&Error::kafka("broker down")),
            SupervisionDecision::Restart
        );
        assert_eq!(
            classify(&Error::validation("bad directive")),
            SupervisionDecision::Resume
        );
        assert_eq!(
            classify(&Error::Fatal {
                message: "oom".into()
            }),
            SupervisionDecision::Stop
        );
    }

    #[tokio::test]
    async fn call_times_out_when_no_reply_sent() {
        let (tx, mut rx) = mpsc::channel::<oneshot::Sender<u8>>(1);
        tokio::spawn(async move {
            // Receive but never reply.
            let _held = rx.recv().await;
            std::mem::forget(_held);
        });

        let result: Result<u8> = call(&tx, Duration::from_millis(50), |reply| reply).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn await_termination_resolves_when_sender_dropped() {
        let (tx, rx) = termination_signal();
        let handle = tokio::spawn(async move {
            drop(tx);
        });
        await_termination(rx).await;
        handle.await.unwrap();
    }
}
