//! Races the eligible verifiers against each other and the session timeout.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use tracing::{debug, warn};

use crate::audit::AuthMethod;
use crate::cancel::CancelToken;
use crate::errors::AuthResult;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long a cancelled verifier gets to release its device before the race
/// stops waiting for it.
pub const JOIN_GRACE: Duration = Duration::from_secs(2);

/// Final answer of one verifier. Once sent it never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierOutcome {
    pub succeeded: bool,
    pub finished: bool,
    pub matched_username: Option<String>,
}

impl VerifierOutcome {
    pub fn succeeded(matched_username: Option<String>) -> Self {
        Self {
            succeeded: true,
            finished: true,
            matched_username,
        }
    }

    pub fn failed() -> Self {
        Self {
            succeeded: false,
            finished: true,
            matched_username: None,
        }
    }
}

/// Which methods may run for this session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Eligibility {
    pub face: bool,
    pub fingerprint: bool,
}

impl Eligibility {
    pub fn none(self) -> bool {
        !self.face && !self.fingerprint
    }

    pub fn as_str(self) -> &'static str {
        match (self.face, self.fingerprint) {
            (true, true) => "face+fingerprint",
            (true, false) => "face",
            (false, true) => "fingerprint",
            (false, false) => "none",
        }
    }

    pub fn failure_reason(self) -> FailureReason {
        match (self.face, self.fingerprint) {
            (true, true) => FailureReason::BothTimeoutOrNoMatch,
            (true, false) => FailureReason::FaceTimeoutOrNoMatch,
            (false, true) => FailureReason::FingerprintTimeoutOrNoMatch,
            (false, false) => FailureReason::NoMethodsAvailable,
        }
    }
}

impl fmt::Display for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    NoMethodsAvailable,
    FaceTimeoutOrNoMatch,
    FingerprintTimeoutOrNoMatch,
    BothTimeoutOrNoMatch,
    SessionError,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::NoMethodsAvailable => "no_methods_available",
            FailureReason::FaceTimeoutOrNoMatch => "face_timeout_or_no_match",
            FailureReason::FingerprintTimeoutOrNoMatch => "fingerprint_timeout_or_no_match",
            FailureReason::BothTimeoutOrNoMatch => "both_timeout_or_no_match",
            FailureReason::SessionError => "session_error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One verifier body, run on its own thread.
pub trait VerifierTask: Send + 'static {
    fn method(&self) -> AuthMethod;
    fn run(self: Box<Self>, deadline: Instant, cancel: &CancelToken) -> AuthResult<VerifierOutcome>;
}

/// Adapts a closure into a [`VerifierTask`].
pub struct FnTask<F> {
    method: AuthMethod,
    body: F,
}

impl<F> FnTask<F>
where
    F: FnOnce(Instant, &CancelToken) -> AuthResult<VerifierOutcome> + Send + 'static,
{
    pub fn new(method: AuthMethod, body: F) -> Self {
        Self { method, body }
    }

    pub fn boxed(method: AuthMethod, body: F) -> Box<dyn VerifierTask> {
        Box::new(Self::new(method, body))
    }
}

impl<F> VerifierTask for FnTask<F>
where
    F: FnOnce(Instant, &CancelToken) -> AuthResult<VerifierOutcome> + Send + 'static,
{
    fn method(&self) -> AuthMethod {
        self.method
    }

    fn run(self: Box<Self>, deadline: Instant, cancel: &CancelToken) -> AuthResult<VerifierOutcome> {
        (self.body)(deadline, cancel)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceReport {
    pub eligible: Eligibility,
    pub winner: Option<AuthMethod>,
    pub matched_username: Option<String>,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl RaceReport {
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self.winner {
            Some(_) => None,
            None => Some(self.eligible.failure_reason()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Arbiter {
    poll_interval: Duration,
    join_grace: Duration,
}

impl Default for Arbiter {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            join_grace: JOIN_GRACE,
        }
    }
}

impl Arbiter {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            join_grace: JOIN_GRACE,
        }
    }

    pub fn with_join_grace(mut self, join_grace: Duration) -> Self {
        self.join_grace = join_grace;
        self
    }

    /// Runs every task on its own thread until `deadline`. The first success
    /// the poll loop observes wins; tasks that finish without success drop
    /// out. `cancel` is always set before returning, and every verifier that
    /// stops within the join grace is joined, so its device is released by
    /// the time this returns.
    pub fn race(
        &self,
        tasks: Vec<Box<dyn VerifierTask>>,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> RaceReport {
        let started = Instant::now();
        let timeout = deadline.saturating_duration_since(started);
        let (tx, rx) = unbounded::<(AuthMethod, VerifierOutcome)>();
        let dispatch = tracing::dispatcher::get_default(|current| current.clone());

        let mut eligible = Eligibility::default();
        let mut pending = Vec::new();
        let mut handles = Vec::new();
        for task in tasks {
            let method = task.method();
            match method {
                AuthMethod::Face => eligible.face = true,
                AuthMethod::Fingerprint => eligible.fingerprint = true,
            }
            let tx = tx.clone();
            let token = cancel.clone();
            let dispatch = dispatch.clone();
            let spawned = thread::Builder::new()
                .name(format!("kagami-{method}"))
                .spawn(move || {
                    tracing::dispatcher::with_default(&dispatch, || {
                        let outcome = run_guarded(method, task, deadline, &token);
                        let _ = tx.send((method, outcome));
                    })
                });
            match spawned {
                Ok(handle) => {
                    pending.push(method);
                    handles.push((method, handle));
                }
                Err(err) => {
                    warn!(target: "kagami::arbiter", method = %method, error = %err, "failed to start verifier")
                }
            }
        }
        drop(tx);
        debug!(target: "kagami::arbiter", methods = %eligible, timeout_ms = timeout.as_millis() as u64, "race started");

        let mut winner = None;
        let mut timed_out = false;
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                timed_out = true;
                break;
            }
            match rx.recv_timeout(self.poll_interval.min(remaining)) {
                Ok((method, outcome)) => {
                    pending.retain(|m| *m != method);
                    if outcome.succeeded {
                        cancel.cancel();
                        winner = Some((method, outcome.matched_username));
                        break;
                    }
                    debug!(target: "kagami::arbiter", method = %method, "verifier finished without success");
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        cancel.cancel();
        let elapsed = started.elapsed();

        self.join_verifiers(handles, &rx, pending);

        let (winner, matched_username) = match winner {
            Some((method, matched)) => (Some(method), matched),
            None => (None, None),
        };
        debug!(
            target: "kagami::arbiter",
            winner = winner.map_or("none", AuthMethod::as_str),
            elapsed_ms = elapsed.as_millis() as u64,
            timed_out,
            "race finished"
        );
        RaceReport {
            eligible,
            winner,
            matched_username,
            elapsed,
            timed_out,
        }
    }

    /// Waits for the verifiers still running after cancellation. Each thread
    /// reports exactly once, so its report marks the point where its body has
    /// returned and dropped its device.
    fn join_verifiers(
        &self,
        handles: Vec<(AuthMethod, JoinHandle<()>)>,
        rx: &Receiver<(AuthMethod, VerifierOutcome)>,
        mut running: Vec<AuthMethod>,
    ) {
        let grace_deadline = Instant::now() + self.join_grace;
        while !running.is_empty() {
            let remaining = grace_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok((method, _)) => running.retain(|m| *m != method),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    running.clear();
                    break;
                }
            }
        }

        for (method, handle) in handles {
            if running.contains(&method) {
                warn!(
                    target: "kagami::arbiter",
                    method = %method,
                    grace_ms = self.join_grace.as_millis() as u64,
                    "verifier ignored cancellation; leaving it detached"
                );
                continue;
            }
            if handle.join().is_err() {
                warn!(target: "kagami::arbiter", method = %method, "verifier thread panicked");
            }
        }
    }
}

fn run_guarded(
    method: AuthMethod,
    task: Box<dyn VerifierTask>,
    deadline: Instant,
    cancel: &CancelToken,
) -> VerifierOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| task.run(deadline, cancel))) {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            warn!(target: "kagami::arbiter", method = %method, error = %err, "verifier failed");
            VerifierOutcome::failed()
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            warn!(target: "kagami::arbiter", method = %method, panic = %message, "verifier panicked");
            VerifierOutcome::failed()
        }
    }
}
