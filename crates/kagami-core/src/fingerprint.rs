//! Fingerprint verification with a delayed start and a scoped device claim.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::arbiter::VerifierOutcome;
use crate::cancel::CancelToken;
use crate::errors::AuthResult;

pub trait FingerprintReader: Send + Sync {
    fn is_available(&self) -> bool;

    fn claim(&self, username: &str) -> AuthResult<Box<dyn ClaimedReader + '_>>;

    /// Claims the reader, verifies once, and releases the claim on every path.
    fn authenticate(
        &self,
        username: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> AuthResult<bool> {
        let mut claim = DeviceClaim::new(self.claim(username)?);
        claim.verify(timeout, cancel)
    }
}

pub trait ClaimedReader {
    fn verify(&mut self, timeout: Duration, cancel: &CancelToken) -> AuthResult<bool>;
    fn release(&mut self) -> AuthResult<()>;
}

/// Releases the wrapped claim when dropped.
pub struct DeviceClaim<'a> {
    inner: Box<dyn ClaimedReader + 'a>,
}

impl<'a> DeviceClaim<'a> {
    pub fn new(inner: Box<dyn ClaimedReader + 'a>) -> Self {
        Self { inner }
    }

    pub fn verify(&mut self, timeout: Duration, cancel: &CancelToken) -> AuthResult<bool> {
        self.inner.verify(timeout, cancel)
    }
}

impl Drop for DeviceClaim<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.inner.release() {
            warn!(target: "kagami::fingerprint", error = %err, "failed to release fingerprint reader");
        }
    }
}

/// Reader used when fingerprint support is disabled or absent.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFingerprintReader;

impl FingerprintReader for NoFingerprintReader {
    fn is_available(&self) -> bool {
        false
    }

    fn claim(&self, _username: &str) -> AuthResult<Box<dyn ClaimedReader + '_>> {
        Err(crate::errors::AuthError::Fingerprint(
            "no fingerprint reader configured".into(),
        ))
    }
}

pub struct FingerprintVerifier {
    reader: Arc<dyn FingerprintReader>,
    head_start: Duration,
}

impl FingerprintVerifier {
    pub fn new(reader: Arc<dyn FingerprintReader>, head_start: Duration) -> Self {
        Self { reader, head_start }
    }

    /// Sleeps for the head start, checks `cancel`, then claims the reader, in
    /// that order, so a quick face match never touches the fingerprint device.
    pub fn run(
        &self,
        username: &str,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> AuthResult<VerifierOutcome> {
        thread::sleep(self.head_start);
        if cancel.is_cancelled() {
            debug!(target: "kagami::fingerprint", "cancelled during head start");
            return Ok(VerifierOutcome::failed());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(VerifierOutcome::failed());
        }

        let matched = self.reader.authenticate(username, remaining, cancel)?;
        debug!(target: "kagami::fingerprint", matched, "fingerprint verification finished");
        if matched && !cancel.is_cancelled() {
            Ok(VerifierOutcome::succeeded(Some(username.to_string())))
        } else {
            Ok(VerifierOutcome::failed())
        }
    }
}
