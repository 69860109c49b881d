//! fprintd client over the system bus.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use tracing::{debug, warn};
use zbus::{
    blocking::{Connection, Proxy},
    zvariant::OwnedObjectPath,
};

use crate::cancel::CancelToken;
use crate::errors::{AuthError, AuthResult};
use crate::fingerprint::{ClaimedReader, FingerprintReader};

const FPRINT_BUS: &str = "net.reactivated.Fprint";
const MANAGER_PATH: &str = "/net/reactivated/Fprint/Manager";
const MANAGER_IFACE: &str = "net.reactivated.Fprint.Manager";
const DEVICE_IFACE: &str = "net.reactivated.Fprint.Device";
const VERIFY_POLL: Duration = Duration::from_millis(100);

/// How a single `VerifyStatus` signal moves the verification along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStep {
    Matched,
    Rejected,
    Retry,
}

pub fn classify_status(result: &str, done: bool) -> VerifyStep {
    match result {
        "verify-match" => VerifyStep::Matched,
        "verify-no-match" | "verify-disconnected" | "verify-unknown-error" => VerifyStep::Rejected,
        _ if done => VerifyStep::Rejected,
        _ => VerifyStep::Retry,
    }
}

/// Forwards items from a blocking source on its own thread. The thread ends
/// when the source runs dry, so whoever owns the source must close it before
/// calling [`SignalListener::join`].
pub struct SignalListener<T> {
    rx: Receiver<T>,
    handle: JoinHandle<()>,
}

impl<T: Send + 'static> SignalListener<T> {
    pub fn spawn<I>(source: I) -> std::io::Result<Self>
    where
        I: IntoIterator<Item = T> + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let handle = thread::Builder::new()
            .name("kagami-fprintd-signals".into())
            .spawn(move || {
                for item in source {
                    if tx.send(item).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self { rx, handle })
    }

    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }

    pub fn join(self) {
        drop(self.rx);
        if self.handle.join().is_err() {
            warn!(target: "kagami::fingerprint", "signal listener panicked");
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FprintdReader;

impl FprintdReader {
    pub fn new() -> Self {
        Self
    }

    fn default_device(connection: &Connection) -> AuthResult<OwnedObjectPath> {
        let manager = Proxy::new(connection, FPRINT_BUS, MANAGER_PATH, MANAGER_IFACE)?;
        let path: OwnedObjectPath = manager.call("GetDefaultDevice", &())?;
        Ok(path)
    }
}

impl FingerprintReader for FprintdReader {
    fn is_available(&self) -> bool {
        let available = Connection::system()
            .map_err(AuthError::from)
            .and_then(|connection| Self::default_device(&connection));
        match available {
            Ok(path) => {
                debug!(target: "kagami::fingerprint", device = %path.as_str(), "fprintd device available");
                true
            }
            Err(err) => {
                debug!(target: "kagami::fingerprint", error = %err, "fprintd unavailable");
                false
            }
        }
    }

    fn claim(&self, username: &str) -> AuthResult<Box<dyn ClaimedReader + '_>> {
        let connection = Connection::system()?;
        let path = Self::default_device(&connection)?;
        let device = Proxy::new(&connection, FPRINT_BUS, path.into_inner(), DEVICE_IFACE)?;
        let _: () = device.call("Claim", &(username,))?;
        debug!(target: "kagami::fingerprint", user = %username, "fprintd device claimed");
        Ok(Box::new(FprintdClaim {
            connection,
            device,
            listener: None,
        }))
    }
}

type VerifyStatus = zbus::Result<(String, bool)>;

/// Owns the private bus connection for one claim. Closing it ends the
/// `VerifyStatus` stream, which lets the listener thread be joined.
struct FprintdClaim {
    connection: Connection,
    device: Proxy<'static>,
    listener: Option<SignalListener<VerifyStatus>>,
}

impl FprintdClaim {
    fn await_result(&mut self, timeout: Duration, cancel: &CancelToken) -> AuthResult<bool> {
        if self.listener.is_none() {
            let statuses = self.device.receive_signal("VerifyStatus")?;
            let listener = SignalListener::spawn(
                statuses.map(|message| message.body().deserialize::<(String, bool)>()),
            )
            .map_err(|err| AuthError::Fingerprint(format!("cannot start signal listener: {err}")))?;
            self.listener = Some(listener);
        }
        let rx = match &self.listener {
            Some(listener) => listener.receiver().clone(),
            None => return Ok(false),
        };

        let _: () = self.device.call("VerifyStart", &("any",))?;
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                debug!(target: "kagami::fingerprint", "verification cancelled");
                return Ok(false);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            match rx.recv_timeout(VERIFY_POLL.min(remaining)) {
                Ok(Ok((result, done))) => {
                    debug!(target: "kagami::fingerprint", result = %result, done, "verify status");
                    match classify_status(&result, done) {
                        VerifyStep::Matched => return Ok(true),
                        VerifyStep::Rejected => return Ok(false),
                        VerifyStep::Retry => {}
                    }
                }
                Ok(Err(err)) => {
                    warn!(target: "kagami::fingerprint", error = %err, "malformed VerifyStatus signal");
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AuthError::Fingerprint(
                        "fprintd signal stream closed".into(),
                    ))
                }
            }
        }
    }
}

impl ClaimedReader for FprintdClaim {
    fn verify(&mut self, timeout: Duration, cancel: &CancelToken) -> AuthResult<bool> {
        let result = self.await_result(timeout, cancel);
        let stopped: zbus::Result<()> = self.device.call("VerifyStop", &());
        if let Err(err) = stopped {
            debug!(target: "kagami::fingerprint", error = %err, "VerifyStop failed");
        }
        result
    }

    fn release(&mut self) -> AuthResult<()> {
        let released: zbus::Result<()> = self.device.call("Release", &());
        self.disconnect();
        released?;
        debug!(target: "kagami::fingerprint", "fprintd device released");
        Ok(())
    }
}

impl FprintdClaim {
    fn disconnect(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        if let Err(err) = self.connection.clone().close() {
            debug!(target: "kagami::fingerprint", error = %err, "closing fprintd connection failed");
        }
        listener.join();
    }
}

impl Drop for FprintdClaim {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_thread_ends_once_its_source_is_closed() {
        let (source_tx, source_rx) = unbounded::<u32>();
        let listener = SignalListener::spawn(source_rx).unwrap();

        source_tx.send(7).unwrap();
        assert_eq!(
            listener.receiver().recv_timeout(Duration::from_secs(1)),
            Ok(7)
        );

        drop(source_tx);
        let (joined_tx, joined_rx) = unbounded();
        thread::spawn(move || {
            listener.join();
            let _ = joined_tx.send(());
        });
        assert!(joined_rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn listener_forwards_in_order() {
        let listener = SignalListener::spawn(vec![1, 2, 3]).unwrap();
        let got: Vec<u32> = listener.receiver().iter().take(3).collect();
        assert_eq!(got, vec![1, 2, 3]);
        listener.join();
    }

    #[test]
    fn classifies_fprintd_results() {
        assert_eq!(classify_status("verify-match", true), VerifyStep::Matched);
        assert_eq!(classify_status("verify-no-match", true), VerifyStep::Rejected);
        assert_eq!(classify_status("verify-retry-scan", false), VerifyStep::Retry);
        assert_eq!(
            classify_status("verify-swipe-too-short", false),
            VerifyStep::Retry
        );
        assert_eq!(
            classify_status("verify-finger-not-centered", true),
            VerifyStep::Rejected
        );
    }
}
