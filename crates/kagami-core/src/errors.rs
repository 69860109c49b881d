use std::io;
use std::path::PathBuf;
use std::time::Duration;

use kagami_config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to open video device {device}: {source}")]
    DeviceOpen {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("device capability error: {0}")]
    Capability(String),

    #[error("unsupported pixel format '{0}' for selected device")]
    UnsupportedFormat(String),

    #[error("failed processing frame data: {0}")]
    FrameProcessing(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("missing {kind} model; set {key} in the configuration")]
    MissingModel {
        kind: &'static str,
        key: &'static str,
    },

    #[error("failed to load model {path}: {message}")]
    ModelLoad { path: PathBuf, message: String },

    #[error("detection engine used before its models were loaded")]
    EngineNotLoaded,

    #[error("failed to read template file {path}: {source}")]
    TemplateRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("template file {path} is invalid: {message}")]
    InvalidTemplateFile { path: PathBuf, message: String },

    #[error("invalid user name '{user}': {message}")]
    InvalidUser { user: String, message: String },

    #[error("failed to open lock file {path}: {source}")]
    LockOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to lock {path}: {source}")]
    LockFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("lock {path} still held after waiting {waited:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("fingerprint reader error: {0}")]
    Fingerprint(String),

    #[error("D-Bus error: {0}")]
    Dbus(#[from] zbus::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("verifier task panicked: {0}")]
    Panicked(String),
}

impl AuthError {
    /// Errors that end the session before any verifier runs.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            AuthError::Config(_)
                | AuthError::LockOpen { .. }
                | AuthError::LockFailed { .. }
                | AuthError::LockTimeout { .. }
        )
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
