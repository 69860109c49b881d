use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use kagami_config::ConfigError;
use kagami_core::errors::AuthError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Core(#[from] AuthError),

    #[error("system lock {path} is busy{}", holder_suffix(.holder))]
    LockBusy { path: PathBuf, holder: Option<u32> },

    #[error("device capability error: {0}")]
    Capability(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn holder_suffix(holder: &Option<u32>) -> String {
    holder
        .map(|pid| format!(" (held by pid {pid})"))
        .unwrap_or_default()
}

impl AppError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            AppError::Config(_) => ExitCode::from(2),
            AppError::Core(AuthError::InvalidUser { .. }) => ExitCode::from(2),
            AppError::Core(AuthError::MissingModel { .. }) => ExitCode::from(2),
            AppError::Core(AuthError::ModelLoad { .. }) => ExitCode::from(2),
            AppError::Core(AuthError::InvalidTemplateFile { .. }) => ExitCode::from(2),
            AppError::Core(AuthError::LockTimeout { .. }) => ExitCode::from(3),
            AppError::LockBusy { .. } => ExitCode::from(3),
            AppError::Capability(_) => ExitCode::from(3),
            AppError::Core(AuthError::DeviceOpen { .. }) => ExitCode::from(4),
            _ => ExitCode::from(1),
        }
    }

    pub fn human_message(&self) -> String {
        self.to_string()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_busy_mentions_holder() {
        let err = AppError::LockBusy {
            path: PathBuf::from("/run/kagami.lock"),
            holder: Some(4242),
        };
        assert_eq!(
            err.human_message(),
            "system lock /run/kagami.lock is busy (held by pid 4242)"
        );
        assert_eq!(err.exit_code(), ExitCode::from(3));
    }

    #[test]
    fn invalid_user_is_a_usage_error() {
        let err = AppError::from(AuthError::InvalidUser {
            user: "../x".into(),
            message: "bad".into(),
        });
        assert_eq!(err.exit_code(), ExitCode::from(2));
    }
}
