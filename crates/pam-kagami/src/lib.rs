//! PAM entry points. `pam_sm_authenticate` hands the session to the
//! kagami arbiter and maps its verdict onto PAM return codes.

mod conversation;
mod logger;

use std::ffi::{c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use kagami_config::{load_resolved_config, ConfigError};
use kagami_core::arbiter::FailureReason;
use kagami_core::authenticator::{Authenticator, SessionRequest, Verdict};
use kagami_core::errors::AuthError;
use kagami_core::guard::SessionFacts;
use kagami_core::store::validate_user_name;
use libc::{c_char, c_int};
use nix::unistd::User;
use pam_sys::{get_item, get_user, PamHandle, PamItemType, PamMessageStyle, PamReturnCode};
use thiserror::Error;

use crate::conversation::PamConversationMessenger;
pub use crate::logger::{subscriber, PamLogger, SyslogMakeWriter};

#[derive(Debug, Error)]
pub enum PamError {
    #[error("{0}")]
    Pam(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Core(#[from] AuthError),
}

type PamResult<T> = Result<T, PamError>;

/// # Safety
/// The PAM stack guarantees `pamh` is a valid pointer for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn pam_sm_authenticate(
    pamh: *mut PamHandle,
    _flags: c_int,
    _argc: c_int,
    _argv: *const *const c_char,
) -> c_int {
    let handle = AssertUnwindSafe(pamh);
    let result = panic::catch_unwind(move || {
        let pamh = handle;
        unsafe { authenticate_entry(pamh.0) }
    });
    match result {
        Ok(code) => code as c_int,
        Err(_) => {
            PamLogger::new("unknown").error("authentication panicked; denying");
            PamReturnCode::AUTH_ERR as c_int
        }
    }
}

unsafe fn authenticate_entry(pamh: *mut PamHandle) -> PamReturnCode {
    let (service, service_err) = match get_service_name(pamh) {
        Ok(name) => (name, None),
        Err(err) => ("unknown".to_string(), Some(err)),
    };
    let logger = Arc::new(PamLogger::new(&service));
    if let Some(err) = service_err {
        logger.warn(&format!("Failed to read PAM service name: {err}"));
    }

    let user = match get_user_name(pamh) {
        Ok(user) => user,
        Err(err) => {
            logger.error(&format!("Failed to read PAM user: {err}"));
            return PamReturnCode::USER_UNKNOWN;
        }
    };
    if let Err(err) = ensure_known_user(&user) {
        logger.warn(&format!("Rejecting user '{user}': {err}"));
        return PamReturnCode::USER_UNKNOWN;
    }

    let mut messenger = PamConversationMessenger::new(pamh, &logger);
    let facts = session_facts(pamh);

    let config = match load_resolved_config() {
        Ok(loaded) => {
            match loaded.source.as_deref() {
                Some(path) => logger.debug(&format!("Loaded configuration from {}", path.display())),
                None => logger.debug("No configuration file found; using defaults"),
            }
            loaded.resolved
        }
        Err(err) => {
            logger.error(&format!("Configuration error: {err}"));
            messenger.send(
                &logger,
                PamMessageStyle::ERROR_MSG,
                "Biometric authentication is misconfigured.",
            );
            return PamReturnCode::AUTH_ERR;
        }
    };

    let authenticator = Authenticator::with_system_defaults(config, logger.clone());
    let request = SessionRequest::new(user.as_str(), facts);
    let outcome = tracing::subscriber::with_default(subscriber(logger.clone()), || {
        authenticator.authenticate(&request)
    });

    match outcome {
        Ok(verdict) => {
            if let Some((style, message)) = verdict_message(&verdict) {
                messenger.send(&logger, style, &message);
            }
            pam_code(&verdict)
        }
        Err(err) => {
            logger.error(&format!("Authentication aborted: {err}"));
            if let AuthError::InvalidUser { .. } = err {
                return PamReturnCode::USER_UNKNOWN;
            }
            if err.is_fatal_to_session() {
                messenger.send(
                    &logger,
                    PamMessageStyle::ERROR_MSG,
                    "Biometric authentication is unavailable right now.",
                );
            }
            PamReturnCode::AUTH_ERR
        }
    }
}

fn ensure_known_user(user: &str) -> PamResult<()> {
    validate_user_name(user)?;
    match User::from_name(user) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(PamError::Pam(format!("no passwd entry for '{user}'"))),
        Err(err) => Err(PamError::Pam(format!("passwd lookup failed: {err}"))),
    }
}

unsafe fn session_facts(pamh: *mut PamHandle) -> SessionFacts {
    let credential_present = get_string_item(pamh, PamItemType::AUTHTOK)
        .map(|token| !token.is_empty())
        .unwrap_or(false);
    let rhost = get_string_item(pamh, PamItemType::RHOST);
    SessionFacts::from_environment(credential_present, rhost.as_deref())
}

pub fn pam_code(verdict: &Verdict) -> PamReturnCode {
    if verdict.is_success() {
        PamReturnCode::SUCCESS
    } else {
        PamReturnCode::AUTH_ERR
    }
}

/// User-facing conversation line for a verdict. Guard skips stay silent so
/// the next module in the stack prompts normally.
pub fn verdict_message(verdict: &Verdict) -> Option<(PamMessageStyle, String)> {
    match verdict {
        Verdict::Success { method, .. } => Some((
            PamMessageStyle::TEXT_INFO,
            format!("Authenticated by {method}."),
        )),
        Verdict::Failure { reason, .. } => {
            let text = match reason {
                FailureReason::NoMethodsAvailable => "No biometric method is available.",
                FailureReason::FaceTimeoutOrNoMatch => "Face not recognised.",
                FailureReason::FingerprintTimeoutOrNoMatch => "Fingerprint not recognised.",
                FailureReason::BothTimeoutOrNoMatch => "Face and fingerprint not recognised.",
                FailureReason::SessionError => "Biometric authentication failed.",
            };
            Some((PamMessageStyle::ERROR_MSG, text.to_string()))
        }
        Verdict::Skipped { .. } => None,
    }
}

/// # Safety
/// The PAM stack guarantees `pamh` (even if unused) remains a valid pointer for the call duration.
#[no_mangle]
pub unsafe extern "C" fn pam_sm_setcred(
    _pamh: *mut PamHandle,
    _flags: c_int,
    _argc: c_int,
    _argv: *const *const c_char,
) -> c_int {
    PamReturnCode::SUCCESS as c_int
}

/// # Safety
/// See [`pam_sm_setcred`].
#[no_mangle]
pub unsafe extern "C" fn pam_sm_acct_mgmt(
    _pamh: *mut PamHandle,
    _flags: c_int,
    _argc: c_int,
    _argv: *const *const c_char,
) -> c_int {
    PamReturnCode::SUCCESS as c_int
}

/// # Safety
/// See [`pam_sm_setcred`].
#[no_mangle]
pub unsafe extern "C" fn pam_sm_open_session(
    _pamh: *mut PamHandle,
    _flags: c_int,
    _argc: c_int,
    _argv: *const *const c_char,
) -> c_int {
    PamReturnCode::SUCCESS as c_int
}

/// # Safety
/// See [`pam_sm_setcred`].
#[no_mangle]
pub unsafe extern "C" fn pam_sm_close_session(
    _pamh: *mut PamHandle,
    _flags: c_int,
    _argc: c_int,
    _argv: *const *const c_char,
) -> c_int {
    PamReturnCode::SUCCESS as c_int
}

/// # Safety
/// See [`pam_sm_setcred`].
#[no_mangle]
pub unsafe extern "C" fn pam_sm_chauthtok(
    _pamh: *mut PamHandle,
    _flags: c_int,
    _argc: c_int,
    _argv: *const *const c_char,
) -> c_int {
    PamReturnCode::SUCCESS as c_int
}

unsafe fn get_user_name(pamh: *mut PamHandle) -> PamResult<String> {
    if pamh.is_null() {
        return Err(PamError::Pam("pam handle was null".into()));
    }
    let handle = &*pamh;
    let mut ptr: *const c_char = ptr::null();
    let rc = get_user(handle, &mut ptr, ptr::null());
    if rc != PamReturnCode::SUCCESS {
        return Err(PamError::Pam(format!("pam_get_user failed: {rc}")));
    }
    if ptr.is_null() {
        return Err(PamError::Pam("pam_get_user returned null".into()));
    }
    Ok(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

unsafe fn get_service_name(pamh: *mut PamHandle) -> PamResult<String> {
    get_string_item(pamh, PamItemType::SERVICE)
        .ok_or_else(|| PamError::Pam("PAM service item was unavailable".into()))
}

unsafe fn get_string_item(pamh: *mut PamHandle, item_type: PamItemType) -> Option<String> {
    if pamh.is_null() {
        return None;
    }
    let handle = &*pamh;
    let mut item: *const c_void = ptr::null();
    if get_item(handle, item_type, &mut item) != PamReturnCode::SUCCESS || item.is_null() {
        return None;
    }
    Some(
        CStr::from_ptr(item as *const c_char)
            .to_string_lossy()
            .into_owned(),
    )
}
