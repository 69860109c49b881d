use std::sync::Arc;
use std::time::Duration;

use kagami_config::{load_resolved_config, ResolvedConfig};
use kagami_core::audit::{AuditEvent, MemoryAuditSink};
use kagami_core::authenticator::{Authenticator, SessionRequest, Verdict};
use kagami_core::guard::SessionFacts;
use serde::Serialize;

use crate::cli::AuthArgs;
use crate::errors::AppResult;

#[derive(Debug, Clone)]
pub struct AuthRunConfig {
    pub user: String,
    pub timeout: Option<Duration>,
}

impl From<&AuthArgs> for AuthRunConfig {
    fn from(args: &AuthArgs) -> Self {
        Self {
            user: args.user.clone().unwrap_or_else(whoami::username),
            timeout: args.timeout_secs.map(|secs| Duration::from_secs(secs.max(1))),
        }
    }
}

impl AuthRunConfig {
    pub fn apply(&self, config: &mut ResolvedConfig) {
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthSummary {
    pub user: String,
    pub success: bool,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<&'static str>,
    pub reason: &'static str,
    pub elapsed_ms: u64,
    pub audit: Vec<String>,
}

impl AuthSummary {
    pub fn from_verdict(user: &str, verdict: &Verdict, events: &[AuditEvent]) -> Self {
        let (outcome, method) = match verdict {
            Verdict::Success { method, .. } => ("success", Some(method.as_str())),
            Verdict::Failure { .. } => ("failure", None),
            Verdict::Skipped { .. } => ("skipped", None),
        };
        Self {
            user: user.to_string(),
            success: verdict.is_success(),
            outcome,
            method,
            reason: verdict.reason(),
            elapsed_ms: verdict.elapsed().as_millis() as u64,
            audit: events.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Runs one full authentication the way the PAM module would, with audit
/// events collected for the report instead of sent to syslog.
pub fn run_auth(config: &AuthRunConfig) -> AppResult<AuthSummary> {
    let mut resolved = load_resolved_config()?.resolved;
    config.apply(&mut resolved);
    tracing::info!(
        target: "kagami::cli",
        user = %config.user,
        timeout_ms = resolved.timeout.as_millis() as u64,
        "starting authentication"
    );

    let audit = Arc::new(MemoryAuditSink::new());
    let authenticator = Authenticator::with_system_defaults(resolved, audit.clone());
    let facts = SessionFacts::from_environment(false, None);
    let verdict = authenticator.authenticate(&SessionRequest::new(config.user.as_str(), facts))?;
    Ok(AuthSummary::from_verdict(&config.user, &verdict, &audit.events()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kagami_core::arbiter::{Eligibility, FailureReason};
    use kagami_core::audit::AuthMethod;
    use kagami_core::guard::{GuardReason, GuardStage};

    #[test]
    fn timeout_override_has_a_floor_of_one_second() {
        let config = AuthRunConfig::from(&AuthArgs {
            user: Some("alice".into()),
            timeout_secs: Some(0),
        });
        let mut resolved = ResolvedConfig::default();
        config.apply(&mut resolved);
        assert_eq!(resolved.timeout, Duration::from_secs(1));
        assert_eq!(config.user, "alice");
    }

    #[test]
    fn summary_reports_winner_and_audit_lines() {
        let verdict = Verdict::Success {
            method: AuthMethod::Face,
            elapsed: Duration::from_millis(1234),
        };
        let events = vec![
            AuditEvent::Attempt {
                user: "alice".into(),
            },
            AuditEvent::Success {
                user: "alice".into(),
                method: AuthMethod::Face,
                duration: Duration::from_millis(1234),
            },
        ];
        let summary = AuthSummary::from_verdict("alice", &verdict, &events);
        assert!(summary.success);
        assert_eq!(summary.outcome, "success");
        assert_eq!(summary.method, Some("face"));
        assert_eq!(summary.elapsed_ms, 1234);
        assert_eq!(summary.audit.len(), 2);
        assert!(summary.audit[1].starts_with("AUTH_SUCCESS"));
    }

    #[test]
    fn summary_for_failure_and_skip() {
        let failure = Verdict::Failure {
            methods: Eligibility {
                face: true,
                fingerprint: false,
            },
            reason: FailureReason::FaceTimeoutOrNoMatch,
            elapsed: Duration::from_secs(5),
        };
        let summary = AuthSummary::from_verdict("bob", &failure, &[]);
        assert_eq!(summary.outcome, "failure");
        assert_eq!(summary.reason, "face_timeout_or_no_match");
        assert!(summary.method.is_none());

        let skipped = Verdict::Skipped {
            stage: GuardStage::Locked,
            reason: GuardReason::LidClosed,
            elapsed: Duration::ZERO,
        };
        let summary = AuthSummary::from_verdict("bob", &skipped, &[]);
        assert_eq!(summary.outcome, "skipped");
        assert_eq!(summary.reason, "lid_closed");
    }
}
