//! The per-process authentication context and its control flow.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kagami_config::ResolvedConfig;
use tracing::{debug, info, warn};

use crate::arbiter::{Arbiter, Eligibility, FailureReason, FnTask, VerifierTask};
use crate::audit::{AuditEvent, AuditSink, AuthMethod};
use crate::cancel::CancelToken;
use crate::dlib::DlibFaceBackend;
use crate::engine::FaceBackend;
use crate::errors::AuthResult;
use crate::face::{FaceMatchConfig, FaceVerifier};
use crate::fingerprint::{FingerprintReader, FingerprintVerifier};
use crate::fprintd::FprintdReader;
use crate::guard::{
    GuardDecision, GuardEvaluator, GuardPolicy, GuardProbe, GuardReason, GuardStage, SessionFacts,
    SystemProbe,
};
use crate::lock::SystemLock;
use crate::matcher::EnrolledIdentity;
use crate::store::{validate_user_name, FilesystemModelCache, ModelCache};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub username: String,
    pub facts: SessionFacts,
}

impl SessionRequest {
    pub fn new(username: impl Into<String>, facts: SessionFacts) -> Self {
        Self {
            username: username.into(),
            facts,
        }
    }
}

/// State of one `authenticate()` call. Only `cancel` is shared with the
/// verifier threads.
#[derive(Debug)]
pub struct AuthSession {
    pub username: String,
    pub timeout: Duration,
    pub started_at: Instant,
    pub cancel: CancelToken,
    pub success_method: Option<AuthMethod>,
    pub failure_reason: Option<FailureReason>,
}

impl AuthSession {
    fn new(username: &str, timeout: Duration) -> Self {
        Self {
            username: username.to_string(),
            timeout,
            started_at: Instant::now(),
            cancel: CancelToken::new(),
            success_method: None,
            failure_reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success {
        method: AuthMethod,
        elapsed: Duration,
    },
    Failure {
        methods: Eligibility,
        reason: FailureReason,
        elapsed: Duration,
    },
    Skipped {
        stage: GuardStage,
        reason: GuardReason,
        elapsed: Duration,
    },
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Success { .. })
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Verdict::Success { .. } => "ok",
            Verdict::Failure { reason, .. } => reason.as_str(),
            Verdict::Skipped { reason, .. } => reason.as_str(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Verdict::Success { elapsed, .. }
            | Verdict::Failure { elapsed, .. }
            | Verdict::Skipped { elapsed, .. } => *elapsed,
        }
    }
}

pub struct Authenticator {
    config: ResolvedConfig,
    probe: Box<dyn GuardProbe>,
    models: Arc<dyn ModelCache>,
    face_backend: Arc<dyn FaceBackend>,
    fingerprint: Arc<dyn FingerprintReader>,
    audit: Arc<dyn AuditSink>,
    arbiter: Arbiter,
}

impl Authenticator {
    pub fn new(
        config: ResolvedConfig,
        probe: Box<dyn GuardProbe>,
        models: Arc<dyn ModelCache>,
        face_backend: Arc<dyn FaceBackend>,
        fingerprint: Arc<dyn FingerprintReader>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            probe,
            models,
            face_backend,
            fingerprint,
            audit,
            arbiter: Arbiter::default(),
        }
    }

    /// Wires the production collaborators: procfs/sysfs/logind probes, the
    /// on-disk template store, V4L2 + dlib, and fprintd.
    pub fn with_system_defaults(config: ResolvedConfig, audit: Arc<dyn AuditSink>) -> Self {
        let models = Arc::new(FilesystemModelCache::new(&config.embedding_store_dir));
        let face_backend = Arc::new(DlibFaceBackend::from_config(&config));
        Self::new(
            config,
            Box::new(SystemProbe::new()),
            models,
            face_backend,
            Arc::new(FprintdReader::new()),
            audit,
        )
    }

    pub fn with_arbiter(mut self, arbiter: Arbiter) -> Self {
        self.arbiter = arbiter;
        self
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn guards(&self) -> GuardEvaluator<'_> {
        GuardEvaluator::new(GuardPolicy::from_config(&self.config), self.probe.as_ref())
    }

    /// Stage two requires the caller to hold the system lock.
    pub fn acquire_lock(&self) -> AuthResult<SystemLock> {
        match self.config.lock_timeout {
            Some(timeout) => SystemLock::acquire_timeout(&self.config.lock_path, timeout),
            None => SystemLock::acquire(&self.config.lock_path),
        }
    }

    pub fn authenticate(&self, request: &SessionRequest) -> AuthResult<Verdict> {
        validate_user_name(&request.username)?;
        let user = request.username.as_str();
        let mut session = AuthSession::new(user, self.config.timeout);
        self.audit.record(AuditEvent::Attempt {
            user: user.to_string(),
        });

        let guards = self.guards();
        let stage_one = guards.evaluate_unlocked(&request.facts);
        if !stage_one.proceed {
            return Ok(self.skipped(&session, stage_one));
        }

        let lock = match self.acquire_lock() {
            Ok(lock) => lock,
            Err(err) => {
                self.record_failure(&session, Eligibility::default(), FailureReason::SessionError);
                return Err(err);
            }
        };

        let stage_two = guards.evaluate_locked();
        if !stage_two.proceed {
            drop(lock);
            return Ok(self.skipped(&session, stage_two));
        }

        let tasks = self.eligible_tasks(&session);
        if tasks.is_empty() {
            drop(lock);
            session.failure_reason = Some(FailureReason::NoMethodsAvailable);
            return Ok(self.finish(&session, Eligibility::default()));
        }

        let deadline = session.started_at + session.timeout;
        let report = self.arbiter.race(tasks, deadline, &session.cancel);
        drop(lock);

        session.success_method = report.winner;
        session.failure_reason = report.failure_reason();
        if let Some(matched) = report.matched_username.as_deref() {
            if matched != user {
                warn!(target: "kagami::arbiter", claimed = %user, matched = %matched, "winner reported a different identity");
            }
        }
        Ok(self.finish(&session, report.eligible))
    }

    fn eligible_tasks(&self, session: &AuthSession) -> Vec<Box<dyn VerifierTask>> {
        let mut tasks = Vec::new();

        if let Some(identities) = self.face_identities(&session.username) {
            let verifier = FaceVerifier::new(
                Arc::clone(&self.face_backend),
                identities,
                FaceMatchConfig::from_config(&self.config),
                Arc::clone(&self.audit),
            );
            let username = session.username.clone();
            tasks.push(FnTask::boxed(AuthMethod::Face, move |deadline, cancel| {
                verifier.run(&username, deadline, cancel)
            }));
        }

        if self.config.fingerprint_enabled && self.fingerprint.is_available() {
            let verifier = FingerprintVerifier::new(
                Arc::clone(&self.fingerprint),
                self.config.fingerprint_head_start,
            );
            let username = session.username.clone();
            tasks.push(FnTask::boxed(
                AuthMethod::Fingerprint,
                move |deadline, cancel| verifier.run(&username, deadline, cancel),
            ));
        } else {
            debug!(
                target: "kagami::arbiter",
                enabled = self.config.fingerprint_enabled,
                "fingerprint not eligible"
            );
        }

        tasks
    }

    /// All enrolled identities, but only when the claimed user has templates.
    fn face_identities(&self, username: &str) -> Option<Arc<Vec<EnrolledIdentity>>> {
        if !self.models.has_model(username) {
            debug!(target: "kagami::arbiter", user = %username, "no face enrollment");
            return None;
        }
        let identities = match self.models.load_all_parallel(self.config.cache_load_threads) {
            Ok(identities) => identities,
            Err(err) => {
                warn!(target: "kagami::arbiter", error = %err, "failed to load face templates");
                return None;
            }
        };
        let enrolled = identities
            .iter()
            .any(|identity| identity.username == username && !identity.templates.is_empty());
        if enrolled {
            Some(Arc::new(identities))
        } else {
            debug!(target: "kagami::arbiter", user = %username, "face templates unusable");
            None
        }
    }

    fn skipped(&self, session: &AuthSession, decision: GuardDecision) -> Verdict {
        info!(
            target: "kagami::guard",
            user = %session.username,
            stage = %decision.stage,
            reason = %decision.reason,
            "biometric authentication skipped"
        );
        self.audit.record(AuditEvent::Skipped {
            user: session.username.clone(),
            stage: decision.stage,
            reason: decision.reason,
        });
        Verdict::Skipped {
            stage: decision.stage,
            reason: decision.reason,
            elapsed: session.started_at.elapsed(),
        }
    }

    fn finish(&self, session: &AuthSession, methods: Eligibility) -> Verdict {
        let elapsed = session.started_at.elapsed();
        match session.success_method {
            Some(method) => {
                self.audit.record(AuditEvent::Success {
                    user: session.username.clone(),
                    method,
                    duration: elapsed,
                });
                Verdict::Success { method, elapsed }
            }
            None => {
                let reason = session
                    .failure_reason
                    .unwrap_or_else(|| methods.failure_reason());
                self.record_failure(session, methods, reason);
                Verdict::Failure {
                    methods,
                    reason,
                    elapsed,
                }
            }
        }
    }

    fn record_failure(&self, session: &AuthSession, methods: Eligibility, reason: FailureReason) {
        self.audit.record(AuditEvent::Failure {
            user: session.username.clone(),
            methods,
            reason,
            duration: session.started_at.elapsed(),
        });
    }
}
