//! Audit events emitted once per authentication outcome.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::arbiter::{Eligibility, FailureReason};
use crate::guard::{GuardReason, GuardStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    Face,
    Fingerprint,
}

impl AuthMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMethod::Face => "face",
            AuthMethod::Fingerprint => "fingerprint",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuditEvent {
    Attempt {
        user: String,
    },
    Skipped {
        user: String,
        stage: GuardStage,
        reason: GuardReason,
    },
    Success {
        user: String,
        method: AuthMethod,
        duration: Duration,
    },
    Failure {
        user: String,
        methods: Eligibility,
        reason: FailureReason,
        duration: Duration,
    },
    CrossIdentityMatch {
        claimed: String,
        matched: String,
        distance: f64,
    },
}

impl AuditEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::Attempt { .. } => "AUTH_ATTEMPT",
            AuditEvent::Skipped { .. } => "AUTH_SKIPPED",
            AuditEvent::Success { .. } => "AUTH_SUCCESS",
            AuditEvent::Failure { .. } => "AUTH_FAILURE",
            AuditEvent::CrossIdentityMatch { .. } => "CROSS_IDENTITY_MATCH",
        }
    }

    /// Whether the event deserves a warning rather than an informational line.
    pub fn is_alert(&self) -> bool {
        matches!(self, AuditEvent::CrossIdentityMatch { .. })
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        match self {
            AuditEvent::Attempt { user } => write!(f, " user={user}"),
            AuditEvent::Skipped {
                user,
                stage,
                reason,
            } => write!(f, " user={user} stage={stage} reason={reason}"),
            AuditEvent::Success {
                user,
                method,
                duration,
            } => write!(
                f,
                " user={user} method={method} duration_ms={}",
                duration.as_millis()
            ),
            AuditEvent::Failure {
                user,
                methods,
                reason,
                duration,
            } => write!(
                f,
                " user={user} method={methods} reason={reason} duration_ms={}",
                duration.as_millis()
            ),
            AuditEvent::CrossIdentityMatch {
                claimed,
                matched,
                distance,
            } => write!(f, " claimed={claimed} matched={matched} distance={distance:.4}"),
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Forwards audit events to whatever `tracing` subscriber is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        if event.is_alert() {
            warn!(target: "kagami::audit", "{event}");
        } else {
            info!(target: "kagami::audit", "{event}");
        }
    }
}

/// Keeps every event in memory; used by the CLI report and by tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(AuditEvent::name).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}
