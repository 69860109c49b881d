//! Authentication arbiter for the kagami PAM stack.
//!
//! One call to [`authenticator::Authenticator::authenticate`] evaluates the
//! environment guards, takes the machine-wide lock, and races face and
//! fingerprint verification to a single verdict within a bounded time.

pub mod arbiter;
pub mod audit;
pub mod authenticator;
pub mod cancel;
pub mod capture;
pub mod dlib;
pub mod engine;
pub mod errors;
pub mod face;
pub mod fingerprint;
pub mod fprintd;
pub mod guard;
pub mod lock;
pub mod logind;
pub mod matcher;
pub mod store;

pub use arbiter::{Arbiter, Eligibility, FailureReason, FnTask, RaceReport, VerifierOutcome, VerifierTask};
pub use audit::{AuditEvent, AuditSink, AuthMethod, MemoryAuditSink, TracingAuditSink};
pub use authenticator::{Authenticator, SessionRequest, Verdict};
pub use cancel::CancelToken;
pub use errors::{AuthError, AuthResult};
pub use guard::{GuardDecision, GuardProbe, GuardReason, GuardStage, SessionFacts};
pub use matcher::{cosine_distance, EnrolledIdentity, MatchResult, MatchVerdict};
pub use store::{validate_user_name, FilesystemModelCache, ModelCache};
