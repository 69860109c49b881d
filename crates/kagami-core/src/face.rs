//! Face verification loop: capture, detect, embed, deduplicate, match.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kagami_config::ResolvedConfig;
use tracing::{debug, warn};

use crate::arbiter::VerifierOutcome;
use crate::audit::{AuditEvent, AuditSink};
use crate::cancel::CancelToken;
use crate::engine::FaceBackend;
use crate::errors::AuthResult;
use crate::matcher::{self, EnrolledIdentity, MatchVerdict};

#[derive(Debug, Clone, PartialEq)]
pub struct FaceMatchConfig {
    pub recognition_threshold: f64,
    pub merge_threshold: f64,
    pub downscale: f32,
    pub confidence: f32,
    pub frame_backoff: Duration,
}

impl FaceMatchConfig {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            recognition_threshold: config.recognition_threshold,
            merge_threshold: config.dedup_merge_threshold,
            downscale: config.detection_downscale,
            confidence: config.detection_confidence,
            frame_backoff: config.frame_backoff,
        }
    }
}

pub struct FaceVerifier {
    backend: Arc<dyn FaceBackend>,
    identities: Arc<Vec<EnrolledIdentity>>,
    settings: FaceMatchConfig,
    audit: Arc<dyn AuditSink>,
}

impl FaceVerifier {
    pub fn new(
        backend: Arc<dyn FaceBackend>,
        identities: Arc<Vec<EnrolledIdentity>>,
        settings: FaceMatchConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            backend,
            identities,
            settings,
            audit,
        }
    }

    /// Runs until the claimed user is recognised, `cancel` fires, or
    /// `deadline` passes. A face that matches a different enrolled identity
    /// never counts; it is audited once per matched identity.
    pub fn run(
        &self,
        username: &str,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> AuthResult<VerifierOutcome> {
        let mut camera = self.backend.open_camera()?;
        let mut engine = self.backend.engine()?;
        engine.load()?;

        let mut frames = 0u32;
        let mut reported = HashSet::new();
        while !cancel.is_cancelled() && Instant::now() < deadline {
            let frame = match camera.capture() {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(target: "kagami::face", error = %err, "frame capture failed; backing off");
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    cancel.sleep(self.settings.frame_backoff.min(remaining));
                    continue;
                }
            };
            frames += 1;
            if cancel.is_cancelled() {
                break;
            }

            let detection =
                engine.detect_cascade(&frame, self.settings.downscale, self.settings.confidence)?;
            if detection.faces.is_empty() {
                continue;
            }
            debug!(
                target: "kagami::face",
                frame = frames,
                faces = detection.faces.len(),
                stage = %detection.stage,
                brightness = detection.brightness,
                "faces detected"
            );

            let embeddings: Vec<_> = engine
                .encode(&detection.processed, &detection.faces)?
                .iter()
                .filter_map(|raw| matcher::normalize(raw))
                .collect();
            for idx in engine.deduplicate(&embeddings, self.settings.merge_threshold) {
                let Some(result) = matcher::best_match(&embeddings[idx], &self.identities) else {
                    continue;
                };
                match result.verdict(username, self.settings.recognition_threshold) {
                    MatchVerdict::Accepted => {
                        if cancel.is_cancelled() {
                            return Ok(VerifierOutcome::failed());
                        }
                        debug!(
                            target: "kagami::face",
                            frame = frames,
                            distance = result.best_distance,
                            "face accepted"
                        );
                        return Ok(VerifierOutcome::succeeded(Some(result.best_identity)));
                    }
                    MatchVerdict::CrossIdentity { matched, distance } => {
                        warn!(
                            target: "kagami::face",
                            claimed = %username,
                            matched = %matched,
                            distance,
                            "face matched a different enrolled identity"
                        );
                        if reported.insert(matched.clone()) {
                            self.audit.record(AuditEvent::CrossIdentityMatch {
                                claimed: username.to_string(),
                                matched,
                                distance,
                            });
                        }
                    }
                    MatchVerdict::NoMatch => {
                        debug!(
                            target: "kagami::face",
                            distance = result.best_distance,
                            closest = %result.best_identity,
                            "no match"
                        );
                    }
                }
            }
        }

        debug!(target: "kagami::face", frames, cancelled = cancel.is_cancelled(), "face verifier finished");
        Ok(VerifierOutcome::failed())
    }
}
