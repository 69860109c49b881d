use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use image::GrayImage;
use kagami_config::ResolvedConfig;
use kagami_core::arbiter::{Eligibility, FailureReason};
use kagami_core::audit::{AuditEvent, AuthMethod, MemoryAuditSink};
use kagami_core::authenticator::{Authenticator, SessionRequest, Verdict};
use kagami_core::cancel::CancelToken;
use kagami_core::engine::{
    Camera, CascadeDetection, CascadeStage, DetectionEngine, FaceBackend, FaceRect, Frame,
};
use kagami_core::errors::{AuthError, AuthResult};
use kagami_core::fingerprint::{ClaimedReader, FingerprintReader};
use kagami_core::guard::{DisplayState, GuardProbe, GuardReason, GuardStage, SessionFacts};
use kagami_core::lock::{self, SystemLock};
use kagami_core::matcher::Embedding;
use kagami_core::store::FilesystemModelCache;
use tempfile::TempDir;

struct StubProbe {
    camera: bool,
    lid_closed: bool,
}

impl GuardProbe for StubProbe {
    fn camera_accessible(&self, _device: &Path) -> bool {
        self.camera
    }

    fn lid_closed(&self) -> bool {
        self.lid_closed
    }

    fn lock_screen_active(&self) -> bool {
        false
    }

    fn display_state(&self) -> DisplayState {
        DisplayState::default()
    }
}

struct StubCamera {
    frame_time: Duration,
    open: Arc<AtomicUsize>,
}

impl Camera for StubCamera {
    fn capture(&mut self) -> AuthResult<Frame> {
        thread::sleep(self.frame_time);
        Ok(GrayImage::new(4, 4))
    }
}

impl Drop for StubCamera {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sees the same face in every frame.
struct StubEngine {
    face: Option<Embedding>,
}

impl DetectionEngine for StubEngine {
    fn load(&mut self) -> AuthResult<()> {
        Ok(())
    }

    fn detect_cascade(&self, frame: &Frame, _: f32, _: f32) -> AuthResult<CascadeDetection> {
        let faces = match self.face {
            Some(_) => vec![FaceRect {
                left: 0,
                top: 0,
                right: 4,
                bottom: 4,
            }],
            None => Vec::new(),
        };
        Ok(CascadeDetection {
            faces,
            processed: frame.clone(),
            stage: CascadeStage::Direct,
            brightness: 120.0,
        })
    }

    fn encode(&self, _frame: &Frame, faces: &[FaceRect]) -> AuthResult<Vec<Embedding>> {
        Ok(faces
            .iter()
            .filter_map(|_| self.face.clone())
            .collect())
    }
}

#[derive(Default)]
struct StubBackend {
    face: Option<Embedding>,
    frame_time: Option<Duration>,
    opened: AtomicUsize,
    open_now: Arc<AtomicUsize>,
}

impl FaceBackend for StubBackend {
    fn open_camera(&self) -> AuthResult<Box<dyn Camera>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.open_now.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubCamera {
            frame_time: self.frame_time.unwrap_or(Duration::from_millis(10)),
            open: Arc::clone(&self.open_now),
        }))
    }

    fn engine(&self) -> AuthResult<Box<dyn DetectionEngine>> {
        Ok(Box::new(StubEngine {
            face: self.face.clone(),
        }))
    }
}

#[derive(Default)]
struct StubReader {
    available: bool,
    matches: bool,
    claims: AtomicUsize,
    releases: Arc<AtomicUsize>,
}

struct StubClaim {
    matches: bool,
    releases: Arc<AtomicUsize>,
}

impl ClaimedReader for StubClaim {
    fn verify(&mut self, timeout: Duration, cancel: &CancelToken) -> AuthResult<bool> {
        if self.matches {
            return Ok(true);
        }
        cancel.sleep(timeout);
        Ok(false)
    }

    fn release(&mut self) -> AuthResult<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl FingerprintReader for StubReader {
    fn is_available(&self) -> bool {
        self.available
    }

    fn claim(&self, _username: &str) -> AuthResult<Box<dyn ClaimedReader + '_>> {
        self.claims.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubClaim {
            matches: self.matches,
            releases: Arc::clone(&self.releases),
        }))
    }
}

struct Fixture {
    dir: TempDir,
    config: ResolvedConfig,
    audit: Arc<MemoryAuditSink>,
    backend: Arc<StubBackend>,
    reader: Arc<StubReader>,
}

const ALICE: [f64; 3] = [1.0, 0.0, 0.0];
const BOB: [f64; 3] = [0.0, 1.0, 0.0];

impl Fixture {
    fn new(face: Option<&[f64]>, reader: StubReader) -> Self {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("models");
        fs::create_dir_all(store.join("bob")).unwrap();
        fs::write(store.join("alice.json"), r#"[{"id":"a","embedding":[1.0,0.0,0.0]}]"#).unwrap();
        fs::write(store.join("bob/front.json"), r#"[{"embedding":[0.0,1.0,0.0]}]"#).unwrap();

        let mut config = ResolvedConfig::default();
        config.embedding_store_dir = store;
        config.lock_path = dir.path().join("kagami.lock");
        config.timeout = Duration::from_secs(1);
        config.frame_backoff = Duration::from_millis(5);
        config.fingerprint_head_start = Duration::ZERO;
        config.fingerprint_enabled = reader.available;

        Self {
            dir,
            config,
            audit: Arc::new(MemoryAuditSink::new()),
            backend: Arc::new(StubBackend {
                face: face.map(<[f64]>::to_vec),
                ..StubBackend::default()
            }),
            reader: Arc::new(reader),
        }
    }

    fn authenticator(&self, probe: StubProbe) -> Authenticator {
        Authenticator::new(
            self.config.clone(),
            Box::new(probe),
            Arc::new(FilesystemModelCache::new(&self.config.embedding_store_dir)),
            self.backend.clone(),
            self.reader.clone(),
            self.audit.clone(),
        )
    }

    fn lock_path(&self) -> &Path {
        &self.config.lock_path
    }
}

fn ready_probe() -> StubProbe {
    StubProbe {
        camera: true,
        lid_closed: false,
    }
}

fn local(user: &str) -> SessionRequest {
    SessionRequest::new(user, SessionFacts::default())
}

#[test]
fn face_match_succeeds_and_releases_lock() {
    let fixture = Fixture::new(Some(&ALICE[..]), StubReader::default());
    let verdict = fixture
        .authenticator(ready_probe())
        .authenticate(&local("alice"))
        .unwrap();

    assert!(matches!(
        verdict,
        Verdict::Success {
            method: AuthMethod::Face,
            ..
        }
    ));
    assert_eq!(fixture.audit.names(), vec!["AUTH_ATTEMPT", "AUTH_SUCCESS"]);
    assert!(!lock::is_held(fixture.lock_path()).unwrap());
    assert!(fixture.dir.path().join("kagami.lock").exists());
}

#[test]
fn no_methods_available_never_touches_devices() {
    let fixture = Fixture::new(Some(&ALICE[..]), StubReader::default());
    let started = Instant::now();
    let verdict = fixture
        .authenticator(ready_probe())
        .authenticate(&local("carol"))
        .unwrap();

    assert_eq!(
        verdict,
        Verdict::Failure {
            methods: Eligibility::default(),
            reason: FailureReason::NoMethodsAvailable,
            elapsed: verdict.elapsed(),
        }
    );
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(fixture.backend.opened.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.reader.claims.load(Ordering::SeqCst), 0);
}

#[test]
fn cross_identity_match_never_succeeds() {
    let fixture = Fixture::new(Some(&BOB[..]), StubReader::default());
    let started = Instant::now();
    let verdict = fixture
        .authenticator(ready_probe())
        .authenticate(&local("alice"))
        .unwrap();

    assert_eq!(verdict.reason(), "face_timeout_or_no_match");
    assert!(started.elapsed() <= Duration::from_millis(1300));
    let events = fixture.audit.events();
    assert!(events.contains(&AuditEvent::CrossIdentityMatch {
        claimed: "alice".into(),
        matched: "bob".into(),
        distance: 0.0,
    }));
    assert_eq!(
        fixture.audit.names(),
        vec!["AUTH_ATTEMPT", "CROSS_IDENTITY_MATCH", "AUTH_FAILURE"]
    );
}

#[test]
fn fingerprint_wins_when_face_sees_nobody() {
    let fixture = Fixture::new(
        None,
        StubReader {
            available: true,
            matches: true,
            ..StubReader::default()
        },
    );
    let verdict = fixture
        .authenticator(ready_probe())
        .authenticate(&local("alice"))
        .unwrap();

    assert!(matches!(
        verdict,
        Verdict::Success {
            method: AuthMethod::Fingerprint,
            ..
        }
    ));
    assert_eq!(fixture.reader.claims.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.reader.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn fast_face_match_never_claims_the_reader() {
    let mut fixture = Fixture::new(
        Some(&ALICE[..]),
        StubReader {
            available: true,
            matches: true,
            ..StubReader::default()
        },
    );
    fixture.config.fingerprint_head_start = Duration::from_millis(500);
    let verdict = fixture
        .authenticator(ready_probe())
        .authenticate(&local("alice"))
        .unwrap();
    assert!(matches!(
        verdict,
        Verdict::Success {
            method: AuthMethod::Face,
            ..
        }
    ));

    assert_eq!(fixture.reader.claims.load(Ordering::SeqCst), 0);
}

#[test]
fn losing_camera_is_closed_before_authenticate_returns() {
    let mut fixture = Fixture::new(
        None,
        StubReader {
            available: true,
            matches: true,
            ..StubReader::default()
        },
    );
    fixture.config.timeout = Duration::from_secs(5);
    fixture.config.fingerprint_head_start = Duration::from_millis(50);
    Arc::get_mut(&mut fixture.backend).unwrap().frame_time = Some(Duration::from_millis(400));

    let verdict = fixture
        .authenticator(ready_probe())
        .authenticate(&local("alice"))
        .unwrap();
    assert!(matches!(
        verdict,
        Verdict::Success {
            method: AuthMethod::Fingerprint,
            ..
        }
    ));

    assert_eq!(fixture.backend.opened.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.backend.open_now.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.reader.releases.load(Ordering::SeqCst), 1);
    assert!(SystemLock::try_acquire(fixture.lock_path()).unwrap().is_some());
}

#[test]
fn timeout_counts_from_session_start() {
    let mut fixture = Fixture::new(None, StubReader::default());
    fixture.config.timeout = Duration::from_millis(400);

    let started = Instant::now();
    let verdict = fixture
        .authenticator(ready_probe())
        .authenticate(&local("alice"))
        .unwrap();
    assert!(matches!(verdict, Verdict::Failure { .. }));
    assert!(started.elapsed() < Duration::from_millis(900));
}

#[test]
fn fingerprint_only_failure_reason() {
    let fixture = Fixture::new(
        None,
        StubReader {
            available: true,
            matches: false,
            ..StubReader::default()
        },
    );
    let verdict = fixture
        .authenticator(ready_probe())
        .authenticate(&local("carol"))
        .unwrap();
    assert_eq!(verdict.reason(), "fingerprint_timeout_or_no_match");
}

#[test]
fn missing_camera_fails_fast_without_the_lock() {
    let fixture = Fixture::new(Some(&ALICE[..]), StubReader::default());
    let _held = SystemLock::acquire(fixture.lock_path()).unwrap();

    let started = Instant::now();
    let verdict = fixture
        .authenticator(StubProbe {
            camera: false,
            lid_closed: false,
        })
        .authenticate(&local("alice"))
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(matches!(
        verdict,
        Verdict::Skipped {
            stage: GuardStage::Unlocked,
            reason: GuardReason::CameraInaccessible,
            ..
        }
    ));
    assert_eq!(fixture.backend.opened.load(Ordering::SeqCst), 0);
}

#[test]
fn lid_closed_skips_and_releases_the_lock() {
    let fixture = Fixture::new(Some(&ALICE[..]), StubReader::default());
    let verdict = fixture
        .authenticator(StubProbe {
            camera: true,
            lid_closed: true,
        })
        .authenticate(&local("alice"))
        .unwrap();

    assert_eq!(verdict.reason(), "lid_closed");
    assert!(!lock::is_held(fixture.lock_path()).unwrap());
    assert_eq!(fixture.audit.names(), vec!["AUTH_ATTEMPT", "AUTH_SKIPPED"]);
}

#[test]
fn credential_present_skips_before_anything_else() {
    let fixture = Fixture::new(Some(&ALICE[..]), StubReader::default());
    let request = SessionRequest::new(
        "alice",
        SessionFacts {
            credential_present: true,
            remote: true,
        },
    );
    let verdict = fixture
        .authenticator(ready_probe())
        .authenticate(&request)
        .unwrap();
    assert_eq!(verdict.reason(), "password_already_present");
}

#[test]
fn lock_timeout_is_fatal_and_audited() {
    let mut fixture = Fixture::new(Some(&ALICE[..]), StubReader::default());
    fixture.config.lock_timeout = Some(Duration::from_millis(200));
    let _held = SystemLock::acquire(fixture.lock_path()).unwrap();

    let err = fixture
        .authenticator(ready_probe())
        .authenticate(&local("alice"))
        .unwrap_err();
    assert!(matches!(err, AuthError::LockTimeout { .. }));
    assert!(err.is_fatal_to_session());
    assert_eq!(fixture.audit.names(), vec!["AUTH_ATTEMPT", "AUTH_FAILURE"]);
}

#[test]
fn invalid_user_name_is_rejected() {
    let fixture = Fixture::new(Some(&ALICE[..]), StubReader::default());
    let err = fixture
        .authenticator(ready_probe())
        .authenticate(&local("../root"))
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidUser { .. }));
    assert!(fixture.audit.events().is_empty());
}
