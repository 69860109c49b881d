use std::path::Path;
use std::time::Duration;

use kagami_config::{load_resolved_config, ResolvedConfig};
use kagami_core::errors::AuthError;
use kagami_core::guard::{
    GuardDecision, GuardEvaluator, GuardPolicy, GuardProbe, SessionFacts, SystemProbe,
};
use kagami_core::lock::{holder_pid, SystemLock};
use serde::Serialize;

use crate::cli::GuardsArgs;
use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: &'static str,
    pub proceed: bool,
    pub reason: &'static str,
}

impl From<GuardDecision> for StageReport {
    fn from(decision: GuardDecision) -> Self {
        Self {
            stage: decision.stage.as_str(),
            proceed: decision.proceed,
            reason: decision.reason.as_str(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorReport {
    pub name: String,
    pub internal: bool,
    pub connected: bool,
    pub lit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeFacts {
    pub remote: bool,
    pub camera_accessible: bool,
    pub lid_closed: bool,
    pub lock_screen_active: bool,
    pub connectors: Vec<ConnectorReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardReport {
    pub unlocked: StageReport,
    /// Only evaluated when the first stage lets authentication proceed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked: Option<StageReport>,
    pub facts: ProbeFacts,
}

pub fn run_guards(args: &GuardsArgs) -> AppResult<GuardReport> {
    let resolved = load_resolved_config()?.resolved;
    let probe = SystemProbe::new();
    let facts = SessionFacts::from_environment(false, None);
    run_guards_with(
        &resolved,
        &probe,
        &facts,
        Duration::from_secs(args.lock_timeout_secs),
    )
}

/// Evaluates both stages in the same order and under the same lock as a
/// real authentication, without touching the camera or the reader.
pub fn run_guards_with(
    config: &ResolvedConfig,
    probe: &dyn GuardProbe,
    facts: &SessionFacts,
    lock_timeout: Duration,
) -> AppResult<GuardReport> {
    let evaluator = GuardEvaluator::new(GuardPolicy::from_config(config), probe);
    let unlocked = evaluator.evaluate_unlocked(facts);

    let locked = if unlocked.proceed {
        let _lock = acquire(&config.lock_path, lock_timeout)?;
        Some(StageReport::from(evaluator.evaluate_locked()))
    } else {
        None
    };

    let display = probe.display_state();
    let facts = ProbeFacts {
        remote: facts.remote,
        camera_accessible: probe.camera_accessible(Path::new(&config.video_device)),
        lid_closed: probe.lid_closed(),
        lock_screen_active: probe.lock_screen_active(),
        connectors: display
            .connectors
            .into_iter()
            .map(|connector| ConnectorReport {
                name: connector.name,
                internal: connector.internal,
                connected: connector.connected,
                lit: connector.lit,
            })
            .collect(),
    };

    Ok(GuardReport {
        unlocked: StageReport::from(unlocked),
        locked,
        facts,
    })
}

fn acquire(path: &Path, timeout: Duration) -> AppResult<SystemLock> {
    SystemLock::acquire_timeout(path, timeout).map_err(|err| match err {
        AuthError::LockTimeout { path, .. } => {
            let holder = holder_pid(&path);
            AppError::LockBusy { path, holder }
        }
        other => AppError::Core(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kagami_config::ConfigFile;
    use kagami_core::guard::{Connector, DisplayState};
    use tempfile::tempdir;

    struct StubProbe {
        camera: bool,
        lid_closed: bool,
        lit: bool,
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
            DisplayState {
                connectors: vec![Connector {
                    name: "card0-eDP-1".into(),
                    internal: true,
                    connected: true,
                    lit: self.lit,
                }],
            }
        }
    }

    fn config_with_lock(lock: &Path) -> ResolvedConfig {
        ResolvedConfig::from_raw(ConfigFile {
            lock_path: Some(lock.to_path_buf()),
            ..ConfigFile::default()
        })
    }

    #[test]
    fn both_stages_reported_when_environment_is_clear() {
        let tmp = tempdir().unwrap();
        let config = config_with_lock(&tmp.path().join("kagami.lock"));
        let probe = StubProbe {
            camera: true,
            lid_closed: false,
            lit: true,
        };

        let report =
            run_guards_with(&config, &probe, &SessionFacts::default(), Duration::ZERO).unwrap();
        assert!(report.unlocked.proceed);
        let locked = report.locked.unwrap();
        assert!(locked.proceed);
        assert_eq!(locked.reason, "ok");
        assert_eq!(report.facts.connectors.len(), 1);
    }

    #[test]
    fn locked_stage_skipped_when_first_stage_declines() {
        let tmp = tempdir().unwrap();
        let config = config_with_lock(&tmp.path().join("kagami.lock"));
        let probe = StubProbe {
            camera: false,
            lid_closed: true,
            lit: true,
        };

        let report =
            run_guards_with(&config, &probe, &SessionFacts::default(), Duration::ZERO).unwrap();
        assert!(!report.unlocked.proceed);
        assert_eq!(report.unlocked.reason, "camera_inaccessible");
        assert!(report.locked.is_none());
        assert!(report.facts.lid_closed);
    }

    #[test]
    fn lid_closed_reported_by_locked_stage() {
        let tmp = tempdir().unwrap();
        let config = config_with_lock(&tmp.path().join("kagami.lock"));
        let probe = StubProbe {
            camera: true,
            lid_closed: true,
            lit: false,
        };

        let report =
            run_guards_with(&config, &probe, &SessionFacts::default(), Duration::ZERO).unwrap();
        assert_eq!(report.locked.unwrap().reason, "lid_closed");
    }

    #[test]
    fn busy_lock_names_the_holder() {
        let tmp = tempdir().unwrap();
        let lock_path = tmp.path().join("kagami.lock");
        let config = config_with_lock(&lock_path);
        let _held = SystemLock::acquire(&lock_path).unwrap();
        let probe = StubProbe {
            camera: true,
            lid_closed: false,
            lit: true,
        };

        let err = run_guards_with(
            &config,
            &probe,
            &SessionFacts::default(),
            Duration::from_millis(150),
        )
        .unwrap_err();
        match err {
            AppError::LockBusy { holder, .. } => assert_eq!(holder, Some(std::process::id())),
            other => panic!("unexpected error: {other}"),
        }
    }
}
