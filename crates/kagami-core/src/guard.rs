//! Environmental preconditions checked before and after taking the system lock.

use std::ffi::CString;
use std::fmt;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use kagami_config::ResolvedConfig;
use tracing::debug;

use crate::logind::LogindInspector;

const REMOTE_ENV_KEYS: [&str; 3] = ["SSH_CONNECTION", "SSH_CLIENT", "SSH_TTY"];
const INTERNAL_CONNECTORS: [&str; 3] = ["eDP", "LVDS", "DSI"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardReason {
    PasswordAlreadyPresent,
    RemoteSession,
    CameraInaccessible,
    LidClosed,
    DisplayOff,
    ExternalMonitorOnly,
    Ok,
}

impl GuardReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardReason::PasswordAlreadyPresent => "password_already_present",
            GuardReason::RemoteSession => "remote_session",
            GuardReason::CameraInaccessible => "camera_inaccessible",
            GuardReason::LidClosed => "lid_closed",
            GuardReason::DisplayOff => "display_off",
            GuardReason::ExternalMonitorOnly => "external_monitor_only",
            GuardReason::Ok => "ok",
        }
    }
}

impl fmt::Display for GuardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage one runs before the system lock is taken, stage two while it is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardStage {
    Unlocked,
    Locked,
}

impl GuardStage {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardStage::Unlocked => "unlocked",
            GuardStage::Locked => "locked",
        }
    }
}

impl fmt::Display for GuardStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardDecision {
    pub stage: GuardStage,
    pub proceed: bool,
    pub reason: GuardReason,
}

impl GuardDecision {
    fn ok(stage: GuardStage) -> Self {
        Self {
            stage,
            proceed: true,
            reason: GuardReason::Ok,
        }
    }

    fn skip(stage: GuardStage, reason: GuardReason) -> Self {
        Self {
            stage,
            proceed: false,
            reason,
        }
    }
}

/// Facts about the PAM conversation that the first guard stage needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFacts {
    pub credential_present: bool,
    pub remote: bool,
}

impl SessionFacts {
    pub fn from_environment(credential_present: bool, rhost: Option<&str>) -> Self {
        Self {
            credential_present,
            remote: is_remote_session(rhost, |key| std::env::var_os(key).is_some()),
        }
    }
}

/// A session is remote when PAM reports a non-local remote host or an SSH
/// connection is visible in the environment.
pub fn is_remote_session(rhost: Option<&str>, env_has: impl Fn(&str) -> bool) -> bool {
    let remote_host = rhost
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .is_some_and(|host| !is_local_host(host));
    remote_host || REMOTE_ENV_KEYS.iter().any(|key| env_has(key))
}

fn is_local_host(host: &str) -> bool {
    host == "localhost" || host == "::1" || host.starts_with("127.")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connector {
    pub name: String,
    pub internal: bool,
    pub connected: bool,
    pub lit: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayState {
    pub connectors: Vec<Connector>,
}

impl DisplayState {
    fn connected(&self) -> impl Iterator<Item = &Connector> + '_ {
        self.connectors.iter().filter(|c| c.connected)
    }

    /// At least one connected output and none of them lit. Machines without
    /// DRM connectors (headless VMs) never count as dark.
    pub fn all_dark(&self) -> bool {
        let mut connected = self.connected().peekable();
        connected.peek().is_some() && connected.all(|c| !c.lit)
    }

    pub fn external_only(&self) -> bool {
        let mut internal = self.connected().filter(|c| c.internal).peekable();
        let has_internal = internal.peek().is_some();
        let internal_dark = internal.all(|c| !c.lit);
        let external_lit = self.connected().any(|c| !c.internal && c.lit);
        has_internal && internal_dark && external_lit
    }
}

pub trait GuardProbe: Send + Sync {
    fn camera_accessible(&self, device: &Path) -> bool;
    fn lid_closed(&self) -> bool;
    fn lock_screen_active(&self) -> bool;
    fn display_state(&self) -> DisplayState;
}

#[derive(Debug, Clone)]
pub struct GuardPolicy {
    pub video_device: PathBuf,
    pub lid_closed: bool,
    pub display_off: bool,
    pub external_monitor_only: bool,
    pub greeter_display_delay: Duration,
}

impl GuardPolicy {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            video_device: PathBuf::from(&config.video_device),
            lid_closed: config.guard_lid_closed,
            display_off: config.guard_display_off,
            external_monitor_only: config.guard_external_monitor_only,
            greeter_display_delay: config.greeter_display_delay,
        }
    }
}

pub struct GuardEvaluator<'a> {
    policy: GuardPolicy,
    probe: &'a dyn GuardProbe,
}

impl<'a> GuardEvaluator<'a> {
    pub fn new(policy: GuardPolicy, probe: &'a dyn GuardProbe) -> Self {
        Self { policy, probe }
    }

    /// First matching condition wins.
    pub fn evaluate_unlocked(&self, facts: &SessionFacts) -> GuardDecision {
        let stage = GuardStage::Unlocked;
        let decision = if facts.credential_present {
            GuardDecision::skip(stage, GuardReason::PasswordAlreadyPresent)
        } else if facts.remote {
            GuardDecision::skip(stage, GuardReason::RemoteSession)
        } else if !self.probe.camera_accessible(&self.policy.video_device) {
            GuardDecision::skip(stage, GuardReason::CameraInaccessible)
        } else {
            GuardDecision::ok(stage)
        };
        debug!(target: "kagami::guard", stage = %stage, reason = %decision.reason, "guard evaluated");
        decision
    }

    /// Must be called with the system lock held.
    pub fn evaluate_locked(&self) -> GuardDecision {
        let stage = GuardStage::Locked;
        let decision = if self.policy.lid_closed && self.probe.lid_closed() {
            GuardDecision::skip(stage, GuardReason::LidClosed)
        } else if self.policy.display_off && self.display_dark() {
            GuardDecision::skip(stage, GuardReason::DisplayOff)
        } else if self.policy.external_monitor_only && self.probe.display_state().external_only()
        {
            GuardDecision::skip(stage, GuardReason::ExternalMonitorOnly)
        } else {
            GuardDecision::ok(stage)
        };
        debug!(target: "kagami::guard", stage = %stage, reason = %decision.reason, "guard evaluated");
        decision
    }

    fn display_dark(&self) -> bool {
        let delay = self.policy.greeter_display_delay;
        if !delay.is_zero() && self.probe.lock_screen_active() {
            debug!(target: "kagami::guard", delay_ms = delay.as_millis() as u64, "waiting for greeter display");
            thread::sleep(delay);
        }
        self.probe.display_state().all_dark()
    }
}

/// Probes the running system through procfs, sysfs and logind.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    proc_root: PathBuf,
    sys_root: PathBuf,
    logind: LogindInspector,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::with_roots("/proc", "/sys")
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roots(proc_root: impl Into<PathBuf>, sys_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            sys_root: sys_root.into(),
            logind: LogindInspector::new(),
        }
    }

    fn backlight_blanked(&self) -> bool {
        let Ok(entries) = fs::read_dir(self.sys_root.join("class/backlight")) else {
            return false;
        };
        let powers: Vec<String> = entries
            .flatten()
            .filter_map(|entry| read_trimmed(&entry.path().join("bl_power")))
            .collect();
        !powers.is_empty() && powers.iter().all(|power| power != "0")
    }

    fn read_connector(&self, name: &str, dir: &Path) -> Option<Connector> {
        let (_, kind) = name.split_once('-')?;
        let connected = read_trimmed(&dir.join("status"))? == "connected";
        let enabled = read_trimmed(&dir.join("enabled")).map_or(true, |v| v == "enabled");
        let dpms_on = read_trimmed(&dir.join("dpms")).map_or(true, |v| v == "On");
        let internal = INTERNAL_CONNECTORS
            .iter()
            .any(|prefix| kind.starts_with(prefix));
        let mut lit = connected && enabled && dpms_on;
        if internal && lit && self.backlight_blanked() {
            lit = false;
        }
        Some(Connector {
            name: name.to_string(),
            internal,
            connected,
            lit,
        })
    }
}

impl GuardProbe for SystemProbe {
    fn camera_accessible(&self, device: &Path) -> bool {
        let Ok(path) = CString::new(device.as_os_str().as_bytes()) else {
            return false;
        };
        unsafe { libc::access(path.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
    }

    fn lid_closed(&self) -> bool {
        let Ok(entries) = fs::read_dir(self.proc_root.join("acpi/button/lid")) else {
            return false;
        };
        entries.flatten().any(|entry| {
            read_trimmed(&entry.path().join("state"))
                .is_some_and(|state| state.contains("closed"))
        })
    }

    fn lock_screen_active(&self) -> bool {
        match self.logind.lock_screen_active() {
            Ok(active) => active,
            Err(err) => {
                debug!(target: "kagami::guard", error = %err, "logind unavailable; assuming no lock screen");
                false
            }
        }
    }

    fn display_state(&self) -> DisplayState {
        let Ok(entries) = fs::read_dir(self.sys_root.join("class/drm")) else {
            return DisplayState::default();
        };
        let mut connectors: Vec<Connector> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.starts_with("card") {
                    return None;
                }
                self.read_connector(&name, &entry.path())
            })
            .collect();
        connectors.sort_by(|a, b| a.name.cmp(&b.name));
        DisplayState { connectors }
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|value| value.trim().to_string())
}
