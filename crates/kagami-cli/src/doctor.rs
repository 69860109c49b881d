use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use kagami_config::{
    self, ConfigError, ResolvedConfig, ResolvedConfigWithSource, PRIMARY_CONFIG_PATH,
    SECONDARY_CONFIG_PATH,
};
use kagami_core::capture::{CaptureSettings, V4lCamera};
use kagami_core::fingerprint::FingerprintReader;
use kagami_core::fprintd::FprintdReader;
use kagami_core::lock::{self, holder_pid};
use serde::Serialize;

use crate::errors::AppResult;

const CHECK_CONFIG: &str = "config";
const CHECK_VIDEO_DEVICE: &str = "video_device";
const CHECK_EMBEDDING_DIR: &str = "embedding_store_dir";
const CHECK_LANDMARK_MODEL: &str = "landmark_model";
const CHECK_ENCODER_MODEL: &str = "encoder_model";
const CHECK_LOCK_FILE: &str = "lock_file";
const CHECK_FINGERPRINT: &str = "fingerprint";
const CHECK_PAM_MODULE: &str = "pam_module";
const CHECK_PAM_STACK: &str = "pam_stack";

const LANDMARK_ENV: &str = "DLIB_LANDMARK_MODEL";
const ENCODER_ENV: &str = "DLIB_ENCODER_MODEL";
const MODULE_NAME: &str = "pam_kagami";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorCheck {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl DoctorCheck {
    fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            path: None,
            device: None,
        }
    }

    fn at(mut self, path: &Path) -> Self {
        self.path = Some(path.display().to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorOutcome {
    pub ok: bool,
    pub checks: Vec<DoctorCheck>,
}

impl DoctorOutcome {
    /// Names of the checks that ended with `status`, in run order.
    pub fn names_with(&self, status: CheckStatus) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|check| check.status == status)
            .map(|check| check.name.as_str())
            .collect()
    }
}

#[derive(Clone)]
pub struct DoctorPaths {
    pub config_paths: Vec<PathBuf>,
    pub pam_module_paths: Vec<PathBuf>,
    pub pamd_dir: PathBuf,
}

impl Default for DoctorPaths {
    fn default() -> Self {
        Self {
            config_paths: vec![
                PathBuf::from(PRIMARY_CONFIG_PATH),
                PathBuf::from(SECONDARY_CONFIG_PATH),
            ],
            pam_module_paths: vec![
                PathBuf::from("/usr/lib/x86_64-linux-gnu/security/libpam_kagami.so"),
                PathBuf::from("/lib/security/libpam_kagami.so"),
                PathBuf::from("/lib64/security/libpam_kagami.so"),
            ],
            pamd_dir: PathBuf::from("/etc/pam.d"),
        }
    }
}

pub trait DeviceOpener {
    fn open(&self, settings: &CaptureSettings) -> AppResult<()>;
}

#[derive(Clone, Copy)]
pub struct RealDeviceOpener;

impl DeviceOpener for RealDeviceOpener {
    fn open(&self, settings: &CaptureSettings) -> AppResult<()> {
        let _ = V4lCamera::open(settings)?;
        Ok(())
    }
}

pub struct DoctorContext<F, D> {
    pub paths: DoctorPaths,
    pub fingerprint_reader: F,
    pub device_opener: D,
    pub fallback_config: ResolvedConfig,
}

impl Default for DoctorContext<FprintdReader, RealDeviceOpener> {
    fn default() -> Self {
        Self {
            paths: DoctorPaths::default(),
            fingerprint_reader: FprintdReader::new(),
            device_opener: RealDeviceOpener,
            fallback_config: ResolvedConfig::default(),
        }
    }
}

pub fn run_doctor() -> AppResult<DoctorOutcome> {
    let ctx = DoctorContext::default();
    run_doctor_with(&ctx)
}

pub fn run_doctor_with<F, D>(ctx: &DoctorContext<F, D>) -> AppResult<DoctorOutcome>
where
    F: FingerprintReader,
    D: DeviceOpener,
{
    let (config_check, resolved) = check_config(&ctx.paths, &ctx.fallback_config);
    let config = &resolved.resolved;

    let mut checks = vec![config_check];
    checks.push(check_video_device(config, &ctx.device_opener));
    checks.push(check_embedding_dir(config));
    checks.push(check_model(
        CHECK_LANDMARK_MODEL,
        config.landmark_model.clone(),
        LANDMARK_ENV,
    ));
    checks.push(check_model(
        CHECK_ENCODER_MODEL,
        config.encoder_model.clone(),
        ENCODER_ENV,
    ));
    checks.push(check_lock_file(&config.lock_path));
    checks.push(check_fingerprint(config, &ctx.fingerprint_reader));
    let (pam_stack_check, referenced_modules) = check_pam_stack(&ctx.paths.pamd_dir);
    checks.push(pam_stack_check);
    checks.push(check_pam_module(
        referenced_modules.as_slice(),
        &ctx.paths.pam_module_paths,
    ));

    let ok = checks.iter().all(|c| c.status != CheckStatus::Fail);

    Ok(DoctorOutcome { ok, checks })
}

fn check_config(
    paths: &DoctorPaths,
    fallback: &ResolvedConfig,
) -> (DoctorCheck, ResolvedConfigWithSource) {
    let fallback_config = || ResolvedConfigWithSource {
        resolved: fallback.clone(),
        source: None,
    };

    match kagami_config::load_from_paths(&paths.config_paths) {
        Ok(Some(entry)) => {
            let shadowed: Vec<&PathBuf> = paths
                .config_paths
                .iter()
                .filter(|p| **p != entry.source && p.exists())
                .collect();
            let check = if shadowed.is_empty() {
                DoctorCheck::new(
                    CHECK_CONFIG,
                    CheckStatus::Pass,
                    format!("Loaded config from {}", entry.source.display()),
                )
            } else {
                DoctorCheck::new(
                    CHECK_CONFIG,
                    CheckStatus::Warn,
                    format!(
                        "Multiple config files exist; using {}",
                        entry.source.display()
                    ),
                )
            }
            .at(&entry.source);
            let resolved = ResolvedConfigWithSource {
                resolved: ResolvedConfig::from_raw(entry.contents),
                source: Some(entry.source),
            };
            (check, resolved)
        }
        Ok(None) => (
            DoctorCheck::new(
                CHECK_CONFIG,
                CheckStatus::Warn,
                format!(
                    "No config file; using defaults (tried {})",
                    display_paths(&paths.config_paths)
                ),
            ),
            fallback_config(),
        ),
        Err(ConfigError::Parse { path, message }) => (
            DoctorCheck::new(
                CHECK_CONFIG,
                CheckStatus::Fail,
                format!("Failed to parse {}: {}", path.display(), message),
            )
            .at(&path),
            fallback_config(),
        ),
        Err(ConfigError::Read { path, source }) => (
            DoctorCheck::new(
                CHECK_CONFIG,
                CheckStatus::Fail,
                format!("Failed to read {}: {}", path.display(), source),
            )
            .at(&path),
            fallback_config(),
        ),
    }
}

fn check_video_device<D: DeviceOpener>(config: &ResolvedConfig, opener: &D) -> DoctorCheck {
    let settings = CaptureSettings::from_config(config);
    let display = settings.device.display().to_string();

    let mut check = match opener.open(&settings) {
        Ok(_) => DoctorCheck::new(
            CHECK_VIDEO_DEVICE,
            CheckStatus::Pass,
            format!("Opened video device {display} ({})", settings.pixel_format),
        ),
        Err(err) => DoctorCheck::new(CHECK_VIDEO_DEVICE, CheckStatus::Fail, err.human_message()),
    };
    check.device = Some(display);
    check
}

fn check_embedding_dir(config: &ResolvedConfig) -> DoctorCheck {
    let path = &config.embedding_store_dir;
    let check = match (path.exists(), path.is_dir()) {
        (false, _) => DoctorCheck::new(
            CHECK_EMBEDDING_DIR,
            CheckStatus::Fail,
            format!("Template store {} missing", path.display()),
        ),
        (true, false) => DoctorCheck::new(
            CHECK_EMBEDDING_DIR,
            CheckStatus::Fail,
            format!("Template store {} is not a directory", path.display()),
        ),
        (true, true) => match fs::read_dir(path) {
            Ok(_) if is_group_or_world_writable(path) => DoctorCheck::new(
                CHECK_EMBEDDING_DIR,
                CheckStatus::Warn,
                format!(
                    "Template store {} is group/world-writable; enrolled identities can be forged",
                    path.display()
                ),
            ),
            Ok(_) => DoctorCheck::new(
                CHECK_EMBEDDING_DIR,
                CheckStatus::Pass,
                format!("Template store {} is readable", path.display()),
            ),
            Err(err) => DoctorCheck::new(
                CHECK_EMBEDDING_DIR,
                CheckStatus::Fail,
                format!("Cannot read template store {}: {}", path.display(), err),
            ),
        },
    };
    check.at(path)
}

fn check_model(name: &str, configured: Option<PathBuf>, env_key: &str) -> DoctorCheck {
    let path = configured.or_else(|| env::var_os(env_key).map(PathBuf::from));
    match path {
        None => DoctorCheck::new(
            name,
            CheckStatus::Fail,
            format!("Model path not configured; set {name} in config or ${env_key}"),
        ),
        Some(p) => match fs::File::open(&p) {
            Ok(_) => DoctorCheck::new(
                name,
                CheckStatus::Pass,
                format!("Found model at {}", p.display()),
            )
            .at(&p),
            Err(err) => DoctorCheck::new(
                name,
                CheckStatus::Fail,
                format!("Cannot read model {}: {}", p.display(), err),
            )
            .at(&p),
        },
    }
}

fn check_lock_file(path: &Path) -> DoctorCheck {
    let parent = path.parent().unwrap_or_else(|| Path::new("/"));
    if !path.exists() {
        let check = if parent.is_dir() {
            DoctorCheck::new(
                CHECK_LOCK_FILE,
                CheckStatus::Pass,
                format!(
                    "Lock file {} will be created on first authentication",
                    path.display()
                ),
            )
        } else {
            DoctorCheck::new(
                CHECK_LOCK_FILE,
                CheckStatus::Fail,
                format!("Lock directory {} missing", parent.display()),
            )
        };
        return check.at(path);
    }

    let check = match lock::is_held(path) {
        Ok(true) => {
            let holder = holder_pid(path)
                .map(|pid| format!("pid {pid}"))
                .unwrap_or_else(|| "unknown pid".into());
            DoctorCheck::new(
                CHECK_LOCK_FILE,
                CheckStatus::Warn,
                format!(
                    "Lock {} is held by {holder}; authentications queue behind it",
                    path.display()
                ),
            )
        }
        Ok(false) => DoctorCheck::new(
            CHECK_LOCK_FILE,
            CheckStatus::Pass,
            format!("Lock {} is free", path.display()),
        ),
        Err(err) => DoctorCheck::new(CHECK_LOCK_FILE, CheckStatus::Fail, err.to_string()),
    };
    check.at(path)
}

fn check_fingerprint<F: FingerprintReader>(config: &ResolvedConfig, reader: &F) -> DoctorCheck {
    if !config.fingerprint_enabled {
        return DoctorCheck::new(
            CHECK_FINGERPRINT,
            CheckStatus::Pass,
            "Fingerprint disabled in config",
        );
    }
    if reader.is_available() {
        DoctorCheck::new(
            CHECK_FINGERPRINT,
            CheckStatus::Pass,
            "fprintd reports a default reader",
        )
    } else {
        DoctorCheck::new(
            CHECK_FINGERPRINT,
            CheckStatus::Fail,
            "Fingerprint enabled but fprintd has no usable reader",
        )
    }
}

fn check_pam_module(referenced: &[PathBuf], fallback_paths: &[PathBuf]) -> DoctorCheck {
    let mut targets: Vec<PathBuf> = if referenced.is_empty() {
        fallback_paths.to_vec()
    } else {
        referenced.to_vec()
    };
    targets.dedup();

    let mut failures = Vec::new();
    let mut passes = Vec::new();

    for path in &targets {
        match fs::File::open(path).and_then(|file| file.metadata()) {
            Ok(metadata) => {
                let mode = metadata.permissions().mode();
                if mode & 0o022 != 0 {
                    failures.push(format!(
                        "{} is world/group-writable (mode {:o})",
                        path.display(),
                        mode & 0o777
                    ));
                    continue;
                }
                passes.push(path.display().to_string());
            }
            Err(err) => failures.push(format!("{}: {}", path.display(), err)),
        }
    }

    if passes.is_empty() {
        let (status, message) = if referenced.is_empty() {
            (
                CheckStatus::Warn,
                format!(
                    "No {MODULE_NAME} reference to validate; searched {}",
                    display_paths(&targets)
                ),
            )
        } else {
            (
                CheckStatus::Fail,
                format!("PAM module validation failed: {}", failures.join("; ")),
            )
        };
        return DoctorCheck::new(CHECK_PAM_MODULE, status, message);
    }

    if failures.is_empty() {
        let mut check = DoctorCheck::new(
            CHECK_PAM_MODULE,
            CheckStatus::Pass,
            format!("Validated PAM module(s): {}", passes.join(", ")),
        );
        check.path = Some(passes.join(", "));
        check
    } else {
        DoctorCheck::new(
            CHECK_PAM_MODULE,
            CheckStatus::Fail,
            format!(
                "Some PAM modules invalid: {}; ok: {}",
                failures.join(", "),
                passes.join(", ")
            ),
        )
    }
}

fn check_pam_stack(pamd_dir: &Path) -> (DoctorCheck, Vec<PathBuf>) {
    let entries = match fs::read_dir(pamd_dir) {
        Ok(entries) => entries,
        Err(err) => {
            return (
                DoctorCheck::new(
                    CHECK_PAM_STACK,
                    CheckStatus::Fail,
                    format!("Failed to read {}: {}", pamd_dir.display(), err),
                )
                .at(pamd_dir),
                Vec::new(),
            )
        }
    };

    let mut matched = Vec::new();
    let mut referenced = Vec::new();
    for entry in entries.flatten() {
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        if let Ok(contents) = fs::read_to_string(entry.path()) {
            if file_references_module(&contents, &mut referenced) {
                matched.push(entry.file_name().to_string_lossy().to_string());
            }
        }
    }
    matched.sort();

    let check = if matched.is_empty() {
        DoctorCheck::new(
            CHECK_PAM_STACK,
            CheckStatus::Warn,
            format!(
                "No {MODULE_NAME} auth entry found under {}; add one to the target service",
                pamd_dir.display()
            ),
        )
    } else {
        DoctorCheck::new(
            CHECK_PAM_STACK,
            CheckStatus::Pass,
            format!("{MODULE_NAME} referenced in: {}", matched.join(", ")),
        )
    };
    (check.at(pamd_dir), referenced)
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Only `auth` lines count; the module implements nothing else.
fn file_references_module(contents: &str, referenced: &mut Vec<PathBuf>) -> bool {
    for line in contents.lines() {
        let active = line.split('#').next().unwrap_or("").trim();
        if active.is_empty() {
            continue;
        }
        let kind = active.split_whitespace().next().unwrap_or("").trim_start_matches('-');
        if kind == "auth" && active.contains(MODULE_NAME) {
            referenced.extend(module_paths_from_line(active));
            return true;
        }
    }
    false
}

fn module_paths_from_line(line: &str) -> Vec<PathBuf> {
    // Controls may span several tokens, e.g. `[success=3 default=ignore]`.
    line.split_whitespace()
        .skip(1)
        .filter(|token| token.starts_with('/') && token.contains(MODULE_NAME))
        .map(PathBuf::from)
        .collect()
}

fn is_group_or_world_writable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|metadata| metadata.permissions().mode() & 0o022 != 0)
        .unwrap_or(false)
}
