use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const PRIMARY_CONFIG_PATH: &str = "/etc/kagami-pam/config.toml";
pub const SECONDARY_CONFIG_PATH: &str = "/usr/local/etc/kagami-pam/config.toml";
pub const DEFAULT_RECOGNITION_THRESHOLD: f64 = 0.4;
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_DETECTION_CONFIDENCE: f32 = 0.6;
pub const DEFAULT_DETECTION_DOWNSCALE: f32 = 0.5;
pub const DEFAULT_DEDUP_MERGE_THRESHOLD: f64 = 0.15;
pub const DEFAULT_FRAME_BACKOFF_MILLIS: u64 = 50;
pub const DEFAULT_VIDEO_DEVICE: &str = "/dev/video0";
pub const DEFAULT_PIXEL_FORMAT: &str = "GREY";
pub const DEFAULT_WARMUP_FRAMES: u32 = 0;
pub const DEFAULT_JITTERS: u32 = 1;
pub const DEFAULT_STORE_DIR: &str = "/var/lib/kagami-pam/models";
pub const DEFAULT_FINGERPRINT_HEAD_START_MILLIS: u64 = 500;
pub const DEFAULT_GREETER_DISPLAY_DELAY_MILLIS: u64 = 0;
pub const DEFAULT_LOCK_PATH: &str = "/var/run/kagami-pam.lock";
pub const DEFAULT_CACHE_LOAD_THREADS: usize = 4;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    pub recognition_threshold: Option<f64>,
    pub timeout_secs: Option<u64>,
    pub detection_confidence: Option<f32>,
    pub detection_downscale: Option<f32>,
    pub dedup_merge_threshold: Option<f64>,
    pub frame_backoff_millis: Option<u64>,
    pub video_device: Option<String>,
    pub pixel_format: Option<String>,
    pub capture_width: Option<u32>,
    pub capture_height: Option<u32>,
    pub warmup_frames: Option<u32>,
    pub jitters: Option<u32>,
    pub embedding_store_dir: Option<PathBuf>,
    pub landmark_model: Option<PathBuf>,
    pub encoder_model: Option<PathBuf>,
    pub fingerprint_enabled: Option<bool>,
    pub fingerprint_head_start_millis: Option<u64>,
    pub guard_lid_closed: Option<bool>,
    pub guard_display_off: Option<bool>,
    pub greeter_display_delay_millis: Option<u64>,
    pub guard_external_monitor_only: Option<bool>,
    pub lock_path: Option<PathBuf>,
    pub lock_timeout_secs: Option<u64>,
    pub cache_load_threads: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub recognition_threshold: f64,
    pub timeout: Duration,
    pub detection_confidence: f32,
    pub detection_downscale: f32,
    pub dedup_merge_threshold: f64,
    pub frame_backoff: Duration,
    pub video_device: String,
    pub pixel_format: String,
    pub capture_width: Option<u32>,
    pub capture_height: Option<u32>,
    pub warmup_frames: u32,
    pub jitters: u32,
    pub embedding_store_dir: PathBuf,
    pub landmark_model: Option<PathBuf>,
    pub encoder_model: Option<PathBuf>,
    pub fingerprint_enabled: bool,
    pub fingerprint_head_start: Duration,
    pub guard_lid_closed: bool,
    pub guard_display_off: bool,
    pub greeter_display_delay: Duration,
    pub guard_external_monitor_only: bool,
    pub lock_path: PathBuf,
    /// `None` means the authentication path waits for the lock indefinitely.
    pub lock_timeout: Option<Duration>,
    pub cache_load_threads: usize,
}

impl ResolvedConfig {
    pub fn from_raw(raw: ConfigFile) -> Self {
        Self {
            recognition_threshold: raw
                .recognition_threshold
                .unwrap_or(DEFAULT_RECOGNITION_THRESHOLD),
            timeout: Duration::from_secs(raw.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS).max(1)),
            detection_confidence: raw
                .detection_confidence
                .unwrap_or(DEFAULT_DETECTION_CONFIDENCE),
            detection_downscale: raw
                .detection_downscale
                .filter(|scale| *scale > 0.0 && *scale <= 1.0)
                .unwrap_or(DEFAULT_DETECTION_DOWNSCALE),
            dedup_merge_threshold: raw
                .dedup_merge_threshold
                .unwrap_or(DEFAULT_DEDUP_MERGE_THRESHOLD),
            frame_backoff: Duration::from_millis(
                raw.frame_backoff_millis
                    .unwrap_or(DEFAULT_FRAME_BACKOFF_MILLIS),
            ),
            video_device: raw
                .video_device
                .unwrap_or_else(|| DEFAULT_VIDEO_DEVICE.to_string()),
            pixel_format: raw
                .pixel_format
                .unwrap_or_else(|| DEFAULT_PIXEL_FORMAT.to_string()),
            capture_width: raw.capture_width,
            capture_height: raw.capture_height,
            warmup_frames: raw.warmup_frames.unwrap_or(DEFAULT_WARMUP_FRAMES),
            jitters: raw.jitters.unwrap_or(DEFAULT_JITTERS),
            embedding_store_dir: raw
                .embedding_store_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR)),
            landmark_model: raw.landmark_model,
            encoder_model: raw.encoder_model,
            fingerprint_enabled: raw.fingerprint_enabled.unwrap_or(false),
            fingerprint_head_start: Duration::from_millis(
                raw.fingerprint_head_start_millis
                    .unwrap_or(DEFAULT_FINGERPRINT_HEAD_START_MILLIS),
            ),
            guard_lid_closed: raw.guard_lid_closed.unwrap_or(true),
            guard_display_off: raw.guard_display_off.unwrap_or(true),
            greeter_display_delay: Duration::from_millis(
                raw.greeter_display_delay_millis
                    .unwrap_or(DEFAULT_GREETER_DISPLAY_DELAY_MILLIS),
            ),
            guard_external_monitor_only: raw.guard_external_monitor_only.unwrap_or(false),
            lock_path: raw
                .lock_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCK_PATH)),
            lock_timeout: raw.lock_timeout_secs.map(Duration::from_secs),
            cache_load_threads: raw
                .cache_load_threads
                .unwrap_or(DEFAULT_CACHE_LOAD_THREADS)
                .max(1),
        }
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self::from_raw(ConfigFile::default())
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub contents: ConfigFile,
    pub source: PathBuf,
}

impl LoadedConfig {
    pub fn new(contents: ConfigFile, source: PathBuf) -> Self {
        Self { contents, source }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigWithSource {
    pub resolved: ResolvedConfig,
    pub source: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

pub fn default_paths() -> [PathBuf; 2] {
    [
        PathBuf::from(PRIMARY_CONFIG_PATH),
        PathBuf::from(SECONDARY_CONFIG_PATH),
    ]
}

pub fn load_resolved_config() -> Result<ResolvedConfigWithSource, ConfigError> {
    load_resolved_from_paths(&default_paths())
}

pub fn load_from_paths(paths: &[PathBuf]) -> Result<Option<LoadedConfig>, ConfigError> {
    for path in paths {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let parsed =
                    toml::from_str::<ConfigFile>(&contents).map_err(|err| ConfigError::Parse {
                        path: path.clone(),
                        message: err.to_string(),
                    })?;
                return Ok(Some(LoadedConfig::new(parsed, path.clone())));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(ConfigError::Read {
                    path: path.clone(),
                    source: err,
                })
            }
        }
    }

    Ok(None)
}

pub fn load_resolved_from_paths(
    paths: &[PathBuf],
) -> Result<ResolvedConfigWithSource, ConfigError> {
    match load_from_paths(paths)? {
        Some(entry) => Ok(ResolvedConfigWithSource {
            resolved: ResolvedConfig::from_raw(entry.contents),
            source: Some(entry.source),
        }),
        None => Ok(ResolvedConfigWithSource {
            resolved: ResolvedConfig::default(),
            source: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn primary_path_wins() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("primary.toml");
        let secondary = dir.path().join("secondary.toml");
        fs::write(&secondary, "timeout_secs = 2").unwrap();
        fs::write(&primary, "timeout_secs = 9").unwrap();

        let loaded = load_from_paths(&[primary.clone(), secondary.clone()])
            .unwrap()
            .expect("config expected");
        assert_eq!(loaded.source(), primary.as_path());
        assert_eq!(loaded.contents.timeout_secs, Some(9));
    }

    #[test]
    fn secondary_used_when_primary_missing() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let secondary = dir.path().join("secondary.toml");
        fs::write(&secondary, "fingerprint_enabled = true").unwrap();

        let loaded = load_from_paths(&[missing, secondary.clone()])
            .unwrap()
            .expect("config expected");
        assert_eq!(loaded.source, secondary);
        assert_eq!(loaded.contents.fingerprint_enabled, Some(true));
    }

    #[test]
    fn parse_errors_are_reported() {
        let dir = tempdir().unwrap();
        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "lock_path = { invalid = true }").unwrap();

        let err = load_from_paths(&[broken.clone()]).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, broken),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn io_errors_are_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dir.toml");
        fs::create_dir_all(&path).unwrap();

        let err = load_from_paths(&[path.clone()]).unwrap_err();
        match err {
            ConfigError::Read { path: err_path, .. } => assert_eq!(err_path, path),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn resolved_defaults_apply_when_missing() {
        let resolved = load_resolved_from_paths(&[]).unwrap();
        assert!(resolved.source.is_none());
        let cfg = resolved.resolved;
        assert_eq!(cfg.recognition_threshold, DEFAULT_RECOGNITION_THRESHOLD);
        assert_eq!(cfg.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(cfg.dedup_merge_threshold, DEFAULT_DEDUP_MERGE_THRESHOLD);
        assert_eq!(
            cfg.fingerprint_head_start,
            Duration::from_millis(DEFAULT_FINGERPRINT_HEAD_START_MILLIS)
        );
        assert_eq!(cfg.lock_path, PathBuf::from(DEFAULT_LOCK_PATH));
        assert!(cfg.lock_timeout.is_none());
        assert!(!cfg.fingerprint_enabled);
        assert!(cfg.guard_lid_closed);
        assert!(cfg.guard_display_off);
        assert!(!cfg.guard_external_monitor_only);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let raw = ConfigFile {
            timeout_secs: Some(0),
            detection_downscale: Some(3.0),
            cache_load_threads: Some(0),
            ..ConfigFile::default()
        };
        let cfg = ResolvedConfig::from_raw(raw);
        assert_eq!(cfg.timeout, Duration::from_secs(1));
        assert_eq!(cfg.detection_downscale, DEFAULT_DETECTION_DOWNSCALE);
        assert_eq!(cfg.cache_load_threads, 1);
    }

    #[test]
    fn resolved_config_reports_source() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("primary.toml");
        fs::write(
            &primary,
            "timeout_secs = 10\nlock_timeout_secs = 3\nguard_external_monitor_only = true\n",
        )
        .unwrap();

        let resolved = load_resolved_from_paths(&[primary.clone()]).unwrap();
        assert_eq!(resolved.source, Some(primary));
        assert_eq!(resolved.resolved.timeout, Duration::from_secs(10));
        assert_eq!(resolved.resolved.lock_timeout, Some(Duration::from_secs(3)));
        assert!(resolved.resolved.guard_external_monitor_only);
    }
}
