use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::endpoint::{CameraEndpoint, Credentials, DEFAULT_HTTP_PORT, DEFAULT_RTSP_PORT};
use crate::snapshot::DEFAULT_SNAPSHOT_QUALITY;
use crate::stream::StreamSettings;
use crate::supervisor::{BackoffPolicy, SupervisorSettings};

const DEFAULT_HOST: &str = "192.168.1.108";
const DEFAULT_USERNAME: &str = "admin";
const DEFAULT_MODEL: &str = "ITC231-RF1A-IR";
const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_SNAPSHOT_DIR: &str = "snapshots";
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_READ_WATCHDOG_SECS: u64 = 10;
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_BACKOFF_JITTER: f64 = 0.2;
const DEFAULT_DEGRADED_AFTER: u32 = 3;
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_STREAM_QUALITY: u8 = 85;
const DEFAULT_GRACE_MS: u64 = 2_000;
const DEFAULT_PLACEHOLDER_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RelayConfigFile {
    camera: Option<CameraConfigFile>,
    probe: Option<ProbeConfigFile>,
    stream: Option<StreamConfigFile>,
    snapshot: Option<SnapshotConfigFile>,
    api: Option<ApiConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    host: Option<String>,
    port: Option<u16>,
    rtsp_port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ProbeConfigFile {
    timeout_secs: Option<u64>,
    read_watchdog_secs: Option<u64>,
    backoff_initial_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
    backoff_jitter: Option<f64>,
    max_retries: Option<u32>,
    degraded_after: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    target_fps: Option<u32>,
    quality: Option<u8>,
    grace_ms: Option<u64>,
    placeholder_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SnapshotConfigFile {
    quality: Option<u8>,
    dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApiConfigFile {
    addr: Option<String>,
}

/// Camera identity as configured. Turned into a validated `CameraEndpoint` by `endpoint()`.
#[derive(Clone)]
pub struct CameraSettings {
    pub host: String,
    pub port: u16,
    pub rtsp_port: u16,
    pub username: String,
    pub password: String,
    pub model: String,
}

impl std::fmt::Debug for CameraSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("rtsp_port", &self.rtsp_port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub quality: u8,
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub camera: CameraSettings,
    pub supervisor: SupervisorSettings,
    pub stream: StreamSettings,
    pub snapshot: SnapshotSettings,
    pub api_addr: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_file(RelayConfigFile::default())
    }
}

impl RelayConfig {
    /// Defaults, then the file named by `CAMRELAY_CONFIG`, then `CAMRELAY_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMRELAY_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an explicit file, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let probe = file.probe.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let snapshot = file.snapshot.unwrap_or_default();

        let camera = CameraSettings {
            host: camera.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: camera.port.unwrap_or(DEFAULT_HTTP_PORT),
            rtsp_port: camera.rtsp_port.unwrap_or(DEFAULT_RTSP_PORT),
            username: camera
                .username
                .unwrap_or_else(|| DEFAULT_USERNAME.to_string()),
            password: camera.password.unwrap_or_default(),
            model: camera.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        };
        let supervisor = SupervisorSettings {
            probe_timeout: Duration::from_secs(
                probe.timeout_secs.unwrap_or(DEFAULT_PROBE_TIMEOUT_SECS),
            ),
            read_watchdog: Duration::from_secs(
                probe
                    .read_watchdog_secs
                    .unwrap_or(DEFAULT_READ_WATCHDOG_SECS),
            ),
            backoff: BackoffPolicy {
                initial: Duration::from_millis(
                    probe.backoff_initial_ms.unwrap_or(DEFAULT_BACKOFF_INITIAL_MS),
                ),
                max: Duration::from_millis(probe.backoff_max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS)),
                multiplier: probe.backoff_multiplier.unwrap_or(DEFAULT_BACKOFF_MULTIPLIER),
                jitter: probe.backoff_jitter.unwrap_or(DEFAULT_BACKOFF_JITTER),
            },
            max_retries: probe.max_retries,
            degraded_after: probe.degraded_after.unwrap_or(DEFAULT_DEGRADED_AFTER),
        };
        let stream = StreamSettings {
            target_fps: stream.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            quality: stream.quality.unwrap_or(DEFAULT_STREAM_QUALITY),
            grace: Duration::from_millis(stream.grace_ms.unwrap_or(DEFAULT_GRACE_MS)),
            placeholder_interval: Duration::from_millis(
                stream
                    .placeholder_interval_ms
                    .unwrap_or(DEFAULT_PLACEHOLDER_INTERVAL_MS),
            ),
        };
        let snapshot = SnapshotSettings {
            quality: snapshot.quality.unwrap_or(DEFAULT_SNAPSHOT_QUALITY),
            dir: snapshot
                .dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR)),
        };
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        Self {
            camera,
            supervisor,
            stream,
            snapshot,
            api_addr,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(host) = env_string("CAMRELAY_HOST") {
            self.camera.host = host;
        }
        if let Some(port) = env_parse::<u16>("CAMRELAY_PORT", "a port number")? {
            self.camera.port = port;
        }
        if let Some(port) = env_parse::<u16>("CAMRELAY_RTSP_PORT", "a port number")? {
            self.camera.rtsp_port = port;
        }
        if let Some(username) = env_string("CAMRELAY_USERNAME") {
            self.camera.username = username;
        }
        // An empty password is meaningful, so it is taken as-is.
        if let Ok(password) = std::env::var("CAMRELAY_PASSWORD") {
            self.camera.password = password;
        }
        if let Some(model) = env_string("CAMRELAY_MODEL") {
            self.camera.model = model;
        }
        if let Some(addr) = env_string("CAMRELAY_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(dir) = env_string("CAMRELAY_SNAPSHOT_DIR") {
            self.snapshot.dir = PathBuf::from(dir);
        }
        if let Some(secs) =
            env_parse::<u64>("CAMRELAY_PROBE_TIMEOUT_SECS", "an integer number of seconds")?
        {
            self.supervisor.probe_timeout = Duration::from_secs(secs);
        }
        if let Some(fps) = env_parse::<u32>("CAMRELAY_TARGET_FPS", "an integer frame rate")? {
            self.stream.target_fps = fps;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.endpoint()?;
        if self.supervisor.probe_timeout.is_zero() {
            return Err(anyhow!("probe timeout must be greater than zero"));
        }
        if self.supervisor.read_watchdog.is_zero() {
            return Err(anyhow!("read watchdog must be greater than zero"));
        }
        let backoff = &self.supervisor.backoff;
        if backoff.initial.is_zero() || backoff.max < backoff.initial {
            return Err(anyhow!(
                "backoff must satisfy 0 < initial <= max (got {:?} and {:?})",
                backoff.initial,
                backoff.max
            ));
        }
        if !(backoff.multiplier >= 1.0 && backoff.multiplier.is_finite()) {
            return Err(anyhow!("backoff multiplier must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&backoff.jitter) {
            return Err(anyhow!("backoff jitter must be within 0.0..=1.0"));
        }
        if self.supervisor.max_retries == Some(0) {
            return Err(anyhow!("max_retries must be greater than zero when set"));
        }
        if self.stream.target_fps == 0 || self.stream.target_fps > 120 {
            return Err(anyhow!("target fps must be within 1..=120"));
        }
        for (name, quality) in [
            ("stream quality", self.stream.quality),
            ("snapshot quality", self.snapshot.quality),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(anyhow!("{name} must be within 1..=100"));
            }
        }
        if self.stream.placeholder_interval.is_zero() {
            return Err(anyhow!("placeholder interval must be greater than zero"));
        }
        self.api_addr
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("api address '{}' is not host:port", self.api_addr))?;
        Ok(())
    }

    /// The validated camera endpoint for this configuration.
    pub fn endpoint(&self) -> Result<CameraEndpoint> {
        let camera = &self.camera;
        CameraEndpoint::new(
            camera.host.clone(),
            Credentials::new(camera.username.clone(), camera.password.clone()),
            camera.port,
            camera.rtsp_port,
            camera.model.clone(),
        )
        .context("invalid camera configuration")
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, expected: &str) -> Result<Option<T>> {
    match env_string(name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{name} must be {expected}")),
        None => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.camera.host, "192.168.1.108");
        assert_eq!((cfg.camera.port, cfg.camera.rtsp_port), (80, 554));
        assert_eq!(cfg.camera.username, "admin");
        assert_eq!(cfg.camera.password, "");
        assert_eq!(cfg.supervisor.probe_timeout, Duration::from_secs(10));
        assert_eq!(cfg.supervisor.backoff, BackoffPolicy::default());
        assert_eq!(cfg.supervisor.max_retries, None);
        assert_eq!(cfg.stream.target_fps, 30);
        assert_eq!(cfg.stream.quality, 85);
        assert_eq!(cfg.snapshot.quality, 95);
        assert_eq!(cfg.api_addr, "127.0.0.1:5000");
    }

    #[test]
    fn debug_output_redacts_password() {
        let mut cfg = RelayConfig::default();
        cfg.camera.password = "hunter2".to_string();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = RelayConfig::default();
        cfg.camera.host = " ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::default();
        cfg.stream.quality = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::default();
        cfg.supervisor.backoff.max = Duration::from_millis(10);
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::default();
        cfg.api_addr = "localhost".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::default();
        assert!(cfg.validate().is_ok());
    }
}
