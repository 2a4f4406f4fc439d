use std::path::PathBuf;
use std::time::Duration;

use hgr_types::{Arch, HangarError, Limits, Os, Result};

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // Paths
    pub base_dir: PathBuf,
    pub data_dir: PathBuf,
    pub spool_dir: PathBuf,
    pub workspaces_dir: PathBuf,
    pub log_dir: PathBuf,

    // Control plane
    pub control_plane_url: String,
    pub control_plane_token: Option<String>,

    // Container runtime
    pub docker_bin: String,
    pub docker_socket: PathBuf,
    pub base_image: String,
    pub runtime_binary: PathBuf,
    pub container_network: String,

    // Node capacity advertised to the control plane
    pub node_cores: u32,
    pub node_memory: u64,
    pub node_os: Os,
    pub node_arch: Arch,

    // Timing
    pub poll_interval_ms: u64,
    pub idle_retry_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub exec_poll_ms: u64,
    pub cleanup_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub sample_interval_ms: u64,
    pub run_deadline_secs: Option<u64>,

    // Logging
    pub log_level: String,
    pub log_format: String,
}

impl Config {
    /// Load configuration from environment variables (with dotenvy).
    pub fn load() -> Result<Self> {
        // A missing .env file is fine.
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    /// Re-read `.env`, letting its values replace ones loaded earlier, and
    /// rebuild the configuration.
    pub fn reload() -> Result<Self> {
        let _ = dotenvy::dotenv_override();
        Self::from_env()
    }

    fn from_env() -> Result<Self> {
        let base_dir = env_or("HANGAR_BASE_DIR", || {
            std::env::current_dir()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string()
        });
        let base = PathBuf::from(&base_dir);

        let data_dir = env_path_or("HANGAR_DATA_DIR", || base.join("data"));
        let spool_dir = env_path_or("HANGAR_SPOOL_DIR", || data_dir.join("spool"));
        let workspaces_dir = env_path_or("HANGAR_WORKSPACES_DIR", || data_dir.join("workspaces"));
        let log_dir = env_path_or("HANGAR_LOG_DIR", || base.join("logs"));

        let default_cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        let config = Config {
            base_dir: base.clone(),
            data_dir: data_dir.clone(),
            spool_dir,
            workspaces_dir,
            log_dir,

            control_plane_url: env_or("HANGAR_CONTROL_PLANE_URL", || {
                "http://127.0.0.1:8080".to_string()
            }),
            control_plane_token: env_opt("HANGAR_CONTROL_PLANE_TOKEN"),

            docker_bin: env_or("HANGAR_DOCKER_BIN", || "docker".to_string()),
            docker_socket: env_path_or("HANGAR_DOCKER_SOCKET", || {
                PathBuf::from("/var/run/docker.sock")
            }),
            base_image: env_or("HANGAR_BASE_IMAGE", || "hangar-runner:latest".to_string()),
            runtime_binary: env_path_or("HANGAR_RUNTIME_BINARY", || {
                PathBuf::from("/usr/lib/hangar/hangar-runtime")
            }),
            container_network: env_or("HANGAR_CONTAINER_NETWORK", || "bridge".to_string()),

            node_cores: env_u32("HANGAR_NODE_CORES", default_cores),
            node_memory: env_u64("HANGAR_NODE_MEMORY", 8 * 1024 * 1024 * 1024),
            node_os: env_parse("HANGAR_NODE_OS", Os::current())?,
            node_arch: env_parse("HANGAR_NODE_ARCH", Arch::current())?,

            poll_interval_ms: env_u64("HANGAR_POLL_INTERVAL_MS", 5000),
            idle_retry_ms: env_u64("HANGAR_IDLE_RETRY_MS", 1000),
            backoff_initial_ms: env_u64("HANGAR_BACKOFF_INITIAL_MS", 200),
            backoff_max_ms: env_u64("HANGAR_BACKOFF_MAX_MS", 30_000),
            exec_poll_ms: env_u64("HANGAR_EXEC_POLL_MS", 100),
            cleanup_timeout_secs: env_u64("HANGAR_CLEANUP_TIMEOUT_SECS", 30),
            stop_timeout_secs: env_u64("HANGAR_STOP_TIMEOUT_SECS", 10),
            sample_interval_ms: env_u64("HANGAR_SAMPLE_INTERVAL_MS", 1000),
            run_deadline_secs: env_opt("HANGAR_RUN_DEADLINE_SECS").and_then(|v| v.parse().ok()),

            log_level: env_or("HANGAR_LOG_LEVEL", || "info".to_string()),
            log_format: env_or("HANGAR_LOG_FORMAT", || "pretty".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the daemon cannot run with. Polling and sampling
    /// periods must be non-zero.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("HANGAR_POLL_INTERVAL_MS", self.poll_interval_ms),
            ("HANGAR_IDLE_RETRY_MS", self.idle_retry_ms),
            ("HANGAR_EXEC_POLL_MS", self.exec_poll_ms),
            ("HANGAR_SAMPLE_INTERVAL_MS", self.sample_interval_ms),
        ];
        for (key, value) in periods {
            if value == 0 {
                return Err(HangarError::Config(format!("{key} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// Create required directories.
    pub fn create_directories(&self) -> Result<()> {
        let dirs = [
            self.data_dir.clone(),
            self.spool_dir.join("downloading"),
            self.spool_dir.join("queued"),
            self.spool_dir.join("running"),
            self.workspaces_dir.clone(),
            self.log_dir.clone(),
        ];

        for dir in &dirs {
            std::fs::create_dir_all(dir).map_err(|e| {
                HangarError::Config(format!(
                    "Failed to create directory {}: {e}",
                    dir.display()
                ))
            })?;
        }

        Ok(())
    }

    /// Capacity this node advertises.
    pub fn node_limits(&self) -> Limits {
        Limits::new(self.node_cores, self.node_memory)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_retry(&self) -> Duration {
        Duration::from_millis(self.idle_retry_ms)
    }

    pub fn exec_poll_interval(&self) -> Duration {
        Duration::from_millis(self.exec_poll_ms)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }

    /// Whether logs should be emitted as JSON.
    pub fn structured_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }

    /// A configuration rooted at `base`, with defaults for everything else.
    /// Does not read the environment.
    pub fn rooted_at(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        let data_dir = base.join("data");
        Config {
            base_dir: base.clone(),
            spool_dir: data_dir.join("spool"),
            workspaces_dir: data_dir.join("workspaces"),
            data_dir,
            log_dir: base.join("logs"),
            control_plane_url: "http://127.0.0.1:8080".to_string(),
            control_plane_token: None,
            docker_bin: "docker".to_string(),
            docker_socket: PathBuf::from("/var/run/docker.sock"),
            base_image: "hangar-runner:latest".to_string(),
            runtime_binary: PathBuf::from("/usr/lib/hangar/hangar-runtime"),
            container_network: "bridge".to_string(),
            node_cores: 4,
            node_memory: 8 * 1024 * 1024 * 1024,
            node_os: Os::Linux,
            node_arch: Arch::Amd64,
            poll_interval_ms: 5000,
            idle_retry_ms: 1000,
            backoff_initial_ms: 200,
            backoff_max_ms: 30_000,
            exec_poll_ms: 100,
            cleanup_timeout_secs: 30,
            stop_timeout_secs: 10,
            sample_interval_ms: 1000,
            run_deadline_secs: None,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: impl FnOnce() -> String) -> String {
    std::env::var(key).unwrap_or_else(|_| default())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr<Err = HangarError>,
{
    match env_opt(key) {
        Some(v) => v.parse(),
        None => Ok(default),
    }
}

fn env_path_or(key: &str, default: impl FnOnce() -> PathBuf) -> PathBuf {
    std::env::var(key)
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_load_defaults() {
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.backoff_initial_ms, 200);
        assert_eq!(cfg.exec_poll_ms, 100);
        assert_eq!(cfg.docker_bin, "docker");
        assert!(cfg.spool_dir.ends_with("spool"));
    }

    #[test]
    fn config_env_override() {
        // Use a unique env var unlikely to collide
        std::env::set_var("HANGAR_SAMPLE_INTERVAL_MS", "250");
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.sample_interval(), Duration::from_millis(250));
        std::env::remove_var("HANGAR_SAMPLE_INTERVAL_MS");
    }

    #[test]
    fn config_rejects_zero_periods() {
        let mut cfg = Config::rooted_at("/tmp/hangar-test");
        assert!(cfg.validate().is_ok());

        cfg.sample_interval_ms = 0;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, HangarError::Config(_)));
        assert!(err.to_string().contains("HANGAR_SAMPLE_INTERVAL_MS"));

        cfg.sample_interval_ms = 1000;
        cfg.exec_poll_ms = 0;
        assert!(cfg.validate().is_err());

        cfg.exec_poll_ms = 100;
        cfg.poll_interval_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_parse_rejects_unknown_arch() {
        std::env::set_var("HANGAR_TEST_PARSE_ARCH", "mips");
        let result = env_parse("HANGAR_TEST_PARSE_ARCH", Arch::Amd64);
        std::env::remove_var("HANGAR_TEST_PARSE_ARCH");
        assert!(matches!(result, Err(HangarError::Config(_))));
        assert_eq!(env_parse("HANGAR_TEST_UNSET_ARCH", Arch::Arm64).unwrap(), Arch::Arm64);
    }

    #[test]
    fn config_create_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::rooted_at(tmp.path());

        cfg.create_directories().unwrap();

        assert!(cfg.spool_dir.join("downloading").is_dir());
        assert!(cfg.spool_dir.join("queued").is_dir());
        assert!(cfg.spool_dir.join("running").is_dir());
        assert!(cfg.workspaces_dir.is_dir());
        assert!(cfg.log_dir.is_dir());
    }

    #[test]
    fn node_limits_from_capacity() {
        let mut cfg = Config::rooted_at("/tmp/hangar-test");
        cfg.node_cores = 2;
        cfg.node_memory = 1024;
        assert_eq!(cfg.node_limits(), Limits::new(2, 1024));
        assert!(!cfg.structured_logs());
        cfg.log_format = "JSON".to_string();
        assert!(cfg.structured_logs());
    }
}
