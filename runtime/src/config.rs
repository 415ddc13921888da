//! Runtime configuration, read once at startup from flags and environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use capsules_container::{ResourceLimits, RuntimeKind};
use capsules_stack::TemplateSource;
use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "shipyard-runtime")]
#[command(about = "Builds uploaded projects into containers and supervises their runs")]
pub struct Config {
    /// HTTP listen address
    #[arg(long, env = "SHIPYARD_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Host name used in URLs handed back to callers
    #[arg(long, env = "RUNNER_HOST", default_value = "localhost")]
    pub public_host: String,

    /// Port used in the returned log channel URL
    #[arg(long, env = "WS_PORT", default_value_t = 8080)]
    pub log_port: u16,

    /// Parent directory of per-run workspaces
    #[arg(long, env = "SHIPYARD_WORKSPACE_ROOT", default_value = "./workspace")]
    pub workspace_root: PathBuf,

    /// Recipe template directory (built-in templates when unset)
    #[arg(long, env = "SHIPYARD_TEMPLATE_DIR")]
    pub template_dir: Option<PathBuf>,

    /// Container runtime binary, or `stub` for the in-memory engine
    #[arg(long, env = "SHIPYARD_CONTAINER_RUNTIME", default_value = "docker")]
    pub container_runtime: String,

    /// Repository name for built images
    #[arg(long, env = "SHIPYARD_IMAGE_PREFIX", default_value = "shipyard")]
    pub image_prefix: String,

    /// Container port used when detection finds none
    #[arg(long, env = "SHIPYARD_CONTAINER_PORT", default_value_t = 3000)]
    pub default_container_port: u16,

    #[arg(long, env = "SHIPYARD_MEMORY_LIMIT_MB", default_value_t = 512)]
    pub memory_limit_mb: u64,

    /// CFS quota in microseconds per 100ms period
    #[arg(long, env = "SHIPYARD_CPU_QUOTA", default_value_t = 50000)]
    pub cpu_quota: i64,

    /// Graceful container stop bound
    #[arg(long, env = "SHIPYARD_STOP_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    pub stop_timeout: Duration,

    /// Log messages replayed to late subscribers, per run
    #[arg(long, env = "SHIPYARD_LOG_HISTORY", default_value_t = 500)]
    pub log_history: usize,

    /// How long log history outlives a torn-down run
    #[arg(long, env = "SHIPYARD_LOG_RETENTION", default_value = "5m", value_parser = humantime::parse_duration)]
    pub log_retention: Duration,

    #[arg(long, env = "SHIPYARD_MAX_UPLOAD_MB", default_value_t = 100)]
    pub max_upload_mb: usize,

    /// Output logs in JSON format
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_host: "localhost".to_string(),
            log_port: 8080,
            workspace_root: PathBuf::from("./workspace"),
            template_dir: None,
            container_runtime: "docker".to_string(),
            image_prefix: "shipyard".to_string(),
            default_container_port: 3000,
            memory_limit_mb: 512,
            cpu_quota: 50000,
            stop_timeout: Duration::from_secs(5),
            log_history: 500,
            log_retention: Duration::from_secs(300),
            max_upload_mb: 100,
            log_json: false,
        }
    }
}

impl Config {
    /// Parse configuration from command-line args and environment variables
    pub fn parse_config() -> Self {
        Config::parse()
    }

    pub fn image_tag(&self, run_id: &str) -> String {
        format!("{}:{}", self.image_prefix, run_id)
    }

    pub fn log_channel_url(&self, run_id: &str) -> String {
        format!(
            "http://{}:{}/runs/{}/logs",
            self.public_host, self.log_port, run_id
        )
    }

    pub fn service_url(&self, host_port: u16) -> String {
        format!("http://{}:{}/", self.public_host, host_port)
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_mb: Some(self.memory_limit_mb).filter(|mb| *mb > 0),
            cpu_quota: Some(self.cpu_quota).filter(|quota| *quota > 0),
        }
    }

    pub fn template_source(&self) -> TemplateSource {
        match &self.template_dir {
            Some(dir) => TemplateSource::Directory(dir.clone()),
            None => TemplateSource::Builtin,
        }
    }

    pub fn runtime_kind(&self) -> RuntimeKind {
        RuntimeKind::from_setting(&self.container_runtime)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_match_documented_values() {
        let config = Config::try_parse_from(["shipyard-runtime"]).unwrap();
        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.public_host, "localhost");
        assert_eq!(config.stop_timeout, Duration::from_secs(5));
        assert_eq!(config.log_retention, Duration::from_secs(300));
        assert_eq!(config.default_container_port, 3000);
        assert_eq!(config.runtime_kind(), RuntimeKind::Binary("docker".to_string()));
    }

    #[test]
    #[serial]
    fn environment_overrides_defaults() {
        std::env::set_var("RUNNER_HOST", "runner.internal");
        std::env::set_var("WS_PORT", "3001");
        std::env::set_var("SHIPYARD_STOP_TIMEOUT", "1500ms");
        let parsed = Config::try_parse_from(["shipyard-runtime"]);
        std::env::remove_var("RUNNER_HOST");
        std::env::remove_var("WS_PORT");
        std::env::remove_var("SHIPYARD_STOP_TIMEOUT");

        let config = parsed.unwrap();
        assert_eq!(config.public_host, "runner.internal");
        assert_eq!(config.stop_timeout, Duration::from_millis(1500));
        assert_eq!(
            config.log_channel_url("abc"),
            "http://runner.internal:3001/runs/abc/logs"
        );
    }

    #[test]
    fn urls_and_tags_are_composed_from_settings() {
        let config = Config::default();
        assert_eq!(config.image_tag("abc"), "shipyard:abc");
        assert_eq!(config.service_url(49152), "http://localhost:49152/");
        assert_eq!(
            config.resource_limits(),
            ResourceLimits {
                memory_mb: Some(512),
                cpu_quota: Some(50000)
            }
        );
    }
}
