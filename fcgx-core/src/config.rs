use crate::env_filter::EnvFilterPolicy;
use crate::envsubst::expand_env;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// HTTP listen address of the front end.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Root directory scripts and static files are resolved against.
    pub document_root: PathBuf,

    /// Files with this extension are executed by the worker; anything else
    /// is served as a static file.
    #[serde(default = "default_script_extension")]
    pub script_extension: String,

    #[serde(default)]
    pub env_filter: EnvFilterPolicy,

    /// Fallback log directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub worker: WorkerConfig,
}

/// How the FastCGI worker process is launched.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Worker executable, looked up on `PATH` when relative.
    #[serde(default = "default_worker_script")]
    pub script: PathBuf,

    /// Passed as `-c <ini>`.
    #[serde(default)]
    pub ini: Option<PathBuf>,

    /// Each entry is passed as `-d name=value`.
    #[serde(default)]
    pub options: BTreeMap<String, String>,

    /// Fixed port. When unset, the first free port from
    /// `port_search_start` is used.
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_port_search_start")]
    pub port_search_start: u16,

    /// Bind attempts before giving up on the port search.
    #[serde(default = "default_port_search_limit")]
    pub port_search_limit: u32,

    #[serde(default)]
    pub readiness: ReadinessMode,

    /// Grace period after launch in `delay` mode.
    #[serde(default = "default_readiness_delay_ms")]
    pub readiness_delay_ms: u64,

    /// Upper bound on probing in `probe` mode.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

/// How the supervisor decides a freshly launched worker is usable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessMode {
    /// Sleep for `readiness_delay_ms`.
    #[default]
    Delay,
    /// Poll with GetValues until the worker answers.
    Probe,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_script_extension() -> String {
    "php".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_worker_script() -> PathBuf {
    PathBuf::from("php-cgi")
}

fn default_port_search_start() -> u16 {
    10000
}

fn default_port_search_limit() -> u32 {
    1000
}

fn default_readiness_delay_ms() -> u64 {
    100
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            script: default_worker_script(),
            ini: None,
            options: BTreeMap::new(),
            port: None,
            port_search_start: default_port_search_start(),
            port_search_limit: default_port_search_limit(),
            readiness: ReadinessMode::default(),
            readiness_delay_ms: default_readiness_delay_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn readiness_delay(&self) -> Duration {
        Duration::from_millis(self.readiness_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.script.as_os_str().is_empty() {
            return Err(anyhow!("worker.script must not be empty"));
        }
        if self.port == Some(0) {
            return Err(anyhow!("worker.port must be >= 1"));
        }
        if self.port_search_limit == 0 {
            return Err(anyhow!("worker.port_search_limit must be >= 1"));
        }
        if self.readiness == ReadinessMode::Probe && self.probe_timeout_ms == 0 {
            return Err(anyhow!("worker.probe_timeout_ms must be >= 1 in probe mode"));
        }
        for name in self.options.keys() {
            if name.is_empty() || name.contains('=') {
                return Err(anyhow!("invalid worker option name '{}'", name));
            }
        }
        Ok(())
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        self.listen
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid listen address '{}': {}", self.listen, e))?;
        if self.document_root.as_os_str().is_empty() {
            return Err(anyhow!("document_root must not be empty"));
        }
        let ext = self.script_extension.trim_start_matches('.');
        if ext.is_empty() || ext.contains('/') {
            return Err(anyhow!(
                "invalid script_extension '{}'",
                self.script_extension
            ));
        }
        self.worker.validate()
    }

    /// Script extension without a leading dot.
    pub fn script_extension(&self) -> &str {
        self.script_extension.trim_start_matches('.')
    }
}

pub fn parse_config(content: &str) -> Result<BridgeConfig> {
    let expanded = expand_env(content)?;
    let config: BridgeConfig = serde_yaml::from_str(&expanded)?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<BridgeConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("config not found: {}", path.display()))?;
    parse_config(&content).with_context(|| format!("invalid config: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_tmp_dir() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("fcgx-config-test-{}", nanos))
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = parse_config("document_root: /srv/www\n").expect("parse");
        assert_eq!(cfg.listen, "127.0.0.1:8080");
        assert_eq!(cfg.script_extension(), "php");
        assert_eq!(cfg.env_filter, EnvFilterPolicy::Lenient);
        assert_eq!(cfg.worker.script, PathBuf::from("php-cgi"));
        assert_eq!(cfg.worker.port, None);
        assert_eq!(cfg.worker.port_search_start, 10000);
        assert_eq!(cfg.worker.readiness, ReadinessMode::Delay);
        assert_eq!(cfg.worker.readiness_delay(), Duration::from_millis(100));
    }

    #[test]
    fn full_worker_section() {
        let cfg = parse_config(
            r#"
listen: "127.0.0.1:18080"
document_root: /srv/app
script_extension: ".php"
env_filter: strict
worker:
  script: /usr/bin/php-cgi
  ini: /etc/php.ini
  port: 9123
  readiness: probe
  probe_timeout_ms: 250
  options:
    memory_limit: "64M"
    display_errors: "Off"
"#,
        )
        .expect("parse");
        assert_eq!(cfg.env_filter, EnvFilterPolicy::Strict);
        assert_eq!(cfg.script_extension(), "php");
        assert_eq!(cfg.worker.port, Some(9123));
        assert_eq!(cfg.worker.ini.as_deref(), Some(Path::new("/etc/php.ini")));
        assert_eq!(cfg.worker.readiness, ReadinessMode::Probe);
        let names: Vec<_> = cfg.worker.options.keys().map(String::as_str).collect();
        assert_eq!(names, ["display_errors", "memory_limit"]);
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = parse_config("document_root: /a\nworkers: 4\n").unwrap_err();
        assert!(err.to_string().contains("unknown field"), "{err}");
    }

    #[test]
    fn rejects_zero_port_search_limit() {
        let err =
            parse_config("document_root: /a\nworker:\n  port_search_limit: 0\n").unwrap_err();
        assert!(err.to_string().contains("port_search_limit"), "{err}");
    }

    #[test]
    fn rejects_bad_option_names() {
        let err = parse_config("document_root: /a\nworker:\n  options:\n    \"a=b\": \"1\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("option"), "{err}");
    }

    #[test]
    fn rejects_bad_listen_address() {
        assert!(parse_config("document_root: /a\nlisten: nowhere\n").is_err());
    }

    #[test]
    fn load_config_expands_defaults_from_env_syntax() {
        let dir = unique_tmp_dir();
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("fcgx.yaml");
        std::fs::write(
            &path,
            "document_root: \"${FCGX_TEST_UNSET_ROOT:-/srv/fallback}\"\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        std::fs::remove_dir_all(&dir).ok();
        assert_eq!(cfg.document_root, PathBuf::from("/srv/fallback"));
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/fcgx.yaml")).unwrap_err();
        assert!(err.to_string().contains("config not found"));
    }
}
