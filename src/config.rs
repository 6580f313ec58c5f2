//! Harbor configuration, read from `.harbor/harbor.toml`.
//!
//! Layering is file → environment → CLI. Every field is optional in the
//! file; missing sections fall back to the defaults below.
//!
//! ```toml
//! [server]
//! port = 3141
//! host = "0.0.0.0"
//! db_path = ".harbor/harbor.db"
//! dev_mode = false
//!
//! [docker]
//! enabled = true
//! default_image = "ghcr.io/harbor/agent:latest"
//! memory = "4g"
//! cpus = 2.0
//!
//! [kubernetes]
//! enabled = false
//! namespace = "harbor"
//! default_image = "ghcr.io/harbor/agent:latest"
//! storage_class = "standard"
//!
//! [sessions]
//! quiet_window_secs = 60
//! provision_timeout_secs = 300
//! provision_retries = 3
//! exec_timeout_secs = 120
//! poll_interval_secs = 30
//! workdir = "/workspace"
//!
//! [git]
//! author_name = "Harbor Agent"
//! author_email = "agent@harbor.local"
//! commit_message = "Changes from harbor session"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sessions::manager::{DEFAULT_IMAGE, ManagerSettings};
use crate::sessions::models::{BackendKind, ResourceLimits};
use crate::sessions::server::ServerConfig;
use crate::sessions::workflow::GitSettings;

pub const CONFIG_DIR: &str = ".harbor";
pub const CONFIG_FILE: &str = "harbor.toml";

/// Path of the config file for a project directory.
pub fn config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Raw TOML structure for `.harbor/harbor.toml`.
#[derive(Debug, Default, Deserialize)]
struct HarborToml {
    server: Option<ServerSection>,
    docker: Option<DockerSection>,
    kubernetes: Option<KubernetesSection>,
    sessions: Option<SessionsSection>,
    git: Option<GitSection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    port: Option<u16>,
    host: Option<String>,
    db_path: Option<PathBuf>,
    dev_mode: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct DockerSection {
    enabled: Option<bool>,
    default_image: Option<String>,
    memory: Option<String>,
    cpus: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct KubernetesSection {
    enabled: Option<bool>,
    namespace: Option<String>,
    default_image: Option<String>,
    storage_class: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionsSection {
    quiet_window_secs: Option<u64>,
    provision_timeout_secs: Option<u64>,
    provision_retries: Option<u32>,
    exec_timeout_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    workdir: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitSection {
    author_name: Option<String>,
    author_email: Option<String>,
    commit_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerSettings {
    pub port: u16,
    pub host: Option<String>,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DockerSettings {
    pub enabled: bool,
    pub default_image: String,
    pub memory: String,
    pub cpus: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KubernetesSettings {
    pub enabled: bool,
    pub namespace: String,
    pub default_image: String,
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSettings {
    pub quiet_window_secs: u64,
    pub provision_timeout_secs: u64,
    pub provision_retries: u32,
    pub exec_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub workdir: String,
}

/// Effective configuration after file and environment layering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarborConfig {
    pub server: ServerSettings,
    pub docker: DockerSettings,
    pub kubernetes: KubernetesSettings,
    pub sessions: SessionSettings,
    pub git: GitSettings,
    /// Token forwarded into sandboxes as `GH_TOKEN`. Never serialized.
    #[serde(skip)]
    pub github_token: Option<String>,
}

impl Default for HarborConfig {
    fn default() -> Self {
        let server = ServerConfig::default();
        let manager = ManagerSettings::default();
        let resources = ResourceLimits::default();
        Self {
            server: ServerSettings {
                port: server.port,
                host: server.host,
                db_path: server.db_path,
                dev_mode: server.dev_mode,
            },
            docker: DockerSettings {
                enabled: true,
                default_image: DEFAULT_IMAGE.to_string(),
                memory: resources.memory,
                cpus: resources.cpus,
            },
            kubernetes: KubernetesSettings {
                enabled: false,
                namespace: "harbor".to_string(),
                default_image: DEFAULT_IMAGE.to_string(),
                storage_class: None,
            },
            sessions: SessionSettings {
                quiet_window_secs: manager.quiet_window.as_secs(),
                provision_timeout_secs: manager.provision_timeout.as_secs(),
                provision_retries: manager.retry.retries,
                exec_timeout_secs: manager.exec_timeout.as_secs(),
                poll_interval_secs: manager.poll_interval.as_secs(),
                workdir: manager.workdir,
            },
            git: GitSettings::default(),
            github_token: None,
        }
    }
}

impl HarborConfig {
    /// Load `.harbor/harbor.toml` from the project directory and apply
    /// environment overrides. Returns defaults if the file doesn't exist.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut config = Self::load_file(project_dir)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// File layer only.
    pub fn load_file(project_dir: &Path) -> Result<Self> {
        let path = config_path(project_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let toml: HarborToml = toml::from_str(content)?;
        let mut config = Self::default();

        if let Some(section) = toml.server {
            if let Some(port) = section.port {
                config.server.port = port;
            }
            if section.host.is_some() {
                config.server.host = section.host;
            }
            if let Some(db_path) = section.db_path {
                config.server.db_path = db_path;
            }
            if let Some(dev_mode) = section.dev_mode {
                config.server.dev_mode = dev_mode;
            }
        }

        if let Some(section) = toml.docker {
            if let Some(enabled) = section.enabled {
                config.docker.enabled = enabled;
            }
            if let Some(image) = section.default_image {
                config.docker.default_image = image;
            }
            if let Some(memory) = section.memory {
                config.docker.memory = memory;
            }
            if let Some(cpus) = section.cpus {
                config.docker.cpus = cpus;
            }
        }

        if let Some(section) = toml.kubernetes {
            if let Some(enabled) = section.enabled {
                config.kubernetes.enabled = enabled;
            }
            if let Some(namespace) = section.namespace {
                config.kubernetes.namespace = namespace;
            }
            if let Some(image) = section.default_image {
                config.kubernetes.default_image = image;
            }
            if section.storage_class.is_some() {
                config.kubernetes.storage_class = section.storage_class;
            }
        }

        if let Some(section) = toml.sessions {
            let s = &mut config.sessions;
            if let Some(v) = section.quiet_window_secs {
                s.quiet_window_secs = v;
            }
            if let Some(v) = section.provision_timeout_secs {
                s.provision_timeout_secs = v;
            }
            if let Some(v) = section.provision_retries {
                s.provision_retries = v;
            }
            if let Some(v) = section.exec_timeout_secs {
                s.exec_timeout_secs = v;
            }
            if let Some(v) = section.poll_interval_secs {
                s.poll_interval_secs = v;
            }
            if let Some(v) = section.workdir {
                s.workdir = v;
            }
        }

        if let Some(section) = toml.git {
            if let Some(name) = section.author_name {
                config.git.author_name = name;
            }
            if let Some(email) = section.author_email {
                config.git.author_email = email;
            }
            if let Some(message) = section.commit_message {
                config.git.commit_message = message;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Environment layer. `lookup` is `std::env::var` outside tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup("HARBOR_PORT").filter(|v| !v.is_empty()) {
            self.server.port = port
                .parse()
                .with_context(|| format!("HARBOR_PORT is not a valid port: {}", port))?;
        }
        if let Some(db_path) = lookup("HARBOR_DB_PATH").filter(|v| !v.is_empty()) {
            self.server.db_path = PathBuf::from(db_path);
        }
        if let Some(token) = lookup("GITHUB_TOKEN").filter(|v| !v.is_empty()) {
            self.github_token = Some(token);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.docker.cpus <= 0.0 {
            anyhow::bail!("[docker] cpus must be positive, got {}", self.docker.cpus);
        }
        if self.sessions.poll_interval_secs == 0 {
            anyhow::bail!("[sessions] poll_interval_secs must be at least 1");
        }
        if self.sessions.quiet_window_secs == 0 {
            anyhow::bail!("[sessions] quiet_window_secs must be at least 1");
        }
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.server.port,
            host: self.server.host.clone(),
            db_path: self.server.db_path.clone(),
            dev_mode: self.server.dev_mode,
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        let mut settings = ManagerSettings::default();
        let s = &self.sessions;
        settings.quiet_window = Duration::from_secs(s.quiet_window_secs);
        settings.provision_timeout = Duration::from_secs(s.provision_timeout_secs);
        settings.retry.retries = s.provision_retries;
        settings.exec_timeout = Duration::from_secs(s.exec_timeout_secs);
        settings.poll_interval = Duration::from_secs(s.poll_interval_secs);
        settings.workdir = s.workdir.clone();
        settings
            .images
            .insert(BackendKind::LocalContainer, self.docker.default_image.clone());
        settings
            .images
            .insert(BackendKind::ClusterPod, self.kubernetes.default_image.clone());
        settings.resources = ResourceLimits {
            cpus: self.docker.cpus,
            memory: self.docker.memory.clone(),
        };
        settings.storage_class = self.kubernetes.storage_class.clone();
        settings.git = self.git.clone();
        if let Some(token) = &self.github_token {
            settings
                .sandbox_env
                .push(("GH_TOKEN".to_string(), token.clone()));
        }
        settings
    }

    /// Render as TOML, the shape `harbor config` prints.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }
}

/// Starter config written by `harbor init`.
pub fn default_config_toml() -> String {
    format!(
        r#"# Harbor configuration

[server]
port = 3141
db_path = ".harbor/harbor.db"

[docker]
enabled = true
default_image = "{image}"
memory = "4g"
cpus = 2.0

[kubernetes]
enabled = false
namespace = "harbor"
default_image = "{image}"

[sessions]
quiet_window_secs = 60
poll_interval_secs = 30
"#,
        image = DEFAULT_IMAGE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = HarborConfig::default();
        assert_eq!(config.server.port, 3141);
        assert_eq!(config.server.db_path, PathBuf::from(".harbor/harbor.db"));
        assert!(config.docker.enabled);
        assert!(!config.kubernetes.enabled);
        assert_eq!(config.docker.default_image, DEFAULT_IMAGE);
        assert_eq!(config.docker.memory, "4g");
        assert_eq!(config.docker.cpus, 2.0);
        assert_eq!(config.sessions.quiet_window_secs, 60);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarborConfig::load_file(dir.path()).unwrap();
        assert_eq!(config, HarborConfig::default());
    }

    #[test]
    fn test_load_full() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        fs::write(
            config_path(dir.path()),
            r#"
[server]
port = 8080
host = "0.0.0.0"
db_path = "/var/lib/harbor/harbor.db"
dev_mode = true

[docker]
enabled = false
default_image = "agent:dev"
memory = "8g"
cpus = 4.0

[kubernetes]
enabled = true
namespace = "agents"
default_image = "registry.local/agent:1"
storage_class = "fast-ssd"

[sessions]
quiet_window_secs = 15
provision_timeout_secs = 60
provision_retries = 1
exec_timeout_secs = 30
poll_interval_secs = 10
workdir = "/src"

[git]
author_name = "Bot"
author_email = "bot@example.com"
commit_message = "bot changes"
"#,
        )
        .unwrap();

        let config = HarborConfig::load_file(dir.path()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host.as_deref(), Some("0.0.0.0"));
        assert!(config.server.dev_mode);
        assert!(!config.docker.enabled);
        assert_eq!(config.docker.cpus, 4.0);
        assert!(config.kubernetes.enabled);
        assert_eq!(config.kubernetes.namespace, "agents");
        assert_eq!(config.kubernetes.storage_class.as_deref(), Some("fast-ssd"));
        assert_eq!(config.sessions.workdir, "/src");
        assert_eq!(config.git.author_name, "Bot");

        let settings = config.manager_settings();
        assert_eq!(settings.quiet_window, Duration::from_secs(15));
        assert_eq!(settings.retry.retries, 1);
        assert_eq!(settings.default_image(BackendKind::LocalContainer), "agent:dev");
        assert_eq!(
            settings.default_image(BackendKind::ClusterPod),
            "registry.local/agent:1"
        );
        assert_eq!(settings.resources.memory, "8g");
        assert_eq!(settings.storage_class.as_deref(), Some("fast-ssd"));
        assert_eq!(settings.git.commit_message, "bot changes");

        let server = config.server_config();
        assert_eq!(server.bind_host(), "0.0.0.0");
        assert_eq!(server.db_path, PathBuf::from("/var/lib/harbor/harbor.db"));
    }

    #[test]
    fn test_load_partial() {
        let config = HarborConfig::parse("[docker]\nmemory = \"2g\"\n").unwrap();
        assert_eq!(config.docker.memory, "2g");
        assert_eq!(config.docker.cpus, 2.0);
        assert_eq!(config.server.port, 3141);
    }

    #[test]
    fn test_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        fs::write(config_path(dir.path()), "not valid toml {{{{").unwrap();
        assert!(HarborConfig::load_file(dir.path()).is_err());
    }

    #[test]
    fn test_rejects_nonpositive_cpus() {
        assert!(HarborConfig::parse("[docker]\ncpus = 0.0\n").is_err());
        assert!(HarborConfig::parse("[sessions]\npoll_interval_secs = 0\n").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = HarborConfig::default();
        config
            .apply_env(env(&[
                ("HARBOR_PORT", "9000"),
                ("HARBOR_DB_PATH", "/tmp/h.db"),
                ("GITHUB_TOKEN", "ghp_abc"),
            ]))
            .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.db_path, PathBuf::from("/tmp/h.db"));

        let settings = config.manager_settings();
        assert_eq!(
            settings.sandbox_env,
            vec![("GH_TOKEN".to_string(), "ghp_abc".to_string())]
        );
    }

    #[test]
    fn test_env_bad_port() {
        let mut config = HarborConfig::default();
        assert!(config.apply_env(env(&[("HARBOR_PORT", "nope")])).is_err());
        // Empty values are ignored
        assert!(config.apply_env(env(&[("HARBOR_PORT", "")])).is_ok());
        assert_eq!(config.server.port, 3141);
    }

    #[test]
    fn test_token_not_rendered() {
        let mut config = HarborConfig::default();
        config.github_token = Some("secret".into());
        let rendered = config.to_toml().unwrap();
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("[server]"));
        assert!(rendered.contains("port = 3141"));
    }

    #[test]
    fn test_default_config_toml_parses() {
        let config = HarborConfig::parse(&default_config_toml()).unwrap();
        assert_eq!(config, HarborConfig::default());
    }
}
