//! Session server command (`harbor serve`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use harbor::config::HarborConfig;
use harbor::sessions::backend::{DockerDriver, Drivers, KubernetesDriver, MockDriver};
use harbor::sessions::models::BackendKind;
use harbor::sessions::server;

use crate::BackendChoice;

pub struct ServeArgs {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub db_path: Option<PathBuf>,
    pub dev: bool,
    pub backends: Vec<BackendChoice>,
}

pub async fn cmd_serve(project_dir: &Path, args: ServeArgs) -> Result<()> {
    let config = HarborConfig::load(project_dir)?;

    let mut server_config = config.server_config();
    if let Some(port) = args.port {
        server_config.port = port;
    }
    if args.host.is_some() {
        server_config.host = args.host;
    }
    if let Some(db_path) = args.db_path {
        server_config.db_path = db_path;
    }
    if args.dev {
        server_config.dev_mode = true;
    }
    if server_config.db_path.is_relative() {
        server_config.db_path = project_dir.join(&server_config.db_path);
    }

    let choices = if args.backends.is_empty() {
        configured_backends(&config)
    } else {
        args.backends
    };
    let drivers = build_drivers(&config, &choices).await?;

    server::start_server(server_config, drivers, config.manager_settings()).await
}

fn configured_backends(config: &HarborConfig) -> Vec<BackendChoice> {
    let mut choices = Vec::new();
    if config.docker.enabled {
        choices.push(BackendChoice::Docker);
    }
    if config.kubernetes.enabled {
        choices.push(BackendChoice::Kubernetes);
    }
    choices
}

async fn build_drivers(config: &HarborConfig, choices: &[BackendChoice]) -> Result<Drivers> {
    let mut drivers = Drivers::new();
    for choice in choices {
        match choice {
            BackendChoice::Docker => {
                let driver = DockerDriver::connect()?;
                if !driver.ping().await {
                    tracing::warn!("Docker engine is not answering; local_container sessions will fail until it is");
                }
                drivers.insert(Arc::new(driver));
            }
            BackendChoice::Kubernetes => {
                let driver = KubernetesDriver::connect(&config.kubernetes.namespace)
                    .await
                    .with_context(|| {
                        format!("Kubernetes backend (namespace {})", config.kubernetes.namespace)
                    })?;
                drivers.insert(Arc::new(driver));
            }
            BackendChoice::Mock => {
                tracing::warn!("using in-process mock sandboxes; nothing real will run");
                // Mocks fill in for whichever real backends were not chosen.
                if !choices.contains(&BackendChoice::Docker) {
                    drivers.insert(Arc::new(MockDriver::with_kind(BackendKind::LocalContainer)));
                }
                if !choices.contains(&BackendChoice::Kubernetes) {
                    drivers.insert(Arc::new(MockDriver::with_kind(BackendKind::ClusterPod)));
                }
            }
        }
    }
    Ok(drivers)
}
