//! Effective configuration view (`harbor config`).

use std::path::Path;

use anyhow::Result;

use harbor::config::{HarborConfig, config_path};

pub fn cmd_config(project_dir: &Path) -> Result<()> {
    let path = config_path(project_dir);
    let config = HarborConfig::load(project_dir)?;

    if path.exists() {
        println!("# Config file: {}", path.display());
    } else {
        println!("# No harbor.toml at {}; using defaults", path.display());
    }
    if config.github_token.is_some() {
        println!("# GITHUB_TOKEN is set and will be passed to sandboxes as GH_TOKEN");
    }
    println!();
    print!("{}", config.to_toml()?);
    Ok(())
}
