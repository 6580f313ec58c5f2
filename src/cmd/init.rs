//! Project initialization (`harbor init`).

use std::path::Path;

use anyhow::{Context, Result};

use harbor::config::{CONFIG_DIR, HarborConfig, config_path, default_config_toml};
use harbor::sessions::db::SessionDb;

pub fn cmd_init(project_dir: &Path, force: bool) -> Result<()> {
    let harbor_dir = project_dir.join(CONFIG_DIR);
    std::fs::create_dir_all(&harbor_dir)
        .with_context(|| format!("Failed to create {}", harbor_dir.display()))?;

    let path = config_path(project_dir);
    if path.exists() && !force {
        println!("Config already exists at {} (use --force to overwrite)", path.display());
    } else {
        std::fs::write(&path, default_config_toml())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote {}", path.display());
    }

    let config = HarborConfig::load(project_dir)?;
    let db_path = project_dir.join(&config.server.db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    SessionDb::new(&db_path)
        .with_context(|| format!("Failed to initialize database at {}", db_path.display()))?;
    println!("Session database initialized at {}", db_path.display());
    println!();
    println!("Next: run `harbor serve` to start the server");
    Ok(())
}
