//! Project setup — `agentboard init`.

use std::path::Path;

use anyhow::{Context, Result, bail};

use agentboard::board::db::BoardDb;
use agentboard::config::{AppConfig, CONFIG_FILE, config_dir};

/// Write a starter `agentboard.toml` and create the database.
pub fn cmd_init(project_dir: &Path, force: bool) -> Result<()> {
    let dir = config_dir(project_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let config_path = dir.join(CONFIG_FILE);
    if config_path.exists() && !force {
        bail!(
            "{} already exists. Use --force to overwrite it",
            config_path.display()
        );
    }
    let config = AppConfig::default();
    config.save(&config_path)?;
    println!("Wrote {}", config_path.display());

    let db_path = project_dir.join(&config.storage.db_path);
    BoardDb::new(&db_path)
        .with_context(|| format!("Failed to initialize database at {}", db_path.display()))?;
    println!("Database initialized at {}", db_path.display());

    println!();
    println!("Next steps:");
    println!("  1. Set GITHUB_TOKEN (or [github] token) with repo and project scopes");
    println!("  2. Add your project IDs to [workflow] enabled_projects");
    println!("  3. Run `agentboard serve`");
    Ok(())
}
