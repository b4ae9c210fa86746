//! Resolved configuration view — `agentboard config`.

use anyhow::{Context, Result};

use agentboard::board::models::builtin_agent_mappings;
use agentboard::config::AppConfig;

pub fn cmd_config(config: &AppConfig) -> Result<()> {
    let mut shown = config.redacted();
    let builtin = shown.workflow.agent_mappings.is_none();
    if builtin {
        shown.workflow.agent_mappings = Some(builtin_agent_mappings());
    }
    let rendered = toml::to_string_pretty(&shown).context("Failed to render configuration")?;

    println!("# Resolved agentboard configuration (secrets masked)");
    if builtin {
        println!("# workflow.agent_mappings shows the built-in defaults");
    }
    println!();
    print!("{}", rendered);
    Ok(())
}
