use crate::config::default_config_toml;
use anyhow::{Context, Result, bail};
use std::path::Path;

pub fn write_default_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists, not overwriting it", path.display());
    }
    std::fs::write(path, default_config_toml())
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
