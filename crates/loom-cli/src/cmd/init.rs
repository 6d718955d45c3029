use anyhow::Context;
use loom_core::{config::Config, io, paths};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing loom in: {}", root.display());

    for dir in [paths::LOOM_DIR, paths::CEREMONIES_DIR] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    let created = Config::default()
        .save_if_missing(root)
        .context("failed to write config.yaml")?;
    if created {
        println!("  created: {}", paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }

    println!("\nNext: set 'work' (and 'decomposer') in {}, then 'loom begin'.", paths::CONFIG_FILE);
    Ok(())
}
