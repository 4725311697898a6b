//! `turnbus migrate` - apply schema migrations through the ledger.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use turnbus_daemon::config::Config;
use turnbus_daemon::store::{migrations, DurableStore};

pub fn run(extra_dir: Option<&Path>) -> Result<()> {
    let cfg = Config::from_env();
    let store = DurableStore::open(&cfg.store_path)
        .with_context(|| format!("open store at {}", cfg.store_path.display()))?;

    let applied = migrations::apply_embedded(&store)?;
    for version in &applied {
        info!(version, "applied");
    }
    if applied.is_empty() {
        info!("embedded migrations already applied");
    }

    if let Some(dir) = extra_dir {
        apply_directory(&store, dir)?;
    }
    Ok(())
}

/// Applies every `.sql` file under `dir` in sorted filename order, using
/// the file stem as the ledger version. Already-applied versions are
/// skipped.
fn apply_directory(store: &DurableStore, dir: &Path) -> Result<()> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "sql") {
            paths.push(path);
        }
    }
    paths.sort();

    for path in paths {
        let version = path
            .file_stem()
            .and_then(|s| s.to_str())
            .with_context(|| format!("bad migration filename {}", path.display()))?
            .to_string();
        if store.is_migration_applied(&version)? {
            info!(version, "skipped (already applied)");
            continue;
        }
        let sql =
            std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        store.apply_migration(&version, &sql)?;
        info!(version, "applied");
    }
    Ok(())
}
