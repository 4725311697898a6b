//! `turnbus archive` - offload a seq range into the object store.

use anyhow::{Context, Result};
use tracing::info;

use turnbus_daemon::archiver::{run_archive, ArchiveRequest};
use turnbus_daemon::config::Config;
use turnbus_daemon::objectstore::FsObjectStore;
use turnbus_daemon::store::DurableStore;

pub fn run(thread_id: &str, from_seq: i64, to_seq: Option<i64>) -> Result<()> {
    anyhow::ensure!(!thread_id.trim().is_empty(), "thread_id is required");

    let cfg = Config::from_env();
    let store = DurableStore::open(&cfg.store_path)
        .with_context(|| format!("open store at {}", cfg.store_path.display()))?;
    let objects = FsObjectStore::new(&cfg.object_root, &cfg.object_bucket, &cfg.object_prefix)?;
    objects.ensure_bucket()?;

    let outcome = run_archive(
        &store,
        &objects,
        &ArchiveRequest {
            thread_id: thread_id.to_string(),
            from_seq,
            to_seq,
        },
    )?;

    match outcome {
        Some(outcome) => info!(
            archive_id = %outcome.archive_id,
            object_key = %outcome.object_key,
            from_seq = outcome.from_seq,
            to_seq = outcome.to_seq,
            event_count = outcome.event_count,
            "archive complete"
        ),
        None => info!(thread_id, from_seq, "nothing to archive"),
    }
    Ok(())
}
