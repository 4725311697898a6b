//! Embedded schema migrations.
//!
//! Each migration is a versioned SQL script applied at most once through
//! the `schema_migrations` ledger. The body and the ledger insert run in
//! one transaction, so concurrent migrators race safely: the loser's
//! `ON CONFLICT DO NOTHING` ledger insert makes its transaction a no-op
//! against an identical, already-committed schema.

use super::{DurableStore, StoreError};

/// Embedded migrations in apply order. Versions are the file stems and
/// must sort lexicographically.
pub const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_init",
    include_str!("../../migrations/0001_init.sql"),
)];

/// Applies every embedded migration that the ledger does not already
/// record. Returns the versions applied by this call.
pub fn apply_embedded(store: &DurableStore) -> Result<Vec<String>, StoreError> {
    store.ensure_migrations_table()?;
    let mut applied = Vec::new();
    for (version, sql) in MIGRATIONS {
        if store.is_migration_applied(version)? {
            continue;
        }
        store.apply_migration(version, sql)?;
        applied.push((*version).to_string());
    }
    Ok(applied)
}
