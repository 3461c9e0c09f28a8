// Identity store migrations

use rusqlite::{Connection, Result};

pub fn run_migrations(conn: &Connection) -> Result<()> {
    // Real-name mappings, unique per (scope, normalized name pair).
    // Pseudonym ids are only unique within a scope.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS identities (
            scope_id      TEXT NOT NULL,
            pseudonym_id  TEXT NOT NULL,
            seq           INTEGER NOT NULL,
            given_name    TEXT NOT NULL,
            family_name   TEXT NOT NULL,
            given_norm    TEXT NOT NULL,
            family_norm   TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            PRIMARY KEY (scope_id, pseudonym_id),
            UNIQUE (scope_id, given_norm, family_norm)
        )",
        [],
    )?;

    // Per-scope sequence counters. Rows survive identity purges so a
    // sequence number is never reassigned within a scope's lifetime.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS scope_sequences (
            scope_id  TEXT PRIMARY KEY,
            next_seq  INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_identities_created_at
         ON identities (created_at)",
        [],
    )?;

    Ok(())
}
