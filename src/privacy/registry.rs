// Identity registry: stable pseudonym assignment per (name, scope).
//
// Uniqueness across concurrent first registrations is guaranteed at the
// storage boundary (UNIQUE constraint) rather than by the process lock
// alone; on conflict the registry retries its lookup and returns the
// winner's id. Sequence counters survive purges so a pseudonym is never
// reassigned within a scope's all-time history.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::privacy::normalize::normalize_name;
use crate::types::Identity;

/// Prefix of every pseudonym token. Collaborators rendering text to an
/// external boundary must not produce colliding token shapes.
pub const PSEUDONYM_PREFIX: &str = "PERSON_";

/// Pattern matching any pseudonym token in free text.
pub const PSEUDONYM_TOKEN_PATTERN: &str = r"PERSON_[0-9]+";

pub fn format_pseudonym(seq: i64) -> String {
    format!("{PSEUDONYM_PREFIX}{seq:03}")
}

#[derive(Clone)]
pub struct IdentityRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl IdentityRegistry {
    /// Open the registry and eagerly purge identities older than the
    /// retention window, before any other operation is accepted.
    pub fn open(db: &Database, retention_days: i64) -> Result<Self> {
        let registry = IdentityRegistry {
            conn: db.connection(),
        };
        let purged = registry.purge_expired(retention_days)?;
        if purged > 0 {
            info!(purged, retention_days, "expired identities purged at startup");
        }
        Ok(registry)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Privacy("identity store lock poisoned".to_string()))
    }

    /// Return the existing pseudonym for this name within the scope, or
    /// allocate the next sequence number and persist a new identity.
    pub fn register(&self, scope: &str, given: &str, family: &str) -> Result<String> {
        if family.trim().is_empty() {
            return Err(Error::Privacy(
                "cannot register an identity without a family name".to_string(),
            ));
        }
        let given_norm = normalize_name(given);
        let family_norm = normalize_name(family);

        if let Some(existing) = self.find_by_norm(scope, &given_norm, &family_norm)? {
            debug!(scope, pseudonym = %existing, "existing mapping reused");
            return Ok(existing);
        }

        match self.insert_new(scope, given, family, &given_norm, &family_norm) {
            Ok(pseudonym) => {
                info!(scope, pseudonym = %pseudonym, "new identity registered");
                Ok(pseudonym)
            }
            Err(Error::Storage(err)) if is_unique_violation(&err) => {
                // Lost the race: a concurrent caller registered the same
                // normalized name first. Its id is the one to reuse.
                self.find_by_norm(scope, &given_norm, &family_norm)?
                    .ok_or(Error::Storage(err))
            }
            Err(e) => Err(e),
        }
    }

    fn find_by_norm(
        &self,
        scope: &str,
        given_norm: &str,
        family_norm: &str,
    ) -> Result<Option<String>> {
        let guard = self.lock()?;
        let existing = guard
            .query_row(
                "SELECT pseudonym_id FROM identities
                 WHERE scope_id = ?1 AND given_norm = ?2 AND family_norm = ?3",
                params![scope, given_norm, family_norm],
                |row| row.get(0),
            )
            .optional()?;
        Ok(existing)
    }

    fn insert_new(
        &self,
        scope: &str,
        given: &str,
        family: &str,
        given_norm: &str,
        family_norm: &str,
    ) -> Result<String> {
        let mut guard = self.lock()?;
        let tx = guard.transaction()?;

        let seq: i64 = tx.query_row(
            "INSERT INTO scope_sequences (scope_id, next_seq) VALUES (?1, 1)
             ON CONFLICT(scope_id) DO UPDATE SET next_seq = next_seq + 1
             RETURNING next_seq",
            params![scope],
            |row| row.get(0),
        )?;
        let pseudonym = format_pseudonym(seq);
        let created_at = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT INTO identities
             (scope_id, pseudonym_id, seq, given_name, family_name,
              given_norm, family_norm, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![scope, pseudonym, seq, given, family, given_norm, family_norm, created_at],
        )?;
        tx.commit()?;
        Ok(pseudonym)
    }

    /// Resolve a pseudonym back to its identity. Ids are only unique
    /// within a scope, so resolution is scope-qualified.
    pub fn resolve(&self, scope: &str, pseudonym_id: &str) -> Result<Identity> {
        let guard = self.lock()?;
        guard
            .query_row(
                "SELECT pseudonym_id, scope_id, given_name, family_name,
                        given_norm, family_norm, created_at
                 FROM identities WHERE scope_id = ?1 AND pseudonym_id = ?2",
                params![scope, pseudonym_id],
                row_to_identity,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound {
                scope: scope.to_string(),
                pseudonym_id: pseudonym_id.to_string(),
            })
    }

    /// All identities in a scope, in assignment order.
    pub fn list(&self, scope: &str) -> Result<Vec<Identity>> {
        let guard = self.lock()?;
        let mut stmt = guard.prepare(
            "SELECT pseudonym_id, scope_id, given_name, family_name,
                    given_norm, family_norm, created_at
             FROM identities WHERE scope_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![scope], row_to_identity)?;
        let mut identities = Vec::new();
        for row in rows {
            identities.push(row?);
        }
        Ok(identities)
    }

    /// Delete every identity in the scope. The sequence counter is kept so
    /// later registrations never reuse a previously assigned pseudonym.
    pub fn purge(&self, scope: &str) -> Result<usize> {
        let guard = self.lock()?;
        let deleted = guard.execute(
            "DELETE FROM identities WHERE scope_id = ?1",
            params![scope],
        )?;
        info!(scope, deleted, "scope purged");
        Ok(deleted)
    }

    /// Delete identities older than the retention window.
    pub fn purge_expired(&self, retention_days: i64) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).to_rfc3339();
        let guard = self.lock()?;
        let deleted = guard.execute(
            "DELETE FROM identities WHERE created_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Identity> {
    Ok(Identity {
        pseudonym_id: row.get(0)?,
        scope_id: row.get(1)?,
        given_name: row.get(2)?,
        family_name: row.get(3)?,
        given_norm: row.get(4)?,
        family_norm: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> IdentityRegistry {
        let db = Database::open_in_memory().unwrap();
        IdentityRegistry::open(&db, 30).unwrap()
    }

    #[test]
    fn register_is_idempotent_per_normalized_name() {
        let registry = registry();
        let first = registry.register("ClassA", "Marie", "Dupont").unwrap();
        let again = registry.register("ClassA", "  MARIE ", "dupont").unwrap();
        assert_eq!(first, "PERSON_001");
        assert_eq!(first, again);

        let second = registry.register("ClassA", "Paul", "Martin").unwrap();
        assert_eq!(second, "PERSON_002");
    }

    #[test]
    fn scopes_have_independent_sequences() {
        let registry = registry();
        let a = registry.register("ClassA", "Marie", "Dupont").unwrap();
        let b = registry.register("ClassB", "Jean", "Durand").unwrap();
        assert_eq!(a, "PERSON_001");
        assert_eq!(b, "PERSON_001");
    }

    #[test]
    fn empty_family_name_is_rejected() {
        let registry = registry();
        assert!(registry.register("ClassA", "Marie", "  ").is_err());
    }

    #[test]
    fn resolve_returns_the_real_names() {
        let registry = registry();
        let id = registry.register("ClassA", "Marie", "Dupont").unwrap();
        let identity = registry.resolve("ClassA", &id).unwrap();
        assert_eq!(identity.given_name, "Marie");
        assert_eq!(identity.family_name, "Dupont");

        let missing = registry.resolve("ClassA", "PERSON_999");
        assert!(matches!(missing, Err(Error::NotFound { .. })));
    }

    #[test]
    fn purge_removes_identities_and_keeps_sequence() {
        let registry = registry();
        let id = registry.register("ClassA", "Marie", "Dupont").unwrap();
        registry.register("ClassA", "Paul", "Martin").unwrap();

        let deleted = registry.purge("ClassA").unwrap();
        assert_eq!(deleted, 2);
        assert!(matches!(
            registry.resolve("ClassA", &id),
            Err(Error::NotFound { .. })
        ));

        // A registration after the purge must not reuse PERSON_001.
        let next = registry.register("ClassA", "Lina", "Moreau").unwrap();
        assert_eq!(next, "PERSON_003");
    }

    #[test]
    fn concurrent_first_registrations_yield_one_pseudonym() {
        let registry = registry();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                registry.register("ClassA", "Marie", "Dupont").unwrap()
            }));
        }
        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|id| id == "PERSON_001"));
        assert_eq!(registry.list("ClassA").unwrap().len(), 1);
    }

    #[test]
    fn expired_identities_are_purged_at_open() {
        let db = Database::open_in_memory().unwrap();
        let registry = IdentityRegistry::open(&db, 30).unwrap();
        registry.register("ClassA", "Marie", "Dupont").unwrap();

        // Age the row past the retention window.
        {
            let conn = registry.conn.clone();
            let guard = conn.lock().unwrap();
            guard
                .execute(
                    "UPDATE identities SET created_at = ?1",
                    params![(Utc::now() - chrono::Duration::days(45)).to_rfc3339()],
                )
                .unwrap();
        }

        let reopened = IdentityRegistry::open(&db, 30).unwrap();
        assert!(reopened.list("ClassA").unwrap().is_empty());
    }
}
