use crate::codec;
use crate::records::{Identity, IdentityProfile, SignatureRecord};
use chrono::{DateTime, Utc};
use likeness_core::{Candidate, FaceSignature, IdentityId, SignatureId};
use rusqlite::{params, Connection, Row};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS store_meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS identities (
        id      INTEGER PRIMARY KEY AUTOINCREMENT,
        name    TEXT NOT NULL,
        created INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS signatures (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        identity_id   INTEGER NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
        image_ref     TEXT NOT NULL,
        created       INTEGER NOT NULL,
        model_version TEXT,
        dimension     INTEGER NOT NULL,
        vector        BLOB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS signatures_by_identity ON signatures(identity_id);
";

const DIMENSION_KEY: &str = "signature_dim";

const SIGNATURE_COLUMNS: &str =
    "id, identity_id, image_ref, created, model_version, dimension, vector";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create store directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unknown identity {0}")]
    UnknownIdentity(IdentityId),
    #[error("signature dimension mismatch: store holds {expected}-d signatures, got {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Identity and signature persistence over a single SQLite connection.
///
/// The store is bound to one signature dimensionality, recorded on first
/// open; reopening with another dimensionality fails.
pub struct SignatureStore {
    conn: Connection,
    dimension: usize,
}

impl SignatureStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, dimension: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let store = Self::init(Connection::open(path)?, dimension)?;
        tracing::info!(path = %path.display(), dimension, "signature store opened");
        Ok(store)
    }

    /// Private in-memory database.
    pub fn open_in_memory(dimension: usize) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, dimension)
    }

    fn init(conn: Connection, dimension: usize) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;

        conn.execute(
            "INSERT OR IGNORE INTO store_meta (key, value) VALUES (?1, ?2)",
            params![DIMENSION_KEY, dimension.to_string()],
        )?;
        let recorded: String = conn.query_row(
            "SELECT value FROM store_meta WHERE key = ?1",
            [DIMENSION_KEY],
            |row| row.get(0),
        )?;
        let recorded: usize = recorded
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("bad {DIMENSION_KEY} value '{recorded}'")))?;
        if recorded != dimension {
            return Err(StoreError::DimensionMismatch {
                expected: recorded,
                found: dimension,
            });
        }

        Ok(Self { conn, dimension })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    // --- identities ---

    pub fn create_identity(
        &mut self,
        name: &str,
        created: DateTime<Utc>,
    ) -> Result<Identity, StoreError> {
        let millis = created.timestamp_millis();
        self.conn.execute(
            "INSERT INTO identities (name, created) VALUES (?1, ?2)",
            params![name, millis],
        )?;
        let identity = Identity {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
            created: from_millis(millis)?,
        };
        tracing::debug!(identity = identity.id, name, "identity created");
        Ok(identity)
    }

    pub fn get_identity(&self, id: IdentityId) -> Result<Option<Identity>, StoreError> {
        get_identity(&self.conn, id)
    }

    pub fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, created FROM identities ORDER BY id")?;
        let mut rows = stmt.query([])?;
        let mut identities = Vec::new();
        while let Some(row) = rows.next()? {
            identities.push(identity_from_row(row)?);
        }
        Ok(identities)
    }

    /// The identity, then its signatures in a separate query.
    pub fn identity_profile(&self, id: IdentityId) -> Result<Option<IdentityProfile>, StoreError> {
        identity_profile(&self.conn, id)
    }

    /// Delete an identity and every signature it owns in one transaction.
    ///
    /// Returns the deleted profile, or `None` if the identity did not exist.
    pub fn delete_identity(&mut self, id: IdentityId) -> Result<Option<IdentityProfile>, StoreError> {
        let tx = self.conn.transaction()?;
        let Some(profile) = identity_profile(&tx, id)? else {
            return Ok(None);
        };
        let removed = tx.execute("DELETE FROM signatures WHERE identity_id = ?1", [id])?;
        tx.execute("DELETE FROM identities WHERE id = ?1", [id])?;
        tx.commit()?;
        tracing::info!(identity = id, signatures = removed, "identity deleted");
        Ok(Some(profile))
    }

    // --- signatures ---

    /// Append a signature record for an existing identity.
    pub fn add(
        &mut self,
        identity_id: IdentityId,
        signature: &FaceSignature,
        image_ref: &str,
    ) -> Result<SignatureId, StoreError> {
        if signature.dimension() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                found: signature.dimension(),
            });
        }

        let tx = self.conn.transaction()?;
        if get_identity(&tx, identity_id)?.is_none() {
            return Err(StoreError::UnknownIdentity(identity_id));
        }
        tx.execute(
            "INSERT INTO signatures (identity_id, image_ref, created, model_version, dimension, vector)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                identity_id,
                image_ref,
                Utc::now().timestamp_millis(),
                signature.model_version(),
                signature.dimension() as i64,
                codec::encode(signature.values()),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        tracing::debug!(identity = identity_id, signature = id, image_ref, "signature added");
        Ok(id)
    }

    /// Signature records owned by one identity, oldest first.
    pub fn signatures_for(&self, identity_id: IdentityId) -> Result<Vec<SignatureRecord>, StoreError> {
        signatures_for(&self.conn, identity_id)
    }

    /// Stream every stored signature to `visit`, straight from the cursor.
    ///
    /// Order is unspecified. Returns the number of candidates visited.
    pub fn for_each_candidate<F>(&self, mut visit: F) -> Result<usize, StoreError>
    where
        F: FnMut(Candidate),
    {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {SIGNATURE_COLUMNS} FROM signatures"))?;
        let mut rows = stmt.query([])?;
        let mut visited = 0;
        while let Some(row) = rows.next()? {
            let record = signature_from_row(row)?;
            visit(Candidate {
                identity_id: record.identity_id,
                signature: record.signature,
            });
            visited += 1;
        }
        Ok(visited)
    }

    /// Every stored signature paired with its owner.
    pub fn list_all(&self) -> Result<Vec<Candidate>, StoreError> {
        let mut all = Vec::new();
        self.for_each_candidate(|c| all.push(c))?;
        Ok(all)
    }

    /// Delete all signatures owned by an identity. Idempotent.
    pub fn remove_for_identity(&mut self, identity_id: IdentityId) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute("DELETE FROM signatures WHERE identity_id = ?1", [identity_id])?;
        tx.commit()?;
        tracing::debug!(identity = identity_id, removed, "signatures removed");
        Ok(removed)
    }

    /// Delete one signature record. Returns `false` if it did not exist.
    pub fn remove_signature(&mut self, id: SignatureId) -> Result<bool, StoreError> {
        let removed = self.conn.execute("DELETE FROM signatures WHERE id = ?1", [id])?;
        tracing::debug!(signature = id, removed, "signature removed");
        Ok(removed > 0)
    }

    pub fn signature_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM signatures", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {millis}")))
}

fn identity_from_row(row: &Row<'_>) -> Result<Identity, StoreError> {
    Ok(Identity {
        id: row.get(0)?,
        name: row.get(1)?,
        created: from_millis(row.get(2)?)?,
    })
}

fn signature_from_row(row: &Row<'_>) -> Result<SignatureRecord, StoreError> {
    let id: SignatureId = row.get(0)?;
    let dimension: i64 = row.get(5)?;
    let blob: Vec<u8> = row.get(6)?;
    let values = codec::decode(&blob)
        .filter(|v| v.len() as i64 == dimension)
        .ok_or_else(|| StoreError::Corrupt(format!("signature {id} vector does not match its dimension")))?;

    Ok(SignatureRecord {
        id,
        identity_id: row.get(1)?,
        image_ref: row.get(2)?,
        created: from_millis(row.get(3)?)?,
        signature: FaceSignature::new(values, row.get(4)?),
    })
}

fn get_identity(conn: &Connection, id: IdentityId) -> Result<Option<Identity>, StoreError> {
    let mut stmt = conn.prepare("SELECT id, name, created FROM identities WHERE id = ?1")?;
    let mut rows = stmt.query([id])?;
    match rows.next()? {
        Some(row) => Ok(Some(identity_from_row(row)?)),
        None => Ok(None),
    }
}

fn signatures_for(conn: &Connection, identity_id: IdentityId) -> Result<Vec<SignatureRecord>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SIGNATURE_COLUMNS} FROM signatures WHERE identity_id = ?1 ORDER BY id"
    ))?;
    let mut rows = stmt.query([identity_id])?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(signature_from_row(row)?);
    }
    Ok(records)
}

fn identity_profile(conn: &Connection, id: IdentityId) -> Result<Option<IdentityProfile>, StoreError> {
    let Some(identity) = get_identity(conn, id)? else {
        return Ok(None);
    };
    let signatures = signatures_for(conn, id)?;
    Ok(Some(IdentityProfile {
        identity,
        signatures,
    }))
}

/// Used by tests to assert there are no orphaned rows.
#[cfg(test)]
fn orphan_count(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT COUNT(*) FROM signatures s LEFT JOIN identities i ON i.id = s.identity_id WHERE i.id IS NULL",
        [],
        |row| row.get(0),
    )
    .unwrap()
}
